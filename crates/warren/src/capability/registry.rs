//! Symlink farm mapping capability ids (or command names) to config files.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use warren_common::{WarrenError, WarrenPaths, WarrenResult};

use super::Capability;

/// One link in a registry directory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RegistryEntry {
    /// Link name (capability id or command name).
    pub id: String,
    /// Raw link target.
    pub target: PathBuf,
    /// Whether the target no longer exists.
    pub dangling: bool,
}

/// A directory of `id -> config file` symlinks.
///
/// The directory is rescanned on every operation; there is no index.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    /// Registry stored in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The capability registry at its standard location.
    #[must_use]
    pub fn capabilities(paths: &WarrenPaths) -> Self {
        Self::new(paths.capability_dir())
    }

    /// The command registry at its standard location.
    #[must_use]
    pub fn commands(paths: &WarrenPaths) -> Self {
        Self::new(paths.command_dir())
    }

    /// Registry directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Link every id in `ids` to `target`.
    ///
    /// Links that already point at `target` are left alone. If any id is
    /// claimed by a different target, nothing is created. Returns the number
    /// of new links.
    pub fn register<S: AsRef<str>>(&self, ids: &[S], target: &Path) -> WarrenResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let target = std::fs::canonicalize(target).map_err(|e| WarrenError::fs(target, e))?;
        std::fs::create_dir_all(&self.dir).map_err(|e| WarrenError::fs(&self.dir, e))?;

        let mut install = Vec::new();
        for id in unique(ids) {
            let link = self.dir.join(id);
            match std::fs::read_link(&link) {
                Ok(existing) if existing == target => {
                    tracing::debug!(id, "Already registered, nothing to do");
                }
                Ok(existing) => {
                    return Err(WarrenError::CapabilityConflict {
                        id: id.to_string(),
                        existing,
                    });
                }
                Err(e) if e.kind() == ErrorKind::NotFound => install.push(link),
                Err(e) => return Err(WarrenError::fs(link, e)),
            }
        }

        for link in &install {
            tracing::debug!(
                link = %link.display(),
                target = %target.display(),
                "Registering"
            );
            std::os::unix::fs::symlink(&target, link).map_err(|e| WarrenError::fs(link, e))?;
        }
        Ok(install.len())
    }

    /// Remove the links in `ids` that point at `target`.
    ///
    /// Missing links and links owned by other targets are skipped. Returns
    /// the number of links removed.
    pub fn unregister<S: AsRef<str>>(&self, ids: &[S], target: &Path) -> WarrenResult<usize> {
        let target = std::fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf());

        let mut remove = Vec::new();
        for id in unique(ids) {
            let link = self.dir.join(id);
            match std::fs::read_link(&link) {
                Ok(existing) if existing == target => remove.push(link),
                Ok(_) => tracing::debug!(id, "Registered to a different file, leaving it"),
                Err(_) => tracing::debug!(id, "Not registered, nothing to remove"),
            }
        }

        for link in &remove {
            tracing::debug!(link = %link.display(), "Unregistering");
            std::fs::remove_file(link).map_err(|e| WarrenError::fs(link, e))?;
        }
        Ok(remove.len())
    }

    /// Find the config file providing the highest version of `requirement`'s
    /// name that is at least `requirement`'s version.
    ///
    /// Dangling links are skipped with a warning.
    pub fn best_match(&self, requirement: &str) -> WarrenResult<Option<PathBuf>> {
        let wanted = Capability::parse(requirement)?;
        let prefix = format!("{}-", wanted.name());

        let mut best: Option<(Capability, PathBuf)> = None;
        for id in self.link_names()? {
            if !id.starts_with(&prefix) {
                continue;
            }
            let Ok(candidate) = Capability::parse(&id) else {
                continue;
            };
            if !candidate.satisfies(&wanted) {
                continue;
            }
            if best
                .as_ref()
                .is_some_and(|(current, _)| !candidate.satisfies(current))
            {
                continue;
            }

            let link = self.dir.join(&id);
            match std::fs::canonicalize(&link) {
                Ok(path) => best = Some((candidate, path)),
                Err(_) => tracing::warn!(link = %link.display(), "Dangling capability link"),
            }
        }

        if let Some((capability, path)) = &best {
            tracing::debug!(
                requirement,
                using = capability.id(),
                path = %path.display(),
                "Resolved capability"
            );
        }
        Ok(best.map(|(_, path)| path))
    }

    /// Resolve the link named exactly `id`.
    pub fn resolve(&self, id: &str) -> WarrenResult<Option<PathBuf>> {
        let link = self.dir.join(id);
        match std::fs::canonicalize(&link) {
            Ok(path) => Ok(Some(path)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if link.symlink_metadata().is_ok() {
                    tracing::warn!(link = %link.display(), "Dangling registry link");
                }
                Ok(None)
            }
            Err(e) => Err(WarrenError::fs(link, e)),
        }
    }

    /// Remove every link whose target no longer exists. Returns how many
    /// were removed.
    pub fn gc(&self) -> WarrenResult<usize> {
        let mut removed = 0;
        let mut first_error = None;

        for id in self.link_names()? {
            let link = self.dir.join(&id);
            if std::fs::metadata(&link).is_ok() {
                continue;
            }

            tracing::info!(id = %id, "Removing stale registry link");
            match std::fs::remove_file(&link) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::error!(link = %link.display(), %e, "Unable to remove stale link");
                    first_error.get_or_insert(WarrenError::fs(link, e));
                }
            }
        }

        first_error.map_or(Ok(removed), Err)
    }

    /// All links, sorted by id.
    pub fn list(&self) -> WarrenResult<Vec<RegistryEntry>> {
        self.link_names()?
            .into_iter()
            .map(|id| {
                let link = self.dir.join(&id);
                let target = std::fs::read_link(&link).map_err(|e| WarrenError::fs(&link, e))?;
                let dangling = std::fs::metadata(&link).is_err();
                Ok(RegistryEntry {
                    id,
                    target,
                    dangling,
                })
            })
            .collect()
    }

    /// Entry names in the registry directory, sorted, hidden files skipped.
    /// A missing directory is an empty registry.
    fn link_names(&self) -> WarrenResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WarrenError::fs(&self.dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| WarrenError::fs(&self.dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn unique<S: AsRef<str>>(ids: &[S]) -> BTreeSet<&str> {
    ids.iter().map(AsRef::as_ref).collect()
}

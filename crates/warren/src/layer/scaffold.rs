//! Source/destination prefixes for directive paths.

use std::path::{Path, PathBuf};

use warren_common::{WarrenError, WarrenResult};

use crate::filesystem::util;

/// Translates a directive's logical path into the layer source and the
/// environment destination.
///
/// Either side may be absent. A missing source means directive paths are
/// taken literally (image based root), a missing destination means the host
/// root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scaffold {
    source_dir: Option<PathBuf>,
    dest_dir: Option<PathBuf>,
}

/// One glob match, on both sides of the scaffold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    /// The path as it appears inside the environment.
    pub logical: PathBuf,
    /// Where the content comes from.
    pub source: PathBuf,
    /// Where it is mounted.
    pub dest: PathBuf,
}

impl Scaffold {
    /// Create a scaffold.
    pub fn new(source_dir: Option<PathBuf>, dest_dir: Option<PathBuf>) -> Self {
        Self {
            source_dir,
            dest_dir,
        }
    }

    /// Layer source root, if any.
    #[must_use]
    pub fn source_dir(&self) -> Option<&Path> {
        self.source_dir.as_deref()
    }

    /// Destination root, if any.
    #[must_use]
    pub fn dest_dir(&self) -> Option<&Path> {
        self.dest_dir.as_deref()
    }

    /// `path` below the source root.
    #[must_use]
    pub fn source_path(&self, path: &Path) -> PathBuf {
        insert_prefix(self.source_dir.as_deref(), path)
    }

    /// Undo [`Scaffold::source_path`]. `None` if `path` is not below the
    /// source root or is the source root itself.
    #[must_use]
    pub fn source_path_inverse(&self, path: &Path) -> Option<PathBuf> {
        match &self.source_dir {
            None => Some(path.to_path_buf()),
            Some(prefix) => util::strip_path_prefix(path, prefix)
                .filter(|stripped| stripped.as_path() != Path::new("/")),
        }
    }

    /// `path` below the destination root.
    #[must_use]
    pub fn dest_path(&self, path: &Path) -> PathBuf {
        insert_prefix(self.dest_dir.as_deref(), path)
    }

    /// Expand a directive path against the source side.
    ///
    /// A path without glob metacharacters is returned as is, whether or not
    /// it exists. A pattern that matches nothing is an error.
    pub fn expand(&self, path: &Path) -> WarrenResult<Vec<Expansion>> {
        let pattern = self.source_path(path);
        let pattern_str = pattern.to_str().ok_or_else(|| WarrenError::Internal {
            message: format!("cannot expand non-UTF-8 path {}", pattern.display()),
        })?;

        let sources = if has_magic(pattern_str) {
            let matches = glob::glob(pattern_str)
                .map_err(|e| WarrenError::Internal {
                    message: format!("bad pattern {pattern_str}: {e}"),
                })?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    let path = e.path().to_path_buf();
                    WarrenError::fs(path, e.into_error())
                })?;
            if matches.is_empty() {
                return Err(WarrenError::fs(
                    pattern,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "pattern matches nothing"),
                ));
            }
            matches
        } else {
            vec![pattern]
        };

        sources
            .into_iter()
            .map(|source| {
                let logical = self.source_path_inverse(&source).ok_or_else(|| {
                    WarrenError::Internal {
                        message: format!(
                            "expansion of {} returned {}",
                            path.display(),
                            source.display()
                        ),
                    }
                })?;
                let dest = self.dest_path(&logical);
                Ok(Expansion {
                    logical,
                    source,
                    dest,
                })
            })
            .collect()
    }
}

fn insert_prefix(prefix: Option<&Path>, path: &Path) -> PathBuf {
    match prefix {
        None => path.to_path_buf(),
        Some(prefix) => util::reroot(prefix, path),
    }
}

fn has_magic(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn layer_scaffold(source: &Path) -> Scaffold {
        Scaffold::new(Some(source.to_path_buf()), Some(PathBuf::from("/ov/root")))
    }

    #[test]
    fn prefixes() {
        let scaffold = Scaffold::new(Some("/layers/py".into()), Some("/ov/root".into()));
        assert_eq!(
            scaffold.source_path(Path::new("/usr/lib")),
            PathBuf::from("/layers/py/usr/lib")
        );
        assert_eq!(
            scaffold.dest_path(Path::new("/usr/lib")),
            PathBuf::from("/ov/root/usr/lib")
        );
        assert_eq!(
            scaffold.source_path_inverse(Path::new("/layers/py/usr/lib")),
            Some(PathBuf::from("/usr/lib"))
        );
        assert_eq!(scaffold.source_path_inverse(Path::new("/layers/py")), None);
        assert_eq!(scaffold.source_path_inverse(Path::new("/elsewhere")), None);
    }

    #[test]
    fn missing_prefixes_are_identity() {
        let scaffold = Scaffold::default();
        let path = Path::new("/etc/ld.so.cache");
        assert_eq!(scaffold.source_path(path), path);
        assert_eq!(scaffold.dest_path(path), path);
        assert_eq!(scaffold.source_path_inverse(path), Some(path.to_path_buf()));
    }

    #[test]
    fn literal_paths_need_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let scaffold = layer_scaffold(dir.path());

        let expanded = scaffold.expand(Path::new("/opt/missing")).unwrap();
        assert_eq!(
            expanded,
            vec![Expansion {
                logical: PathBuf::from("/opt/missing"),
                source: dir.path().join("opt/missing"),
                dest: PathBuf::from("/ov/root/opt/missing"),
            }]
        );
    }

    #[test]
    fn globs_expand_against_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("usr/lib/python3.11")).unwrap();
        fs::create_dir_all(dir.path().join("usr/lib/python3.12")).unwrap();
        fs::create_dir_all(dir.path().join("usr/lib/perl5")).unwrap();
        let scaffold = layer_scaffold(dir.path());

        let logical = scaffold
            .expand(Path::new("/usr/lib/python3*"))
            .unwrap()
            .into_iter()
            .map(|e| e.dest)
            .collect::<Vec<_>>();
        assert_eq!(
            logical,
            vec![
                PathBuf::from("/ov/root/usr/lib/python3.11"),
                PathBuf::from("/ov/root/usr/lib/python3.12"),
            ]
        );
    }

    #[test]
    fn glob_without_matches_fails() {
        let dir = tempfile::tempdir().unwrap();
        let scaffold = layer_scaffold(dir.path());
        assert!(scaffold.expand(Path::new("/usr/lib/nothing*")).is_err());
    }

    #[test]
    fn image_scaffold_globs_literal_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a1")).unwrap();
        let scaffold = Scaffold::new(None, Some(PathBuf::from("/ov/root")));

        let pattern = dir.path().join("a*");
        let expanded = scaffold.expand(&pattern).unwrap();
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].source, dir.path().join("a1"));
        assert_eq!(expanded[0].logical, dir.path().join("a1"));
        assert_eq!(
            expanded[0].dest,
            util::reroot(Path::new("/ov/root"), &dir.path().join("a1"))
        );
    }
}

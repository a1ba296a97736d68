//! OverlayFS mounts.

use std::path::{Path, PathBuf};

use warren_common::{WarrenError, WarrenResult};

use super::util;

/// OverlayFS configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayFs {
    /// Lower directories, topmost first.
    pub lower_dirs: Vec<PathBuf>,
    /// Upper directory; `None` mounts the overlay read-only.
    pub upper_dir: Option<PathBuf>,
    /// Work directory, required together with an upper directory.
    pub work_dir: Option<PathBuf>,
    /// Mount point.
    pub merged_dir: PathBuf,
}

impl OverlayFs {
    /// Writable overlay of `upper_dir` over `lower_dirs`.
    pub fn new(
        lower_dirs: Vec<PathBuf>,
        upper_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        merged_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            lower_dirs,
            upper_dir: Some(upper_dir.into()),
            work_dir: Some(work_dir.into()),
            merged_dir: merged_dir.into(),
        }
    }

    /// Read-only stack of `lower_dirs`.
    pub fn read_only(lower_dirs: Vec<PathBuf>, merged_dir: impl Into<PathBuf>) -> Self {
        Self {
            lower_dirs,
            upper_dir: None,
            work_dir: None,
            merged_dir: merged_dir.into(),
        }
    }

    /// Create the upper and work directories.
    pub fn create_dirs(&self) -> WarrenResult<()> {
        for dir in self.upper_dir.iter().chain(self.work_dir.iter()) {
            util::makedirs(dir)?;
        }
        Ok(())
    }

    /// Whether the mount will be read-only.
    ///
    /// This is the case without an upper directory, and also when the caller
    /// cannot write to the upper directory, which the kernel would reject
    /// noisily.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        match &self.upper_dir {
            None => true,
            Some(upper) => !util::is_writable(upper),
        }
    }

    /// Get the mount options string.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| escape_option(p))
            .collect::<Vec<_>>()
            .join(":");

        match (&self.upper_dir, &self.work_dir) {
            (Some(upper), Some(work)) => format!(
                "lowerdir={},upperdir={},workdir={}",
                lower,
                escape_option(upper),
                escape_option(work)
            ),
            _ => format!("lowerdir={lower}"),
        }
    }

    /// Mount the overlay filesystem.
    #[cfg(target_os = "linux")]
    pub fn mount(&self) -> WarrenResult<()> {
        use rustix::mount::{MountFlags, mount};

        let options = self.mount_options();
        let mut flags = MountFlags::LAZYTIME | MountFlags::NOATIME;
        if self.is_read_only() {
            if self.upper_dir.is_some() {
                tracing::debug!(
                    upper = ?self.upper_dir,
                    "Upper directory is not writable, mounting overlay read-only"
                );
            }
            flags |= MountFlags::RDONLY;
        }

        tracing::debug!(
            merged = %self.merged_dir.display(),
            options = %options,
            "Mounting overlayfs"
        );

        let options_c = super::mounts::c_string(&options)?;
        mount(
            c"warren",
            &self.merged_dir,
            c"overlay",
            flags,
            Some(options_c.as_c_str()),
        )
        .map_err(|e| WarrenError::mount("mount overlay at", &self.merged_dir, e))?;

        tracing::debug!(merged = %self.merged_dir.display(), "OverlayFS mounted");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn mount(&self) -> WarrenResult<()> {
        Err(WarrenError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }

    /// Mount point of the overlay.
    #[must_use]
    pub fn merged_dir(&self) -> &Path {
        &self.merged_dir
    }
}

/// Backslash-escape the characters overlayfs treats as separators.
fn escape_option(path: &Path) -> String {
    let mut escaped = String::new();
    for c in path.display().to_string().chars() {
        if matches!(c, '\\' | ',' | ':') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_overlay_options() {
        let overlay = OverlayFs::new(
            vec![PathBuf::from("/ov/lower")],
            "/ov/tree",
            "/ov/work",
            "/ov/root",
        );

        assert_eq!(
            overlay.mount_options(),
            "lowerdir=/ov/lower,upperdir=/ov/tree,workdir=/ov/work"
        );
    }

    #[test]
    fn read_only_overlay_options() {
        let overlay = OverlayFs::read_only(
            vec![PathBuf::from("/layer/usr"), PathBuf::from("/root/usr")],
            "/root/usr",
        );

        assert_eq!(overlay.mount_options(), "lowerdir=/layer/usr:/root/usr");
        assert!(overlay.is_read_only());
    }

    #[test]
    fn separators_in_paths_are_escaped() {
        let overlay = OverlayFs::new(
            vec![PathBuf::from("/srv/a,b:c"), PathBuf::from("/srv/plain")],
            "/ov/up\\per",
            "/ov/work",
            "/ov/root",
        );

        assert_eq!(
            overlay.mount_options(),
            r"lowerdir=/srv/a\,b\:c:/srv/plain,upperdir=/ov/up\\per,workdir=/ov/work"
        );
    }

    #[test]
    fn unwritable_upper_forces_read_only() {
        let overlay = OverlayFs::new(
            vec![PathBuf::from("/")],
            "/nonexistent/upper",
            "/nonexistent/work",
            "/mnt",
        );
        assert!(overlay.is_read_only());

        let dir = tempfile::tempdir().unwrap();
        let overlay = OverlayFs::new(
            vec![PathBuf::from("/")],
            dir.path(),
            dir.path().join("work"),
            "/mnt",
        );
        assert!(!overlay.is_read_only());
    }
}

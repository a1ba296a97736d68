//! Temporary tmpfs-backed directories.

use std::path::Path;

use tempfile::TempDir;
use warren_common::{WarrenError, WarrenResult};

use super::mounts::{lazy_unmount, mount_tmpfs};

/// A `$TMPDIR/mounts.XXXXXX` directory with a private tmpfs mounted on it.
///
/// Dropping the value detaches the tmpfs and removes the directory, so every
/// exit path of the code using it cleans up.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
    mounted: bool,
}

impl ScratchDir {
    /// Create the directory and mount a tmpfs on it.
    pub fn new() -> WarrenResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("mounts.")
            .tempdir()
            .map_err(|e| WarrenError::fs(std::env::temp_dir(), e))?;

        mount_tmpfs(dir.path())?;
        Ok(Self { dir, mounted: true })
    }

    /// Create the directory without a tmpfs on it.
    pub fn unmounted() -> WarrenResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("mounts.")
            .tempdir()
            .map_err(|e| WarrenError::fs(std::env::temp_dir(), e))?;
        Ok(Self {
            dir,
            mounted: false,
        })
    }

    /// Path of the scratch directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(err) = lazy_unmount(self.dir.path()) {
                tracing::error!(
                    path = %self.dir.path().display(),
                    %err,
                    "Unable to unmount scratch directory"
                );
            }
            self.mounted = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmounted_scratch_is_removed_on_drop() {
        let scratch = ScratchDir::unmounted().unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.is_dir());
        assert!(
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("mounts.")
        );

        drop(scratch);
        assert!(!path.exists());
    }
}

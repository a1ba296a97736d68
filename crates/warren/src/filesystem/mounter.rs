//! The seam between mount decisions and mount syscalls.

use std::path::Path;

use warren_common::WarrenResult;

use super::{OverlayFs, ScratchDir, mounts};

/// Issues mount operations.
///
/// Everything that decides *what* to mount takes a `&dyn Mounter`, so the
/// decisions can be exercised without privileges.
pub trait Mounter {
    /// Bind mount `source` onto `target`.
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> WarrenResult<()>;

    /// Mount an overlay filesystem.
    fn overlay(&self, overlay: &OverlayFs) -> WarrenResult<()>;

    /// Mount a virtual filesystem at `target`.
    fn mount(
        &self,
        target: &Path,
        fstype: &str,
        device: Option<&str>,
        options: Option<&str>,
    ) -> WarrenResult<()>;

    /// Lazily detach whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> WarrenResult<()>;

    /// A scratch directory for short-lived overlay plumbing.
    fn scratch_dir(&self) -> WarrenResult<ScratchDir> {
        ScratchDir::new()
    }
}

/// Mounts for real.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn bind(&self, source: &Path, target: &Path, recursive: bool) -> WarrenResult<()> {
        mounts::bind_mount(source, target, recursive)
    }

    fn overlay(&self, overlay: &OverlayFs) -> WarrenResult<()> {
        overlay.mount()
    }

    fn mount(
        &self,
        target: &Path,
        fstype: &str,
        device: Option<&str>,
        options: Option<&str>,
    ) -> WarrenResult<()> {
        mounts::mount_virtual(target, fstype, device, options)
    }

    fn unmount(&self, target: &Path) -> WarrenResult<()> {
        mounts::lazy_unmount(target)
    }
}

//! Filesystem operations used while assembling environments.
//!
//! This module handles:
//! - Bind, virtual filesystem and overlay mounts
//! - tmpfs-backed scratch directories
//! - Reading the host mount table
//! - Small path and directory helpers

mod mounter;
mod mounts;
mod overlay;
mod scratch;
pub mod table;
pub mod util;

pub use mounts::{bind_mount, lazy_unmount, make_private, mount_tmpfs, mount_virtual};
pub use mounter::{Mounter, SystemMounter};
pub use overlay::OverlayFs;
pub use scratch::ScratchDir;
pub use table::{MountEntry, MountSource, ProcMounts, snapshot};

#[cfg(test)]
pub(crate) use mounter::testing;

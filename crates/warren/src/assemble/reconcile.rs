//! Deciding what to do with each host mount when building a new root.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::pathstate::{PathState, PathTree};

/// Filesystems that are bound into the new root as a whole.
pub const VIRTUAL_FILESYSTEMS: &[&str] = &[
    "bpf",
    "cgroup",
    "cgroup2",
    "debugfs",
    "devpts",
    "devtmpfs",
    "efivarfs",
    "hugetlbfs",
    "mqueue",
    "proc",
    "pstore",
    "securityfs",
    "sysfs",
    "tmpfs",
];

/// Filesystems overlayfs cannot use as a lower layer.
pub const NO_OVERLAY_FILESYSTEMS: &[&str] = &["fat", "vfat", "nfs"];

/// Why a mount point is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The root itself is covered by the root overlay.
    Root,
    /// The filesystem does not work as an overlay lower layer.
    NoOverlaySupport,
    /// The mount contains the overlay directory.
    ContainsOverlayDir,
    /// The caller cannot traverse the mount point.
    Inaccessible,
    /// The environment brings its own root image.
    ImageBased,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Root => "root directory",
            Self::NoOverlaySupport => "file system does not support overlays",
            Self::ContainsOverlayDir => "parent of the overlay directory",
            Self::Inaccessible => "inaccessible to this user",
            Self::ImageBased => "environment is image based",
        })
    }
}

/// What to do with one host mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Bind the mount into the new root, including everything below it.
    Bind {
        /// Mount point.
        path: PathBuf,
        /// Its filesystem type.
        fstype: String,
    },
    /// Give the mount its own overlay under `subtree.<index>`.
    Overlay {
        /// Mount point.
        path: PathBuf,
        /// Subtree number.
        index: usize,
    },
    /// Leave the mount alone.
    Skip {
        /// Mount point.
        path: PathBuf,
        /// Why.
        reason: SkipReason,
    },
}

impl ReconcileAction {
    /// Mount point this action is about.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Bind { path, .. } | Self::Overlay { path, .. } | Self::Skip { path, .. } => path,
        }
    }
}

/// Inputs of [`plan_reconciliation`] besides the mount tree.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions<'a> {
    /// Scratch directory of the build; its ancestors are never overlaid.
    pub overlay_dir: &'a Path,
    /// Extra filesystem types to bind as a whole.
    pub bind_types: &'a [String],
    /// Skip ordinary filesystems because the root comes from an image.
    pub image_based: bool,
}

/// Walk the host mount tree and decide the fate of every mount point.
///
/// Virtual filesystems (and `bind_types`) are atomic: once bound, nothing
/// below them is considered. The accessibility check is injected so the
/// plan can be computed without touching the host.
pub fn plan_reconciliation(
    mounts: &PathTree,
    options: ReconcileOptions<'_>,
    accessible: impl Fn(&Path) -> bool,
) -> Vec<ReconcileAction> {
    let mut actions = Vec::new();
    let mut index = 0;
    let mut walker = mounts.walk();

    while let Some(id) = walker.next(mounts) {
        let PathState::SystemMount { fstype, .. } = mounts.state(id) else {
            continue;
        };
        let path = mounts.path_of(id);

        let skip = |reason| ReconcileAction::Skip {
            path: path.clone(),
            reason,
        };

        let action = if path == Path::new("/") {
            skip(SkipReason::Root)
        } else if VIRTUAL_FILESYSTEMS.contains(&fstype.as_str())
            || options.bind_types.iter().any(|t| t == fstype)
        {
            walker.skip_children();
            if accessible(&path) {
                ReconcileAction::Bind {
                    path: path.clone(),
                    fstype: fstype.clone(),
                }
            } else {
                skip(SkipReason::Inaccessible)
            }
        } else if NO_OVERLAY_FILESYSTEMS.contains(&fstype.as_str()) {
            skip(SkipReason::NoOverlaySupport)
        } else if options.overlay_dir.starts_with(&path) {
            skip(SkipReason::ContainsOverlayDir)
        } else if !accessible(&path) {
            skip(SkipReason::Inaccessible)
        } else if options.image_based {
            skip(SkipReason::ImageBased)
        } else {
            index += 1;
            ReconcileAction::Overlay {
                path: path.clone(),
                index: index - 1,
            }
        };

        tracing::trace!(path = %path.display(), fstype = %fstype, action = ?action, "Reconcile");
        actions.push(action);
    }
    actions
}

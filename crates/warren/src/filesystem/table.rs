//! Reading the host mount table.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use warren_common::{WarrenError, WarrenResult};

use crate::pathstate::PathTree;

/// One mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mount source ("proc", "/dev/sda1", "overlay", ...).
    pub device: String,
    /// Where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Filesystem type.
    pub fstype: String,
}

impl MountEntry {
    /// Convenience constructor.
    pub fn new(
        device: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        fstype: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            mount_point: mount_point.into(),
            fstype: fstype.into(),
        }
    }
}

/// Anything that can enumerate the currently mounted filesystems.
pub trait MountSource {
    /// List mounts in mount order.
    fn mounts(&self) -> WarrenResult<Vec<MountEntry>>;
}

impl MountSource for [MountEntry] {
    fn mounts(&self) -> WarrenResult<Vec<MountEntry>> {
        Ok(self.to_vec())
    }
}

impl MountSource for Vec<MountEntry> {
    fn mounts(&self) -> WarrenResult<Vec<MountEntry>> {
        Ok(self.clone())
    }
}

/// Mount table in `/proc/mounts` format.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    path: PathBuf,
}

impl Default for ProcMounts {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcMounts {
    /// The calling process's mount table.
    #[must_use]
    pub fn new() -> Self {
        Self::from_file("/proc/self/mounts")
    }

    /// Any file in mtab format.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse mtab text. Malformed lines are skipped.
    #[must_use]
    pub fn parse(text: &str) -> Vec<MountEntry> {
        text.lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mount_point = fields.next()?;
                let fstype = fields.next()?;
                Some(MountEntry {
                    device: String::from_utf8_lossy(&unescape(device)).into_owned(),
                    mount_point: PathBuf::from(OsString::from_vec(unescape(mount_point))),
                    fstype: fstype.to_string(),
                })
            })
            .collect()
    }
}

impl MountSource for ProcMounts {
    fn mounts(&self) -> WarrenResult<Vec<MountEntry>> {
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| WarrenError::fs(&self.path, e))?;
        Ok(Self::parse(&text))
    }
}

/// Decode the `\NNN` octal escapes mtab uses for whitespace and backslashes.
fn unescape(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|b| (b'0'..=b'7').contains(b))
}

/// Read the mount table into a tree of system mounts.
///
/// With `root_filter`, only mounts at or below that directory are kept and
/// their paths are made relative to it. The filter is canonicalized first.
pub fn snapshot(
    source: &(impl MountSource + ?Sized),
    root_filter: Option<&Path>,
) -> WarrenResult<PathTree> {
    let filter = root_filter
        .map(|dir| std::fs::canonicalize(dir).map_err(|e| WarrenError::fs(dir, e)))
        .transpose()?;

    let mut tree = PathTree::with_root_dir(filter.clone().unwrap_or_else(|| PathBuf::from("/")));
    for entry in source.mounts()? {
        let path = match &filter {
            None => entry.mount_point.clone(),
            Some(filter) => match entry.mount_point.strip_prefix(filter) {
                Ok(relative) => Path::new("/").join(relative),
                Err(_) => continue,
            },
        };

        tree.set_system_mount(&path, entry.fstype, Some(entry.device));
    }
    Ok(tree)
}

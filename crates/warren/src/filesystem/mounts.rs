//! Mount operations.

use std::ffi::CString;
use std::path::Path;

use warren_common::{WarrenError, WarrenResult};

pub(super) fn c_string(value: &str) -> WarrenResult<CString> {
    CString::new(value).map_err(|_| WarrenError::Internal {
        message: format!("mount argument contains a NUL byte: {value:?}"),
    })
}

/// Bind mount `source` onto `target`.
///
/// With `recursive` set, mounts below `source` come along (`MS_REC`).
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path, recursive: bool) -> WarrenResult<()> {
    use rustix::mount::{mount_bind, mount_bind_recursive};

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        recursive,
        "Creating bind mount"
    );

    let result = if recursive {
        mount_bind_recursive(source, target)
    } else {
        mount_bind(source, target)
    };
    result.map_err(|e| WarrenError::mount("bind mount", target, e))
}

#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path, _recursive: bool) -> WarrenResult<()> {
    Err(WarrenError::Unsupported {
        feature: "bind mounts".to_string(),
    })
}

/// Mount a virtual filesystem (tmpfs, proc, ...) at `target`.
#[cfg(target_os = "linux")]
pub fn mount_virtual(
    target: &Path,
    fstype: &str,
    device: Option<&str>,
    options: Option<&str>,
) -> WarrenResult<()> {
    use rustix::mount::{MountFlags, mount};

    tracing::debug!(
        target = %target.display(),
        fstype,
        device = ?device,
        options = ?options,
        "Mounting filesystem"
    );

    let fstype_c = c_string(fstype)?;
    let device_c = c_string(device.unwrap_or(fstype))?;
    let options_c = options.map(c_string).transpose()?;

    mount(
        device_c.as_c_str(),
        target,
        fstype_c.as_c_str(),
        MountFlags::empty(),
        options_c.as_deref(),
    )
    .map_err(|e| WarrenError::mount("mount", target, e))
}

#[cfg(not(target_os = "linux"))]
pub fn mount_virtual(
    _target: &Path,
    _fstype: &str,
    _device: Option<&str>,
    _options: Option<&str>,
) -> WarrenResult<()> {
    Err(WarrenError::Unsupported {
        feature: "mounts".to_string(),
    })
}

/// Mount an empty tmpfs at `target`.
pub fn mount_tmpfs(target: &Path) -> WarrenResult<()> {
    mount_virtual(target, "tmpfs", None, None)
}

/// Detach the mount at `target` without waiting for it to become unbusy.
#[cfg(target_os = "linux")]
pub fn lazy_unmount(target: &Path) -> WarrenResult<()> {
    use rustix::mount::{UnmountFlags, unmount};

    tracing::debug!(target = %target.display(), "Detaching mount");

    unmount(target, UnmountFlags::DETACH).map_err(|e| WarrenError::mount("unmount", target, e))
}

#[cfg(not(target_os = "linux"))]
pub fn lazy_unmount(_target: &Path) -> WarrenResult<()> {
    Err(WarrenError::Unsupported {
        feature: "unmount".to_string(),
    })
}

/// Make every mount at and below `target` private (no propagation).
#[cfg(target_os = "linux")]
pub fn make_private(target: &Path) -> WarrenResult<()> {
    use rustix::mount::{MountPropagationFlags, mount_change};

    tracing::debug!(target = %target.display(), "Making mounts private");

    mount_change(
        target,
        MountPropagationFlags::PRIVATE | MountPropagationFlags::REC,
    )
    .map_err(|e| WarrenError::mount("change propagation of", target, e))
}

#[cfg(not(target_os = "linux"))]
pub fn make_private(_target: &Path) -> WarrenResult<()> {
    Err(WarrenError::Unsupported {
        feature: "mount propagation".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(c_string("size=1m").is_ok());
        assert!(matches!(
            c_string("size=\01m"),
            Err(WarrenError::Internal { .. })
        ));
    }
}

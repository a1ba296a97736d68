//! Mount and user namespaces.
//!
//! Environments are built inside a private mount namespace, either directly
//! (privileged) or nested in a fresh user namespace that maps the caller's
//! ids onto themselves.

#![allow(unsafe_code)]

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use warren_common::{WarrenError, WarrenResult};

const SELF_MNT_NS: &str = "/proc/self/ns/mnt";

/// Owned handle to a mount namespace.
///
/// Dropping it closes the descriptor exactly once. Use
/// [`NamespaceFd::duplicate`] to hand a copy to someone else.
#[derive(Debug)]
pub struct NamespaceFd(OwnedFd);

impl NamespaceFd {
    /// Open the caller's current mount namespace.
    pub fn current() -> WarrenResult<Self> {
        let file = File::open(SELF_MNT_NS).map_err(|e| WarrenError::fs(SELF_MNT_NS, e))?;
        Ok(Self(file.into()))
    }

    /// A second, independently owned descriptor for the same namespace.
    pub fn duplicate(&self) -> WarrenResult<Self> {
        Ok(Self(self.0.try_clone()?))
    }

    /// Switch the calling thread into this mount namespace.
    #[cfg(target_os = "linux")]
    pub fn enter(&self) -> WarrenResult<()> {
        // SAFETY: setns only reads the descriptor we own.
        if unsafe { libc::setns(self.0.as_raw_fd(), libc::CLONE_NEWNS) } != 0 {
            return Err(WarrenError::Io(std::io::Error::last_os_error()));
        }
        tracing::debug!(fd = self.0.as_raw_fd(), "Entered mount namespace");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn enter(&self) -> WarrenResult<()> {
        Err(WarrenError::Unsupported {
            feature: "namespaces".to_string(),
        })
    }

    /// Give up ownership of the descriptor.
    #[must_use]
    pub fn into_owned_fd(self) -> OwnedFd {
        self.0
    }
}

impl From<OwnedFd> for NamespaceFd {
    fn from(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

fn namespace_identity() -> WarrenResult<(u64, u64)> {
    let meta = std::fs::metadata(SELF_MNT_NS).map_err(|e| WarrenError::fs(SELF_MNT_NS, e))?;
    Ok((meta.dev(), meta.ino()))
}

#[cfg(target_os = "linux")]
fn unshare(flags: rustix::thread::UnshareFlags) -> WarrenResult<()> {
    // SAFETY: warren is single threaded while it sets up namespaces; no
    // other thread shares the file table or filesystem attributes.
    unsafe {
        rustix::thread::unshare_unsafe(flags).map_err(|e| WarrenError::Internal {
            message: format!("Failed to unshare namespaces: {e}"),
        })?;
    }
    tracing::debug!(?flags, "Unshared namespaces");
    Ok(())
}

/// Move into a new private mount namespace.
///
/// Fails unless the namespace identity really changed.
#[cfg(target_os = "linux")]
pub fn create_namespace() -> WarrenResult<()> {
    use rustix::thread::UnshareFlags;

    let before = namespace_identity()?;
    unshare(UnshareFlags::NEWNS)?;
    if namespace_identity()? == before {
        return Err(WarrenError::Internal {
            message: "mount namespace unchanged after unshare".to_string(),
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn create_namespace() -> WarrenResult<()> {
    Err(WarrenError::Unsupported {
        feature: "namespaces".to_string(),
    })
}

/// Move into a new user namespace with its own mount namespace, mapping the
/// caller's uid and gid to themselves.
#[cfg(target_os = "linux")]
pub fn create_user_namespace() -> WarrenResult<()> {
    use rustix::thread::UnshareFlags;

    let uid = rustix::process::getuid().as_raw();
    let gid = rustix::process::getgid().as_raw();

    unshare(UnshareFlags::NEWUSER | UnshareFlags::NEWNS)?;

    write_single_line(Path::new("/proc/self/uid_map"), &id_map_line(uid))?;
    write_single_line(Path::new("/proc/self/setgroups"), "deny")?;
    write_single_line(Path::new("/proc/self/gid_map"), &id_map_line(gid))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn create_user_namespace() -> WarrenResult<()> {
    Err(WarrenError::Unsupported {
        feature: "user namespaces".to_string(),
    })
}

/// Create a user or a privileged mount namespace.
pub fn enter_private_namespace(privileged: bool) -> WarrenResult<()> {
    if privileged {
        create_namespace()
    } else {
        create_user_namespace()
    }
}

fn id_map_line(id: u32) -> String {
    format!("{id} {id} 1")
}

fn write_single_line(path: &Path, line: &str) -> WarrenResult<()> {
    tracing::debug!(path = %path.display(), line, "Writing id map");
    std::fs::write(path, format!("{line}\n")).map_err(|e| WarrenError::fs(path, e))
}

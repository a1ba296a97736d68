//! Podman backend.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use warren_common::{WarrenError, WarrenResult};

use super::ContainerRuntime;
use crate::exec::describe_status;

/// Runs the `podman` binary.
#[derive(Debug, Clone)]
pub struct Podman {
    program: PathBuf,
}

impl Default for Podman {
    fn default() -> Self {
        Self::new("podman")
    }
}

impl Podman {
    /// Use `program` instead of `podman` from `$PATH`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args);
        tracing::debug!(program = %self.program.display(), ?args, "Running container runtime");
        command
    }

    fn failure(&self, args: &[&str], status: std::process::ExitStatus) -> WarrenError {
        WarrenError::Command {
            command: format!("{} {}", self.program.display(), args.join(" ")),
            status: describe_status(status),
        }
    }

    fn spawn_error(&self, e: &std::io::Error) -> WarrenError {
        WarrenError::Container {
            message: format!("cannot execute {}: {e}", self.program.display()),
        }
    }
}

impl ContainerRuntime for Podman {
    fn container_exists(&self, local_name: &str) -> WarrenResult<bool> {
        let status = self
            .command(&["container", "exists", local_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| self.spawn_error(&e))?;
        Ok(status.success())
    }

    fn container_start(&self, image: &str, local_name: &str) -> WarrenResult<()> {
        let args = ["create", "--name", local_name, image];
        let status = self
            .command(&args)
            .stdout(Stdio::null())
            .status()
            .map_err(|e| self.spawn_error(&e))?;
        if status.success() {
            Ok(())
        } else {
            Err(self.failure(&args, status))
        }
    }

    fn container_mount(&self, local_name: &str) -> WarrenResult<PathBuf> {
        let args = ["mount", local_name];
        let output = self
            .command(&args)
            .output()
            .map_err(|e| self.spawn_error(&e))?;
        if !output.status.success() {
            return Err(self.failure(&args, output.status));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines().filter(|line| !line.trim().is_empty());
        let mount_point = lines.next().map(str::trim).ok_or_else(|| WarrenError::Container {
            message: format!("podman mount {local_name} printed no mount point"),
        })?;
        for extra in lines {
            tracing::warn!(output = extra, "Additional output from podman mount");
        }

        let mount_point = PathBuf::from(mount_point);
        if !mount_point.is_absolute() {
            return Err(WarrenError::Container {
                message: format!(
                    "podman mount {local_name} returned {}, which is not an absolute path",
                    mount_point.display()
                ),
            });
        }
        Ok(mount_point)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn fake_podman(dir: &std::path::Path, script: &str) -> Podman {
        let program = dir.join("podman");
        std::fs::write(&program, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        Podman::new(program)
    }

    #[test]
    fn mount_reads_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let podman = fake_podman(dir.path(), "echo /var/lib/containers/merged\necho noise");
        assert_eq!(
            podman.container_mount("warren_busybox").unwrap(),
            PathBuf::from("/var/lib/containers/merged")
        );
    }

    #[test]
    fn exists_follows_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let podman = fake_podman(dir.path(), "exit 1");
        assert!(!podman.container_exists("warren_busybox").unwrap());
        assert!(podman.container_start("busybox", "warren_busybox").is_err());

        let dir = tempfile::tempdir().unwrap();
        let podman = fake_podman(dir.path(), "exit 0");
        assert!(podman.container_exists("warren_busybox").unwrap());
    }

    #[test]
    fn missing_binary_is_container_error() {
        let podman = Podman::new("/nonexistent/podman");
        assert!(matches!(
            podman.container_exists("x"),
            Err(WarrenError::Container { .. })
        ));
    }
}

//! Process execution.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use warren_common::{WarrenError, WarrenResult};

/// Human readable description of a child's exit status.
#[must_use]
pub fn describe_status(status: ExitStatus) -> String {
    if let Some(signal) = status.signal() {
        format!("crashed with signal {signal}")
    } else if let Some(code) = status.code() {
        format!("exited with status {code}")
    } else {
        format!("weird status word 0x{:x}", status.into_raw())
    }
}

/// Whether the child exited normally with status 0.
#[must_use]
pub fn status_ok(status: ExitStatus) -> bool {
    status.success()
}

/// Resolve `argv0` along `$PATH` unless it already contains a slash.
#[must_use]
pub fn find_command(argv0: &str) -> Option<PathBuf> {
    if argv0.contains('/') {
        return Some(PathBuf::from(argv0));
    }

    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(argv0))
        .find(|candidate| candidate.is_file() && crate::filesystem::util::is_accessible(candidate))
}

/// Build a command that runs with `root` as its filesystem root and `cwd`
/// as its working directory (interpreted inside `root`).
pub fn chrooted(
    program: impl AsRef<std::ffi::OsStr>,
    root: Option<&Path>,
    cwd: &Path,
) -> WarrenResult<Command> {
    let to_c = |path: &Path| {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| WarrenError::Internal {
            message: format!("path contains a NUL byte: {}", path.display()),
        })
    };
    let root = root.map(to_c).transpose()?;
    let cwd = to_c(cwd)?;

    let mut command = Command::new(program);
    // SAFETY: chroot and chdir are plain syscalls on memory prepared before
    // the fork; nothing is allocated in the child.
    unsafe {
        command.pre_exec(move || {
            if let Some(root) = &root {
                rustix::process::chroot(root.as_c_str())?;
            }
            rustix::process::chdir(cwd.as_c_str())?;
            Ok(())
        });
    }
    Ok(command)
}

/// Run `command` to completion.
pub fn run(command: &mut Command) -> WarrenResult<ExitStatus> {
    let program = command.get_program().to_string_lossy().into_owned();
    tracing::debug!(program = %program, "Running command");

    let status = command.status().map_err(|e| WarrenError::fs(&program, e))?;
    tracing::debug!(program = %program, status = %describe_status(status), "Command finished");
    Ok(status)
}

/// Replace the current process with `command`. Only returns on failure.
pub fn exec(command: &mut Command) -> WarrenError {
    let program = command.get_program().to_string_lossy().into_owned();
    tracing::debug!(program = %program, "Executing");
    WarrenError::fs(program, command.exec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_exit_codes() {
        let status = Command::new("sh").args(["-c", "exit 3"]).status().unwrap();
        assert_eq!(describe_status(status), "exited with status 3");
        assert!(!status_ok(status));

        let status = Command::new("sh").args(["-c", "kill -9 $$"]).status().unwrap();
        assert_eq!(describe_status(status), "crashed with signal 9");
    }

    #[test]
    fn finds_commands_on_path() {
        assert_eq!(find_command("./x"), Some(PathBuf::from("./x")));
        let sh = find_command("sh").unwrap();
        assert!(sh.ends_with("sh"));
        assert_eq!(find_command("surely-no-such-command-here"), None);
    }

    #[test]
    fn chrooted_command_changes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = chrooted("pwd", None, dir.path()).unwrap();
        let output = command.output().unwrap();
        let printed = String::from_utf8(output.stdout).unwrap();
        assert_eq!(
            std::fs::canonicalize(printed.trim()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }
}

//! Path and directory helpers.

use std::cmp::Ordering;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;
use warren_common::{WarrenError, WarrenResult};

/// Create `path` and any missing parents.
pub fn makedirs(path: &Path) -> WarrenResult<()> {
    std::fs::create_dir_all(path).map_err(|e| WarrenError::fs(path, e))
}

/// Create an empty regular file if nothing exists at `path`.
pub fn create_empty(path: &Path) -> WarrenResult<()> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map(drop)
        .map_err(|e| WarrenError::fs(path, e))
}

/// Whether `prefix` is `path` or one of its ancestors, compared per component.
#[must_use]
pub fn check_path_prefix(path: &Path, prefix: &Path) -> bool {
    path.starts_with(prefix)
}

/// Remove `prefix` from `path`, returning an absolute path.
///
/// `strip_path_prefix("/ov/root/usr", "/ov/root")` is `/usr`; the prefix
/// itself maps to `/`.
#[must_use]
pub fn strip_path_prefix(path: &Path, prefix: &Path) -> Option<PathBuf> {
    path.strip_prefix(prefix)
        .ok()
        .map(|rest| Path::new("/").join(rest))
}

/// Place the absolute `path` below `root`.
///
/// Unlike [`Path::join`], an absolute `path` does not replace `root`. `..`
/// is resolved lexically and stops at `root`, as it would after a chroot.
#[must_use]
pub fn reroot(root: &Path, path: &Path) -> PathBuf {
    let mut names = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => names.push(name),
            Component::ParentDir => {
                names.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    let mut rerooted = root.to_path_buf();
    rerooted.extend(names);
    rerooted
}

/// Resolve the existing `path` to an absolute path free of symlinks.
pub fn canonicalize(path: &Path) -> WarrenResult<PathBuf> {
    std::fs::canonicalize(path).map_err(|e| WarrenError::fs(path, e))
}

/// Whether the directory at `path` has no entries.
pub fn dir_is_empty(path: &Path) -> WarrenResult<bool> {
    let mut entries = std::fs::read_dir(path).map_err(|e| WarrenError::fs(path, e))?;
    Ok(entries.next().is_none())
}

/// Whether everything below `path` is a directory.
///
/// A tree of empty directories carries no content worth keeping.
pub fn holds_only_empty_dirs(path: &Path) -> WarrenResult<bool> {
    for entry in WalkDir::new(path).min_depth(1) {
        let entry = entry.map_err(|e| {
            let failed = e.path().unwrap_or(path).to_path_buf();
            WarrenError::fs(failed, std::io::Error::other(e))
        })?;
        if !entry.file_type().is_dir() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Remove `path` and everything below it; a missing path is not an error.
pub fn remove_recursively(path: &Path) -> WarrenResult<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(WarrenError::fs(path, e)),
    };

    tracing::debug!(path = %path.display(), "Removing");
    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(WarrenError::fs(path, e)),
        _ => Ok(()),
    }
}

/// Whether the caller may search (traverse) `path`.
#[must_use]
pub fn is_accessible(path: &Path) -> bool {
    rustix::fs::access(path, rustix::fs::Access::EXEC_OK).is_ok()
}

/// Whether the caller may write to `path`.
#[must_use]
pub fn is_writable(path: &Path) -> bool {
    rustix::fs::access(path, rustix::fs::Access::WRITE_OK).is_ok()
}

/// Compare the modification times of two files of the same type.
///
/// Returns `None` if either is missing or their types differ; `Less` means
/// `a` is older than `b`.
#[must_use]
pub fn compare_mtime(a: &Path, b: &Path) -> Option<Ordering> {
    let meta_a = std::fs::symlink_metadata(a).ok()?;
    let meta_b = std::fs::symlink_metadata(b).ok()?;
    if meta_a.file_type() != meta_b.file_type() {
        return None;
    }
    Some(meta_a.modified().ok()?.cmp(&meta_b.modified().ok()?))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::{Duration, SystemTime};

    use super::*;

    #[test]
    fn prefix_helpers_respect_component_boundaries() {
        assert!(check_path_prefix(Path::new("/tmp/ov/root"), Path::new("/tmp/ov")));
        assert!(check_path_prefix(Path::new("/tmp/ov"), Path::new("/tmp/ov")));
        assert!(!check_path_prefix(Path::new("/tmp/ovx"), Path::new("/tmp/ov")));

        assert_eq!(
            strip_path_prefix(Path::new("/ov/root/usr/lib"), Path::new("/ov/root")),
            Some(PathBuf::from("/usr/lib"))
        );
        assert_eq!(
            strip_path_prefix(Path::new("/ov/root"), Path::new("/ov/root")),
            Some(PathBuf::from("/"))
        );
        assert_eq!(strip_path_prefix(Path::new("/usr"), Path::new("/ov")), None);
    }

    #[test]
    fn reroot_keeps_root() {
        assert_eq!(
            reroot(Path::new("/ov/root"), Path::new("/usr/lib")),
            PathBuf::from("/ov/root/usr/lib")
        );
        assert_eq!(
            reroot(Path::new("/ov/root"), Path::new("/")),
            PathBuf::from("/ov/root")
        );
    }

    #[test]
    fn reroot_never_leaves_root() {
        let root = Path::new("/ov/root");
        assert_eq!(reroot(root, Path::new("/../../etc")), root.join("etc"));
        assert_eq!(reroot(root, Path::new("/usr/../lib/./x")), root.join("lib/x"));
        assert_eq!(reroot(root, Path::new("/usr/..")), root.to_path_buf());
    }

    #[test]
    fn empty_directory_checks() {
        let dir = tempfile::tempdir().unwrap();
        assert!(dir_is_empty(dir.path()).unwrap());

        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        assert!(!dir_is_empty(dir.path()).unwrap());
        assert!(holds_only_empty_dirs(dir.path()).unwrap());

        fs::write(dir.path().join("a/b/file"), "x").unwrap();
        assert!(!holds_only_empty_dirs(dir.path()).unwrap());
    }

    #[test]
    fn remove_tolerates_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("x/y")).unwrap();
        fs::write(tree.join("x/file"), "x").unwrap();

        remove_recursively(&tree).unwrap();
        assert!(!tree.exists());
        remove_recursively(&tree).unwrap();
    }

    #[test]
    fn mtime_comparison() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        fs::write(&old, "a").unwrap();
        fs::write(&new, "b").unwrap();

        let then = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(then)
            .unwrap();

        assert_eq!(compare_mtime(&old, &new), Some(Ordering::Less));
        assert_eq!(compare_mtime(&new, &old), Some(Ordering::Greater));
        assert_eq!(compare_mtime(&old, dir.path()), None);
        assert_eq!(compare_mtime(&old, &dir.path().join("missing")), None);
    }
}

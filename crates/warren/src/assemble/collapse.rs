//! Folding the build's overlay uppers into one tree, and clearing the rest.

use std::path::{Path, PathBuf};

use warren_common::{WarrenError, WarrenResult};

use super::{SUBTREE_PREFIX, TREE_DIR};
use crate::filesystem::util;
use crate::pathstate::{PathState, PathTree};

/// Files the digger injects into a build, relative to the new root.
pub const TRANSIENT_FILES: &[&str] = &["/build.sh", "/build", "/provides"];

/// Overlay nodes whose upper directory belongs to the build below
/// `overlay_dir`, as `(path, upper)`.
fn build_uppers(tree: &PathTree, overlay_dir: &Path) -> Vec<(PathBuf, PathBuf)> {
    let mut uppers = Vec::new();
    let mut walker = tree.walk();
    while let Some(id) = walker.next(tree) {
        if let PathState::OverlayMounted {
            upperdir: Some(upper),
        } = tree.state(id)
        {
            if util::check_path_prefix(upper, overlay_dir) {
                uppers.push((tree.path_of(id), upper.clone()));
            }
        }
    }
    uppers
}

/// Move every non-empty upper directory of the build into
/// `<overlay_dir>/tree`, at the path it was mounted on.
///
/// Moved nodes are cleared. Missing or empty uppers are left for
/// [`clean`]. Returns the number of directories moved.
pub fn collapse(tree: &mut PathTree, overlay_dir: &Path) -> WarrenResult<usize> {
    let combined = overlay_dir.join(TREE_DIR);
    let mut moved = 0;

    for (path, upper) in build_uppers(tree, overlay_dir) {
        if !upper.is_dir() {
            tracing::debug!(path = %path.display(), upper = %upper.display(), "Upper directory is gone");
            continue;
        }
        if util::dir_is_empty(&upper)? {
            tracing::debug!(path = %path.display(), "Nothing changed below mount point");
            continue;
        }

        let dest = util::reroot(&combined, &path);
        if let Some(parent) = dest.parent() {
            util::makedirs(parent)?;
        }

        tracing::debug!(
            path = %path.display(),
            from = %upper.display(),
            to = %dest.display(),
            "Merging subtree"
        );
        std::fs::rename(&upper, &dest).map_err(|e| WarrenError::fs(&upper, e))?;
        tree.clear(&path);
        moved += 1;
    }

    tracing::info!(moved, tree = %combined.display(), "Collapsed overlay tree");
    Ok(moved)
}

/// Remove the build scaffolding below `overlay_dir`.
///
/// Removes the `subtree.*` directories, `work`, `lower` and `root`, plus the
/// `transient` paths inside the combined tree. Every path is checked before
/// removal, so a build that failed half way can be cleaned too.
pub fn clean(tree: &mut PathTree, overlay_dir: &Path, transient: &[&str]) -> WarrenResult<()> {
    for (path, _) in build_uppers(tree, overlay_dir) {
        tree.clear(&path);
    }

    match std::fs::read_dir(overlay_dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry.map_err(|e| WarrenError::fs(overlay_dir, e))?;
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(SUBTREE_PREFIX)
                {
                    util::remove_recursively(&entry.path())?;
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(WarrenError::fs(overlay_dir, e)),
    }

    for dir in ["work", "lower"] {
        util::remove_recursively(&overlay_dir.join(dir))?;
    }

    let combined = overlay_dir.join(TREE_DIR);
    for file in transient {
        util::remove_recursively(&util::reroot(&combined, Path::new(file)))?;
    }

    let root = overlay_dir.join("root");
    if root.is_dir() {
        std::fs::remove_dir(&root).map_err(|e| WarrenError::fs(&root, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    /// A finished build: the root overlay's upper in `tree/`, and two
    /// per-mount overlays of which only `/data` saw changes.
    fn finished_build(dir: &Path) -> PathTree {
        for sub in ["tree/etc", "work/work", "lower", "root"] {
            fs::create_dir_all(dir.join(sub)).unwrap();
        }
        fs::write(dir.join("tree/etc/motd"), "hi").unwrap();
        fs::write(dir.join("tree/build.sh"), "#!/bin/sh").unwrap();
        fs::create_dir_all(dir.join("tree/build")).unwrap();
        fs::write(dir.join("tree/provides"), "").unwrap();

        fs::create_dir_all(dir.join("subtree.0/tree/app")).unwrap();
        fs::write(dir.join("subtree.0/tree/app/state"), "1").unwrap();
        fs::create_dir_all(dir.join("subtree.0/work")).unwrap();
        fs::create_dir_all(dir.join("subtree.1/tree")).unwrap();
        fs::create_dir_all(dir.join("subtree.1/work")).unwrap();

        let mut tree = PathTree::with_root_dir(dir.join("root"));
        tree.set_overlay_mounted("/data", Some(dir.join("subtree.0/tree")));
        tree.set_overlay_mounted("/srv/www", Some(dir.join("subtree.1/tree")));
        tree.set_overlay_mounted("/usr", Some(PathBuf::from("/layers/python/usr")));
        tree.set_bind_mounted("/proc");
        tree
    }

    #[test]
    fn collapse_moves_non_empty_uppers() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = finished_build(dir.path());

        assert_eq!(collapse(&mut tree, dir.path()).unwrap(), 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("tree/data/app/state")).unwrap(),
            "1"
        );
        assert!(!dir.path().join("subtree.0/tree").exists());
        assert!(dir.path().join("subtree.1/tree").exists());
        assert!(!dir.path().join("tree/srv").exists());

        assert_eq!(tree.get("/data"), Some(&PathState::Unchanged));
        assert!(matches!(
            tree.get("/srv/www"),
            Some(PathState::OverlayMounted { .. })
        ));
        // Layer uppers are never moved.
        assert!(matches!(
            tree.get("/usr"),
            Some(PathState::OverlayMounted { .. })
        ));
    }

    #[test]
    fn clean_leaves_only_the_combined_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = finished_build(dir.path());
        collapse(&mut tree, dir.path()).unwrap();
        clean(&mut tree, dir.path(), TRANSIENT_FILES).unwrap();

        let mut left = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        left.sort();
        assert_eq!(left, vec!["tree"]);

        assert!(dir.path().join("tree/etc/motd").exists());
        assert!(dir.path().join("tree/data/app/state").exists());
        for file in TRANSIENT_FILES {
            assert!(!util::reroot(&dir.path().join("tree"), Path::new(file)).exists());
        }

        assert_eq!(tree.get("/srv/www"), Some(&PathState::Unchanged));
        assert_eq!(tree.get("/proc"), Some(&PathState::BindMounted));
    }

    #[test]
    fn clean_tolerates_missing_scaffolding() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = PathTree::new();
        clean(&mut tree, dir.path(), TRANSIENT_FILES).unwrap();
        clean(&mut tree, &dir.path().join("never-created"), &[]).unwrap();
    }
}

//! Finding files no rule accounted for.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use warren_common::{WarrenError, WarrenResult};

use crate::pathstate::PathTree;

/// What to do with a directory that turns out to hold nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// An empty directory is a stray.
    #[default]
    Report,
    /// Ignore this directory if it is empty.
    IgnoreIfEmpty,
    /// Ignore this directory, and every directory below it, if empty.
    IgnoreEmptySubdirs,
}

impl Disposition {
    const fn ignores_empty(self) -> bool {
        !matches!(self, Self::Report)
    }

    /// What a subdirectory without its own disposition gets.
    const fn inherited(self) -> Self {
        match self {
            Self::IgnoreEmptySubdirs => Self::IgnoreEmptySubdirs,
            _ => Self::Report,
        }
    }
}

/// Per-directory tally while its subtree is being walked.
struct Frame {
    logical: PathBuf,
    depth: usize,
    disposition: Disposition,
    strays: usize,
    accounted: bool,
}

/// Collects strays while walking the scanned tree.
struct StrayWalk<'a> {
    tree: &'a mut PathTree<Disposition>,
    strays: Vec<PathBuf>,
}

impl StrayWalk<'_> {
    fn is_accounted(&self, logical: &Path) -> bool {
        self.tree
            .get(logical)
            .is_some_and(|state| !state.is_unchanged())
    }

    fn stray(&mut self, logical: PathBuf) {
        tracing::debug!(path = %logical.display(), "Stray");
        self.strays.push(logical);
    }

    /// Settle a directory whose subtree has been walked, and pass its tally
    /// up to `parent`.
    fn finish(&mut self, frame: Frame, parent: &mut Frame) {
        if frame.strays > 0 || frame.accounted {
            parent.strays += frame.strays;
            parent.accounted |= frame.accounted;
            return;
        }

        if frame.disposition.ignores_empty() {
            tracing::trace!(path = %frame.logical.display(), "Ignoring empty directory");
            self.tree.set_ignored(&frame.logical);
            parent.accounted = true;
        } else {
            self.stray(frame.logical);
            parent.strays += 1;
        }
    }
}

/// Walk `root` and return every entry the tree does not account for,
/// sorted.
///
/// Entries whose node is in any state other than unchanged are accounted
/// for, including everything below them. An unaccounted file is a stray.
/// A directory with no strays and nothing accounted below it is empty: it
/// becomes a stray unless its disposition (own, or inherited from an
/// ancestor's [`Disposition::IgnoreEmptySubdirs`]) ignores it, in which case
/// it is marked ignored in the tree.
pub fn find_strays(root: &Path, tree: &mut PathTree<Disposition>) -> WarrenResult<Vec<PathBuf>> {
    let root_disposition = tree.user_data("/").copied().unwrap_or_default();
    let mut stack = vec![Frame {
        logical: PathBuf::from("/"),
        depth: 0,
        disposition: root_disposition,
        strays: 0,
        accounted: false,
    }];
    let mut walk = StrayWalk {
        tree,
        strays: Vec::new(),
    };

    let mut entries = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry.map_err(|e| {
            let failed = e.path().unwrap_or(root).to_path_buf();
            WarrenError::fs(failed, std::io::Error::other(e))
        })?;

        unwind(&mut stack, &mut walk, entry.depth())?;

        let relative = entry.path().strip_prefix(root).map_err(|_| internal())?;
        let logical = Path::new("/").join(relative);
        let is_dir = entry.file_type().is_dir();
        let parent = stack.last_mut().ok_or_else(internal)?;

        if walk.is_accounted(&logical) {
            parent.accounted = true;
            if is_dir {
                entries.skip_current_dir();
            }
            continue;
        }

        if is_dir {
            let disposition = walk
                .tree
                .user_data(&logical)
                .copied()
                .unwrap_or_else(|| parent.disposition.inherited());
            stack.push(Frame {
                logical,
                depth: entry.depth(),
                disposition,
                strays: 0,
                accounted: false,
            });
        } else {
            parent.strays += 1;
            walk.stray(logical);
        }
    }

    unwind(&mut stack, &mut walk, 1)?;

    let mut strays = walk.strays;
    strays.sort();
    Ok(strays)
}

/// Settle every open directory at `depth` or deeper.
fn unwind(stack: &mut Vec<Frame>, walk: &mut StrayWalk<'_>, depth: usize) -> WarrenResult<()> {
    while stack.len() > 1 && stack.last().is_some_and(|frame| frame.depth >= depth) {
        let frame = stack.pop().ok_or_else(internal)?;
        let parent = stack.last_mut().ok_or_else(internal)?;
        walk.finish(frame, parent);
    }
    Ok(())
}

fn internal() -> WarrenError {
    WarrenError::Internal {
        message: "stray walk lost track of its directory stack".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn touch(root: &Path, path: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, "").unwrap();
    }

    fn mkdir(root: &Path, path: &str) {
        fs::create_dir_all(root.join(path)).unwrap();
    }

    #[test]
    fn unaccounted_file_is_a_stray() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "etc/unexpected.conf");
        touch(dir.path(), "usr/bin/tool");

        let mut tree = PathTree::new();
        tree.set_fake_overlay_mounted("/usr", None);

        let strays = find_strays(dir.path(), &mut tree).unwrap();
        assert_eq!(strays, vec![PathBuf::from("/etc/unexpected.conf")]);
    }

    #[test_log::test]
    fn empty_directories_are_strays_unless_ignored() {
        let dir = tempfile::tempdir().unwrap();
        mkdir(dir.path(), "srv/empty");
        mkdir(dir.path(), "tmp");
        mkdir(dir.path(), "etc/sysconfig/network");
        mkdir(dir.path(), "etc/skel");

        let mut tree = PathTree::new();
        tree.set_user_data("/tmp", Disposition::IgnoreIfEmpty);
        tree.set_user_data("/etc", Disposition::IgnoreEmptySubdirs);

        let strays = find_strays(dir.path(), &mut tree).unwrap();
        assert_eq!(strays, vec![PathBuf::from("/srv/empty")]);
        assert!(tree.get("/tmp").is_some_and(|s| !s.is_unchanged()));
        assert!(
            tree.get("/etc/sysconfig/network")
                .is_some_and(|s| !s.is_unchanged())
        );
    }

    #[test]
    fn ignore_if_empty_is_not_inherited() {
        let dir = tempfile::tempdir().unwrap();
        mkdir(dir.path(), "run/user");

        let mut tree = PathTree::new();
        tree.set_user_data("/run", Disposition::IgnoreIfEmpty);

        let strays = find_strays(dir.path(), &mut tree).unwrap();
        assert_eq!(strays, vec![PathBuf::from("/run/user")]);
    }

    #[test]
    fn directories_with_accounted_content_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "var/lib/app/data");
        mkdir(dir.path(), "var/lib/other");

        let mut tree = PathTree::new();
        tree.set_bind_mounted("/var/lib/app");

        let strays = find_strays(dir.path(), &mut tree).unwrap();
        assert_eq!(strays, vec![PathBuf::from("/var/lib/other")]);
    }

    #[test]
    fn strays_inside_ignore_empty_subdirs_are_still_reported() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "etc/passwd");
        mkdir(dir.path(), "etc/empty");

        let mut tree = PathTree::new();
        tree.set_user_data("/etc", Disposition::IgnoreEmptySubdirs);

        let strays = find_strays(dir.path(), &mut tree).unwrap();
        assert_eq!(strays, vec![PathBuf::from("/etc/passwd")]);
    }
}

//! Pre-order cursor over the changed nodes of a [`PathTree`].

use super::{NodeId, PathTree};

/// External walk cursor.
///
/// The walker visits every node whose state is not
/// [`Unchanged`](super::PathState::Unchanged) in pre-order, descending through
/// unchanged nodes to reach changed descendants. After a node is returned the
/// caller may call [`Walker::skip_children`] to leave its subtree out.
///
/// The walker holds no borrow of the tree; pass the same tree to every
/// [`Walker::next`] call.
#[derive(Debug, Clone)]
pub struct Walker {
    stack: Vec<NodeId>,
    last: Option<NodeId>,
    skip: bool,
}

impl Walker {
    pub(super) fn new() -> Self {
        Self {
            stack: vec![NodeId::ROOT],
            last: None,
            skip: false,
        }
    }

    /// Do not descend into the node most recently returned by [`Walker::next`].
    pub fn skip_children(&mut self) {
        self.skip = true;
    }

    /// Advance to the next changed node.
    pub fn next<U>(&mut self, tree: &PathTree<U>) -> Option<NodeId> {
        if let Some(last) = self.last.take() {
            if !self.skip {
                self.push_children(tree, last);
            }
        }
        self.skip = false;

        while let Some(id) = self.stack.pop() {
            if !tree.state(id).is_unchanged() {
                self.last = Some(id);
                return Some(id);
            }
            self.push_children(tree, id);
        }
        None
    }

    fn push_children<U>(&mut self, tree: &PathTree<U>, id: NodeId) {
        self.stack.extend(tree.children(id).iter().rev());
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn visited(tree: &PathTree, skip: Option<&str>) -> Vec<PathBuf> {
        let mut walker = tree.walk();
        let mut seen = Vec::new();
        while let Some(id) = walker.next(tree) {
            let path = tree.path_of(id);
            if skip.is_some_and(|s| path == PathBuf::from(s)) {
                walker.skip_children();
            }
            seen.push(path);
        }
        seen
    }

    #[test]
    fn visits_exactly_changed_nodes_in_preorder() {
        let mut tree: PathTree = PathTree::new();
        tree.set_ignored("/a/c/d");
        tree.set_bind_mounted("/a");
        tree.set_ignored("/a/b");

        assert_eq!(
            visited(&tree, None),
            vec![
                PathBuf::from("/a"),
                PathBuf::from("/a/c/d"),
                PathBuf::from("/a/b"),
            ]
        );

        let mut tree: PathTree = PathTree::new();
        tree.set_bind_mounted("/a");
        tree.set_ignored("/a/b");
        tree.set_ignored("/a/c/d");

        assert_eq!(
            visited(&tree, None),
            vec![
                PathBuf::from("/a"),
                PathBuf::from("/a/b"),
                PathBuf::from("/a/c/d"),
            ]
        );
    }

    #[test]
    fn skip_children_prunes_only_that_subtree() {
        let mut tree: PathTree = PathTree::new();
        tree.set_system_mount("/", "ext4", None);
        tree.set_system_mount("/proc", "proc", None);
        tree.set_system_mount("/proc/sys/fs/binfmt_misc", "binfmt_misc", None);
        tree.set_system_mount("/sys", "sysfs", None);
        tree.set_system_mount("/sys/fs/cgroup", "cgroup2", None);
        tree.set_system_mount("/home", "ext4", None);

        assert_eq!(
            visited(&tree, Some("/proc")),
            vec![
                PathBuf::from("/"),
                PathBuf::from("/proc"),
                PathBuf::from("/sys"),
                PathBuf::from("/sys/fs/cgroup"),
                PathBuf::from("/home"),
            ]
        );
    }

    #[test]
    fn skipping_root_ends_walk() {
        let mut tree: PathTree = PathTree::new();
        tree.set_system_mount("/", "ext4", None);
        tree.set_system_mount("/home", "ext4", None);
        assert_eq!(visited(&tree, Some("/")), vec![PathBuf::from("/")]);
    }

    #[test]
    fn empty_tree_yields_nothing() {
        let tree: PathTree = PathTree::new();
        assert!(tree.walk().next(&tree).is_none());
    }
}

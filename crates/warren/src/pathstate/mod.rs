//! In-memory model of a filesystem hierarchy under construction.
//!
//! A [`PathTree`] records, per path, what has been done to it while an
//! environment is being assembled: bind mounts, overlays, pass-through system
//! mounts, or explicit "ignore" decisions. Nodes live in an arena and are
//! addressed by [`NodeId`]; every node keeps its parent's handle so full paths
//! can be rebuilt without back-pointers.

mod walk;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Component, Path, PathBuf};

pub use walk::Walker;

/// Handle to a node inside one [`PathTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// The root node of every tree.
    pub const ROOT: Self = Self(0);
}

/// What has happened to a path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PathState {
    /// Nothing done yet.
    #[default]
    Unchanged,
    /// Deliberately left alone.
    Ignored,
    /// A filesystem that is passed through as a whole.
    SystemMount {
        /// Filesystem type (proc, tmpfs, ext4, ...).
        fstype: String,
        /// Mount source, when known.
        device: Option<String>,
    },
    /// Bind mounted from a layer or the host.
    BindMounted,
    /// Covered by an overlay whose upper directory is `upperdir`.
    OverlayMounted {
        /// Upper directory, if one outlives the mount.
        upperdir: Option<PathBuf>,
    },
    /// Recorded as overlaid without a real mount (profile generation).
    FakeOverlayMounted {
        /// Upper directory the overlay would use.
        upperdir: Option<PathBuf>,
    },
}

impl PathState {
    /// Whether this is the initial state.
    #[must_use]
    pub const fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }

    /// Upper directory of an overlay state.
    #[must_use]
    pub fn upperdir(&self) -> Option<&Path> {
        match self {
            Self::OverlayMounted { upperdir } | Self::FakeOverlayMounted { upperdir } => {
                upperdir.as_deref()
            }
            _ => None,
        }
    }
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unchanged => f.write_str("unchanged"),
            Self::Ignored => f.write_str("ignored"),
            Self::SystemMount { fstype, device } => match device {
                Some(device) => write!(f, "system mount {fstype} ({device})"),
                None => write!(f, "system mount {fstype}"),
            },
            Self::BindMounted => f.write_str("bind mounted"),
            Self::OverlayMounted { upperdir } => match upperdir {
                Some(upper) => write!(f, "overlay mounted, upper {}", upper.display()),
                None => f.write_str("overlay mounted"),
            },
            Self::FakeOverlayMounted { .. } => f.write_str("fake overlay mounted"),
        }
    }
}

#[derive(Debug, Clone)]
struct Node<U> {
    name: OsString,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    state: PathState,
    user_data: Option<U>,
}

impl<U> Node<U> {
    const fn new(name: OsString, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            state: PathState::Unchanged,
            user_data: None,
        }
    }
}

/// Tree of [`PathState`]s keyed by path components.
///
/// `U` is an optional per-node annotation, independent of the state.
#[derive(Debug, Clone)]
pub struct PathTree<U = ()> {
    nodes: Vec<Node<U>>,
    root_dir: PathBuf,
}

impl<U> Default for PathTree<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U> PathTree<U> {
    /// Create an empty tree whose paths are relative to `/`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_root_dir("/")
    }

    /// Create an empty tree whose paths are interpreted below `root_dir`.
    #[must_use]
    pub fn with_root_dir(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            nodes: vec![Node::new(OsString::new(), None)],
            root_dir: root_dir.into(),
        }
    }

    /// Directory the tree's paths are relative to.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Change the directory the tree's paths are relative to.
    pub fn set_root_dir(&mut self, root_dir: impl Into<PathBuf>) {
        self.root_dir = root_dir.into();
    }

    /// Find the node for `path` without creating anything.
    ///
    /// `None` means the tree holds no information about the path, which is
    /// different from a node in [`PathState::Unchanged`].
    #[must_use]
    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<NodeId> {
        components(path.as_ref()).try_fold(NodeId::ROOT, |node, name| self.child(node, name))
    }

    /// Find the node for `path`, creating it and any missing ancestors.
    pub fn lookup_or_create(&mut self, path: impl AsRef<Path>) -> NodeId {
        let mut node = NodeId::ROOT;
        for name in components(path.as_ref()) {
            node = match self.child(node, name) {
                Some(child) => child,
                None => self.add_child(node, name),
            };
        }
        node
    }

    fn child(&self, parent: NodeId, name: &OsStr) -> Option<NodeId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|child| self.nodes[child.0].name.as_os_str() == name)
    }

    fn add_child(&mut self, parent: NodeId, name: &OsStr) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name.to_owned(), Some(parent)));
        self.nodes[parent.0].children.push(id);
        id
    }

    /// State recorded for `path`, if the tree knows the path.
    #[must_use]
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&PathState> {
        self.lookup(path).map(|id| self.state(id))
    }

    /// Replace the state of `path`, creating the node if needed.
    pub fn set_state(&mut self, path: impl AsRef<Path>, state: PathState) -> NodeId {
        let id = self.lookup_or_create(path);
        self.set_node_state(id, state);
        id
    }

    /// Replace the state of an existing node.
    pub fn set_node_state(&mut self, id: NodeId, state: PathState) {
        self.nodes[id.0].state = state;
    }

    /// Reset `path` to [`PathState::Unchanged`] if the tree knows it.
    pub fn clear(&mut self, path: impl AsRef<Path>) {
        if let Some(id) = self.lookup(path) {
            self.set_node_state(id, PathState::Unchanged);
        }
    }

    /// State of a node.
    #[must_use]
    pub fn state(&self, id: NodeId) -> &PathState {
        &self.nodes[id.0].state
    }

    /// Name of a node; empty for the root.
    #[must_use]
    pub fn name(&self, id: NodeId) -> &OsStr {
        &self.nodes[id.0].name
    }

    /// Parent of a node; `None` for the root.
    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    /// Children of a node in insertion order.
    #[must_use]
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Attach an annotation to `path`, creating the node if needed.
    pub fn set_user_data(&mut self, path: impl AsRef<Path>, data: U) -> NodeId {
        let id = self.lookup_or_create(path);
        self.nodes[id.0].user_data = Some(data);
        id
    }

    /// Annotation attached to `path`.
    #[must_use]
    pub fn user_data(&self, path: impl AsRef<Path>) -> Option<&U> {
        self.lookup(path).and_then(|id| self.node_user_data(id))
    }

    /// Annotation attached to a node.
    #[must_use]
    pub fn node_user_data(&self, id: NodeId) -> Option<&U> {
        self.nodes[id.0].user_data.as_ref()
    }

    /// Rebuild the absolute path of a node; the root maps to `/`.
    #[must_use]
    pub fn path_of(&self, id: NodeId) -> PathBuf {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(node) = cursor {
            if node != NodeId::ROOT {
                names.push(self.name(node));
            }
            cursor = self.parent(node);
        }

        let mut path = PathBuf::from("/");
        path.extend(names.into_iter().rev());
        path
    }

    /// Start a pre-order walk over the nodes that are not unchanged.
    #[must_use]
    pub fn walk(&self) -> Walker {
        Walker::new()
    }

    /// All nodes that are not unchanged, in walk order.
    #[must_use]
    pub fn changed_nodes(&self) -> Vec<NodeId> {
        let mut walker = self.walk();
        std::iter::from_fn(|| walker.next(self)).collect()
    }

    /// Mark `path` as bind mounted.
    pub fn set_bind_mounted(&mut self, path: impl AsRef<Path>) -> NodeId {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "Bind mounted");
        self.set_state(path, PathState::BindMounted)
    }

    /// Mark `path` as covered by an overlay.
    pub fn set_overlay_mounted(
        &mut self,
        path: impl AsRef<Path>,
        upperdir: Option<PathBuf>,
    ) -> NodeId {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), upperdir = ?upperdir, "Overlay mounted");
        self.set_state(path, PathState::OverlayMounted { upperdir })
    }

    /// Record an overlay that exists only on paper.
    pub fn set_fake_overlay_mounted(
        &mut self,
        path: impl AsRef<Path>,
        upperdir: Option<PathBuf>,
    ) -> NodeId {
        self.set_state(path, PathState::FakeOverlayMounted { upperdir })
    }

    /// Mark `path` as a pass-through system mount.
    pub fn set_system_mount(
        &mut self,
        path: impl AsRef<Path>,
        fstype: impl Into<String>,
        device: Option<String>,
    ) -> NodeId {
        self.set_state(
            path,
            PathState::SystemMount {
                fstype: fstype.into(),
                device,
            },
        )
    }

    /// Mark `path` as ignored.
    pub fn set_ignored(&mut self, path: impl AsRef<Path>) -> NodeId {
        self.set_state(path, PathState::Ignored)
    }

    /// Render every changed node as `path: state`, one per line.
    #[must_use]
    pub fn render(&self) -> String {
        self.changed_nodes()
            .into_iter()
            .map(|id| format!("{}: {}", self.path_of(id).display(), self.state(id)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Log the tree at debug level.
    pub fn dump(&self, label: &str) {
        tracing::debug!(root = %self.root_dir.display(), "{label}");
        for id in self.changed_nodes() {
            tracing::debug!(
                path = %self.path_of(id).display(),
                state = %self.state(id),
                "  node"
            );
        }
    }
}

/// Names along `path`, with `..` resolved lexically and clamped at the root.
fn components(path: &Path) -> impl Iterator<Item = &OsStr> {
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
    names.into_iter()
}

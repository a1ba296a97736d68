//! Environments and profiles.
//!
//! An [`Environment`] is a resolved stack of layers plus the state of its
//! last setup. A [`Profile`] binds a command to an environment. Both live in
//! a [`Context`], which is built from configuration.

mod context;
mod setup;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use warren_common::{WarrenError, WarrenResult};

use crate::config::{EnvironmentConfig, LayerConfig, LayerKind, ProfileConfig};
use crate::exec;
use crate::filesystem::Mounter;
use crate::layer::{self, LayerContext};
use crate::namespace::NamespaceFd;
use crate::pathstate::PathTree;
use crate::runtime::ContainerRuntime;

pub use context::Context;
pub use setup::{AsyncSetups, SetupEvent};

/// Helper daemon serving an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDaemon {
    /// Socket the daemon listens on.
    pub socket_name: String,
    /// Process id.
    pub pid: u32,
}

/// Collaborators needed to set an environment up.
#[derive(Clone, Copy)]
pub struct SetupTools<'a> {
    /// Binary bound by `wormhole` directives.
    pub client_path: &'a Path,
    /// Resolves image layers.
    pub runtime: &'a dyn ContainerRuntime,
    /// Issues the mounts.
    pub mounter: &'a dyn Mounter,
}

impl std::fmt::Debug for SetupTools<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupTools")
            .field("client_path", &self.client_path)
            .finish_non_exhaustive()
    }
}

/// A named stack of layers and the result of setting it up.
#[derive(Debug)]
pub struct Environment {
    name: String,
    layers: Vec<LayerConfig>,
    provides: Vec<String>,
    requires: Vec<String>,
    commands: Vec<String>,
    root_directory: Option<PathBuf>,
    working_directory: PathBuf,
    nsfd: Option<NamespaceFd>,
    failed: bool,
    tree_state: Option<PathTree>,
    sub_daemon: Option<SubDaemon>,
    source: Option<PathBuf>,
}

impl Environment {
    /// An empty environment.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
            provides: Vec::new(),
            requires: Vec::new(),
            commands: Vec::new(),
            root_directory: None,
            working_directory: PathBuf::from("/"),
            nsfd: None,
            failed: false,
            tree_state: None,
            sub_daemon: None,
            source: None,
        }
    }

    /// Build from configuration with already resolved `layers`.
    pub(crate) fn from_config(config: &EnvironmentConfig, layers: Vec<LayerConfig>) -> Self {
        let mut env = Self::new(&config.name);
        env.layers = layers;
        env.provides.clone_from(&config.provides);
        env.requires.clone_from(&config.requires);
        env.commands.clone_from(&config.commands);
        env.source = Some(config.source.clone());
        env
    }

    /// A new environment stacked on the layers of `base`.
    pub fn derive(name: impl Into<String>, base: &Self) -> Self {
        let mut env = Self::new(name);
        env.layers.clone_from(&base.layers);
        env
    }

    /// Environment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved layers, bottom first. References have been spliced in.
    #[must_use]
    pub fn layers(&self) -> &[LayerConfig] {
        &self.layers
    }

    /// Append a layer.
    pub fn add_layer(&mut self, layer: LayerConfig) {
        self.layers.push(layer);
    }

    /// Capabilities provided.
    #[must_use]
    pub fn provides(&self) -> &[String] {
        &self.provides
    }

    /// Record a provided capability.
    pub fn add_provides(&mut self, capability: impl Into<String>) {
        self.provides.push(capability.into());
    }

    /// Capabilities required.
    #[must_use]
    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    /// Record a required capability.
    pub fn add_requires(&mut self, capability: impl Into<String>) {
        self.requires.push(capability.into());
    }

    /// Commands registered for this environment.
    #[must_use]
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Configuration file this environment came from.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Whether the bottom layer is a container image that replaces the root.
    #[must_use]
    pub fn is_image_based(&self) -> bool {
        self.layers
            .first()
            .is_some_and(|layer| layer.kind == LayerKind::Image)
    }

    /// Root directory; `None` is the host root.
    #[must_use]
    pub fn root_directory(&self) -> Option<&Path> {
        self.root_directory.as_deref()
    }

    /// Set the root directory.
    pub fn set_root_directory(&mut self, root: impl Into<PathBuf>) {
        let root = root.into();
        tracing::debug!(environment = %self.name, root = %root.display(), "Setting root directory");
        self.root_directory = Some(root);
    }

    /// Directory commands start in, inside the root.
    #[must_use]
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Set the working directory.
    pub fn set_working_directory(&mut self, dir: impl Into<PathBuf>) {
        self.working_directory = dir.into();
    }

    /// Whether a setup failed. Sticky.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Mark the environment as failed.
    pub fn mark_failed(&mut self) {
        if !self.failed {
            tracing::warn!(environment = %self.name, "Marking environment as failed");
        }
        self.failed = true;
    }

    /// Path state of the last setup.
    #[must_use]
    pub fn tree_state(&self) -> Option<&PathTree> {
        self.tree_state.as_ref()
    }

    /// Mutable path state of the last setup.
    pub fn tree_state_mut(&mut self) -> Option<&mut PathTree> {
        self.tree_state.as_mut()
    }

    /// Helper daemon, if one was started.
    #[must_use]
    pub fn sub_daemon(&self) -> Option<&SubDaemon> {
        self.sub_daemon.as_ref()
    }

    /// Record the helper daemon.
    pub fn set_sub_daemon(&mut self, daemon: Option<SubDaemon>) {
        self.sub_daemon = daemon;
    }

    /// Install the namespace handle, closing any previous one.
    pub fn set_namespace_fd(&mut self, fd: NamespaceFd) {
        tracing::debug!(environment = %self.name, "Installing namespace fd");
        self.nsfd = Some(fd);
    }

    /// Whether a namespace handle is installed.
    #[must_use]
    pub fn has_namespace(&self) -> bool {
        self.nsfd.is_some()
    }

    /// A duplicate of the namespace handle. The environment keeps its own.
    pub fn namespace_fd(&self) -> WarrenResult<Option<NamespaceFd>> {
        if self.failed {
            return Ok(None);
        }
        self.nsfd.as_ref().map(NamespaceFd::duplicate).transpose()
    }

    /// Apply all layers into a fresh path tree.
    ///
    /// The mount namespace must already be private. Any failure marks the
    /// environment failed.
    pub fn setup(&mut self, tools: SetupTools<'_>) -> WarrenResult<()> {
        self.apply(tools, 0)
    }

    /// Like [`setup`](Self::setup), for a root the caller already built
    /// from the bottom image. The image layer itself is skipped.
    pub fn setup_on_base(&mut self, tools: SetupTools<'_>) -> WarrenResult<()> {
        let ignored = self.base_image_directives();
        if ignored > 0 {
            tracing::warn!(
                environment = %self.name,
                count = ignored,
                "Ignoring path directives of the base image layer"
            );
        }
        let skip = usize::from(self.is_image_based());
        self.apply(tools, skip)
    }

    /// Path directives on the bottom image layer, which only [`setup`](Self::setup) applies.
    fn base_image_directives(&self) -> usize {
        match self.layers.first() {
            Some(layer) if layer.kind == LayerKind::Image => layer.paths.len(),
            _ => 0,
        }
    }

    fn apply(&mut self, tools: SetupTools<'_>, skip: usize) -> WarrenResult<()> {
        if self.failed {
            return Err(WarrenError::EnvironmentFailed {
                name: self.name.clone(),
            });
        }

        self.tree_state = None;
        let ctx = LayerContext {
            environment: &self.name,
            client_path: tools.client_path,
            runtime: tools.runtime,
            mounter: tools.mounter,
        };

        let mut root = self.root_directory.clone();
        match layer::apply_layers(&ctx, &self.layers[skip..], &mut root) {
            Ok(tree) => {
                self.root_directory = root;
                self.tree_state = Some(tree);
                tracing::info!(environment = %self.name, "Environment set up");
                Ok(())
            }
            Err(err) => {
                tracing::error!(environment = %self.name, %err, "Environment setup failed");
                self.mark_failed();
                Err(err)
            }
        }
    }

    /// A command running `argv` inside this environment's root.
    pub fn command(&self, argv: &[OsString]) -> WarrenResult<Command> {
        let (program, args) = argv.split_first().ok_or_else(|| WarrenError::Internal {
            message: format!("environment {}: empty command", self.name),
        })?;
        let mut command = exec::chrooted(
            program,
            self.root_directory.as_deref(),
            &self.working_directory,
        )?;
        command.args(args);
        Ok(command)
    }
}

/// A command bound to an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    name: String,
    command: Option<PathBuf>,
    wrapper: Option<PathBuf>,
    environment: Option<String>,
}

impl Profile {
    pub(crate) fn from_config(config: &ProfileConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            wrapper: config.wrapper.clone(),
            environment: config.environment.clone(),
        }
    }

    /// Profile name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Command run inside the environment.
    #[must_use]
    pub fn command(&self) -> Option<&Path> {
        self.command.as_deref()
    }

    /// Wrapper path that selects this profile.
    #[must_use]
    pub fn wrapper(&self) -> Option<&Path> {
        self.wrapper.as_deref()
    }

    /// Environment name; `None` means the host root.
    #[must_use]
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }
}

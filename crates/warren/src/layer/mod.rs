//! Layer interpreter.
//!
//! A layer is a directory (or container image) plus an ordered list of path
//! directives. Applying it means issuing one or more mounts per directive and
//! recording each successful mount in the environment's [`PathTree`].
//!
//! Paths recorded in the tree are logical paths, as seen from inside the
//! environment; the tree's root directory tells where they really live.
//!
//! The interpreter does not check whether a destination was already mounted;
//! mounting twice stacks a second mount on the first. Callers apply the
//! layers of an environment exactly once per fresh tree.

mod ldconfig;
mod scaffold;

use std::fs;
use std::path::{Path, PathBuf};

use warren_common::{WarrenError, WarrenResult};

use crate::config::{LayerConfig, LayerKind, MountDetails, PathAction, PathInfo};
use crate::filesystem::{Mounter, OverlayFs, util};
use crate::pathstate::PathTree;
use crate::runtime::{self, ContainerRuntime};

pub use scaffold::{Expansion, Scaffold};

/// What the interpreter needs besides the layer itself.
pub struct LayerContext<'a> {
    /// Environment name, for messages.
    pub environment: &'a str,
    /// Binary bound by `wormhole` directives.
    pub client_path: &'a Path,
    /// Resolves image layers.
    pub runtime: &'a dyn ContainerRuntime,
    /// Issues the mounts.
    pub mounter: &'a dyn Mounter,
}

impl std::fmt::Debug for LayerContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerContext")
            .field("environment", &self.environment)
            .field("client_path", &self.client_path)
            .finish_non_exhaustive()
    }
}

/// Applies directives against one scaffold.
pub struct Interpreter<'a, 'ctx> {
    ctx: &'a LayerContext<'ctx>,
    tree: &'a mut PathTree,
    scaffold: Scaffold,
}

impl<'a, 'ctx> Interpreter<'a, 'ctx> {
    /// Create an interpreter that records into `tree`.
    pub fn new(ctx: &'a LayerContext<'ctx>, tree: &'a mut PathTree, scaffold: Scaffold) -> Self {
        Self {
            ctx,
            tree,
            scaffold,
        }
    }

    /// The scaffold directives are resolved against.
    #[must_use]
    pub fn scaffold(&self) -> &Scaffold {
        &self.scaffold
    }

    /// Process one directive.
    pub fn process(&mut self, info: &PathInfo) -> WarrenResult<()> {
        tracing::debug!(
            environment = self.ctx.environment,
            action = info.action.keyword(),
            path = %info.path.display(),
            "Processing path directive"
        );

        match &info.action {
            PathAction::Hide => Err(WarrenError::NotImplemented {
                feature: format!("hiding {}", info.path.display()),
            }),
            PathAction::Bind => self.for_each_match(&info.path, Self::bind_path),
            PathAction::BindChildren => self.for_each_match(&info.path, Self::bind_children),
            PathAction::Overlay => self.for_each_match(&info.path, Self::overlay_path),
            PathAction::OverlayChildren => {
                self.for_each_match(&info.path, Self::overlay_children)
            }
            PathAction::Mount(details) => self.mount(&info.path, details),
            PathAction::Wormhole => self.bind_wormhole(&info.path),
        }
    }

    fn for_each_match(
        &mut self,
        path: &Path,
        mut func: impl FnMut(&mut Self, &Expansion) -> WarrenResult<()>,
    ) -> WarrenResult<()> {
        for expansion in self.scaffold.expand(path)? {
            func(self, &expansion)?;
        }
        Ok(())
    }

    fn note_remount(&self, logical: &Path) {
        if self.tree.get(logical).is_some_and(|state| !state.is_unchanged()) {
            tracing::debug!(
                environment = self.ctx.environment,
                path = %logical.display(),
                "Path is already mounted, stacking another mount"
            );
        }
    }

    fn bind_one(&mut self, source: &Path, dest: &Path, logical: &Path) -> WarrenResult<()> {
        self.note_remount(logical);
        self.ctx.mounter.bind(source, dest, true)?;
        self.tree.set_bind_mounted(logical);
        Ok(())
    }

    fn bind_path(&mut self, m: &Expansion) -> WarrenResult<()> {
        self.bind_one(&m.source, &m.dest, &m.logical)
    }

    fn overlay_path(&mut self, m: &Expansion) -> WarrenResult<()> {
        self.note_remount(&m.logical);

        let writable_upper = self.scaffold.source_dir().is_some() && util::is_writable(&m.source);
        let overlay = if writable_upper {
            let workdir = self
                .scaffold
                .source_path(&util::reroot(Path::new("/.work"), &m.logical));
            util::makedirs(&workdir)?;
            OverlayFs::new(vec![m.dest.clone()], &m.source, workdir, &m.dest)
        } else {
            OverlayFs::read_only(vec![m.source.clone(), m.dest.clone()], &m.dest)
        };

        self.ctx.mounter.overlay(&overlay)?;
        self.tree.set_overlay_mounted(&m.logical, Some(m.source.clone()));
        Ok(())
    }

    /// Private overlay at `dest` so that the binds below do not show through
    /// to the underlying directory. The scratch triad only lives as long as
    /// the mount setup.
    fn private_overlay(&mut self, scratch: &Path, m: &Expansion) -> WarrenResult<()> {
        let lower = scratch.join("lower");
        let upper = scratch.join("upper");
        let work = scratch.join("work");

        std::os::unix::fs::symlink(&m.dest, &lower).map_err(|e| WarrenError::fs(&lower, e))?;
        util::makedirs(&upper)?;
        util::makedirs(&work)?;

        self.ctx
            .mounter
            .overlay(&OverlayFs::new(vec![lower], upper, work, &m.dest))?;
        self.tree.set_overlay_mounted(&m.logical, None);
        Ok(())
    }

    fn bind_children(&mut self, m: &Expansion) -> WarrenResult<()> {
        let entries = read_children(&m.source)?;

        let scratch = self.ctx.mounter.scratch_dir()?;
        self.private_overlay(scratch.path(), m)?;

        let mut mounted = 0usize;
        for (name, is_dir) in entries {
            let source = m.source.join(&name);
            let dest = m.dest.join(&name);
            let logical = m.logical.join(&name);

            if fs::symlink_metadata(&dest).is_err() {
                let created = if is_dir {
                    util::makedirs(&dest)
                } else {
                    util::create_empty(&dest)
                };
                if let Err(err) = created {
                    tracing::debug!(%err, "Unable to create mount point");
                }
            }

            self.bind_one(&source, &dest, &logical)?;
            mounted += 1;
        }

        tracing::debug!(
            environment = self.ctx.environment,
            path = %m.logical.display(),
            mounted,
            "Bound directory children"
        );
        Ok(())
    }

    fn overlay_children(&mut self, m: &Expansion) -> WarrenResult<()> {
        for (name, is_dir) in read_children(&m.source)? {
            let child = Expansion {
                logical: m.logical.join(&name),
                source: m.source.join(&name),
                dest: m.dest.join(&name),
            };
            if is_dir {
                self.overlay_path(&child)?;
            } else {
                self.bind_path(&child)?;
            }
        }
        Ok(())
    }

    fn mount(&mut self, path: &Path, details: &MountDetails) -> WarrenResult<()> {
        let dest = self.scaffold.dest_path(path);
        self.note_remount(path);
        self.ctx.mounter.mount(
            &dest,
            &details.fstype,
            details.device.as_deref(),
            details.options.as_deref(),
        )?;
        self.tree.set_system_mount(path, &details.fstype, None);
        Ok(())
    }

    fn bind_wormhole(&mut self, path: &Path) -> WarrenResult<()> {
        let dest = self.scaffold.dest_path(path);
        let client = self.ctx.client_path.to_path_buf();
        self.bind_one(&client, &dest, path)
    }
}

/// Directory and regular file children of `dir`, sorted by name.
fn read_children(dir: &Path) -> WarrenResult<Vec<(std::ffi::OsString, bool)>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| WarrenError::fs(dir, e))? {
        let entry = entry.map_err(|e| WarrenError::fs(dir, e))?;
        let file_type = entry.file_type().map_err(|e| WarrenError::fs(entry.path(), e))?;
        if file_type.is_dir() || file_type.is_file() {
            children.push((entry.file_name(), file_type.is_dir()));
        }
    }
    children.sort();
    Ok(children)
}

/// Apply one resolved layer.
///
/// `root` is the environment's root directory. An image layer replaces it
/// with the image's root and must therefore come first.
pub fn apply_layer(
    ctx: &LayerContext<'_>,
    tree: &mut PathTree,
    layer: &LayerConfig,
    root: &mut Option<PathBuf>,
) -> WarrenResult<()> {
    let source_root = match (&layer.image, &layer.directory) {
        (Some(image), _) => runtime::mount_image(ctx.runtime, image)?,
        (None, Some(directory)) => directory.clone(),
        (None, None) => {
            return Err(WarrenError::layer(
                ctx.environment,
                "layer has neither a directory nor an image",
            ));
        }
    };

    let scaffold = if layer.kind == LayerKind::Image {
        if let Some(existing) = root {
            return Err(WarrenError::layer(
                ctx.environment,
                format!(
                    "cannot use an image as root, root is already {}",
                    existing.display()
                ),
            ));
        }
        *root = Some(source_root.clone());
        Scaffold::new(None, root.clone())
    } else {
        Scaffold::new(Some(source_root.clone()), root.clone())
    };

    tracing::debug!(
        environment = ctx.environment,
        source = %source_root.display(),
        dest = ?scaffold.dest_dir(),
        directives = layer.paths.len(),
        "Applying layer"
    );

    let mut interpreter = Interpreter::new(ctx, tree, scaffold);
    for info in &layer.paths {
        interpreter.process(info)?;
    }

    if layer.use_ldconfig {
        ldconfig::update_cache(&mut interpreter, &source_root)?;
    }
    Ok(())
}

/// Apply all layers of an environment into a fresh tree.
pub fn apply_layers(
    ctx: &LayerContext<'_>,
    layers: &[LayerConfig],
    root: &mut Option<PathBuf>,
) -> WarrenResult<PathTree> {
    let mut tree = PathTree::new();
    if let Some(root) = root {
        tree.set_root_dir(root.clone());
    }

    for (index, layer) in layers.iter().enumerate() {
        if index > 0 && layer.kind == LayerKind::Image {
            return Err(WarrenError::layer(
                ctx.environment,
                format!("image layer {} is not the bottom-most layer", index + 1),
            ));
        }
        apply_layer(ctx, &mut tree, layer, root)?;
        if let Some(root) = root {
            tree.set_root_dir(root.clone());
        }
    }

    tree.dump(ctx.environment);
    Ok(tree)
}

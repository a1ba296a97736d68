//! Building a writable copy of the host root ("smoke and mirrors").
//!
//! The [`Assembler`] owns an overlay directory with this layout:
//!
//! ```text
//! <overlay_dir>/
//! ├── lower/        # base root, bound only while the root overlay is mounted
//! ├── tree/         # upper of the root overlay, later the combined tree
//! ├── work/         # overlay work directory
//! ├── root/         # the new root
//! └── subtree.N/    # tree/ and work/ of the overlay over host mount N
//! ```
//!
//! After the build, [`collapse`] folds the `subtree.N/tree` directories into
//! `tree/` and [`clean`] removes everything else.

mod collapse;
mod dig;
mod provides;
mod reconcile;

use std::path::{Path, PathBuf};

use warren_common::{WarrenError, WarrenResult};

use crate::config::{Config, EnvironmentConfig, LayerConfig, LayerKind};
use crate::environment::{Environment, SetupTools};
use crate::filesystem::{Mounter, OverlayFs, util};
use crate::pathstate::PathTree;
use crate::runtime;

pub use collapse::{TRANSIENT_FILES, clean, collapse};
pub use dig::{DigOptions, DigReport, dig};
pub use provides::{PROVIDES_PATH, ProvidesFile};
pub use reconcile::{
    NO_OVERLAY_FILESYSTEMS, ReconcileAction, ReconcileOptions, SkipReason, VIRTUAL_FILESYSTEMS,
    plan_reconciliation,
};

/// Name of the combined tree below the overlay directory.
pub const TREE_DIR: &str = "tree";

/// Prefix of the per-mount overlay directories.
pub const SUBTREE_PREFIX: &str = "subtree.";

/// Environment definition written next to the combined tree.
pub const DIGGER_CONFIG: &str = ".digger.toml";

/// Builds a new root for an environment below an overlay directory.
pub struct Assembler<'a> {
    overlay_dir: PathBuf,
    bind_types: Vec<String>,
    mounter: &'a dyn Mounter,
    accessible: fn(&Path) -> bool,
}

impl std::fmt::Debug for Assembler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("overlay_dir", &self.overlay_dir)
            .field("bind_types", &self.bind_types)
            .finish_non_exhaustive()
    }
}

impl<'a> Assembler<'a> {
    /// An assembler working below `overlay_dir`.
    pub fn new(overlay_dir: impl Into<PathBuf>, mounter: &'a dyn Mounter) -> Self {
        Self {
            overlay_dir: overlay_dir.into(),
            bind_types: Vec::new(),
            mounter,
            accessible: util::is_accessible,
        }
    }

    /// Bind these filesystem types as a whole, like virtual filesystems.
    #[must_use]
    pub fn with_bind_types(mut self, bind_types: Vec<String>) -> Self {
        self.bind_types = bind_types;
        self
    }

    /// Replace the check deciding which host mount points can be entered.
    #[must_use]
    pub fn with_access_check(mut self, accessible: fn(&Path) -> bool) -> Self {
        self.accessible = accessible;
        self
    }

    /// The overlay directory.
    #[must_use]
    pub fn overlay_dir(&self) -> &Path {
        &self.overlay_dir
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.overlay_dir.join(name)
    }

    /// Create the overlay directory.
    ///
    /// An existing directory is an error unless `clean` is set, in which case
    /// it is removed first.
    pub fn prepare(&self, clean: bool) -> WarrenResult<()> {
        if self.overlay_dir.exists() {
            if !clean {
                return Err(WarrenError::fs(
                    &self.overlay_dir,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "overlay directory already exists, use --clean to remove it",
                    ),
                ));
            }
            tracing::info!(dir = %self.overlay_dir.display(), "Removing old overlay directory");
            util::remove_recursively(&self.overlay_dir)?;
        }
        util::makedirs(&self.overlay_dir)
    }

    /// Build a writable copy of the base root and set `env` up on top of it.
    ///
    /// `mounts` is the host mount table, read before anything was mounted
    /// here. The namespace must already be private. Any failure marks `env`
    /// failed.
    pub fn smoke_and_mirrors(
        &self,
        env: &mut Environment,
        mounts: &PathTree,
        tools: SetupTools<'_>,
    ) -> WarrenResult<()> {
        let result = self.assemble(env, mounts, tools);
        if let Err(err) = &result {
            tracing::error!(environment = %env.name(), %err, "Failed to assemble environment");
            env.mark_failed();
        }
        result
    }

    fn assemble(
        &self,
        env: &mut Environment,
        mounts: &PathTree,
        tools: SetupTools<'_>,
    ) -> WarrenResult<()> {
        let base_root = match env.layers().first() {
            Some(LayerConfig {
                kind: LayerKind::Image,
                image: Some(image),
                ..
            }) => runtime::mount_image(tools.runtime, image)?,
            _ => PathBuf::from("/"),
        };

        let lower = self.dir("lower");
        let upper = self.dir(TREE_DIR);
        let work = self.dir("work");
        let root = self.dir("root");
        for dir in [&lower, &upper, &work, &root] {
            util::makedirs(dir)?;
        }

        self.mounter.bind(&base_root, &lower, true)?;
        self.mounter
            .overlay(&OverlayFs::new(vec![lower.clone()], upper, work, &root))?;
        tracing::debug!(root = %root.display(), base = %base_root.display(), "Root overlay mounted");
        self.mounter.unmount(&lower)?;

        env.set_root_directory(&root);
        env.setup_on_base(tools)?;

        self.reconcile(env, mounts)
    }

    /// Give every host mount its place in the new root.
    fn reconcile(&self, env: &mut Environment, mounts: &PathTree) -> WarrenResult<()> {
        let actions = plan_reconciliation(
            mounts,
            ReconcileOptions {
                overlay_dir: &self.overlay_dir,
                bind_types: &self.bind_types,
                image_based: env.is_image_based(),
            },
            self.accessible,
        );

        for action in actions {
            match action {
                ReconcileAction::Skip { path, reason } => {
                    tracing::debug!(path = %path.display(), %reason, "Not remounting");
                }
                ReconcileAction::Bind { path, fstype } => {
                    tracing::debug!(path = %path.display(), fstype = %fstype, "Binding file system");
                    self.bind_directory(env, &path, &path)?;
                }
                ReconcileAction::Overlay { path, index } => {
                    self.overlay_mount_point(env, &path, index)?;
                }
            }
        }
        Ok(())
    }

    fn overlay_mount_point(
        &self,
        env: &mut Environment,
        path: &Path,
        index: usize,
    ) -> WarrenResult<()> {
        let subtree = self.dir(&format!("{SUBTREE_PREFIX}{index}"));
        let upper = subtree.join(TREE_DIR);
        let work = subtree.join("work");
        util::makedirs(&upper)?;
        util::makedirs(&work)?;

        let (root, tree) = root_and_tree(env)?;
        let dest = util::reroot(&root, path);
        self.mounter.overlay(&OverlayFs::new(
            vec![path.to_path_buf()],
            &upper,
            work,
            dest,
        ))?;
        tree.set_overlay_mounted(path, Some(upper));
        Ok(())
    }

    /// Bind the host directory `source` at `dest` inside the new root,
    /// creating the mount point if needed.
    pub fn bind_directory(
        &self,
        env: &mut Environment,
        source: &Path,
        dest: &Path,
    ) -> WarrenResult<()> {
        let (root, tree) = root_and_tree(env)?;
        let target = util::reroot(&root, dest);
        if !target.exists() {
            if let Err(err) = util::makedirs(&target) {
                tracing::debug!(%err, "Cannot create mount point, the bind will fail");
            }
        }

        self.mounter.bind(source, &target, true)?;
        tree.set_bind_mounted(dest);
        Ok(())
    }

    /// Bind the host file `source` at `dest` inside the new root, creating
    /// an empty file to mount over if needed.
    pub fn bind_file(&self, env: &mut Environment, source: &Path, dest: &Path) -> WarrenResult<()> {
        let (root, tree) = root_and_tree(env)?;
        let target = util::reroot(&root, dest);
        if !target.exists() {
            if let Err(err) = util::create_empty(&target) {
                tracing::debug!(%err, "Cannot create mount point, the bind will fail");
            }
        }

        self.mounter.bind(source, &target, true)?;
        tree.set_bind_mounted(dest);
        Ok(())
    }

    /// Write `<overlay_dir>/.digger.toml` describing `env` as one directory
    /// layer made of the combined tree.
    pub fn write_config(&self, env: &Environment) -> WarrenResult<PathBuf> {
        let config = Config {
            client_path: None,
            environments: vec![EnvironmentConfig {
                name: env.name().to_string(),
                provides: env.provides().to_vec(),
                requires: env.requires().to_vec(),
                commands: Vec::new(),
                layers: vec![LayerConfig::directory(TREE_DIR)],
                source: PathBuf::new(),
            }],
            profiles: Vec::new(),
        };

        let path = self.dir(DIGGER_CONFIG);
        config.write(&path)?;
        Ok(path)
    }
}

fn root_and_tree(env: &mut Environment) -> WarrenResult<(PathBuf, &mut PathTree)> {
    let name = env.name().to_string();
    let root = env
        .root_directory()
        .map(Path::to_path_buf)
        .ok_or_else(|| WarrenError::layer(&name, "no root directory has been set up"))?;
    let tree = env
        .tree_state_mut()
        .ok_or_else(|| WarrenError::layer(&name, "environment has not been set up"))?;
    Ok((root, tree))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::config::PathAction;
    use crate::filesystem::testing::RecordingMounter;
    use crate::pathstate::PathState;
    use crate::runtime::testing::FakeRuntime;

    fn host_mounts() -> PathTree {
        let mut mounts = PathTree::new();
        mounts.set_system_mount("/", "ext4", Some("/dev/sda1".to_string()));
        mounts.set_system_mount("/proc", "proc", Some("proc".to_string()));
        mounts.set_system_mount("/mnt/data", "ext4", Some("/dev/sdb1".to_string()));
        mounts.set_system_mount("/boot/efi", "vfat", Some("/dev/sda2".to_string()));
        mounts
    }

    fn tools<'a>(runtime: &'a FakeRuntime, mounter: &'a RecordingMounter) -> SetupTools<'a> {
        SetupTools {
            client_path: Path::new("/usr/bin/warren"),
            runtime,
            mounter,
        }
    }

    #[test]
    fn builds_root_and_reconciles_host_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let ov = dir.path().join("build");
        let runtime = FakeRuntime::new(dir.path());
        let mounter = RecordingMounter::new();
        let assembler = Assembler::new(&ov, &mounter).with_access_check(|_| true);
        assembler.prepare(false).unwrap();

        let mut env = Environment::new("build");
        assembler
            .smoke_and_mirrors(&mut env, &host_mounts(), tools(&runtime, &mounter))
            .unwrap();

        let ov = ov.display();
        assert_eq!(
            mounter.entries(),
            vec![
                format!("bind / {ov}/lower"),
                format!(
                    "overlay {ov}/root lowerdir={ov}/lower,upperdir={ov}/tree,workdir={ov}/work"
                ),
                format!("unmount {ov}/lower"),
                format!("bind /proc {ov}/root/proc"),
                format!(
                    "overlay {ov}/root/mnt/data lowerdir=/mnt/data,upperdir={ov}/subtree.0/tree,workdir={ov}/subtree.0/work"
                ),
            ]
        );

        assert_eq!(env.root_directory(), Some(dir.path().join("build/root").as_path()));
        let tree = env.tree_state().unwrap();
        assert_eq!(tree.get("/proc"), Some(&PathState::BindMounted));
        assert_eq!(
            tree.get("/mnt/data"),
            Some(&PathState::OverlayMounted {
                upperdir: Some(dir.path().join("build/subtree.0/tree"))
            })
        );
        assert!(dir.path().join("build/root/proc").is_dir());
    }

    #[test]
    fn layers_run_before_reconciliation() {
        let dir = tempfile::tempdir().unwrap();
        let layer = dir.path().join("layer");
        fs::create_dir_all(layer.join("opt/tool")).unwrap();
        let ov = dir.path().join("build");
        let runtime = FakeRuntime::new(dir.path());
        let mounter = RecordingMounter::new();
        let assembler = Assembler::new(&ov, &mounter).with_access_check(|_| true);
        assembler.prepare(false).unwrap();

        let mut base = LayerConfig::directory(&layer);
        base.add_path(PathAction::Bind, "/opt/tool");
        let mut env = Environment::new("build");
        env.add_layer(base);

        let mut mounts = PathTree::new();
        mounts.set_system_mount("/sys", "sysfs", None);
        assembler
            .smoke_and_mirrors(&mut env, &mounts, tools(&runtime, &mounter))
            .unwrap();

        let entries = mounter.entries();
        assert_eq!(
            entries[3],
            format!(
                "bind {} {}/root/opt/tool",
                layer.join("opt/tool").display(),
                ov.display()
            )
        );
        assert_eq!(entries[4], format!("bind /sys {}/root/sys", ov.display()));
        assert_eq!(
            env.tree_state().unwrap().render(),
            "/opt/tool: bind mounted\n/sys: bind mounted"
        );
    }

    #[test]
    fn image_based_environment_skips_plain_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let ov = dir.path().join("build");
        let runtime = FakeRuntime::new(dir.path());
        let mounter = RecordingMounter::new();
        let assembler = Assembler::new(&ov, &mounter).with_access_check(|_| true);
        assembler.prepare(false).unwrap();

        let mut env = Environment::new("build");
        env.add_layer(LayerConfig {
            kind: LayerKind::Image,
            image: Some("opensuse/leap:15.5".to_string()),
            ..LayerConfig::default()
        });
        assembler
            .smoke_and_mirrors(&mut env, &host_mounts(), tools(&runtime, &mounter))
            .unwrap();

        let entries = mounter.entries();
        let image_root = runtime::mount_image(&runtime, "opensuse/leap:15.5").unwrap();
        assert_eq!(
            entries[0],
            format!("bind {} {}/lower", image_root.display(), ov.display())
        );
        assert!(entries.iter().all(|e| !e.contains("subtree.")));
        assert!(entries.iter().any(|e| e.starts_with("bind /proc ")));
    }

    #[test_log::test]
    fn mount_failure_marks_environment_failed() {
        let dir = tempfile::tempdir().unwrap();
        let ov = dir.path().join("build");
        let runtime = FakeRuntime::new(dir.path());
        let target = ov.join("root/mnt/data");
        let mounter = RecordingMounter::failing_on(target.to_str().unwrap());
        let assembler = Assembler::new(&ov, &mounter).with_access_check(|_| true);
        assembler.prepare(false).unwrap();

        let mut env = Environment::new("build");
        let err = assembler
            .smoke_and_mirrors(&mut env, &host_mounts(), tools(&runtime, &mounter))
            .unwrap_err();
        assert!(matches!(err, WarrenError::Mount { .. }));
        assert!(env.is_failed());
    }

    #[test]
    fn prepare_refuses_existing_directory_unless_clean() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = RecordingMounter::new();
        let assembler = Assembler::new(dir.path(), &mounter);
        fs::write(dir.path().join("leftover"), "x").unwrap();

        assert!(assembler.prepare(false).is_err());
        assembler.prepare(true).unwrap();
        assert!(util::dir_is_empty(dir.path()).unwrap());
    }

    #[test]
    fn bind_file_creates_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let ov = dir.path().join("build");
        let runtime = FakeRuntime::new(dir.path());
        let mounter = RecordingMounter::new();
        let assembler = Assembler::new(&ov, &mounter).with_access_check(|_| true);
        assembler.prepare(false).unwrap();
        let mut env = Environment::new("build");
        assembler
            .smoke_and_mirrors(&mut env, &PathTree::new(), tools(&runtime, &mounter))
            .unwrap();

        let script = dir.path().join("build.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        assembler
            .bind_file(&mut env, &script, Path::new("/build.sh"))
            .unwrap();

        assert!(ov.join("root/build.sh").is_file());
        assert_eq!(
            env.tree_state().unwrap().get("/build.sh"),
            Some(&PathState::BindMounted)
        );
    }

    #[test]
    fn digger_config_names_tree_layer() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = RecordingMounter::new();
        let assembler = Assembler::new(dir.path(), &mounter);

        let mut env = Environment::new("numpy");
        env.add_provides("numpy-1.26");
        env.add_requires("python-3.11");
        let path = assembler.write_config(&env).unwrap();
        assert_eq!(path, dir.path().join(DIGGER_CONFIG));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("directory = \"tree\""), "{text}");

        let config = Config::load(&path).unwrap();
        let written = config.environment("numpy").unwrap();
        assert_eq!(written.provides, vec!["numpy-1.26"]);
        assert_eq!(written.requires, vec!["python-3.11"]);
        assert_eq!(
            written.layers[0].directory_path(),
            Some(dir.path().join("tree").as_path())
        );
    }
}

//! The digger: run a build on a writable copy of the host, keep the changes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use warren_common::{WarrenError, WarrenResult};

use super::{Assembler, ProvidesFile, TRANSIENT_FILES, clean, collapse, root_and_tree};
use crate::capability::Registry;
use crate::environment::{Context, Environment, SetupTools};
use crate::exec;
use crate::filesystem::{self, Mounter, ProcMounts, SystemMounter, util};
use crate::namespace;
use crate::runtime::ContainerRuntime;

/// Create the overlay directory and an assembler on its resolved path.
///
/// Mount points are compared against the resolved path, so a symlinked
/// ancestor of the overlay directory is still recognised as its parent.
fn prepared_assembler<'a>(
    options: &DigOptions,
    mounter: &'a dyn Mounter,
) -> WarrenResult<Assembler<'a>> {
    Assembler::new(&options.overlay_dir, mounter).prepare(options.clean)?;
    let overlay_dir = util::canonicalize(&options.overlay_dir)?;
    Ok(Assembler::new(overlay_dir, mounter).with_bind_types(options.bind_types.clone()))
}

/// Where the build directory appears inside the new root.
pub const BUILD_DIR: &str = "/build";

/// Where the build script appears inside the new root.
pub const BUILD_SCRIPT: &str = "/build.sh";

const PROMPT: &str = "(warren) # ";

/// What to dig.
#[derive(Debug, Clone, Default)]
pub struct DigOptions {
    /// Scratch directory; the combined tree ends up in its `tree/`.
    pub overlay_dir: PathBuf,
    /// Remove an existing overlay directory first.
    pub clean: bool,
    /// Use a plain mount namespace instead of a user namespace.
    pub privileged: bool,
    /// Name of the resulting environment; defaults to the overlay
    /// directory's basename.
    pub environment_name: Option<String>,
    /// Environment (name or capability) to build on.
    pub base_environment: Option<String>,
    /// Extra filesystem types to bind instead of overlaying.
    pub bind_types: Vec<String>,
    /// Host directory mounted at `/build`, also the working directory.
    pub build_directory: Option<PathBuf>,
    /// Host script mounted at `/build.sh` and run as the command.
    pub build_script: Option<PathBuf>,
    /// Command and arguments.
    pub command: Vec<OsString>,
}

impl DigOptions {
    /// Name of the environment being built.
    #[must_use]
    pub fn environment_name(&self) -> String {
        self.environment_name.clone().unwrap_or_else(|| {
            self.overlay_dir
                .file_name()
                .map_or_else(|| "digger".to_string(), |n| n.to_string_lossy().into_owned())
        })
    }

    /// The command line to run inside the new root.
    ///
    /// A build script is run with the given arguments; otherwise the command,
    /// or `$SHELL` (falling back to `/bin/sh`) if there is none.
    #[must_use]
    pub fn command_line(&self) -> Vec<OsString> {
        let mut argv = Vec::new();
        if self.build_script.is_some() {
            argv.push(OsString::from(BUILD_SCRIPT));
        }
        argv.extend(self.command.iter().cloned());

        if argv.is_empty() {
            let shell = std::env::var_os("SHELL")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| OsString::from("/bin/sh"));
            argv.push(shell);
        }
        argv
    }
}

/// Outcome of a successful dig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigReport {
    /// Environment name.
    pub environment: String,
    /// The combined tree.
    pub tree: PathBuf,
    /// The environment definition written next to it.
    pub config: PathBuf,
    /// Capabilities exported by the build.
    pub provides: Vec<String>,
}

/// Run a build and turn its changes into a new layer.
///
/// Enters a private namespace first, so the caller's process is left in it.
pub fn dig(
    options: &DigOptions,
    context: &mut Context,
    registry: &Registry,
    runtime: &dyn ContainerRuntime,
) -> WarrenResult<DigReport> {
    let mounter = SystemMounter;
    let assembler = prepared_assembler(options, &mounter)?;

    namespace::enter_private_namespace(options.privileged)?;
    filesystem::make_private(Path::new("/"))?;

    let mut env = base_environment(options, context, registry)?;
    let mounts = filesystem::snapshot(&ProcMounts::new(), None)?;

    let client_path = context.client_path();
    let tools = SetupTools {
        client_path: &client_path,
        runtime,
        mounter: &mounter,
    };
    assembler.smoke_and_mirrors(&mut env, &mounts, tools)?;

    if let Some(dir) = &options.build_directory {
        assembler.bind_directory(&mut env, dir, Path::new(BUILD_DIR))?;
        env.set_working_directory(BUILD_DIR);
    }
    if let Some(script) = &options.build_script {
        assembler.bind_file(&mut env, script, Path::new(BUILD_SCRIPT))?;
    }
    let provides = ProvidesFile::mount(&assembler, &mut env)?;

    run_build(&env, &options.command_line())?;

    let (root, tree) = root_and_tree(&mut env)?;
    mounter.unmount(&root)?;
    collapse(tree, assembler.overlay_dir())?;
    clean(tree, assembler.overlay_dir(), TRANSIENT_FILES)?;

    for capability in provides.read()? {
        env.add_provides(capability);
    }
    let config = assembler.write_config(&env)?;

    Ok(DigReport {
        environment: env.name().to_string(),
        tree: assembler.overlay_dir().join(super::TREE_DIR),
        config,
        provides: env.provides().to_vec(),
    })
}

fn base_environment(
    options: &DigOptions,
    context: &mut Context,
    registry: &Registry,
) -> WarrenResult<Environment> {
    let name = options.environment_name();
    let Some(wanted) = &options.base_environment else {
        return Ok(Environment::new(name));
    };

    let base_name = context.resolve_environment(wanted, registry)?;
    let base = context
        .environment(&base_name)
        .ok_or_else(|| WarrenError::EnvironmentNotFound {
            name: wanted.clone(),
        })?;
    tracing::info!(environment = %name, base = %base_name, "Building on top of base environment");

    let mut env = Environment::derive(name, base);
    env.add_requires(wanted.clone());
    Ok(env)
}

fn run_build(env: &Environment, argv: &[OsString]) -> WarrenResult<()> {
    let mut command = env.command(argv)?;
    command.env("PS1", PROMPT);

    let status = exec::run(&mut command)?;
    if exec::status_ok(status) {
        return Ok(());
    }
    Err(WarrenError::Command {
        command: argv
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" "),
        status: exec::describe_status(status),
    })
}

//! CLI command definitions and handlers.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, eyre};
use serde::Serialize;
use tabled::{Table, Tabled};
use warren_common::{WarrenError, WarrenPaths};

use crate::assemble::{self, DigOptions};
use crate::autoprofile::{ScanTarget, Scanner, default_rules, load_rules};
use crate::capability::{Capability, Registry};
use crate::config::{Config, LayerConfig, LayerKind};
use crate::environment::{Context, SetupTools};
use crate::exec;
use crate::filesystem::SystemMounter;
use crate::runtime;

/// Name the binary answers to; any other argv[0] runs a profile.
pub const PROGRAM: &str = "warren";

/// Warren - transient layered environments
#[derive(Parser)]
#[command(name = "warren")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (default: user and system configuration)
    #[arg(long, global = true, env = "WARREN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging; repeat for more detail
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub debug: u8,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a build on a writable copy of the host and keep its changes
    Dig {
        /// Directory receiving the overlay plumbing and the combined tree
        #[arg(short = 'O', long)]
        overlay_directory: PathBuf,

        /// Remove an existing overlay directory first
        #[arg(long)]
        clean: bool,

        /// Use a plain mount namespace instead of a user namespace
        #[arg(long)]
        privileged_namespace: bool,

        /// Name of the resulting environment (default: overlay directory name)
        #[arg(long)]
        environment_name: Option<String>,

        /// Environment or capability to build on
        #[arg(short = 'B', long)]
        base_environment: Option<String>,

        /// File system type to bind instead of overlaying (repeatable)
        #[arg(long = "bind-mount-type")]
        bind_mount_types: Vec<String>,

        /// Directory mounted at /build and used as working directory
        #[arg(long)]
        build_directory: Option<PathBuf>,

        /// Script mounted at /build.sh and run instead of a shell
        #[arg(long)]
        build_script: Option<PathBuf>,

        /// Command and arguments (default: $SHELL)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<OsString>,
    },

    /// Manage the capability registry
    Capability {
        /// Capability command.
        #[command(subcommand)]
        action: CapabilityCommand,
    },

    /// Derive an environment definition from a directory tree
    AutoProfile {
        /// Directory to scan, or the overlay directory of a dig
        root: PathBuf,

        /// Rule file replacing the built-in rules
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Name of the environment (default: from the dig, or the directory name)
        #[arg(long)]
        environment_name: Option<String>,

        /// Output file, or "auto" for environ.toml next to a dig's tree
        /// (default: stdout)
        #[arg(short, long)]
        output: Option<String>,

        /// Report stray files instead of failing on them
        #[arg(long)]
        no_stray_check: bool,
    },

    /// Run a profile's command in its environment
    Run {
        /// Profile name, or the path it was invoked as
        profile: String,

        /// Use a plain mount namespace instead of a user namespace
        #[arg(long)]
        privileged_namespace: bool,

        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },

    /// Inspect configured environments
    Env {
        /// Environment command.
        #[command(subcommand)]
        action: EnvCommand,
    },
}

/// `warren capability` commands.
#[derive(Subcommand)]
pub enum CapabilityCommand {
    /// Register the capabilities and commands of a configuration file
    Activate {
        /// Configuration file
        config: PathBuf,

        /// Capability registry directory
        #[arg(long)]
        registry_dir: Option<PathBuf>,
    },

    /// Remove the registrations of a configuration file
    Deactivate {
        /// Configuration file
        config: PathBuf,

        /// Capability registry directory
        #[arg(long)]
        registry_dir: Option<PathBuf>,
    },

    /// Remove registrations whose configuration file is gone
    Prune {
        /// Capability registry directory
        #[arg(long)]
        registry_dir: Option<PathBuf>,
    },

    /// List registered capabilities
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Table)]
        format: Format,

        /// Capability registry directory
        #[arg(long)]
        registry_dir: Option<PathBuf>,
    },
}

/// `warren env` commands.
#[derive(Subcommand)]
pub enum EnvCommand {
    /// List environments and their layers
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
}

/// Output format of listing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human readable table
    Table,
    /// JSON
    Json,
}

#[derive(Tabled)]
struct EnvironmentRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PROVIDES")]
    provides: String,
    #[tabled(rename = "REQUIRES")]
    requires: String,
    #[tabled(rename = "LAYERS")]
    layers: String,
}

#[derive(Tabled)]
struct CapabilityRow {
    #[tabled(rename = "CAPABILITY")]
    id: String,
    #[tabled(rename = "CONFIG")]
    target: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

/// What `env list --format json` prints per environment.
#[derive(Debug, Serialize)]
struct EnvironmentSummary {
    name: String,
    provides: Vec<String>,
    requires: Vec<String>,
    layers: Vec<String>,
}

impl From<&EnvironmentSummary> for EnvironmentRow {
    fn from(env: &EnvironmentSummary) -> Self {
        Self {
            name: env.name.clone(),
            provides: env.provides.join(", "),
            requires: env.requires.join(", "),
            layers: env.layers.join("\n"),
        }
    }
}

/// The profile selected by an argv[0] other than `warren`, if any.
#[must_use]
pub fn invoked_as(argv0: &OsStr) -> Option<String> {
    let name = Path::new(argv0).file_name()?.to_str()?;
    (name != PROGRAM).then(|| argv0.to_string_lossy().into_owned())
}

impl Cli {
    /// Parse the process arguments. A binary called by another name behaves
    /// as `warren run <name> ARGS...`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut args = std::env::args_os();
        let argv0 = args.next().unwrap_or_else(|| OsString::from(PROGRAM));
        match invoked_as(&argv0) {
            Some(profile) => Self::for_profile(profile, args.collect()),
            None => Self::parse(),
        }
    }

    /// A `run` invocation of `profile`.
    #[must_use]
    pub fn for_profile(profile: String, args: Vec<OsString>) -> Self {
        Self {
            config: std::env::var_os(crate::config::CONFIG_ENV).map(PathBuf::from),
            debug: 0,
            command: Commands::Run {
                profile,
                privileged_namespace: false,
                args,
            },
        }
    }

    /// Requested log verbosity: the `--debug` count, or `$WARREN_DEBUG` if
    /// that is higher.
    #[must_use]
    pub fn verbosity(&self) -> u8 {
        let from_env = std::env::var("WARREN_DEBUG")
            .ok()
            .and_then(|level| level.trim().parse::<u8>().ok())
            .unwrap_or(0);
        self.debug.max(from_env)
    }

    /// Execute the CLI command.
    pub fn execute(self) -> Result<()> {
        let paths = WarrenPaths::new();

        match self.command {
            Commands::Dig {
                overlay_directory,
                clean,
                privileged_namespace,
                environment_name,
                base_environment,
                bind_mount_types,
                build_directory,
                build_script,
                command,
            } => {
                let options = DigOptions {
                    overlay_dir: std::path::absolute(&overlay_directory)?,
                    clean,
                    privileged: privileged_namespace,
                    environment_name,
                    base_environment,
                    bind_types: bind_mount_types,
                    build_directory: build_directory
                        .map(std::path::absolute)
                        .transpose()?,
                    build_script: build_script.map(std::path::absolute).transpose()?,
                    command,
                };

                let config = Config::discover(self.config.as_deref(), &paths)?;
                let mut context = Context::from_config(&config)?;
                let registry = Registry::capabilities(&paths);
                let runtime = runtime::select_runtime("default")?;

                let report = assemble::dig(&options, &mut context, &registry, runtime.as_ref())?;
                println!("Combined overlay tree is now in {}", report.tree.display());
                if !report.provides.is_empty() {
                    println!("Provides: {}", report.provides.join(", "));
                }
                Ok(())
            }

            Commands::Capability { action } => capability(action, &paths),

            Commands::AutoProfile {
                root,
                rules,
                environment_name,
                output,
                no_stray_check,
            } => {
                let target = ScanTarget::locate(&root)?;
                let rules = rules
                    .as_deref()
                    .map(load_rules)
                    .transpose()?
                    .unwrap_or_else(default_rules);
                let report = Scanner::new(rules)
                    .check_strays(!no_stray_check)
                    .scan(&target.tree)?;
                if report.stray_count > 0 {
                    eprintln!("Ignoring {} stray files", report.stray_count);
                }

                let name = target.environment_name(environment_name.as_deref());
                let config = Config {
                    environments: vec![target.environment(name, &report)],
                    ..Config::default()
                };

                match output.as_deref() {
                    None => print!("{}", toml::to_string_pretty(&config)?),
                    Some(output) => {
                        let path = if output == "auto" {
                            target.auto_output().ok_or_else(|| {
                                eyre!(
                                    "--output auto needs a dig's overlay directory, {} is not one",
                                    target.root.display()
                                )
                            })?
                        } else {
                            PathBuf::from(output)
                        };
                        config.write(&path)?;
                        println!("Wrote {}", path.display());
                    }
                }
                Ok(())
            }

            Commands::Run {
                profile,
                privileged_namespace,
                args,
            } => {
                let config = Config::discover(self.config.as_deref(), &paths)?;
                run_profile(&config, &profile, privileged_namespace, args)
            }

            Commands::Env {
                action: EnvCommand::List { format },
            } => {
                let config = Config::discover(self.config.as_deref(), &paths)?;
                let context = Context::from_config(&config)?;
                let summaries = context
                    .environments()
                    .iter()
                    .map(|env| EnvironmentSummary {
                        name: env.name().to_string(),
                        provides: env.provides().to_vec(),
                        requires: env.requires().to_vec(),
                        layers: env.layers().iter().map(describe_layer).collect(),
                    })
                    .collect::<Vec<_>>();

                match format {
                    Format::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
                    Format::Table => {
                        let rows = summaries.iter().map(EnvironmentRow::from);
                        println!("{}", Table::new(rows));
                    }
                }
                Ok(())
            }
        }
    }
}

fn capability(action: CapabilityCommand, paths: &WarrenPaths) -> Result<()> {
    let registry_for =
        |dir: Option<PathBuf>| dir.map_or_else(|| Registry::capabilities(paths), Registry::new);
    let commands = Registry::commands(paths);

    match action {
        CapabilityCommand::Activate {
            config: path,
            registry_dir,
        } => {
            let registry = registry_for(registry_dir);
            let config = Config::load(&path)?;
            for env in &config.environments {
                for id in &env.provides {
                    Capability::parse(id)?;
                }
            }

            let mut capabilities = 0;
            let mut programs = 0;
            for env in &config.environments {
                capabilities += registry.register(&env.provides, &path)?;
                programs += commands.register(&env.commands, &path)?;
            }
            println!(
                "Activated {}: {capabilities} capabilities, {programs} commands",
                path.display()
            );
            Ok(())
        }

        CapabilityCommand::Deactivate {
            config: path,
            registry_dir,
        } => {
            let registry = registry_for(registry_dir);
            let config = Config::load(&path)?;

            let mut removed = 0;
            for env in &config.environments {
                removed += registry.unregister(&env.provides, &path)?;
                removed += commands.unregister(&env.commands, &path)?;
            }
            println!("Deactivated {}: removed {removed} links", path.display());
            Ok(())
        }

        CapabilityCommand::Prune { registry_dir } => {
            let removed = registry_for(registry_dir).gc()? + commands.gc()?;
            println!("Removed {removed} stale links");
            Ok(())
        }

        CapabilityCommand::List {
            format,
            registry_dir,
        } => {
            let entries = registry_for(registry_dir).list()?;
            match format {
                Format::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                Format::Table => {
                    let rows = entries.iter().map(|entry| CapabilityRow {
                        id: entry.id.clone(),
                        target: entry.target.display().to_string(),
                        status: if entry.dangling { "dangling" } else { "ok" }.to_string(),
                    });
                    println!("{}", Table::new(rows));
                }
            }
            Ok(())
        }
    }
}

/// Set up the environment of `wanted` and replace this process with the
/// profile's command.
fn run_profile(
    config: &Config,
    wanted: &str,
    privileged: bool,
    args: Vec<OsString>,
) -> Result<()> {
    let mut context = Context::from_config(config)?;
    let profile = context
        .find_profile(wanted)
        .ok_or_else(|| WarrenError::ProfileNotFound {
            name: wanted.to_string(),
        })?;
    let name = profile.name().to_string();
    let program = profile
        .command()
        .map(Path::to_path_buf)
        .or_else(|| exec::find_command(&name))
        .ok_or_else(|| eyre!("profile {name}: no command configured and none found in $PATH"))?;

    let mut argv = vec![program.into_os_string()];
    argv.extend(args);

    let client_path = context.client_path();
    let runtime = runtime::select_runtime("default")?;
    let tools = SetupTools {
        client_path: &client_path,
        runtime: runtime.as_ref(),
        mounter: &SystemMounter,
    };

    let mut command = match context.setup_profile(&name, privileged, tools)? {
        Some(env) => env.command(&argv)?,
        None => {
            let mut command = Command::new(&argv[0]);
            command.args(&argv[1..]);
            command
        }
    };
    Err(exec::exec(&mut command).into())
}

/// One-line description of a resolved layer.
fn describe_layer(layer: &LayerConfig) -> String {
    match (layer.kind, &layer.directory, &layer.image) {
        (LayerKind::Image, _, Some(image)) => format!("image {image} (root)"),
        (_, _, Some(image)) => format!("image {image}"),
        (_, Some(dir), _) => dir.display().to_string(),
        _ => layer
            .reference
            .as_deref()
            .map_or_else(|| "?".to_string(), |name| format!("reference {name}")),
    }
}

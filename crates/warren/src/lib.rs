//! # Warren
//!
//! Warren runs commands inside transient environments: private mount
//! namespaces whose root is the host root with layers of directories,
//! container images and tmpfs mounts overlaid on top of it.
//!
//! ## Features
//!
//! - **Layered environments**: declarative layers applied with overlayfs and
//!   bind mounts, tracked in a [path-state tree](pathstate::PathTree)
//! - **Capabilities**: environments find each other through a registry of
//!   versioned capability ids
//! - **Digger**: build software on a writable copy of the host and keep the
//!   changes as a new layer
//! - **Auto-profile**: derive a layer definition from a directory tree
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//!
//! use warren::config::Config;
//! use warren::environment::{Context, SetupTools};
//! use warren::filesystem::SystemMounter;
//! use warren::runtime::Podman;
//!
//! # fn example() -> warren_common::WarrenResult<()> {
//! let config = Config::load(Path::new("/etc/warren/warren.toml"))?;
//! let mut context = Context::from_config(&config)?;
//!
//! let client_path = context.client_path();
//! let tools = SetupTools {
//!     client_path: &client_path,
//!     runtime: &Podman::default(),
//!     mounter: &SystemMounter,
//! };
//! context.setup_profile("python3", false, tools)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod assemble;
pub mod autoprofile;
pub mod capability;
pub mod cli;
pub mod config;
pub mod environment;
pub mod exec;
pub mod filesystem;
pub mod layer;
pub mod namespace;
pub mod pathstate;
pub mod runtime;

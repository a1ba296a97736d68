//! Common error types for warren.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`WarrenError`].
pub type WarrenResult<T> = Result<T, WarrenError>;

/// Number of stray paths carried in a [`WarrenError::StrayFiles`] report.
pub const MAX_REPORTED_STRAYS: usize = 100;

/// Errors raised while configuring, assembling or scanning environments.
#[derive(Error, Diagnostic, Debug)]
pub enum WarrenError {
    /// Configuration file is malformed or inconsistent.
    #[error("{}: {message}", path.display())]
    #[diagnostic(code(warren::config))]
    Config {
        /// File the problem was found in.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// No environment with this name is configured.
    #[error("Environment not found: {name}")]
    #[diagnostic(code(warren::environment::not_found))]
    EnvironmentNotFound {
        /// Requested environment name or capability.
        name: String,
    },

    /// No profile with this name is configured.
    #[error("Profile not found: {name}")]
    #[diagnostic(
        code(warren::profile::not_found),
        help("Profiles are looked up by wrapper path, command path, then basename")
    )]
    ProfileNotFound {
        /// Requested profile name.
        name: String,
    },

    /// A previous setup of the environment failed.
    #[error("Environment {name} failed to set up earlier")]
    #[diagnostic(code(warren::environment::failed))]
    EnvironmentFailed {
        /// Environment name.
        name: String,
    },

    /// A setup of this environment is already running.
    #[error("Setup of environment {name} is already in progress")]
    #[diagnostic(code(warren::environment::busy))]
    SetupInProgress {
        /// Environment name.
        name: String,
    },

    /// A mount, unmount or propagation change failed.
    #[error("Cannot {operation} {}: {source}", target.display())]
    #[diagnostic(code(warren::mount))]
    Mount {
        /// Operation that was attempted ("bind mount", "mount overlay", ...).
        operation: &'static str,
        /// Path the operation was applied to.
        target: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A filesystem operation on a specific path failed.
    #[error("{}: {source}", path.display())]
    #[diagnostic(code(warren::filesystem))]
    Filesystem {
        /// Offending path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(warren::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(warren::serialization))]
    Serialization(String),

    /// A directive kind that is recognised but has no implementation.
    #[error("{feature} is not implemented")]
    #[diagnostic(code(warren::not_implemented))]
    NotImplemented {
        /// The directive or feature.
        feature: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(warren::unsupported),
        help("Mount namespaces and overlayfs require Linux")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// A capability id could not be parsed.
    #[error("Invalid capability \"{id}\": {reason}")]
    #[diagnostic(
        code(warren::capability::invalid),
        help("Capabilities look like name-1.2.3")
    )]
    InvalidCapability {
        /// The offending id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A capability is already registered for a different target.
    #[error("Capability {id} is already provided by {}", existing.display())]
    #[diagnostic(
        code(warren::capability::conflict),
        help("Deactivate the other configuration first")
    )]
    CapabilityConflict {
        /// The conflicting id.
        id: String,
        /// Target of the existing registration.
        existing: PathBuf,
    },

    /// A directory scan found files no rule accounted for.
    #[error("Found {count} stray files")]
    #[diagnostic(
        code(warren::autoprofile::strays),
        help("Add rules covering these paths, or disable the stray check")
    )]
    StrayFiles {
        /// Total number of stray entries.
        count: usize,
        /// The first stray paths, at most [`MAX_REPORTED_STRAYS`].
        paths: Vec<PathBuf>,
    },

    /// A directory scan hit something its rules do not allow.
    #[error("{}: {message}", path.display())]
    #[diagnostic(code(warren::autoprofile::scan))]
    Scan {
        /// Directory being scanned, or the offending path below it.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A layer cannot be applied to its environment.
    #[error("Environment {environment}: {message}")]
    #[diagnostic(code(warren::layer))]
    Layer {
        /// Environment being set up.
        environment: String,
        /// What is wrong with the layer.
        message: String,
    },

    /// The container runtime could not provide an image.
    #[error("Container runtime: {message}")]
    #[diagnostic(code(warren::container))]
    Container {
        /// The error message.
        message: String,
    },

    /// A helper command did not complete successfully.
    #[error("{command} {status}")]
    #[diagnostic(code(warren::command))]
    Command {
        /// The command that was run.
        command: String,
        /// Human readable exit status.
        status: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(warren::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl WarrenError {
    /// Build a [`WarrenError::Mount`] from a rustix or std error.
    pub fn mount(
        operation: &'static str,
        target: impl Into<PathBuf>,
        source: impl Into<std::io::Error>,
    ) -> Self {
        Self::Mount {
            operation,
            target: target.into(),
            source: source.into(),
        }
    }

    /// Build a [`WarrenError::Filesystem`] for `path`.
    pub fn fs(path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        Self::Filesystem {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Build a [`WarrenError::Config`] for `path`.
    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a [`WarrenError::Layer`].
    pub fn layer(environment: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Layer {
            environment: environment.into(),
            message: message.into(),
        }
    }

    /// Build a [`WarrenError::Scan`].
    pub fn scan(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Scan {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a [`WarrenError::StrayFiles`], keeping the first
    /// [`MAX_REPORTED_STRAYS`] paths.
    #[must_use]
    pub fn stray_files(mut paths: Vec<PathBuf>) -> Self {
        let count = paths.len();
        paths.truncate(MAX_REPORTED_STRAYS);
        Self::StrayFiles { count, paths }
    }
}

impl From<serde_json::Error> for WarrenError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for WarrenError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

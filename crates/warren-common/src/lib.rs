//! # warren-common
//!
//! Shared types for the warren environment builder:
//! - The common error type and result alias
//! - Standard filesystem locations (configuration, registries, client binary)

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{WarrenError, WarrenResult};
pub use paths::WarrenPaths;

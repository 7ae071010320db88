//! Error types for interp-pool operations.
//!
//! Only construction and lifecycle problems surface as errors. Protocol-level
//! problems (empty scripts, correlation mismatches, dead workers) are logged
//! and absorbed by the dispatcher instead, see [`crate::pool`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while building or driving a worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Interpreter binary '{}' does not exist", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn instance {index} ({binary}): {source}")]
    Spawn {
        index: usize,
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Pool is already running")]
    AlreadyRunning,

    #[error("Pool is not running")]
    NotRunning,

    #[error("{pending} instance(s) did not complete the handshake within {timeout:?}")]
    HandshakeTimeout { pending: usize, timeout: Duration },

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("Job {0} was abandoned before completing")]
    JobAbandoned(String),
}

/// Errors that can occur while loading pool configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

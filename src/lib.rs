//! interp-pool: a pool of long-lived interpreter processes.
//!
//! Scripts are dispatched to idle instances over stdin and their output is
//! correlated back to the submitting job through markers the pool wraps
//! around every script. See [`pool`] for the protocol and architecture.

pub mod cli;
pub mod error;
pub mod pool;

// Re-export commonly used types
pub use error::{ConfigError, PoolError};
pub use pool::{DialectKind, Job, JobOutput, PoolConfig, PoolStats, WorkerPool};

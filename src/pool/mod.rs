//! Concurrent pool of long-lived interpreter processes.
//!
//! Scripts are written to an interpreter's stdin wrapped in an envelope that
//! prints `begin:<token>`, `error:<token>` and `end:<token>` markers around
//! the script's own output. The pool scans each instance's stdout for those
//! markers to attribute output to jobs and to detect completion.
//!
//! - **WorkerPool**: public handle (start, stop, run, init, eval, broadcast)
//! - **Dispatcher**: task owning instances, queue and correlation state
//! - **Instance**: one child process with its stdin writer and output watcher
//! - **MarkerScanner**: incremental marker lexer over stdout chunks
//! - **Dialect**: how a given interpreter is launched and how scripts are wrapped
//!
//! # Architecture
//!
//! ```text
//!      run / init / eval / broadcast
//!                  │
//!           ┌──────▼───────┐
//!           │  WorkerPool  │── stats (atomics) ──▶ ready(), stats()
//!           └──────┬───────┘
//!                  │ commands
//!           ┌──────▼───────┐       ┌──────────┐
//!           │  Dispatcher  │◀─────▶│ JobQueue │
//!           └──┬────▲──────┘       └──────────┘
//!      envelope│    │stdout / stderr / exit events
//!         ┌────▼────┴─┐   ┌───────────┐   ┌───────────┐
//!         │ Instance 0│   │ Instance 1│   │ Instance N│
//!         └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use interp_pool::pool::WorkerPool;
//!
//! # async fn demo() -> Result<(), interp_pool::error::PoolError> {
//! let mut pool = WorkerPool::new("/usr/bin/R", Some(4))?;
//! pool.start().await?;
//!
//! pool.broadcast("library(stats)").await?;
//! let output = pool.eval("print(1 + 1)").await?;
//! assert_eq!(output.log, "[1] 2\n");
//!
//! pool.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod dispatcher;
pub mod dialect;
mod instance;
pub mod job;
pub mod queue;
pub mod scanner;
pub mod token;
pub mod worker_pool;

pub use config::PoolConfig;
pub use dialect::{Dialect, DialectKind, RDialect, ShDialect};
pub use job::{BroadcastCallback, Job, JobCallback, JobOutput};
pub use queue::JobQueue;
pub use scanner::{Marker, MarkerKind, MarkerScanner, ScanEvent};
pub use token::Token;
pub use worker_pool::{PoolStats, WorkerPool};

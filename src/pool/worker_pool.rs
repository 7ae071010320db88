//! Pool of long-lived interpreter processes.
//!
//! [`WorkerPool`] is a thin handle: it spawns the instances, hands them to a
//! dispatcher task and then talks to that task over a command channel. The
//! dispatcher owns all mutable state; the handle only sees a snapshot of the
//! counters through [`SharedPoolStats`].
//!
//! # Features
//!
//! - Fire-and-forget submission with optional callbacks (`run`, `init`)
//! - Awaitable submission (`eval`, `broadcast`)
//! - First-fit dispatch with an unbounded FIFO overflow queue
//! - Readiness handshake with an optional timeout
//! - Hard stop that kills every process and reaps it

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;

use super::config::PoolConfig;
use super::dispatcher::{Command, Dispatcher};
use super::instance::Instance;
use super::job::{BroadcastCallback, Job, JobCallback, JobOutput};

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of instances the pool was started with.
    pub instances: usize,
    /// Instances that completed the handshake and are still alive.
    pub ready: usize,
    /// Instances currently running a job.
    pub busy: usize,
    /// Jobs waiting for an idle instance.
    pub queued: usize,
    /// Jobs accepted since start, broadcast legs included.
    pub accepted: u64,
    /// Jobs whose end marker was observed.
    pub completed: u64,
}

impl PoolStats {
    /// Accepted jobs that have neither completed nor been queued: running,
    /// or lost with their instance.
    pub fn in_flight(&self) -> u64 {
        self.accepted
            .saturating_sub(self.completed)
            .saturating_sub(self.queued as u64)
    }
}

/// Counters written by the dispatcher and read by the handle.
pub(crate) struct SharedPoolStats {
    instances: AtomicUsize,
    ready: AtomicUsize,
    busy: AtomicUsize,
    queued: AtomicUsize,
    accepted: AtomicU64,
    completed: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn new() -> Self {
        Self {
            instances: AtomicUsize::new(0),
            ready: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub(crate) fn publish(&self, stats: &PoolStats) {
        self.instances.store(stats.instances, Ordering::SeqCst);
        self.ready.store(stats.ready, Ordering::SeqCst);
        self.busy.store(stats.busy, Ordering::SeqCst);
        self.queued.store(stats.queued, Ordering::SeqCst);
        self.accepted.store(stats.accepted, Ordering::SeqCst);
        self.completed.store(stats.completed, Ordering::SeqCst);
    }

    pub(crate) fn ready(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            instances: self.instances.load(Ordering::SeqCst),
            ready: self.ready.load(Ordering::SeqCst),
            busy: self.busy.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            accepted: self.accepted.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
        }
    }
}

/// Handle to a pool of interpreter instances.
pub struct WorkerPool {
    config: PoolConfig,
    commands: Option<mpsc::UnboundedSender<Command>>,
    dispatcher: Option<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a pool for `binary` with `parallelism` instances.
    ///
    /// `None` or zero selects the host's core count.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::BinaryNotFound` if `binary` does not exist.
    pub fn new(binary: impl AsRef<Path>, parallelism: Option<usize>) -> Result<Self, PoolError> {
        let config = PoolConfig::new(binary.as_ref()).with_parallelism(parallelism.unwrap_or(0));
        Self::with_config(config)
    }

    /// Creates a pool from a full configuration.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` if the configuration is invalid, or
    /// `PoolError::BinaryNotFound` if the binary does not exist.
    pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        if !config.binary.exists() {
            return Err(PoolError::BinaryNotFound(config.binary.clone()));
        }

        Ok(Self {
            config,
            commands: None,
            dispatcher: None,
            stats: Arc::new(SharedPoolStats::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn binary(&self) -> &Path {
        &self.config.binary
    }

    pub fn parallelism(&self) -> usize {
        self.config.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.commands.is_some()
    }

    /// Number of instances that completed the handshake and are alive.
    pub fn ready(&self) -> usize {
        self.stats.ready()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Spawns every instance and waits for all of them to complete the
    /// readiness handshake.
    ///
    /// # Errors
    ///
    /// - `PoolError::AlreadyRunning` if the pool was already started
    /// - `PoolError::Spawn` if a process cannot be started
    /// - `PoolError::HandshakeTimeout` if the configured timeout elapses
    ///
    /// Without a handshake timeout, an instance that exits before it is
    /// ready makes this wait forever. On any error the instances spawned so
    /// far are killed.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running() {
            return Err(PoolError::AlreadyRunning);
        }

        let parallelism = self.config.parallelism;
        info!(
            instances = parallelism,
            binary = %self.config.binary.display(),
            dialect = %self.config.dialect,
            "Starting interpreter pool"
        );

        let dialect = self.config.dialect.dialect();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut instances = Vec::with_capacity(parallelism);

        for index in 0..parallelism {
            match Instance::spawn(index, &self.config, dialect.as_ref(), event_tx.clone()) {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    error!(instance = index, error = %e, "Failed to spawn interpreter");
                    for mut instance in instances {
                        let _ = instance.kill();
                    }
                    return Err(e);
                }
            }
        }
        drop(event_tx);

        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            self.config.binary.clone(),
            dialect,
            instances,
            ready_tx,
            Arc::clone(&self.stats),
        );

        self.dispatcher = Some(tokio::spawn(dispatcher.run(command_rx, event_rx)));
        self.commands = Some(command_tx);

        let handshake = match self.config.handshake_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, ready_rx).await {
                Ok(reply) => reply.unwrap_or(Err(PoolError::NotRunning)),
                Err(_) => Err(PoolError::HandshakeTimeout {
                    pending: parallelism.saturating_sub(self.ready()),
                    timeout,
                }),
            },
            None => ready_rx.await.unwrap_or(Err(PoolError::NotRunning)),
        };

        if let Err(e) = handshake {
            error!(error = %e, "Interpreter pool failed to start");
            if let Err(stop_err) = self.stop().await {
                debug!(error = %stop_err, "Cleanup after failed start");
            }
            return Err(e);
        }

        info!(instances = parallelism, "Interpreter pool ready");
        Ok(())
    }

    /// Kills every instance, discards queued and in-flight jobs, and waits
    /// for the processes to be reaped.
    ///
    /// Callbacks of discarded jobs are never invoked.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if the pool is not running.
    pub async fn stop(&mut self) -> Result<(), PoolError> {
        let commands = self.commands.take().ok_or(PoolError::NotRunning)?;
        info!("Stopping interpreter pool");

        let (reply_tx, reply_rx) = oneshot::channel();
        let watchers = if commands.send(Command::Stop { reply: reply_tx }).is_ok() {
            reply_rx.await.unwrap_or_default()
        } else {
            warn!("Dispatcher already gone");
            Vec::new()
        };

        for result in join_all(watchers).await {
            if let Err(e) = result {
                error!(error = %e, "Instance watcher panicked");
            }
        }

        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "Dispatcher task panicked");
            }
        }

        info!("Interpreter pool stopped");
        Ok(())
    }

    /// Submits `script` for evaluation on any instance.
    ///
    /// Empty scripts are rejected with a warning. The callback, if any,
    /// receives the job's output once its end marker is seen; it is never
    /// called for a job that is dropped or abandoned.
    pub fn run(&self, script: impl Into<String>, callback: Option<JobCallback>) {
        let script = script.into();
        if script.is_empty() {
            warn!("Refusing to run an empty script");
            return;
        }
        self.execute(Job::new(script).with_boxed_callback(callback));
    }

    /// Submits a prepared job.
    ///
    /// The dispatcher drops the job with a warning when no instance is ready.
    pub fn execute(&self, job: Job) {
        self.send(Command::Execute(job));
    }

    /// Runs `script` once on every live instance. The callback fires once
    /// all of them have finished.
    ///
    /// Busy instances run the script right after their current job.
    pub fn init(&self, script: impl Into<String>, callback: Option<BroadcastCallback>) {
        let script = script.into();
        if script.is_empty() {
            warn!("Refusing to broadcast an empty script");
            return;
        }
        self.send(Command::Broadcast { script, callback });
    }

    /// Evaluates `script` and waits for its output.
    ///
    /// # Errors
    ///
    /// - `PoolError::InvalidScript` for an empty script
    /// - `PoolError::NotRunning` if the pool is not running
    /// - `PoolError::JobAbandoned` if the job was dropped before completing
    pub async fn eval(&self, script: impl Into<String>) -> Result<JobOutput, PoolError> {
        let script = script.into();
        if script.is_empty() {
            return Err(PoolError::InvalidScript("script is empty".to_string()));
        }
        let commands = self.commands.as_ref().ok_or(PoolError::NotRunning)?;

        let (tx, rx) = oneshot::channel();
        let job = Job::new(script).with_callback(move |output| {
            let _ = tx.send(output);
        });
        let token = job.token;

        commands
            .send(Command::Execute(job))
            .map_err(|_| PoolError::NotRunning)?;
        rx.await.map_err(|_| PoolError::JobAbandoned(token.to_string()))
    }

    /// Runs `script` on every live instance and waits for all outputs,
    /// ordered by instance index.
    ///
    /// # Errors
    ///
    /// Same as [`eval`](Self::eval); a broadcast is abandoned as soon as one
    /// of its instances dies.
    pub async fn broadcast(&self, script: impl Into<String>) -> Result<Vec<JobOutput>, PoolError> {
        let script = script.into();
        if script.is_empty() {
            return Err(PoolError::InvalidScript("script is empty".to_string()));
        }
        let commands = self.commands.as_ref().ok_or(PoolError::NotRunning)?;

        let (tx, rx) = oneshot::channel();
        let callback: BroadcastCallback = Box::new(move |outputs| {
            let _ = tx.send(outputs);
        });

        commands
            .send(Command::Broadcast {
                script,
                callback: Some(callback),
            })
            .map_err(|_| PoolError::NotRunning)?;
        rx.await
            .map_err(|_| PoolError::JobAbandoned("broadcast".to_string()))
    }

    fn send(&self, command: Command) {
        match &self.commands {
            Some(commands) => {
                if commands.send(command).is_err() {
                    warn!("Dispatcher is gone, dropping request");
                }
            }
            None => warn!("Pool is not running, dropping request"),
        }
    }
}

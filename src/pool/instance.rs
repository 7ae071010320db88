//! One interpreter child process and the tasks that drive its pipes.
//!
//! Each instance owns two background tasks:
//!
//! - a **writer** that drains a line channel into the child's stdin
//! - a **watcher** that owns the `Child`, forwards stdout/stderr chunks to the
//!   dispatcher as [`InstanceEvent`]s, honours kill requests and reports the
//!   exit status last
//!
//! Both output streams are read by the same watcher task, stderr first, so
//! an error message written before a job's end marker reaches the dispatcher
//! before that marker does.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::PoolError;

use super::config::PoolConfig;
use super::dialect::Dialect;
use super::job::Job;
use super::scanner::{MarkerScanner, Utf8Decoder};
use super::token::Token;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Something that happened on an instance's pipes.
#[derive(Debug)]
pub(crate) enum InstanceEvent {
    Stdout { index: usize, chunk: Vec<u8> },
    Stderr { index: usize, chunk: Vec<u8> },
    Exited { index: usize, code: Option<i32> },
}

/// Lifecycle of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceState {
    /// Spawned, handshake not yet observed.
    Starting,
    /// Handshake observed; accepts jobs.
    Ready,
    /// The process is gone. Never leaves this state.
    Exited,
}

/// Handles to a live child process.
struct Process {
    pid: Option<u32>,
    lines: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
    watcher: JoinHandle<()>,
}

/// Dispatcher-side view of one interpreter.
pub(crate) struct Instance {
    pub(crate) index: usize,
    pub(crate) state: InstanceState,
    /// Token of the readiness handshake, cleared once it is observed.
    pub(crate) handshake: Option<Token>,
    /// The job currently running here. At most one.
    pub(crate) job: Option<Job>,
    /// Broadcast jobs aimed at this instance while it was busy.
    pub(crate) pinned: VecDeque<Job>,
    pub(crate) scanner: MarkerScanner,
    pub(crate) stderr: Utf8Decoder,
    process: Option<Process>,
}

impl Instance {
    /// Spawns the interpreter and sends it the handshake command.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Spawn` if the process cannot be started.
    pub(crate) fn spawn(
        index: usize,
        config: &PoolConfig,
        dialect: &dyn Dialect,
        events: mpsc::UnboundedSender<InstanceEvent>,
    ) -> Result<Self, PoolError> {
        let spawn_error = |source: std::io::Error| PoolError::Spawn {
            index,
            binary: config.binary.display().to_string(),
            source,
        };

        let mut child = Command::new(&config.binary)
            .args(config.launch_args())
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let pid = child.id();
        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(spawn_error(std::io::Error::other(
                    "child pipes were not captured",
                )))
            }
        };

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_lines(index, stdin, line_rx));
        let watcher = tokio::spawn(watch_process(index, child, stdout, stderr, kill_rx, events));

        let handshake = Token::new();
        // The writer task is alive at this point, the send cannot fail.
        let _ = line_tx.send(dialect.ready_command(&handshake));

        debug!(
            instance = index,
            pid = ?pid,
            binary = %config.binary.display(),
            dialect = dialect.name(),
            "Spawned interpreter"
        );

        Ok(Self {
            index,
            state: InstanceState::Starting,
            handshake: Some(handshake),
            job: None,
            pinned: VecDeque::new(),
            scanner: MarkerScanner::new(),
            stderr: Utf8Decoder::new(),
            process: Some(Process {
                pid,
                lines: line_tx,
                kill: Some(kill_tx),
                watcher,
            }),
        })
    }

    /// An instance with no process behind it, for driving the dispatcher
    /// from tests.
    #[cfg(test)]
    pub(crate) fn detached(index: usize) -> Self {
        Self {
            index,
            state: InstanceState::Starting,
            handshake: Some(Token::new()),
            job: None,
            pinned: VecDeque::new(),
            scanner: MarkerScanner::new(),
            stderr: Utf8Decoder::new(),
            process: None,
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == InstanceState::Ready
    }

    /// Ready and not running a job.
    pub(crate) fn is_idle(&self) -> bool {
        self.is_ready() && self.job.is_none()
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state != InstanceState::Exited
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid)
    }

    /// Queues one line for the child's stdin.
    ///
    /// Returns `false` if the instance has no live writer.
    pub(crate) fn send_line(&self, line: String) -> bool {
        match &self.process {
            Some(process) => process.lines.send(line).is_ok(),
            None => false,
        }
    }

    /// Requests termination and returns the watcher handle to await.
    ///
    /// The instance is no longer ready afterwards.
    pub(crate) fn kill(&mut self) -> Option<JoinHandle<()>> {
        self.state = InstanceState::Exited;
        self.handshake = None;
        let mut process = self.process.take()?;
        if let Some(kill) = process.kill.take() {
            let _ = kill.send(());
        }
        Some(process.watcher)
    }

    /// Records that the process exited on its own.
    pub(crate) fn mark_exited(&mut self) {
        self.state = InstanceState::Exited;
        self.handshake = None;
        self.process = None;
    }

    /// `<binary>[<index>]` label used in log messages.
    pub(crate) fn describe(&self, binary: &Path) -> String {
        match self.pid() {
            Some(pid) => format!("{}[{}] pid {}", binary.display(), self.index, pid),
            None => format!("{}[{}]", binary.display(), self.index),
        }
    }
}

/// Drains `lines` into the child's stdin, one newline-terminated line each.
async fn write_lines(index: usize, mut stdin: ChildStdin, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(mut line) = lines.recv().await {
        if !line.ends_with('\n') {
            line.push('\n');
        }
        trace!(instance = index, bytes = line.len(), "Writing to stdin");

        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(instance = index, error = %e, "Failed to write to interpreter stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(instance = index, error = %e, "Failed to flush interpreter stdin");
            break;
        }
    }
    debug!(instance = index, "Stdin writer finished");
}

/// Forwards the child's output until both streams close, then reaps it.
async fn watch_process(
    index: usize,
    mut child: Child,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    mut kill: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<InstanceEvent>,
) {
    let mut out_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut err_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut out_open = true;
    let mut err_open = true;
    let mut kill_requested = false;

    while out_open || err_open {
        tokio::select! {
            biased;

            // A dropped sender means the pool itself went away. Output after
            // a kill is not needed, and grandchildren may hold the pipes open.
            _ = &mut kill => {
                kill_requested = true;
                if let Err(e) = child.start_kill() {
                    debug!(instance = index, error = %e, "Kill request failed");
                }
                break;
            }

            read = stderr.read(&mut err_buf), if err_open => match read {
                Ok(0) => err_open = false,
                Ok(n) => {
                    let _ = events.send(InstanceEvent::Stderr { index, chunk: err_buf[..n].to_vec() });
                }
                Err(e) => {
                    debug!(instance = index, error = %e, "Failed to read stderr");
                    err_open = false;
                }
            },

            read = stdout.read(&mut out_buf), if out_open => match read {
                Ok(0) => out_open = false,
                Ok(n) => {
                    let _ = events.send(InstanceEvent::Stdout { index, chunk: out_buf[..n].to_vec() });
                }
                Err(e) => {
                    debug!(instance = index, error = %e, "Failed to read stdout");
                    out_open = false;
                }
            },
        }
    }

    let status = loop {
        tokio::select! {
            biased;

            _ = &mut kill, if !kill_requested => {
                kill_requested = true;
                let _ = child.start_kill();
            }
            status = child.wait() => break status,
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(instance = index, error = %e, "Failed to reap interpreter");
            None
        }
    };

    let _ = events.send(InstanceEvent::Exited { index, code });
}

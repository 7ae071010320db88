//! Job definitions for the pool.
//!
//! - `Job`: one request to evaluate a script, with its accumulating buffers
//! - `JobOutput`: what a job's callback receives once its end marker is seen
//! - `JobCallback`: the completion callback type
//! - `BroadcastCallback`: the callback of a broadcast, fired once every
//!   participating instance has finished

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::token::Token;

/// Completion callback. Invoked at most once, from the dispatcher task.
///
/// A job that is abandoned (its instance died, or the pool was stopped)
/// drops its callback without calling it.
pub type JobCallback = Box<dyn FnOnce(JobOutput) + Send + 'static>;

/// Broadcast completion callback. Receives one output per participating
/// instance, ordered by instance index.
pub type BroadcastCallback = Box<dyn FnOnce(Vec<JobOutput>) + Send + 'static>;

/// A unit of work: one script evaluated on one instance.
pub struct Job {
    /// Correlation token written into the envelope.
    pub token: Token,
    /// Raw script text, before wrapping.
    pub script: String,
    /// When the job was handed to an instance.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job's end marker was observed.
    pub ended_at: Option<DateTime<Utc>>,
    /// Interpreter stdout with markers removed.
    pub log: String,
    /// Interpreter stderr, verbatim.
    pub error: String,
    /// Whether an `error:<token>` marker was observed.
    pub failed: bool,
    callback: Option<JobCallback>,
    group: Option<u64>,
}

impl Job {
    /// Creates a job with a fresh token and no callback.
    pub fn new(script: impl Into<String>) -> Self {
        Self::with_token(Token::new(), script)
    }

    /// Creates a job with an explicit token.
    pub fn with_token(token: Token, script: impl Into<String>) -> Self {
        Self {
            token,
            script: script.into(),
            started_at: None,
            ended_at: None,
            log: String::new(),
            error: String::new(),
            failed: false,
            callback: None,
            group: None,
        }
    }

    /// Sets the completion callback.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(JobOutput) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Sets an already boxed completion callback, if any.
    pub fn with_boxed_callback(mut self, callback: Option<JobCallback>) -> Self {
        self.callback = callback;
        self
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Marks the job as one leg of broadcast `group`.
    pub(crate) fn in_group(mut self, group: u64) -> Self {
        self.group = Some(group);
        self
    }

    pub(crate) fn group(&self) -> Option<u64> {
        self.group
    }

    /// Clears buffers and stamps the start time.
    pub(crate) fn reset(&mut self) {
        self.started_at = Some(Utc::now());
        self.ended_at = None;
        self.log.clear();
        self.error.clear();
        self.failed = false;
    }

    /// Stamps the end time, consumes the job and fires its callback.
    ///
    /// Returns the output that was handed to the callback.
    pub(crate) fn complete(mut self, instance: usize) -> JobOutput {
        let ended_at = Utc::now();
        self.ended_at = Some(ended_at);

        let output = JobOutput {
            token: self.token,
            instance,
            log: std::mem::take(&mut self.log),
            error: std::mem::take(&mut self.error),
            failed: self.failed,
            started_at: self.started_at.unwrap_or(ended_at),
            ended_at,
        };

        if let Some(callback) = self.callback.take() {
            callback(output.clone());
        }
        output
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("token", &self.token)
            .field("script", &self.script)
            .field("started_at", &self.started_at)
            .field("ended_at", &self.ended_at)
            .field("log_len", &self.log.len())
            .field("error_len", &self.error.len())
            .field("failed", &self.failed)
            .field("has_callback", &self.callback.is_some())
            .field("group", &self.group)
            .finish()
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Token of the job that produced this output.
    pub token: Token,
    /// Index of the instance that ran the job.
    pub instance: usize,
    /// Everything the script printed on stdout, markers removed.
    pub log: String,
    /// Everything the interpreter printed on stderr while the job ran.
    pub error: String,
    /// Whether the script raised an interpreter-level error.
    pub failed: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl JobOutput {
    /// Wall-clock time between dispatch to an instance and the end marker.
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }

    pub fn is_success(&self) -> bool {
        !self.failed
    }
}

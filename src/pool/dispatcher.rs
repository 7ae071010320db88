//! The dispatcher task: single owner of every instance, the job queue and
//! the broadcast joins.
//!
//! Caller commands and instance I/O events are funnelled into one task, so
//! every state transition (handshake, job attach, job completion, dequeue)
//! happens in a single serialized order and needs no locking. Job callbacks
//! run on this task and must not block.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::PoolError;

use super::dialect::Dialect;
use super::instance::{Instance, InstanceEvent, InstanceState};
use super::job::{BroadcastCallback, Job, JobOutput};
use super::queue::JobQueue;
use super::scanner::{Marker, MarkerKind, ScanEvent};
use super::token::Token;
use super::worker_pool::{PoolStats, SharedPoolStats};

/// Requests from the pool handle.
pub(crate) enum Command {
    /// Run a job on the first idle instance, or queue it.
    Execute(Job),
    /// Run a script once on every live instance.
    Broadcast {
        script: String,
        callback: Option<BroadcastCallback>,
    },
    /// Kill every instance and hand back the watcher tasks to await.
    Stop {
        reply: oneshot::Sender<Vec<JoinHandle<()>>>,
    },
}

/// Outcome of the startup handshake, reported once.
pub(crate) type HandshakeReply = oneshot::Sender<Result<(), PoolError>>;

struct BroadcastJoin {
    remaining: usize,
    outputs: Vec<JobOutput>,
    callback: Option<BroadcastCallback>,
}

pub(crate) struct Dispatcher {
    binary: PathBuf,
    dialect: Box<dyn Dialect>,
    instances: Vec<Instance>,
    queue: JobQueue,
    broadcasts: HashMap<u64, BroadcastJoin>,
    next_group: u64,
    pending_handshakes: usize,
    on_ready: Option<HandshakeReply>,
    accepted: u64,
    completed: u64,
    stats: Arc<SharedPoolStats>,
}

impl Dispatcher {
    pub(crate) fn new(
        binary: PathBuf,
        dialect: Box<dyn Dialect>,
        instances: Vec<Instance>,
        on_ready: HandshakeReply,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        let pending_handshakes = instances.len();
        let dispatcher = Self {
            binary,
            dialect,
            instances,
            queue: JobQueue::new(),
            broadcasts: HashMap::new(),
            next_group: 0,
            pending_handshakes,
            on_ready: Some(on_ready),
            accepted: 0,
            completed: 0,
            stats,
        };
        dispatcher.publish_stats();
        dispatcher
    }

    /// Processes commands and instance events until stopped.
    ///
    /// Dropping every command sender stops the pool as well.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<InstanceEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => self.on_instance_event(event),

                command = commands.recv() => match command {
                    Some(Command::Stop { reply }) => {
                        let watchers = self.stop();
                        let _ = reply.send(watchers);
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("Pool handle dropped, stopping instances");
                        self.stop();
                        break;
                    }
                },
            }
            self.publish_stats();
        }
        self.publish_stats();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Execute(job) => self.execute(job),
            Command::Broadcast { script, callback } => self.broadcast(script, callback),
            Command::Stop { reply } => {
                let _ = reply.send(self.stop());
            }
        }
    }

    pub(crate) fn on_instance_event(&mut self, event: InstanceEvent) {
        match event {
            InstanceEvent::Stdout { index, chunk } => self.on_stdout(index, &chunk),
            InstanceEvent::Stderr { index, chunk } => self.on_stderr(index, &chunk),
            InstanceEvent::Exited { index, code } => self.on_exited(index, code),
        }
    }

    /// Number of instances that completed the handshake and are alive.
    pub(crate) fn ready_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_ready()).count()
    }

    fn publish_stats(&self) {
        self.stats.publish(&PoolStats {
            instances: self.instances.len(),
            ready: self.ready_count(),
            busy: self.instances.iter().filter(|i| i.job.is_some()).count(),
            queued: self.queue.len(),
            accepted: self.accepted,
            completed: self.completed,
        });
    }

    // --- dispatching ---------------------------------------------------

    fn execute(&mut self, job: Job) {
        if self.ready_count() < 1 {
            warn!(job = %job.token, "No instances ready, dropping job");
            return;
        }

        self.accepted += 1;
        self.place(job);
    }

    /// First-fit: the lowest-indexed idle instance gets the job.
    fn place(&mut self, job: Job) {
        match self.instances.iter().position(Instance::is_idle) {
            Some(index) => self.attach(index, job),
            None => {
                debug!(job = %job.token, queued = self.queue.len() + 1, "All instances busy, queueing job");
                self.queue.enqueue(job);
            }
        }
    }

    /// Hands `job` to instance `index`; the job's clock starts here, not
    /// when it was queued.
    fn attach(&mut self, index: usize, mut job: Job) {
        job.reset();
        let line = self.dialect.wrap(&job.script, &job.token);
        let token = job.token;
        let instance = &mut self.instances[index];
        instance.job = Some(job);

        if instance.send_line(line) {
            debug!(instance = index, job = %token, "Dispatched job");
        } else {
            warn!(
                instance = %instance.describe(&self.binary),
                job = %token,
                "Instance stdin is closed, job will be abandoned"
            );
        }
    }

    /// Gives a freed instance its next job: pinned broadcast legs first,
    /// then the head of the shared queue.
    fn advance(&mut self, index: usize) {
        let instance = &mut self.instances[index];
        if !instance.is_alive() || instance.job.is_some() {
            return;
        }

        if let Some(job) = instance.pinned.pop_front() {
            self.attach(index, job);
            return;
        }

        if instance.is_ready() {
            if let Some(job) = self.queue.dequeue() {
                debug!(job = %job.token, remaining = self.queue.len(), "Dequeued job");
                self.place(job);
            }
        }
    }

    fn broadcast(&mut self, script: String, callback: Option<BroadcastCallback>) {
        for instance in &self.instances {
            let label = instance.describe(&self.binary);
            match instance.state {
                InstanceState::Starting => warn!(instance = %label, "Broadcasting to an instance that is not ready"),
                InstanceState::Exited => warn!(instance = %label, "Skipping exited instance"),
                InstanceState::Ready if instance.job.is_some() => {
                    warn!(instance = %label, "Instance is busy, script will run after its current job")
                }
                InstanceState::Ready => {}
            }
        }

        let targets: Vec<usize> = self
            .instances
            .iter()
            .filter(|i| i.is_alive())
            .map(|i| i.index)
            .collect();
        if targets.is_empty() {
            warn!("No live instances, dropping broadcast");
            return;
        }

        let group = self.next_group;
        self.next_group += 1;
        self.broadcasts.insert(
            group,
            BroadcastJoin {
                remaining: targets.len(),
                outputs: Vec::with_capacity(targets.len()),
                callback,
            },
        );
        debug!(group, instances = targets.len(), "Broadcasting script");

        for index in targets {
            let job = Job::new(script.clone()).in_group(group);
            self.accepted += 1;

            if self.instances[index].job.is_none() {
                self.attach(index, job);
            } else {
                self.instances[index].pinned.push_back(job);
            }
        }
    }

    fn record_broadcast(&mut self, group: u64, output: JobOutput) {
        let Some(join) = self.broadcasts.get_mut(&group) else {
            return;
        };
        join.outputs.push(output);
        join.remaining -= 1;
        if join.remaining > 0 {
            return;
        }

        if let Some(mut join) = self.broadcasts.remove(&group) {
            join.outputs.sort_by_key(|o| o.instance);
            info!(group, instances = join.outputs.len(), "Broadcast complete");
            if let Some(callback) = join.callback {
                callback(join.outputs);
            }
        }
    }

    /// Drops a job without calling its callback. A broadcast leg takes its
    /// whole broadcast down with it.
    fn abandon(&mut self, job: Job) {
        warn!(job = %job.token, "Abandoning job");
        if let Some(group) = job.group() {
            if self.broadcasts.remove(&group).is_some() {
                warn!(group, "Broadcast abandoned");
            }
        }
    }

    // --- correlation ---------------------------------------------------

    fn on_stdout(&mut self, index: usize, chunk: &[u8]) {
        let events = self.instances[index].scanner.feed(chunk);
        for event in events {
            self.on_scan_event(index, event);
        }
    }

    fn on_scan_event(&mut self, index: usize, event: ScanEvent) {
        let instance = &mut self.instances[index];
        match instance.state {
            InstanceState::Exited => {}
            InstanceState::Starting => match event {
                ScanEvent::Marker(m)
                    if m.kind == MarkerKind::Ready && instance.handshake == Some(m.token) =>
                {
                    instance.state = InstanceState::Ready;
                    instance.handshake = None;
                    self.on_handshake(index);
                }
                ScanEvent::Marker(m) => {
                    debug!(instance = index, marker = %m, "Ignoring marker before handshake")
                }
                ScanEvent::Text(text) => {
                    trace!(instance = index, text = %text, "Discarding startup output")
                }
            },
            InstanceState::Ready => match event {
                ScanEvent::Text(text) => match instance.job.as_mut() {
                    Some(job) => job.log.push_str(&text),
                    None => trace!(instance = index, text = %text, "Output with no active job"),
                },
                ScanEvent::Marker(marker) => self.on_marker(index, marker),
            },
        }
    }

    fn on_marker(&mut self, index: usize, marker: Marker) {
        match marker.kind {
            MarkerKind::Begin => trace!(instance = index, job = %marker.token, "Job began"),
            MarkerKind::Error => match self.instances[index].job.as_mut() {
                Some(job) => {
                    if job.token != marker.token {
                        debug!(expected = %job.token, received = %marker.token, "Error marker token mismatch");
                    }
                    job.failed = true;
                }
                None => warn!(instance = index, marker = %marker, "Error marker with no active job"),
            },
            MarkerKind::End => self.finish_job(index, marker.token),
            MarkerKind::Ready => debug!(instance = index, marker = %marker, "Ignoring ready marker"),
        }
    }

    fn on_handshake(&mut self, index: usize) {
        self.pending_handshakes = self.pending_handshakes.saturating_sub(1);
        info!(
            instance = %self.instances[index].describe(&self.binary),
            pending = self.pending_handshakes,
            "Instance ready"
        );

        if self.pending_handshakes == 0 {
            if let Some(reply) = self.on_ready.take() {
                // start() returns on this reply; ready() must already read N.
                self.publish_stats();
                let _ = reply.send(Ok(()));
            }
        }
        self.advance(index);
    }

    fn finish_job(&mut self, index: usize, token: Token) {
        let Some(job) = self.instances[index].job.take() else {
            warn!(instance = index, job = %token, "End marker with no active job");
            return;
        };

        if job.token != token {
            warn!(
                instance = index,
                expected = %job.token,
                received = %token,
                "Job token mismatch, completing active job"
            );
        }

        let group = job.group();
        let output = job.complete(index);
        self.completed += 1;
        debug!(
            instance = index,
            job = %output.token,
            failed = output.failed,
            duration_ms = output.duration().num_milliseconds(),
            "Job completed"
        );

        if let Some(group) = group {
            self.record_broadcast(group, output);
        }
        self.advance(index);
    }

    fn on_stderr(&mut self, index: usize, chunk: &[u8]) {
        let instance = &mut self.instances[index];
        let text = instance.stderr.decode(chunk);
        if text.is_empty() {
            return;
        }
        match instance.job.as_mut() {
            Some(job) => job.error.push_str(&text),
            None => debug!(instance = index, text = %text.trim_end(), "Stderr output with no active job"),
        }
    }

    fn on_exited(&mut self, index: usize, code: Option<i32>) {
        let label = self.instances[index].describe(&self.binary);
        let instance = &mut self.instances[index];
        if !instance.is_alive() {
            return;
        }

        let was_starting = instance.state == InstanceState::Starting;
        if let Some(rest) = instance.scanner.finish() {
            trace!(instance = index, text = %rest, "Discarding trailing output");
        }
        instance.mark_exited();

        let abandoned: Vec<Job> = instance
            .job
            .take()
            .into_iter()
            .chain(instance.pinned.drain(..))
            .collect();

        match code {
            Some(0) => info!(instance = %label, "Interpreter exited"),
            _ => warn!(instance = %label, code = ?code, "Interpreter exited unexpectedly"),
        }

        for job in abandoned {
            self.abandon(job);
        }

        // The handshake join stays unresolved; only a configured timeout ends it.
        if was_starting {
            warn!(instance = %label, "Instance exited before completing the handshake");
        }

        if !self.instances.iter().any(Instance::is_alive) {
            let dropped = self.queue.drain().count();
            if dropped > 0 {
                warn!(dropped, "No live instances left, discarding queued jobs");
            }
        }
    }

    // --- shutdown ------------------------------------------------------

    fn stop(&mut self) -> Vec<JoinHandle<()>> {
        let mut watchers = Vec::with_capacity(self.instances.len());

        for instance in self.instances.iter_mut() {
            let label = instance.describe(&self.binary);
            if let Some(job) = instance.job.take() {
                warn!(instance = %label, job = %job.token, "Killing instance with a job in flight");
            }
            instance.pinned.clear();
            if let Some(watcher) = instance.kill() {
                debug!(instance = %label, "Killing interpreter");
                watchers.push(watcher);
            }
        }

        let dropped = self.queue.drain().count();
        if dropped > 0 {
            warn!(dropped, "Discarding queued jobs");
        }
        self.broadcasts.clear();

        if let Some(reply) = self.on_ready.take() {
            let _ = reply.send(Err(PoolError::NotRunning));
        }
        watchers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::dialect::{RDialect, ShDialect};
    use std::sync::Mutex;

    type Sink = Arc<Mutex<Vec<JobOutput>>>;

    fn dispatcher(n: usize) -> (Dispatcher, oneshot::Receiver<Result<(), PoolError>>) {
        dispatcher_with(n, Box::new(ShDialect))
    }

    fn dispatcher_with(
        n: usize,
        dialect: Box<dyn Dialect>,
    ) -> (Dispatcher, oneshot::Receiver<Result<(), PoolError>>) {
        let (tx, rx) = oneshot::channel();
        let instances = (0..n).map(Instance::detached).collect();
        let dispatcher = Dispatcher::new(
            PathBuf::from("/bin/sh"),
            dialect,
            instances,
            tx,
            Arc::new(SharedPoolStats::new()),
        );
        (dispatcher, rx)
    }

    fn stdout(d: &mut Dispatcher, index: usize, text: &str) {
        d.on_instance_event(InstanceEvent::Stdout {
            index,
            chunk: text.as_bytes().to_vec(),
        });
    }

    fn handshake_all(d: &mut Dispatcher) {
        for index in 0..d.instances.len() {
            let token = d.instances[index].handshake.expect("pending handshake");
            stdout(d, index, &format!("ready:{token}"));
        }
    }

    fn job_into(sink: &Sink, script: &str) -> Job {
        let sink = Arc::clone(sink);
        Job::new(script).with_callback(move |out| sink.lock().unwrap().push(out))
    }

    fn active_token(d: &Dispatcher, index: usize) -> Token {
        d.instances[index].job.as_ref().expect("active job").token
    }

    #[test]
    fn test_handshake_resolves_when_all_ready() {
        let (mut d, mut rx) = dispatcher(2);
        assert_eq!(d.ready_count(), 0);

        let first = d.instances[0].handshake.unwrap();
        stdout(&mut d, 0, &format!("banner text\nready:{first}"));
        assert_eq!(d.ready_count(), 1);
        assert!(rx.try_recv().is_err());

        // Wrong token is ignored.
        stdout(&mut d, 1, &format!("ready:{}", Token::new()));
        assert_eq!(d.ready_count(), 1);

        let second = d.instances[1].handshake.unwrap();
        stdout(&mut d, 1, &format!("ready:{second}"));
        assert_eq!(d.ready_count(), 2);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_execute_without_ready_instances_drops_job() {
        let (mut d, _rx) = dispatcher(1);
        let sink = Sink::default();

        d.execute(job_into(&sink, "echo hi"));
        assert_eq!(d.accepted, 0);
        assert!(d.instances[0].job.is_none());
        assert!(d.queue.is_empty());
    }

    #[test]
    fn test_first_fit_then_fifo_queue() {
        let (mut d, _rx) = dispatcher(2);
        handshake_all(&mut d);
        let sink = Sink::default();

        for script in ["a", "b", "c", "d"] {
            d.execute(job_into(&sink, script));
        }
        assert_eq!(d.instances[0].job.as_ref().unwrap().script, "a");
        assert_eq!(d.instances[1].job.as_ref().unwrap().script, "b");
        assert_eq!(d.queue.len(), 2);
        assert_eq!(d.accepted, 4);

        // Instance 1 finishes first and takes the queue head.
        let token = active_token(&d, 1);
        stdout(&mut d, 1, &format!("begin:{token}B\nend:{token}"));
        assert_eq!(d.instances[1].job.as_ref().unwrap().script, "c");

        let token = active_token(&d, 0);
        stdout(&mut d, 0, &format!("begin:{token}A\nend:{token}"));
        assert_eq!(d.instances[0].job.as_ref().unwrap().script, "d");
        assert!(d.queue.is_empty());

        let outputs = sink.lock().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].log, "B\n");
        assert_eq!(outputs[0].instance, 1);
        assert_eq!(outputs[1].log, "A\n");
    }

    #[test]
    fn test_output_split_across_chunks() {
        let (mut d, _rx) = dispatcher(1);
        handshake_all(&mut d);
        let sink = Sink::default();

        d.execute(job_into(&sink, "print"));
        let token = active_token(&d, 0).to_string();
        let stream = format!("begin:{token}[1] 2\nend:{token}");
        for byte in stream.as_bytes() {
            d.on_instance_event(InstanceEvent::Stdout {
                index: 0,
                chunk: vec![*byte],
            });
        }

        let outputs = sink.lock().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].log, "[1] 2\n");
        assert!(!outputs[0].log.contains(&token));
    }

    #[test]
    fn test_error_marker_and_stderr() {
        let (mut d, _rx) = dispatcher(1);
        handshake_all(&mut d);
        let sink = Sink::default();

        d.execute(job_into(&sink, "stop(\"boom\")"));
        let token = active_token(&d, 0);
        stdout(&mut d, 0, &format!("begin:{token}"));
        d.on_instance_event(InstanceEvent::Stderr {
            index: 0,
            chunk: b"boom\n".to_vec(),
        });
        stdout(&mut d, 0, &format!("error:{token}end:{token}"));

        let outputs = sink.lock().unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].failed);
        assert_eq!(outputs[0].error, "boom\n");
        assert_eq!(outputs[0].log, "");
    }

    #[test]
    fn test_mismatched_end_token_still_completes() {
        let (mut d, _rx) = dispatcher(1);
        handshake_all(&mut d);
        let sink = Sink::default();

        d.execute(job_into(&sink, "x"));
        stdout(&mut d, 0, &format!("end:{}", Token::new()));

        assert_eq!(sink.lock().unwrap().len(), 1);
        assert!(d.instances[0].job.is_none());
        assert_eq!(d.completed, 1);
    }

    #[test]
    fn test_end_marker_without_job_is_ignored() {
        let (mut d, _rx) = dispatcher(1);
        handshake_all(&mut d);

        stdout(&mut d, 0, &format!("stray end:{}", Token::new()));
        assert_eq!(d.completed, 0);
    }

    #[test]
    fn test_broadcast_pins_behind_busy_instance() {
        let (mut d, _rx) = dispatcher(2);
        handshake_all(&mut d);
        let sink = Sink::default();
        let joined: Arc<Mutex<Option<Vec<JobOutput>>>> = Arc::default();

        d.execute(job_into(&sink, "busy"));
        let busy_token = active_token(&d, 0);

        let out = Arc::clone(&joined);
        d.broadcast(
            "library(x)".to_string(),
            Some(Box::new(move |outputs: Vec<JobOutput>| {
                *out.lock().unwrap() = Some(outputs)
            })),
        );
        assert_eq!(d.instances[0].pinned.len(), 1);
        assert_eq!(d.instances[1].job.as_ref().unwrap().script, "library(x)");

        let token = active_token(&d, 1);
        stdout(&mut d, 1, &format!("end:{token}"));
        assert!(joined.lock().unwrap().is_none());

        stdout(&mut d, 0, &format!("end:{busy_token}"));
        assert_eq!(d.instances[0].job.as_ref().unwrap().script, "library(x)");
        let token = active_token(&d, 0);
        stdout(&mut d, 0, &format!("loaded\nend:{token}"));

        let outputs = joined.lock().unwrap().take().expect("broadcast joined");
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].instance, 0);
        assert_eq!(outputs[0].log, "loaded\n");
        assert_eq!(outputs[1].instance, 1);
        assert_eq!(sink.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_exit_abandons_job_and_broadcast() {
        let (mut d, _rx) = dispatcher(2);
        handshake_all(&mut d);
        let joined = Arc::new(Mutex::new(false));

        let flag = Arc::clone(&joined);
        d.broadcast(
            "x".to_string(),
            Some(Box::new(move |_: Vec<JobOutput>| *flag.lock().unwrap() = true)),
        );
        d.on_instance_event(InstanceEvent::Exited { index: 0, code: Some(1) });

        assert!(!d.instances[0].is_alive());
        assert!(d.broadcasts.is_empty());
        assert_eq!(d.ready_count(), 1);

        let token = active_token(&d, 1);
        stdout(&mut d, 1, &format!("end:{token}"));
        assert!(!*joined.lock().unwrap());
    }

    #[test]
    fn test_exit_before_handshake_leaves_join_pending() {
        let (mut d, mut rx) = dispatcher(2);
        let first = d.instances[0].handshake.unwrap();
        stdout(&mut d, 0, &format!("ready:{first}"));
        d.on_instance_event(InstanceEvent::Exited { index: 1, code: Some(2) });

        assert_eq!(d.ready_count(), 1);
        assert!(!d.instances[1].is_alive());
        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
    }

    #[test]
    fn test_stop_drops_jobs_without_callbacks() {
        let (mut d, _rx) = dispatcher(1);
        handshake_all(&mut d);
        let sink = Sink::default();

        d.execute(job_into(&sink, "running"));
        d.execute(job_into(&sink, "queued"));
        assert_eq!(d.queue.len(), 1);

        let watchers = d.stop();
        assert!(watchers.is_empty());
        assert_eq!(d.ready_count(), 0);
        assert!(d.queue.is_empty());
        assert!(d.instances[0].job.is_none());
        assert!(sink.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stats_are_published() {
        let (mut d, _rx) = dispatcher(2);
        handshake_all(&mut d);
        let sink = Sink::default();
        for _ in 0..3 {
            d.execute(job_into(&sink, "x"));
        }
        d.publish_stats();

        let stats = d.stats.snapshot();
        assert_eq!(stats.instances, 2);
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.busy, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn test_stats_show_all_ready_when_start_resolves() {
        let (mut d, mut rx) = dispatcher(2);
        handshake_all(&mut d);

        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        // No explicit publish: the reply itself must follow the update.
        assert_eq!(d.stats.snapshot().ready, 2);
    }

    #[test]
    fn test_r_values_stay_with_their_own_job() {
        let (mut d, _rx) = dispatcher_with(1, Box::new(RDialect));
        handshake_all(&mut d);
        let sink = Sink::default();

        d.execute(job_into(&sink, "1+1"));
        d.execute(job_into(&sink, "2+2"));

        let token = active_token(&d, 0);
        stdout(&mut d, 0, &format!("begin:{token}[1] 2\nend:{token}"));
        let token = active_token(&d, 0);
        stdout(&mut d, 0, &format!("begin:{token}[1] 4\nend:{token}"));

        let outputs = sink.lock().unwrap();
        let logs: Vec<&str> = outputs.iter().map(|o| o.log.as_str()).collect();
        assert_eq!(logs, vec!["[1] 2\n", "[1] 4\n"]);
    }

    #[test]
    fn test_queued_job_clock_starts_on_dispatch() {
        let (mut d, _rx) = dispatcher(1);
        handshake_all(&mut d);
        let sink = Sink::default();

        d.execute(job_into(&sink, "first"));
        d.execute(job_into(&sink, "second"));
        assert_eq!(d.queue.len(), 1);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let token = active_token(&d, 0);
        stdout(&mut d, 0, &format!("begin:{token}end:{token}"));
        let token = active_token(&d, 0);
        stdout(&mut d, 0, &format!("begin:{token}end:{token}"));

        let outputs = sink.lock().unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs[1].started_at >= outputs[0].ended_at);
        assert!(outputs[1].duration() < chrono::Duration::milliseconds(20));
    }
}

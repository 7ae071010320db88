//! In-memory FIFO of jobs waiting for an idle instance.
//!
//! The queue is unbounded: there is no backpressure, so a producer that
//! submits faster than the instances complete will grow it without limit.
//! It is owned by the dispatcher task and never shared.

use std::collections::VecDeque;

use super::job::Job;

/// FIFO job queue.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a job to the tail of the queue.
    pub fn enqueue(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    /// Removes and returns the oldest job.
    pub fn dequeue(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Removes every queued job, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Job> + '_ {
        self.jobs.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = JobQueue::new();
        queue.enqueue(Job::new("1+1"));
        queue.enqueue(Job::new("2+2"));
        queue.enqueue(Job::new("3+3"));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap().script, "1+1");
        assert_eq!(queue.dequeue().unwrap().script, "2+2");
        assert_eq!(queue.dequeue().unwrap().script, "3+3");
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut queue = JobQueue::new();
        queue.enqueue(Job::new("a"));
        queue.enqueue(Job::new("b"));

        let drained: Vec<_> = queue.drain().map(|job| job.script).collect();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(queue.is_empty());
    }
}

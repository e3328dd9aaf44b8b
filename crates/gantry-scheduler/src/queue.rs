//! Ready queue ordering eligible instances for dispatch.

use gantry_core::ids::InstanceKey;
use petgraph::graph::NodeIndex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// An eligible instance waiting for a worker.
#[derive(Debug, Clone)]
pub struct ReadyJob {
    pub idx: NodeIndex,
    pub key: InstanceKey,
    /// Transitive dependents; more dependents dispatch first.
    pub downstream: usize,
}

impl PartialEq for ReadyJob {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ReadyJob {}

impl PartialOrd for ReadyJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher downstream count first, then lexicographically smaller key
        match self.downstream.cmp(&other.downstream) {
            Ordering::Equal => other.key.cmp(&self.key),
            other => other,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReadyQueue {
    queue: BinaryHeap<ReadyJob>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: ReadyJob) {
        self.queue.push(job);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Pop the highest-priority job accepted by `can_run`. Jobs that are
    /// skipped stay queued in their original order.
    pub fn pop_where<F>(&mut self, mut can_run: F) -> Option<ReadyJob>
    where
        F: FnMut(&ReadyJob) -> bool,
    {
        let mut skipped = Vec::new();
        let mut result = None;

        while let Some(job) = self.queue.pop() {
            if can_run(&job) {
                result = Some(job);
                break;
            }
            skipped.push(job);
        }

        for job in skipped {
            self.queue.push(job);
        }

        result
    }
}

impl FromIterator<ReadyJob> for ReadyQueue {
    fn from_iter<I: IntoIterator<Item = ReadyJob>>(iter: I) -> Self {
        Self {
            queue: iter.into_iter().collect(),
        }
    }
}

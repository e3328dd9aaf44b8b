//! Worker slots and tag matching for job assignment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A worker that runs one job at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// A worker serves a job when its tags are a superset of the job's tags.
    pub fn serves(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.tags)
    }
}

#[derive(Debug)]
struct Slot {
    spec: WorkerSpec,
    busy: bool,
}

/// Fixed set of workers owned by the scheduler loop.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<Slot>,
}

impl WorkerPool {
    pub fn new(specs: Vec<WorkerSpec>) -> Self {
        Self {
            slots: specs
                .into_iter()
                .map(|spec| Slot { spec, busy: false })
                .collect(),
        }
    }

    /// `count` untagged local workers.
    pub fn untagged(count: usize) -> Self {
        Self::new(
            (1..=count)
                .map(|i| WorkerSpec::new(format!("local-{}", i)))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn busy(&self) -> usize {
        self.slots.iter().filter(|s| s.busy).count()
    }

    /// Whether any worker, busy or not, could ever run a job with these tags.
    pub fn can_ever_serve(&self, required: &BTreeSet<String>) -> bool {
        self.slots.iter().any(|s| s.spec.serves(required))
    }

    pub fn has_free(&self, required: &BTreeSet<String>) -> bool {
        self.slots.iter().any(|s| !s.busy && s.spec.serves(required))
    }

    /// Claim a free matching worker, preferring the one with the fewest tags
    /// so specialized workers stay available.
    pub fn acquire(&mut self, required: &BTreeSet<String>) -> Option<usize> {
        let slot = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.busy && s.spec.serves(required))
            .min_by_key(|(i, s)| (s.spec.tags.len(), *i))
            .map(|(i, _)| i)?;
        self.slots[slot].busy = true;
        Some(slot)
    }

    pub fn release(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.busy = false;
        }
    }

    pub fn name(&self, slot: usize) -> &str {
        self.slots
            .get(slot)
            .map(|s| s.spec.name.as_str())
            .unwrap_or("unknown")
    }
}

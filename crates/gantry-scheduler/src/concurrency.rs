//! Concurrency groups: at most one live run per ref.

use crate::report::ExecutionReport;
use crate::scheduler::{PipelineRun, SchedulerHandle};
use futures::future::join_all;
use gantry_core::ids::RunId;
use gantry_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// What happened to an older run when a newer one registered in its group.
#[derive(Debug)]
pub struct SupersedeOutcome {
    pub run_id: RunId,
    pub result: Result<()>,
}

/// Tracks live runs by concurrency group.
#[derive(Clone, Default)]
pub struct ConcurrencyRegistry {
    groups: Arc<RwLock<HashMap<String, Vec<SchedulerHandle>>>>,
}

impl ConcurrencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run and ask every older run in `group` to step aside.
    /// Runs that refuse stay registered and keep running.
    pub async fn register(&self, group: &str, handle: SchedulerHandle) -> Vec<SupersedeOutcome> {
        let previous = {
            let mut groups = self.groups.write().await;
            let entry = groups.entry(group.to_string()).or_default();
            entry.retain(|h| !h.is_closed());
            let previous = entry.clone();
            entry.push(handle.clone());
            previous
        };

        let by = handle.run_id();
        let results = join_all(previous.iter().map(|old| old.supersede(by))).await;

        let mut outcomes = Vec::new();
        let mut finished = Vec::new();
        for (old, result) in previous.into_iter().zip(results) {
            match &result {
                Ok(()) => info!(group, run_id = %old.run_id(), by = %handle.run_id(), "Superseded older run"),
                Err(Error::SchedulerClosed) => {
                    finished.push(old.run_id());
                    continue;
                }
                Err(e) => warn!(group, run_id = %old.run_id(), error = %e, "Older run kept running"),
            }
            outcomes.push(SupersedeOutcome {
                run_id: old.run_id(),
                result,
            });
        }

        for run_id in finished {
            self.unregister(group, run_id).await;
        }
        outcomes
    }

    pub async fn unregister(&self, group: &str, run_id: RunId) {
        let mut groups = self.groups.write().await;
        if let Some(entry) = groups.get_mut(group) {
            entry.retain(|h| h.run_id() != run_id);
            if entry.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Wait for `run` to finish, then drop it from `group`.
    pub async fn wait(&self, group: &str, run: PipelineRun) -> Result<ExecutionReport> {
        let run_id = run.run_id();
        let report = run.wait().await;
        self.unregister(group, run_id).await;
        report
    }

    /// Runs in `group` that are still live. Finished runs are pruned.
    pub async fn active(&self, group: &str) -> Vec<RunId> {
        let mut groups = self.groups.write().await;
        let Some(entry) = groups.get_mut(group) else {
            return Vec::new();
        };
        entry.retain(|h| !h.is_closed());
        let live: Vec<RunId> = entry.iter().map(SchedulerHandle::run_id).collect();
        if live.is_empty() {
            groups.remove(group);
        }
        live
    }
}

//! Main scheduler orchestration.
//!
//! One task owns a run's graph and every instance's status. Workers report
//! over an mpsc channel and never touch state; external actors talk to the
//! loop through a cloneable [`SchedulerHandle`].

use crate::graph::{JobInstance, PipelineGraph};
use crate::plan::PipelinePlan;
use crate::queue::{ReadyJob, ReadyQueue};
use crate::report::{ExecutionReport, JobReport};
use crate::workers::{WorkerPool, WorkerSpec};
use chrono::Utc;
use gantry_core::approval::ManualGate;
use gantry_core::events::{
    ApprovalPayload, Event, JobRetryingPayload, JobStatusChangedPayload, RunCompletedPayload,
    RunStartedPayload, RunSupersededPayload,
};
use gantry_core::ids::{InstanceKey, RunId};
use gantry_core::pipeline::WhenPolicy;
use gantry_core::ports::{ArtifactRecord, JobExecutor, JobOutcome, JobRequest};
use gantry_core::run::{CancelReason, FailureReason, JobStatus};
use gantry_core::trigger::{EventSource, TriggerContext};
use gantry_core::{Error, Result};
use petgraph::graph::NodeIndex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 64;

/// Scheduler settings shared by every run it starts.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum instances running at once.
    pub concurrency: usize,
    /// Time a canceled job gets to stop before its work is dropped.
    pub grace_period: Duration,
    /// Keep a run open while manual gates are pending instead of finalizing.
    pub wait_for_approvals: bool,
    /// Approve every manual gate as soon as it is reached.
    pub auto_approve: bool,
    /// Instance keys approved before the run starts.
    pub pre_approved: HashSet<String>,
    /// Timeout for jobs that do not set one.
    pub default_timeout: Option<Duration>,
    /// Empty means `concurrency` untagged local workers.
    pub workers: Vec<WorkerSpec>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            grace_period: Duration::from_secs(10),
            wait_for_approvals: false,
            auto_approve: false,
            pre_approved: HashSet::new(),
            default_timeout: Some(Duration::from_secs(3600)),
            workers: Vec::new(),
        }
    }
}

enum Command {
    Approve {
        key: String,
        approver: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<()>>,
    },
    Supersede {
        by: RunId,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<(InstanceKey, JobStatus)>>,
    },
}

/// Handle for talking to a running pipeline.
#[derive(Clone)]
pub struct SchedulerHandle {
    run_id: RunId,
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Release a manual gate. A manual job that has not reached its gate yet
    /// is pre-approved: it still enters `ManualPending` and is released from
    /// there as soon as it does.
    pub async fn approve(&self, key: &str, approver: Option<String>) -> Result<()> {
        self.request(|reply| Command::Approve {
            key: key.to_string(),
            approver,
            reply,
        })
        .await?
    }

    /// Cancel the run. Running jobs get the grace period to stop.
    pub async fn cancel(&self) -> Result<()> {
        self.request(|reply| Command::Cancel { reply }).await?
    }

    /// Cancel the run in favor of a newer one on the same ref.
    /// Fails with [`Error::NotInterruptible`] when the run may not be interrupted.
    pub async fn supersede(&self, by: RunId) -> Result<()> {
        self.request(|reply| Command::Supersede { by, reply }).await?
    }

    /// Whether the run has finished and stopped taking commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Current status of every instance.
    pub async fn snapshot(&self) -> Result<Vec<(InstanceKey, JobStatus)>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::SchedulerClosed)?;
        rx.await.map_err(|_| Error::SchedulerClosed)
    }
}

/// A run in progress.
pub struct PipelineRun {
    handle: SchedulerHandle,
    task: JoinHandle<ExecutionReport>,
}

impl PipelineRun {
    pub fn run_id(&self) -> RunId {
        self.handle.run_id
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<ExecutionReport> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("scheduler task failed: {}", e)))
    }
}

/// Starts pipeline runs against a job executor.
pub struct Scheduler {
    executor: Arc<dyn JobExecutor>,
    config: SchedulerConfig,
    events: broadcast::Sender<Event>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn JobExecutor>, config: SchedulerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            executor,
            config,
            events,
        }
    }

    /// Receive every state change of every run started after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Spawn the run loop for `plan`.
    pub fn start(&self, plan: PipelinePlan, ctx: &TriggerContext) -> PipelineRun {
        let run_id = RunId::new();
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let run = RunLoop::new(
            run_id,
            plan,
            ctx,
            self.executor.clone(),
            self.config.clone(),
            self.events.clone(),
            commands,
        );
        let task = tokio::spawn(run.run());
        PipelineRun {
            handle: SchedulerHandle { run_id, tx },
            task,
        }
    }

    /// Run `plan` to completion.
    pub async fn run(&self, plan: PipelinePlan, ctx: &TriggerContext) -> Result<ExecutionReport> {
        self.start(plan, ctx).wait().await
    }
}

enum WorkerMessage {
    Started {
        idx: NodeIndex,
        attempt: u32,
    },
    Finished {
        idx: NodeIndex,
        attempt: u32,
        result: AttemptResult,
    },
}

enum AttemptResult {
    Completed(JobOutcome),
    Failed(FailureReason),
    Canceled,
}

impl From<Result<JobOutcome>> for AttemptResult {
    fn from(result: Result<JobOutcome>) -> Self {
        match result {
            Ok(outcome) => AttemptResult::Completed(outcome),
            Err(Error::Timeout { seconds }) => {
                AttemptResult::Failed(FailureReason::Timeout { seconds })
            }
            Err(Error::ArtifactMissing { paths }) => {
                AttemptResult::Failed(FailureReason::ArtifactsMissing { paths })
            }
            Err(e) => AttemptResult::Failed(FailureReason::ExecutorError {
                message: e.to_string(),
            }),
        }
    }
}

enum LoopEvent {
    Worker(Option<WorkerMessage>),
    Command(Option<Command>),
}

struct JobRecord {
    report: JobReport,
    /// A required failure happened at or upstream of this instance.
    failure_seen: bool,
    /// Approval given before the gate opened, applied when it does.
    approved: bool,
    approver: Option<String>,
    gate_passed: bool,
    slot: Option<usize>,
    first_started: Option<Instant>,
}

struct RunLoop {
    run_id: RunId,
    source: EventSource,
    ref_name: String,
    graph: PipelineGraph,
    warnings: Vec<String>,
    interruptible: bool,
    records: HashMap<NodeIndex, JobRecord>,
    gates: HashMap<NodeIndex, ManualGate>,
    pool: WorkerPool,
    active: usize,
    non_interruptible_started: bool,
    cancel_reason: Option<CancelReason>,
    cancel_tx: watch::Sender<bool>,
    results_tx: mpsc::UnboundedSender<WorkerMessage>,
    results_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    executor: Arc<dyn JobExecutor>,
    config: SchedulerConfig,
    events: broadcast::Sender<Event>,
    started_at: chrono::DateTime<Utc>,
    started: Instant,
}

impl RunLoop {
    fn new(
        run_id: RunId,
        plan: PipelinePlan,
        ctx: &TriggerContext,
        executor: Arc<dyn JobExecutor>,
        mut config: SchedulerConfig,
        events: broadcast::Sender<Event>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        config.concurrency = config.concurrency.max(1);
        let pool = if config.workers.is_empty() {
            WorkerPool::untagged(config.concurrency)
        } else {
            WorkerPool::new(config.workers.clone())
        };

        let records = plan
            .graph
            .indices()
            .map(|idx| {
                let instance = plan.graph.instance(idx);
                let approved = config.auto_approve
                    || config.pre_approved.contains(instance.key.as_str());
                let record = JobRecord {
                    report: JobReport::new(
                        instance.key.clone(),
                        instance.name(),
                        instance.template.stage.clone(),
                        instance.when,
                        instance.allow_failure,
                    ),
                    failure_seen: false,
                    approved,
                    approver: None,
                    gate_passed: false,
                    slot: None,
                    first_started: None,
                };
                (idx, record)
            })
            .collect();

        let (cancel_tx, _) = watch::channel(false);
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Self {
            run_id,
            source: ctx.source,
            ref_name: ctx.ref_name.clone(),
            interruptible: plan.interruptible && ctx.source != EventSource::Schedule,
            graph: plan.graph,
            warnings: plan.warnings,
            records,
            gates: HashMap::new(),
            pool,
            active: 0,
            non_interruptible_started: false,
            cancel_reason: None,
            cancel_tx,
            results_tx,
            results_rx,
            commands,
            commands_open: true,
            executor,
            config,
            events,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    async fn run(mut self) -> ExecutionReport {
        info!(run_id = %self.run_id, ref_name = %self.ref_name, instances = self.graph.len(), "Pipeline run started");
        self.emit(Event::RunStarted(RunStartedPayload {
            run_id: self.run_id,
            ref_name: self.ref_name.clone(),
            instances: self.graph.len(),
            started_at: self.started_at,
        }));

        self.advance();
        loop {
            if self.active == 0 {
                if self.all_terminal() {
                    break;
                }
                // Only manual gates (and what waits behind them) remain.
                let can_wait = self.config.wait_for_approvals
                    && self.commands_open
                    && self.cancel_reason.is_none();
                if !can_wait {
                    self.finalize_blocked();
                    break;
                }
                debug!(run_id = %self.run_id, "Waiting for manual approvals");
            }

            let event = tokio::select! {
                msg = self.results_rx.recv() => LoopEvent::Worker(msg),
                cmd = self.commands.recv(), if self.commands_open => LoopEvent::Command(cmd),
            };

            match event {
                LoopEvent::Worker(Some(msg)) => self.on_worker_message(msg),
                LoopEvent::Worker(None) => {
                    error!(run_id = %self.run_id, "Worker channel closed unexpectedly");
                    break;
                }
                LoopEvent::Command(Some(cmd)) => self.on_command(cmd),
                LoopEvent::Command(None) => self.commands_open = false,
            }
            self.advance();
        }

        self.finish()
    }

    fn all_terminal(&self) -> bool {
        self.records.values().all(|r| r.report.status.is_terminal())
    }

    fn status(&self, idx: NodeIndex) -> JobStatus {
        self.records
            .get(&idx)
            .map(|r| r.report.status)
            .unwrap_or(JobStatus::Pending)
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Move an instance to `to`, emitting a status event. Invalid moves are
    /// logged and ignored.
    fn transition(&mut self, idx: NodeIndex, to: JobStatus) {
        let Some(record) = self.records.get_mut(&idx) else {
            return;
        };
        let from = record.report.status;
        if !from.can_transition_to(to) {
            let err = Error::InvalidTransition {
                key: record.report.key.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            };
            error!(run_id = %self.run_id, error = %err, "Rejected state transition");
            return;
        }
        record.report.status = to;
        if to.is_terminal() {
            record.report.finished_at = Some(Utc::now());
            record.report.duration_ms = record
                .first_started
                .map(|start| start.elapsed().as_millis() as u64);
        }

        debug!(run_id = %self.run_id, key = %record.report.key, from = %from, to = %to, "Job status changed");
        let event = Event::JobStatusChanged(JobStatusChangedPayload {
            run_id: self.run_id,
            key: record.report.key.clone(),
            from,
            to,
            failure: record.report.failure.clone(),
            cancel_reason: record.report.cancel_reason.clone(),
            at: Utc::now(),
        });
        self.emit(event);
    }

    fn cancel_instance(&mut self, idx: NodeIndex, reason: CancelReason) {
        if let Some(record) = self.records.get_mut(&idx) {
            record.report.cancel_reason = Some(reason);
        }
        self.transition(idx, JobStatus::Canceled);
    }

    fn skip_instance(&mut self, idx: NodeIndex, reason: CancelReason) {
        if let Some(record) = self.records.get_mut(&idx) {
            record.report.cancel_reason = Some(reason);
        }
        self.transition(idx, JobStatus::Skipped);
    }

    fn fail_instance(&mut self, idx: NodeIndex, reason: FailureReason) {
        let instance = self.graph.instance(idx);
        warn!(run_id = %self.run_id, key = %instance.key, reason = %reason, "Job failed");
        let allow_failure = instance.allow_failure;
        if let Some(record) = self.records.get_mut(&idx) {
            record.report.failure = Some(reason);
            record.failure_seen = record.failure_seen || !allow_failure;
        }
        self.transition(idx, JobStatus::Failed);
    }

    /// Promote and dispatch until nothing changes.
    fn advance(&mut self) {
        loop {
            let promoted = self.promote_pending();
            let dispatched = self.dispatch();
            if !promoted && !dispatched {
                break;
            }
        }
    }

    /// Decide every Pending instance whose upstream is all terminal.
    fn promote_pending(&mut self) -> bool {
        if self.cancel_reason.is_some() {
            return false;
        }

        let mut changed = false;
        let indices: Vec<NodeIndex> = self.graph.indices().collect();
        for idx in indices {
            if self.status(idx) != JobStatus::Pending {
                continue;
            }
            let preds = self.graph.predecessors(idx);
            if preds.iter().any(|(p, _)| !self.status(*p).is_terminal()) {
                continue;
            }

            let failed_upstream = preds
                .iter()
                .map(|(p, _)| *p)
                .filter(|p| self.records.get(p).is_some_and(|r| r.failure_seen))
                .map(|p| self.graph.instance(p).key.clone())
                .min();

            if let Some(record) = self.records.get_mut(&idx) {
                record.failure_seen = failed_upstream.is_some();
            }

            let when = self.graph.instance(idx).when;
            match (when, failed_upstream) {
                (WhenPolicy::OnSuccess | WhenPolicy::Manual, Some(upstream)) => {
                    self.cancel_instance(
                        idx,
                        CancelReason::UpstreamFailed {
                            upstream: upstream.to_string(),
                        },
                    );
                }
                (WhenPolicy::OnFailure, None) => {
                    self.skip_instance(idx, CancelReason::NoUpstreamFailure);
                }
                (WhenPolicy::Never, _) => {
                    self.skip_instance(idx, CancelReason::NoUpstreamFailure);
                }
                _ => self.transition(idx, JobStatus::Eligible),
            }
            changed = true;
        }
        changed
    }

    fn dispatch(&mut self) -> bool {
        if self.cancel_reason.is_some() {
            return false;
        }

        let mut changed = false;
        let eligible: Vec<NodeIndex> = self
            .graph
            .indices()
            .filter(|&idx| self.status(idx) == JobStatus::Eligible)
            .collect();

        let mut queue = ReadyQueue::new();
        for idx in eligible {
            let instance = self.graph.instance(idx);
            let gate_passed = self.records.get(&idx).is_some_and(|r| r.gate_passed);

            if instance.when == WhenPolicy::Manual && !gate_passed {
                self.open_gate(idx);
                let early = self
                    .records
                    .get(&idx)
                    .filter(|r| r.approved)
                    .map(|r| r.approver.clone());
                if let Some(approver) = early {
                    self.release_gate(idx, approver);
                }
                changed = true;
                continue;
            }
            if !self.pool.can_ever_serve(instance.tags()) {
                let tags = instance.tags().iter().cloned().collect();
                self.fail_instance(idx, FailureReason::NoMatchingRunner { tags });
                changed = true;
                continue;
            }
            queue.push(ReadyJob {
                idx,
                key: instance.key.clone(),
                downstream: self.graph.downstream_count(idx),
            });
        }

        while self.active < self.config.concurrency {
            let pool = &self.pool;
            let graph = &self.graph;
            let Some(job) =
                queue.pop_where(|job| pool.has_free(graph.instance(job.idx).tags()))
            else {
                break;
            };
            let tags = self.graph.instance(job.idx).tags().clone();
            let Some(slot) = self.pool.acquire(&tags) else {
                break;
            };
            self.spawn(job.idx, slot);
            changed = true;
        }
        changed
    }

    fn open_gate(&mut self, idx: NodeIndex) {
        let key = self.graph.instance(idx).key.clone();
        self.gates.insert(idx, ManualGate::new(key.clone()));
        self.transition(idx, JobStatus::ManualPending);

        if self.records.get(&idx).is_some_and(|r| r.approved) {
            return;
        }
        info!(run_id = %self.run_id, key = %key, "Waiting for manual approval");
        self.emit(Event::ApprovalRequested(ApprovalPayload {
            run_id: self.run_id,
            key,
            approved_by: None,
        }));
    }

    fn spawn(&mut self, idx: NodeIndex, slot: usize) {
        let worker = self.pool.name(slot).to_string();
        let attempt = match self.records.get_mut(&idx) {
            Some(record) => {
                record.report.attempts += 1;
                record.report.worker = Some(worker.clone());
                record.slot = Some(slot);
                record.report.failure = None;
                record.report.attempts
            }
            None => return,
        };
        self.transition(idx, JobStatus::Dispatched);

        let instance = self.graph.instance(idx);
        if !instance.template.interruptible {
            self.non_interruptible_started = true;
        }
        let request = self.build_request(idx, attempt);
        let timeout = instance.template.timeout.or(self.config.default_timeout);
        info!(run_id = %self.run_id, key = %instance.key, attempt, worker = %worker, "Dispatching job");

        let executor = self.executor.clone();
        let tx = self.results_tx.clone();
        let cancel = self.cancel_tx.subscribe();
        let grace = self.config.grace_period;
        self.active += 1;

        tokio::spawn(async move {
            let _ = tx.send(WorkerMessage::Started { idx, attempt });
            let result = run_attempt(executor, request, cancel, timeout, grace).await;
            let _ = tx.send(WorkerMessage::Finished {
                idx,
                attempt,
                result,
            });
        });
    }

    fn build_request(&self, idx: NodeIndex, attempt: u32) -> JobRequest {
        let instance: &JobInstance = self.graph.instance(idx);
        let upstream_artifacts = self
            .graph
            .predecessors(idx)
            .into_iter()
            .filter(|(_, dep)| dep.artifacts)
            .filter_map(|(p, _)| {
                let record = self.records.get(&p)?;
                if record.report.status != JobStatus::Succeeded || record.report.artifacts.is_empty()
                {
                    return None;
                }
                Some(ArtifactRecord {
                    instance: record.report.key.clone(),
                    paths: record.report.artifacts.clone(),
                })
            })
            .collect();

        JobRequest {
            run_id: self.run_id,
            key: instance.key.clone(),
            job_name: instance.name().to_string(),
            stage: instance.template.stage.clone(),
            attempt,
            variables: instance.variables.as_map().clone(),
            before_script: instance.template.before_script.clone(),
            script: instance.template.script.clone(),
            after_script: instance.template.after_script.clone(),
            artifacts: instance.template.artifacts.clone(),
            upstream_artifacts,
            timeout: instance.template.timeout.or(self.config.default_timeout),
        }
    }

    fn on_worker_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Started { idx, attempt } => {
                let current = self.records.get_mut(&idx).is_some_and(|record| {
                    if record.report.attempts != attempt {
                        return false;
                    }
                    if record.first_started.is_none() {
                        record.first_started = Some(Instant::now());
                        record.report.started_at = Some(Utc::now());
                    }
                    true
                });
                if current && self.status(idx) == JobStatus::Dispatched {
                    self.transition(idx, JobStatus::Running);
                }
            }
            WorkerMessage::Finished {
                idx,
                attempt,
                result,
            } => self.on_finished(idx, attempt, result),
        }
    }

    fn on_finished(&mut self, idx: NodeIndex, attempt: u32, result: AttemptResult) {
        self.active = self.active.saturating_sub(1);
        let Some(record) = self.records.get_mut(&idx) else {
            return;
        };
        if let Some(slot) = record.slot.take() {
            self.pool.release(slot);
        }
        if record.report.attempts != attempt {
            warn!(run_id = %self.run_id, key = %record.report.key, attempt, "Ignoring result of stale attempt");
            return;
        }

        let instance = self.graph.instance(idx);
        let key = instance.key.clone();
        let artifacts_config = instance.template.artifacts.clone();
        let retry = instance.template.retry.clone();

        let failure = match result {
            AttemptResult::Completed(outcome) => {
                let record = match self.records.get_mut(&idx) {
                    Some(record) => record,
                    None => return,
                };
                record.report.artifacts = outcome.artifacts.clone();
                record.report.reports = outcome.reports.clone();
                if !outcome.is_success() {
                    Some(FailureReason::ExitCode {
                        code: outcome.exit_code,
                    })
                } else if !outcome.missing_artifacts.is_empty() {
                    if artifacts_config.mandatory {
                        Some(FailureReason::ArtifactsMissing {
                            paths: outcome.missing_artifacts.clone(),
                        })
                    } else {
                        let message = format!(
                            "Job '{}' did not produce artifacts: {}",
                            key,
                            outcome.missing_artifacts.join(", ")
                        );
                        warn!(run_id = %self.run_id, key = %key, missing = ?outcome.missing_artifacts, "Declared artifacts missing");
                        self.warnings.push(message);
                        None
                    }
                } else {
                    None
                }
            }
            AttemptResult::Failed(reason) => Some(reason),
            AttemptResult::Canceled => {
                let reason = self.cancel_reason.clone().unwrap_or(CancelReason::Requested);
                self.cancel_instance(idx, reason);
                return;
            }
        };

        // Work that stopped because of the cancel signal is not a failure,
        // but an expired timeout is reported as one.
        if let Some(reason) = self.cancel_reason.clone()
            && failure
                .as_ref()
                .is_some_and(|f| !matches!(f, FailureReason::Timeout { .. }))
        {
            self.cancel_instance(idx, reason);
            return;
        }

        match failure {
            None => {
                info!(run_id = %self.run_id, key = %key, attempt, "Job succeeded");
                self.transition(idx, JobStatus::Succeeded);
            }
            Some(reason) if self.cancel_reason.is_none() && retry.should_retry(&reason, attempt) => {
                info!(run_id = %self.run_id, key = %key, attempt, reason = %reason, "Retrying job");
                if let Some(record) = self.records.get_mut(&idx) {
                    record.report.failure = Some(reason.clone());
                }
                self.transition(idx, JobStatus::Eligible);
                self.emit(Event::JobRetrying(JobRetryingPayload {
                    run_id: self.run_id,
                    key,
                    next_attempt: attempt + 1,
                    failure: reason,
                }));
            }
            Some(reason) => self.fail_instance(idx, reason),
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Approve {
                key,
                approver,
                reply,
            } => {
                let _ = reply.send(self.approve(&key, approver));
            }
            Command::Cancel { reply } => {
                self.begin_cancel(CancelReason::Requested);
                let _ = reply.send(Ok(()));
            }
            Command::Supersede { by, reply } => {
                let result = if self.is_interruptible() {
                    info!(run_id = %self.run_id, superseded_by = %by, "Run superseded");
                    self.emit(Event::RunSuperseded(RunSupersededPayload {
                        run_id: self.run_id,
                        superseded_by: by,
                        ref_name: self.ref_name.clone(),
                    }));
                    self.begin_cancel(CancelReason::Superseded);
                    Ok(())
                } else {
                    info!(run_id = %self.run_id, superseded_by = %by, "Run is not interruptible");
                    Err(Error::NotInterruptible)
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let snapshot = self
                    .graph
                    .indices()
                    .map(|idx| (self.graph.instance(idx).key.clone(), self.status(idx)))
                    .collect();
                let _ = reply.send(snapshot);
            }
        }
    }

    fn is_interruptible(&self) -> bool {
        self.interruptible && !self.non_interruptible_started
    }

    fn approve(&mut self, key: &str, approver: Option<String>) -> Result<()> {
        let idx = self
            .graph
            .index_of(key)
            .ok_or_else(|| Error::UnknownInstance(key.to_string()))?;
        let status = self.status(idx);
        let when = self.graph.instance(idx).when;

        let invalid = || Error::InvalidTransition {
            key: key.to_string(),
            from: status.to_string(),
            to: "approved".to_string(),
        };
        if when != WhenPolicy::Manual {
            return Err(invalid());
        }

        match status {
            JobStatus::ManualPending => {
                self.release_gate(idx, approver);
                Ok(())
            }
            JobStatus::Pending | JobStatus::Eligible => {
                debug!(run_id = %self.run_id, key = %key, "Manual job approved before its gate");
                if let Some(record) = self.records.get_mut(&idx) {
                    record.approved = true;
                    record.approver = approver;
                }
                Ok(())
            }
            _ => Err(invalid()),
        }
    }

    fn release_gate(&mut self, idx: NodeIndex, approver: Option<String>) {
        let key = self.graph.instance(idx).key.clone();
        if let Some(gate) = self.gates.get_mut(&idx) {
            gate.approve(approver.clone());
        }
        if let Some(record) = self.records.get_mut(&idx) {
            record.approved = true;
            record.gate_passed = true;
        }
        info!(run_id = %self.run_id, key = %key, "Manual job approved");
        self.transition(idx, JobStatus::Eligible);
        self.emit(Event::ApprovalGranted(ApprovalPayload {
            run_id: self.run_id,
            key,
            approved_by: approver,
        }));
    }

    /// Stop dispatching, cancel everything not yet running and signal running jobs.
    fn begin_cancel(&mut self, reason: CancelReason) {
        if self.cancel_reason.is_some() {
            return;
        }
        info!(run_id = %self.run_id, reason = %reason, "Canceling run");
        self.cancel_reason = Some(reason.clone());
        let _ = self.cancel_tx.send(true);

        let waiting: Vec<NodeIndex> = self
            .graph
            .indices()
            .filter(|&idx| {
                let status = self.status(idx);
                !status.is_terminal() && !status.is_active()
            })
            .collect();
        for idx in waiting {
            if let Some(gate) = self.gates.get_mut(&idx) {
                gate.abandon();
            }
            self.cancel_instance(idx, reason.clone());
        }
    }

    /// Nothing is running and nobody will approve: pending gates stay
    /// ManualPending and everything behind them is skipped.
    fn finalize_blocked(&mut self) {
        for gate in self.gates.values_mut() {
            gate.abandon();
        }

        let order: Vec<NodeIndex> = self
            .graph
            .topological_order()
            .into_iter()
            .filter_map(|i| self.graph.index_of(i.key.as_str()))
            .collect();

        for idx in order {
            match self.status(idx) {
                JobStatus::Pending => {
                    let gate = self
                        .blocking_gate(idx)
                        .map(|g| g.to_string())
                        .unwrap_or_default();
                    self.skip_instance(idx, CancelReason::BlockedByManual { gate });
                }
                JobStatus::Eligible => {
                    self.skip_instance(idx, CancelReason::Requested);
                }
                _ => {}
            }
        }
    }

    /// Nearest upstream instance still waiting at a manual gate.
    fn blocking_gate(&self, idx: NodeIndex) -> Option<InstanceKey> {
        let mut queue: VecDeque<NodeIndex> = VecDeque::from([idx]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            for (pred, _) in self.graph.predecessors(current) {
                if !seen.insert(pred) {
                    continue;
                }
                if self.status(pred) == JobStatus::ManualPending {
                    return Some(self.graph.instance(pred).key.clone());
                }
                queue.push_back(pred);
            }
        }
        None
    }

    fn finish(self) -> ExecutionReport {
        let mut records = self.records;
        let jobs: Vec<JobReport> = self
            .graph
            .topological_order()
            .into_iter()
            .filter_map(|instance| {
                let idx = self.graph.index_of(instance.key.as_str())?;
                records.remove(&idx).map(|r| r.report)
            })
            .collect();

        let status = ExecutionReport::aggregate_status(&jobs, self.cancel_reason.is_some());
        let finished_at = Utc::now();
        let duration_ms = self.started.elapsed().as_millis() as u64;

        info!(run_id = %self.run_id, status = %status, duration_ms, "Pipeline run finished");
        let _ = self.events.send(Event::RunCompleted(RunCompletedPayload {
            run_id: self.run_id,
            status,
            completed_at: finished_at,
            duration_ms,
        }));

        ExecutionReport {
            run_id: self.run_id,
            status,
            source: self.source,
            ref_name: self.ref_name,
            started_at: self.started_at,
            finished_at,
            duration_ms,
            jobs,
            warnings: self.warnings,
        }
    }
}

/// Run one attempt with its timeout, honoring the cancel signal with a grace period.
async fn run_attempt(
    executor: Arc<dyn JobExecutor>,
    request: JobRequest,
    cancel: watch::Receiver<bool>,
    timeout: Option<Duration>,
    grace: Duration,
) -> AttemptResult {
    let mut stop = cancel.clone();
    let execution = async move {
        match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, executor.execute(request, cancel)).await {
                    Ok(result) => AttemptResult::from(result),
                    Err(_) => AttemptResult::Failed(FailureReason::Timeout {
                        seconds: limit.as_secs(),
                    }),
                }
            }
            None => AttemptResult::from(executor.execute(request, cancel).await),
        }
    };
    tokio::pin!(execution);

    tokio::select! {
        result = &mut execution => result,
        _ = wait_for_cancel(&mut stop) => {
            match tokio::time::timeout(grace, &mut execution).await {
                Ok(result) => result,
                Err(_) => AttemptResult::Canceled,
            }
        }
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

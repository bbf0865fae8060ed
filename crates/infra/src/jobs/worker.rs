//! Analysis worker: leases tasks and drives a job through the pipeline.
//!
//! ```text
//! lease ──► record processing ──► stage 1 ─► ... ─► stage n ──► completed + ack
//!                                   │ transient, attempts left ──► retry (backoff)
//!                                   │ transient, last attempt  ──► failed + ack
//!                                   └ permanent                ──► failed + ack
//! ```
//!
//! Every successful stage writes the record first and then publishes a
//! progress event. Publishing is best-effort.
//!
//! The lease is renewed every third of its length while a stage runs and
//! again at each stage boundary, so only a dead or stalled worker loses it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use complyflow_analysis::{Pipeline, StageArtifacts, StageContext, StageError};
use complyflow_core::JobId;
use complyflow_events::{EventBus, ProgressEvent};

use super::queue::{QueueError, TaskQueue};
use super::record_store::{JobRecordStore, StoreError};
use super::types::{FailureReason, JobFailure, JobStatus, LeasedTask, RetryPolicy, TaskOutcome, messages};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name used for leases and logs
    pub name: String,
    /// How long a lease lasts before the task is redelivered elsewhere
    pub lease_duration: Duration,
    /// Per-stage execution timeout; exceeding it is a transient failure
    pub stage_timeout: Duration,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// Backoff for transient failures
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "analysis-worker".to_string(),
            lease_duration: Duration::from_secs(300),
            stage_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// How often a running delivery renews its lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_duration / 3).max(Duration::from_millis(1))
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    /// Deliveries dropped because another worker already settled the job
    pub superseded: u64,
    pub running: usize,
}

impl WorkerStats {
    fn merge(&mut self, other: &WorkerStats) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.retried += other.retried;
        self.superseded += other.superseded;
        self.running += other.running;
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was deliverable.
    Idle,
    Completed(JobId),
    Failed(JobId),
    /// Handed back to the queue for redelivery.
    Retried { job_id: JobId, attempt: u32, delay: Duration },
    /// The lease or the record was already taken over; nothing was written.
    Superseded(JobId),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

type Step<T> = Result<T, Halt>;

/// Early exit from a delivery.
enum Halt {
    Superseded,
    Error(WorkerError),
}

impl From<StoreError> for Halt {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidTransition(_) => Halt::Superseded,
            other => Halt::Error(other.into()),
        }
    }
}

impl From<QueueError> for Halt {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::LeaseLost(_) => Halt::Superseded,
            other => Halt::Error(other.into()),
        }
    }
}

/// Executes analysis tasks from a [`TaskQueue`].
///
/// Cheap to clone; clones share the store, queue, bus and pipeline.
pub struct AnalysisWorker<B> {
    records: Arc<dyn JobRecordStore>,
    queue: Arc<dyn TaskQueue>,
    bus: B,
    pipeline: Arc<Pipeline>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<B: Clone> Clone for AnalysisWorker<B> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            queue: self.queue.clone(),
            bus: self.bus.clone(),
            pipeline: self.pipeline.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<B> AnalysisWorker<B>
where
    B: EventBus<ProgressEvent> + Clone + 'static,
{
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        queue: Arc<dyn TaskQueue>,
        bus: B,
        pipeline: Arc<Pipeline>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            records,
            queue,
            bus,
            pipeline,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().expect("worker stats lock poisoned").clone()
    }

    /// Lease at most one task and run it to a settled, retried or
    /// superseded state.
    pub async fn run_once(&self) -> Result<RunOutcome, WorkerError> {
        let Some(task) = self.queue.lease(&self.config.name, self.config.lease_duration).await? else {
            return Ok(RunOutcome::Idle);
        };

        debug!(
            worker = %self.config.name,
            job_id = %task.job_id,
            attempt = task.attempt,
            "leased task"
        );

        self.with_stats(|s| s.running += 1);
        let result = match self.execute(&task).await {
            Ok(outcome) => Ok(outcome),
            Err(Halt::Superseded) => {
                info!(worker = %self.config.name, job_id = %task.job_id, "job taken over elsewhere; dropping delivery");
                self.release_superseded(&task).await;
                Ok(RunOutcome::Superseded(task.job_id))
            }
            Err(Halt::Error(e)) => Err(e),
        };

        self.with_stats(|s| {
            s.running = s.running.saturating_sub(1);
            s.processed += 1;
            match &result {
                Ok(RunOutcome::Completed(_)) => s.succeeded += 1,
                Ok(RunOutcome::Failed(_)) => s.failed += 1,
                Ok(RunOutcome::Retried { .. }) => s.retried += 1,
                Ok(RunOutcome::Superseded(_)) => s.superseded += 1,
                Ok(RunOutcome::Idle) | Err(_) => {}
            }
        });

        result
    }

    async fn execute(&self, task: &LeasedTask) -> Step<RunOutcome> {
        let Some(record) = self.records.get(task.job_id).await? else {
            warn!(job_id = %task.job_id, "task references a missing job record; discarding");
            return Err(Halt::Superseded);
        };

        if record.status.is_terminal() {
            return Err(Halt::Superseded);
        }

        let started = self.records.mark_processing(task.job_id).await?;

        // Redelivered past the ceiling after a lost lease.
        if task.attempt > task.max_attempts {
            let failure = JobFailure::new(
                FailureReason::AttemptsExhausted,
                format!("redelivered as attempt {} of {}", task.attempt, task.max_attempts),
            );
            return self.fail(task, failure).await;
        }

        // A redelivery restarts the pipeline but reports the stored high-water
        // mark, so the frame keeps the message that goes with it.
        let (progress, message) = if started.progress > 0 {
            (started.progress, started.progress_message)
        } else {
            let progress = self
                .records
                .record_progress(task.job_id, 0, messages::STARTING)
                .await?;
            (progress, messages::STARTING.to_string())
        };
        self.publish(ProgressEvent::new(task.job_id, task.tenant_id, progress, message));

        let ctx = StageContext {
            job_id: task.job_id,
            tenant_id: task.tenant_id,
            attempt: task.attempt,
            payload: &task.payload,
        };
        let mut artifacts = StageArtifacts::default();

        for (index, (spec, stage)) in self.pipeline.stages().enumerate() {
            self.renew_lease(task).await?;

            let run = tokio::time::timeout(self.config.stage_timeout, stage.run(&ctx, &mut artifacts));
            let result = match self.with_heartbeat(task, run).await? {
                Ok(r) => r,
                Err(_) => Err(StageError::TimedOut {
                    stage: spec.name.clone(),
                    after: self.config.stage_timeout,
                }),
            };

            if let Err(err) = result {
                return self.on_stage_error(task, &spec.name, err).await;
            }

            let progress = self
                .records
                .record_progress(task.job_id, self.pipeline.progress_after(index), &spec.message)
                .await?;
            self.publish(ProgressEvent::new(task.job_id, task.tenant_id, progress, spec.message.clone()));
            debug!(job_id = %task.job_id, stage = %spec.name, progress, "stage finished");
        }

        let Some(result_ref) = artifacts.result_ref else {
            let failure = JobFailure::new(
                FailureReason::PermanentStageError,
                "pipeline finished without storing a result",
            );
            return self.fail(task, failure).await;
        };

        self.records.mark_completed(task.job_id, result_ref).await?;
        self.publish(ProgressEvent::completed(task.job_id, task.tenant_id, messages::COMPLETE));
        self.settle(task, TaskOutcome::Completed).await;

        info!(job_id = %task.job_id, attempt = task.attempt, "analysis completed");
        Ok(RunOutcome::Completed(task.job_id))
    }

    async fn on_stage_error(&self, task: &LeasedTask, stage: &str, err: StageError) -> Step<RunOutcome> {
        if !err.is_transient() {
            warn!(job_id = %task.job_id, stage, error = %err, "permanent stage failure");
            return self
                .fail(task, JobFailure::new(FailureReason::PermanentStageError, err.to_string()))
                .await;
        }

        if task.attempt >= task.max_attempts {
            warn!(
                job_id = %task.job_id,
                stage,
                attempt = task.attempt,
                error = %err,
                "transient stage failure on final attempt"
            );
            return self
                .fail(task, JobFailure::new(FailureReason::AttemptsExhausted, err.to_string()))
                .await;
        }

        let delay = self.config.retry.delay_for_attempt(task.attempt);
        warn!(
            job_id = %task.job_id,
            stage,
            attempt = task.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient stage failure; scheduling retry"
        );
        self.queue.retry(task, delay).await?;

        Ok(RunOutcome::Retried {
            job_id: task.job_id,
            attempt: task.attempt,
            delay,
        })
    }

    /// Drive `work` to completion, renewing the lease on every heartbeat.
    /// Losing the lease drops `work` and supersedes the delivery.
    async fn with_heartbeat<F: Future>(&self, task: &LeasedTask, work: F) -> Step<F::Output> {
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                out = &mut work => return Ok(out),
                _ = heartbeat.tick() => self.renew_lease(task).await?,
            }
        }
    }

    /// A lost lease means another worker owns the job now. Any other
    /// failure is retried on the next heartbeat.
    async fn renew_lease(&self, task: &LeasedTask) -> Step<()> {
        match self.queue.extend(task, self.config.lease_duration).await {
            Ok(()) => Ok(()),
            Err(QueueError::LeaseLost(_)) => {
                warn!(worker = %self.config.name, job_id = %task.job_id, attempt = task.attempt, "lease lost mid-run");
                Err(Halt::Superseded)
            }
            Err(e) => {
                warn!(job_id = %task.job_id, error = %e, "lease renewal failed");
                Ok(())
            }
        }
    }

    async fn fail(&self, task: &LeasedTask, failure: JobFailure) -> Step<RunOutcome> {
        self.records.mark_failed(task.job_id, failure).await?;
        self.publish(ProgressEvent::failed(task.job_id, task.tenant_id, messages::FAILED));
        self.settle(task, TaskOutcome::Failed).await;
        Ok(RunOutcome::Failed(task.job_id))
    }

    /// Settle a delivery whose job was finished by someone else. A job still
    /// in flight elsewhere is left alone; its lease holder settles it.
    async fn release_superseded(&self, task: &LeasedTask) {
        let outcome = match self.records.get(task.job_id).await {
            Ok(Some(r)) if r.status == JobStatus::Completed => TaskOutcome::Completed,
            Ok(Some(r)) if r.status == JobStatus::Failed => TaskOutcome::Failed,
            Ok(None) => TaskOutcome::Failed,
            _ => return,
        };
        if let Err(e) = self.queue.ack(task, outcome).await {
            debug!(job_id = %task.job_id, error = %e, "superseded delivery not acknowledged");
        }
    }

    /// Ack after the record is already terminal. A failed ack only means
    /// the entry may be delivered again, and that delivery will see the
    /// terminal record and settle it.
    async fn settle(&self, task: &LeasedTask, outcome: TaskOutcome) {
        if let Err(e) = self.queue.ack(task, outcome).await {
            warn!(job_id = %task.job_id, error = %e, "failed to acknowledge settled task");
        }
    }

    fn publish(&self, event: ProgressEvent) {
        let job_id = event.job_id;
        if let Err(e) = self.bus.publish(event) {
            warn!(job_id = %job_id, error = %e, "progress broadcast failed; dropping frame");
        }
    }

    fn with_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut s) = self.stats.lock() {
            f(&mut s);
        }
    }

    /// Run the poll loop on the tokio runtime until shut down.
    pub fn spawn(self) -> WorkerHandle
    where
        B: Send + Sync,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(worker_loop(self, shutdown_rx));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    /// Spawn `count` workers sharing this one's collaborators, named
    /// `<name>-<n>`.
    pub fn spawn_pool(self, count: usize) -> WorkerPool
    where
        B: Send + Sync,
    {
        let handles = (0..count.max(1))
            .map(|n| {
                let mut worker = self.clone();
                worker.config.name = format!("{}-{n}", self.config.name);
                worker.stats = Arc::new(Mutex::new(WorkerStats::default()));
                worker.spawn()
            })
            .collect();
        WorkerPool { handles }
    }
}

async fn worker_loop<B>(worker: AnalysisWorker<B>, mut shutdown: watch::Receiver<bool>)
where
    B: EventBus<ProgressEvent> + Clone + Send + Sync + 'static,
{
    info!(worker = %worker.config.name, "analysis worker started");

    while !*shutdown.borrow() {
        let idle = match worker.run_once().await {
            Ok(RunOutcome::Idle) => true,
            Ok(_) => false,
            Err(e) => {
                error!(worker = %worker.config.name, error = %e, "worker poll failed");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(worker.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    info!(worker = %worker.config.name, "analysis worker stopped");
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Finish the current task, then stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Totals across every worker in the pool.
    pub fn stats(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for h in &self.handles {
            total.merge(&h.stats());
        }
        total
    }

    pub async fn shutdown(self) {
        for h in self.handles {
            h.shutdown().await;
        }
    }
}

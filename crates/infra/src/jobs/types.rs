//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use complyflow_analysis::{AnalysisPayload, InputRef, ResultRef};
use complyflow_core::{DomainError, JobId, TenantId};
use complyflow_events::ProgressEvent;

/// Job record lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created and enqueued, no worker has leased it yet
    Pending,
    /// A worker holds the lease and is running the pipeline
    Processing,
    /// Every stage succeeded and the result is stored
    Completed,
    /// Permanent error, attempts exhausted, or enqueue failure
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only transitions. `Pending -> Failed` exists only for the
    /// enqueue-failure path; see [`JobRecord::fail`].
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Why a job ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The record was created but the task could not be enqueued.
    EnqueueFailed,
    /// A stage reported malformed or unsupported input.
    PermanentStageError,
    /// Transient failures consumed every delivery attempt.
    AttemptsExhausted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::EnqueueFailed => "enqueue_failed",
            FailureReason::PermanentStageError => "permanent_stage_error",
            FailureReason::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

impl core::str::FromStr for FailureReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueue_failed" => Ok(FailureReason::EnqueueFailed),
            "permanent_stage_error" => Ok(FailureReason::PermanentStageError),
            "attempts_exhausted" => Ok(FailureReason::AttemptsExhausted),
            other => Err(DomainError::validation(format!("unknown failure reason '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    /// Internal detail (stage error text). Not shown to clients verbatim.
    pub detail: String,
}

impl JobFailure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// User-facing progress messages.
pub mod messages {
    pub const QUEUED: &str = "Analysis queued.";
    pub const STARTING: &str = "Initializing analysis engine...";
    pub const COMPLETE: &str = "Analysis complete!";
    pub const FAILED: &str = "Analysis failed. Please check your document format.";
}

/// Durable record of one analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    /// Last known progress, never decreasing while processing.
    pub progress: i16,
    pub progress_message: String,
    /// Set iff `status == Completed`.
    pub result_ref: Option<ResultRef>,
    pub failure: Option<JobFailure>,
    pub input_ref: InputRef,
    pub frameworks: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// New `pending` record for a payload about to be enqueued.
    pub fn pending(tenant_id: TenantId, payload: &AnalysisPayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            status: JobStatus::Pending,
            progress: 0,
            progress_message: messages::QUEUED.to_string(),
            result_ref: None,
            failure: None,
            input_ref: payload.input_ref.clone(),
            frameworks: payload.parameters.frameworks.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `pending -> processing`. Re-starting an already processing job (a
    /// redelivered task) is allowed and leaves progress untouched.
    pub fn start(&mut self) -> Result<(), DomainError> {
        if self.status == JobStatus::Processing {
            self.updated_at = Utc::now();
            return Ok(());
        }
        self.transition(JobStatus::Processing)?;
        self.progress_message = messages::STARTING.to_string();
        Ok(())
    }

    /// Record a stage boundary. Returns the effective progress, which never
    /// goes below what was already stored.
    pub fn advance(&mut self, progress: i16, message: &str) -> Result<i16, DomainError> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::invalid_transition(format!(
                "job {} is {}, progress can only be recorded while processing",
                self.id, self.status
            )));
        }
        let progress = progress.clamp(0, ProgressEvent::COMPLETE - 1);
        if progress >= self.progress {
            self.progress = progress;
            self.progress_message = message.to_string();
        }
        self.updated_at = Utc::now();
        Ok(self.progress)
    }

    pub fn complete(&mut self, result_ref: ResultRef) -> Result<(), DomainError> {
        self.transition(JobStatus::Completed)?;
        self.progress = ProgressEvent::COMPLETE;
        self.progress_message = messages::COMPLETE.to_string();
        self.result_ref = Some(result_ref);
        Ok(())
    }

    /// Terminal failure. Only an enqueue failure may fail a job that never
    /// reached `processing`.
    pub fn fail(&mut self, failure: JobFailure) -> Result<(), DomainError> {
        if self.status == JobStatus::Pending && failure.reason != FailureReason::EnqueueFailed {
            return Err(DomainError::invalid_transition(format!(
                "job {} must be processing before it can fail with {}",
                self.id,
                failure.reason.as_str()
            )));
        }
        self.transition(JobStatus::Failed)?;
        self.progress_message = messages::FAILED.to_string();
        self.failure = Some(failure);
        Ok(())
    }

    /// The view shared by the polling endpoint and the realtime sync frame.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            job_id: self.id,
            tenant_id: self.tenant_id,
            status: self.status,
            progress: match self.status {
                JobStatus::Failed => ProgressEvent::FAILED,
                JobStatus::Completed => ProgressEvent::COMPLETE,
                _ => self.progress,
            },
            message: self.progress_message.clone(),
            result_ref: self.result_ref.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Latest known state of a job as clients see it.
///
/// `progress` uses the same encoding as realtime frames: `-1` for failed,
/// `100` for completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    pub progress: i16,
    pub message: String,
    pub result_ref: Option<ResultRef>,
    pub updated_at: DateTime<Utc>,
}

/// Per-tenant status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn count(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    /// Count `n` jobs in `status` at once, e.g. one `GROUP BY` row.
    pub fn add(&mut self, status: JobStatus, n: usize) {
        self.total += n;
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
        }
    }
}

/// Exponential redelivery backoff: `base * 2^(attempt - 1)`, capped at
/// `max_delay`.
///
/// The attempt ceiling travels with each queue entry (`max_attempts`); the
/// policy only decides how long a transient failure waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }

    /// Redeliver right away; for tests and local runs.
    pub fn immediate() -> Self {
        Self::exponential(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before redelivering after `attempt` (1-indexed) failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Proof of an active lease. Required to settle or retry the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Final outcome recorded on an acknowledged entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    /// Deliverable once `available_at` has passed.
    Ready,
    Leased {
        worker: String,
        token: LeaseToken,
        until: DateTime<Utc>,
    },
    /// Acknowledged; never delivered again.
    Settled { outcome: TaskOutcome },
}

/// Request to enqueue one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub payload: AnalysisPayload,
    pub max_attempts: u32,
}

/// A queue entry as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub payload: AnalysisPayload,
    /// Delivery attempts so far, starting at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: TaskState,
    pub available_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskEntry {
    pub fn from_new(task: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            job_id: task.job_id,
            tenant_id: task.tenant_id,
            payload: task.payload,
            attempt: 1,
            max_attempts: task.max_attempts,
            state: TaskState::Ready,
            available_at: now,
            enqueued_at: now,
            updated_at: now,
        }
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.state {
            TaskState::Settled { outcome } => Some(outcome),
            _ => None,
        }
    }
}

/// What a worker receives from a successful lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedTask {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub payload: AnalysisPayload,
    pub attempt: u32,
    pub max_attempts: u32,
    pub token: LeaseToken,
    pub leased_until: DateTime<Utc>,
}

/// Convert a std duration for timestamp arithmetic, saturating on overflow.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

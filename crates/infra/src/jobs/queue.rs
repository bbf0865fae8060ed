//! Task queue: at-least-once delivery of job execution requests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use complyflow_core::JobId;

use super::types::{LeaseToken, LeasedTask, NewTask, TaskEntry, TaskOutcome, TaskState, chrono_duration};

/// Durable task queue with a lease/acknowledge protocol.
///
/// - `lease` hands an entry to exactly one worker until the lease expires.
/// - An expired lease makes the entry deliverable again with `attempt + 1`
///   (the worker is presumed dead).
/// - `extend` pushes the expiry of a live lease forward; a worker renews
///   while it runs so a slow but healthy delivery is never reclaimed.
/// - `ack` settles the entry for good; `retry` releases it for redelivery
///   after a delay with `attempt + 1`. All three require the current lease
///   token.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: NewTask) -> Result<(), QueueError>;

    /// Atomically take the next deliverable entry, if any.
    async fn lease(&self, worker: &str, lease_for: Duration) -> Result<Option<LeasedTask>, QueueError>;

    /// Renew a lease for another `lease_for` from now.
    async fn extend(&self, lease: &LeasedTask, lease_for: Duration) -> Result<(), QueueError>;

    async fn ack(&self, lease: &LeasedTask, outcome: TaskOutcome) -> Result<(), QueueError>;

    async fn retry(&self, lease: &LeasedTask, delay: Duration) -> Result<(), QueueError>;

    /// Inspect an entry, including settled ones.
    async fn get(&self, job_id: JobId) -> Result<Option<TaskEntry>, QueueError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("task already enqueued for job {0}")]
    AlreadyEnqueued(JobId),
    #[error("no task for job {0}")]
    NotFound(JobId),
    /// The caller's lease expired or was superseded by another delivery.
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// In-memory task queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    entries: Mutex<HashMap<JobId, TaskEntry>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, settled ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("task queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries not yet settled.
    pub fn outstanding(&self) -> usize {
        self.entries
            .lock()
            .expect("task queue lock poisoned")
            .values()
            .filter(|e| !matches!(e.state, TaskState::Settled { .. }))
            .count()
    }

    /// Make a delayed entry deliverable right away.
    pub fn release_now(&self, job_id: JobId) {
        if let Some(entry) = self.entries.lock().expect("task queue lock poisoned").get_mut(&job_id) {
            entry.available_at = Utc::now();
        }
    }

    fn check_lease<'a>(
        entries: &'a mut HashMap<JobId, TaskEntry>,
        lease: &LeasedTask,
    ) -> Result<&'a mut TaskEntry, QueueError> {
        let entry = entries.get_mut(&lease.job_id).ok_or(QueueError::NotFound(lease.job_id))?;
        let current = matches!(&entry.state, TaskState::Leased { token, .. } if *token == lease.token)
            && entry.attempt == lease.attempt;
        if current {
            Ok(entry)
        } else {
            Err(QueueError::LeaseLost(lease.job_id))
        }
    }
}

/// When an entry can next be delivered, or `None` if it can't be.
fn deliverable_since(entry: &TaskEntry, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match &entry.state {
        TaskState::Ready if entry.available_at <= now => Some(entry.available_at),
        TaskState::Leased { until, .. } if *until <= now => Some(*until),
        _ => None,
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().expect("task queue lock poisoned");
        if entries.contains_key(&task.job_id) {
            return Err(QueueError::AlreadyEnqueued(task.job_id));
        }
        entries.insert(task.job_id, TaskEntry::from_new(task, Utc::now()));
        Ok(())
    }

    async fn lease(&self, worker: &str, lease_for: Duration) -> Result<Option<LeasedTask>, QueueError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().expect("task queue lock poisoned");

        let next = entries
            .values()
            .filter_map(|e| deliverable_since(e, now).map(|at| (at, e.enqueued_at, e.job_id)))
            .min()
            .map(|(_, _, job_id)| job_id);

        let Some(entry) = next.and_then(|id| entries.get_mut(&id)) else {
            return Ok(None);
        };

        if let TaskState::Leased { worker: previous, .. } = &entry.state {
            entry.attempt += 1;
            debug!(job_id = %entry.job_id, previous = %previous, attempt = entry.attempt, "reclaimed expired lease");
        }

        let token = LeaseToken::new();
        let until = now + chrono_duration(lease_for);
        entry.state = TaskState::Leased {
            worker: worker.to_string(),
            token,
            until,
        };
        entry.updated_at = now;

        Ok(Some(LeasedTask {
            job_id: entry.job_id,
            tenant_id: entry.tenant_id,
            payload: entry.payload.clone(),
            attempt: entry.attempt,
            max_attempts: entry.max_attempts,
            token,
            leased_until: until,
        }))
    }

    async fn extend(&self, lease: &LeasedTask, lease_for: Duration) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().expect("task queue lock poisoned");
        let entry = Self::check_lease(&mut entries, lease)?;
        let now = Utc::now();
        if let TaskState::Leased { until, .. } = &mut entry.state {
            *until = now + chrono_duration(lease_for);
        }
        entry.updated_at = now;
        Ok(())
    }

    async fn ack(&self, lease: &LeasedTask, outcome: TaskOutcome) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().expect("task queue lock poisoned");
        let entry = Self::check_lease(&mut entries, lease)?;
        entry.state = TaskState::Settled { outcome };
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn retry(&self, lease: &LeasedTask, delay: Duration) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().expect("task queue lock poisoned");
        let entry = Self::check_lease(&mut entries, lease)?;
        let now = Utc::now();
        entry.attempt += 1;
        entry.state = TaskState::Ready;
        entry.available_at = now + chrono_duration(delay);
        entry.updated_at = now;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<TaskEntry>, QueueError> {
        Ok(self.entries.lock().expect("task queue lock poisoned").get(&job_id).cloned())
    }
}

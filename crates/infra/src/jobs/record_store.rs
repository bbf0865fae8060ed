//! Job record storage.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use complyflow_analysis::ResultRef;
use complyflow_core::{DomainError, JobId, TenantId};

use super::types::{JobFailure, JobRecord, JobStats, JobStatus};

/// Durable store for job records.
///
/// Every mutation is atomic per job. Writers are the producer (create, and
/// rollback of a record whose task never made it into the queue) and the
/// worker (all later transitions).
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Remove a record that is still `pending`. Used only to roll back a
    /// submission whose enqueue failed.
    async fn delete_pending(&self, job_id: JobId) -> Result<(), StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Get a record, refusing to reveal it to another tenant.
    async fn get_for_tenant(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// `pending -> processing`; a no-op on a record that is already processing.
    async fn mark_processing(&self, job_id: JobId) -> Result<JobRecord, StoreError>;

    /// Store a stage boundary; returns the effective (monotonic) progress.
    async fn record_progress(&self, job_id: JobId, progress: i16, message: &str) -> Result<i16, StoreError>;

    async fn mark_completed(&self, job_id: JobId, result_ref: ResultRef) -> Result<JobRecord, StoreError>;

    async fn mark_failed(&self, job_id: JobId, failure: JobFailure) -> Result<JobRecord, StoreError>;

    /// Most recently updated record of the tenant.
    async fn latest_for_tenant(&self, tenant_id: TenantId) -> Result<Option<JobRecord>, StoreError>;

    /// Newest first, by creation time.
    async fn list_recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<JobRecord>, StoreError>;

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, StoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition(msg) => StoreError::InvalidTransition(msg),
            DomainError::TenantIsolation => StoreError::TenantIsolation,
            other => StoreError::Storage(other.to_string()),
        }
    }
}

/// In-memory record store for tests/dev.
///
/// Also keeps the sequence of statuses each job went through, which the
/// test suites use to check that lifecycles only move forward.
#[derive(Debug, Default)]
pub struct InMemoryJobRecordStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
    history: RwLock<HashMap<JobId, Vec<JobStatus>>>,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses the job has been in, oldest first.
    pub fn status_history(&self, job_id: JobId) -> Vec<JobStatus> {
        self.history
            .read()
            .expect("record history lock poisoned")
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("record store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mutate<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut JobRecord) -> Result<T, DomainError>,
    ) -> Result<(T, JobRecord), StoreError> {
        let mut records = self.records.write().expect("record store lock poisoned");
        let record = records.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;

        // Work on a copy so a rejected transition leaves the stored record intact.
        let mut next = record.clone();
        let out = f(&mut next)?;

        if next.status != record.status {
            self.history
                .write()
                .expect("record history lock poisoned")
                .entry(job_id)
                .or_default()
                .push(next.status);
        }
        *record = next.clone();
        Ok((out, next))
    }

    fn tenant_records(&self, tenant_id: TenantId) -> Vec<JobRecord> {
        self.records
            .read()
            .expect("record store lock poisoned")
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobRecordStore {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("record store lock poisoned");
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        self.history
            .write()
            .expect("record history lock poisoned")
            .insert(record.id, vec![record.status]);
        records.insert(record.id, record);
        Ok(())
    }

    async fn delete_pending(&self, job_id: JobId) -> Result<(), StoreError> {
        let mut records = self.records.write().expect("record store lock poisoned");
        match records.get(&job_id) {
            None => Err(StoreError::NotFound(job_id)),
            Some(r) if r.status != JobStatus::Pending => Err(StoreError::InvalidTransition(format!(
                "job {job_id} is {}, only pending jobs can be removed",
                r.status
            ))),
            Some(_) => {
                records.remove(&job_id);
                self.history
                    .write()
                    .expect("record history lock poisoned")
                    .remove(&job_id);
                Ok(())
            }
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .expect("record store lock poisoned")
            .get(&job_id)
            .cloned())
    }

    async fn get_for_tenant(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let records = self.records.read().expect("record store lock poisoned");
        match records.get(&job_id) {
            Some(r) if r.tenant_id == tenant_id => Ok(Some(r.clone())),
            Some(_) => Err(StoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn mark_processing(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        self.mutate(job_id, |r| r.start()).map(|(_, r)| r)
    }

    async fn record_progress(&self, job_id: JobId, progress: i16, message: &str) -> Result<i16, StoreError> {
        self.mutate(job_id, |r| r.advance(progress, message)).map(|(p, _)| p)
    }

    async fn mark_completed(&self, job_id: JobId, result_ref: ResultRef) -> Result<JobRecord, StoreError> {
        self.mutate(job_id, |r| r.complete(result_ref)).map(|(_, r)| r)
    }

    async fn mark_failed(&self, job_id: JobId, failure: JobFailure) -> Result<JobRecord, StoreError> {
        self.mutate(job_id, |r| r.fail(failure)).map(|(_, r)| r)
    }

    async fn latest_for_tenant(&self, tenant_id: TenantId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .tenant_records(tenant_id)
            .into_iter()
            .max_by_key(|r| (r.updated_at, r.id)))
    }

    async fn list_recent(&self, tenant_id: TenantId, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = self.tenant_records(tenant_id);
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, StoreError> {
        let mut stats = JobStats::default();
        for r in self.tenant_records(tenant_id) {
            stats.count(r.status);
        }
        Ok(stats)
    }
}

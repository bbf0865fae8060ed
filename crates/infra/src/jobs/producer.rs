//! Job submission.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use complyflow_analysis::{AnalysisParameters, AnalysisPayload, InputError, InputLocator, InputRef};
use complyflow_auth::{EntitlementError, EntitlementGate};
use complyflow_core::{JobId, TenantId};

use super::queue::{QueueError, TaskQueue};
use super::record_store::{JobRecordStore, StoreError};
use super::types::{FailureReason, JobFailure, JobRecord, NewTask};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    NotEntitled(#[from] EntitlementError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error("could not create job record: {0}")]
    Store(#[from] StoreError),

    /// Nothing is left behind: the record was rolled back or marked failed.
    #[error("could not enqueue job {job_id}: {source}")]
    Enqueue { job_id: JobId, source: QueueError },
}

/// Accepts analysis requests and hands them to the task queue.
///
/// `submit` returns once the task is enqueued; execution happens in the
/// worker pool.
#[derive(Clone)]
pub struct Producer {
    records: Arc<dyn JobRecordStore>,
    queue: Arc<dyn TaskQueue>,
    inputs: Arc<dyn InputLocator>,
    entitlements: Arc<dyn EntitlementGate>,
    max_attempts: u32,
}

impl Producer {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        queue: Arc<dyn TaskQueue>,
        inputs: Arc<dyn InputLocator>,
        entitlements: Arc<dyn EntitlementGate>,
        max_attempts: u32,
    ) -> Self {
        Self {
            records,
            queue,
            inputs,
            entitlements,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create a `pending` record and exactly one queue entry for it.
    ///
    /// Entitlement and input checks run first; a rejected request creates
    /// nothing. If the enqueue fails the record is removed, or failing that,
    /// marked `failed` with [`FailureReason::EnqueueFailed`].
    #[instrument(skip(self, input_ref, parameters), fields(tenant_id = %tenant_id, input_ref = %input_ref))]
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        input_ref: InputRef,
        parameters: AnalysisParameters,
    ) -> Result<JobId, SubmitError> {
        self.entitlements.ensure_entitled(tenant_id).await?;

        let location = self.inputs.locate(tenant_id, &input_ref).await?;
        let payload = AnalysisPayload {
            input_ref,
            location,
            parameters,
        };

        let record = JobRecord::pending(tenant_id, &payload);
        let job_id = record.id;
        self.records.create(record).await?;

        let task = NewTask {
            job_id,
            tenant_id,
            payload,
            max_attempts: self.max_attempts,
        };

        if let Err(source) = self.queue.enqueue(task).await {
            self.abandon(job_id, &source).await;
            return Err(SubmitError::Enqueue { job_id, source });
        }

        info!(job_id = %job_id, "analysis job submitted");
        Ok(job_id)
    }

    async fn abandon(&self, job_id: JobId, cause: &QueueError) {
        warn!(job_id = %job_id, error = %cause, "enqueue failed; rolling back job record");

        let rollback = match self.records.delete_pending(job_id).await {
            Ok(()) => return,
            Err(e) => e,
        };

        let failure = JobFailure::new(FailureReason::EnqueueFailed, cause.to_string());
        if let Err(e) = self.records.mark_failed(job_id, failure).await {
            error!(
                job_id = %job_id,
                rollback_error = %rollback,
                mark_failed_error = %e,
                "could not roll back or fail orphaned job record"
            );
        }
    }
}

impl core::fmt::Debug for Producer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Producer")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

//! Progress events emitted by workers at stage boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use complyflow_core::{JobId, TenantId};

/// One progress observation for a job.
///
/// Ephemeral: never stored as an entity of its own. The job record keeps the
/// last known progress so a reconnecting client can be re-synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    /// `0..=100`, or [`ProgressEvent::FAILED`].
    pub progress: i16,
    pub message: String,
    pub emitted_at: DateTime<Utc>,
}

impl ProgressEvent {
    /// Sentinel progress value for terminal failure.
    pub const FAILED: i16 = -1;
    /// Progress value for terminal success.
    pub const COMPLETE: i16 = 100;

    /// Build an in-flight event. `progress` is clamped into `0..=100`.
    pub fn new(job_id: JobId, tenant_id: TenantId, progress: i16, message: impl Into<String>) -> Self {
        Self {
            job_id,
            tenant_id,
            progress: progress.clamp(0, Self::COMPLETE),
            message: message.into(),
            emitted_at: Utc::now(),
        }
    }

    pub fn completed(job_id: JobId, tenant_id: TenantId, message: impl Into<String>) -> Self {
        Self::new(job_id, tenant_id, Self::COMPLETE, message)
    }

    pub fn failed(job_id: JobId, tenant_id: TenantId, message: impl Into<String>) -> Self {
        Self {
            job_id,
            tenant_id,
            progress: Self::FAILED,
            message: message.into(),
            emitted_at: Utc::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.progress == Self::FAILED
    }

    pub fn is_terminal(&self) -> bool {
        self.progress == Self::FAILED || self.progress == Self::COMPLETE
    }
}

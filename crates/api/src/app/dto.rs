use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use complyflow_analysis::{AnalysisParameters, InputRef, ResultRef};
use complyflow_core::JobId;
use complyflow_infra::jobs::{JobRecord, JobStats, JobStatus, StatusSnapshot};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitAnalysisRequest {
    pub input_ref: String,
    #[serde(default)]
    pub frameworks: Vec<String>,
}

impl SubmitAnalysisRequest {
    pub fn into_parts(self) -> Result<(InputRef, AnalysisParameters), axum::response::Response> {
        let input_ref = InputRef::new(self.input_ref)
            .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()))?;
        let parameters = AnalysisParameters::new(self.frameworks)
            .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()))?;
        Ok((input_ref, parameters))
    }
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

pub const SUBMITTED_MESSAGE: &str = "Analysis started. Connect to the realtime channel for progress updates.";

#[derive(Debug, Serialize)]
pub struct SubmitAnalysisResponse {
    pub analysis_id: JobId,
    pub status: &'static str,
    pub message: &'static str,
}

impl SubmitAnalysisResponse {
    pub fn accepted(analysis_id: JobId) -> Self {
        Self {
            analysis_id,
            status: JobStatus::Processing.as_str(),
            message: SUBMITTED_MESSAGE,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnalysisStatusResponse {
    pub analysis_id: JobId,
    pub status: JobStatus,
    pub progress: i16,
    pub message: String,
    pub result_ref: Option<ResultRef>,
    pub updated_at: DateTime<Utc>,
}

impl From<StatusSnapshot> for AnalysisStatusResponse {
    fn from(s: StatusSnapshot) -> Self {
        Self {
            analysis_id: s.job_id,
            status: s.status,
            progress: s.progress,
            message: s.message,
            result_ref: s.result_ref,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnalysisSummary {
    pub analysis_id: JobId,
    pub status: JobStatus,
    pub progress: i16,
    pub input_ref: String,
    pub frameworks: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for AnalysisSummary {
    fn from(r: &JobRecord) -> Self {
        Self {
            analysis_id: r.id,
            status: r.status,
            progress: r.snapshot().progress,
            input_ref: r.input_ref.to_string(),
            frameworks: r.frameworks.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub recent: Vec<AnalysisSummary>,
}

impl StatsResponse {
    pub fn new(stats: JobStats, recent: &[JobRecord]) -> Self {
        Self {
            total: stats.total,
            pending: stats.pending,
            processing: stats.processing,
            completed: stats.completed,
            failed: stats.failed,
            recent: recent.iter().map(AnalysisSummary::from).collect(),
        }
    }
}

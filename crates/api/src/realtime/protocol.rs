//! JSON text frames exchanged over the realtime WebSocket.

use serde::{Deserialize, Serialize};

use complyflow_analysis::ResultRef;
use complyflow_core::{JobId, TenantId};
use complyflow_events::ProgressEvent;
use complyflow_infra::jobs::{JobStatus, StatusSnapshot};

pub const NO_ANALYSES: &str = "No analyses yet.";

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join { tenant_id: TenantId },
    Leave,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Error {
        message: String,
    },
    /// Latest known status of the tenant; `job_id` is null when the tenant
    /// has no analyses.
    SyncStatus {
        job_id: Option<JobId>,
        status: Option<JobStatus>,
        progress: i16,
        message: String,
        result_ref: Option<ResultRef>,
    },
    /// `progress` is `-1` on terminal failure, `100` on terminal success.
    AnalysisProgress {
        job_id: JobId,
        progress: i16,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn sync(snapshot: Option<StatusSnapshot>) -> Self {
        match snapshot {
            Some(s) => ServerMessage::SyncStatus {
                job_id: Some(s.job_id),
                status: Some(s.status),
                progress: s.progress,
                message: s.message,
                result_ref: s.result_ref,
            },
            None => ServerMessage::SyncStatus {
                job_id: None,
                status: None,
                progress: 0,
                message: NO_ANALYSES.to_string(),
                result_ref: None,
            },
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"encoding failed"}"#.to_string())
    }
}

impl From<ProgressEvent> for ServerMessage {
    fn from(event: ProgressEvent) -> Self {
        ServerMessage::AnalysisProgress {
            job_id: event.job_id,
            progress: event.progress,
            message: event.message,
        }
    }
}

use async_trait::async_trait;

use complyflow_core::{JobId, TenantId};

use crate::error::StageError;
use crate::payload::AnalysisPayload;
use crate::report::{Finding, ResultRef, Rule};

/// Read-only facts about the execution a stage is part of.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    pub payload: &'a AnalysisPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub text: String,
    pub pages: u32,
}

/// Handle to the per-job embedding index built by the indexing stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHandle {
    pub index_id: String,
    pub chunks: usize,
}

/// Intermediate results handed from one stage to the next.
///
/// Starts empty on every attempt; nothing here survives a redelivery.
#[derive(Debug, Clone, Default)]
pub struct StageArtifacts {
    pub document: Option<ExtractedDocument>,
    pub index: Option<IndexHandle>,
    pub rules: Vec<Rule>,
    pub findings: Vec<Finding>,
    /// Set by the final stage once the report is durably stored.
    pub result_ref: Option<ResultRef>,
}

/// One step of the analysis pipeline.
///
/// Implementations wrap an external collaborator. They must be safe to invoke
/// repeatedly with the same payload, and they must classify their failures.
/// The caller enforces the execution timeout.
#[async_trait]
pub trait AnalysisStage: Send + Sync {
    async fn run(&self, ctx: &StageContext<'_>, artifacts: &mut StageArtifacts) -> Result<(), StageError>;
}

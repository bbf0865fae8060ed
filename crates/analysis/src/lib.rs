//! `complyflow-analysis`
//!
//! **Responsibility:** the boundary between job orchestration and the
//! document-analysis collaborators (extraction, embedding, rule retrieval,
//! AI evaluation, report generation).
//!
//! The orchestrator treats every stage as an opaque call with a structured
//! success/failure result. Stages must be safe to re-run from the top with
//! the same immutable payload.

pub mod error;
pub mod input;
pub mod payload;
pub mod pipeline;
pub mod report;
pub mod simulated;
pub mod stage;

pub use error::StageError;
pub use input::{InMemoryInputLocator, InputError, InputLocator};
pub use payload::{AnalysisParameters, AnalysisPayload, InputLocation, InputRef};
pub use pipeline::{Pipeline, PipelineBuilder, StageSpec, STAGE_PROGRESS_CEILING};
pub use report::{Finding, FindingStatus, ResultRef, Rule};
pub use stage::{AnalysisStage, ExtractedDocument, IndexHandle, StageArtifacts, StageContext};

//! Declared, weighted stage list.
//!
//! Progress percentages are derived from stage weights rather than written
//! into the worker, so adding or removing a stage re-balances automatically.

use std::collections::HashSet;
use std::sync::Arc;

use complyflow_core::DomainError;

use crate::stage::AnalysisStage;

/// Highest progress value a stage boundary can report. `100` is reserved for
/// "completed and stored".
pub const STAGE_PROGRESS_CEILING: i16 = 95;

/// Name, relative cost and user-facing description of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub weight: u32,
    pub message: String,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, weight: u32, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight,
            message: message.into(),
        }
    }
}

/// The stage specs every standard deployment runs, in order.
pub fn standard_specs() -> [StageSpec; 5] {
    [
        StageSpec::new("extraction", 20, "Extracting text from document..."),
        StageSpec::new("indexing", 20, "Generating embeddings..."),
        StageSpec::new("retrieval", 20, "Consulting regulatory rule index..."),
        StageSpec::new("evaluation", 30, "Performing gap analysis against retrieved rules..."),
        StageSpec::new("reporting", 5, "Finalizing report..."),
    ]
}

/// Ordered stages plus the weights used to compute progress.
pub struct Pipeline {
    stages: Vec<(StageSpec, Arc<dyn AnalysisStage>)>,
    total_weight: u64,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The five standard stages with their declared weights.
    pub fn standard(
        extraction: Arc<dyn AnalysisStage>,
        indexing: Arc<dyn AnalysisStage>,
        retrieval: Arc<dyn AnalysisStage>,
        evaluation: Arc<dyn AnalysisStage>,
        reporting: Arc<dyn AnalysisStage>,
    ) -> Self {
        let [e, i, r, v, p] = standard_specs();
        Self::from_validated(vec![
            (e, extraction),
            (i, indexing),
            (r, retrieval),
            (v, evaluation),
            (p, reporting),
        ])
    }

    fn from_validated(stages: Vec<(StageSpec, Arc<dyn AnalysisStage>)>) -> Self {
        let total_weight = stages.iter().map(|(s, _)| u64::from(s.weight)).sum();
        Self { stages, total_weight }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> impl Iterator<Item = (&StageSpec, &Arc<dyn AnalysisStage>)> {
        self.stages.iter().map(|(spec, stage)| (spec, stage))
    }

    pub fn specs(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.iter().map(|(spec, _)| spec)
    }

    /// Progress to report once the stage at `index` has succeeded.
    pub fn progress_after(&self, index: usize) -> i16 {
        if self.total_weight == 0 {
            return 0;
        }
        let done: u64 = self
            .stages
            .iter()
            .take(index.saturating_add(1))
            .map(|(s, _)| u64::from(s.weight))
            .sum();
        let ceiling = STAGE_PROGRESS_CEILING as u64;
        (ceiling * done / self.total_weight) as i16
    }
}

impl core::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.specs().map(|s| s.name.as_str()).collect::<Vec<_>>())
            .field("total_weight", &self.total_weight)
            .finish()
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<(StageSpec, Arc<dyn AnalysisStage>)>,
}

impl PipelineBuilder {
    pub fn stage(mut self, spec: StageSpec, stage: Arc<dyn AnalysisStage>) -> Self {
        self.stages.push((spec, stage));
        self
    }

    /// Rejects empty pipelines, zero weights and duplicate names.
    pub fn build(self) -> Result<Pipeline, DomainError> {
        if self.stages.is_empty() {
            return Err(DomainError::validation("pipeline needs at least one stage"));
        }

        let mut seen = HashSet::new();
        for (spec, _) in &self.stages {
            if spec.weight == 0 {
                return Err(DomainError::validation(format!("stage '{}' has zero weight", spec.name)));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(DomainError::validation(format!("duplicate stage '{}'", spec.name)));
            }
        }

        Ok(Pipeline::from_validated(self.stages))
    }
}

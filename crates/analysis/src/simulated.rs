//! Deterministic stand-ins for the external analysis collaborators.
//!
//! Used by the dev server and the test suites. Behaviour depends only on the
//! payload, so re-running an attempt produces the same artifacts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::report::{Finding, FindingStatus, ResultRef, Rule};
use crate::stage::{AnalysisStage, ExtractedDocument, IndexHandle, StageArtifacts, StageContext};

const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "docx", "txt"];

/// Characters per embedding chunk.
const CHUNK_SIZE: usize = 64;

async fn pause(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// Cheap stable hash (FNV-1a) so simulated verdicts don't depend on
/// `HashMap` seeding.
fn stable_hash(parts: &[&str]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for b in part.bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
    }
    h
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedExtraction {
    pub latency: Duration,
}

#[async_trait]
impl AnalysisStage for SimulatedExtraction {
    async fn run(&self, ctx: &StageContext<'_>, artifacts: &mut StageArtifacts) -> Result<(), StageError> {
        pause(self.latency).await;

        let input = ctx.payload.input_ref.as_str();
        let extension = input.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some(ext) if SUPPORTED_EXTENSIONS.contains(&ext) => {}
            _ => {
                return Err(StageError::permanent(format!("unsupported document format: {input}")));
            }
        }

        let text = format!(
            "Extracted contents of {} ({})",
            input, ctx.payload.location.uri
        );
        let pages = 1 + (stable_hash(&[input]) % 12) as u32;
        debug!(job_id = %ctx.job_id, pages, "document extracted");
        artifacts.document = Some(ExtractedDocument { text, pages });
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedIndexing {
    pub latency: Duration,
}

#[async_trait]
impl AnalysisStage for SimulatedIndexing {
    async fn run(&self, ctx: &StageContext<'_>, artifacts: &mut StageArtifacts) -> Result<(), StageError> {
        pause(self.latency).await;

        let document = artifacts
            .document
            .as_ref()
            .ok_or_else(|| StageError::permanent("indexing requires an extracted document"))?;

        artifacts.index = Some(IndexHandle {
            index_id: format!("idx-{}", ctx.job_id),
            chunks: document.text.len() / CHUNK_SIZE + 1,
        });
        Ok(())
    }
}

/// Static rule catalog: `(framework, id, title, description)`.
const CATALOG: &[(&str, &str, &str, &str)] = &[
    ("GDPR", "GDPR-5", "Principles of processing", "Personal data is processed lawfully, fairly and transparently."),
    ("GDPR", "GDPR-30", "Records of processing", "The controller maintains a record of processing activities."),
    ("GDPR", "GDPR-32", "Security of processing", "Appropriate technical and organisational measures are in place."),
    ("HIPAA", "HIPAA-164.308", "Administrative safeguards", "A security management process is implemented."),
    ("HIPAA", "HIPAA-164.312", "Technical safeguards", "Access to ePHI is controlled and audited."),
    ("SOC2", "SOC2-CC6.1", "Logical access", "Logical access to information assets is restricted."),
    ("SOC2", "SOC2-CC7.2", "System monitoring", "System components are monitored for anomalies."),
    ("SOC2", "SOC2-CC8.1", "Change management", "Changes are authorised, tested and approved."),
    ("ISO27001", "ISO27001-A.5", "Information security policies", "Policies are defined and approved by management."),
    ("ISO27001", "ISO27001-A.9", "Access control", "Access to information is limited by business need."),
];

#[derive(Debug, Clone, Default)]
pub struct SimulatedRetrieval {
    pub latency: Duration,
}

#[async_trait]
impl AnalysisStage for SimulatedRetrieval {
    async fn run(&self, ctx: &StageContext<'_>, artifacts: &mut StageArtifacts) -> Result<(), StageError> {
        pause(self.latency).await;

        if artifacts.index.is_none() {
            return Err(StageError::permanent("retrieval requires an embedding index"));
        }

        let mut rules = Vec::new();
        for framework in &ctx.payload.parameters.frameworks {
            let matched: Vec<Rule> = CATALOG
                .iter()
                .filter(|(fw, ..)| fw == framework)
                .map(|(fw, id, title, description)| Rule {
                    id: (*id).to_string(),
                    framework: (*fw).to_string(),
                    title: (*title).to_string(),
                    description: (*description).to_string(),
                })
                .collect();

            if matched.is_empty() {
                return Err(StageError::permanent(format!("unknown framework: {framework}")));
            }
            rules.extend(matched);
        }

        artifacts.rules = rules;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedEvaluation {
    pub latency: Duration,
}

#[async_trait]
impl AnalysisStage for SimulatedEvaluation {
    async fn run(&self, ctx: &StageContext<'_>, artifacts: &mut StageArtifacts) -> Result<(), StageError> {
        pause(self.latency).await;

        let input = ctx.payload.input_ref.as_str();
        artifacts.findings = artifacts
            .rules
            .iter()
            .map(|rule| {
                let h = stable_hash(&[input, &rule.id]);
                let status = match h % 3 {
                    0 => FindingStatus::Compliant,
                    1 => FindingStatus::PartiallyCompliant,
                    _ => FindingStatus::NonCompliant,
                };
                let recommendation = (status != FindingStatus::Compliant)
                    .then(|| format!("Document controls addressing: {}", rule.title));

                Finding {
                    rule_id: rule.id.clone(),
                    framework: rule.framework.clone(),
                    status,
                    confidence: 0.70 + ((h >> 8) % 26) as f64 / 100.0,
                    evidence: vec![format!("{input}: section matching '{}'", rule.title)],
                    recommendation,
                }
            })
            .collect();
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedReporting {
    pub latency: Duration,
}

#[async_trait]
impl AnalysisStage for SimulatedReporting {
    async fn run(&self, ctx: &StageContext<'_>, artifacts: &mut StageArtifacts) -> Result<(), StageError> {
        pause(self.latency).await;

        artifacts.result_ref = Some(ResultRef::new(format!(
            "reports/{}/{}.pdf",
            ctx.tenant_id, ctx.job_id
        )));
        Ok(())
    }
}

/// The standard pipeline backed by simulated stages, each pausing for
/// `latency`.
pub fn standard_pipeline(latency: Duration) -> Pipeline {
    Pipeline::standard(
        Arc::new(SimulatedExtraction { latency }),
        Arc::new(SimulatedIndexing { latency }),
        Arc::new(SimulatedRetrieval { latency }),
        Arc::new(SimulatedEvaluation { latency }),
        Arc::new(SimulatedReporting { latency }),
    )
}

#[cfg(test)]
mod tests {
    use complyflow_core::{JobId, TenantId};

    use super::*;
    use crate::payload::{AnalysisParameters, AnalysisPayload, InputLocation, InputRef};

    fn payload(input: &str, frameworks: &[&str]) -> AnalysisPayload {
        AnalysisPayload {
            input_ref: InputRef::new(input).unwrap(),
            location: InputLocation { uri: format!("memory://{input}") },
            parameters: AnalysisParameters::new(frameworks.iter().copied()).unwrap(),
        }
    }

    async fn run_all(payload: &AnalysisPayload) -> Result<StageArtifacts, StageError> {
        let pipeline = standard_pipeline(Duration::ZERO);
        let ctx = StageContext {
            job_id: JobId::new(),
            tenant_id: TenantId::new(),
            attempt: 1,
            payload,
        };
        let mut artifacts = StageArtifacts::default();
        for (_, stage) in pipeline.stages() {
            stage.run(&ctx, &mut artifacts).await?;
        }
        Ok(artifacts)
    }

    #[tokio::test]
    async fn full_run_produces_findings_and_report() {
        let artifacts = run_all(&payload("uploads/policy.pdf", &["gdpr", "soc2"])).await.unwrap();
        assert_eq!(artifacts.rules.len(), 6);
        assert_eq!(artifacts.findings.len(), 6);
        assert!(artifacts.result_ref.unwrap().as_str().starts_with("reports/"));
    }

    #[tokio::test]
    async fn verdicts_are_deterministic() {
        let p = payload("uploads/policy.docx", &["HIPAA"]);
        let a = run_all(&p).await.unwrap();
        let b = run_all(&p).await.unwrap();
        let statuses = |x: &StageArtifacts| x.findings.iter().map(|f| f.status).collect::<Vec<_>>();
        assert_eq!(statuses(&a), statuses(&b));
    }

    #[tokio::test]
    async fn unsupported_format_is_permanent() {
        let err = run_all(&payload("uploads/photo.png", &["GDPR"])).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unknown_framework_is_permanent() {
        let err = run_all(&payload("uploads/policy.txt", &["PCI"])).await.unwrap_err();
        assert_eq!(err, StageError::permanent("unknown framework: PCI"));
    }
}

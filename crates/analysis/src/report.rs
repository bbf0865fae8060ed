use serde::{Deserialize, Serialize};

/// A regulatory requirement retrieved for evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub framework: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Compliant,
    PartiallyCompliant,
    NonCompliant,
}

/// Outcome of evaluating one rule against the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub framework: String,
    pub status: FindingStatus,

    /// Confidence in \[0, 1\] (convention; not enforced).
    pub confidence: f64,

    /// Passages of the document that support the verdict.
    pub evidence: Vec<String>,

    pub recommendation: Option<String>,
}

/// Pointer to a stored, completed report artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRef(String);

impl ResultRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ResultRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

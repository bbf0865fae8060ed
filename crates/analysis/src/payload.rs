//! The immutable input snapshot carried by every queue entry.

use serde::{Deserialize, Serialize};

use complyflow_core::DomainError;

/// Client-supplied reference to a previously uploaded document
/// (e.g. an object-storage key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputRef(String);

impl InputRef {
    pub fn new(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("input reference must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for InputRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved, durable location of the input, as returned by the storage
/// collaborator at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLocation {
    pub uri: String,
}

/// Requested analysis parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisParameters {
    /// Regulatory frameworks to evaluate against (e.g. `GDPR`, `SOC2`).
    pub frameworks: Vec<String>,
}

impl AnalysisParameters {
    /// Normalise and validate: trimmed, upper-cased, de-duplicated, non-empty.
    pub fn new(frameworks: impl IntoIterator<Item = impl Into<String>>) -> Result<Self, DomainError> {
        let mut normalised: Vec<String> = Vec::new();
        for f in frameworks {
            let f = f.into().trim().to_ascii_uppercase();
            if f.is_empty() {
                return Err(DomainError::validation("framework names must not be empty"));
            }
            if !normalised.contains(&f) {
                normalised.push(f);
            }
        }

        if normalised.is_empty() {
            return Err(DomainError::validation("at least one framework is required"));
        }

        Ok(Self { frameworks: normalised })
    }
}

/// Everything a worker needs to execute a job from scratch.
///
/// Built once by the producer; never re-read from mutable external state, so a
/// redelivered task runs against exactly what was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub input_ref: InputRef,
    pub location: InputLocation,
    pub parameters: AnalysisParameters,
}

//! Validator contract - optional slow-path judgement
//!
//! The validator is an external collaborator (typically an LLM) injected at
//! construction. It is permitted to be slow; the engine only calls it from
//! background paths or with explicit opt-in, and absorbs its unavailability.

use serde::{Deserialize, Serialize};

/// Validator failure modes. Unavailability is absorbed by callers: the
/// consolidator keeps pre-validation confidence, the retriever keeps the
/// unreranked order.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidatorError {
    #[error("validator unavailable: {0}")]
    Unavailable(String),
    #[error("validator returned a malformed judgement: {0}")]
    Malformed(String),
}

/// Structured judgement over a candidate pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Judgement {
    /// Keep the pattern, with an adjusted confidence
    Accept { confidence: f64 },
    /// Discard the pattern
    Reject { reason: String },
    /// Keep a refined wording. Mutations may narrow the pattern but must not
    /// invent source event ids; the consolidator enforces that.
    Mutate { new_text: String, confidence: f64 },
}

/// A candidate pattern submitted for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternReview {
    pub project_id: String,
    pub signature: String,
    pub summary: String,
    /// Ordered (event id, content, outcome) triples of the cluster
    pub events: Vec<(String, String, String)>,
    pub confidence_before_validation: f64,
}

/// A record pair escalated when the lexical negation heuristic is
/// inconclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContradictionReview {
    pub project_id: String,
    pub first_content: String,
    pub second_content: String,
    pub similarity: f64,
}

/// One candidate handed to the rerank pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerankCandidate {
    pub id: String,
    pub content: String,
    pub score: f64,
}

/// External validation provider.
pub trait Validator: Send + Sync {
    /// Judge a candidate pattern inside the uncertainty band.
    fn validate_pattern(&self, review: &PatternReview) -> Result<Judgement, ValidatorError>;

    /// Decide whether an escalated pair is a genuine contradiction.
    fn judge_contradiction(&self, review: &ContradictionReview) -> Result<bool, ValidatorError>;

    /// Reorder retrieval candidates for the query. Returns indices into the
    /// candidate slice, best first; indices absent from the result keep their
    /// original relative order after the returned ones.
    fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<usize>, ValidatorError>;
}

//! Hybrid retrieval - dense + lexical + structural ranking with optional
//! rerank
//!
//! The pipeline: embed if needed, over-fetch dense and lexical candidates,
//! fuse by reciprocal rank, blend normalized component scores with a recency
//! boost, apply structural filters and quality floors, optionally rerank
//! through the validator, and activate everything actually returned.

mod fusion;
mod retriever;

pub use fusion::{normalize_scores, recency_boost, reciprocal_rank_fusion, FusedCandidate};
pub use retriever::Retriever;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::RecordKind;

// ============================================================================
// QUERY SANITIZATION
// ============================================================================

/// Sanitize free text into an FTS5 MATCH expression.
///
/// Every token is double-quoted so FTS5 operators, parentheses, and column
/// filters in user input become plain terms. Tokens are joined by implicit
/// AND. Returns an empty string when no usable token remains.
pub fn sanitize_fts5_query(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// REQUEST TYPES
// ============================================================================

/// A retrieval query: free text and/or structural constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetrievalQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Caller may pre-embed the query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Every listed tag must be present on a result
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    /// Kinds to search; defaults to the searchable kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<RecordKind>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
}

impl RetrievalQuery {
    /// A plain text query.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Whether the query carries no ranking signal, only structure.
    pub fn is_structural(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty()) && self.embedding.is_none()
    }
}

/// Per-request ranking options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetrievalOptions {
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default)]
    pub use_rerank: bool,
    #[serde(default)]
    pub min_score: f64,
}

fn default_dense_weight() -> f64 {
    0.7
}
fn default_lexical_weight() -> f64 {
    0.3
}
fn default_recency_weight() -> f64 {
    0.1
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            dense_weight: default_dense_weight(),
            lexical_weight: default_lexical_weight(),
            recency_weight: default_recency_weight(),
            use_rerank: false,
            min_score: 0.0,
        }
    }
}

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Which candidate stage produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStage {
    Dense,
    Lexical,
    Both,
    /// Pure structural query, no ranking stage
    Structural,
}

/// Per-result diagnostic bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub stage: MatchStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dense_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
    pub rrf_score: f64,
    pub recency_boost: f64,
    /// Result is inside an open reconsolidation window
    pub labile: bool,
    /// Dense ranking was unavailable; lexical-only ordering
    pub degraded: bool,
    /// Result order came from the validator rerank
    pub reranked: bool,
    /// Requested k exceeded the ceiling and was clamped
    pub clamped_k: bool,
}

/// One ranked retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retrieved {
    pub record: crate::record::Record,
    pub score: f64,
    pub diagnostics: Diagnostics,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_quotes_tokens() {
        assert_eq!(sanitize_fts5_query("save file"), "\"save\" \"file\"");
        assert_eq!(
            sanitize_fts5_query("fts5 AND \"quoted\" (ops)"),
            "\"fts5\" \"AND\" \"quoted\" \"ops\""
        );
        assert_eq!(sanitize_fts5_query("   "), "");
        assert_eq!(sanitize_fts5_query("- -- -"), "");
    }

    #[test]
    fn test_structural_query_detection() {
        assert!(RetrievalQuery::default().is_structural());
        assert!(RetrievalQuery {
            text: Some("  ".into()),
            ..Default::default()
        }
        .is_structural());
        assert!(!RetrievalQuery::text("save").is_structural());
        assert!(!RetrievalQuery {
            embedding: Some(vec![0.1]),
            ..Default::default()
        }
        .is_structural());
    }

    #[test]
    fn test_options_defaults() {
        let options = RetrievalOptions::default();
        assert_eq!(options.dense_weight, 0.7);
        assert_eq!(options.lexical_weight, 0.3);
        assert_eq!(options.recency_weight, 0.1);
        assert!(!options.use_rerank);
        assert_eq!(options.min_score, 0.0);
    }
}

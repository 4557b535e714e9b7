//! Pattern records - consolidation output
//!
//! A pattern summarizes a recurring event sequence. It holds weak references
//! to its source events: archiving a source never deletes the pattern, but
//! the archival is recorded on the pattern's provenance list.

use serde::{Deserialize, Serialize};

use super::envelope::Envelope;

/// Kind of regularity a pattern captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// A recurring ordered sequence of event types
    #[default]
    EventSequence,
    /// A recurring outcome flip (e.g. failure followed by success)
    OutcomeTransition,
    /// A complete multi-step working pattern, procedure candidate
    Workflow,
    /// A sequence that reliably precedes failure
    AntiPattern,
    /// A sequence that reliably precedes success
    BestPractice,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::EventSequence => "event_sequence",
            PatternType::OutcomeTransition => "outcome_transition",
            PatternType::Workflow => "workflow",
            PatternType::AntiPattern => "anti_pattern",
            PatternType::BestPractice => "best_practice",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "event_sequence" => Some(PatternType::EventSequence),
            "outcome_transition" => Some(PatternType::OutcomeTransition),
            "workflow" => Some(PatternType::Workflow),
            "anti_pattern" => Some(PatternType::AntiPattern),
            "best_practice" => Some(PatternType::BestPractice),
            _ => None,
        }
    }
}

/// A provenance note appended when a source event changes under the pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceNote {
    pub event_id: String,
    pub note: String,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// A compressed regularity emitted by the consolidator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub pattern_type: PatternType,
    /// Verbalized summary of the regularity, searchable
    pub content: String,
    /// Ordered weak references to the source events
    pub source_event_ids: Vec<String>,
    /// Observation count backing the pattern
    pub support: i64,
    /// Laplace-smoothed confidence before any validator pass
    pub confidence_before_validation: f64,
    /// Confidence after validation; equals the prior value when validation
    /// was skipped
    pub confidence_after_validation: f64,
    /// Notes about source events that changed after emission
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<ProvenanceNote>,
    pub has_embedding: bool,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_type_roundtrip() {
        for pt in [
            PatternType::EventSequence,
            PatternType::OutcomeTransition,
            PatternType::Workflow,
            PatternType::AntiPattern,
            PatternType::BestPractice,
        ] {
            assert_eq!(PatternType::parse_name(pt.as_str()), Some(pt));
        }
        assert_eq!(PatternType::parse_name("workflow"), Some(PatternType::Workflow));
    }
}

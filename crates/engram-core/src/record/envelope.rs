//! Common record envelope
//!
//! Every record kind shares the same envelope: scope, bi-temporal stamps,
//! lifecycle state, confidence, derived evidence quality, activation
//! counters, and tags. Kind-specific fields extend it per struct.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Record lifecycle state.
///
/// Transitions form a DAG with a single allowed reverse edge:
///
/// ```text
/// active ⇄ labile          (activation opens the window, the window closes it)
/// active → consolidated    (source events folded into a pattern)
/// active → needs_review    (contradiction resolved as inhibit_both)
/// any    → archived        (manual or policy-driven)
/// any    → superseded      (replaced by a newer record)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Normal retrievable state
    #[default]
    Active,
    /// Inside a reconsolidation window, re-writable without a version bump
    Labile,
    /// Folded into an accepted pattern
    Consolidated,
    /// Retired; invisible to retrieval, eligible for hard delete after the
    /// retention horizon
    Archived,
    /// Flagged by the arbiter for human review
    NeedsReview,
    /// Replaced by a newer record whose `source_id` points here
    Superseded,
}

impl Lifecycle {
    /// String representation used in storage and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::Labile => "labile",
            Lifecycle::Consolidated => "consolidated",
            Lifecycle::Archived => "archived",
            Lifecycle::NeedsReview => "needs_review",
            Lifecycle::Superseded => "superseded",
        }
    }

    /// Parse from the stored name.
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Lifecycle::Active),
            "labile" => Some(Lifecycle::Labile),
            "consolidated" => Some(Lifecycle::Consolidated),
            "archived" => Some(Lifecycle::Archived),
            "needs_review" => Some(Lifecycle::NeedsReview),
            "superseded" => Some(Lifecycle::Superseded),
            _ => None,
        }
    }

    /// Whether the lifecycle DAG admits an edge `self → to`.
    pub fn can_transition_to(&self, to: Lifecycle) -> bool {
        use Lifecycle::*;

        if *self == to {
            return false;
        }
        match (self, to) {
            // Terminal states admit no exit.
            (Archived, _) | (Superseded, _) => false,
            (_, Archived) | (_, Superseded) => true,
            (Active, Labile) => true,
            // The only reverse edge in the DAG.
            (Labile, Active) => true,
            (Active, Consolidated) => true,
            (Active, NeedsReview) => true,
            _ => false,
        }
    }

    /// States visible to retrieval.
    pub fn is_retrievable(&self) -> bool {
        matches!(
            self,
            Lifecycle::Active | Lifecycle::Labile | Lifecycle::Consolidated
        )
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EVIDENCE
// ============================================================================

/// How the engine came to hold a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceType {
    /// Directly witnessed in a session
    #[default]
    Observed,
    /// Concluded from other records without direct observation
    Inferred,
    /// Derived by strict reasoning over known records
    Deduced,
    /// Proposed without supporting evidence
    Hypothetical,
    /// Taught by the user or extracted from accepted feedback
    Learned,
    /// Imported from an outside source
    External,
}

impl EvidenceType {
    /// Base contribution to evidence quality.
    pub fn base_quality(&self) -> f64 {
        match self {
            EvidenceType::Observed => 0.9,
            EvidenceType::Learned => 0.8,
            EvidenceType::Deduced => 0.7,
            EvidenceType::Inferred => 0.6,
            EvidenceType::External => 0.5,
            EvidenceType::Hypothetical => 0.3,
        }
    }

    /// String representation used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceType::Observed => "observed",
            EvidenceType::Inferred => "inferred",
            EvidenceType::Deduced => "deduced",
            EvidenceType::Hypothetical => "hypothetical",
            EvidenceType::Learned => "learned",
            EvidenceType::External => "external",
        }
    }

    /// Parse from the stored name.
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "observed" => Some(EvidenceType::Observed),
            "inferred" => Some(EvidenceType::Inferred),
            "deduced" => Some(EvidenceType::Deduced),
            "hypothetical" => Some(EvidenceType::Hypothetical),
            "learned" => Some(EvidenceType::Learned),
            "external" => Some(EvidenceType::External),
            _ => None,
        }
    }
}

impl std::fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recompute the derived evidence quality of a record.
///
/// Never caller-supplied: the store recomputes this on insert, activation,
/// and consolidation.
///
/// `outcome_bonus` is only meaningful for events; other kinds pass `None`.
pub fn derive_evidence_quality(
    evidence_type: EvidenceType,
    activation_count: i64,
    outcome: Option<super::event::Outcome>,
    consolidated: bool,
) -> f64 {
    let activation_bonus =
        (0.05 * (1.0 + activation_count.max(0) as f64).log2()).min(0.15);
    let outcome_bonus = match outcome {
        Some(super::event::Outcome::Success) => 0.1,
        Some(super::event::Outcome::Failure) => -0.1,
        _ => 0.0,
    };
    let consolidation_bonus = if consolidated { 0.1 } else { 0.0 };

    (evidence_type.base_quality() + activation_bonus + outcome_bonus + consolidation_bonus)
        .clamp(0.0, 1.0)
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Fields shared by every record kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique identifier (UUID string), stable per kind
    pub id: String,
    /// Scope key; every query is scoped by project
    pub project_id: String,
    /// Transaction time: when the engine learned the record. Immutable.
    pub created_at: DateTime<Utc>,
    /// Modeled time: when the fact starts holding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    /// Modeled time: when the fact stops holding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    /// Lifecycle state
    pub lifecycle: Lifecycle,
    /// Caller-asserted confidence in [0, 1]
    pub confidence: f64,
    /// Provenance class
    pub evidence_type: EvidenceType,
    /// Derived quality in [0, 1]; recomputed by the engine, never written by
    /// callers
    pub evidence_quality: f64,
    /// Back-reference to the record that produced this one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Number of retrieval hits
    pub activation_count: i64,
    /// Last retrieval hit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activation_at: Option<DateTime<Utc>>,
    /// Ranking and eviction weight in [0, 1]
    pub importance: f64,
    /// Short classification strings
    pub tags: Vec<String>,
    /// End of the open reconsolidation window, set while labile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labile_until: Option<DateTime<Utc>>,
    /// Whether the record was rewritten during the open window
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub window_dirty: bool,
    /// Reconsolidation counter, bumped once per dirty window close
    pub version: i64,
}

impl Envelope {
    /// Fresh envelope for a new record.
    pub fn new(project_id: impl Into<String>, evidence_type: EvidenceType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            created_at: Utc::now(),
            valid_from: None,
            valid_to: None,
            lifecycle: Lifecycle::Active,
            confidence: 0.5,
            evidence_type,
            evidence_quality: evidence_type.base_quality(),
            source_id: None,
            activation_count: 0,
            last_activation_at: None,
            importance: 0.5,
            tags: Vec::new(),
            labile_until: None,
            window_dirty: false,
            version: 1,
        }
    }

    /// Check the envelope invariants that hold for every kind.
    pub fn check(&self) -> Result<()> {
        if self.project_id.is_empty() {
            return Err(EngineError::Validation("project_id is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EngineError::Validation(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.importance) {
            return Err(EngineError::Validation(format!(
                "importance {} outside [0, 1]",
                self.importance
            )));
        }
        if let (Some(from), Some(to)) = (self.valid_from, self.valid_to) {
            if from > to {
                return Err(EngineError::Validation(format!(
                    "valid_from {from} is after valid_to {to}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_dag_forward_edges() {
        use Lifecycle::*;
        assert!(Active.can_transition_to(Labile));
        assert!(Active.can_transition_to(Consolidated));
        assert!(Active.can_transition_to(NeedsReview));
        assert!(Active.can_transition_to(Archived));
        assert!(Consolidated.can_transition_to(Superseded));
        assert!(NeedsReview.can_transition_to(Archived));
    }

    #[test]
    fn test_lifecycle_single_reverse_edge() {
        use Lifecycle::*;
        assert!(Labile.can_transition_to(Active));
        // No other reverse transitions exist.
        assert!(!Consolidated.can_transition_to(Active));
        assert!(!NeedsReview.can_transition_to(Active));
        assert!(!Archived.can_transition_to(Active));
        assert!(!Superseded.can_transition_to(Active));
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        use Lifecycle::*;
        for to in [Active, Labile, Consolidated, NeedsReview, Superseded] {
            assert!(!Archived.can_transition_to(to));
        }
        for to in [Active, Labile, Consolidated, NeedsReview, Archived] {
            assert!(!Superseded.can_transition_to(to));
        }
    }

    #[test]
    fn test_lifecycle_roundtrip() {
        for state in [
            Lifecycle::Active,
            Lifecycle::Labile,
            Lifecycle::Consolidated,
            Lifecycle::Archived,
            Lifecycle::NeedsReview,
            Lifecycle::Superseded,
        ] {
            assert_eq!(Lifecycle::parse_name(state.as_str()), Some(state));
        }
        assert_eq!(Lifecycle::parse_name("bogus"), None);
    }

    #[test]
    fn test_evidence_quality_base_ordering() {
        // Observed beats everything; hypothetical trails.
        let observed = derive_evidence_quality(EvidenceType::Observed, 0, None, false);
        let learned = derive_evidence_quality(EvidenceType::Learned, 0, None, false);
        let hypothetical = derive_evidence_quality(EvidenceType::Hypothetical, 0, None, false);
        assert!(observed > learned);
        assert!(learned > hypothetical);
    }

    #[test]
    fn test_evidence_quality_activation_bonus_caps() {
        let quiet = derive_evidence_quality(EvidenceType::Inferred, 0, None, false);
        let busy = derive_evidence_quality(EvidenceType::Inferred, 7, None, false);
        let saturated = derive_evidence_quality(EvidenceType::Inferred, 100_000, None, false);
        assert!(busy > quiet);
        assert!((saturated - (0.6 + 0.15)).abs() < 1e-9);
    }

    #[test]
    fn test_evidence_quality_outcome_and_consolidation() {
        use crate::record::event::Outcome;
        let success =
            derive_evidence_quality(EvidenceType::Observed, 0, Some(Outcome::Success), false);
        let failure =
            derive_evidence_quality(EvidenceType::Observed, 0, Some(Outcome::Failure), false);
        assert!(success > failure);

        let folded = derive_evidence_quality(EvidenceType::Inferred, 0, None, true);
        let raw = derive_evidence_quality(EvidenceType::Inferred, 0, None, false);
        assert!((folded - raw - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_evidence_quality_clamped() {
        let q = derive_evidence_quality(
            EvidenceType::Observed,
            1_000_000,
            Some(crate::record::event::Outcome::Success),
            true,
        );
        assert!(q <= 1.0);
    }

    #[test]
    fn test_envelope_check() {
        let mut env = Envelope::new("proj", EvidenceType::Observed);
        assert!(env.check().is_ok());

        env.confidence = 1.5;
        assert!(env.check().is_err());
        env.confidence = 0.9;

        env.valid_from = Some(Utc::now());
        env.valid_to = Some(Utc::now() - chrono::Duration::days(1));
        assert!(env.check().is_err());
    }
}

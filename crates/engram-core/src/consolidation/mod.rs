//! Consolidator - dual-process compression of the raw event stream
//!
//! System 1 is pure statistics: cluster recent events by composite key and
//! temporal proximity, score support with a Laplace prior. System 2 is the
//! optional validator pass over candidates inside the uncertainty band.
//! Accepted clusters become patterns (and, with enough support, procedures);
//! their source events flip to `consolidated` in the same per-cluster
//! transaction, so a failure never leaves orphan patterns.

mod cluster;
mod engine;

pub use cluster::{
    cluster_events, confidence_before_validation, normalized_context, EventCluster,
};
pub use engine::Consolidator;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// STRATEGY
// ============================================================================

/// Consolidation strategies differ only in the minimum cluster size and
/// whether the validator is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Small clusters accepted, no validator
    Fast,
    /// Default: validator consulted inside the uncertainty band
    #[default]
    Balanced,
    /// Larger clusters only, validator consulted
    Quality,
}

impl Strategy {
    pub fn min_cluster_size(&self) -> usize {
        match self {
            Strategy::Fast => 3,
            Strategy::Balanced => 3,
            Strategy::Quality => 5,
        }
    }

    pub fn consults_validator(&self) -> bool {
        !matches!(self, Strategy::Fast)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Fast => "fast",
            Strategy::Balanced => "balanced",
            Strategy::Quality => "quality",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(Strategy::Fast),
            "balanced" => Some(Strategy::Balanced),
            "quality" => Some(Strategy::Quality),
            _ => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// CANCELLATION
// ============================================================================

/// Cooperative cancel signal, honored at cluster boundaries only. A cancel
/// request never interrupts a cluster mid-transaction.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// RUN SUMMARY
// ============================================================================

/// Summary of one consolidator run, persisted to `consolidation_runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationReport {
    pub run_id: String,
    pub project_id: String,
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub events_scored: usize,
    pub clusters_formed: usize,
    pub patterns_emitted: usize,
    pub procedures_derived: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub windows_closed: u64,
    pub validator_consulted: usize,
    /// The validator was configured but unreachable; pre-validation
    /// confidences were kept
    pub validator_unavailable: bool,
    pub cancelled: bool,
}

impl ConsolidationReport {
    pub(crate) fn new(project_id: &str, strategy: Strategy) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            strategy,
            started_at: Utc::now(),
            duration_ms: 0,
            events_scored: 0,
            clusters_formed: 0,
            patterns_emitted: 0,
            procedures_derived: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            windows_closed: 0,
            validator_consulted: 0,
            validator_unavailable: false,
            cancelled: false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parameters() {
        assert!(!Strategy::Fast.consults_validator());
        assert!(Strategy::Balanced.consults_validator());
        assert!(Strategy::Quality.consults_validator());
        assert!(Strategy::Quality.min_cluster_size() > Strategy::Fast.min_cluster_size());
    }

    #[test]
    fn test_strategy_roundtrip() {
        for strategy in [Strategy::Fast, Strategy::Balanced, Strategy::Quality] {
            assert_eq!(Strategy::parse_name(strategy.as_str()), Some(strategy));
        }
        assert_eq!(Strategy::parse_name("thorough"), None);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
    }
}

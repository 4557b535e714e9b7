//! Arbiter - contradiction detection, evidence scoring, survivor selection
//!
//! Reconsolidation windows themselves are opened by `RecordStore::activate`
//! and closed by the scheduler sweep; the arbiter owns the other half of the
//! job: finding records that contradict each other and picking survivors.
//!
//! Two contradiction classes are recognized:
//! - outcome: two events with the same normalized context but opposed
//!   outcomes;
//! - assertion: two facts (or pattern texts) whose vectors are near-identical
//!   while their contents differ by a negation flip. Pairs the lexical
//!   heuristic cannot decide escalate to the validator when one is present.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::embeddings::cosine_similarity;
use crate::error::Result;
use crate::record::{Envelope, Event, Lifecycle, Outcome, RecordKind};
use crate::store::RecordStore;
use crate::substrate::Deadline;
use crate::validator::{ContradictionReview, Validator};

// ============================================================================
// TYPES
// ============================================================================

/// Recognized contradiction classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContradictionType {
    Outcome,
    Assertion,
}

impl ContradictionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContradictionType::Outcome => "outcome",
            ContradictionType::Assertion => "assertion",
        }
    }
}

/// Resolution strategy. `Auto` is the default policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    #[default]
    Auto,
    KeepLatest,
    KeepHighestQuality,
    InhibitBoth,
}

/// What the arbiter did about one detected pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    pub kind: RecordKind,
    pub first_id: String,
    pub second_id: String,
    pub contradiction_type: ContradictionType,
    pub severity: f64,
    /// Resolution actually applied (may differ from the requested policy on
    /// fallbacks)
    pub resolution: String,
    /// Winner when one side survived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub survivor_id: Option<String>,
}

/// A detected, not yet resolved, contradiction.
struct DetectedPair {
    kind: RecordKind,
    first: PairSide,
    second: PairSide,
    contradiction_type: ContradictionType,
}

struct PairSide {
    envelope: Envelope,
    outcome: Option<Outcome>,
}

/// Content-bearing view shared by facts and patterns in the assertion sweep.
struct Assertion {
    envelope: Envelope,
    content: String,
}

// ============================================================================
// PURE SCORING
// ============================================================================

/// Lexical negation markers for the assertion heuristic.
const NEGATION_MARKERS: &[&str] = &[
    "not", "no", "never", "cannot", "can't", "won't", "doesn't", "don't", "isn't", "aren't",
    "wasn't", "without", "n't",
];

/// Whether the content carries a lexical negation marker.
pub fn has_negation(content: &str) -> bool {
    let lowered = content.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .any(|token| NEGATION_MARKERS.contains(&token))
}

/// Pair severity: mean of both sides' confidence and evidence quality,
/// decayed by the age of the older record.
pub fn severity(first: &Envelope, second: &Envelope, horizon_seconds: f64) -> f64 {
    let mean = (first.confidence
        + first.evidence_quality
        + second.confidence
        + second.evidence_quality)
        / 4.0;
    let now = Utc::now();
    let age_oldest = (now - first.created_at.min(second.created_at))
        .num_seconds()
        .max(0) as f64;
    let time_decay = if horizon_seconds <= 0.0 {
        1.0
    } else {
        (-age_oldest / horizon_seconds).exp()
    };
    mean * time_decay
}

/// Survivor score for the `auto` strategy.
pub fn survivor_score(envelope: &Envelope, outcome: Option<Outcome>) -> f64 {
    let outcome_score = outcome.map(|o| o.score()).unwrap_or(0.5);
    0.3 * outcome_score + 0.4 * envelope.confidence + 0.3 * envelope.evidence_quality
}

// ============================================================================
// ARBITER
// ============================================================================

/// Contradiction arbiter over the record store.
pub struct Arbiter {
    store: Arc<RecordStore>,
    validator: Option<Arc<dyn Validator>>,
    config: Arc<EngineConfig>,
}

impl Arbiter {
    pub fn new(
        store: Arc<RecordStore>,
        validator: Option<Arc<dyn Validator>>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            validator,
            config,
        }
    }

    /// Detect and resolve every recognized contradiction among the project's
    /// active records. After this pass no two active records of the project
    /// remain in a recognized contradiction relation.
    pub async fn sweep(
        &self,
        project_id: &str,
        policy: ResolutionPolicy,
        deadline: Deadline,
    ) -> Result<Vec<ResolutionOutcome>> {
        let mut detected = Vec::new();
        detected.extend(self.detect_outcome_pairs(project_id, deadline).await?);
        detected.extend(self.detect_assertion_pairs(project_id, deadline).await?);

        // Deterministic processing order; skip sides already resolved by an
        // earlier pair this sweep.
        detected.sort_by(|a, b| {
            (a.first.envelope.id.as_str(), a.second.envelope.id.as_str())
                .cmp(&(b.first.envelope.id.as_str(), b.second.envelope.id.as_str()))
        });

        let mut resolved_ids: Vec<String> = Vec::new();
        let mut outcomes = Vec::new();
        for pair in detected {
            if resolved_ids.contains(&pair.first.envelope.id)
                || resolved_ids.contains(&pair.second.envelope.id)
            {
                continue;
            }
            let outcome = self.resolve(project_id, &pair, policy, deadline).await?;
            match outcome.resolution.as_str() {
                "inhibit_both" => {
                    resolved_ids.push(pair.first.envelope.id.clone());
                    resolved_ids.push(pair.second.envelope.id.clone());
                }
                _ => {
                    if let Some(survivor) = &outcome.survivor_id {
                        let loser = if *survivor == pair.first.envelope.id {
                            &pair.second.envelope.id
                        } else {
                            &pair.first.envelope.id
                        };
                        resolved_ids.push(loser.clone());
                    }
                }
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Unresolved contradiction backlog: records parked in needs_review.
    pub async fn backlog(&self, project_id: &str, deadline: Deadline) -> Result<i64> {
        let mut backlog = 0i64;
        for kind in RecordKind::ALL {
            let counts = self
                .store
                .counts_by_lifecycle(project_id, kind, deadline)
                .await?;
            backlog += counts.get("needs_review").copied().unwrap_or(0);
        }
        Ok(backlog)
    }

    // ========================================================================
    // DETECTION
    // ========================================================================

    async fn detect_outcome_pairs(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<Vec<DetectedPair>> {
        let events = self.store.active_events(project_id, deadline).await?;

        let mut by_context: HashMap<String, Vec<&Event>> = HashMap::new();
        for event in &events {
            if event.context.is_empty() {
                continue;
            }
            by_context
                .entry(context_key(event))
                .or_default()
                .push(event);
        }

        let mut pairs = Vec::new();
        for group in by_context.values() {
            for (i, first) in group.iter().enumerate() {
                for second in group.iter().skip(i + 1) {
                    if first.outcome.opposes(second.outcome) {
                        pairs.push(DetectedPair {
                            kind: RecordKind::Event,
                            first: PairSide {
                                envelope: first.envelope.clone(),
                                outcome: Some(first.outcome),
                            },
                            second: PairSide {
                                envelope: second.envelope.clone(),
                                outcome: Some(second.outcome),
                            },
                            contradiction_type: ContradictionType::Outcome,
                        });
                    }
                }
            }
        }
        Ok(pairs)
    }

    async fn detect_assertion_pairs(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<Vec<DetectedPair>> {
        // Facts and pattern texts participate; pairs never cross kinds.
        let facts: Vec<Assertion> = self
            .store
            .active_facts(project_id, deadline)
            .await?
            .into_iter()
            .filter(|f| f.has_embedding)
            .map(|f| Assertion {
                envelope: f.envelope,
                content: f.content,
            })
            .collect();
        let patterns: Vec<Assertion> = self
            .store
            .active_patterns(project_id, deadline)
            .await?
            .into_iter()
            .filter(|p| p.has_embedding)
            .map(|p| Assertion {
                envelope: p.envelope,
                content: p.content,
            })
            .collect();

        let mut pairs = Vec::new();
        for (kind, group) in [(RecordKind::Fact, facts), (RecordKind::Pattern, patterns)] {
            pairs.extend(self.assertion_pairs_in(kind, &group, deadline).await?);
        }
        Ok(pairs)
    }

    async fn assertion_pairs_in(
        &self,
        kind: RecordKind,
        group: &[Assertion],
        deadline: Deadline,
    ) -> Result<Vec<DetectedPair>> {
        let threshold = self.config.arbiter.assertion_similarity_threshold;

        let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();
        for assertion in group {
            if let Some(vector) = self
                .store
                .get_embedding(&assertion.envelope.id, deadline)
                .await?
            {
                vectors.insert(assertion.envelope.id.clone(), vector);
            }
        }

        let mut pairs = Vec::new();
        for (i, first) in group.iter().enumerate() {
            let Some(first_vec) = vectors.get(&first.envelope.id) else {
                continue;
            };
            for second in group.iter().skip(i + 1) {
                let Some(second_vec) = vectors.get(&second.envelope.id) else {
                    continue;
                };
                let similarity = cosine_similarity(first_vec, second_vec) as f64;
                if similarity < threshold {
                    continue;
                }
                if self.is_assertion_contradiction(first, second, similarity) {
                    pairs.push(DetectedPair {
                        kind,
                        first: PairSide {
                            envelope: first.envelope.clone(),
                            outcome: None,
                        },
                        second: PairSide {
                            envelope: second.envelope.clone(),
                            outcome: None,
                        },
                        contradiction_type: ContradictionType::Assertion,
                    });
                }
            }
        }
        Ok(pairs)
    }

    /// Negation heuristic first; the hard cases go to the validator.
    fn is_assertion_contradiction(
        &self,
        first: &Assertion,
        second: &Assertion,
        similarity: f64,
    ) -> bool {
        if has_negation(&first.content) != has_negation(&second.content) {
            return true;
        }
        if let Some(validator) = &self.validator {
            let review = ContradictionReview {
                project_id: first.envelope.project_id.clone(),
                first_content: first.content.clone(),
                second_content: second.content.clone(),
                similarity,
            };
            match validator.judge_contradiction(&review) {
                Ok(verdict) => return verdict,
                Err(err) => {
                    tracing::debug!(error = %err, "validator unavailable for escalated pair");
                }
            }
        }
        false
    }

    // ========================================================================
    // RESOLUTION
    // ========================================================================

    async fn resolve(
        &self,
        project_id: &str,
        pair: &DetectedPair,
        policy: ResolutionPolicy,
        deadline: Deadline,
    ) -> Result<ResolutionOutcome> {
        let arbiter_config = &self.config.arbiter;
        let severity = severity(
            &pair.first.envelope,
            &pair.second.envelope,
            arbiter_config.severity_horizon.as_secs_f64(),
        );

        let first_score = survivor_score(&pair.first.envelope, pair.first.outcome);
        let second_score = survivor_score(&pair.second.envelope, pair.second.outcome);

        let decision = self.decide(policy, pair, severity, first_score, second_score);

        let (resolution, survivor_id) = match decision {
            Decision::Keep {
                winner_first,
                applied,
            } => {
                let (winner, loser) = if winner_first {
                    (&pair.first.envelope.id, &pair.second.envelope.id)
                } else {
                    (&pair.second.envelope.id, &pair.first.envelope.id)
                };
                self.store
                    .supersede(
                        pair.kind,
                        loser,
                        winner,
                        &format!("lost {} contradiction", pair.contradiction_type.as_str()),
                        deadline,
                    )
                    .await?;
                (applied.to_string(), Some(winner.clone()))
            }
            Decision::InhibitBoth => {
                for id in [&pair.first.envelope.id, &pair.second.envelope.id] {
                    self.store
                        .transition(
                            pair.kind,
                            id,
                            Lifecycle::NeedsReview,
                            "contradiction inhibited pending review",
                            deadline,
                        )
                        .await?;
                }
                ("inhibit_both".to_string(), None)
            }
        };

        self.log_conflict(
            project_id,
            pair,
            severity,
            &resolution,
            survivor_id.as_deref(),
            deadline,
        )
        .await?;

        Ok(ResolutionOutcome {
            kind: pair.kind,
            first_id: pair.first.envelope.id.clone(),
            second_id: pair.second.envelope.id.clone(),
            contradiction_type: pair.contradiction_type,
            severity,
            resolution,
            survivor_id,
        })
    }

    /// Pick the branch for a pair. The returned decision names the strategy
    /// that actually fired: a gap-gated policy that falls through reports
    /// `auto`, not the policy the caller asked for.
    fn decide(
        &self,
        policy: ResolutionPolicy,
        pair: &DetectedPair,
        severity: f64,
        first_score: f64,
        second_score: f64,
    ) -> Decision {
        let arbiter_config = &self.config.arbiter;
        match policy {
            ResolutionPolicy::InhibitBoth => Decision::InhibitBoth,
            ResolutionPolicy::KeepLatest => {
                let gap = (pair.first.envelope.created_at - pair.second.envelope.created_at)
                    .num_seconds()
                    .unsigned_abs();
                if gap >= arbiter_config.keep_latest_min_gap.as_secs() {
                    Decision::Keep {
                        winner_first: pair.first.envelope.created_at
                            > pair.second.envelope.created_at,
                        applied: "keep_latest",
                    }
                } else {
                    self.auto_decision(severity, first_score, second_score)
                }
            }
            ResolutionPolicy::KeepHighestQuality => {
                let gap = (pair.first.envelope.evidence_quality
                    - pair.second.envelope.evidence_quality)
                    .abs();
                if gap > arbiter_config.quality_gap {
                    Decision::Keep {
                        winner_first: pair.first.envelope.evidence_quality
                            > pair.second.envelope.evidence_quality,
                        applied: "keep_highest_quality",
                    }
                } else {
                    self.auto_decision(severity, first_score, second_score)
                }
            }
            ResolutionPolicy::Auto => self.auto_decision(severity, first_score, second_score),
        }
    }

    fn auto_decision(&self, severity: f64, first_score: f64, second_score: f64) -> Decision {
        let arbiter_config = &self.config.arbiter;
        if arbiter_config.severity_band.contains(severity) {
            return Decision::InhibitBoth;
        }
        if (first_score - second_score).abs() < arbiter_config.near_tie_margin {
            return Decision::InhibitBoth;
        }
        Decision::Keep {
            winner_first: first_score > second_score,
            applied: "auto",
        }
    }

    async fn log_conflict(
        &self,
        project_id: &str,
        pair: &DetectedPair,
        severity: f64,
        resolution: &str,
        survivor_id: Option<&str>,
        deadline: Deadline,
    ) -> Result<()> {
        let project = project_id.to_string();
        let kind = pair.kind.as_str();
        let first_id = pair.first.envelope.id.clone();
        let second_id = pair.second.envelope.id.clone();
        let contradiction_type = pair.contradiction_type.as_str();
        let resolution = resolution.to_string();
        let survivor = survivor_id.map(|s| s.to_string());

        self.store
            .substrate()
            .with_write(deadline, "log_conflict", move |conn| {
                conn.execute(
                    "INSERT INTO conflicts (project_id, kind, first_id, second_id,
                         contradiction_type, severity, resolution, survivor_id, detected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        project,
                        kind,
                        first_id,
                        second_id,
                        contradiction_type,
                        severity,
                        resolution,
                        survivor,
                        Utc::now(),
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

enum Decision {
    Keep {
        winner_first: bool,
        /// Name of the strategy that produced this decision, recorded in the
        /// conflicts log
        applied: &'static str,
    },
    InhibitBoth,
}

/// Normalized context key for outcome contradictions: the sorted context
/// entries plus the event type.
fn context_key(event: &Event) -> String {
    let mut parts: Vec<String> = event
        .context
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    parts.sort();
    format!("{}|{}", event.event_type, parts.join(","))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EvidenceType;

    fn envelope(confidence: f64, quality: f64) -> Envelope {
        let mut env = Envelope::new("proj", EvidenceType::Observed);
        env.confidence = confidence;
        env.evidence_quality = quality;
        env
    }

    #[test]
    fn test_negation_heuristic() {
        assert!(has_negation("Python does not use reference counting"));
        assert!(has_negation("never cache credentials"));
        assert!(has_negation("builds can't run offline"));
        assert!(!has_negation("Python uses reference counting"));
        assert!(!has_negation("nothing notable")); // 'nothing' is not a marker
    }

    #[test]
    fn test_survivor_score_weights() {
        let strong = envelope(0.9, 0.95);
        let weak = envelope(0.4, 0.3);
        let strong_score = survivor_score(&strong, Some(Outcome::Success));
        let weak_score = survivor_score(&weak, Some(Outcome::Failure));
        assert!(strong_score > weak_score);
        // 0.3*1.0 + 0.4*0.9 + 0.3*0.95
        assert!((strong_score - (0.3 + 0.36 + 0.285)).abs() < 1e-9);
    }

    #[test]
    fn test_survivor_score_without_outcome_uses_midpoint() {
        let env = envelope(0.5, 0.5);
        let score = survivor_score(&env, None);
        assert!((score - (0.3 * 0.5 + 0.4 * 0.5 + 0.3 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_severity_decays_with_age() {
        let mut old_env = envelope(0.8, 0.8);
        old_env.created_at = Utc::now() - chrono::Duration::days(60);
        let fresh_env = envelope(0.8, 0.8);

        let horizon = 30.0 * 24.0 * 3600.0;
        let aged = severity(&old_env, &fresh_env, horizon);
        let fresh = severity(&fresh_env, &fresh_env, horizon);
        assert!(aged < fresh);
        assert!((fresh - 0.8).abs() < 0.01);
    }
}

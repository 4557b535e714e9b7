//! System-1 clustering - pure statistics, no external calls
//!
//! Events group by a composite key (event type + normalized context), then
//! split into temporal chains wherever consecutive events sit further apart
//! than the gap threshold. Each surviving chain is one candidate pattern.

use chrono::Duration as ChronoDuration;

use crate::record::{Event, Outcome, PatternType};

/// One candidate cluster, ordered by `created_at`.
#[derive(Debug, Clone)]
pub struct EventCluster {
    /// Composite grouping key
    pub key: String,
    /// Deterministic signature: key plus the event-type/outcome sequence
    pub signature: String,
    /// Ordered member events
    pub events: Vec<Event>,
}

impl EventCluster {
    pub fn support(&self) -> usize {
        self.events.len()
    }

    /// Fraction of members with a success outcome.
    pub fn success_fraction(&self) -> f64 {
        if self.events.is_empty() {
            return 0.0;
        }
        let successes = self
            .events
            .iter()
            .filter(|e| e.outcome == Outcome::Success)
            .count();
        successes as f64 / self.events.len() as f64
    }

    /// Classify the regularity this cluster captures.
    pub fn pattern_type(&self) -> PatternType {
        let outcomes: Vec<Outcome> = self.events.iter().map(|e| e.outcome).collect();
        let all_success = outcomes.iter().all(|o| *o == Outcome::Success);
        let all_failure = outcomes.iter().all(|o| *o == Outcome::Failure);

        if all_success {
            PatternType::Workflow
        } else if all_failure {
            PatternType::AntiPattern
        } else if outcomes.first() == Some(&Outcome::Failure)
            && outcomes.last() == Some(&Outcome::Success)
        {
            PatternType::OutcomeTransition
        } else if self.success_fraction() >= 0.8 {
            PatternType::BestPractice
        } else {
            PatternType::EventSequence
        }
    }

    /// Human-readable one-line summary, stored as the pattern content.
    pub fn summarize(&self) -> String {
        let first = &self.events[0];
        let context = if first.context.is_empty() {
            String::new()
        } else {
            format!(" in {}", normalized_context(first))
        };
        let outcome = match self.pattern_type() {
            PatternType::Workflow => "all succeeded",
            PatternType::AntiPattern => "all failed",
            PatternType::OutcomeTransition => "failure recovered to success",
            PatternType::BestPractice => "mostly succeeded",
            PatternType::EventSequence => "mixed outcomes",
        };
        format!(
            "{}x {} events{}, {}",
            self.events.len(),
            first.event_type,
            context,
            outcome
        )
    }
}

/// Laplace-smoothed pre-validation confidence.
pub fn confidence_before_validation(support: usize, prior: f64) -> f64 {
    let support = support as f64;
    support / (support + prior.max(0.0))
}

/// Normalized context for the cluster key: directory prefix, file, and task
/// id. Other ambient keys are deliberately ignored so near-identical contexts
/// land in one cluster.
pub fn normalized_context(event: &Event) -> String {
    let mut parts = Vec::new();
    if let Some(dir) = event.context.get("dir").or_else(|| event.context.get("cwd")) {
        parts.push(format!("dir={}", directory_prefix(dir)));
    }
    if let Some(file) = event.context.get("file") {
        parts.push(format!("file={file}"));
    }
    if let Some(task) = event.context.get("task") {
        parts.push(format!("task={task}"));
    }
    parts.join(",")
}

/// First two path components, so sibling files cluster together.
fn directory_prefix(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .take(2)
        .collect::<Vec<_>>()
        .join("/")
}

/// Cluster a cohort. Input must be ordered by `created_at` (the cohort query
/// guarantees it); output order is deterministic: by signature, then by the
/// earliest member's `created_at`.
pub fn cluster_events(
    events: &[Event],
    chain_gap: std::time::Duration,
    min_cluster_size: usize,
) -> Vec<EventCluster> {
    use std::collections::BTreeMap;

    let gap = ChronoDuration::from_std(chain_gap).unwrap_or_else(|_| ChronoDuration::minutes(10));

    // Group by composite key; BTreeMap keeps grouping order stable.
    let mut groups: BTreeMap<String, Vec<&Event>> = BTreeMap::new();
    for event in events {
        let key = format!("{}|{}", event.event_type, normalized_context(event));
        groups.entry(key).or_default().push(event);
    }

    let mut clusters = Vec::new();
    for (key, members) in groups {
        // Split the group into temporal chains.
        let mut chain: Vec<&Event> = Vec::new();
        let mut chains: Vec<Vec<&Event>> = Vec::new();
        for event in members {
            match chain.last() {
                Some(last)
                    if event.envelope.created_at - last.envelope.created_at > gap =>
                {
                    chains.push(std::mem::take(&mut chain));
                    chain.push(event);
                }
                _ => chain.push(event),
            }
        }
        if !chain.is_empty() {
            chains.push(chain);
        }

        for chain in chains {
            if chain.len() < min_cluster_size {
                continue;
            }
            let sequence: Vec<String> = chain
                .iter()
                .map(|e| format!("{}:{}", e.event_type, e.outcome.as_str()))
                .collect();
            clusters.push(EventCluster {
                signature: format!("{key}|{}", sequence.join(">")),
                key: key.clone(),
                events: chain.into_iter().cloned().collect(),
            });
        }
    }

    clusters.sort_by(|a, b| {
        a.signature.cmp(&b.signature).then_with(|| {
            a.events[0]
                .envelope
                .created_at
                .cmp(&b.events[0].envelope.created_at)
        })
    });
    clusters
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventContext, EventInput, EvidenceType};
    use chrono::{Duration, Utc};
    use std::time::Duration as StdDuration;

    fn event(event_type: &str, outcome: Outcome, minutes_ago: i64, file: &str) -> Event {
        let (mut event, _) = EventInput {
            project_id: "proj".into(),
            session_id: "sess".into(),
            content: format!("{event_type} on {file}"),
            event_type: event_type.into(),
            outcome,
            context: EventContext::from([("file".to_string(), file.to_string())]),
            code: None,
            embedding: None,
            evidence_type: EvidenceType::Observed,
            confidence: 0.8,
            importance: 0.5,
            tags: vec![],
            valid_from: None,
            valid_to: None,
        }
        .into_event()
        .unwrap();
        event.envelope.created_at = Utc::now() - Duration::minutes(minutes_ago);
        event
    }

    fn sorted(mut events: Vec<Event>) -> Vec<Event> {
        events.sort_by_key(|e| e.envelope.created_at);
        events
    }

    #[test]
    fn test_same_context_forms_one_cluster() {
        let events = sorted(
            (0..12)
                .map(|i| event("edit", Outcome::Success, 12 - i, "src/main.rs"))
                .collect(),
        );
        let clusters = cluster_events(&events, StdDuration::from_secs(600), 3);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].support(), 12);
        assert_eq!(clusters[0].pattern_type(), PatternType::Workflow);
        assert_eq!(clusters[0].success_fraction(), 1.0);
    }

    #[test]
    fn test_gap_splits_chains() {
        let mut events = Vec::new();
        for i in 0..4 {
            events.push(event("edit", Outcome::Success, 500 - i, "a.rs"));
        }
        for i in 0..4 {
            events.push(event("edit", Outcome::Success, 10 - i, "a.rs"));
        }
        let events = sorted(events);
        let clusters = cluster_events(&events, StdDuration::from_secs(600), 3);
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.support() == 4));
    }

    #[test]
    fn test_small_clusters_discarded() {
        let events = sorted(vec![
            event("edit", Outcome::Success, 3, "a.rs"),
            event("edit", Outcome::Success, 2, "a.rs"),
        ]);
        let clusters = cluster_events(&events, StdDuration::from_secs(600), 3);
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_distinct_contexts_stay_separate() {
        let mut events = Vec::new();
        for i in 0..3 {
            events.push(event("edit", Outcome::Success, 10 - i, "a.rs"));
            events.push(event("edit", Outcome::Success, 10 - i, "b.rs"));
        }
        let events = sorted(events);
        let clusters = cluster_events(&events, StdDuration::from_secs(600), 3);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn test_all_failure_is_anti_pattern() {
        let events = sorted(
            (0..3)
                .map(|i| event("deploy", Outcome::Failure, 10 - i, "ci.yaml"))
                .collect(),
        );
        let clusters = cluster_events(&events, StdDuration::from_secs(600), 3);
        assert_eq!(clusters[0].pattern_type(), PatternType::AntiPattern);
    }

    #[test]
    fn test_failure_to_success_is_outcome_transition() {
        let events = sorted(vec![
            event("test", Outcome::Failure, 10, "t.rs"),
            event("test", Outcome::Partial, 8, "t.rs"),
            event("test", Outcome::Success, 6, "t.rs"),
        ]);
        let clusters = cluster_events(&events, StdDuration::from_secs(600), 3);
        assert_eq!(clusters[0].pattern_type(), PatternType::OutcomeTransition);
    }

    #[test]
    fn test_laplace_confidence() {
        assert!((confidence_before_validation(12, 2.0) - 12.0 / 14.0).abs() < 1e-9);
        assert!((confidence_before_validation(0, 2.0)).abs() < 1e-9);
        // More support, more confidence.
        assert!(
            confidence_before_validation(20, 2.0) > confidence_before_validation(5, 2.0)
        );
    }

    #[test]
    fn test_cluster_order_is_deterministic() {
        let mut events = Vec::new();
        for i in 0..3 {
            events.push(event("zeta", Outcome::Success, 10 - i, "z.rs"));
            events.push(event("alpha", Outcome::Success, 10 - i, "a.rs"));
        }
        let events = sorted(events);
        let first = cluster_events(&events, StdDuration::from_secs(600), 3);
        let second = cluster_events(&events, StdDuration::from_secs(600), 3);
        let sig_a: Vec<&str> = first.iter().map(|c| c.signature.as_str()).collect();
        let sig_b: Vec<&str> = second.iter().map(|c| c.signature.as_str()).collect();
        assert_eq!(sig_a, sig_b);
        assert!(sig_a[0] < sig_a[1]);
    }
}

//! Procedure records - how-to knowledge with success tracking

use serde::{Deserialize, Serialize};

use super::envelope::{Envelope, EvidenceType};
use crate::error::{EngineError, Result};

/// Structural predicate deciding when a procedure applies.
///
/// All populated clauses must match; an empty pattern never triggers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerPattern {
    /// Event type the trigger listens for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Tags that must all be present
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tags: Vec<String>,
    /// Substring that must appear in the event content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_contains: Option<String>,
}

impl TriggerPattern {
    /// Whether the pattern has any clause at all.
    pub fn is_empty(&self) -> bool {
        self.event_type.is_none() && self.required_tags.is_empty() && self.content_contains.is_none()
    }

    /// Evaluate the predicate against an event-shaped probe.
    pub fn matches(&self, event_type: &str, tags: &[String], content: &str) -> bool {
        if self.is_empty() {
            return false;
        }
        if let Some(et) = &self.event_type {
            if et != event_type {
                return false;
            }
        }
        if !self.required_tags.iter().all(|t| tags.contains(t)) {
            return false;
        }
        if let Some(needle) = &self.content_contains {
            if !content.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Executable payload attached to a procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureCode {
    pub code: String,
    pub code_version: i64,
    /// Confidence in the payload, tracked separately from the record
    pub code_confidence: f64,
}

/// A reusable procedure distilled from experience.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Procedure {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub category: String,
    pub trigger_pattern: TriggerPattern,
    /// Ordered textual instructions; position is semantic
    pub steps: Vec<String>,
    /// Exponential moving average of run outcomes
    pub success_rate: f64,
    pub usage_count: i64,
    pub avg_duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ProcedureCode>,
}

impl Procedure {
    /// Fold one run into the success-rate EMA and usage counters.
    ///
    /// Alpha 0.2 keeps roughly the last ten runs relevant.
    pub fn record_run(&mut self, succeeded: bool, duration_ms: i64) {
        const ALPHA: f64 = 0.2;
        let outcome = if succeeded { 1.0 } else { 0.0 };
        self.success_rate = if self.usage_count == 0 {
            outcome
        } else {
            ALPHA * outcome + (1.0 - ALPHA) * self.success_rate
        };
        let total = self.avg_duration_ms * self.usage_count + duration_ms;
        self.usage_count += 1;
        self.avg_duration_ms = total / self.usage_count;
    }
}

/// Input for registering a new procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProcedureInput {
    pub project_id: String,
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub trigger_pattern: TriggerPattern,
    pub steps: Vec<String>,
    #[serde(default)]
    pub evidence_type: EvidenceType,
    #[serde(default = "super::event::default_confidence")]
    pub confidence: f64,
    #[serde(default = "super::event::default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

fn default_category() -> String {
    "general".to_string()
}

impl ProcedureInput {
    pub fn into_procedure(self) -> Result<Procedure> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("procedure name is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(EngineError::Validation(
                "procedure has no steps".to_string(),
            ));
        }

        let mut envelope = Envelope::new(self.project_id, self.evidence_type);
        envelope.confidence = self.confidence;
        envelope.importance = self.importance;
        envelope.tags = self.tags;
        envelope.source_id = self.source_id;
        envelope.check()?;

        Ok(Procedure {
            envelope,
            name: self.name,
            category: self.category,
            trigger_pattern: self.trigger_pattern,
            steps: self.steps,
            success_rate: 0.0,
            usage_count: 0,
            avg_duration_ms: 0,
            code: self.code.map(|code| ProcedureCode {
                code,
                code_version: 1,
                code_confidence: 0.5,
            }),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_pattern_matching() {
        let pattern = TriggerPattern {
            event_type: Some("test_failure".into()),
            required_tags: vec!["ci".into()],
            content_contains: Some("flaky".into()),
        };
        assert!(pattern.matches(
            "test_failure",
            &["ci".into(), "rust".into()],
            "flaky test in parser"
        ));
        assert!(!pattern.matches("edit", &["ci".into()], "flaky test"));
        assert!(!pattern.matches("test_failure", &[], "flaky test"));
        assert!(!pattern.matches("test_failure", &["ci".into()], "stable test"));
    }

    #[test]
    fn test_empty_trigger_never_fires() {
        let pattern = TriggerPattern::default();
        assert!(!pattern.matches("edit", &[], "anything"));
    }

    #[test]
    fn test_record_run_ema() {
        let mut proc = ProcedureInput {
            project_id: "p".into(),
            name: "fix flaky test".into(),
            category: "testing".into(),
            trigger_pattern: TriggerPattern::default(),
            steps: vec!["rerun".into(), "bisect".into()],
            evidence_type: EvidenceType::Learned,
            confidence: 0.7,
            importance: 0.5,
            tags: vec![],
            source_id: None,
            code: None,
        }
        .into_procedure()
        .unwrap();

        proc.record_run(true, 1000);
        assert_eq!(proc.success_rate, 1.0);
        assert_eq!(proc.usage_count, 1);
        assert_eq!(proc.avg_duration_ms, 1000);

        proc.record_run(false, 3000);
        assert!(proc.success_rate < 1.0 && proc.success_rate > 0.5);
        assert_eq!(proc.avg_duration_ms, 2000);
    }

    #[test]
    fn test_into_procedure_requires_steps() {
        let input = ProcedureInput {
            project_id: "p".into(),
            name: "x".into(),
            category: "general".into(),
            trigger_pattern: TriggerPattern::default(),
            steps: vec![],
            evidence_type: EvidenceType::Learned,
            confidence: 0.5,
            importance: 0.5,
            tags: vec![],
            source_id: None,
            code: None,
        };
        assert!(input.into_procedure().is_err());
    }
}

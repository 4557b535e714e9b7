//! Event records - the substrate of episodic experience
//!
//! Events are the only kind whose raw stream is compressed by the
//! consolidator; every other kind is derived or user-authored.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::{Envelope, EvidenceType};
use crate::error::{EngineError, Result};

/// How an event turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
    #[default]
    Ongoing,
}

impl Outcome {
    /// Survivor-score contribution used by the arbiter.
    pub fn score(&self) -> f64 {
        match self {
            Outcome::Success => 1.0,
            Outcome::Partial => 0.6,
            Outcome::Ongoing => 0.5,
            Outcome::Failure => 0.3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Partial => "partial",
            Outcome::Ongoing => "ongoing",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Outcome::Success),
            "failure" => Some(Outcome::Failure),
            "partial" => Some(Outcome::Partial),
            "ongoing" => Some(Outcome::Ongoing),
            _ => None,
        }
    }

    /// Whether two outcomes are opposed for contradiction detection.
    pub fn opposes(&self, other: Outcome) -> bool {
        matches!(
            (self, other),
            (Outcome::Success, Outcome::Failure) | (Outcome::Failure, Outcome::Success)
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ambient facts captured alongside an event. Keys are free-form but the
/// consolidator normalizes `dir`, `file`, `branch`, and `task` when building
/// cluster keys.
pub type EventContext = BTreeMap<String, String>;

/// Code-aware annotations carried by events produced in coding sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_passed: Option<bool>,
}

impl CodeContext {
    /// Whether any field is populated; empty contexts are stored as NULL.
    pub fn is_empty(&self) -> bool {
        *self == CodeContext::default()
    }
}

/// An episodic event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Session that produced the event
    pub session_id: String,
    /// Coarse classification used by the consolidator's cluster key
    pub event_type: String,
    /// Free-text description
    pub content: String,
    /// How it turned out
    pub outcome: Outcome,
    /// Ambient facts: working directory, file, branch, task
    pub context: EventContext,
    /// Code-aware annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeContext>,
    /// Whether an embedding row exists for this event
    pub has_embedding: bool,
}

/// Input for recording a new event.
///
/// Uses `deny_unknown_fields` to reject malformed external payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventInput {
    pub project_id: String,
    pub session_id: String,
    pub content: String,
    #[serde(default = "default_event_type")]
    pub event_type: String,
    #[serde(default)]
    pub outcome: Outcome,
    #[serde(default)]
    pub context: EventContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeContext>,
    /// Caller may pre-embed; otherwise the store computes or flags the row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub evidence_type: EvidenceType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
}

fn default_event_type() -> String {
    "generic".to_string()
}

pub(crate) fn default_confidence() -> f64 {
    0.5
}

pub(crate) fn default_importance() -> f64 {
    0.5
}

impl EventInput {
    /// Materialize the input into a record, running envelope checks.
    pub fn into_event(self) -> Result<(Event, Option<Vec<f32>>)> {
        if self.content.trim().is_empty() {
            return Err(EngineError::Validation("event content is empty".to_string()));
        }
        if self.session_id.is_empty() {
            return Err(EngineError::Validation("session_id is empty".to_string()));
        }

        let mut envelope = Envelope::new(self.project_id, self.evidence_type);
        envelope.confidence = self.confidence;
        envelope.importance = self.importance;
        envelope.tags = self.tags;
        envelope.valid_from = self.valid_from;
        envelope.valid_to = self.valid_to;
        envelope.check()?;

        let has_embedding = self.embedding.is_some();
        let event = Event {
            envelope,
            session_id: self.session_id,
            event_type: self.event_type,
            content: self.content,
            outcome: self.outcome,
            context: self.context,
            code: self.code.filter(|c| !c.is_empty()),
            has_embedding,
        };
        Ok((event, self.embedding))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn input(content: &str) -> EventInput {
        EventInput {
            project_id: "proj".into(),
            session_id: "sess".into(),
            content: content.into(),
            event_type: "edit".into(),
            outcome: Outcome::Success,
            context: EventContext::new(),
            code: None,
            embedding: None,
            evidence_type: EvidenceType::Observed,
            confidence: 0.8,
            importance: 0.5,
            tags: vec![],
            valid_from: None,
            valid_to: None,
        }
    }

    #[test]
    fn test_outcome_opposition() {
        assert!(Outcome::Success.opposes(Outcome::Failure));
        assert!(Outcome::Failure.opposes(Outcome::Success));
        assert!(!Outcome::Success.opposes(Outcome::Partial));
        assert!(!Outcome::Ongoing.opposes(Outcome::Failure));
    }

    #[test]
    fn test_outcome_score_ordering() {
        assert!(Outcome::Success.score() > Outcome::Partial.score());
        assert!(Outcome::Partial.score() > Outcome::Ongoing.score());
        assert!(Outcome::Ongoing.score() > Outcome::Failure.score());
    }

    #[test]
    fn test_into_event_rejects_empty_content() {
        assert!(input("   ").into_event().is_err());
    }

    #[test]
    fn test_into_event_stamps_envelope() {
        let (event, embedding) = input("ran the test suite").into_event().unwrap();
        assert!(!event.envelope.id.is_empty());
        assert_eq!(event.envelope.confidence, 0.8);
        assert_eq!(event.envelope.version, 1);
        assert!(!event.has_embedding);
        assert!(embedding.is_none());
    }

    #[test]
    fn test_input_deny_unknown_fields() {
        let json = r#"{"projectId":"p","sessionId":"s","content":"c","extra":1}"#;
        let parsed: std::result::Result<EventInput, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }
}

//! Fact records - semantic memory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::{Envelope, EvidenceType};
use super::event::{default_confidence, default_importance};
use crate::error::{EngineError, Result};

/// Semantic classification of a fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    #[default]
    Fact,
    Pattern,
    Decision,
    Context,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Pattern => "pattern",
            MemoryType::Decision => "decision",
            MemoryType::Context => "context",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(MemoryType::Fact),
            "pattern" => Some(MemoryType::Pattern),
            "decision" => Some(MemoryType::Decision),
            "context" => Some(MemoryType::Context),
            _ => None,
        }
    }
}

/// A semantic memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub content: String,
    pub memory_type: MemoryType,
    /// Feedback-driven usefulness score in [0, 1]
    pub usefulness: f64,
    pub has_embedding: bool,
}

/// Input for asserting a new fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FactInput {
    pub project_id: String,
    pub content: String,
    #[serde(default)]
    pub memory_type: MemoryType,
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
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
}

impl FactInput {
    /// Materialize the input into a record, running envelope checks.
    pub fn into_fact(self) -> Result<(Fact, Option<Vec<f32>>)> {
        if self.content.trim().is_empty() {
            return Err(EngineError::Validation("fact content is empty".to_string()));
        }

        let mut envelope = Envelope::new(self.project_id, self.evidence_type);
        envelope.confidence = self.confidence;
        envelope.importance = self.importance;
        envelope.tags = self.tags;
        envelope.source_id = self.source_id;
        envelope.valid_from = self.valid_from;
        envelope.valid_to = self.valid_to;
        envelope.check()?;

        let has_embedding = self.embedding.is_some();
        let fact = Fact {
            envelope,
            content: self.content,
            memory_type: self.memory_type,
            usefulness: 0.0,
            has_embedding,
        };
        Ok((fact, self.embedding))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_roundtrip() {
        for mt in [
            MemoryType::Fact,
            MemoryType::Pattern,
            MemoryType::Decision,
            MemoryType::Context,
        ] {
            assert_eq!(MemoryType::parse_name(mt.as_str()), Some(mt));
        }
    }

    #[test]
    fn test_into_fact() {
        let input = FactInput {
            project_id: "proj".into(),
            content: "Python uses reference counting".into(),
            memory_type: MemoryType::Fact,
            embedding: None,
            evidence_type: EvidenceType::Observed,
            confidence: 0.9,
            importance: 0.5,
            tags: vec!["python".into()],
            source_id: None,
            valid_from: None,
            valid_to: None,
        };
        let (fact, _) = input.into_fact().unwrap();
        assert_eq!(fact.usefulness, 0.0);
        assert_eq!(fact.envelope.version, 1);
        assert!(!fact.has_embedding);
    }

    #[test]
    fn test_into_fact_rejects_bad_confidence() {
        let input = FactInput {
            project_id: "proj".into(),
            content: "x".into(),
            memory_type: MemoryType::Fact,
            embedding: None,
            evidence_type: EvidenceType::Observed,
            confidence: 7.0,
            importance: 0.5,
            tags: vec![],
            source_id: None,
            valid_from: None,
            valid_to: None,
        };
        assert!(input.into_fact().is_err());
    }
}

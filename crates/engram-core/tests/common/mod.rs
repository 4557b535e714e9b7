//! Shared test harness: deterministic embedder/validator stubs and an
//! engine builder over a throwaway database.

#![allow(dead_code)]

use std::sync::Arc;

use engram_core::{
    ContradictionReview, Embedder, EmbedderError, EngineConfig, EventContext, EventInput,
    EvidenceType, FactInput, Judgement, MemoryEngine, Outcome, PatternReview, RerankCandidate,
    Validator, ValidatorError,
};

/// Stub vector width, wired into the test config.
pub const DIMS: usize = 8;

/// Tokens ignored by the stub embedder so paraphrases land on near-identical
/// vectors (negation words included: the arbiter's negation check is lexical
/// over the stored content, not the vector).
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "do", "does", "did", "not", "no", "use", "uses",
    "used", "of", "in", "on", "to", "and",
];

fn bucket(token: &str) -> usize {
    token
        .bytes()
        .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
        % DIMS
}

/// Deterministic bag-of-words embedder.
pub struct StubEmbedder;

impl Embedder for StubEmbedder {
    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut vector = vec![0.0f32; DIMS];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        {
            vector[bucket(token)] += 1.0;
        }
        if vector.iter().all(|v| *v == 0.0) {
            vector[0] = 1.0;
        }
        Ok(vector)
    }
}

/// Embedder that is always unreachable, for degraded-path tests.
pub struct FailingEmbedder;

impl Embedder for FailingEmbedder {
    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedderError> {
        Err(EmbedderError::Unavailable("stub offline".to_string()))
    }
}

/// Deterministic validator: accepts patterns with a capped confidence,
/// treats very-high-similarity escalations as contradictions, and reranks by
/// reversing the head (so rerank effects are observable).
pub struct StubValidator;

impl Validator for StubValidator {
    fn validate_pattern(&self, review: &PatternReview) -> Result<Judgement, ValidatorError> {
        Ok(Judgement::Accept {
            confidence: review.confidence_before_validation.min(0.9),
        })
    }

    fn judge_contradiction(&self, review: &ContradictionReview) -> Result<bool, ValidatorError> {
        Ok(review.similarity > 0.95)
    }

    fn rerank(
        &self,
        _query: &str,
        candidates: &[RerankCandidate],
    ) -> Result<Vec<usize>, ValidatorError> {
        Ok((0..candidates.len()).rev().collect())
    }
}

/// An engine over a temp database. Keep the tempdir alive with the engine.
pub struct TestBed {
    pub engine: MemoryEngine,
    _dir: tempfile::TempDir,
}

pub fn base_config(dir: &tempfile::TempDir) -> EngineConfig {
    EngineConfig {
        db_path: Some(dir.path().join("engram.db")),
        embedding_dimensions: DIMS,
        ..Default::default()
    }
}

pub fn testbed(
    embedder: Option<Arc<dyn Embedder>>,
    validator: Option<Arc<dyn Validator>>,
) -> TestBed {
    testbed_with(embedder, validator, |_| {})
}

pub fn testbed_with(
    embedder: Option<Arc<dyn Embedder>>,
    validator: Option<Arc<dyn Validator>>,
    tweak: impl FnOnce(&mut EngineConfig),
) -> TestBed {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = base_config(&dir);
    tweak(&mut config);
    let engine = MemoryEngine::connect(config, embedder, validator).expect("connect");
    TestBed { engine, _dir: dir }
}

/// Event input shorthand.
pub fn event(project: &str, content: &str, event_type: &str, outcome: Outcome) -> EventInput {
    EventInput {
        project_id: project.to_string(),
        session_id: "session-1".to_string(),
        content: content.to_string(),
        event_type: event_type.to_string(),
        outcome,
        context: EventContext::new(),
        code: None,
        embedding: None,
        evidence_type: EvidenceType::Observed,
        confidence: 0.8,
        importance: 0.5,
        tags: Vec::new(),
        valid_from: None,
        valid_to: None,
    }
}

/// Fact input shorthand.
pub fn fact(
    project: &str,
    content: &str,
    confidence: f64,
    evidence_type: EvidenceType,
) -> FactInput {
    FactInput {
        project_id: project.to_string(),
        content: content.to_string(),
        memory_type: Default::default(),
        embedding: None,
        evidence_type,
        confidence,
        importance: 0.5,
        tags: Vec::new(),
        source_id: None,
        valid_from: None,
        valid_to: None,
    }
}

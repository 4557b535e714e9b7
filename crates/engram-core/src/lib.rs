//! # Engram Core
//!
//! Persistent, local-first memory engine for long-running AI agent sessions.
//! Stores heterogeneous records produced across sessions and serves three
//! workloads at once:
//!
//! - **Hybrid retrieval**: dense vector similarity fused with BM25/FTS5
//!   lexical scoring via reciprocal rank fusion, structural filters, and an
//!   optional validator rerank
//! - **Background consolidation**: a dual-process pipeline (statistical
//!   clustering plus a slow validator) that compresses raw event streams
//!   into patterns and procedures
//! - **Invariant maintenance**: lifecycle DAG enforcement, reconsolidation
//!   windows, contradiction arbitration, and a bounded working set
//!
//! ## Record model
//!
//! Seven record kinds (events, facts, procedures, tasks, entities, relations,
//! patterns) share one envelope: project scope, bi-temporal stamps
//! (transaction time plus modeled validity), lifecycle state, confidence,
//! derived evidence quality, activation counters, importance, and tags.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use engram_core::{EngineConfig, EventInput, MemoryEngine, RetrievalQuery};
//!
//! let engine = MemoryEngine::connect(EngineConfig::from_env()?, None, None)?;
//!
//! let event = engine.record_event(EventInput {
//!     project_id: "my-project".into(),
//!     session_id: "session-1".into(),
//!     content: "cargo test finally passed after the lockfile fix".into(),
//!     ..Default::default()
//! }, None).await?;
//!
//! let hits = engine.retrieve(
//!     "my-project",
//!     RetrievalQuery::text("lockfile fix"),
//!     5,
//!     Default::default(),
//!     None,
//! ).await?;
//! ```
//!
//! The embedder and validator are external collaborators injected at
//! `connect`; their absence degrades dense ranking and validation to
//! first-class fallback branches rather than failures.

// ============================================================================
// MODULES
// ============================================================================

pub mod arbiter;
pub mod attention;
pub mod audit;
pub mod config;
pub mod consolidation;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ratelimit;
pub mod record;
pub mod retrieval;
pub mod scheduler;
pub mod store;
pub mod substrate;
pub mod validator;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{ArbiterConfig, Band, ConsolidationConfig, EngineConfig, RateLimits, RetrievalConfig};
pub use engine::{HealthReport, MemoryEngine};
pub use error::{EngineError, Result};

// Record model
pub use record::{
    derive_evidence_quality, CodeContext, Entity, EntityInput, Envelope, Event, EventContext,
    EventInput, EvidenceType, Fact, FactInput, Lifecycle, MemoryType, Outcome, Pattern,
    PatternType, PlanStep, Procedure, ProcedureCode, ProcedureInput, ProvenanceNote, Record,
    RecordKind, Relation, RelationInput, Task, TaskInput, TaskPhase, TaskPriority, TaskStatus,
    TriggerPattern,
};

// Storage
pub use store::{RecordPatch, RecordStore, ScopeFilters};
pub use substrate::{Deadline, PoolStats, Substrate};

// Retrieval
pub use retrieval::{
    reciprocal_rank_fusion, sanitize_fts5_query, Diagnostics, FusedCandidate, MatchStage,
    Retrieved, RetrievalOptions, RetrievalQuery, Retriever,
};

// Consolidation
pub use consolidation::{
    CancelFlag, ConsolidationReport, Consolidator, EventCluster, Strategy,
};

// Arbitration
pub use arbiter::{Arbiter, ContradictionType, ResolutionOutcome, ResolutionPolicy};

// Attention and graph
pub use attention::{CognitiveLoad, QualityHistogram, QualityTracker};
pub use graph::{GraphOps, RelatedEntity, TRAVERSAL_NODE_BUDGET};

// External collaborator contracts
pub use embeddings::{cosine_similarity, Embedder, EmbedderError, Embedding, EmbeddingCache};
pub use validator::{
    ContradictionReview, Judgement, PatternReview, RerankCandidate, Validator, ValidatorError,
};

// Background
pub use audit::{AuditEntry, AuditLog};
pub use ratelimit::{OpKind, RateLimiter};
pub use scheduler::SchedulerHandle;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding dimension expected by the vector column
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 256;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Deadline, EngineConfig, EngineError, EventInput, FactInput, HealthReport, Lifecycle,
        MemoryEngine, Record, RecordKind, Result, RetrievalOptions, RetrievalQuery, Strategy,
    };

    pub use crate::{Embedder, Validator};
}

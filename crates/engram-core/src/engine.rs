//! MemoryEngine - the process-wide handle
//!
//! `connect` wires the substrate, store, retriever, consolidator, arbiter,
//! tracker, and graph ops around one shared substrate pool. Caches and rate
//! limiters live inside the handle; there are no hidden statics. Optional
//! collaborators (embedder, validator) are injected here and their absence is
//! a first-class branch everywhere downstream.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arbiter::{Arbiter, ResolutionOutcome, ResolutionPolicy};
use crate::attention::{CognitiveLoad, QualityHistogram, QualityTracker};
use crate::audit::{AuditEntry, AuditLog};
use crate::config::EngineConfig;
use crate::consolidation::{CancelFlag, ConsolidationReport, Consolidator, Strategy};
use crate::embeddings::{Embedder, EmbeddingCache};
use crate::error::{EngineError, Result};
use crate::graph::{GraphOps, RelatedEntity};
use crate::ratelimit::{OpKind, RateLimiter};
use crate::record::{
    Entity, EntityInput, Event, EventInput, Fact, FactInput, Lifecycle, Procedure, ProcedureInput,
    Record, RecordKind, Relation, RelationInput, Task, TaskInput, TaskPhase, TaskStatus,
};
use crate::retrieval::{Retrieved, RetrievalOptions, RetrievalQuery, Retriever};
use crate::scheduler::{self, SchedulerHandle};
use crate::store::{RecordPatch, RecordStore, ScopeFilters};
use crate::substrate::{Deadline, PoolStats, Substrate};
use crate::validator::Validator;

// ============================================================================
// HEALTH SURFACE
// ============================================================================

/// Project health summary for the CLI and dispatch surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub project_id: String,
    /// Lifecycle histogram per record kind
    pub counts: BTreeMap<String, BTreeMap<String, i64>>,
    /// Records parked in needs_review
    pub contradiction_backlog: i64,
    pub unconsolidated_events: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_consolidation_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_consolidation_age_seconds: Option<i64>,
    pub pool_size: usize,
    pub pool_idle: usize,
    pub pool_pending: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The memory engine handle. One per process.
pub struct MemoryEngine {
    config: Arc<EngineConfig>,
    substrate: Arc<Substrate>,
    store: Arc<RecordStore>,
    retriever: Retriever,
    consolidator: Arc<Consolidator>,
    arbiter: Arc<Arbiter>,
    tracker: QualityTracker,
    graph: GraphOps,
    limiter: RateLimiter,
    audit: Arc<AuditLog>,
}

impl MemoryEngine {
    /// Open the substrate, run migrations, and wire every component around
    /// the shared pool. Fails `Unavailable` when the pool cannot reach its
    /// minimum size, `Validation` when the embedder's dimension disagrees
    /// with the configured vector width.
    pub fn connect(
        config: EngineConfig,
        embedder: Option<Arc<dyn Embedder>>,
        validator: Option<Arc<dyn Validator>>,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(embedder) = &embedder {
            if embedder.dimensions() != config.embedding_dimensions {
                return Err(EngineError::Validation(format!(
                    "embedder produces {} dimensions, substrate column is {}",
                    embedder.dimensions(),
                    config.embedding_dimensions
                )));
            }
        }

        let config = Arc::new(config);
        let substrate = Arc::new(Substrate::connect(&config)?);
        let audit = Arc::new(AuditLog::new(Arc::clone(&substrate)));
        let store = Arc::new(RecordStore::new(
            Arc::clone(&substrate),
            embedder.clone(),
            Arc::clone(&audit),
            Arc::clone(&config),
        ));
        let cache = Arc::new(EmbeddingCache::new(config.embedding_cache_size));
        let retriever = Retriever::new(
            Arc::clone(&store),
            embedder,
            validator.clone(),
            cache,
            Arc::clone(&config),
        );
        let arbiter = Arc::new(Arbiter::new(
            Arc::clone(&store),
            validator.clone(),
            Arc::clone(&config),
        ));
        let consolidator = Arc::new(Consolidator::new(
            Arc::clone(&store),
            Arc::clone(&arbiter),
            validator,
            Arc::clone(&config),
        ));
        let tracker = QualityTracker::new(Arc::clone(&store), Arc::clone(&config));
        let graph = GraphOps::new(Arc::clone(&store));
        let limiter = RateLimiter::new(config.rate_limits);

        tracing::info!(
            pool = ?substrate.pool_stats(),
            dimensions = config.embedding_dimensions,
            "memory engine connected"
        );

        Ok(Self {
            config,
            substrate,
            store,
            retriever,
            consolidator,
            arbiter,
            tracker,
            graph,
            limiter,
            audit,
        })
    }

    fn deadline(&self, deadline: Option<Deadline>) -> Deadline {
        deadline.unwrap_or_else(|| Deadline::after(self.config.default_deadline))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.substrate.pool_stats()
    }

    /// Direct store access for embedded callers that need the full surface.
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Spawn the background scheduler for this engine.
    pub fn start_scheduler(&self) -> SchedulerHandle {
        scheduler::spawn(
            Arc::clone(&self.store),
            Arc::clone(&self.consolidator),
            Arc::clone(&self.config),
        )
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    pub async fn record_event(
        &self,
        input: EventInput,
        deadline: Option<Deadline>,
    ) -> Result<Event> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        let project = input.project_id.clone();
        let event = self.store.insert_event(input, deadline).await?;
        self.store.touch_activity(&project, deadline).await?;
        Ok(event)
    }

    pub async fn assert_fact(&self, input: FactInput, deadline: Option<Deadline>) -> Result<Fact> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        let project = input.project_id.clone();
        let fact = self.store.insert_fact(input, deadline).await?;
        self.store.touch_activity(&project, deadline).await?;
        Ok(fact)
    }

    pub async fn add_procedure(
        &self,
        input: ProcedureInput,
        deadline: Option<Deadline>,
    ) -> Result<Procedure> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.insert_procedure(input, deadline).await
    }

    pub async fn add_task(&self, input: TaskInput, deadline: Option<Deadline>) -> Result<Task> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.insert_task(input, deadline).await
    }

    pub async fn add_entity(
        &self,
        input: EntityInput,
        deadline: Option<Deadline>,
    ) -> Result<Entity> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.insert_entity(input, deadline).await
    }

    pub async fn add_relation(
        &self,
        input: RelationInput,
        deadline: Option<Deadline>,
    ) -> Result<Relation> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.insert_relation(input, deadline).await
    }

    pub async fn update(
        &self,
        kind: RecordKind,
        id: &str,
        patch: RecordPatch,
        deadline: Option<Deadline>,
    ) -> Result<Record> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.update(kind, id, patch, deadline).await
    }

    pub async fn transition(
        &self,
        kind: RecordKind,
        id: &str,
        new_state: Lifecycle,
        reason: &str,
        deadline: Option<Deadline>,
    ) -> Result<Record> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store
            .transition(kind, id, new_state, reason, deadline)
            .await
    }

    /// Count a retrieval hit by hand. Returns whether a reconsolidation
    /// window was opened.
    pub async fn activate(
        &self,
        kind: RecordKind,
        id: &str,
        deadline: Option<Deadline>,
    ) -> Result<bool> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.activate(kind, id, deadline).await
    }

    pub async fn move_task(
        &self,
        id: &str,
        status: TaskStatus,
        phase: TaskPhase,
        deadline: Option<Deadline>,
    ) -> Result<Task> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.move_task(id, status, phase, deadline).await
    }

    pub async fn record_procedure_run(
        &self,
        id: &str,
        succeeded: bool,
        duration_ms: i64,
        deadline: Option<Deadline>,
    ) -> Result<Procedure> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store
            .record_procedure_run(id, succeeded, duration_ms, deadline)
            .await
    }

    pub async fn record_fact_usefulness(
        &self,
        id: &str,
        useful: bool,
        deadline: Option<Deadline>,
    ) -> Result<Fact> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.record_fact_usefulness(id, useful, deadline).await
    }

    pub async fn attend(
        &self,
        project_id: &str,
        kind: RecordKind,
        id: &str,
        deadline: Option<Deadline>,
    ) -> Result<Vec<String>> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.attend(project_id, kind, id, deadline).await
    }

    pub async fn delete_project(
        &self,
        project_id: &str,
        deadline: Option<Deadline>,
    ) -> Result<()> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.delete_project(project_id, deadline).await
    }

    pub async fn purge_archived(&self, deadline: Option<Deadline>) -> Result<u64> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.purge_archived(deadline).await
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    pub async fn get(
        &self,
        kind: RecordKind,
        id: &str,
        deadline: Option<Deadline>,
    ) -> Result<Record> {
        let deadline = self.deadline(deadline);
        self.store.get_record(kind, id, deadline).await
    }

    pub async fn scope_query(
        &self,
        project_id: &str,
        kind: RecordKind,
        filters: ScopeFilters,
        deadline: Option<Deadline>,
    ) -> Result<Vec<Record>> {
        let deadline = self.deadline(deadline);
        self.store
            .scope_query(project_id, kind, filters, deadline)
            .await
    }

    /// Hybrid retrieval. Touches project activity so the scheduler backs
    /// off, then runs the full pipeline.
    pub async fn retrieve(
        &self,
        project_id: &str,
        query: RetrievalQuery,
        k: usize,
        options: RetrievalOptions,
        deadline: Option<Deadline>,
    ) -> Result<Vec<Retrieved>> {
        self.limiter.check(OpKind::Retrieve)?;
        let deadline = self.deadline(deadline);
        self.store.touch_activity(project_id, deadline).await?;
        self.retriever
            .retrieve(project_id, query, k, options, deadline)
            .await
    }

    /// Procedures whose trigger pattern matches an event-shaped probe,
    /// ordered by success rate.
    pub async fn matching_procedures(
        &self,
        project_id: &str,
        event_type: &str,
        tags: &[String],
        content: &str,
        deadline: Option<Deadline>,
    ) -> Result<Vec<Procedure>> {
        let deadline = self.deadline(deadline);
        self.store
            .matching_procedures(project_id, event_type, tags, content, deadline)
            .await
    }

    pub async fn find_related(
        &self,
        entity_id: &str,
        relation_type: Option<&str>,
        max_depth: usize,
        deadline: Option<Deadline>,
    ) -> Result<Vec<RelatedEntity>> {
        let deadline = self.deadline(deadline);
        self.graph
            .find_related(entity_id, relation_type, max_depth, deadline)
            .await
    }

    pub async fn delete_entity(&self, id: &str, deadline: Option<Deadline>) -> Result<u64> {
        self.limiter.check(OpKind::Write)?;
        let deadline = self.deadline(deadline);
        self.store.delete_entity(id, deadline).await
    }

    pub async fn assign_communities(
        &self,
        project_id: &str,
        deadline: Option<Deadline>,
    ) -> Result<usize> {
        let deadline = self.deadline(deadline);
        self.graph.assign_communities(project_id, deadline).await
    }

    pub async fn expertise(
        &self,
        project_id: &str,
        domain_tag: &str,
        deadline: Option<Deadline>,
    ) -> Result<Option<f64>> {
        let deadline = self.deadline(deadline);
        self.tracker.expertise(project_id, domain_tag, deadline).await
    }

    pub async fn cognitive_load(
        &self,
        project_id: &str,
        deadline: Option<Deadline>,
    ) -> Result<CognitiveLoad> {
        let deadline = self.deadline(deadline);
        self.tracker.cognitive_load(project_id, deadline).await
    }

    pub async fn quality_histogram(
        &self,
        project_id: &str,
        kind: RecordKind,
        deadline: Option<Deadline>,
    ) -> Result<QualityHistogram> {
        let deadline = self.deadline(deadline);
        self.tracker
            .quality_histogram(project_id, kind, deadline)
            .await
    }

    pub async fn audit_trail(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.audit.recent(limit).await
    }

    // ========================================================================
    // BACKGROUND PATH
    // ========================================================================

    /// On-demand consolidation.
    pub async fn consolidate(
        &self,
        project_id: &str,
        strategy: Strategy,
        max_patterns: Option<usize>,
        deadline: Option<Deadline>,
    ) -> Result<ConsolidationReport> {
        self.limiter.check(OpKind::Consolidate)?;
        let deadline = self.deadline(deadline);
        let cancel = CancelFlag::new();
        self.consolidator
            .consolidate(project_id, strategy, max_patterns, &cancel, deadline)
            .await
    }

    /// Standalone contradiction pass with an explicit policy.
    pub async fn resolve_contradictions(
        &self,
        project_id: &str,
        policy: ResolutionPolicy,
        deadline: Option<Deadline>,
    ) -> Result<Vec<ResolutionOutcome>> {
        self.limiter.check(OpKind::Consolidate)?;
        let deadline = self.deadline(deadline);
        self.arbiter.sweep(project_id, policy, deadline).await
    }

    pub async fn close_expired_windows(
        &self,
        project_id: Option<&str>,
        deadline: Option<Deadline>,
    ) -> Result<u64> {
        let deadline = self.deadline(deadline);
        self.store.close_expired_windows(project_id, deadline).await
    }

    /// Health summary: lifecycle counts, contradiction backlog, last
    /// consolidation age, pool stats.
    pub async fn health(
        &self,
        project_id: &str,
        deadline: Option<Deadline>,
    ) -> Result<HealthReport> {
        let deadline = self.deadline(deadline);

        let mut counts = BTreeMap::new();
        for kind in RecordKind::ALL {
            let by_lifecycle = self
                .store
                .counts_by_lifecycle(project_id, kind, deadline)
                .await?;
            if !by_lifecycle.is_empty() {
                counts.insert(kind.as_str().to_string(), by_lifecycle);
            }
        }
        let contradiction_backlog = self.arbiter.backlog(project_id, deadline).await?;
        let unconsolidated_events = self
            .store
            .count_unconsolidated_events(project_id, deadline)
            .await?;
        let last_consolidation_at = self.consolidator.last_run_at(project_id, deadline).await?;
        let pool = self.substrate.pool_stats();

        Ok(HealthReport {
            project_id: project_id.to_string(),
            counts,
            contradiction_backlog,
            unconsolidated_events,
            last_consolidation_age_seconds: last_consolidation_at
                .map(|at| (Utc::now() - at).num_seconds()),
            last_consolidation_at,
            pool_size: pool.size,
            pool_idle: pool.idle,
            pool_pending: pool.pending,
        })
    }
}

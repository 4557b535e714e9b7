//! The consolidation pipeline

use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;

use crate::arbiter::{Arbiter, ResolutionPolicy};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::record::{
    derive_evidence_quality, Envelope, Event, EvidenceType, Lifecycle, Pattern, PatternType,
    Procedure, RecordKind, TriggerPattern,
};
use crate::store::RecordStore;
use crate::substrate::Deadline;
use crate::validator::{Judgement, PatternReview, Validator};

use super::cluster::{cluster_events, confidence_before_validation, EventCluster};
use super::{CancelFlag, ConsolidationReport, Strategy};

/// Dual-process consolidator over the record store.
pub struct Consolidator {
    store: Arc<RecordStore>,
    arbiter: Arc<Arbiter>,
    validator: Option<Arc<dyn Validator>>,
    config: Arc<EngineConfig>,
}

impl Consolidator {
    pub fn new(
        store: Arc<RecordStore>,
        arbiter: Arc<Arbiter>,
        validator: Option<Arc<dyn Validator>>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            arbiter,
            validator,
            config,
        }
    }

    /// Run the pipeline over the project's current cohort.
    ///
    /// Idempotent over a fixed cohort: pattern ids derive from cluster
    /// signatures, and emitted clusters flip their sources to `consolidated`
    /// in the same transaction, so a rerun finds nothing new to do.
    pub async fn consolidate(
        &self,
        project_id: &str,
        strategy: Strategy,
        max_patterns: Option<usize>,
        cancel: &CancelFlag,
        deadline: Deadline,
    ) -> Result<ConsolidationReport> {
        let started = std::time::Instant::now();
        let mut report = ConsolidationReport::new(project_id, strategy);
        let max_patterns =
            max_patterns.unwrap_or(self.config.consolidation.default_max_patterns);

        // 1. Sample the cohort.
        let lookback = chrono::Duration::from_std(self.config.consolidation.lookback_window)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let cohort = self
            .store
            .consolidation_cohort(project_id, Utc::now() - lookback, deadline)
            .await?;
        report.events_scored = cohort.len();

        // 2. Cluster (System 1). Deterministic order: signature, then
        // earliest member.
        let clusters = cluster_events(
            &cohort,
            self.config.consolidation.chain_gap,
            strategy.min_cluster_size(),
        );
        report.clusters_formed = clusters.len();

        // 3-7. Score, validate, emit, derive, sweep lifecycle. One
        // transaction per cluster; cancellation lands at cluster boundaries.
        for cluster in &clusters {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if report.patterns_emitted >= max_patterns {
                break;
            }
            if self.emit_cluster(project_id, strategy, cluster, &mut report, deadline).await? {
                report.patterns_emitted += 1;
            }
            // Cluster boundary: yield so foreground work is never starved.
            tokio::task::yield_now().await;
        }

        // 8. Contradiction pass over the project's current state.
        if !report.cancelled {
            let resolutions = self
                .arbiter
                .sweep(project_id, ResolutionPolicy::Auto, deadline)
                .await?;
            report.conflicts_detected = resolutions.len();
            report.conflicts_resolved = resolutions.len();
        }

        // Closing a cohort also closes expired reconsolidation windows.
        report.windows_closed = self
            .store
            .close_expired_windows(Some(project_id), deadline)
            .await?;

        report.duration_ms = started.elapsed().as_millis() as i64;
        self.persist_run(&report, deadline).await?;
        self.store.audit().success("consolidate", &[report.run_id.clone()]).await;

        tracing::info!(
            project_id,
            strategy = %strategy,
            events = report.events_scored,
            clusters = report.clusters_formed,
            patterns = report.patterns_emitted,
            conflicts = report.conflicts_detected,
            duration_ms = report.duration_ms,
            "consolidation run complete"
        );
        Ok(report)
    }

    /// Emit one cluster. Returns whether a pattern was inserted.
    async fn emit_cluster(
        &self,
        project_id: &str,
        strategy: Strategy,
        cluster: &EventCluster,
        report: &mut ConsolidationReport,
        deadline: Deadline,
    ) -> Result<bool> {
        let pattern_id = derived_id("pattern", project_id, &cluster.signature);
        if self.store.pattern_exists(&pattern_id, deadline).await? {
            // New observations of a known regularity fold into the existing
            // pattern instead of emitting a duplicate.
            self.fold_into_existing(&pattern_id, cluster, deadline).await?;
            return Ok(false);
        }

        let support = cluster.support();
        let confidence_before =
            confidence_before_validation(support, self.config.consolidation.laplace_prior);
        let mut confidence_after = confidence_before;
        let mut content = cluster.summarize();

        // System 2: validator pass inside the uncertainty band only.
        let band = self.config.consolidation.uncertainty_band;
        if strategy.consults_validator() && band.contains(confidence_before) {
            if let Some(validator) = &self.validator {
                report.validator_consulted += 1;
                match self.validate_cluster(validator, project_id, cluster, confidence_before).await
                {
                    Some(Judgement::Accept { confidence }) => {
                        confidence_after = confidence.clamp(0.0, 1.0);
                    }
                    Some(Judgement::Reject { reason }) => {
                        tracing::debug!(signature = %cluster.signature, reason,
                            "validator rejected candidate pattern");
                        return Ok(false);
                    }
                    Some(Judgement::Mutate {
                        new_text,
                        confidence,
                    }) => {
                        // Mutations may narrow the wording; the source id
                        // list is never theirs to change.
                        content = new_text;
                        confidence_after = confidence.clamp(0.0, 1.0);
                    }
                    None => report.validator_unavailable = true,
                }
            }
        }

        let pattern = self.build_pattern(
            project_id,
            pattern_id,
            cluster,
            content,
            confidence_before,
            confidence_after,
        );
        let embedding = self.store.embedder().and_then(|embedder| {
            embedder
                .embed(&pattern.content)
                .map_err(|err| {
                    tracing::debug!(error = %err, "pattern embedding skipped");
                    err
                })
                .ok()
        });

        let procedure = self.derive_procedure(project_id, &pattern, cluster);
        let derived_procedure = procedure.is_some();
        let source_events: Vec<Event> = cluster.events.clone();
        let dims = self.config.embedding_dimensions;
        let window = self.config.reconsolidation_window;

        // One transaction per cluster: the pattern, its embedding, the
        // derived procedure, and every source lifecycle flip land together
        // or not at all.
        let stored_pattern = {
            let mut stored = pattern.clone();
            stored.has_embedding =
                embedding.as_ref().map(|v| v.len() == dims).unwrap_or(false);
            stored
        };
        self.store
            .substrate()
            .transaction(deadline, "emit_cluster", move |tx| {
                crate::store::patterns::insert_pattern_in_tx(tx, &stored_pattern)?;
                if let Some(vector) = embedding.as_ref().filter(|v| v.len() == dims) {
                    RecordStore::insert_embedding_in_tx(
                        tx,
                        &stored_pattern.envelope.id,
                        RecordKind::Pattern,
                        &stored_pattern.envelope.project_id,
                        vector,
                    )?;
                }
                if let Some(procedure) = &procedure {
                    let exists: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM procedures WHERE id = ?1",
                        params![procedure.envelope.id],
                        |row| row.get(0),
                    )?;
                    if exists == 0 {
                        crate::store::procedures::insert_procedure_in_tx(tx, procedure)?;
                    }
                }
                for event in &source_events {
                    // A retrieval may have opened a window since the cohort
                    // was sampled; consolidating a source closes it.
                    let current: String = tx.query_row(
                        "SELECT lifecycle FROM events WHERE id = ?1",
                        params![event.envelope.id],
                        |row| row.get(0),
                    )?;
                    if current == "labile" {
                        crate::store::transition_in_tx(
                            tx,
                            RecordKind::Event,
                            &event.envelope.id,
                            Lifecycle::Active,
                            "window closed by consolidation",
                            window,
                        )?;
                    }
                    crate::store::transition_in_tx(
                        tx,
                        RecordKind::Event,
                        &event.envelope.id,
                        Lifecycle::Consolidated,
                        &format!("pattern_id={}", stored_pattern.envelope.id),
                        window,
                    )?;
                    // Folding into a pattern never lowers a source's evidence
                    // quality.
                    let folded = derive_evidence_quality(
                        event.envelope.evidence_type,
                        event.envelope.activation_count,
                        Some(event.outcome),
                        true,
                    )
                    .max(event.envelope.evidence_quality);
                    tx.execute(
                        "UPDATE events SET evidence_quality = ?1 WHERE id = ?2",
                        params![folded, event.envelope.id],
                    )?;
                }
                Ok(())
            })
            .await?;

        if derived_procedure {
            report.procedures_derived += 1;
        }
        Ok(true)
    }

    /// Extend an existing pattern with a fresh cluster of the same
    /// signature: merge source ids, bump support, flip the new sources.
    async fn fold_into_existing(
        &self,
        pattern_id: &str,
        cluster: &EventCluster,
        deadline: Deadline,
    ) -> Result<()> {
        let pattern_id = pattern_id.to_string();
        let source_events: Vec<Event> = cluster.events.clone();
        let window = self.config.reconsolidation_window;

        self.store
            .substrate()
            .transaction(deadline, "fold_cluster", move |tx| {
                let ids_raw: String = tx.query_row(
                    "SELECT source_event_ids FROM patterns WHERE id = ?1",
                    params![pattern_id],
                    |row| row.get(0),
                )?;
                let mut ids: Vec<String> = serde_json::from_str(&ids_raw).unwrap_or_default();

                let mut changed = false;
                for event in &source_events {
                    if !ids.contains(&event.envelope.id) {
                        ids.push(event.envelope.id.clone());
                        changed = true;
                    }
                    let current: String = tx.query_row(
                        "SELECT lifecycle FROM events WHERE id = ?1",
                        params![event.envelope.id],
                        |row| row.get(0),
                    )?;
                    if current == "labile" {
                        crate::store::transition_in_tx(
                            tx,
                            RecordKind::Event,
                            &event.envelope.id,
                            Lifecycle::Active,
                            "window closed by consolidation",
                            window,
                        )?;
                    }
                    crate::store::transition_in_tx(
                        tx,
                        RecordKind::Event,
                        &event.envelope.id,
                        Lifecycle::Consolidated,
                        &format!("pattern_id={pattern_id}"),
                        window,
                    )?;
                    let folded = derive_evidence_quality(
                        event.envelope.evidence_type,
                        event.envelope.activation_count,
                        Some(event.outcome),
                        true,
                    )
                    .max(event.envelope.evidence_quality);
                    tx.execute(
                        "UPDATE events SET evidence_quality = ?1 WHERE id = ?2",
                        params![folded, event.envelope.id],
                    )?;
                }

                if changed {
                    tx.execute(
                        "UPDATE patterns SET source_event_ids = ?1, support = ?2, updated_at = ?3
                         WHERE id = ?4",
                        params![
                            serde_json::to_string(&ids).unwrap_or_else(|_| ids_raw.clone()),
                            ids.len() as i64,
                            Utc::now(),
                            pattern_id,
                        ],
                    )?;
                }
                Ok(())
            })
            .await
    }

    async fn validate_cluster(
        &self,
        validator: &Arc<dyn Validator>,
        project_id: &str,
        cluster: &EventCluster,
        confidence_before: f64,
    ) -> Option<Judgement> {
        let review = PatternReview {
            project_id: project_id.to_string(),
            signature: cluster.signature.clone(),
            summary: cluster.summarize(),
            events: cluster
                .events
                .iter()
                .map(|e| {
                    (
                        e.envelope.id.clone(),
                        e.content.clone(),
                        e.outcome.as_str().to_string(),
                    )
                })
                .collect(),
            confidence_before_validation: confidence_before,
        };

        let validator = Arc::clone(validator);
        let task = tokio::task::spawn_blocking(move || validator.validate_pattern(&review));
        match task.await {
            Ok(Ok(judgement)) => Some(judgement),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "validator unavailable, keeping prior confidence");
                None
            }
            Err(join_err) => {
                tracing::warn!(error = %join_err, "validator task failed");
                None
            }
        }
    }

    fn build_pattern(
        &self,
        project_id: &str,
        pattern_id: String,
        cluster: &EventCluster,
        content: String,
        confidence_before: f64,
        confidence_after: f64,
    ) -> Pattern {
        let mut envelope = Envelope::new(project_id, EvidenceType::Inferred);
        envelope.id = pattern_id;
        envelope.confidence = confidence_after;
        envelope.evidence_quality = derive_evidence_quality(EvidenceType::Inferred, 0, None, false);
        envelope.importance = 0.6;

        Pattern {
            envelope,
            pattern_type: cluster.pattern_type(),
            content,
            source_event_ids: cluster
                .events
                .iter()
                .map(|e| e.envelope.id.clone())
                .collect(),
            support: cluster.support() as i64,
            confidence_before_validation: confidence_before,
            confidence_after_validation: confidence_after,
            provenance: Vec::new(),
            has_embedding: false,
        }
    }

    /// Workflow patterns with enough support spawn a procedure whose steps
    /// verbalize the event sequence.
    fn derive_procedure(
        &self,
        project_id: &str,
        pattern: &Pattern,
        cluster: &EventCluster,
    ) -> Option<Procedure> {
        if pattern.pattern_type != PatternType::Workflow
            || cluster.support() < self.config.consolidation.procedure_min_support
        {
            return None;
        }

        let first = &cluster.events[0];
        let mut envelope = Envelope::new(project_id, EvidenceType::Learned);
        envelope.id = derived_id("procedure", project_id, &cluster.signature);
        envelope.confidence = pattern.confidence_after_validation;
        envelope.evidence_quality = derive_evidence_quality(EvidenceType::Learned, 0, None, false);
        envelope.source_id = Some(pattern.envelope.id.clone());
        envelope.importance = 0.7;

        let steps: Vec<String> = cluster
            .events
            .iter()
            .take(12)
            .enumerate()
            .map(|(i, e)| format!("{}. {} ({})", i + 1, e.content, e.outcome.as_str()))
            .collect();

        Some(Procedure {
            envelope,
            name: format!("{} workflow", cluster.key),
            category: "consolidated".to_string(),
            trigger_pattern: TriggerPattern {
                event_type: Some(first.event_type.clone()),
                required_tags: Vec::new(),
                content_contains: None,
            },
            steps,
            success_rate: cluster.success_fraction(),
            usage_count: 0,
            avg_duration_ms: 0,
            code: None,
        })
    }

    async fn persist_run(&self, report: &ConsolidationReport, deadline: Deadline) -> Result<()> {
        let r = report.clone();
        self.store
            .substrate()
            .with_write(deadline, "persist_run", move |conn| {
                conn.execute(
                    "INSERT INTO consolidation_runs (
                        id, project_id, strategy, started_at, duration_ms,
                        events_scored, clusters_formed, patterns_emitted,
                        procedures_derived, conflicts_detected, conflicts_resolved,
                        validator_consulted, validator_unavailable
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        r.run_id,
                        r.project_id,
                        r.strategy.as_str(),
                        r.started_at,
                        r.duration_ms,
                        r.events_scored as i64,
                        r.clusters_formed as i64,
                        r.patterns_emitted as i64,
                        r.procedures_derived as i64,
                        r.conflicts_detected as i64,
                        r.conflicts_resolved as i64,
                        r.validator_consulted as i64,
                        r.validator_unavailable as i64,
                    ],
                )?;
                conn.execute(
                    "UPDATE projects SET last_consolidated_at = ?1 WHERE id = ?2",
                    params![r.started_at, r.project_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Age of the last completed run, for the scheduler and health surface.
    pub async fn last_run_at(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<Option<chrono::DateTime<Utc>>> {
        let project = project_id.to_string();
        self.store
            .substrate()
            .with_read(deadline, "last_run_at", move |conn| {
                use rusqlite::OptionalExtension;
                let at = conn
                    .query_row(
                        "SELECT started_at FROM consolidation_runs
                         WHERE project_id = ?1 ORDER BY started_at DESC LIMIT 1",
                        params![project],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(at)
            })
            .await
    }
}

/// Deterministic record id for consolidation output, derived from the
/// cluster signature so reruns collide instead of duplicating.
fn derived_id(kind: &str, project_id: &str, signature: &str) -> String {
    let name = format!("engram:{kind}:{project_id}:{signature}");
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_ids_are_stable_and_distinct() {
        let a = derived_id("pattern", "proj", "edit|file=a.rs|edit:success");
        let b = derived_id("pattern", "proj", "edit|file=a.rs|edit:success");
        let c = derived_id("pattern", "proj", "edit|file=b.rs|edit:success");
        let d = derived_id("procedure", "proj", "edit|file=a.rs|edit:success");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}

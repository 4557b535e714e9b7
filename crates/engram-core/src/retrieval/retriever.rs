//! The retrieval pipeline

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::embeddings::{embed_cached, Embedder, EmbeddingCache};
use crate::error::{EngineError, Result};
use crate::record::{Lifecycle, Record, RecordKind};
use crate::store::{DenseCandidate, LexicalCandidate, RecordStore, ScopeFilters};
use crate::substrate::Deadline;
use crate::validator::{RerankCandidate, Validator};

use super::fusion::{normalize_scores, recency_boost, reciprocal_rank_fusion};
use super::{sanitize_fts5_query, Diagnostics, MatchStage, Retrieved, RetrievalOptions, RetrievalQuery};

/// Hybrid retriever over the record store.
pub struct Retriever {
    store: Arc<RecordStore>,
    embedder: Option<Arc<dyn Embedder>>,
    validator: Option<Arc<dyn Validator>>,
    cache: Arc<EmbeddingCache>,
    config: Arc<EngineConfig>,
}

/// A candidate carried through blending and filtering.
struct Scored {
    record: Record,
    score: f64,
    rrf_score: f64,
    dense_score: Option<f64>,
    lexical_score: Option<f64>,
    recency: f64,
    stage: MatchStage,
}

impl Retriever {
    pub fn new(
        store: Arc<RecordStore>,
        embedder: Option<Arc<dyn Embedder>>,
        validator: Option<Arc<dyn Validator>>,
        cache: Arc<EmbeddingCache>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            embedder,
            validator,
            cache,
            config,
        }
    }

    /// Run the full pipeline and return the top `k` ranked records with
    /// diagnostics. Every returned record is activated.
    pub async fn retrieve(
        &self,
        project_id: &str,
        query: RetrievalQuery,
        k: usize,
        options: RetrievalOptions,
        deadline: Deadline,
    ) -> Result<Vec<Retrieved>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let ceiling = self.config.retrieval.k_ceiling;
        let clamped_k = k > ceiling;
        let k = k.min(ceiling);
        let kinds: Vec<RecordKind> = query
            .kinds
            .clone()
            .unwrap_or_else(|| RecordKind::SEARCHABLE.to_vec());

        let mut results = if query.is_structural() {
            self.structural(project_id, &query, &kinds, k, &options, deadline)
                .await?
        } else {
            self.ranked(project_id, &query, &kinds, k, &options, deadline)
                .await?
        };

        // Activation side effect for everything actually returned. Each
        // activation is atomic; failures degrade the labile annotation only.
        for retrieved in &mut results {
            let kind = retrieved.record.kind();
            let id = retrieved.record.id().to_string();
            match self.store.activate(kind, &id, deadline).await {
                Ok(window_opened) => {
                    retrieved.diagnostics.labile = window_opened
                        || retrieved.record.envelope().lifecycle == Lifecycle::Labile;
                }
                Err(err) => {
                    tracing::warn!(error = %err, id, "activation side effect failed");
                }
            }
            retrieved.diagnostics.clamped_k = clamped_k;
        }

        Ok(results)
    }

    // ========================================================================
    // RANKED PATH
    // ========================================================================

    async fn ranked(
        &self,
        project_id: &str,
        query: &RetrievalQuery,
        kinds: &[RecordKind],
        k: usize,
        options: &RetrievalOptions,
        deadline: Deadline,
    ) -> Result<Vec<Retrieved>> {
        let fetch_limit = self.config.retrieval.candidate_multiplier * k;
        let mut degraded = false;

        // Stage 1: embed if needed, through the content-hash cache.
        let query_vector = match (&query.embedding, &query.text) {
            (Some(vector), _) => Some(vector.clone()),
            (None, Some(text)) => match &self.embedder {
                Some(embedder) => {
                    match embed_cached(
                        embedder.as_ref(),
                        &self.cache,
                        self.config.embedding_dimensions,
                        text,
                    ) {
                        Ok(vector) => Some(vector),
                        Err(err) => {
                            tracing::warn!(error = %err, "query embedding failed, lexical only");
                            degraded = true;
                            None
                        }
                    }
                }
                None => {
                    degraded = true;
                    None
                }
            },
            (None, None) => None,
        };

        // Stages 2 and 3: over-fetched candidate pulls.
        let dense_result: Result<Vec<DenseCandidate>> = match &query_vector {
            Some(vector) => {
                self.store
                    .dense_candidates(project_id, kinds, vector, fetch_limit, deadline)
                    .await
            }
            None => Ok(Vec::new()),
        };
        let match_expr = query
            .text
            .as_deref()
            .map(sanitize_fts5_query)
            .unwrap_or_default();
        let lexical_result: Result<Vec<LexicalCandidate>> = self
            .store
            .lexical_candidates(project_id, kinds, &match_expr, fetch_limit, deadline)
            .await;

        let (dense, lexical) = match (dense_result, lexical_result) {
            (Ok(dense), Ok(lexical)) => (dense, lexical),
            (Err(dense_err), Ok(lexical)) => {
                // Degraded but useful: lexical-only ordering.
                tracing::warn!(error = %dense_err, "dense fetch failed, lexical fallback");
                degraded = true;
                (Vec::new(), lexical)
            }
            (Ok(dense), Err(lexical_err)) => {
                tracing::warn!(error = %lexical_err, "lexical fetch failed, dense only");
                (dense, Vec::new())
            }
            (Err(dense_err), Err(_)) => {
                return Err(EngineError::Unavailable(format!(
                    "both candidate stages failed: {dense_err}"
                )));
            }
        };

        // Stage 4: reciprocal-rank fusion.
        let dense_ids: Vec<String> = dense.iter().map(|c| c.id.clone()).collect();
        let lexical_ids: Vec<String> = lexical.iter().map(|c| c.id.clone()).collect();
        let fused = reciprocal_rank_fusion(&dense_ids, &lexical_ids, self.config.retrieval.rrf_k);

        let mut kind_by_id: HashMap<&str, RecordKind> = HashMap::new();
        let mut dense_by_id: HashMap<&str, f64> = HashMap::new();
        let mut lexical_by_id: HashMap<&str, f64> = HashMap::new();
        for c in &dense {
            kind_by_id.insert(&c.id, c.kind);
            dense_by_id.insert(&c.id, c.similarity as f64);
        }
        for c in &lexical {
            kind_by_id.insert(&c.id, c.kind);
            lexical_by_id.insert(&c.id, c.score);
        }

        // Stage 5: weighted blend over per-query normalized components.
        let dense_norms = {
            let raw: Vec<f64> = fused
                .iter()
                .map(|f| dense_by_id.get(f.id.as_str()).copied().unwrap_or(0.0))
                .collect();
            normalize_scores(&raw)
        };
        let lexical_norms = {
            let raw: Vec<f64> = fused
                .iter()
                .map(|f| lexical_by_id.get(f.id.as_str()).copied().unwrap_or(0.0))
                .collect();
            normalize_scores(&raw)
        };

        let now = Utc::now();
        let half_life = self.config.retrieval.recency_half_life.as_secs_f64();
        let mut scored: Vec<Scored> = Vec::with_capacity(fused.len());
        for (idx, candidate) in fused.iter().enumerate() {
            let Some(kind) = kind_by_id.get(candidate.id.as_str()).copied() else {
                continue;
            };
            let record = match self.store.get_record(kind, &candidate.id, deadline).await {
                Ok(record) => record,
                // A candidate can vanish between the fetch stages and here.
                Err(EngineError::NotFound(_)) => continue,
                Err(other) => return Err(other),
            };

            let age = (now - record.envelope().created_at).num_seconds().max(0) as f64;
            let recency = recency_boost(age, half_life);
            let dense_score = candidate.dense_rank.map(|_| dense_norms[idx]);
            let lexical_score = candidate.lexical_rank.map(|_| lexical_norms[idx]);
            let stage = match (candidate.dense_rank, candidate.lexical_rank) {
                (Some(_), Some(_)) => MatchStage::Both,
                (Some(_), None) => MatchStage::Dense,
                _ => MatchStage::Lexical,
            };
            let score = options.dense_weight * dense_score.unwrap_or(0.0)
                + options.lexical_weight * lexical_score.unwrap_or(0.0)
                + options.recency_weight * recency;

            scored.push(Scored {
                record,
                score,
                rrf_score: candidate.rrf_score,
                dense_score,
                lexical_score,
                recency,
                stage,
            });
        }

        // Stage 6: structural filters and quality floors.
        scored.retain(|s| self.passes_filters(&s.record, query) && s.score >= options.min_score);

        // Ordering with the documented tie-break chain.
        sort_candidates(&mut scored);

        // Stage 7: optional rerank of the head.
        let mut reranked = false;
        if options.use_rerank {
            if let Some(validator) = &self.validator {
                reranked = self
                    .rerank_head(validator, query, &mut scored, (k * 4).min(64))
                    .await;
            }
        }

        Ok(scored
            .into_iter()
            .take(k)
            .map(|s| Retrieved {
                score: s.score,
                diagnostics: Diagnostics {
                    stage: s.stage,
                    dense_score: s.dense_score,
                    lexical_score: s.lexical_score,
                    rrf_score: s.rrf_score,
                    recency_boost: s.recency,
                    labile: false,
                    degraded,
                    reranked,
                    clamped_k: false,
                },
                record: s.record,
            })
            .collect())
    }

    // ========================================================================
    // STRUCTURAL PATH
    // ========================================================================

    /// Tag/time/kind-only query with no ranking signal: scoped scans ordered
    /// by importance and recency.
    async fn structural(
        &self,
        project_id: &str,
        query: &RetrievalQuery,
        kinds: &[RecordKind],
        k: usize,
        options: &RetrievalOptions,
        deadline: Deadline,
    ) -> Result<Vec<Retrieved>> {
        let fetch_limit = self.config.retrieval.candidate_multiplier * k;
        let now = Utc::now();
        let half_life = self.config.retrieval.recency_half_life.as_secs_f64();

        let mut scored: Vec<Scored> = Vec::new();
        for kind in kinds {
            let filters = ScopeFilters {
                lifecycles: Some(vec![
                    Lifecycle::Active,
                    Lifecycle::Labile,
                    Lifecycle::Consolidated,
                ]),
                tags: query.tags.clone(),
                created_after: query.created_after,
                created_before: query.created_before,
                min_confidence: query.min_confidence,
                limit: Some(fetch_limit),
            };
            for record in self
                .store
                .scope_query(project_id, *kind, filters, deadline)
                .await?
            {
                if let Some(min_quality) = query.min_quality {
                    if record.envelope().evidence_quality < min_quality {
                        continue;
                    }
                }
                let age = (now - record.envelope().created_at).num_seconds().max(0) as f64;
                let recency = recency_boost(age, half_life);
                let score =
                    record.envelope().importance + options.recency_weight * recency;
                scored.push(Scored {
                    record,
                    score,
                    rrf_score: 0.0,
                    dense_score: None,
                    lexical_score: None,
                    recency,
                    stage: MatchStage::Structural,
                });
            }
        }

        scored.retain(|s| s.score >= options.min_score);
        sort_candidates(&mut scored);

        Ok(scored
            .into_iter()
            .take(k)
            .map(|s| Retrieved {
                score: s.score,
                diagnostics: Diagnostics {
                    stage: s.stage,
                    dense_score: None,
                    lexical_score: None,
                    rrf_score: 0.0,
                    recency_boost: s.recency,
                    labile: false,
                    degraded: false,
                    reranked: false,
                    clamped_k: false,
                },
                record: s.record,
            })
            .collect())
    }

    // ========================================================================
    // FILTERS AND RERANK
    // ========================================================================

    fn passes_filters(&self, record: &Record, query: &RetrievalQuery) -> bool {
        let env = record.envelope();
        if !env.lifecycle.is_retrievable() {
            return false;
        }
        if let Some(min) = query.min_confidence {
            if env.confidence < min {
                return false;
            }
        }
        if let Some(min) = query.min_quality {
            if env.evidence_quality < min {
                return false;
            }
        }
        if !query.tags.iter().all(|tag| env.tags.contains(tag)) {
            return false;
        }
        if let Some(after) = query.created_after {
            if env.created_at < after {
                return false;
            }
        }
        if let Some(before) = query.created_before {
            if env.created_at > before {
                return false;
            }
        }
        true
    }

    /// Submit the head of the ranking to the validator. Returns whether the
    /// order was actually replaced. Timeouts and unavailability fall back to
    /// the fused ordering.
    async fn rerank_head(
        &self,
        validator: &Arc<dyn Validator>,
        query: &RetrievalQuery,
        scored: &mut Vec<Scored>,
        head: usize,
    ) -> bool {
        let head = head.min(scored.len());
        if head < 2 {
            return false;
        }
        let Some(text) = query.text.clone() else {
            return false;
        };

        let candidates: Vec<RerankCandidate> = scored[..head]
            .iter()
            .map(|s| RerankCandidate {
                id: s.record.id().to_string(),
                content: s.record.content().unwrap_or_default().to_string(),
                score: s.score,
            })
            .collect();

        let validator = Arc::clone(validator);
        let task = tokio::task::spawn_blocking(move || validator.rerank(&text, &candidates));
        let order = match tokio::time::timeout(self.config.retrieval.rerank_timeout, task).await {
            Ok(Ok(Ok(order))) => order,
            Ok(Ok(Err(err))) => {
                tracing::warn!(error = %err, "rerank unavailable, keeping fused order");
                return false;
            }
            Ok(Err(join_err)) => {
                tracing::warn!(error = %join_err, "rerank task failed, keeping fused order");
                return false;
            }
            Err(_) => {
                tracing::warn!("rerank timed out, keeping fused order");
                return false;
            }
        };

        // Idempotent on ties: returned indices lead in validator order, every
        // index the validator did not mention keeps its original relative
        // position after them.
        let mut slots: Vec<Option<Scored>> =
            scored.drain(..head).map(Some).collect();
        let mut new_head: Vec<Scored> = Vec::with_capacity(head);
        for &idx in order.iter().filter(|&&idx| idx < head) {
            if let Some(item) = slots[idx].take() {
                new_head.push(item);
            }
        }
        new_head.extend(slots.into_iter().flatten());
        for item in new_head.into_iter().rev() {
            scored.insert(0, item);
        }
        true
    }
}

/// Tie-break chain: score, then importance, then recency of last
/// activation, then lexically smaller id.
fn sort_candidates(scored: &mut [Scored]) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.record
                    .envelope()
                    .importance
                    .partial_cmp(&a.record.envelope().importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                b.record
                    .envelope()
                    .last_activation_at
                    .cmp(&a.record.envelope().last_activation_at)
            })
            .then_with(|| a.record.id().cmp(b.record.id()))
    });
}

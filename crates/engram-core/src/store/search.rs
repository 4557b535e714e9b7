//! Candidate fetch stages backing the hybrid retriever
//!
//! Dense candidates come from a scoped cosine scan over stored vectors;
//! lexical candidates come from the per-kind FTS5 tables ranked by BM25.
//! Both stages over-fetch; the retriever fuses, filters, and trims.

use chrono::Utc;
use rusqlite::params;

use crate::embeddings::{cosine_similarity, Embedding};
use crate::error::Result;
use crate::record::{Record, RecordKind};
use crate::substrate::Deadline;

use super::rows::{
    entity_from_row, event_from_row, fact_from_row, pattern_from_row, procedure_from_row,
    relation_from_row, task_from_row, ENTITY_COLS, ENVELOPE_COLS, EVENT_COLS, FACT_COLS,
    PATTERN_COLS, PROCEDURE_COLS, RELATION_COLS, TASK_COLS,
};
use super::RecordStore;

/// One dense-stage candidate.
#[derive(Debug, Clone)]
pub struct DenseCandidate {
    pub id: String,
    pub kind: RecordKind,
    pub similarity: f32,
}

/// One lexical-stage candidate. Higher score is better.
#[derive(Debug, Clone)]
pub struct LexicalCandidate {
    pub id: String,
    pub kind: RecordKind,
    pub score: f64,
}

/// Full SELECT prefix for one kind.
pub(crate) fn select_clause(kind: RecordKind) -> String {
    let cols = match kind {
        RecordKind::Event => EVENT_COLS,
        RecordKind::Fact => FACT_COLS,
        RecordKind::Procedure => PROCEDURE_COLS,
        RecordKind::Task => TASK_COLS,
        RecordKind::Entity => ENTITY_COLS,
        RecordKind::Relation => RELATION_COLS,
        RecordKind::Pattern => PATTERN_COLS,
    };
    format!("SELECT {ENVELOPE_COLS}, {cols} FROM {}", kind.table())
}

pub(crate) fn record_from_row(
    kind: RecordKind,
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Record> {
    Ok(match kind {
        RecordKind::Event => Record::Event(event_from_row(row)?),
        RecordKind::Fact => Record::Fact(fact_from_row(row)?),
        RecordKind::Procedure => Record::Procedure(procedure_from_row(row)?),
        RecordKind::Task => Record::Task(task_from_row(row)?),
        RecordKind::Entity => Record::Entity(entity_from_row(row)?),
        RecordKind::Relation => Record::Relation(relation_from_row(row)?),
        RecordKind::Pattern => Record::Pattern(pattern_from_row(row)?),
    })
}

/// FTS table name for a searchable kind.
fn fts_table(kind: RecordKind) -> Option<&'static str> {
    match kind {
        RecordKind::Event => Some("events_fts"),
        RecordKind::Fact => Some("facts_fts"),
        RecordKind::Pattern => Some("patterns_fts"),
        _ => None,
    }
}

impl RecordStore {
    /// Write an embedding row inside an open transaction.
    pub(crate) fn insert_embedding_in_tx(
        tx: &rusqlite::Transaction<'_>,
        record_id: &str,
        kind: RecordKind,
        project_id: &str,
        vector: &[f32],
    ) -> Result<()> {
        let embedding = Embedding::new(vector.to_vec());
        tx.execute(
            "INSERT OR REPLACE INTO record_embeddings
                 (record_id, kind, project_id, embedding, dimensions, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)",
            params![
                record_id,
                kind.as_str(),
                project_id,
                embedding.to_bytes(),
                embedding.dimensions as i64,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    /// Stored vector for one record, if any.
    pub async fn get_embedding(&self, record_id: &str, deadline: Deadline) -> Result<Option<Vec<f32>>> {
        let id_owned = record_id.to_string();
        self.substrate()
            .with_read(deadline, "get_embedding", move |conn| {
                use rusqlite::OptionalExtension;
                let bytes: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT embedding FROM record_embeddings WHERE record_id = ?1",
                        params![id_owned],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(bytes.and_then(|b| Embedding::from_bytes(&b)).map(|e| e.vector))
            })
            .await
    }

    /// Dense stage: top candidates by cosine similarity over the scoped
    /// vectors. Records without an embedding are skipped here by
    /// construction.
    pub async fn dense_candidates(
        &self,
        project_id: &str,
        kinds: &[RecordKind],
        query: &[f32],
        limit: usize,
        deadline: Deadline,
    ) -> Result<Vec<DenseCandidate>> {
        if kinds.is_empty() || query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let project = project_id.to_string();
        let kind_names: Vec<String> = kinds.iter().map(|k| k.as_str().to_string()).collect();
        let query_vec = query.to_vec();

        self.substrate()
            .with_read(deadline, "dense_candidates", move |conn| {
                use rusqlite::types::Value;
                let placeholders = vec!["?"; kind_names.len()].join(", ");
                let sql = format!(
                    "SELECT record_id, kind, embedding FROM record_embeddings
                     WHERE project_id = ? AND kind IN ({placeholders})"
                );
                let mut params_vec: Vec<Value> = vec![Value::Text(project.clone())];
                params_vec.extend(kind_names.iter().map(|k| Value::Text(k.clone())));

                let mut stmt = conn.prepare(&sql)?;
                let mut candidates: Vec<DenseCandidate> = stmt
                    .query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?
                    .into_iter()
                    .filter_map(|(id, kind_raw, bytes)| {
                        let kind = RecordKind::parse_name(&kind_raw)?;
                        let embedding = Embedding::from_bytes(&bytes)?;
                        let similarity = cosine_similarity(&query_vec, &embedding.vector);
                        Some(DenseCandidate {
                            id,
                            kind,
                            similarity,
                        })
                    })
                    .collect();

                candidates.sort_by(|a, b| {
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
                candidates.truncate(limit);
                Ok(candidates)
            })
            .await
    }

    /// Lexical stage: top candidates by BM25 across the searchable kinds.
    /// `match_expr` must already be FTS5-sanitized.
    pub async fn lexical_candidates(
        &self,
        project_id: &str,
        kinds: &[RecordKind],
        match_expr: &str,
        limit: usize,
        deadline: Deadline,
    ) -> Result<Vec<LexicalCandidate>> {
        if match_expr.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let project = project_id.to_string();
        let kinds_owned: Vec<RecordKind> = kinds.to_vec();
        let expr = match_expr.to_string();

        self.substrate()
            .with_read(deadline, "lexical_candidates", move |conn| {
                let mut merged: Vec<LexicalCandidate> = Vec::new();
                for kind in &kinds_owned {
                    let Some(fts) = fts_table(*kind) else {
                        continue;
                    };
                    let table = kind.table();
                    let sql = format!(
                        "SELECT t.id, bm25({fts}) FROM {fts}
                         JOIN {table} t ON t.id = {fts}.id
                         WHERE {fts} MATCH ?1 AND t.project_id = ?2
                         ORDER BY bm25({fts}) LIMIT ?3"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let rows = stmt.query_map(
                        params![expr, project, limit as i64],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
                    );
                    // A degenerate MATCH expression is a caller-input problem,
                    // not a substrate fault; treat it as zero lexical hits.
                    let rows = match rows {
                        Ok(rows) => rows.collect::<rusqlite::Result<Vec<_>>>()?,
                        Err(err) => {
                            tracing::debug!(error = %err, "fts match failed, skipping kind");
                            continue;
                        }
                    };
                    merged.extend(rows.into_iter().map(|(id, bm25)| LexicalCandidate {
                        id,
                        kind: *kind,
                        // bm25() is smaller-is-better; negate for a
                        // higher-is-better score.
                        score: -bm25,
                    }));
                }

                merged.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
                merged.truncate(limit);
                Ok(merged)
            })
            .await
    }
}

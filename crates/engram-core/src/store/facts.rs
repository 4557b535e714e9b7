//! Fact CRUD

use rusqlite::params;

use crate::error::{EngineError, Result};
use crate::record::{derive_evidence_quality, Fact, FactInput, RecordKind};
use crate::substrate::Deadline;

use super::rows::{fact_from_row, json_column, ENVELOPE_COLS, FACT_COLS};
use super::RecordStore;

impl RecordStore {
    /// Insert a fact, embedding its content when possible.
    pub async fn insert_fact(&self, input: FactInput, deadline: Deadline) -> Result<Fact> {
        let (mut fact, mut embedding) = input.into_fact()?;

        if embedding.is_none() {
            if let Some(embedder) = self.embedder() {
                match embedder.embed(&fact.content) {
                    Ok(vector) => embedding = Some(vector),
                    Err(err) => {
                        tracing::warn!(error = %err, id = %fact.envelope.id,
                            "embedder unavailable, fact stored without embedding");
                    }
                }
            }
        }
        fact.has_embedding = embedding.is_some();
        fact.envelope.evidence_quality =
            derive_evidence_quality(fact.envelope.evidence_type, 0, None, false);

        let stored = fact.clone();
        let dims = self.config().embedding_dimensions;
        let result = self
            .substrate()
            .transaction(deadline, "insert_fact", move |tx| {
                Self::ensure_project(tx, &stored.envelope.project_id)?;
                let env = &stored.envelope;
                tx.execute(
                    "INSERT INTO facts (
                        id, project_id, created_at, updated_at, valid_from, valid_to,
                        lifecycle, confidence, evidence_type, evidence_quality, source_id,
                        activation_count, last_activation_at, importance, tags,
                        labile_until, window_dirty, version,
                        content, memory_type, usefulness, has_embedding
                    ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, ?11,
                              ?12, NULL, 0, 1, ?13, ?14, 0.0, ?15)",
                    params![
                        env.id,
                        env.project_id,
                        env.created_at,
                        env.valid_from,
                        env.valid_to,
                        env.lifecycle.as_str(),
                        env.confidence,
                        env.evidence_type.as_str(),
                        env.evidence_quality,
                        env.source_id,
                        env.importance,
                        json_column(&env.tags, "[]"),
                        stored.content,
                        stored.memory_type.as_str(),
                        stored.has_embedding as i64,
                    ],
                )?;
                if let Some(vector) = &embedding {
                    if vector.len() != dims {
                        return Err(EngineError::Validation(format!(
                            "embedding has {} dimensions, store expects {dims}",
                            vector.len()
                        )));
                    }
                    Self::insert_embedding_in_tx(
                        tx,
                        &env.id,
                        RecordKind::Fact,
                        &env.project_id,
                        vector,
                    )?;
                }
                Ok(())
            })
            .await;

        match &result {
            Ok(_) => {
                self.audit()
                    .success("insert_fact", &[fact.envelope.id.clone()])
                    .await
            }
            Err(err) => {
                self.audit()
                    .failure("insert_fact", &[fact.envelope.id.clone()], err.tag())
                    .await
            }
        }
        result?;
        Ok(fact)
    }

    pub async fn get_fact(&self, id: &str, deadline: Deadline) -> Result<Fact> {
        let id_owned = id.to_string();
        self.substrate()
            .with_read(deadline, "get_fact", move |conn| {
                conn.query_row(
                    &format!("SELECT {ENVELOPE_COLS}, {FACT_COLS} FROM facts WHERE id = ?1"),
                    params![id_owned],
                    fact_from_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(id_owned.clone()),
                    other => other.into(),
                })
            })
            .await
    }

    /// Feedback loop: fold one usefulness observation into the fact's score.
    pub async fn record_fact_usefulness(
        &self,
        id: &str,
        useful: bool,
        deadline: Deadline,
    ) -> Result<Fact> {
        const ALPHA: f64 = 0.3;
        let id_owned = id.to_string();
        self.substrate()
            .transaction(deadline, "fact_usefulness", move |tx| {
                let current: f64 = tx
                    .query_row(
                        "SELECT usefulness FROM facts WHERE id = ?1",
                        params![id_owned],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => {
                            EngineError::NotFound(id_owned.clone())
                        }
                        other => other.into(),
                    })?;
                let observation = if useful { 1.0 } else { 0.0 };
                let updated = ALPHA * observation + (1.0 - ALPHA) * current;
                tx.execute(
                    "UPDATE facts SET usefulness = ?1, updated_at = ?2 WHERE id = ?3",
                    params![updated, chrono::Utc::now(), id_owned],
                )?;
                Ok(())
            })
            .await?;
        self.get_fact(id, deadline).await
    }

    /// Active facts and patterns with embeddings, for assertion-contradiction
    /// sweeps.
    pub async fn active_facts(&self, project_id: &str, deadline: Deadline) -> Result<Vec<Fact>> {
        let project = project_id.to_string();
        self.substrate()
            .with_read(deadline, "active_facts", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENVELOPE_COLS}, {FACT_COLS} FROM facts
                     WHERE project_id = ?1 AND lifecycle = 'active'
                     ORDER BY created_at, id"
                ))?;
                let facts = stmt
                    .query_map(params![project], fact_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(facts)
            })
            .await
    }
}

//! Event CRUD and the consolidation cohort query

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::error::{EngineError, Result};
use crate::record::{derive_evidence_quality, Event, EventInput, RecordKind};
use crate::substrate::Deadline;

use super::rows::{event_from_row, json_column, ENVELOPE_COLS, EVENT_COLS};
use super::RecordStore;

impl RecordStore {
    /// Insert an event. When the input carries no embedding and an embedder
    /// is configured, the content is embedded inline; embedder failure leaves
    /// the row flagged as needing an embedding rather than failing the write.
    pub async fn insert_event(&self, input: EventInput, deadline: Deadline) -> Result<Event> {
        let (mut event, mut embedding) = input.into_event()?;

        if embedding.is_none() {
            if let Some(embedder) = self.embedder() {
                match embedder.embed(&event.content) {
                    Ok(vector) => embedding = Some(vector),
                    Err(err) => {
                        tracing::warn!(error = %err, id = %event.envelope.id,
                            "embedder unavailable, event stored without embedding");
                    }
                }
            }
        }
        event.has_embedding = embedding.is_some();
        event.envelope.evidence_quality = derive_evidence_quality(
            event.envelope.evidence_type,
            0,
            Some(event.outcome),
            false,
        );

        let stored = event.clone();
        let dims = self.config().embedding_dimensions;
        let result = self
            .substrate()
            .transaction(deadline, "insert_event", move |tx| {
                Self::ensure_project(tx, &stored.envelope.project_id)?;
                let env = &stored.envelope;
                tx.execute(
                    "INSERT INTO events (
                        id, project_id, created_at, updated_at, valid_from, valid_to,
                        lifecycle, confidence, evidence_type, evidence_quality, source_id,
                        activation_count, last_activation_at, importance, tags,
                        labile_until, window_dirty, version,
                        session_id, event_type, content, outcome, context, code_context,
                        has_embedding
                    ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, ?11,
                              ?12, NULL, 0, 1, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
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
                        stored.session_id,
                        stored.event_type,
                        stored.content,
                        stored.outcome.as_str(),
                        json_column(&stored.context, "{}"),
                        stored.code.as_ref().map(|c| json_column(c, "{}")),
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
                        RecordKind::Event,
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
                    .success("insert_event", &[event.envelope.id.clone()])
                    .await
            }
            Err(err) => {
                self.audit()
                    .failure("insert_event", &[event.envelope.id.clone()], err.tag())
                    .await
            }
        }
        result?;
        Ok(event)
    }

    pub async fn get_event(&self, id: &str, deadline: Deadline) -> Result<Event> {
        let id_owned = id.to_string();
        self.substrate()
            .with_read(deadline, "get_event", move |conn| {
                conn.query_row(
                    &format!("SELECT {ENVELOPE_COLS}, {EVENT_COLS} FROM events WHERE id = ?1"),
                    params![id_owned],
                    event_from_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(id_owned.clone()),
                    other => other.into(),
                })
            })
            .await
    }

    /// The consolidation cohort: active events in the lookback window,
    /// ordered by transaction time so clustering is deterministic.
    pub async fn consolidation_cohort(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<Vec<Event>> {
        let project = project_id.to_string();
        self.substrate()
            .with_read(deadline, "consolidation_cohort", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENVELOPE_COLS}, {EVENT_COLS} FROM events
                     WHERE project_id = ?1 AND lifecycle = 'active' AND created_at >= ?2
                     ORDER BY created_at, id"
                ))?;
                let events = stmt
                    .query_map(params![project, since], event_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(events)
            })
            .await
    }

    /// Events sharing a normalized context key, for outcome-contradiction
    /// detection. Only active records participate.
    pub async fn active_events(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<Vec<Event>> {
        let project = project_id.to_string();
        self.substrate()
            .with_read(deadline, "active_events", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENVELOPE_COLS}, {EVENT_COLS} FROM events
                     WHERE project_id = ?1 AND lifecycle = 'active'
                     ORDER BY created_at, id"
                ))?;
                let events = stmt
                    .query_map(params![project], event_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(events)
            })
            .await
    }
}

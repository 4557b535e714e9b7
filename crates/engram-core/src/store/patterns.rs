//! Pattern CRUD and provenance upkeep
//!
//! Patterns are emitted by the consolidator inside per-cluster transactions,
//! so the insert body is transaction-scoped. The pattern is the only owner of
//! its source-id list; events learn about their patterns through the reverse
//! scan used here for provenance notes.

use chrono::Utc;
use rusqlite::params;

use crate::error::{EngineError, Result};
use crate::record::{Pattern, ProvenanceNote};
use crate::substrate::Deadline;

use super::rows::{json_column, pattern_from_row, ENVELOPE_COLS, PATTERN_COLS};
use super::RecordStore;

impl RecordStore {
    pub async fn get_pattern(&self, id: &str, deadline: Deadline) -> Result<Pattern> {
        let id_owned = id.to_string();
        self.substrate()
            .with_read(deadline, "get_pattern", move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {ENVELOPE_COLS}, {PATTERN_COLS} FROM patterns WHERE id = ?1"
                    ),
                    params![id_owned],
                    pattern_from_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(id_owned.clone()),
                    other => other.into(),
                })
            })
            .await
    }

    /// Patterns of a project in retrievable states, for the contradiction
    /// sweep and the quality tracker.
    pub async fn active_patterns(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<Vec<Pattern>> {
        let project = project_id.to_string();
        self.substrate()
            .with_read(deadline, "active_patterns", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENVELOPE_COLS}, {PATTERN_COLS} FROM patterns
                     WHERE project_id = ?1 AND lifecycle = 'active'
                     ORDER BY created_at, id"
                ))?;
                let patterns = stmt
                    .query_map(params![project], pattern_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(patterns)
            })
            .await
    }

    /// Whether a pattern with this id already exists (consolidation
    /// idempotence check).
    pub async fn pattern_exists(&self, id: &str, deadline: Deadline) -> Result<bool> {
        let id_owned = id.to_string();
        self.substrate()
            .with_read(deadline, "pattern_exists", move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM patterns WHERE id = ?1",
                    params![id_owned],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }
}

/// Insert body used inside the consolidator's cluster transaction. The id is
/// caller-assigned (derived from the cluster signature) so reruns collide
/// instead of duplicating.
pub(crate) fn insert_pattern_in_tx(
    tx: &rusqlite::Transaction<'_>,
    pattern: &Pattern,
) -> Result<()> {
    let env = &pattern.envelope;
    tx.execute(
        "INSERT INTO patterns (
            id, project_id, created_at, updated_at, valid_from, valid_to,
            lifecycle, confidence, evidence_type, evidence_quality, source_id,
            activation_count, last_activation_at, importance, tags,
            labile_until, window_dirty, version,
            pattern_type, content, source_event_ids, support,
            confidence_before_validation, confidence_after_validation,
            provenance, has_embedding
        ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, ?11,
                  ?12, NULL, 0, 1, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
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
            pattern.pattern_type.as_str(),
            pattern.content,
            json_column(&pattern.source_event_ids, "[]"),
            pattern.support,
            pattern.confidence_before_validation,
            pattern.confidence_after_validation,
            json_column(&pattern.provenance, "[]"),
            pattern.has_embedding as i64,
        ],
    )?;
    Ok(())
}

/// Append a provenance note on every pattern referencing the event. Runs
/// inside the caller's transaction so the note lands with the lifecycle
/// change that caused it.
pub(crate) fn append_provenance_for_event(
    tx: &rusqlite::Transaction<'_>,
    event_id: &str,
    note: &str,
) -> Result<()> {
    let needle = format!("%\"{}\"%", event_id.replace('"', ""));
    let mut stmt = tx.prepare(
        "SELECT id, provenance FROM patterns WHERE source_event_ids LIKE ?1",
    )?;
    let touched: Vec<(String, String)> = stmt
        .query_map(params![needle], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    for (pattern_id, provenance_raw) in touched {
        let mut provenance: Vec<ProvenanceNote> =
            serde_json::from_str(&provenance_raw).unwrap_or_default();
        provenance.push(ProvenanceNote {
            event_id: event_id.to_string(),
            note: note.to_string(),
            recorded_at: Utc::now(),
        });
        tx.execute(
            "UPDATE patterns SET provenance = ?1, updated_at = ?2 WHERE id = ?3",
            params![json_column(&provenance, "[]"), Utc::now(), pattern_id],
        )?;
    }
    Ok(())
}

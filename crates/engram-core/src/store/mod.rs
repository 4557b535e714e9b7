//! RecordStore - the only component that mutates rows
//!
//! One typed CRUD surface per record kind plus a uniform lifecycle API.
//! Lifecycle changes go through `transition`, which enforces the DAG;
//! `update` covers mutable fields and gates the reconsolidation trio
//! (content, confidence, tags) on the labile state. Hard deletes exist only
//! for archived records past the retention horizon.

pub(crate) mod rows;

mod events;
mod facts;
mod graph;
pub(crate) mod patterns;
pub(crate) mod procedures;
mod search;
mod tasks;

pub use search::{DenseCandidate, LexicalCandidate};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::params;

use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::embeddings::Embedder;
use crate::error::{EngineError, Result};
use crate::record::{Lifecycle, Record, RecordKind};
use crate::substrate::{Deadline, Substrate};

use rows::json_column;

// ============================================================================
// FILTERS AND PATCHES
// ============================================================================

/// Structural filters for `scope_query`.
#[derive(Debug, Clone, Default)]
pub struct ScopeFilters {
    /// Keep only these lifecycle states; `None` keeps everything
    pub lifecycles: Option<Vec<Lifecycle>>,
    /// Every listed tag must be present
    pub tags: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_confidence: Option<f64>,
    pub limit: Option<usize>,
}

/// Mutable-field patch for `update`.
///
/// Lifecycle changes must use `transition` instead. The reconsolidation trio
/// (`content`, `confidence`, `tags`) is only writable while the record is
/// labile.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub content: Option<String>,
    pub confidence: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub importance: Option<f64>,
    pub valid_from: Option<Option<DateTime<Utc>>>,
    pub valid_to: Option<Option<DateTime<Utc>>>,
}

impl RecordPatch {
    fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.confidence.is_none()
            && self.tags.is_none()
            && self.importance.is_none()
            && self.valid_from.is_none()
            && self.valid_to.is_none()
    }

    /// Whether the patch touches the labile-gated trio.
    fn touches_reconsolidation_fields(&self) -> bool {
        self.content.is_some() || self.confidence.is_some() || self.tags.is_some()
    }
}

// ============================================================================
// RECORD STORE
// ============================================================================

/// Typed CRUD and lifecycle surface over the substrate.
pub struct RecordStore {
    substrate: Arc<Substrate>,
    embedder: Option<Arc<dyn Embedder>>,
    audit: Arc<AuditLog>,
    config: Arc<EngineConfig>,
}

impl RecordStore {
    pub fn new(
        substrate: Arc<Substrate>,
        embedder: Option<Arc<dyn Embedder>>,
        audit: Arc<AuditLog>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            substrate,
            embedder,
            audit,
            config,
        }
    }

    pub fn substrate(&self) -> &Arc<Substrate> {
        &self.substrate
    }

    pub(crate) fn embedder(&self) -> Option<&Arc<dyn Embedder>> {
        self.embedder.as_ref()
    }

    pub(crate) fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Insert-or-ignore the project row inside an open transaction.
    pub(crate) fn ensure_project(
        tx: &rusqlite::Transaction<'_>,
        project_id: &str,
    ) -> Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO projects (id, name, created_at) VALUES (?1, ?1, ?2)",
            params![project_id, Utc::now()],
        )?;
        Ok(())
    }

    /// Stamp foreground activity on the project row.
    pub async fn touch_activity(&self, project_id: &str, deadline: Deadline) -> Result<()> {
        let project = project_id.to_string();
        self.substrate
            .with_write(deadline, "touch_activity", move |conn| {
                conn.execute(
                    "INSERT INTO projects (id, name, created_at, last_activity_at)
                     VALUES (?1, ?1, ?2, ?2)
                     ON CONFLICT(id) DO UPDATE SET last_activity_at = ?2",
                    params![project, Utc::now()],
                )?;
                Ok(())
            })
            .await
    }

    // ========================================================================
    // GENERIC READ
    // ========================================================================

    /// Fetch one record of a known kind.
    pub async fn get_record(
        &self,
        kind: RecordKind,
        id: &str,
        deadline: Deadline,
    ) -> Result<Record> {
        match kind {
            RecordKind::Event => self.get_event(id, deadline).await.map(Record::Event),
            RecordKind::Fact => self.get_fact(id, deadline).await.map(Record::Fact),
            RecordKind::Procedure => self
                .get_procedure(id, deadline)
                .await
                .map(Record::Procedure),
            RecordKind::Task => self.get_task(id, deadline).await.map(Record::Task),
            RecordKind::Entity => self.get_entity(id, deadline).await.map(Record::Entity),
            RecordKind::Relation => self.get_relation(id, deadline).await.map(Record::Relation),
            RecordKind::Pattern => self.get_pattern(id, deadline).await.map(Record::Pattern),
        }
    }

    /// Non-restartable scoped scan of one kind, filters applied in SQL.
    pub async fn scope_query(
        &self,
        project_id: &str,
        kind: RecordKind,
        filters: ScopeFilters,
        deadline: Deadline,
    ) -> Result<Vec<Record>> {
        use rusqlite::types::Value;

        let select = search::select_clause(kind);
        let mut sql = format!("{select} WHERE project_id = ?");
        let mut params_vec: Vec<Value> = vec![Value::Text(project_id.to_string())];

        if let Some(states) = &filters.lifecycles {
            if states.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; states.len()].join(", ");
            sql.push_str(&format!(" AND lifecycle IN ({placeholders})"));
            for state in states {
                params_vec.push(Value::Text(state.as_str().to_string()));
            }
        }
        if let Some(min) = filters.min_confidence {
            sql.push_str(" AND confidence >= ?");
            params_vec.push(Value::Real(min));
        }
        if let Some(after) = filters.created_after {
            sql.push_str(" AND created_at >= ?");
            params_vec.push(Value::Text(after.to_rfc3339()));
        }
        if let Some(before) = filters.created_before {
            sql.push_str(" AND created_at <= ?");
            params_vec.push(Value::Text(before.to_rfc3339()));
        }
        for tag in &filters.tags {
            sql.push_str(" AND tags LIKE ?");
            params_vec.push(Value::Text(format!("%\"{}\"%", tag.replace('"', ""))));
        }
        sql.push_str(" ORDER BY created_at, id");
        if let Some(limit) = filters.limit {
            sql.push_str(" LIMIT ?");
            params_vec.push(Value::Integer(limit as i64));
        }

        self.substrate
            .with_read(deadline, "scope_query", move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
                        search::record_from_row(kind, row)
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Enforce the lifecycle DAG and apply the transition.
    ///
    /// `labile → active` bumps `version` iff the record was rewritten inside
    /// the window. Archiving an event records a provenance note on every
    /// pattern that references it.
    pub async fn transition(
        &self,
        kind: RecordKind,
        id: &str,
        new_state: Lifecycle,
        reason: &str,
        deadline: Deadline,
    ) -> Result<Record> {
        let id_owned = id.to_string();
        let reason_owned = reason.to_string();
        let window = self.config.reconsolidation_window;

        let result = self
            .substrate
            .transaction(deadline, "transition", move |tx| {
                transition_in_tx(tx, kind, &id_owned, new_state, &reason_owned, window)
            })
            .await;

        match &result {
            Ok(_) => {
                self.audit
                    .success("transition", &[id.to_string()])
                    .await;
                tracing::debug!(kind = %kind, id, to = %new_state, reason, "lifecycle transition");
            }
            Err(err) => {
                self.audit
                    .failure("transition", &[id.to_string()], err.tag())
                    .await;
            }
        }

        match result {
            Ok(()) => self.get_record(kind, id, deadline).await,
            Err(err) => Err(err),
        }
    }

    /// Transition the loser of a contradiction to `superseded`, pointing its
    /// `source_id` at the winner.
    pub async fn supersede(
        &self,
        kind: RecordKind,
        loser_id: &str,
        winner_id: &str,
        reason: &str,
        deadline: Deadline,
    ) -> Result<()> {
        let loser = loser_id.to_string();
        let winner = winner_id.to_string();
        let reason_owned = reason.to_string();
        let window = self.config.reconsolidation_window;

        let result = self
            .substrate
            .transaction(deadline, "supersede", move |tx| {
                transition_in_tx(tx, kind, &loser, Lifecycle::Superseded, &reason_owned, window)?;
                tx.execute(
                    &format!("UPDATE {} SET source_id = ?1 WHERE id = ?2", kind.table()),
                    params![winner, loser],
                )?;
                Ok(())
            })
            .await;

        match &result {
            Ok(_) => {
                self.audit
                    .success("supersede", &[loser_id.to_string(), winner_id.to_string()])
                    .await
            }
            Err(err) => {
                self.audit
                    .failure("supersede", &[loser_id.to_string()], err.tag())
                    .await
            }
        }
        result
    }

    /// Count a retrieval hit: bump activation counters, recompute evidence
    /// quality, and open a reconsolidation window when the record is active.
    ///
    /// Returns `true` when a window was opened.
    pub async fn activate(
        &self,
        kind: RecordKind,
        id: &str,
        deadline: Deadline,
    ) -> Result<bool> {
        let id_owned = id.to_string();
        let window = self.config.reconsolidation_window;

        self.substrate
            .transaction(deadline, "activate", move |tx| {
                activate_in_tx(tx, kind, &id_owned, window)
            })
            .await
    }

    /// Update mutable fields under optimistic concurrency.
    ///
    /// The reconsolidation trio (content, confidence, tags) is only writable
    /// while the record is labile; such writes mark the window dirty so the
    /// close bumps `version`.
    pub async fn update(
        &self,
        kind: RecordKind,
        id: &str,
        patch: RecordPatch,
        deadline: Deadline,
    ) -> Result<Record> {
        if patch.is_empty() {
            return self.get_record(kind, id, deadline).await;
        }
        if patch.content.is_some()
            && !matches!(
                kind,
                RecordKind::Event | RecordKind::Fact | RecordKind::Pattern | RecordKind::Task
            )
        {
            return Err(EngineError::Invariant(format!(
                "{kind} records carry no content field"
            )));
        }
        if let Some(confidence) = patch.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(EngineError::Validation(format!(
                    "confidence {confidence} outside [0, 1]"
                )));
            }
        }
        if let Some(importance) = patch.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(EngineError::Validation(format!(
                    "importance {importance} outside [0, 1]"
                )));
            }
        }

        let id_owned = id.to_string();
        let table = kind.table();
        let result = self
            .substrate
            .transaction(deadline, "update", move |tx| {
                // The raw stored stamp is the optimistic token; bound back
                // verbatim so formatting never defeats the comparison.
                let (lifecycle, updated_at): (String, String) = tx
                    .query_row(
                        &format!("SELECT lifecycle, updated_at FROM {table} WHERE id = ?1"),
                        params![id_owned],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => {
                            EngineError::NotFound(id_owned.clone())
                        }
                        other => other.into(),
                    })?;
                let lifecycle = Lifecycle::parse_name(&lifecycle).ok_or_else(|| {
                    EngineError::Invariant(format!("corrupt lifecycle on {id_owned}"))
                })?;

                if patch.touches_reconsolidation_fields() && lifecycle != Lifecycle::Labile {
                    return Err(EngineError::Invariant(format!(
                        "record {id_owned} is {lifecycle}, not labile; content, confidence, \
                         and tags only change inside a reconsolidation window"
                    )));
                }

                use rusqlite::types::Value;
                let mut sets: Vec<&str> = vec!["updated_at = ?"];
                let mut values: Vec<Value> = vec![Value::Text(Utc::now().to_rfc3339())];

                if let Some(content) = &patch.content {
                    sets.push("content = ?");
                    values.push(Value::Text(content.clone()));
                }
                if let Some(confidence) = patch.confidence {
                    sets.push("confidence = ?");
                    values.push(Value::Real(confidence));
                }
                if let Some(tags) = &patch.tags {
                    sets.push("tags = ?");
                    values.push(Value::Text(json_column(tags, "[]")));
                }
                if let Some(importance) = patch.importance {
                    sets.push("importance = ?");
                    values.push(Value::Real(importance));
                }
                if let Some(valid_from) = patch.valid_from {
                    sets.push("valid_from = ?");
                    values.push(match valid_from {
                        Some(dt) => Value::Text(dt.to_rfc3339()),
                        None => Value::Null,
                    });
                }
                if let Some(valid_to) = patch.valid_to {
                    sets.push("valid_to = ?");
                    values.push(match valid_to {
                        Some(dt) => Value::Text(dt.to_rfc3339()),
                        None => Value::Null,
                    });
                }
                if patch.touches_reconsolidation_fields() {
                    sets.push("window_dirty = 1");
                }

                values.push(Value::Text(id_owned.clone()));
                values.push(Value::Text(updated_at.clone()));
                let sql = format!(
                    "UPDATE {table} SET {} WHERE id = ? AND updated_at = ?",
                    sets.join(", ")
                );
                let changed =
                    tx.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
                if changed == 0 {
                    return Err(EngineError::Conflict(format!(
                        "record {id_owned} changed since read"
                    )));
                }
                Ok(())
            })
            .await;

        match &result {
            Ok(_) => self.audit.success("update", &[id.to_string()]).await,
            Err(err) => {
                self.audit
                    .failure("update", &[id.to_string()], err.tag())
                    .await
            }
        }
        result?;
        self.get_record(kind, id, deadline).await
    }

    /// Close every expired reconsolidation window, optionally scoped to one
    /// project. Returns the number of records returned to `active`.
    pub async fn close_expired_windows(
        &self,
        project_id: Option<&str>,
        deadline: Deadline,
    ) -> Result<u64> {
        let project = project_id.map(|p| p.to_string());
        self.substrate
            .transaction(deadline, "close_windows", move |tx| {
                let now = Utc::now();
                let mut closed = 0u64;
                for kind in RecordKind::ALL {
                    let table = kind.table();
                    let sql = match &project {
                        Some(_) => format!(
                            "UPDATE {table} SET lifecycle = 'active',
                                 version = version + window_dirty,
                                 window_dirty = 0, labile_until = NULL
                             WHERE lifecycle = 'labile' AND labile_until <= ?1
                               AND project_id = ?2"
                        ),
                        None => format!(
                            "UPDATE {table} SET lifecycle = 'active',
                                 version = version + window_dirty,
                                 window_dirty = 0, labile_until = NULL
                             WHERE lifecycle = 'labile' AND labile_until <= ?1"
                        ),
                    };
                    closed += match &project {
                        Some(p) => tx.execute(&sql, params![now, p])?,
                        None => tx.execute(&sql, params![now])?,
                    } as u64;
                }
                Ok(closed)
            })
            .await
    }

    // ========================================================================
    // WORKING SET
    // ========================================================================

    /// Mark a fact or pattern as currently attended, evicting the weakest
    /// entries above the cap. Returns the evicted record ids.
    pub async fn attend(
        &self,
        project_id: &str,
        kind: RecordKind,
        id: &str,
        deadline: Deadline,
    ) -> Result<Vec<String>> {
        if !matches!(kind, RecordKind::Fact | RecordKind::Pattern) {
            return Err(EngineError::Invariant(format!(
                "only facts and patterns join the working set, not {kind}"
            )));
        }
        let cap = self.config.working_set_cap;
        let half_life = self.config.retrieval.recency_half_life.as_secs_f64();
        let project = project_id.to_string();
        let id_owned = id.to_string();

        self.substrate
            .transaction(deadline, "attend", move |tx| {
                let now = Utc::now();
                tx.execute(
                    "INSERT INTO working_set (project_id, record_id, kind, attended_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(project_id, record_id) DO UPDATE SET attended_at = ?4",
                    params![project, id_owned, kind.as_str(), now],
                )?;

                // Weight every attended entry and evict the weakest past cap.
                let mut stmt = tx.prepare(
                    "SELECT w.record_id, w.kind, w.attended_at,
                            COALESCE(f.importance, p.importance, 0.0)
                     FROM working_set w
                     LEFT JOIN facts f ON w.kind = 'fact' AND f.id = w.record_id
                     LEFT JOIN patterns p ON w.kind = 'pattern' AND p.id = w.record_id
                     WHERE w.project_id = ?1",
                )?;
                let mut entries: Vec<(String, f64)> = stmt
                    .query_map(params![project], |row| {
                        let record_id: String = row.get(0)?;
                        let attended_at: DateTime<Utc> = row.get(2)?;
                        let importance: f64 = row.get(3)?;
                        Ok((record_id, attended_at, importance))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?
                    .into_iter()
                    .map(|(record_id, attended_at, importance)| {
                        let age = (now - attended_at).num_seconds().max(0) as f64;
                        let recency_weight = (-age / half_life.max(1.0)).exp();
                        (record_id, importance * recency_weight)
                    })
                    .collect();
                drop(stmt);

                let mut evicted = Vec::new();
                if entries.len() > cap {
                    entries.sort_by(|a, b| {
                        a.1.partial_cmp(&b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(&b.0))
                    });
                    for (record_id, _) in entries.iter().take(entries.len() - cap) {
                        tx.execute(
                            "DELETE FROM working_set WHERE project_id = ?1 AND record_id = ?2",
                            params![project, record_id],
                        )?;
                        evicted.push(record_id.clone());
                    }
                }
                Ok(evicted)
            })
            .await
    }

    /// Number of currently attended records in a project.
    pub async fn attended_count(&self, project_id: &str, deadline: Deadline) -> Result<usize> {
        let project = project_id.to_string();
        self.substrate
            .with_read(deadline, "attended_count", move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM working_set WHERE project_id = ?1",
                    params![project],
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            })
            .await
    }

    // ========================================================================
    // COUNTERS AND POLICY SWEEPS
    // ========================================================================

    /// Lifecycle histogram for one kind in a project.
    pub async fn counts_by_lifecycle(
        &self,
        project_id: &str,
        kind: RecordKind,
        deadline: Deadline,
    ) -> Result<BTreeMap<String, i64>> {
        let project = project_id.to_string();
        let table = kind.table();
        self.substrate
            .with_read(deadline, "counts_by_lifecycle", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT lifecycle, COUNT(*) FROM {table} WHERE project_id = ?1 GROUP BY lifecycle"
                ))?;
                let counts = stmt
                    .query_map(params![project], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
                Ok(counts)
            })
            .await
    }

    /// Active (not yet consolidated) event count, the scheduler's trigger
    /// input.
    pub async fn count_unconsolidated_events(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<u64> {
        let project = project_id.to_string();
        self.substrate
            .with_read(deadline, "count_unconsolidated", move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM events
                     WHERE project_id = ?1 AND lifecycle IN ('active', 'labile')",
                    params![project],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
    }

    /// All project ids with their last activity and last consolidation
    /// stamps, for the scheduler.
    pub async fn project_activity(
        &self,
        deadline: Deadline,
    ) -> Result<Vec<(String, Option<DateTime<Utc>>, Option<DateTime<Utc>>)>> {
        self.substrate
            .with_read(deadline, "project_activity", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, last_activity_at, last_consolidated_at FROM projects",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<DateTime<Utc>>>(1)?,
                            row.get::<_, Option<DateTime<Utc>>>(2)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete a project and every record it owns, in one transaction.
    pub async fn delete_project(&self, project_id: &str, deadline: Deadline) -> Result<()> {
        let project = project_id.to_string();
        let result = self
            .substrate
            .transaction(deadline, "delete_project", move |tx| {
                for kind in RecordKind::ALL {
                    tx.execute(
                        &format!("DELETE FROM {} WHERE project_id = ?1", kind.table()),
                        params![project],
                    )?;
                }
                tx.execute(
                    "DELETE FROM record_embeddings WHERE project_id = ?1",
                    params![project],
                )?;
                tx.execute(
                    "DELETE FROM working_set WHERE project_id = ?1",
                    params![project],
                )?;
                tx.execute("DELETE FROM projects WHERE id = ?1", params![project])?;
                Ok(())
            })
            .await;

        match &result {
            Ok(_) => {
                self.audit
                    .success("delete_project", &[project_id.to_string()])
                    .await
            }
            Err(err) => {
                self.audit
                    .failure("delete_project", &[project_id.to_string()], err.tag())
                    .await
            }
        }
        result
    }

    /// Hard-delete archived records older than the retention horizon. All
    /// other removals are lifecycle transitions.
    pub async fn purge_archived(&self, deadline: Deadline) -> Result<u64> {
        let horizon = ChronoDuration::from_std(self.config.retention_horizon)
            .unwrap_or_else(|_| ChronoDuration::days(30));
        let cutoff = Utc::now() - horizon;

        self.substrate
            .transaction(deadline, "purge_archived", move |tx| {
                let mut purged = 0u64;
                for kind in RecordKind::ALL {
                    let table = kind.table();
                    tx.execute(
                        &format!(
                            "DELETE FROM record_embeddings WHERE record_id IN (
                                 SELECT id FROM {table}
                                 WHERE lifecycle = 'archived' AND updated_at < ?1)"
                        ),
                        params![cutoff],
                    )?;
                    purged += tx.execute(
                        &format!(
                            "DELETE FROM {table} WHERE lifecycle = 'archived' AND updated_at < ?1"
                        ),
                        params![cutoff],
                    )? as u64;
                }
                Ok(purged)
            })
            .await
    }
}

// ============================================================================
// TRANSACTION-SCOPED HELPERS
// ============================================================================

/// Shared transition body, reused by `transition`, `supersede`, and the
/// consolidator's cluster transactions.
pub(crate) fn transition_in_tx(
    tx: &rusqlite::Transaction<'_>,
    kind: RecordKind,
    id: &str,
    new_state: Lifecycle,
    reason: &str,
    window: std::time::Duration,
) -> Result<()> {
    let table = kind.table();
    let (current_raw, window_dirty): (String, i64) = tx
        .query_row(
            &format!("SELECT lifecycle, window_dirty FROM {table} WHERE id = ?1"),
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(id.to_string()),
            other => other.into(),
        })?;
    let current = Lifecycle::parse_name(&current_raw)
        .ok_or_else(|| EngineError::Invariant(format!("corrupt lifecycle on {id}")))?;

    if !current.can_transition_to(new_state) {
        return Err(EngineError::Invariant(format!(
            "illegal transition {current} -> {new_state} on {kind} {id} ({reason})"
        )));
    }

    let now = Utc::now();
    match new_state {
        Lifecycle::Labile => {
            let until = now + ChronoDuration::from_std(window).unwrap_or_else(|_| {
                ChronoDuration::minutes(60)
            });
            tx.execute(
                &format!(
                    "UPDATE {table} SET lifecycle = 'labile', labile_until = ?1, updated_at = ?2
                     WHERE id = ?3"
                ),
                params![until, now, id],
            )?;
        }
        Lifecycle::Active => {
            // The single reverse edge: closing a window bumps version iff the
            // record was rewritten inside it.
            tx.execute(
                &format!(
                    "UPDATE {table} SET lifecycle = 'active', labile_until = NULL,
                         window_dirty = 0, version = version + ?1, updated_at = ?2
                     WHERE id = ?3"
                ),
                params![window_dirty, now, id],
            )?;
        }
        other => {
            tx.execute(
                &format!(
                    "UPDATE {table} SET lifecycle = ?1, labile_until = NULL,
                         window_dirty = 0, updated_at = ?2
                     WHERE id = ?3"
                ),
                params![other.as_str(), now, id],
            )?;
        }
    }

    // Archiving a source event never deletes a pattern, but the pattern's
    // provenance list records it.
    if kind == RecordKind::Event && new_state == Lifecycle::Archived {
        patterns::append_provenance_for_event(tx, id, "source event archived")?;
    }

    Ok(())
}

/// Shared activation body: bump counters, recompute evidence quality, open a
/// window when the record is active.
pub(crate) fn activate_in_tx(
    tx: &rusqlite::Transaction<'_>,
    kind: RecordKind,
    id: &str,
    window: std::time::Duration,
) -> Result<bool> {
    use crate::record::{derive_evidence_quality, EvidenceType, Outcome};

    let table = kind.table();
    let (lifecycle_raw, evidence_raw, activation_count): (String, String, i64) = tx
        .query_row(
            &format!("SELECT lifecycle, evidence_type, activation_count FROM {table} WHERE id = ?1"),
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(id.to_string()),
            other => other.into(),
        })?;
    let lifecycle = Lifecycle::parse_name(&lifecycle_raw)
        .ok_or_else(|| EngineError::Invariant(format!("corrupt lifecycle on {id}")))?;
    let evidence_type = EvidenceType::parse_name(&evidence_raw)
        .ok_or_else(|| EngineError::Invariant(format!("corrupt evidence type on {id}")))?;

    let outcome = if kind == RecordKind::Event {
        let raw: String = tx.query_row(
            &format!("SELECT outcome FROM {table} WHERE id = ?1"),
            params![id],
            |row| row.get(0),
        )?;
        Outcome::parse_name(&raw)
    } else {
        None
    };

    let now = Utc::now();
    let quality = derive_evidence_quality(
        evidence_type,
        activation_count + 1,
        outcome,
        lifecycle == Lifecycle::Consolidated,
    );

    tx.execute(
        &format!(
            "UPDATE {table} SET activation_count = activation_count + 1,
                 last_activation_at = ?1, evidence_quality = ?2, updated_at = ?1
             WHERE id = ?3"
        ),
        params![now, quality, id],
    )?;

    if lifecycle == Lifecycle::Active {
        let until = now
            + ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::minutes(60));
        tx.execute(
            &format!(
                "UPDATE {table} SET lifecycle = 'labile', labile_until = ?1 WHERE id = ?2"
            ),
            params![until, id],
        )?;
        return Ok(true);
    }
    Ok(false)
}

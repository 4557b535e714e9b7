//! Procedure CRUD and run tracking

use rusqlite::params;

use crate::error::{EngineError, Result};
use crate::record::{Procedure, ProcedureInput};
use crate::substrate::Deadline;

use super::rows::{json_column, procedure_from_row, ENVELOPE_COLS, PROCEDURE_COLS};
use super::RecordStore;

impl RecordStore {
    pub async fn insert_procedure(
        &self,
        input: ProcedureInput,
        deadline: Deadline,
    ) -> Result<Procedure> {
        let procedure = input.into_procedure()?;
        self.insert_procedure_record(procedure, deadline).await
    }

    /// Insert an already-materialized procedure (the consolidator derives
    /// them from workflow patterns with a deterministic id).
    pub(crate) async fn insert_procedure_record(
        &self,
        procedure: Procedure,
        deadline: Deadline,
    ) -> Result<Procedure> {
        let stored = procedure.clone();
        let result = self
            .substrate()
            .transaction(deadline, "insert_procedure", move |tx| {
                Self::ensure_project(tx, &stored.envelope.project_id)?;
                insert_procedure_in_tx(tx, &stored)
            })
            .await;

        match &result {
            Ok(_) => {
                self.audit()
                    .success("insert_procedure", &[procedure.envelope.id.clone()])
                    .await
            }
            Err(err) => {
                self.audit()
                    .failure("insert_procedure", &[procedure.envelope.id.clone()], err.tag())
                    .await
            }
        }
        result?;
        Ok(procedure)
    }

    pub async fn get_procedure(&self, id: &str, deadline: Deadline) -> Result<Procedure> {
        let id_owned = id.to_string();
        self.substrate()
            .with_read(deadline, "get_procedure", move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {ENVELOPE_COLS}, {PROCEDURE_COLS} FROM procedures WHERE id = ?1"
                    ),
                    params![id_owned],
                    procedure_from_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(id_owned.clone()),
                    other => other.into(),
                })
            })
            .await
    }

    /// Fold one run into the procedure's EMA success rate and duration
    /// average.
    pub async fn record_procedure_run(
        &self,
        id: &str,
        succeeded: bool,
        duration_ms: i64,
        deadline: Deadline,
    ) -> Result<Procedure> {
        let mut procedure = self.get_procedure(id, deadline).await?;
        procedure.record_run(succeeded, duration_ms);

        let id_owned = id.to_string();
        let (rate, count, avg) = (
            procedure.success_rate,
            procedure.usage_count,
            procedure.avg_duration_ms,
        );
        self.substrate()
            .with_write(deadline, "procedure_run", move |conn| {
                let changed = conn.execute(
                    "UPDATE procedures SET success_rate = ?1, usage_count = ?2,
                         avg_duration_ms = ?3, updated_at = ?4
                     WHERE id = ?5 AND usage_count = ?6",
                    params![rate, count, avg, chrono::Utc::now(), id_owned, count - 1],
                )?;
                if changed == 0 {
                    return Err(EngineError::Conflict(format!(
                        "procedure {id_owned} recorded another run since read"
                    )));
                }
                Ok(())
            })
            .await?;
        Ok(procedure)
    }

    /// Procedures whose trigger pattern matches an event-shaped probe.
    pub async fn matching_procedures(
        &self,
        project_id: &str,
        event_type: &str,
        tags: &[String],
        content: &str,
        deadline: Deadline,
    ) -> Result<Vec<Procedure>> {
        let project = project_id.to_string();
        let all = self
            .substrate()
            .with_read(deadline, "matching_procedures", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENVELOPE_COLS}, {PROCEDURE_COLS} FROM procedures
                     WHERE project_id = ?1 AND lifecycle IN ('active', 'labile')
                     ORDER BY success_rate DESC, usage_count DESC"
                ))?;
                let procedures = stmt
                    .query_map(params![project], procedure_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(procedures)
            })
            .await?;

        Ok(all
            .into_iter()
            .filter(|p| p.trigger_pattern.matches(event_type, tags, content))
            .collect())
    }
}

/// Insert body shared with the consolidator's cluster transaction.
pub(crate) fn insert_procedure_in_tx(
    tx: &rusqlite::Transaction<'_>,
    procedure: &Procedure,
) -> Result<()> {
    let env = &procedure.envelope;
    tx.execute(
        "INSERT INTO procedures (
            id, project_id, created_at, updated_at, valid_from, valid_to,
            lifecycle, confidence, evidence_type, evidence_quality, source_id,
            activation_count, last_activation_at, importance, tags,
            labile_until, window_dirty, version,
            name, category, trigger_pattern, steps, success_rate, usage_count,
            avg_duration_ms, code
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
            procedure.name,
            procedure.category,
            json_column(&procedure.trigger_pattern, "{}"),
            json_column(&procedure.steps, "[]"),
            procedure.success_rate,
            procedure.usage_count,
            procedure.avg_duration_ms,
            procedure.code.as_ref().map(|c| json_column(c, "{}")),
        ],
    )?;
    Ok(())
}

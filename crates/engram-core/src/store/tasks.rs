//! Task CRUD and status moves

use rusqlite::params;

use crate::error::{EngineError, Result};
use crate::record::{Task, TaskInput, TaskPhase, TaskStatus};
use crate::substrate::Deadline;

use super::rows::{json_column, task_from_row, ENVELOPE_COLS, TASK_COLS};
use super::RecordStore;

impl RecordStore {
    pub async fn insert_task(&self, input: TaskInput, deadline: Deadline) -> Result<Task> {
        let task = input.into_task()?;
        let stored = task.clone();
        let result = self
            .substrate()
            .transaction(deadline, "insert_task", move |tx| {
                Self::ensure_project(tx, &stored.envelope.project_id)?;
                let env = &stored.envelope;
                tx.execute(
                    "INSERT INTO tasks (
                        id, project_id, created_at, updated_at, valid_from, valid_to,
                        lifecycle, confidence, evidence_type, evidence_quality, source_id,
                        activation_count, last_activation_at, importance, tags,
                        labile_until, window_dirty, version,
                        content, status, phase, priority, plan, due_at, assignee,
                        effort_estimate
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
                        stored.content,
                        stored.status.as_str(),
                        stored.phase.as_str(),
                        stored.priority.as_str(),
                        json_column(&stored.plan, "[]"),
                        stored.due_at,
                        stored.assignee,
                        stored.effort_estimate,
                    ],
                )?;
                Ok(())
            })
            .await;

        match &result {
            Ok(_) => {
                self.audit()
                    .success("insert_task", &[task.envelope.id.clone()])
                    .await
            }
            Err(err) => {
                self.audit()
                    .failure("insert_task", &[task.envelope.id.clone()], err.tag())
                    .await
            }
        }
        result?;
        Ok(task)
    }

    pub async fn get_task(&self, id: &str, deadline: Deadline) -> Result<Task> {
        let id_owned = id.to_string();
        self.substrate()
            .with_read(deadline, "get_task", move |conn| {
                conn.query_row(
                    &format!("SELECT {ENVELOPE_COLS}, {TASK_COLS} FROM tasks WHERE id = ?1"),
                    params![id_owned],
                    task_from_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(id_owned.clone()),
                    other => other.into(),
                })
            })
            .await
    }

    /// Move a task through its status/phase machine. Terminal statuses
    /// (completed, cancelled) admit no further moves.
    pub async fn move_task(
        &self,
        id: &str,
        status: TaskStatus,
        phase: TaskPhase,
        deadline: Deadline,
    ) -> Result<Task> {
        let current = self.get_task(id, deadline).await?;
        if matches!(
            current.status,
            TaskStatus::Completed | TaskStatus::Cancelled
        ) {
            return Err(EngineError::Invariant(format!(
                "task {id} is {} and cannot move",
                current.status.as_str()
            )));
        }

        let id_owned = id.to_string();
        self.substrate()
            .with_write(deadline, "move_task", move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = ?1, phase = ?2, updated_at = ?3 WHERE id = ?4",
                    params![status.as_str(), phase.as_str(), chrono::Utc::now(), id_owned],
                )?;
                Ok(())
            })
            .await?;
        self.get_task(id, deadline).await
    }
}

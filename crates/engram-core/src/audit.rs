//! Append-only audit trail
//!
//! Every mutating operation records a structured entry: timestamp, actor,
//! operation, ids touched, outcome. Audit writes sit outside the
//! transactional boundary; a failed audit write degrades the entry and never
//! blocks the operation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::rows::json_column;
use crate::substrate::{Deadline, Substrate};

/// One audit entry, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub operation: String,
    pub record_ids: Vec<String>,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_tag: Option<String>,
}

/// Append-only audit log over the substrate.
pub struct AuditLog {
    substrate: Arc<Substrate>,
    actor: String,
}

impl AuditLog {
    pub fn new(substrate: Arc<Substrate>) -> Self {
        Self {
            substrate,
            actor: "engine".to_string(),
        }
    }

    /// Record a successful mutating operation. Best effort.
    pub async fn success(&self, operation: &str, record_ids: &[String]) {
        self.append(operation, record_ids, "ok", None).await;
    }

    /// Record a failed mutating operation with its taxonomy tag. Best effort.
    pub async fn failure(&self, operation: &str, record_ids: &[String], error_tag: &str) {
        self.append(operation, record_ids, "error", Some(error_tag))
            .await;
    }

    async fn append(
        &self,
        operation: &str,
        record_ids: &[String],
        outcome: &str,
        error_tag: Option<&str>,
    ) {
        let deadline = Deadline::after(Duration::from_secs(2));
        let at = Utc::now();
        let operation = operation.to_string();
        let actor = self.actor.clone();
        let ids_json = json_column(&record_ids, "[]");
        let outcome = outcome.to_string();
        let error_tag = error_tag.map(|t| t.to_string());

        let written = self
            .substrate
            .with_write(deadline, "audit", move |conn| {
                conn.execute(
                    "INSERT INTO audit_log (at, actor, operation, record_ids, outcome, error_tag)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![at, actor, operation, ids_json, outcome, error_tag],
                )?;
                Ok(())
            })
            .await;

        if let Err(err) = written {
            tracing::warn!(error = %err, "audit write failed, entry dropped");
        }
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let deadline = Deadline::after(Duration::from_secs(5));
        self.substrate
            .with_read(deadline, "audit_recent", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT at, actor, operation, record_ids, outcome, error_tag
                     FROM audit_log ORDER BY id DESC LIMIT ?1",
                )?;
                let entries = stmt
                    .query_map([limit as i64], |row| {
                        let ids_raw: String = row.get(3)?;
                        Ok(AuditEntry {
                            at: row.get(0)?,
                            actor: row.get(1)?,
                            operation: row.get(2)?,
                            record_ids: serde_json::from_str(&ids_raw).unwrap_or_default(),
                            outcome: row.get(4)?,
                            error_tag: row.get(5)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(entries)
            })
            .await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn test_audit_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            db_path: Some(dir.path().join("engram.db")),
            ..Default::default()
        };
        let substrate = Arc::new(Substrate::connect(&config).unwrap());
        let audit = AuditLog::new(substrate);

        audit.success("insert", &["e1".to_string()]).await;
        audit
            .failure("transition", &["e1".to_string()], "invariant")
            .await;

        let entries = audit.recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first.
        assert_eq!(entries[0].operation, "transition");
        assert_eq!(entries[0].error_tag.as_deref(), Some("invariant"));
        assert_eq!(entries[1].outcome, "ok");
        assert_eq!(entries[1].record_ids, vec!["e1".to_string()]);
    }
}

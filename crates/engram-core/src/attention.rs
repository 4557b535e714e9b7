//! Quality and attention tracker - derived, read-only aggregates
//!
//! Exposes per-domain expertise, the cognitive-load indicator, and quality
//! histograms. This component never mutates records; working-set membership
//! itself is maintained by the store.

use std::sync::Arc;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::record::RecordKind;
use crate::store::RecordStore;
use crate::substrate::Deadline;

/// Cognitive-load snapshot for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitiveLoad {
    /// Records currently inside a reconsolidation window
    pub labile: i64,
    /// Currently attended working-set entries
    pub attended: usize,
    /// Configured working-set cap N
    pub cap: usize,
}

impl CognitiveLoad {
    /// Load relative to the cap; above 1.0 means the windows alone exceed
    /// the attention budget.
    pub fn pressure(&self) -> f64 {
        (self.labile as f64 + self.attended as f64) / self.cap.max(1) as f64
    }
}

/// Ten-bucket histogram over a [0, 1] quality score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityHistogram {
    pub kind: RecordKind,
    /// Bucket i counts records with quality in [i/10, (i+1)/10)
    pub buckets: [i64; 10],
    pub total: i64,
}

/// Read-only aggregates over the record store.
pub struct QualityTracker {
    store: Arc<RecordStore>,
    config: Arc<EngineConfig>,
}

impl QualityTracker {
    pub fn new(store: Arc<RecordStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Per-domain expertise: mean evidence quality of `learned` records
    /// carrying the domain tag. `None` when nothing has been learned there.
    pub async fn expertise(
        &self,
        project_id: &str,
        domain_tag: &str,
        deadline: Deadline,
    ) -> Result<Option<f64>> {
        let project = project_id.to_string();
        let needle = format!("%\"{}\"%", domain_tag.replace('"', ""));
        self.store
            .substrate()
            .with_read(deadline, "expertise", move |conn| {
                let mut total = 0.0f64;
                let mut count = 0i64;
                for table in ["facts", "procedures", "patterns"] {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT evidence_quality FROM {table}
                         WHERE project_id = ?1 AND evidence_type = 'learned'
                           AND tags LIKE ?2 AND lifecycle != 'superseded'"
                    ))?;
                    let qualities = stmt
                        .query_map(params![project, needle], |row| row.get::<_, f64>(0))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    count += qualities.len() as i64;
                    total += qualities.into_iter().sum::<f64>();
                }
                Ok(if count == 0 {
                    None
                } else {
                    Some(total / count as f64)
                })
            })
            .await
    }

    /// Count of labile records plus attended working-set entries against the
    /// configured cap.
    pub async fn cognitive_load(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<CognitiveLoad> {
        let mut labile = 0i64;
        for kind in RecordKind::ALL {
            let counts = self
                .store
                .counts_by_lifecycle(project_id, kind, deadline)
                .await?;
            labile += counts.get("labile").copied().unwrap_or(0);
        }
        let attended = self.store.attended_count(project_id, deadline).await?;
        Ok(CognitiveLoad {
            labile,
            attended,
            cap: self.config.working_set_cap,
        })
    }

    /// Evidence-quality histogram for one kind.
    pub async fn quality_histogram(
        &self,
        project_id: &str,
        kind: RecordKind,
        deadline: Deadline,
    ) -> Result<QualityHistogram> {
        let project = project_id.to_string();
        let table = kind.table();
        self.store
            .substrate()
            .with_read(deadline, "quality_histogram", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT evidence_quality FROM {table} WHERE project_id = ?1"
                ))?;
                let qualities = stmt
                    .query_map(params![project], |row| row.get::<_, f64>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                let mut buckets = [0i64; 10];
                for quality in &qualities {
                    let idx = ((quality * 10.0).floor() as usize).min(9);
                    buckets[idx] += 1;
                }
                Ok(QualityHistogram {
                    kind,
                    buckets,
                    total: qualities.len() as i64,
                })
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

    #[test]
    fn test_pressure() {
        let load = CognitiveLoad {
            labile: 5,
            attended: 4,
            cap: 7,
        };
        assert!(load.pressure() > 1.0);

        let calm = CognitiveLoad {
            labile: 1,
            attended: 2,
            cap: 7,
        };
        assert!(calm.pressure() < 1.0);
    }
}

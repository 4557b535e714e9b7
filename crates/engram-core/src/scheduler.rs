//! Background scheduler - idle detection, window sweeps, consolidation ticks
//!
//! Drives background work without competing with foreground retrieval. Each
//! tick closes expired reconsolidation windows and, for projects idle past
//! the quiet window with enough unconsolidated events (or a stale last run),
//! invokes the consolidator with the balanced strategy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::consolidation::{CancelFlag, Consolidator, Strategy};
use crate::store::RecordStore;
use crate::substrate::Deadline;

/// Handle over the running background task. Dropping the handle leaves the
/// task running; call `shutdown` to stop it.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    cancel: CancelFlag,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request a stop and wait for the task to finish. A consolidation in
    /// flight stops at its next cluster boundary. Open reconsolidation
    /// windows stay labile until a later sweep picks them up.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    /// Cancel flag shared with in-flight consolidations.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }
}

/// Spawn the background tick loop.
pub fn spawn(
    store: Arc<RecordStore>,
    consolidator: Arc<Consolidator>,
    config: Arc<EngineConfig>,
) -> SchedulerHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let cancel = CancelFlag::new();
    let task_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.scheduler_tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tick(&store, &consolidator, &config, &task_cancel).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
    });

    SchedulerHandle {
        shutdown: shutdown_tx,
        cancel,
        task,
    }
}

async fn tick(
    store: &Arc<RecordStore>,
    consolidator: &Arc<Consolidator>,
    config: &Arc<EngineConfig>,
    cancel: &CancelFlag,
) {
    let deadline = Deadline::after(Duration::from_secs(30));

    // Every tick closes expired reconsolidation windows.
    match store.close_expired_windows(None, deadline).await {
        Ok(0) => {}
        Ok(closed) => tracing::debug!(closed, "reconsolidation windows closed"),
        Err(err) => tracing::warn!(error = %err, "window sweep failed, retrying next tick"),
    }

    let projects = match store.project_activity(deadline).await {
        Ok(projects) => projects,
        Err(err) => {
            tracing::warn!(error = %err, "project scan failed, retrying next tick");
            return;
        }
    };

    let now = Utc::now();
    for (project_id, last_activity, last_consolidated) in projects {
        if cancel.is_cancelled() {
            return;
        }

        // Only touch projects quiet for longer than the idle window.
        let idle = match last_activity {
            Some(at) => {
                (now - at).num_seconds().max(0) as u64 >= config.idle_quiet_window.as_secs()
            }
            None => true,
        };
        if !idle {
            continue;
        }

        let unconsolidated = match store.count_unconsolidated_events(&project_id, deadline).await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, project_id, "event count failed");
                continue;
            }
        };
        let stale_run = match last_consolidated {
            Some(at) => {
                (now - at).num_seconds().max(0) as u64 >= config.consolidation_max_age.as_secs()
            }
            None => true,
        };

        let should_run = unconsolidated >= config.consolidation_threshold
            || (stale_run && unconsolidated > 0);
        if !should_run {
            continue;
        }

        tracing::info!(
            project_id,
            unconsolidated,
            stale_run,
            "idle project eligible, starting background consolidation"
        );
        let run_deadline = Deadline::after(Duration::from_secs(300));
        match consolidator
            .consolidate(&project_id, Strategy::Balanced, None, cancel, run_deadline)
            .await
        {
            Ok(report) if report.cancelled => {
                tracing::debug!(project_id, "background consolidation cancelled at boundary");
            }
            Ok(report) => {
                tracing::debug!(
                    project_id,
                    patterns = report.patterns_emitted,
                    "background consolidation done"
                );
            }
            // Conflicts and transient failures retry at the next tick.
            Err(err) => {
                tracing::warn!(error = %err, project_id, "background consolidation failed");
            }
        }
    }
}

//! Substrate - durable, transactional, async access to typed tables
//!
//! One instance per process. SQLite in WAL mode behind a bounded connection
//! pool: a single dedicated writer connection (SQLite serializes writers
//! anyway) plus a min/max-bounded set of reader connections handed out
//! through a semaphore. All statements are parameterized; transactions are
//! the only way cross-record invariants change.

mod migrations;

pub use migrations::{apply_migrations, get_current_version, Migration, MIGRATIONS};

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

// ============================================================================
// DEADLINE
// ============================================================================

/// Per-operation deadline carried through every public engine call.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    expires: Instant,
}

impl Deadline {
    /// A deadline this far in the future.
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        Self {
            started: now,
            expires: now + budget,
        }
    }

    /// Instant the deadline fires.
    pub fn expires(&self) -> Instant {
        self.expires
    }

    /// Wall-clock spent since the operation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the deadline has already fired.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    /// Build the taxonomy error for this deadline.
    pub fn timeout(&self, operation: &'static str) -> EngineError {
        EngineError::Timeout {
            operation,
            elapsed: self.elapsed(),
        }
    }
}

// ============================================================================
// POOL
// ============================================================================

/// Pool observability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, writer included
    pub size: usize,
    /// Reader connections currently idle
    pub idle: usize,
    /// Callers waiting for a reader
    pub pending: usize,
}

/// Process-wide substrate handle.
pub struct Substrate {
    path: PathBuf,
    writer: Mutex<Connection>,
    idle_readers: StdMutex<Vec<Connection>>,
    reader_permits: Semaphore,
    total_readers: AtomicUsize,
    pending: AtomicUsize,
    max_readers: usize,
    retry_limit: u32,
}

impl Substrate {
    /// Open the pool, run migrations forward, and verify the minimum pool
    /// size within the startup timeout.
    pub fn connect(config: &EngineConfig) -> Result<Self> {
        let path = Self::resolve_path(config)?;
        let startup = std::time::Instant::now();

        let writer = loop {
            match Self::open_connection(&path) {
                Ok(conn) => break conn,
                Err(err) if startup.elapsed() < config.startup_timeout => {
                    tracing::warn!(error = %err, "substrate writer open failed, retrying");
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    return Err(EngineError::Unavailable(format!(
                        "could not open substrate within startup timeout: {err}"
                    )))
                }
            }
        };

        apply_migrations(&writer)?;

        // Restrict database file permissions to owner-only on Unix.
        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&path, perms);
        }

        // The writer counts toward pool_min; open the remaining readers
        // eagerly so startup fails fast when the substrate is unreachable.
        let min_readers = config.pool_min.saturating_sub(1).max(1);
        let max_readers = config.pool_max.saturating_sub(1).max(min_readers);

        let mut readers = Vec::with_capacity(min_readers);
        while readers.len() < min_readers {
            match Self::open_connection(&path) {
                Ok(conn) => readers.push(conn),
                Err(err) if startup.elapsed() < config.startup_timeout => {
                    tracing::warn!(error = %err, "substrate reader open failed, retrying");
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(err) => {
                    return Err(EngineError::Unavailable(format!(
                        "pool below minimum size at startup: {err}"
                    )))
                }
            }
        }
        let total_readers = readers.len();

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            idle_readers: StdMutex::new(readers),
            reader_permits: Semaphore::new(max_readers),
            total_readers: AtomicUsize::new(total_readers),
            pending: AtomicUsize::new(0),
            max_readers,
            retry_limit: config.substrate_retry_limit,
        })
    }

    fn resolve_path(config: &EngineConfig) -> Result<PathBuf> {
        match &config.db_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        EngineError::Unavailable(format!("could not create database dir: {e}"))
                    })?;
                }
                Ok(path.clone())
            }
            None => {
                let dirs = directories::ProjectDirs::from("dev", "engram", "engram")
                    .ok_or_else(|| {
                        EngineError::Unavailable(
                            "could not determine platform data directory".to_string(),
                        )
                    })?;
                let data_dir = dirs.data_dir();
                std::fs::create_dir_all(data_dir).map_err(|e| {
                    EngineError::Unavailable(format!("could not create data dir: {e}"))
                })?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(0o700);
                    let _ = std::fs::set_permissions(data_dir, perms);
                }
                Ok(data_dir.join("engram.db"))
            }
        }
    }

    fn open_connection(path: &PathBuf) -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }

    /// Pool observability.
    pub fn pool_stats(&self) -> PoolStats {
        let idle = self.idle_readers.lock().map(|v| v.len()).unwrap_or(0);
        PoolStats {
            size: 1 + self.total_readers.load(Ordering::Relaxed),
            idle,
            pending: self.pending.load(Ordering::Relaxed),
        }
    }

    /// Run a read-only closure on a pooled reader connection.
    pub async fn with_read<T, F>(
        &self,
        deadline: Deadline,
        operation: &'static str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let acquired =
            tokio::time::timeout_at(deadline.expires(), self.reader_permits.acquire()).await;
        self.pending.fetch_sub(1, Ordering::Relaxed);
        let permit = match acquired {
            Err(_) => return Err(deadline.timeout(operation)),
            Ok(Err(_)) => {
                return Err(EngineError::Unavailable("reader pool closed".to_string()))
            }
            Ok(Ok(permit)) => permit,
        };

        // A permit guarantees either an idle connection or headroom to open
        // one more.
        let conn = {
            let popped = self
                .idle_readers
                .lock()
                .map_err(|_| EngineError::Unavailable("reader pool poisoned".to_string()))?
                .pop();
            match popped {
                Some(conn) => conn,
                None => {
                    debug_assert!(self.total_readers.load(Ordering::Relaxed) < self.max_readers);
                    let conn = Self::open_connection(&self.path)
                        .map_err(|e| EngineError::Unavailable(e.to_string()))?;
                    self.total_readers.fetch_add(1, Ordering::Relaxed);
                    conn
                }
            }
        };

        let result = f(&conn);

        if let Ok(mut idle) = self.idle_readers.lock() {
            idle.push(conn);
        } else {
            self.total_readers.fetch_sub(1, Ordering::Relaxed);
        }
        drop(permit);

        result
    }

    /// Run a mutating closure on the writer connection, retrying transient
    /// busy failures with bounded exponential backoff.
    pub async fn with_write<T, F>(
        &self,
        deadline: Deadline,
        operation: &'static str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(&mut Connection) -> Result<T>,
    {
        let mut conn = tokio::time::timeout_at(deadline.expires(), self.writer.lock())
            .await
            .map_err(|_| deadline.timeout(operation))?;

        let mut attempt = 0u32;
        loop {
            match f(&mut conn) {
                Err(err @ EngineError::Unavailable(_)) if attempt < self.retry_limit => {
                    attempt += 1;
                    let backoff =
                        Duration::from_millis(50u64.saturating_mul(1u64 << attempt.min(5)))
                            .min(Duration::from_secs(1));
                    tracing::debug!(
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient substrate failure, backing off"
                    );
                    if deadline.expired() {
                        return Err(deadline.timeout(operation));
                    }
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Run a closure inside a transaction on the writer connection. Commits
    /// when the closure returns `Ok`, rolls back otherwise.
    pub async fn transaction<T, F>(
        &self,
        deadline: Deadline,
        operation: &'static str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        self.with_write(deadline, operation, move |conn| {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Execute a single parameterized statement on the writer.
    ///
    /// Rejects multi-statement SQL: parameters can only be pre-bound to
    /// placeholders of one statement.
    pub async fn execute(
        &self,
        deadline: Deadline,
        sql: &str,
        params: Vec<rusqlite::types::Value>,
    ) -> Result<usize> {
        let trimmed = sql.trim().trim_end_matches(';');
        if trimmed.contains(';') {
            return Err(EngineError::Invariant(
                "multi-statement SQL is not accepted by execute".to_string(),
            ));
        }
        self.with_write(deadline, "execute", move |conn| {
            Ok(conn.execute(trimmed, rusqlite::params_from_iter(params.iter()))?)
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

    fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
        EngineConfig {
            db_path: Some(dir.path().join("engram.db")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = Substrate::connect(&test_config(&dir)).unwrap();
        let stats = substrate.pool_stats();
        // Writer plus one eager reader for default pool_min of 2.
        assert_eq!(stats.size, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_execute_rejects_multi_statement() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = Substrate::connect(&test_config(&dir)).unwrap();
        let deadline = Deadline::after(Duration::from_secs(5));
        let err = substrate
            .execute(
                deadline,
                "DELETE FROM events; DROP TABLE events",
                vec![],
            )
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "invariant");
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = Substrate::connect(&test_config(&dir)).unwrap();
        let deadline = Deadline::after(Duration::from_secs(5));

        let result: Result<()> = substrate
            .transaction(deadline, "test", |tx| {
                tx.execute(
                    "INSERT INTO projects (id, name, created_at) VALUES ('p', 'p', datetime('now'))",
                    [],
                )?;
                Err(EngineError::Invariant("forced rollback".to_string()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = substrate
            .with_read(deadline, "test", |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_reads_grow_pool_to_max() {
        let dir = tempfile::tempdir().unwrap();
        let substrate = Substrate::connect(&test_config(&dir)).unwrap();
        let deadline = Deadline::after(Duration::from_secs(5));

        for _ in 0..4 {
            substrate
                .with_read(deadline, "test", |conn| {
                    Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?)
                })
                .await
                .unwrap();
        }
        let stats = substrate.pool_stats();
        assert!(stats.size >= 2);
        assert!(stats.size <= 10);
    }

    #[test]
    fn test_deadline_expiry() {
        let deadline = Deadline::after(Duration::from_millis(0));
        assert!(deadline.expired());
        let err = deadline.timeout("retrieve");
        assert_eq!(err.tag(), "timeout");
    }
}

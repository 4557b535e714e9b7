//! Database migrations
//!
//! Forward-only schema migrations, applied in order at connect time.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Record tables, embeddings, full-text indexes",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Consolidation runs, conflicts log, working set, audit log",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: projects, the seven record tables, embeddings, FTS5
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    last_activity_at TEXT,
    last_consolidated_at TEXT
);

-- Every record table carries the full envelope plus kind-specific columns.
-- updated_at backs optimistic concurrency on update().

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    lifecycle TEXT NOT NULL DEFAULT 'active',
    confidence REAL NOT NULL DEFAULT 0.5,
    evidence_type TEXT NOT NULL DEFAULT 'observed',
    evidence_quality REAL NOT NULL DEFAULT 0.5,
    source_id TEXT,
    activation_count INTEGER NOT NULL DEFAULT 0,
    last_activation_at TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    tags TEXT NOT NULL DEFAULT '[]',
    labile_until TEXT,
    window_dirty INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,

    session_id TEXT NOT NULL,
    event_type TEXT NOT NULL DEFAULT 'generic',
    content TEXT NOT NULL,
    outcome TEXT NOT NULL DEFAULT 'ongoing',
    context TEXT NOT NULL DEFAULT '{}',
    code_context TEXT,
    has_embedding INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_events_project_created ON events(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_events_project_lifecycle ON events(project_id, lifecycle);
CREATE INDEX IF NOT EXISTS idx_events_labile_until ON events(labile_until);
CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);

CREATE TABLE IF NOT EXISTS facts (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    lifecycle TEXT NOT NULL DEFAULT 'active',
    confidence REAL NOT NULL DEFAULT 0.5,
    evidence_type TEXT NOT NULL DEFAULT 'observed',
    evidence_quality REAL NOT NULL DEFAULT 0.5,
    source_id TEXT,
    activation_count INTEGER NOT NULL DEFAULT 0,
    last_activation_at TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    tags TEXT NOT NULL DEFAULT '[]',
    labile_until TEXT,
    window_dirty INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,

    content TEXT NOT NULL,
    memory_type TEXT NOT NULL DEFAULT 'fact',
    usefulness REAL NOT NULL DEFAULT 0.0,
    has_embedding INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_facts_project_created ON facts(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_facts_project_lifecycle ON facts(project_id, lifecycle);
CREATE INDEX IF NOT EXISTS idx_facts_labile_until ON facts(labile_until);

CREATE TABLE IF NOT EXISTS procedures (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    lifecycle TEXT NOT NULL DEFAULT 'active',
    confidence REAL NOT NULL DEFAULT 0.5,
    evidence_type TEXT NOT NULL DEFAULT 'observed',
    evidence_quality REAL NOT NULL DEFAULT 0.5,
    source_id TEXT,
    activation_count INTEGER NOT NULL DEFAULT 0,
    last_activation_at TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    tags TEXT NOT NULL DEFAULT '[]',
    labile_until TEXT,
    window_dirty INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,

    name TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    trigger_pattern TEXT NOT NULL DEFAULT '{}',
    steps TEXT NOT NULL DEFAULT '[]',
    success_rate REAL NOT NULL DEFAULT 0.0,
    usage_count INTEGER NOT NULL DEFAULT 0,
    avg_duration_ms INTEGER NOT NULL DEFAULT 0,
    code TEXT
);

CREATE INDEX IF NOT EXISTS idx_procedures_project_created ON procedures(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_procedures_project_lifecycle ON procedures(project_id, lifecycle);
CREATE INDEX IF NOT EXISTS idx_procedures_category ON procedures(category);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    lifecycle TEXT NOT NULL DEFAULT 'active',
    confidence REAL NOT NULL DEFAULT 0.5,
    evidence_type TEXT NOT NULL DEFAULT 'observed',
    evidence_quality REAL NOT NULL DEFAULT 0.5,
    source_id TEXT,
    activation_count INTEGER NOT NULL DEFAULT 0,
    last_activation_at TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    tags TEXT NOT NULL DEFAULT '[]',
    labile_until TEXT,
    window_dirty INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,

    content TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    phase TEXT NOT NULL DEFAULT 'planning',
    priority TEXT NOT NULL DEFAULT 'medium',
    plan TEXT NOT NULL DEFAULT '[]',
    due_at TEXT,
    assignee TEXT,
    effort_estimate INTEGER
);

CREATE INDEX IF NOT EXISTS idx_tasks_project_created ON tasks(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_project_lifecycle ON tasks(project_id, lifecycle);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(due_at);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    lifecycle TEXT NOT NULL DEFAULT 'active',
    confidence REAL NOT NULL DEFAULT 0.5,
    evidence_type TEXT NOT NULL DEFAULT 'observed',
    evidence_quality REAL NOT NULL DEFAULT 0.5,
    source_id TEXT,
    activation_count INTEGER NOT NULL DEFAULT 0,
    last_activation_at TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    tags TEXT NOT NULL DEFAULT '[]',
    labile_until TEXT,
    window_dirty INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,

    name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    attributes TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_entities_project_created ON entities(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_entities_project_lifecycle ON entities(project_id, lifecycle);
CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(project_id, name);

CREATE TABLE IF NOT EXISTS relations (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    lifecycle TEXT NOT NULL DEFAULT 'active',
    confidence REAL NOT NULL DEFAULT 0.5,
    evidence_type TEXT NOT NULL DEFAULT 'observed',
    evidence_quality REAL NOT NULL DEFAULT 0.5,
    source_id TEXT,
    activation_count INTEGER NOT NULL DEFAULT 0,
    last_activation_at TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    tags TEXT NOT NULL DEFAULT '[]',
    labile_until TEXT,
    window_dirty INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,

    from_entity TEXT NOT NULL,
    to_entity TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    strength REAL NOT NULL DEFAULT 1.0
);

CREATE INDEX IF NOT EXISTS idx_relations_project_created ON relations(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_relations_from ON relations(from_entity);
CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_entity);

CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    lifecycle TEXT NOT NULL DEFAULT 'active',
    confidence REAL NOT NULL DEFAULT 0.5,
    evidence_type TEXT NOT NULL DEFAULT 'inferred',
    evidence_quality REAL NOT NULL DEFAULT 0.5,
    source_id TEXT,
    activation_count INTEGER NOT NULL DEFAULT 0,
    last_activation_at TEXT,
    importance REAL NOT NULL DEFAULT 0.5,
    tags TEXT NOT NULL DEFAULT '[]',
    labile_until TEXT,
    window_dirty INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,

    pattern_type TEXT NOT NULL DEFAULT 'event_sequence',
    content TEXT NOT NULL,
    source_event_ids TEXT NOT NULL DEFAULT '[]',
    support INTEGER NOT NULL DEFAULT 0,
    confidence_before_validation REAL NOT NULL DEFAULT 0.0,
    confidence_after_validation REAL NOT NULL DEFAULT 0.0,
    provenance TEXT NOT NULL DEFAULT '[]',
    has_embedding INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_patterns_project_created ON patterns(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_patterns_project_lifecycle ON patterns(project_id, lifecycle);
CREATE INDEX IF NOT EXISTS idx_patterns_type ON patterns(pattern_type);

-- Embedding vectors, one row per embedded record (binary little-endian f32)
CREATE TABLE IF NOT EXISTS record_embeddings (
    record_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    project_id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    model TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_project_kind ON record_embeddings(project_id, kind);

-- FTS5 virtual tables for the content-bearing kinds

CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
    id, content, tags,
    content='events',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS events_ai AFTER INSERT ON events BEGIN
    INSERT INTO events_fts(rowid, id, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.tags);
END;

CREATE TRIGGER IF NOT EXISTS events_ad AFTER DELETE ON events BEGIN
    INSERT INTO events_fts(events_fts, rowid, id, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.tags);
END;

CREATE TRIGGER IF NOT EXISTS events_au AFTER UPDATE ON events BEGIN
    INSERT INTO events_fts(events_fts, rowid, id, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.tags);
    INSERT INTO events_fts(rowid, id, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.tags);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
    id, content, tags,
    content='facts',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
    INSERT INTO facts_fts(rowid, id, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.tags);
END;

CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, id, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.tags);
END;

CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, id, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.tags);
    INSERT INTO facts_fts(rowid, id, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.tags);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS patterns_fts USING fts5(
    id, content, tags,
    content='patterns',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS patterns_ai AFTER INSERT ON patterns BEGIN
    INSERT INTO patterns_fts(rowid, id, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.tags);
END;

CREATE TRIGGER IF NOT EXISTS patterns_ad AFTER DELETE ON patterns BEGIN
    INSERT INTO patterns_fts(patterns_fts, rowid, id, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.tags);
END;

CREATE TRIGGER IF NOT EXISTS patterns_au AFTER UPDATE ON patterns BEGIN
    INSERT INTO patterns_fts(patterns_fts, rowid, id, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.tags);
    INSERT INTO patterns_fts(rowid, id, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.tags);
END;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: background bookkeeping tables
const MIGRATION_V2_UP: &str = r#"
-- One row per consolidator run
CREATE TABLE IF NOT EXISTS consolidation_runs (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    strategy TEXT NOT NULL,
    started_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    events_scored INTEGER NOT NULL DEFAULT 0,
    clusters_formed INTEGER NOT NULL DEFAULT 0,
    patterns_emitted INTEGER NOT NULL DEFAULT 0,
    procedures_derived INTEGER NOT NULL DEFAULT 0,
    conflicts_detected INTEGER NOT NULL DEFAULT 0,
    conflicts_resolved INTEGER NOT NULL DEFAULT 0,
    validator_consulted INTEGER NOT NULL DEFAULT 0,
    validator_unavailable INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_runs_project_started ON consolidation_runs(project_id, started_at);

-- Contradiction pairs and their resolutions
CREATE TABLE IF NOT EXISTS conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    first_id TEXT NOT NULL,
    second_id TEXT NOT NULL,
    contradiction_type TEXT NOT NULL,
    severity REAL NOT NULL,
    resolution TEXT NOT NULL,
    survivor_id TEXT,
    detected_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conflicts_project ON conflicts(project_id, detected_at);
CREATE INDEX IF NOT EXISTS idx_conflicts_resolution ON conflicts(resolution);

-- Currently attended facts/patterns, capped per project
CREATE TABLE IF NOT EXISTS working_set (
    project_id TEXT NOT NULL,
    record_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    attended_at TEXT NOT NULL,
    PRIMARY KEY (project_id, record_id)
);

CREATE INDEX IF NOT EXISTS idx_working_set_project ON working_set(project_id);

-- Append-only audit trail; writes are best-effort and outside transactions
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    at TEXT NOT NULL,
    actor TEXT NOT NULL DEFAULT 'engine',
    operation TEXT NOT NULL,
    record_ids TEXT NOT NULL DEFAULT '[]',
    outcome TEXT NOT NULL,
    error_tag TEXT
);

CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_log(at);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_cleanly() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(get_current_version(&conn).unwrap(), 2);

        // Re-applying is a no-op.
        assert_eq!(apply_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn test_fts_triggers_track_inserts() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO projects (id, name, created_at) VALUES ('p', 'p', datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO events (id, project_id, created_at, updated_at, session_id, content)
             VALUES ('e1', 'p', datetime('now'), datetime('now'), 's', 'user saved the file')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events_fts WHERE events_fts MATCH 'saved'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }
}

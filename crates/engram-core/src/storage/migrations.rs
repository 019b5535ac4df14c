//! Database Migrations
//!
//! Idempotent schema migrations applied at startup under an exclusive
//! transaction. The engine refuses to serve traffic until [`apply`] returns.

use rusqlite::{Connection, TransactionBehavior};

use crate::error::Result;

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: projects, events, facts, procedures, tasks, graph, meta",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Ingest cursors and consolidation run reports",
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

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
-- Project registry: one logical partition per project
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);

-- ============================================================================
-- EPISODIC LAYER
-- ============================================================================

-- Append-only event log. Timestamps are UTC nanoseconds; (created_at, id)
-- totally orders events within a project.
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    kind TEXT NOT NULL,
    outcome TEXT NOT NULL DEFAULT 'unknown',
    context TEXT NOT NULL DEFAULT '{}',
    content_hash TEXT NOT NULL,
    importance REAL NOT NULL DEFAULT 0.5,
    consolidation_state TEXT NOT NULL DEFAULT 'unsealed',
    consolidation_run_id TEXT,
    created_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    UNIQUE (project_id, content_hash)
);

CREATE INDEX IF NOT EXISTS idx_events_project_time ON events(project_id, created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_events_kind ON events(project_id, kind);
CREATE INDEX IF NOT EXISTS idx_events_outcome ON events(project_id, outcome);
CREATE INDEX IF NOT EXISTS idx_events_state ON events(project_id, consolidation_state);

-- Embeddings stored as little-endian f32 blobs
CREATE TABLE IF NOT EXISTS event_embeddings (
    event_id INTEGER PRIMARY KEY REFERENCES events(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL DEFAULT 768,
    created_at INTEGER NOT NULL
);

-- FTS5 over event content
CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
    content,
    content='events',
    content_rowid='id',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS events_ai AFTER INSERT ON events BEGIN
    INSERT INTO events_fts(rowid, content) VALUES (NEW.id, NEW.content);
END;

CREATE TRIGGER IF NOT EXISTS events_ad AFTER DELETE ON events BEGIN
    INSERT INTO events_fts(events_fts, rowid, content) VALUES ('delete', OLD.id, OLD.content);
END;

-- ============================================================================
-- SEMANTIC LAYER
-- ============================================================================

CREATE TABLE IF NOT EXISTS facts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    statement TEXT NOT NULL,
    domain TEXT NOT NULL,
    confidence REAL NOT NULL,
    support_count INTEGER NOT NULL DEFAULT 1,
    contradiction_count INTEGER NOT NULL DEFAULT 0,
    last_reinforced_at INTEGER NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    UNIQUE (project_id, domain, statement)
);

CREATE INDEX IF NOT EXISTS idx_facts_project_domain ON facts(project_id, domain);
CREATE INDEX IF NOT EXISTS idx_facts_confidence ON facts(project_id, confidence);
CREATE INDEX IF NOT EXISTS idx_facts_archived ON facts(project_id, archived);

-- Grounding: a cited event cannot be retained away while the fact exists
CREATE TABLE IF NOT EXISTS fact_sources (
    fact_id INTEGER NOT NULL REFERENCES facts(id) ON DELETE CASCADE,
    event_id INTEGER NOT NULL REFERENCES events(id),
    PRIMARY KEY (fact_id, event_id)
);

CREATE INDEX IF NOT EXISTS idx_fact_sources_event ON fact_sources(event_id);

CREATE TABLE IF NOT EXISTS fact_embeddings (
    fact_id INTEGER PRIMARY KEY REFERENCES facts(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL DEFAULT 768,
    created_at INTEGER NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
    statement,
    domain,
    content='facts',
    content_rowid='id',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
    INSERT INTO facts_fts(rowid, statement, domain) VALUES (NEW.id, NEW.statement, NEW.domain);
END;

CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, statement, domain)
    VALUES ('delete', OLD.id, OLD.statement, OLD.domain);
END;

CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE ON facts BEGIN
    INSERT INTO facts_fts(facts_fts, rowid, statement, domain)
    VALUES ('delete', OLD.id, OLD.statement, OLD.domain);
    INSERT INTO facts_fts(rowid, statement, domain) VALUES (NEW.id, NEW.statement, NEW.domain);
END;

-- ============================================================================
-- PROCEDURAL LAYER
-- ============================================================================

CREATE TABLE IF NOT EXISTS procedures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    steps TEXT NOT NULL,
    parameters TEXT NOT NULL DEFAULT '[]',
    success_count INTEGER NOT NULL DEFAULT 0,
    execution_count INTEGER NOT NULL DEFAULT 0,
    avg_duration_ms REAL NOT NULL DEFAULT 0,
    grounding_event_ids TEXT NOT NULL DEFAULT '[]',
    underperforming INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    UNIQUE (project_id, name)
);

CREATE INDEX IF NOT EXISTS idx_procedures_category ON procedures(project_id, category);

-- Definition snapshots for rollback
CREATE TABLE IF NOT EXISTS procedure_versions (
    procedure_id INTEGER NOT NULL REFERENCES procedures(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    steps TEXT NOT NULL,
    parameters TEXT NOT NULL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (procedure_id, version)
);

CREATE TABLE IF NOT EXISTS procedure_executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    procedure_id INTEGER NOT NULL REFERENCES procedures(id) ON DELETE CASCADE,
    outcome TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    params TEXT NOT NULL DEFAULT '{}',
    recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_proc_exec_procedure ON procedure_executions(procedure_id);

CREATE TABLE IF NOT EXISTS procedure_embeddings (
    procedure_id INTEGER PRIMARY KEY REFERENCES procedures(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL DEFAULT 768,
    created_at INTEGER NOT NULL
);

-- ============================================================================
-- PROSPECTIVE LAYER
-- ============================================================================

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 1,
    phase TEXT,
    parent_id INTEGER REFERENCES tasks(id),
    estimated_effort_min INTEGER,
    actual_effort_min INTEGER,
    deadline INTEGER,
    created_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(project_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    depends_on_id INTEGER NOT NULL REFERENCES tasks(id),
    PRIMARY KEY (task_id, depends_on_id)
);

CREATE INDEX IF NOT EXISTS idx_task_deps_target ON task_dependencies(depends_on_id);

-- ============================================================================
-- KNOWLEDGE GRAPH
-- ============================================================================

CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    community INTEGER,
    created_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    UNIQUE (project_id, name, kind)
);

CREATE TABLE IF NOT EXISTS relations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    from_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    to_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    weight REAL NOT NULL,
    created_at INTEGER NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    UNIQUE (project_id, from_id, to_id, kind)
);

CREATE INDEX IF NOT EXISTS idx_relations_from ON relations(from_id);
CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_id);

-- Evidence: same stable-reference discipline as fact_sources
CREATE TABLE IF NOT EXISTS relation_evidence (
    relation_id INTEGER NOT NULL REFERENCES relations(id) ON DELETE CASCADE,
    event_id INTEGER NOT NULL REFERENCES events(id),
    PRIMARY KEY (relation_id, event_id)
);

CREATE INDEX IF NOT EXISTS idx_relation_evidence_event ON relation_evidence(event_id);

-- ============================================================================
-- META LAYER
-- ============================================================================

CREATE TABLE IF NOT EXISTS quality_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    layer TEXT NOT NULL,
    density REAL NOT NULL,
    coverage REAL NOT NULL,
    coherence REAL NOT NULL,
    recall_proxy REAL NOT NULL,
    saturation REAL NOT NULL,
    sampled_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_quality_project_layer ON quality_samples(project_id, layer, sampled_at);

CREATE TABLE IF NOT EXISTS execution_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    task_id INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    phase_breakdown TEXT NOT NULL DEFAULT '{}',
    properties TEXT NOT NULL DEFAULT '{}',
    recorded_at INTEGER NOT NULL
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Ingest cursors and consolidation run reports
const MIGRATION_V2_UP: &str = r#"
-- Per-source resumable ingestion; cursor bytes are opaque to the engine
CREATE TABLE IF NOT EXISTS ingest_cursors (
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    source_id TEXT NOT NULL,
    cursor TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (project_id, source_id)
);

-- One row per consolidation run; doubles as the run report archive
CREATE TABLE IF NOT EXISTS consolidation_runs (
    id TEXT PRIMARY KEY,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    fingerprint TEXT NOT NULL,
    strategy TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    events_in INTEGER NOT NULL DEFAULT 0,
    clusters INTEGER NOT NULL DEFAULT 0,
    facts_created INTEGER NOT NULL DEFAULT 0,
    facts_reinforced INTEGER NOT NULL DEFAULT 0,
    procedures_created INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    llm_calls INTEGER NOT NULL DEFAULT 0,
    llm_failures INTEGER NOT NULL DEFAULT 0,
    completed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_consolidation_runs_fingerprint ON consolidation_runs(fingerprint);
CREATE INDEX IF NOT EXISTS idx_consolidation_runs_project ON consolidation_runs(project_id, completed_at);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations under an exclusive transaction
///
/// Safe to call from multiple processes: the exclusive lock serializes
/// appliers and the version check makes re-application a no-op.
pub fn apply(conn: &mut Connection) -> Result<u32> {
    let mut applied = 0;

    for migration in MIGRATIONS {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        let version = current_version(&tx)?;
        if migration.version > version {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            tx.execute_batch(migration.up)?;
            applied += 1;
        }
        tx.commit()?;
    }

    Ok(applied)
}

// ============================================================================
// TESTS
// ============================================================================

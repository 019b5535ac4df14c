//! Storage Engine
//!
//! SQLite-backed relational + full-text + vector store behind a connection
//! pool. Migrations run at open; the pool is the only way the rest of the
//! engine touches the database. Every query is parameterized.

pub mod migrations;
mod pool;

pub use pool::{Pool, PooledConnection};

use std::path::Path;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::model::now_nanos;

/// Open the database, apply migrations, and return the pool
///
/// Refuses to return until migration completes; migration runs under an
/// exclusive transaction so concurrent openers serialize.
pub fn open(path: &Path, config: &StorageConfig) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pool = Pool::open(path, config)?;
    {
        let mut conn = pool.acquire_blocking()?;
        migrations::apply(&mut conn)?;
    }
    Ok(pool)
}

/// Resolve a project name to its id, creating the row on first use
pub fn resolve_project(conn: &rusqlite::Connection, name: &str) -> Result<i64> {
    if name.trim().is_empty() {
        return Err(crate::error::Error::validation("project name is empty"));
    }
    conn.execute(
        "INSERT OR IGNORE INTO projects (name, created_at) VALUES (?1, ?2)",
        rusqlite::params![name, now_nanos()],
    )?;
    let id = conn.query_row(
        "SELECT id FROM projects WHERE name = ?1",
        rusqlite::params![name],
        |row| row.get(0),
    )?;
    Ok(id)
}

/// Delete a project and, through cascades, everything it owns
pub fn delete_project(conn: &rusqlite::Connection, project_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM projects WHERE id = ?1",
        rusqlite::params![project_id],
    )?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

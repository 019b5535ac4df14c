//! Connection Pool
//!
//! Scoped acquisition over a set of SQLite connections. Permits bound
//! concurrency at `pool_max`; the guard returns its connection on every exit
//! path, including unwinds, because release lives in `Drop`. Acquisition
//! times out with `ErrorKind::ResourceExhausted`.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::StorageConfig;
use crate::error::{lock_poisoned, Error, Result};

// ============================================================================
// POOL
// ============================================================================

/// SQLite connection pool
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl Pool {
    /// Open a pool against a database file, pre-opening `pool_min` connections
    ///
    /// Does not apply migrations; see [`super::migrations::apply`].
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self> {
        let max = config.pool_max.max(1);
        let min = config.pool_min.clamp(1, max);

        let mut idle = Vec::with_capacity(max);
        for _ in 0..min {
            idle.push(open_connection(path)?);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                path: path.to_path_buf(),
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(max)),
                acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            }),
        })
    }

    /// Acquire a connection, suspending up to the configured timeout
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(
            self.inner.acquire_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::resource_exhausted(format!(
                "no database connection available within {:?}",
                self.inner.acquire_timeout
            ))
        })?
        .map_err(|_| Error::internal("connection pool closed"))?;

        let existing = self
            .inner
            .idle
            .lock()
            .map_err(lock_poisoned)?
            .pop();
        let conn = match existing {
            Some(conn) => conn,
            None => open_connection(&self.inner.path)?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Acquire without suspension semantics, for startup and tests
    pub fn acquire_blocking(&self) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.inner.permits)
            .try_acquire_owned()
            .map_err(|_| Error::resource_exhausted("connection pool exhausted"))?;

        let existing = self
            .inner
            .idle
            .lock()
            .map_err(lock_poisoned)?
            .pop();
        let conn = match existing {
            Some(conn) => conn,
            None => open_connection(&self.inner.path)?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Idle connection count (test hook)
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().map(|v| v.len()).unwrap_or(0)
    }
}

/// Open and configure a single connection
fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Apply performance and integrity PRAGMAs
fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA mmap_size = 268435456;
         PRAGMA journal_size_limit = 67108864;",
    )?;
    Ok(())
}

// ============================================================================
// GUARD
// ============================================================================

/// RAII connection guard; returns the connection to the pool on drop
#[derive(Debug)]
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(mut idle) = self.pool.idle.lock() {
                idle.push(conn);
            }
            // A poisoned idle lock drops the connection instead; the permit
            // is still released, so a fresh connection gets opened on demand.
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

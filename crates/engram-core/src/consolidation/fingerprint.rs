//! Run Fingerprints and the Advisory Lock Table
//!
//! A consolidation run is keyed by `hash(project || window || strategy)`.
//! The lock table enforces at-most-one concurrent run per fingerprint;
//! duplicate triggers coalesce by observing the held lock and declining to
//! start. The guard releases on drop, so cancellation and panics cannot
//! leak a fingerprint.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::consolidation::Strategy;
use crate::error::{lock_poisoned, Error, ErrorKind, Result};

// ============================================================================
// FINGERPRINT
// ============================================================================

/// Deterministic identity of a consolidation run
pub fn fingerprint(project_id: i64, window_start: i64, window_end: i64, strategy: Strategy) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(window_start.to_le_bytes());
    hasher.update(window_end.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(strategy.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ============================================================================
// LOCK TABLE
// ============================================================================

/// In-process advisory lock table keyed by fingerprint
#[derive(Clone, Default)]
pub struct RunLockTable {
    held: Arc<Mutex<HashSet<String>>>,
}

impl RunLockTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a fingerprint
    ///
    /// Fails with `Conflict` when a run for the fingerprint is already
    /// active; callers treat that as "coalesce onto the running instance".
    pub fn acquire(&self, fingerprint: &str) -> Result<RunLockGuard> {
        let mut held = self.held.lock().map_err(lock_poisoned)?;
        if !held.insert(fingerprint.to_string()) {
            return Err(Error::new(
                ErrorKind::Conflict,
                format!("consolidation already running for fingerprint {fingerprint}"),
            ));
        }
        Ok(RunLockGuard {
            table: Arc::clone(&self.held),
            fingerprint: fingerprint.to_string(),
        })
    }

    /// Whether a fingerprint is currently held (test hook)
    pub fn is_held(&self, fingerprint: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(fingerprint))
            .unwrap_or(false)
    }
}

/// RAII lock on one fingerprint; released on drop
#[derive(Debug)]
pub struct RunLockGuard {
    table: Arc<Mutex<HashSet<String>>>,
    fingerprint: String,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.table.lock() {
            held.remove(&self.fingerprint);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

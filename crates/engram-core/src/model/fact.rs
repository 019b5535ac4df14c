//! Fact - distilled declarative knowledge
//!
//! Facts are grounded: `source_event_ids` is never empty, and a cited event
//! cannot be removed while the fact exists. Confidence moves with the net
//! signed support count under a fixed scoring function.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Base confidence assigned by consolidation before validator adjustment
pub const DEFAULT_BASE_CONFIDENCE: f64 = 0.6;

/// Per-signal confidence step for reinforcement
pub const REINFORCE_STEP: f64 = 0.05;

/// Contradiction weight relative to support
pub const CONTRADICT_WEIGHT: f64 = 2.0;

// ============================================================================
// FACT
// ============================================================================

/// A distilled declarative statement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    /// Monotone rowid within the project
    pub id: i64,
    /// Owning project
    pub project_id: i64,
    /// The statement, at most 4 KiB
    pub statement: String,
    /// Domain tag; statements are unique within a domain
    pub domain: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// True when an embedding is stored
    pub has_embedding: bool,
    /// Events grounding this fact; never empty
    pub source_event_ids: Vec<i64>,
    /// Count of supporting signals, at least 1
    pub support_count: i64,
    /// Count of contradicting signals
    pub contradiction_count: i64,
    /// Last reinforcement or contradiction time
    pub last_reinforced_at: DateTime<Utc>,
    /// Archived facts are kept for audit but excluded from recall
    pub archived: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Mutation counter
    pub version: i64,
}

/// Maximum fact statement size in bytes (4 KiB)
pub const MAX_STATEMENT_BYTES: usize = 4 * 1024;

/// Input for remembering a fact
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FactInput {
    /// The statement
    pub statement: String,
    /// Domain tag
    pub domain: String,
    /// Grounding events; must be nonempty and must exist
    pub source_event_ids: Vec<i64>,
    /// Initial confidence; defaults to [`DEFAULT_BASE_CONFIDENCE`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl FactInput {
    /// Validate statement size, grounding, and confidence bounds
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.statement.trim().is_empty() {
            return Err(crate::error::Error::validation("fact statement is empty"));
        }
        if self.statement.len() > MAX_STATEMENT_BYTES {
            return Err(crate::error::Error::validation(format!(
                "fact statement is {} bytes, limit is {}",
                self.statement.len(),
                MAX_STATEMENT_BYTES
            )));
        }
        if self.source_event_ids.is_empty() {
            return Err(crate::error::Error::validation(
                "fact must cite at least one source event",
            ));
        }
        if let Some(c) = self.confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(crate::error::Error::validation(format!(
                    "confidence {c} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// CONFIDENCE SCORING
// ============================================================================

/// Confidence update for one signal
///
/// `conf_new = clamp(conf_old + k·(+1 support | −w contradict), 0, 1)` with
/// `k = 0.05`, `w = 2.0`. Monotone in the net signed count under fixed
/// parameters: each support adds `k`, each contradiction removes `k·w`.
pub fn confidence_score(conf_old: f64, supporting: bool) -> f64 {
    let delta = if supporting {
        REINFORCE_STEP
    } else {
        -REINFORCE_STEP * CONTRADICT_WEIGHT
    };
    (conf_old + delta).clamp(0.0, 1.0)
}

// ============================================================================
// TESTS
// ============================================================================

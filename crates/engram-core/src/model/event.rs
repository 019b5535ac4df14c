//! Event - the atomic unit of experience
//!
//! Events are append-only: created by ingestion, never mutated, deleted only
//! by the retention sweep once sealed. The content hash is the dedup key
//! within a project.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum event content size in bytes (64 KiB)
pub const MAX_EVENT_CONTENT_BYTES: usize = 64 * 1024;

// ============================================================================
// ENUMS
// ============================================================================

/// What kind of experience an event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A tool invocation
    ToolUse,
    /// A file edit
    FileEdit,
    /// A version-control commit
    Commit,
    /// A user or assistant message
    #[default]
    Message,
    /// Engine-internal audit record
    System,
}

impl EventKind {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ToolUse => "tool_use",
            EventKind::FileEdit => "file_edit",
            EventKind::Commit => "commit",
            EventKind::Message => "message",
            EventKind::System => "system",
        }
    }

    /// Parse from a stable name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "tool_use" => Some(EventKind::ToolUse),
            "file_edit" => Some(EventKind::FileEdit),
            "commit" => Some(EventKind::Commit),
            "message" => Some(EventKind::Message),
            "system" => Some(EventKind::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the recorded experience turned out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The action succeeded
    Success,
    /// The action failed
    Failure,
    /// Partially succeeded
    Partial,
    /// Outcome not observable
    #[default]
    Unknown,
}

impl Outcome {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Partial => "partial",
            Outcome::Unknown => "unknown",
        }
    }

    /// Parse from a stable name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Outcome::Success),
            "failure" => Some(Outcome::Failure),
            "partial" => Some(Outcome::Partial),
            "unknown" => Some(Outcome::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Consolidation lifecycle of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationState {
    /// Not yet read by a successful consolidation run
    #[default]
    Unsealed,
    /// Consumed by a consolidation run; eligible for retention
    Sealed,
}

// ============================================================================
// EVENT CONTEXT
// ============================================================================

/// Small-scalar context mapping: cwd, file, session, agent, and free keys
///
/// A `BTreeMap` so iteration order is deterministic; the hasher depends on
/// sorted key order.
pub type EventContext = BTreeMap<String, String>;

// ============================================================================
// EVENT
// ============================================================================

/// A recorded event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Monotone rowid within the project
    pub id: i64,
    /// Owning project
    pub project_id: i64,
    /// Unicode content, at most 64 KiB
    pub content: String,
    /// What kind of experience this is
    pub kind: EventKind,
    /// How it turned out
    pub outcome: Outcome,
    /// Context scalars (cwd, file, session, agent, ...)
    pub context: EventContext,
    /// SHA-256 over the canonical encoding, hex
    pub content_hash: String,
    /// True when an embedding is stored for this event
    pub has_embedding: bool,
    /// Caller-supplied importance in [0, 1]
    pub importance: f64,
    /// Consolidation lifecycle state
    pub consolidation_state: ConsolidationState,
    /// Run that sealed this event, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidation_run_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Mutation counter (events only move unsealed → sealed)
    pub version: i64,
}

/// Input for recording an event
///
/// `deny_unknown_fields` so malformed adapters fail loudly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventInput {
    /// Event content
    pub content: String,
    /// Event kind
    #[serde(default)]
    pub kind: EventKind,
    /// Outcome
    #[serde(default)]
    pub outcome: Outcome,
    /// Context scalars
    #[serde(default)]
    pub context: EventContext,
    /// Importance in [0, 1]; defaults to 0.5
    #[serde(default = "default_importance")]
    pub importance: f64,
    /// Event time; defaults to now
    #[serde(skip_serializing_if = "Option::is_none", alias = "created_at")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_importance() -> f64 {
    0.5
}

impl Default for EventInput {
    fn default() -> Self {
        Self {
            content: String::new(),
            kind: EventKind::default(),
            outcome: Outcome::default(),
            context: EventContext::new(),
            importance: 0.5,
            created_at: None,
        }
    }
}

impl EventInput {
    /// Validate content size and importance bounds
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.content.is_empty() {
            return Err(crate::error::Error::validation("event content is empty"));
        }
        if self.content.len() > MAX_EVENT_CONTENT_BYTES {
            return Err(crate::error::Error::validation(format!(
                "event content is {} bytes, limit is {}",
                self.content.len(),
                MAX_EVENT_CONTENT_BYTES
            )));
        }
        if !(0.0..=1.0).contains(&self.importance) {
            return Err(crate::error::Error::validation(format!(
                "importance {} outside [0, 1]",
                self.importance
            )));
        }
        Ok(())
    }
}

// ============================================================================
// RECORD RESULTS
// ============================================================================

/// Outcome of recording a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome", content = "id")]
pub enum RecordOutcome {
    /// A new row was inserted
    Inserted(i64),
    /// A row with the same content hash already existed
    Duplicate(i64),
}

impl RecordOutcome {
    /// The event id, whether fresh or pre-existing
    pub fn id(&self) -> i64 {
        match self {
            RecordOutcome::Inserted(id) | RecordOutcome::Duplicate(id) => *id,
        }
    }

    /// True when a new row was inserted
    pub fn is_inserted(&self) -> bool {
        matches!(self, RecordOutcome::Inserted(_))
    }
}

/// Report for a batch insert
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Rows inserted
    pub inserted: u32,
    /// Rows skipped as duplicates
    pub duplicates: u32,
    /// Ids for every input, in input order (existing id for duplicates)
    pub ids: Vec<i64>,
    /// Per-input validation failures
    pub errors: Vec<BatchError>,
    /// Events stored without an embedding, flagged for backfill
    pub missing_embeddings: u32,
}

/// A single rejected input within a batch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchError {
    /// Index into the submitted batch
    pub index: usize,
    /// Why the input was rejected
    pub reason: String,
}

// ============================================================================
// FILTERS
// ============================================================================

/// Filter for recalling events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct EventFilter {
    /// Free-text query over content (FTS)
    pub query: Option<String>,
    /// Inclusive lower time bound
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper time bound
    pub until: Option<DateTime<Utc>>,
    /// Restrict to one kind
    pub kind: Option<EventKind>,
    /// Restrict to one outcome
    pub outcome: Option<Outcome>,
    /// Restrict to a session (context key "session")
    pub session: Option<String>,
    /// Exact-match context constraints
    pub context: EventContext,
}

// ============================================================================
// TESTS
// ============================================================================

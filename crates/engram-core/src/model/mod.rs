//! Domain Model
//!
//! The eight-layer data model: events, facts, procedures, tasks, the
//! entity/relation graph, and meta-layer quality records. Every entity
//! carries `(id, project_id, created_at, version)`; ids are monotone i64
//! rowids within (project, table) and timestamps are UTC nanoseconds.

mod event;
mod fact;
mod graph;
mod procedure;
mod quality;
mod task;

pub use event::{
    BatchError, BatchReport, ConsolidationState, Event, EventContext, EventFilter, EventInput,
    EventKind, Outcome, RecordOutcome, MAX_EVENT_CONTENT_BYTES,
};
pub use fact::{
    confidence_score, Fact, FactInput, CONTRADICT_WEIGHT, DEFAULT_BASE_CONFIDENCE, REINFORCE_STEP,
};
pub use graph::{Entity, EntityInput, Relation, RelationInput};
pub use procedure::{
    running_mean, ExecutionRecord, Procedure, ProcedureInput, ProcedureStep, ProcedureVersion,
    ParameterSlot, UNDERPERFORMING_MIN_EXECUTIONS, UNDERPERFORMING_RATE,
};
pub use quality::{
    ExecutionMetric, LayerKind, QualityAlert, QualityRecord, QualitySample, SampleRing,
};
pub use task::{Priority, Task, TaskInput, TaskStatus};

use chrono::{DateTime, TimeZone, Utc};

// ============================================================================
// PAGINATION
// ============================================================================

/// Pagination envelope attached to list results
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Requested page size (after capping)
    pub limit: u32,
    /// Offset into the full result set
    pub offset: u32,
    /// Total rows matching the filter
    pub total_count: u64,
    /// True when rows remain past this page
    pub has_more: bool,
}

impl Page {
    /// Build a page descriptor from a capped limit/offset and a total count
    pub fn new(limit: u32, offset: u32, total_count: u64) -> Self {
        let has_more = (offset as u64 + limit as u64) < total_count;
        Self {
            limit,
            offset,
            total_count,
            has_more,
        }
    }
}

/// A page of rows plus its pagination envelope
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    /// Rows on this page
    pub items: Vec<T>,
    /// Pagination envelope
    pub page: Page,
}

// ============================================================================
// TIMESTAMPS
// ============================================================================

/// Current time as UTC nanoseconds
pub fn now_nanos() -> i64 {
    Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros().saturating_mul(1_000))
}

/// Convert UTC nanoseconds back to a `DateTime<Utc>`
pub fn nanos_to_datetime(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

/// Convert a `DateTime<Utc>` to UTC nanoseconds
pub fn datetime_to_nanos(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_nanos_opt()
        .unwrap_or_else(|| dt.timestamp_micros().saturating_mul(1_000))
}

// ============================================================================
// TESTS
// ============================================================================

//! Procedure - reusable parameterized workflow
//!
//! Steps form a total order; a later step may reference named outputs of
//! earlier steps but never the reverse. Execution stats accumulate as a
//! running mean so `success_rate = successes / execution_count` holds exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Outcome;

/// Executions before the underperforming flag can apply
pub const UNDERPERFORMING_MIN_EXECUTIONS: i64 = 5;

/// Success rate below which a procedure is flagged for review
pub const UNDERPERFORMING_RATE: f64 = 0.4;

// ============================================================================
// STEPS & PARAMETERS
// ============================================================================

/// One step in a procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureStep {
    /// Action name (tool or operation)
    pub action: String,
    /// Parameter template; `{slot}` placeholders and `{step.N.output}`
    /// references to earlier steps
    pub params_template: serde_json::Value,
    /// Preconditions that must hold before this step runs
    #[serde(default)]
    pub required_preconditions: Vec<String>,
}

/// A named parameter slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSlot {
    /// Slot name
    pub name: String,
    /// Expected type tag: string, number, bool, path
    pub slot_type: String,
    /// Whether the slot must be bound
    #[serde(default)]
    pub required: bool,
}

// ============================================================================
// PROCEDURE
// ============================================================================

/// A learned, reusable workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Procedure {
    /// Monotone rowid within the project
    pub id: i64,
    /// Owning project
    pub project_id: i64,
    /// Procedure name
    pub name: String,
    /// Category tag
    pub category: String,
    /// Ordered steps
    pub steps: Vec<ProcedureStep>,
    /// Named parameter slots
    pub parameters: Vec<ParameterSlot>,
    /// successes / execution_count, 0 when never executed
    pub success_rate: f64,
    /// Total recorded executions
    pub execution_count: i64,
    /// Running mean duration
    pub avg_duration_ms: f64,
    /// Events this procedure was learned from
    pub grounding_event_ids: Vec<i64>,
    /// True when flagged for consolidation review
    pub underperforming: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Mutation counter
    pub version: i64,
}

impl Procedure {
    /// Recompute the underperforming flag from current stats
    pub fn is_underperforming(&self) -> bool {
        self.execution_count >= UNDERPERFORMING_MIN_EXECUTIONS
            && self.success_rate < UNDERPERFORMING_RATE
    }
}

/// Input for creating a procedure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProcedureInput {
    /// Procedure name
    pub name: String,
    /// Category tag
    pub category: String,
    /// Ordered steps
    pub steps: Vec<ProcedureStep>,
    /// Named parameter slots
    #[serde(default)]
    pub parameters: Vec<ParameterSlot>,
    /// Events this procedure was learned from
    #[serde(default)]
    pub grounding_event_ids: Vec<i64>,
}

impl ProcedureInput {
    /// Validate the step list: nonempty, and step references only flow forward
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::error::Error::validation("procedure name is empty"));
        }
        if self.steps.is_empty() {
            return Err(crate::error::Error::validation(
                "procedure must have at least one step",
            ));
        }
        // A later step may reference `{step.N.output}` only for N earlier
        // than itself: intra-procedure data flow is acyclic by construction.
        for (idx, step) in self.steps.iter().enumerate() {
            for referenced in step_references(&step.params_template) {
                if referenced >= idx {
                    return Err(crate::error::Error::validation(format!(
                        "step {idx} references output of step {referenced}; \
                         references must point to earlier steps"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Extract `{step.N.output}` references from a params template
fn step_references(template: &serde_json::Value) -> Vec<usize> {
    let mut refs = Vec::new();
    collect_step_refs(template, &mut refs);
    refs
}

fn collect_step_refs(value: &serde_json::Value, out: &mut Vec<usize>) {
    match value {
        serde_json::Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("{step.") {
                let tail = &rest[start + 6..];
                if let Some(end) = tail.find('.') {
                    if let Ok(n) = tail[..end].parse::<usize>() {
                        out.push(n);
                    }
                }
                rest = tail;
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_step_refs(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_step_refs(item, out);
            }
        }
        _ => {}
    }
}

// ============================================================================
// EXECUTION RECORDS & VERSIONS
// ============================================================================

/// One recorded execution of a procedure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Procedure executed
    pub procedure_id: i64,
    /// How it went
    pub outcome: Outcome,
    /// Wall-clock duration
    pub duration_ms: i64,
    /// Bound parameter values
    #[serde(default)]
    pub params: serde_json::Value,
    /// When the execution was recorded
    pub recorded_at: DateTime<Utc>,
}

/// A snapshot of a procedure's definition at some version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureVersion {
    /// Version number, starting at 1
    pub version: i64,
    /// Steps at that version
    pub steps: Vec<ProcedureStep>,
    /// Parameters at that version
    pub parameters: Vec<ParameterSlot>,
    /// When this version was superseded or created
    pub recorded_at: DateTime<Utc>,
}

/// Update a running mean with one more sample
pub fn running_mean(mean: f64, count: i64, sample: f64) -> f64 {
    if count <= 0 {
        sample
    } else {
        mean + (sample - mean) / (count as f64 + 1.0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

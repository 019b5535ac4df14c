//! Task - prospective obligation
//!
//! Tasks form a DAG via `dependencies`; `parent_id` nests subtasks. Status
//! transitions follow a fixed state machine with terminal sinks; a task may
//! run only when every dependency is completed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// STATUS & PRIORITY
// ============================================================================

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be picked up
    #[default]
    Pending,
    /// Parked on an external condition
    Blocked,
    /// In progress
    Running,
    /// Finished successfully (terminal)
    Completed,
    /// Finished unsuccessfully (terminal)
    Failed,
    /// Abandoned (terminal)
    Cancelled,
}

impl TaskStatus {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Parse from a stable name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "blocked" => Some(TaskStatus::Blocked),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// True for completed/failed/cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine permits `self → to`
    ///
    /// pending → blocked | running | cancelled
    /// blocked → pending | cancelled
    /// running → completed | failed | cancelled
    /// terminals are sinks
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(
                to,
                TaskStatus::Blocked | TaskStatus::Running | TaskStatus::Cancelled
            ),
            TaskStatus::Blocked => matches!(to, TaskStatus::Pending | TaskStatus::Cancelled),
            TaskStatus::Running => matches!(
                to,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduling priority; orders ready_tasks descending
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Low,
    /// Default
    #[default]
    Medium,
    /// Important
    High,
    /// Drop everything
    Critical,
}

impl Priority {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    /// Parse from a stable name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }

    /// Numeric rank for SQL ordering (higher = more urgent)
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    /// Inverse of [`Priority::rank`]
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => Priority::Low,
            2 => Priority::High,
            3 => Priority::Critical,
            _ => Priority::Medium,
        }
    }
}

// ============================================================================
// TASK
// ============================================================================

/// A unit of prospective work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Monotone rowid within the project
    pub id: i64,
    /// Owning project
    pub project_id: i64,
    /// What needs to be done
    pub content: String,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Scheduling priority
    pub priority: Priority,
    /// Free-form phase label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Parent task (weak reference; cancelled ancestors keep descendants)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    /// Tasks that must complete before this one can run
    pub dependencies: Vec<i64>,
    /// Estimated effort in minutes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_effort_min: Option<i64>,
    /// Actual effort in minutes, recorded on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_effort_min: Option<i64>,
    /// Optional deadline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Mutation counter; transitions are guarded on this
    pub version: i64,
}

/// Input for creating a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskInput {
    /// What needs to be done
    pub content: String,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
    /// Free-form phase label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Parent task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    /// Dependency task ids
    #[serde(default)]
    pub dependencies: Vec<i64>,
    /// Estimated effort in minutes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_effort_min: Option<i64>,
    /// Optional deadline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskInput {
    /// Validate content and effort bounds
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.content.trim().is_empty() {
            return Err(crate::error::Error::validation("task content is empty"));
        }
        if let Some(effort) = self.estimated_effort_min {
            if effort < 0 {
                return Err(crate::error::Error::validation(
                    "estimated effort must be non-negative",
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_legal_moves() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Blocked));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));

        assert!(Blocked.can_transition_to(Pending));
        assert!(Blocked.can_transition_to(Cancelled));
        assert!(!Blocked.can_transition_to(Running));

        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn test_terminals_are_sinks() {
        use TaskStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for target in [Pending, Blocked, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        for p in [
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Critical,
        ] {
            assert_eq!(Priority::from_rank(p.rank()), p);
            assert_eq!(Priority::parse_name(p.as_str()), Some(p));
        }
    }

    #[test]
    fn test_input_validation() {
        let input = TaskInput {
            content: "  ".to_string(),
            priority: Priority::Medium,
            phase: None,
            parent_id: None,
            dependencies: vec![],
            estimated_effort_min: None,
            deadline: None,
        };
        assert!(input.validate().is_err());

        let input = TaskInput {
            content: "ship release".to_string(),
            estimated_effort_min: Some(-5),
            ..input
        };
        assert!(input.validate().is_err());
    }
}

//! Request Context
//!
//! Every operation receives an explicit `RequestContext` instead of resolving
//! project or session ambiently. The context carries the cancellation flag and
//! deadline that handlers must honor at every suspension point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

// ============================================================================
// CANCELLATION
// ============================================================================

/// Shared cooperative cancellation flag
///
/// Cloning shares the underlying flag. Handlers call [`CancelFlag::check`]
/// at each suspension point; a cancelled handler unwinds via `?` and releases
/// scoped resources on the way out.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// New, un-cancelled flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Err(Cancelled) once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::cancelled("operation cancelled"))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// REQUEST CONTEXT
// ============================================================================

/// Per-operation context: project partition, caller identity, budget
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Project partition every query and mutation is scoped to
    pub project_id: i64,
    /// Calling agent identity, recorded in audit events
    pub agent_id: Option<String>,
    /// Absolute deadline for the whole operation
    pub deadline: Option<Instant>,
    /// Cooperative cancellation flag
    pub cancel: CancelFlag,
}

impl RequestContext {
    /// Context for a project with no deadline
    pub fn new(project_id: i64) -> Self {
        Self {
            project_id,
            agent_id: None,
            deadline: None,
            cancel: CancelFlag::new(),
        }
    }

    /// Attach an agent identity
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the deadline `budget` from now
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.deadline = Some(Instant::now() + budget);
        self
    }

    /// Remaining time before the deadline; `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Err(Cancelled) when the flag is set or the deadline has passed
    ///
    /// Called at every suspension point: DB acquire, embedder/validator call,
    /// coalesced cache miss, advisory-lock acquire.
    pub fn checkpoint(&self) -> Result<()> {
        self.cancel.check()?;
        if let Some(remaining) = self.remaining() {
            if remaining.is_zero() {
                return Err(Error::cancelled("deadline exceeded"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! # Engram Core
//!
//! Local-first cognitive memory engine for long-running AI assistants.
//! Ingests a stream of events (tool invocations, file edits, commits,
//! messages) and maintains a persistently-queryable body of knowledge across
//! tiered layers:
//!
//! - **Episodic**: append-only event log with content-hash deduplication
//! - **Semantic**: fact store with hybrid lexical + vector retrieval
//! - **Procedural**: parameterized workflows with effectiveness stats
//! - **Prospective**: task DAG with dependency-aware scheduling
//! - **Knowledge graph**: entities and relations with community detection
//! - **Meta**: passive quality scoring, saturation tracking, and alerts
//!
//! A dual-process consolidation engine turns clusters of related events into
//! facts, procedures, and graph updates: fast online clustering first, an
//! external validator for uncertain or contradictory candidates second.
//! The kernel binds everything behind a closed operation catalogue with a
//! uniform structured-result envelope.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::{EventInput, Kernel, Operation};
//!
//! let kernel = Kernel::builder("engram.db").build()?;
//! let ctx = kernel.context_for("my-project").await?;
//!
//! // Record an event
//! let result = kernel
//!     .dispatch(&ctx, Operation::RecordEvent {
//!         event: EventInput { content: "cargo test passed".into(), ..Default::default() },
//!     })
//!     .await;
//!
//! // Recall facts
//! let result = kernel
//!     .dispatch(&ctx, Operation::parse("recall", serde_json::json!({
//!         "query": "what do we know about the test suite"
//!     }))?)
//!     .await;
//! ```
//!
//! ## External services
//!
//! Embedding and deep validation are HTTP services behind the [`Embedder`]
//! and [`consolidation::Validator`] traits; `testing` provides deterministic
//! stand-ins so the engine runs fully offline in tests.

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod config;
pub mod consolidation;
pub mod context;
pub mod embed;
pub mod error;
pub mod hash;
pub mod kernel;
pub mod layers;
pub mod model;
pub mod retrieval;
pub mod search;
pub mod storage;
pub mod verify;

/// Deterministic test doubles for the external embedder and validator
pub mod testing;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::EngineConfig;
pub use context::{CancelFlag, RequestContext};
pub use error::{Error, ErrorKind, Result};

// Domain model
pub use model::{
    BatchReport, ConsolidationState, Entity, EntityInput, Event, EventContext, EventFilter,
    EventInput, EventKind, ExecutionMetric, Fact, FactInput, LayerKind, Outcome, Page, Paginated,
    Priority, Procedure, ProcedureInput, ProcedureStep, QualityAlert, QualityRecord,
    QualitySample, RecordOutcome, Relation, RelationInput, Task, TaskInput, TaskStatus,
};

// Embeddings
pub use embed::{cosine_similarity, Embedder, Embedding, EMBEDDING_DIMENSIONS};

// Layers
pub use layers::{
    EpisodicLayer, GraphLayer, MetaLayer, ProceduralLayer, ProspectiveLayer, SemanticLayer,
};

// Consolidation
pub use consolidation::{ConsolidationEngine, RunReport, Strategy, Validator};

// Retrieval
pub use retrieval::{
    CacheStatus, RecallScope, RetrievalOrchestrator, RetrievalStrategy, UnifiedHit, UnifiedResult,
};

// Kernel
pub use kernel::{Kernel, KernelBuilder, Operation, ResultStatus, StructuredResult};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        EngineConfig, Error, ErrorKind, Event, EventInput, EventKind, Fact, FactInput, Kernel,
        Operation, Outcome, Priority, RequestContext, Result, StructuredResult, Task, TaskInput,
        TaskStatus,
    };
}

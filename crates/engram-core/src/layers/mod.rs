//! Memory Layers
//!
//! The tiered layers over the storage engine: episodic events, semantic
//! facts, procedural workflows, prospective tasks, the knowledge graph, and
//! the passive meta observer. Each layer owns its SQL; cross-layer flows
//! (consolidation, unified retrieval) compose them from above.

pub mod episodic;
pub mod graph;
pub mod meta;
pub mod procedural;
pub mod prospective;
pub mod semantic;

pub use episodic::EpisodicLayer;
pub use graph::GraphLayer;
pub use meta::MetaLayer;
pub use procedural::ProceduralLayer;
pub use prospective::ProspectiveLayer;
pub use semantic::{RememberOutcome, SemanticLayer};

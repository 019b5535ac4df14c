//! Search
//!
//! Shared retrieval machinery: the in-memory vector store, FTS5 query
//! handling, and lexical/semantic score fusion. Layers own their SQL; this
//! module owns the scoring math.

mod fts;
mod fusion;
mod vector;

pub use fts::{normalize_bm25, sanitize_fts5_query};
pub use fusion::{fuse, FusedScore, DEFAULT_ALPHA};
pub use vector::{Collection, VectorIndex, VectorStore};

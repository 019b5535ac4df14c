//! Embeddings
//!
//! Vector generation is an external HTTP service; this module holds the
//! `Embedding` value type, similarity math, and the `Embedder` trait the
//! rest of the engine programs against. The production implementation is
//! [`client::HttpEmbedder`]; tests substitute deterministic stubs.

mod client;

pub use client::{HttpEmbedder, TokenBucket};

use crate::error::Result;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Embedding dimensionality the engine stores and indexes
pub const EMBEDDING_DIMENSIONS: usize = 768;

/// Maximum texts per embed_batch call
pub const MAX_BATCH: usize = 32;

/// Maximum text length submitted for embedding (bytes, truncated beyond)
pub const MAX_TEXT_LENGTH: usize = 8192;

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A semantic embedding vector
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The vector
    pub vector: Vec<f32>,
}

impl Embedding {
    /// Wrap a vector
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector }
    }

    /// Dimensionality
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    /// Cosine similarity with another embedding; 0.0 on dimension mismatch
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.vector, &other.vector)
    }

    /// L2-normalize in place
    pub fn normalize(&mut self) {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut self.vector {
                *x /= norm;
            }
        }
    }

    /// Little-endian f32 byte encoding for BLOB storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Decode from BLOB bytes; None when the length is not a multiple of 4
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }
}

// ============================================================================
// EMBEDDER TRAIT
// ============================================================================

/// Batched vector generation
///
/// Implementations suspend on network I/O; callers tolerate latency on the
/// order of tens to hundreds of milliseconds per batch. Returns
/// `ErrorKind::Degraded` when all endpoints are exhausted; callers accept
/// null embeddings rather than block ingestion.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Embed up to [`MAX_BATCH`] texts; the result has the same length and order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Cheap availability probe; false means callers should skip embedding
    fn is_available(&self) -> bool {
        true
    }
}

// ============================================================================
// SIMILARITY FUNCTIONS
// ============================================================================

/// Cosine similarity between two vectors; 0.0 on mismatch or zero norm
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot / denominator
    } else {
        0.0
    }
}

/// Average multiple vectors into an L2-normalized centroid
pub fn centroid(vectors: &[Vec<f32>]) -> Vec<f32> {
    if vectors.is_empty() {
        return vec![];
    }
    let dim = vectors[0].len();
    let count = vectors.len() as f32;
    let mut out = vec![0.0f32; dim];
    for v in vectors {
        for (i, val) in v.iter().enumerate() {
            if i < dim {
                out[i] += val;
            }
        }
    }
    for val in &mut out {
        *val /= count;
    }
    let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in &mut out {
            *val /= norm;
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

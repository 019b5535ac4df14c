//! Vector Index
//!
//! HNSW approximate-nearest-neighbor search over embeddings (USearch, cosine
//! metric). The index lives in memory and is rebuilt from persisted
//! embeddings at startup; keys are `{project}:{rowid}` strings mapped to
//! internal u64 ids.

use std::collections::HashMap;
use std::sync::Mutex;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::embed::EMBEDDING_DIMENSIONS;
use crate::error::{lock_poisoned, Error, Result};

/// HNSW connectivity parameter (higher = better recall, more memory)
const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
const DEFAULT_EXPANSION_SEARCH: usize = 64;

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// A single HNSW index with string-keyed entries
pub struct VectorIndex {
    index: Index,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl VectorIndex {
    /// Create an empty index over [`EMBEDDING_DIMENSIONS`]-dim vectors
    pub fn new() -> Result<Self> {
        let options = IndexOptions {
            dimensions: EMBEDDING_DIMENSIONS,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
            multi: false,
        };
        let index = Index::new(&options)
            .map_err(|e| Error::internal(format!("vector index creation failed: {e}")))?;
        Ok(Self {
            index,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    /// Number of stored vectors
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// True when no vectors stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace the vector for a key
    pub fn add(&mut self, key: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != EMBEDDING_DIMENSIONS {
            return Err(Error::validation(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                EMBEDDING_DIMENSIONS
            )));
        }

        if let Some(&existing_id) = self.key_to_id.get(key) {
            self.index
                .remove(existing_id)
                .map_err(|e| Error::internal(format!("vector remove failed: {e}")))?;
            self.reserve_for(self.index.size() + 1)?;
            self.index
                .add(existing_id, vector)
                .map_err(|e| Error::internal(format!("vector add failed: {e}")))?;
            return Ok(());
        }

        // usearch requires reserved capacity before add
        self.reserve_for(self.index.size() + 1)?;

        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, vector)
            .map_err(|e| Error::internal(format!("vector add failed: {e}")))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    /// Remove a key; Ok(false) when absent
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            self.index
                .remove(id)
                .map_err(|e| Error::internal(format!("vector remove failed: {e}")))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// True when the key is indexed
    pub fn contains(&self, key: &str) -> bool {
        self.key_to_id.contains_key(key)
    }

    /// Nearest neighbors as (key, cosine similarity), best first
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != EMBEDDING_DIMENSIONS {
            return Err(Error::validation(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                EMBEDDING_DIMENSIONS
            )));
        }
        if self.is_empty() {
            return Ok(vec![]);
        }

        let matches = self
            .index
            .search(query, limit)
            .map_err(|e| Error::internal(format!("vector search failed: {e}")))?;

        let mut results = Vec::with_capacity(matches.keys.len());
        for (id, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(key) = self.id_to_key.get(id) {
                // Cosine distance → similarity
                results.push((key.clone(), 1.0 - distance));
            }
        }
        Ok(results)
    }

    /// Search with a minimum similarity cutoff
    pub fn search_with_threshold(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, f32)>> {
        Ok(self
            .search(query, limit)?
            .into_iter()
            .filter(|(_, score)| *score >= min_similarity)
            .collect())
    }

    fn reserve_for(&self, wanted: usize) -> Result<()> {
        let capacity = self.index.capacity();
        if wanted > capacity {
            let new_capacity = std::cmp::max(capacity * 2, std::cmp::max(wanted, 16));
            self.index
                .reserve(new_capacity)
                .map_err(|e| Error::internal(format!("vector reserve failed: {e}")))?;
        }
        Ok(())
    }
}

// ============================================================================
// COLLECTIONS
// ============================================================================

/// Which per-layer index a vector belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Event content embeddings
    Events,
    /// Fact statement embeddings
    Facts,
    /// Procedure name+category embeddings
    Procedures,
}

/// The engine's shared vector store: one index per collection
///
/// Interior mutability so layers share one instance behind `Arc`.
pub struct VectorStore {
    events: Mutex<VectorIndex>,
    facts: Mutex<VectorIndex>,
    procedures: Mutex<VectorIndex>,
}

impl VectorStore {
    /// Create empty indexes for every collection
    pub fn new() -> Result<Self> {
        Ok(Self {
            events: Mutex::new(VectorIndex::new()?),
            facts: Mutex::new(VectorIndex::new()?),
            procedures: Mutex::new(VectorIndex::new()?),
        })
    }

    fn index(&self, collection: Collection) -> &Mutex<VectorIndex> {
        match collection {
            Collection::Events => &self.events,
            Collection::Facts => &self.facts,
            Collection::Procedures => &self.procedures,
        }
    }

    /// Key for a (project, rowid) pair
    pub fn key(project_id: i64, row_id: i64) -> String {
        format!("{project_id}:{row_id}")
    }

    /// Parse a key back to (project, rowid)
    pub fn parse_key(key: &str) -> Option<(i64, i64)> {
        let (project, row) = key.split_once(':')?;
        Some((project.parse().ok()?, row.parse().ok()?))
    }

    /// Insert or replace a vector
    pub fn add(
        &self,
        collection: Collection,
        project_id: i64,
        row_id: i64,
        vector: &[f32],
    ) -> Result<()> {
        self.index(collection)
            .lock()
            .map_err(lock_poisoned)?
            .add(&Self::key(project_id, row_id), vector)
    }

    /// Remove a vector; Ok(false) when absent
    pub fn remove(&self, collection: Collection, project_id: i64, row_id: i64) -> Result<bool> {
        self.index(collection)
            .lock()
            .map_err(lock_poisoned)?
            .remove(&Self::key(project_id, row_id))
    }

    /// Nearest rows within one project as (row_id, similarity), best first
    ///
    /// Over-fetches to compensate for cross-project neighbors, then filters.
    pub fn search(
        &self,
        collection: Collection,
        project_id: i64,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(i64, f32)>> {
        let index = self.index(collection).lock().map_err(lock_poisoned)?;
        let raw = index.search_with_threshold(query, limit.saturating_mul(4).max(limit), min_similarity)?;
        Ok(raw
            .into_iter()
            .filter_map(|(key, score)| {
                let (p, row) = Self::parse_key(&key)?;
                (p == project_id).then_some((row, score))
            })
            .take(limit)
            .collect())
    }

    /// Vector count in one collection
    pub fn len(&self, collection: Collection) -> usize {
        self.index(collection).lock().map(|i| i.len()).unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Retrieval Orchestrator
//!
//! Unified recall across the memory layers: strategy selection, query
//! expansion, parallel fan-out, score-normalized fusion, and a single-flight
//! TTL cache in front of it all. Reads may be up to TTL stale; mutating
//! operations invalidate by project prefix.

pub mod cache;
mod expand;

pub use cache::{CacheStatus, RetrievalCache};
pub use expand::{classify_intent, expand_query, hypothetical_document, QueryIntent};

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::config::CacheConfig;
use crate::context::RequestContext;
use crate::embed::{centroid, Embedder, Embedding};
use crate::error::Result;
use crate::layers::{EpisodicLayer, GraphLayer, MetaLayer, ProceduralLayer, SemanticLayer};
use crate::model::{Fact, Page, Paginated};
use crate::search::DEFAULT_ALPHA;

/// Query embeddings cached to avoid re-embedding repeated queries
const QUERY_CACHE_SIZE: usize = 100;

// ============================================================================
// STRATEGY
// ============================================================================

/// How a query is turned into an embedding target
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Embed the query as-is
    Direct,
    /// Embed the centroid of template-expanded variants
    QueryExpansion,
    /// Embed a short hypothetical answer
    HypotheticalDocument,
    /// Enrich the query with graph neighborhoods of named entities
    GraphAssisted,
}

impl RetrievalStrategy {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Direct => "direct",
            RetrievalStrategy::QueryExpansion => "query_expansion",
            RetrievalStrategy::HypotheticalDocument => "hypothetical_document",
            RetrievalStrategy::GraphAssisted => "graph_assisted",
        }
    }

    /// Parse from a stable name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(RetrievalStrategy::Direct),
            "query_expansion" => Some(RetrievalStrategy::QueryExpansion),
            "hypothetical_document" => Some(RetrievalStrategy::HypotheticalDocument),
            "graph_assisted" => Some(RetrievalStrategy::GraphAssisted),
            _ => None,
        }
    }
}

/// Which layers a unified recall touches
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallScope {
    /// Facts, events, procedures, and entities
    #[default]
    All,
    /// Only the named layers
    Layers(Vec<String>),
}

impl RecallScope {
    fn includes(&self, layer: &str) -> bool {
        match self {
            RecallScope::All => true,
            RecallScope::Layers(layers) => layers.iter().any(|l| l == layer),
        }
    }

    fn cache_tag(&self) -> String {
        match self {
            RecallScope::All => "all".to_string(),
            RecallScope::Layers(layers) => layers.join("+"),
        }
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// One merged hit from a unified recall
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedHit {
    /// Source layer: facts, events, procedures, entities
    pub layer: String,
    /// Row id within the layer
    pub id: i64,
    /// Normalized score
    pub score: f32,
    /// Serialized row
    pub payload: serde_json::Value,
}

/// A unified recall's merged outcome
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedResult {
    /// Hits merged across layers, best first
    pub hits: Vec<UnifiedHit>,
    /// Strategy used for the embedding target
    pub strategy: String,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// Fan-out retrieval over the memory layers
pub struct RetrievalOrchestrator {
    episodic: Arc<EpisodicLayer>,
    semantic: Arc<SemanticLayer>,
    procedural: Arc<ProceduralLayer>,
    graph: Arc<GraphLayer>,
    meta: Arc<MetaLayer>,
    embedder: Arc<dyn Embedder>,
    cache: RetrievalCache,
    cache_config: CacheConfig,
    query_cache: Mutex<LruCache<String, Embedding>>,
}

impl RetrievalOrchestrator {
    /// Build the orchestrator over the layer handles
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        episodic: Arc<EpisodicLayer>,
        semantic: Arc<SemanticLayer>,
        procedural: Arc<ProceduralLayer>,
        graph: Arc<GraphLayer>,
        meta: Arc<MetaLayer>,
        embedder: Arc<dyn Embedder>,
        cache_config: CacheConfig,
    ) -> Self {
        let cache = RetrievalCache::new(
            cache_config.size,
            std::time::Duration::from_secs(cache_config.ttl_sec),
        );
        Self {
            episodic,
            semantic,
            procedural,
            graph,
            meta,
            embedder,
            cache,
            cache_config,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("capacity is non-zero"),
            )),
        }
    }

    // ========================================================================
    // EMBEDDING
    // ========================================================================

    /// Embed one text, consulting the query LRU first
    pub async fn embed_query(&self, text: &str) -> Option<Embedding> {
        if let Ok(mut cached) = self.query_cache.lock() {
            if let Some(embedding) = cached.get(text) {
                return Some(embedding.clone());
            }
        }
        if !self.embedder.is_available() {
            return None;
        }
        match self.embedder.embed_batch(&[text.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                let embedding = vectors.remove(0);
                if let Ok(mut cached) = self.query_cache.lock() {
                    cached.put(text.to_string(), embedding.clone());
                }
                Some(embedding)
            }
            _ => None,
        }
    }

    /// Embedding target for a strategy
    async fn strategy_embedding(
        &self,
        ctx: &RequestContext,
        query: &str,
        strategy: RetrievalStrategy,
    ) -> Result<(Option<Embedding>, String)> {
        match strategy {
            RetrievalStrategy::Direct => Ok((self.embed_query(query).await, query.to_string())),
            RetrievalStrategy::QueryExpansion => {
                let variants = expand_query(query);
                let mut vectors = Vec::with_capacity(variants.len());
                for variant in &variants {
                    if let Some(embedding) = self.embed_query(variant).await {
                        vectors.push(embedding.vector);
                    }
                }
                let embedding = if vectors.len() > 1 {
                    Some(Embedding::new(centroid(&vectors)))
                } else {
                    self.embed_query(query).await
                };
                Ok((embedding, query.to_string()))
            }
            RetrievalStrategy::HypotheticalDocument => {
                let doc = hypothetical_document(query);
                Ok((self.embed_query(&doc).await, query.to_string()))
            }
            RetrievalStrategy::GraphAssisted => {
                let entities = self.graph.entities_in_text(ctx, query, 5).await?;
                let mut enriched = query.to_string();
                for entity in &entities {
                    for neighbor in self.graph.neighbors(ctx, entity.id, None, 1).await? {
                        enriched.push(' ');
                        enriched.push_str(&neighbor.name);
                    }
                }
                Ok((self.embed_query(&enriched).await, enriched))
            }
        }
    }

    // ========================================================================
    // FACT RECALL
    // ========================================================================

    /// Paginated hybrid fact recall, cached
    #[allow(clippy::too_many_arguments)]
    pub async fn recall_facts(
        &self,
        ctx: &RequestContext,
        query: &str,
        domain: Option<&str>,
        limit: usize,
        offset: usize,
        include_low_confidence: bool,
    ) -> Result<(Paginated<serde_json::Value>, CacheStatus)> {
        ctx.checkpoint()?;
        let limit = limit.clamp(1, crate::layers::semantic::MAX_RECALL_LIMIT);
        let key = format!(
            "facts:{}:{}|{}|{}|{}|{}",
            ctx.project_id,
            query,
            domain.unwrap_or(""),
            limit,
            offset,
            include_low_confidence,
        );
        let ttl = Some(self.cache_config_ttl("facts"));

        let (value, status) = self
            .cache
            .get_or_build(&key, ttl, || async {
                let embedding = self.embed_query(query).await;
                // One row past the page so has_more can be decided; the
                // layer's own cap bounds how deep pagination can reach.
                let fetch = limit + offset + 1;
                let results = self
                    .semantic
                    .recall(
                        ctx,
                        query,
                        embedding.as_ref(),
                        domain,
                        fetch,
                        include_low_confidence,
                        DEFAULT_ALPHA,
                    )
                    .await?;

                let scores: Vec<f64> = results.iter().map(|(_, s)| f64::from(*s)).collect();
                let fact_ids: Vec<i64> = results.iter().map(|(f, _)| f.id).collect();
                let mean_score = if scores.is_empty() {
                    0.0
                } else {
                    scores.iter().sum::<f64>() / scores.len() as f64
                };
                self.meta.observe_retrieval(ctx.project_id, mean_score, &fact_ids);

                let total = results.len() as u64;
                let page: Vec<serde_json::Value> = results
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .map(|(fact, score)| fact_with_score(&fact, score))
                    .collect();
                Ok(serde_json::json!({
                    "items": page,
                    "total": total,
                }))
            })
            .await?;

        let items: Vec<serde_json::Value> = value["items"].as_array().cloned().unwrap_or_default();
        let total = value["total"].as_u64().unwrap_or(items.len() as u64);
        Ok((
            Paginated {
                items,
                page: Page::new(limit as u32, offset as u32, total),
            },
            status,
        ))
    }

    // ========================================================================
    // UNIFIED RECALL
    // ========================================================================

    /// Fan out to every in-scope layer and merge by normalized score
    pub async fn recall_unified(
        &self,
        ctx: &RequestContext,
        query: &str,
        scope: RecallScope,
        limit: usize,
    ) -> Result<(UnifiedResult, CacheStatus)> {
        self.recall_with_strategy(ctx, query, scope, limit, RetrievalStrategy::Direct)
            .await
    }

    /// Unified recall with the strategy chosen by a decision tree
    ///
    /// Short identifier-like queries go direct; queries naming known graph
    /// entities go graph-assisted; conceptual questions go through the
    /// hypothetical document; everything else expands.
    pub async fn smart_retrieve(
        &self,
        ctx: &RequestContext,
        query: &str,
        strategy: Option<RetrievalStrategy>,
        limit: usize,
    ) -> Result<(UnifiedResult, CacheStatus)> {
        let strategy = match strategy {
            Some(strategy) => strategy,
            None => self.choose_strategy(ctx, query).await?,
        };
        self.recall_with_strategy(ctx, query, RecallScope::All, limit, strategy)
            .await
    }

    async fn choose_strategy(
        &self,
        ctx: &RequestContext,
        query: &str,
    ) -> Result<RetrievalStrategy> {
        // Recent identical request in cache: re-use the direct path so the
        // fingerprint matches and the cache can answer.
        let direct_key = unified_key(ctx.project_id, query, &RecallScope::All, RetrievalStrategy::Direct);
        if self.cache.peek(&direct_key)?.is_some() {
            return Ok(RetrievalStrategy::Direct);
        }

        let named_entities = self.graph.entities_in_text(ctx, query, 1).await?;
        if !named_entities.is_empty() {
            return Ok(RetrievalStrategy::GraphAssisted);
        }

        let words = query.split_whitespace().count();
        Ok(match classify_intent(query) {
            QueryIntent::Technical => RetrievalStrategy::Direct,
            QueryIntent::HowTo | QueryIntent::Reasoning => {
                RetrievalStrategy::HypotheticalDocument
            }
            _ if words <= 2 => RetrievalStrategy::Direct,
            _ => RetrievalStrategy::QueryExpansion,
        })
    }

    async fn recall_with_strategy(
        &self,
        ctx: &RequestContext,
        query: &str,
        scope: RecallScope,
        limit: usize,
        strategy: RetrievalStrategy,
    ) -> Result<(UnifiedResult, CacheStatus)> {
        ctx.checkpoint()?;
        let limit = limit.clamp(1, 100);
        let key = unified_key(ctx.project_id, query, &scope, strategy);
        let ttl = Some(self.cache_config_ttl("unified"));

        let (value, status) = self
            .cache
            .get_or_build(&key, ttl, || async {
                let (embedding, effective_query) =
                    self.strategy_embedding(ctx, query, strategy).await?;
                let hits = self
                    .fan_out(ctx, &effective_query, embedding.as_ref(), &scope, limit)
                    .await?;
                serde_json::to_value(UnifiedResult {
                    hits,
                    strategy: strategy.as_str().to_string(),
                })
                .map_err(Into::into)
            })
            .await?;

        let result: UnifiedResult = serde_json::from_value(value)?;
        Ok((result, status))
    }

    async fn fan_out(
        &self,
        ctx: &RequestContext,
        query: &str,
        embedding: Option<&Embedding>,
        scope: &RecallScope,
        limit: usize,
    ) -> Result<Vec<UnifiedHit>> {
        let facts_fut = async {
            if !scope.includes("facts") {
                return Ok(Vec::new());
            }
            let results = self
                .semantic
                .recall(ctx, query, embedding, None, limit, false, DEFAULT_ALPHA)
                .await?;
            Ok::<_, crate::error::Error>(
                results
                    .into_iter()
                    .map(|(fact, score)| UnifiedHit {
                        layer: "facts".to_string(),
                        id: fact.id,
                        score,
                        payload: fact_with_score(&fact, score),
                    })
                    .collect(),
            )
        };
        let events_fut = async {
            if !scope.includes("events") {
                return Ok(Vec::new());
            }
            let results = self.episodic.search(ctx, query, embedding, limit).await?;
            Ok::<_, crate::error::Error>(
                results
                    .into_iter()
                    .map(|(event, score)| UnifiedHit {
                        layer: "events".to_string(),
                        id: event.id,
                        score,
                        payload: serde_json::to_value(&event).unwrap_or_default(),
                    })
                    .collect(),
            )
        };
        let procedures_fut = async {
            if !scope.includes("procedures") {
                return Ok(Vec::new());
            }
            let results = self
                .procedural
                .find_procedures(ctx, query, embedding, None, limit)
                .await?;
            Ok::<_, crate::error::Error>(
                results
                    .into_iter()
                    .map(|(procedure, score)| UnifiedHit {
                        layer: "procedures".to_string(),
                        id: procedure.id,
                        score: score as f32,
                        payload: serde_json::to_value(&procedure).unwrap_or_default(),
                    })
                    .collect(),
            )
        };
        let entities_fut = async {
            if !scope.includes("entities") {
                return Ok(Vec::new());
            }
            let results = self.graph.entities_in_text(ctx, query, limit).await?;
            Ok::<_, crate::error::Error>(
                results
                    .into_iter()
                    .map(|entity| UnifiedHit {
                        layer: "entities".to_string(),
                        id: entity.id,
                        // Exact name containment is a strong signal
                        score: 0.8,
                        payload: serde_json::to_value(&entity).unwrap_or_default(),
                    })
                    .collect(),
            )
        };

        let (facts, events, procedures, entities) =
            tokio::try_join!(facts_fut, events_fut, procedures_fut, entities_fut)?;

        // Dedup by id within each layer, then merge and rank
        let mut merged: Vec<UnifiedHit> = Vec::new();
        for hits in [facts, events, procedures, entities] {
            let mut seen: std::collections::HashSet<i64> = std::collections::HashSet::new();
            for hit in hits {
                if seen.insert(hit.id) {
                    merged.push(hit);
                }
            }
        }
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.layer.cmp(&b.layer))
                .then_with(|| a.id.cmp(&b.id))
        });
        merged.truncate(limit);

        // Meta observation: mean score plus the facts the working set touched
        let fact_ids: Vec<i64> = merged
            .iter()
            .filter(|h| h.layer == "facts")
            .map(|h| h.id)
            .collect();
        let mean = if merged.is_empty() {
            0.0
        } else {
            merged.iter().map(|h| f64::from(h.score)).sum::<f64>() / merged.len() as f64
        };
        self.meta.observe_retrieval(ctx.project_id, mean, &fact_ids);

        Ok(merged)
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Invalidate every cached result for a project (called on writes)
    pub fn invalidate_project(&self, project_id: i64) {
        for prefix in ["facts", "unified"] {
            let _ = self.cache.invalidate_prefix(&format!("{prefix}:{project_id}:"));
        }
    }

    fn cache_config_ttl(&self, layer: &str) -> std::time::Duration {
        let secs = self
            .cache_config
            .layer_ttl_sec
            .get(layer)
            .copied()
            .unwrap_or(self.cache_config.ttl_sec);
        std::time::Duration::from_secs(secs)
    }
}

fn unified_key(
    project_id: i64,
    query: &str,
    scope: &RecallScope,
    strategy: RetrievalStrategy,
) -> String {
    format!(
        "unified:{project_id}:{}|{}|{}",
        query,
        scope.cache_tag(),
        strategy.as_str()
    )
}

fn fact_with_score(fact: &Fact, score: f32) -> serde_json::Value {
    let mut value = serde_json::to_value(fact).unwrap_or_default();
    if let Some(object) = value.as_object_mut() {
        object.insert("score".to_string(), serde_json::json!(score));
    }
    value
}

// ============================================================================
// TESTS
// ============================================================================

//! Engine Configuration
//!
//! Every recognized option with its default. Loaded from a TOML file merged
//! over defaults; unknown keys are rejected so typos surface at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// SUB-CONFIGS
// ============================================================================

/// Storage engine and connection pool options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct StorageConfig {
    /// Minimum pooled connections kept open
    pub pool_min: usize,
    /// Maximum pooled connections
    pub pool_max: usize,
    /// Pool acquisition timeout in milliseconds
    pub acquire_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pool_min: 2,
            pool_max: 10,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Embedder client options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct EmbedderConfig {
    /// Primary endpoint URL
    pub endpoint: String,
    /// Secondary endpoint tried after repeated primary failure
    pub fallback_endpoint: Option<String>,
    /// Token-bucket refill rate, requests per second
    pub rate_limit_rps: u32,
    /// Per-call deadline in milliseconds
    pub timeout_ms: u64,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8900/embed".to_string(),
            fallback_endpoint: None,
            rate_limit_rps: 100,
            timeout_ms: 30_000,
        }
    }
}

/// Deep-validator (LLM) client options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ValidatorConfig {
    /// Endpoint URL
    pub endpoint: String,
    /// Per-call deadline in milliseconds
    pub timeout_ms: u64,
    /// When false, consolidation never escalates to the validator
    pub enabled: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8901/validate".to_string(),
            timeout_ms: 10_000,
            enabled: true,
        }
    }
}

/// Consolidation scheduling and clustering options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ConsolidationConfig {
    /// Hours between scheduled runs
    pub interval_hours: u64,
    /// Default strategy name: balanced, speed, quality, minimal
    pub strategy: String,
    /// Cosine similarity threshold for joining a cluster
    pub cluster_similarity: f32,
    /// Events read per selection batch
    pub batch_size: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            strategy: "balanced".to_string(),
            cluster_similarity: 0.75,
            batch_size: 500,
        }
    }
}

/// Retrieval result cache options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct CacheConfig {
    /// Maximum cached entries
    pub size: usize,
    /// Default time-to-live in seconds
    pub ttl_sec: u64,
    /// Per-layer TTL overrides (seconds), keyed by layer name
    pub layer_ttl_sec: std::collections::BTreeMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 5_000,
            ttl_sec: 300,
            layer_ttl_sec: std::collections::BTreeMap::new(),
        }
    }
}

/// Ingestion queue and dedup options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct IngestConfig {
    /// Bounded in-process queue capacity; overflow drops oldest
    pub queue_capacity: usize,
    /// Size of the recent-hash LRU used for fast dedup
    pub dedup_lru_size: usize,
    /// Maximum events per transaction
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            dedup_lru_size: 5_000,
            batch_size: 500,
        }
    }
}

/// Retention policy (sealed events only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct RetentionConfig {
    /// Maximum event age in days before a sealed, uncited event is removed
    pub event_max_age_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            event_max_age_days: 365,
        }
    }
}

/// Kernel scheduling options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct KernelConfig {
    /// Worker threads for request handlers; 0 = CPU count
    pub worker_threads: usize,
    /// Overall per-handler budget in milliseconds
    pub handler_budget_ms: u64,
    /// Seconds between meta-layer quality samples
    pub meta_cadence_sec: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            handler_budget_ms: 60_000,
            meta_cadence_sec: 60,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Storage engine and pool
    pub storage: StorageConfig,
    /// Embedder client
    pub embedder: EmbedderConfig,
    /// Deep validator client
    pub validator: ValidatorConfig,
    /// Consolidation engine
    pub consolidation: ConsolidationConfig,
    /// Retrieval cache
    pub cache: CacheConfig,
    /// Ingestion pipeline
    pub ingest: IngestConfig,
    /// Retention policy
    pub retention: RetentionConfig,
    /// Kernel scheduling
    pub kernel: KernelConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file, merged over defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::validation(format!("config parse error: {e}")))
    }

    /// Worker thread count with the CPU-count default applied
    pub fn effective_worker_threads(&self) -> usize {
        if self.kernel.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.kernel.worker_threads
        }
    }

    /// TTL for a named layer, falling back to the default TTL
    pub fn cache_ttl_for(&self, layer: &str) -> std::time::Duration {
        let secs = self
            .cache
            .layer_ttl_sec
            .get(layer)
            .copied()
            .unwrap_or(self.cache.ttl_sec);
        std::time::Duration::from_secs(secs)
    }
}

// ============================================================================
// TESTS
// ============================================================================

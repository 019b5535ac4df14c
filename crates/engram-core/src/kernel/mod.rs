//! Kernel
//!
//! The assembled engine: component handles wired by an explicit builder (no
//! registry, no globals), the operation router, the bounded ingest queue,
//! and the background worker that runs consolidation and meta sampling on a
//! dedicated low-priority executor so queries never queue behind them.

pub mod ingest;
pub mod ops;

pub use ingest::{IngestQueue, QueuedEvent};
pub use ops::{ErrorBody, Operation, ResultMetrics, ResultStatus, StructuredResult};

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::consolidation::{ConsolidationEngine, HttpValidator, Validator};
use crate::context::RequestContext;
use crate::embed::{Embedder, Embedding, HttpEmbedder};
use crate::error::Result;
use crate::layers::{
    EpisodicLayer, GraphLayer, MetaLayer, ProceduralLayer, ProspectiveLayer, SemanticLayer,
};
use crate::model::{EventInput, LayerKind, QualityAlert};
use crate::retrieval::RetrievalOrchestrator;
use crate::search::{Collection, VectorStore};
use crate::storage::Pool;
use crate::verify::Gateway;

// ============================================================================
// KERNEL
// ============================================================================

/// The assembled memory engine
pub struct Kernel {
    config: EngineConfig,
    pool: Pool,
    episodic: Arc<EpisodicLayer>,
    semantic: Arc<SemanticLayer>,
    procedural: Arc<ProceduralLayer>,
    prospective: Arc<ProspectiveLayer>,
    graph: Arc<GraphLayer>,
    meta: Arc<MetaLayer>,
    engine: Arc<ConsolidationEngine>,
    orchestrator: Arc<RetrievalOrchestrator>,
    gateway: Arc<Gateway>,
    ingest_queue: Arc<IngestQueue>,
    background: Mutex<Option<BackgroundWorker>>,
}

impl Kernel {
    /// Start building a kernel over a database path
    pub fn builder(db_path: impl Into<PathBuf>) -> KernelBuilder {
        KernelBuilder {
            db_path: db_path.into(),
            config: EngineConfig::default(),
            embedder: None,
            validator: None,
        }
    }

    // ========================================================================
    // HANDLES
    // ========================================================================

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Episodic layer
    pub fn episodic(&self) -> &Arc<EpisodicLayer> {
        &self.episodic
    }

    /// Semantic layer
    pub fn semantic(&self) -> &Arc<SemanticLayer> {
        &self.semantic
    }

    /// Procedural layer
    pub fn procedural(&self) -> &Arc<ProceduralLayer> {
        &self.procedural
    }

    /// Prospective layer
    pub fn prospective(&self) -> &Arc<ProspectiveLayer> {
        &self.prospective
    }

    /// Knowledge graph layer
    pub fn graph(&self) -> &Arc<GraphLayer> {
        &self.graph
    }

    /// Meta layer
    pub fn meta(&self) -> &Arc<MetaLayer> {
        &self.meta
    }

    /// Consolidation engine
    pub fn engine(&self) -> &Arc<ConsolidationEngine> {
        &self.engine
    }

    /// Retrieval orchestrator
    pub fn orchestrator(&self) -> &Arc<RetrievalOrchestrator> {
        &self.orchestrator
    }

    /// Verification gateway
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Ingest queue
    pub fn ingest_queue(&self) -> &Arc<IngestQueue> {
        &self.ingest_queue
    }

    // ========================================================================
    // CONTEXTS & PROJECTS
    // ========================================================================

    /// Request context for a project name, with the default handler budget
    pub async fn context_for(&self, project: &str) -> Result<RequestContext> {
        let conn = self.pool.acquire().await?;
        let project_id = crate::storage::resolve_project(&conn, project)?;
        Ok(RequestContext::new(project_id)
            .with_budget(Duration::from_millis(self.config.kernel.handler_budget_ms)))
    }

    /// All known project ids
    pub async fn project_ids(&self) -> Result<Vec<i64>> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare("SELECT id FROM projects ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    /// Enqueue an event for background insertion
    ///
    /// Overflow drops the oldest queued event and raises a meta alert; the
    /// producer never blocks.
    pub fn enqueue_event(&self, project_id: i64, input: EventInput) {
        if self.ingest_queue.enqueue(project_id, input) {
            self.meta.raise_alert(QualityAlert {
                code: "ingest_overflow".to_string(),
                layer: Some(LayerKind::Episodic),
                detail: format!(
                    "ingest queue overflowed; {} events dropped so far",
                    self.ingest_queue.dropped()
                ),
                since: chrono::Utc::now(),
            });
        }
    }

    /// Drain the ingest queue into the episodic layer
    pub async fn flush_ingest(&self) -> Result<u64> {
        let mut written = 0u64;
        loop {
            let drained = self.ingest_queue.drain_now(self.config.ingest.batch_size);
            if drained.is_empty() {
                return Ok(written);
            }
            // Batches are per-project transactions
            let mut by_project: std::collections::BTreeMap<i64, Vec<EventInput>> =
                std::collections::BTreeMap::new();
            for queued in drained {
                by_project.entry(queued.project_id).or_default().push(queued.input);
            }
            for (project_id, inputs) in by_project {
                let ctx = RequestContext::new(project_id);
                let report = self.episodic.record_batch(&ctx, inputs).await?;
                written += u64::from(report.inserted);
            }
        }
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// One maintenance pass for a project: sample quality, backfill missing
    /// embeddings, archive dormant facts, apply retention
    pub async fn maintenance(&self, ctx: &RequestContext) -> Result<()> {
        self.meta.sample(ctx).await?;
        let backfilled = self.episodic.backfill_embeddings(ctx, 256).await?;
        if backfilled > 0 {
            self.meta.clear_alert("embedder_degraded");
        }
        self.semantic.archive_dormant(ctx).await?;
        self.episodic.retention_sweep(ctx, &self.config.retention).await?;
        Ok(())
    }

    // ========================================================================
    // BACKGROUND WORKER
    // ========================================================================

    /// Start the background worker thread
    ///
    /// The worker owns a single-threaded runtime on its own OS thread: the
    /// ingest drain, the meta cadence, and scheduled consolidation run there
    /// and never contend with request handlers.
    pub fn start_background(self: &Arc<Self>) {
        let mut slot = match self.background.lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if slot.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let weak = Arc::downgrade(self);
        let thread = std::thread::Builder::new()
            .name("engram-background".to_string())
            .spawn(move || background_loop(weak, shutdown_rx))
            .ok();
        if let Some(thread) = thread {
            *slot = Some(BackgroundWorker {
                shutdown_tx,
                thread: Some(thread),
            });
        }
    }

    /// Stop the background worker and wait for it to exit
    pub fn shutdown(&self) {
        if let Ok(mut slot) = self.background.lock() {
            if let Some(mut worker) = slot.take() {
                let _ = worker.shutdown_tx.send(true);
                if let Some(thread) = worker.thread.take() {
                    // The worker's own final Arc drop can land here; joining
                    // the current thread would never return.
                    if thread.thread().id() != std::thread::current().id() {
                        let _ = thread.join();
                    }
                }
            }
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct BackgroundWorker {
    shutdown_tx: watch::Sender<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// The background thread body: one current-thread runtime driving ingest,
/// meta cadence, and scheduled consolidation
fn background_loop(kernel: Weak<Kernel>, mut shutdown: watch::Receiver<bool>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "background runtime failed to start");
            return;
        }
    };

    runtime.block_on(async move {
        let (cadence, consolidation_interval) = {
            let Some(kernel) = kernel.upgrade() else { return };
            (
                Duration::from_secs(kernel.config.kernel.meta_cadence_sec),
                Duration::from_secs(kernel.config.consolidation.interval_hours * 3600),
            )
        };

        let mut meta_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + cadence,
            cadence,
        );
        let mut consolidation_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + consolidation_interval,
            consolidation_interval,
        );

        loop {
            let Some(kernel) = kernel.upgrade() else { break };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = kernel.ingest_queue.wait_nonempty() => {
                    if let Err(e) = kernel.flush_ingest().await {
                        tracing::warn!(error = %e, "background ingest flush failed");
                    }
                }
                _ = meta_tick.tick() => {
                    if let Ok(projects) = kernel.project_ids().await {
                        for project_id in projects {
                            let ctx = RequestContext::new(project_id);
                            if let Err(e) = kernel.maintenance(&ctx).await {
                                tracing::warn!(project_id, error = %e, "maintenance pass failed");
                            }
                        }
                    }
                }
                _ = consolidation_tick.tick() => {
                    if let Ok(projects) = kernel.project_ids().await {
                        for project_id in projects {
                            let ctx = RequestContext::new(project_id);
                            match kernel.engine.run_default(&ctx).await {
                                Ok(report) if !report.warnings.is_empty() => {
                                    for warning in &report.warnings {
                                        tracing::warn!(project_id, warning = %warning, "consolidation warning");
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::warn!(project_id, error = %e, "scheduled consolidation failed");
                                }
                            }
                        }
                    }
                }
            }
            // Kernel dropped between iterations ends the loop via upgrade()
        }
    });
}

// ============================================================================
// BUILDER
// ============================================================================

/// Explicit kernel assembly; replaces any ambient registry
pub struct KernelBuilder {
    db_path: PathBuf,
    config: EngineConfig,
    embedder: Option<Arc<dyn Embedder>>,
    validator: Option<Arc<dyn Validator>>,
}

impl KernelBuilder {
    /// Replace the default configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Substitute the embedder (tests use deterministic stubs)
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Substitute the validator
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Open storage, run migrations, load vector indexes, and wire the layers
    pub fn build(self) -> Result<Arc<Kernel>> {
        let pool = crate::storage::open(&self.db_path, &self.config.storage)?;
        let vectors = Arc::new(VectorStore::new()?);
        load_vectors(&pool, &vectors)?;

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => Arc::new(HttpEmbedder::new(&self.config.embedder)?),
        };
        let validator: Arc<dyn Validator> = match self.validator {
            Some(validator) => validator,
            None => Arc::new(HttpValidator::new(&self.config.validator)?),
        };

        let episodic = Arc::new(EpisodicLayer::new(
            pool.clone(),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            &self.config.ingest,
        ));
        let semantic = Arc::new(SemanticLayer::new(
            pool.clone(),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
        ));
        let procedural = Arc::new(ProceduralLayer::new(
            pool.clone(),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
        ));
        let prospective = Arc::new(ProspectiveLayer::new(pool.clone(), Arc::clone(&episodic)));
        let graph = Arc::new(GraphLayer::new(pool.clone()));
        let meta = Arc::new(MetaLayer::new(
            pool.clone(),
            Arc::clone(&episodic),
            Arc::clone(&semantic),
            Arc::clone(&graph),
            self.config.kernel.meta_cadence_sec,
        ));
        let engine = Arc::new(ConsolidationEngine::new(
            pool.clone(),
            Arc::clone(&episodic),
            Arc::clone(&semantic),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            validator,
            self.config.consolidation.clone(),
            Duration::from_millis(self.config.validator.timeout_ms),
        ));
        let orchestrator = Arc::new(RetrievalOrchestrator::new(
            Arc::clone(&episodic),
            Arc::clone(&semantic),
            Arc::clone(&procedural),
            Arc::clone(&graph),
            Arc::clone(&meta),
            Arc::clone(&embedder),
            self.config.cache.clone(),
        ));
        let gateway = Arc::new(Gateway::new(Arc::clone(&semantic), Arc::clone(&vectors)));
        let ingest_queue = Arc::new(IngestQueue::new(self.config.ingest.queue_capacity));

        Ok(Arc::new(Kernel {
            config: self.config,
            pool,
            episodic,
            semantic,
            procedural,
            prospective,
            graph,
            meta,
            engine,
            orchestrator,
            gateway,
            ingest_queue,
            background: Mutex::new(None),
        }))
    }
}

/// Rebuild the in-memory vector indexes from persisted embeddings
fn load_vectors(pool: &Pool, vectors: &VectorStore) -> Result<()> {
    let conn = pool.acquire_blocking()?;
    let sources: [(&str, Collection); 3] = [
        (
            "SELECT e.project_id, emb.event_id, emb.embedding
             FROM event_embeddings emb JOIN events e ON e.id = emb.event_id",
            Collection::Events,
        ),
        (
            "SELECT f.project_id, emb.fact_id, emb.embedding
             FROM fact_embeddings emb JOIN facts f ON f.id = emb.fact_id
             WHERE f.archived = 0",
            Collection::Facts,
        ),
        (
            "SELECT p.project_id, emb.procedure_id, emb.embedding
             FROM procedure_embeddings emb JOIN procedures p ON p.id = emb.procedure_id",
            Collection::Procedures,
        ),
    ];

    for (sql, collection) in sources {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        for row in rows {
            let (project_id, row_id, blob) = row?;
            if let Some(embedding) = Embedding::from_bytes(&blob) {
                if let Err(e) = vectors.add(collection, project_id, row_id, &embedding.vector) {
                    tracing::warn!(row_id, error = %e, "vector load failed");
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

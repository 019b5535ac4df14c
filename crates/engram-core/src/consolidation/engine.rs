//! Consolidation Engine
//!
//! Dual-process transformation of episodic events into semantic, procedural,
//! and graph knowledge. System 1 is online centroid clustering; System 2 is
//! an external validator consulted for uncertain or contradictory candidates.
//! A run is keyed by its fingerprint, holds the advisory lock for its whole
//! lifetime, and persists everything it produced in a single transaction that
//! also seals the contributing events.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::config::ConsolidationConfig;
use crate::consolidation::cluster::{cluster_events, Cluster};
use crate::consolidation::fingerprint::{fingerprint, RunLockTable};
use crate::consolidation::validator::{ValidationRequest, Validator, Verdict, VerdictDecision};
use crate::context::RequestContext;
use crate::embed::{Embedder, Embedding, MAX_BATCH};
use crate::error::{Error, ErrorKind, Result};
use crate::layers::{EpisodicLayer, SemanticLayer};
use crate::model::{
    datetime_to_nanos, now_nanos, Event, EventKind, ProcedureStep, REINFORCE_STEP,
};
use crate::search::{Collection, VectorStore};
use crate::storage::Pool;
use crate::verify::{gates, is_negation, MINIMALITY_SIMILARITY};

/// Uncertainty above which System 2 is consulted
const DEEP_VALIDATION_UNCERTAINTY: f64 = 0.5;

/// Confidence multiplier applied when the validator is unreachable
const VALIDATOR_FALLBACK_FACTOR: f64 = 0.7;

/// Consecutive validator failures that disable System 2 for the run
const VALIDATOR_FAILURE_LIMIT: u32 = 3;

/// Fact statements are truncated to this many bytes
const MAX_PROPOSED_STATEMENT: usize = 300;

// ============================================================================
// STRATEGY
// ============================================================================

/// Consolidation strategy, selecting clustering and validation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Default trade-off
    #[default]
    Balanced,
    /// Fewer clusters, no deep validation
    Speed,
    /// More clusters, every candidate deep-validated
    Quality,
    /// Small batches, tight thresholds, heuristics only
    Minimal,
}

impl Strategy {
    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Balanced => "balanced",
            Strategy::Speed => "speed",
            Strategy::Quality => "quality",
            Strategy::Minimal => "minimal",
        }
    }

    /// Parse from a stable name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "balanced" => Some(Strategy::Balanced),
            "speed" => Some(Strategy::Speed),
            "quality" => Some(Strategy::Quality),
            "minimal" => Some(Strategy::Minimal),
            _ => None,
        }
    }

    /// Parameter set for this strategy; `base_threshold` comes from config
    pub fn params(&self, base_threshold: f32, base_batch: usize) -> StrategyParams {
        match self {
            Strategy::Balanced => StrategyParams {
                max_clusters: 64,
                similarity_threshold: base_threshold,
                deep_validation: true,
                validate_all: false,
                batch_size: base_batch,
                min_cluster_size: 2,
                min_procedure_events: 3,
            },
            Strategy::Speed => StrategyParams {
                max_clusters: 32,
                similarity_threshold: (base_threshold - 0.05).max(0.5),
                deep_validation: false,
                validate_all: false,
                batch_size: base_batch.min(250),
                min_cluster_size: 2,
                min_procedure_events: 3,
            },
            Strategy::Quality => StrategyParams {
                max_clusters: 128,
                similarity_threshold: (base_threshold + 0.05).min(0.95),
                deep_validation: true,
                validate_all: true,
                batch_size: base_batch,
                min_cluster_size: 2,
                min_procedure_events: 3,
            },
            Strategy::Minimal => StrategyParams {
                max_clusters: 16,
                similarity_threshold: (base_threshold + 0.10).min(0.95),
                deep_validation: false,
                validate_all: false,
                batch_size: base_batch.min(100),
                min_cluster_size: 3,
                min_procedure_events: 3,
            },
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolved strategy parameters
#[derive(Debug, Clone)]
pub struct StrategyParams {
    /// Cluster count bound
    pub max_clusters: usize,
    /// Cosine threshold for joining a cluster
    pub similarity_threshold: f32,
    /// Whether System 2 runs at all
    pub deep_validation: bool,
    /// Validate every candidate, not just uncertain ones
    pub validate_all: bool,
    /// Events read per selection
    pub batch_size: usize,
    /// Members a cluster needs before proposing a fact
    pub min_cluster_size: usize,
    /// tool_use events a cluster needs before proposing a procedure
    pub min_procedure_events: usize,
}

// ============================================================================
// RUN REPORT
// ============================================================================

/// Metrics and outcome of one consolidation run
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    /// Run identity (UUID)
    pub run_id: String,
    /// Run fingerprint
    pub fingerprint: String,
    /// Strategy used
    pub strategy: String,
    /// Events selected from the window
    pub events_in: u64,
    /// Clusters formed
    pub clusters: u64,
    /// New facts persisted
    pub facts_created: u64,
    /// Existing facts reinforced
    pub facts_reinforced: u64,
    /// New procedures persisted
    pub procedures_created: u64,
    /// Entities inserted or merged
    pub entities_updated: u64,
    /// Relations inserted or merged
    pub relations_updated: u64,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Validator invocations attempted
    pub llm_calls: u64,
    /// Validator invocations that failed or timed out
    pub llm_failures: u64,
    /// True when another run held the fingerprint; nothing was done
    pub coalesced: bool,
    /// True when the run was deferred (embedder unavailable)
    pub deferred: bool,
    /// Non-fatal issues observed during the run
    pub warnings: Vec<String>,
}

// ============================================================================
// CANDIDATES
// ============================================================================

#[derive(Debug, Clone)]
struct FactCandidate {
    statement: String,
    domain: String,
    source_event_ids: Vec<i64>,
    cluster_size: usize,
    confidence: f64,
    uncertainty: f64,
    samples: Vec<String>,
    conflicting_statement: Option<String>,
    embedding: Option<Embedding>,
}

#[derive(Debug, Clone)]
struct ProcedureCandidate {
    name: String,
    category: String,
    steps: Vec<ProcedureStep>,
    grounding_event_ids: Vec<i64>,
    cluster_size: usize,
    uncertainty: f64,
    samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntityRef {
    name: String,
    kind: String,
}

#[derive(Debug, Clone)]
struct RelationCandidate {
    from: EntityRef,
    to: EntityRef,
    kind: String,
    weight: f64,
    evidence_event_id: i64,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The consolidation engine
pub struct ConsolidationEngine {
    pool: Pool,
    episodic: Arc<EpisodicLayer>,
    semantic: Arc<SemanticLayer>,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    validator: Arc<dyn Validator>,
    locks: RunLockTable,
    config: ConsolidationConfig,
    validator_timeout: Duration,
}

impl ConsolidationEngine {
    /// Build the engine over shared handles
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Pool,
        episodic: Arc<EpisodicLayer>,
        semantic: Arc<SemanticLayer>,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        validator: Arc<dyn Validator>,
        config: ConsolidationConfig,
        validator_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            episodic,
            semantic,
            vectors,
            embedder,
            validator,
            locks: RunLockTable::new(),
            config,
            validator_timeout,
        }
    }

    /// Run consolidation over the default window (the configured interval
    /// ending now) with the configured strategy
    pub async fn run_default(&self, ctx: &RequestContext) -> Result<RunReport> {
        let end = Utc::now();
        let start = end - chrono::Duration::hours(self.config.interval_hours as i64);
        let strategy = Strategy::parse_name(&self.config.strategy).unwrap_or_default();
        self.run(ctx, start, end, strategy).await
    }

    /// Run one consolidation pass over a window
    pub async fn run(
        &self,
        ctx: &RequestContext,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        strategy: Strategy,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let start_nanos = datetime_to_nanos(window_start);
        let end_nanos = datetime_to_nanos(window_end);
        let fp = fingerprint(ctx.project_id, start_nanos, end_nanos, strategy);

        let mut report = RunReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            fingerprint: fp.clone(),
            strategy: strategy.as_str().to_string(),
            ..Default::default()
        };

        // At-most-one run per fingerprint; duplicate triggers coalesce onto
        // the active run by observing the held lock.
        let _guard = match self.locks.acquire(&fp) {
            Ok(guard) => guard,
            Err(e) if e.kind == ErrorKind::Conflict => {
                report.coalesced = true;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        ctx.checkpoint()?;
        let params = strategy.params(self.config.cluster_similarity, self.config.batch_size);

        // 1. Selection: unsealed events in the window, time ordered
        let selected = self
            .episodic
            .unsealed_in_window(ctx, start_nanos, end_nanos, params.batch_size)
            .await?;
        report.events_in = selected.len() as u64;
        if selected.is_empty() {
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        // Embedder unavailable with unembedded events in the window: defer
        let needs_embedding = selected.iter().filter(|(_, e)| e.is_none()).count();
        let mut selected = selected;
        if needs_embedding > 0 {
            if !self.embedder.is_available() {
                report.deferred = true;
                report
                    .warnings
                    .push(format!("{needs_embedding} events lack embeddings and the embedder is unavailable; run deferred"));
                report.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(report);
            }
            self.fill_missing_embeddings(ctx, &mut selected, &mut report).await?;
        }

        ctx.checkpoint()?;

        // 2. System 1: online clustering over embeddings
        let events_with_vectors: Vec<(Event, Option<Vec<f32>>)> = selected
            .into_iter()
            .map(|(event, embedding)| (event, embedding.map(|e| e.vector)))
            .collect();
        let clustering = cluster_events(
            events_with_vectors,
            params.similarity_threshold,
            params.max_clusters,
        );
        report.clusters = clustering.clusters.len() as u64;
        if clustering.skipped > 0 {
            report
                .warnings
                .push(format!("{} events skipped without embeddings", clustering.skipped));
        }

        // 3. Pattern proposal
        let high_confidence = self
            .semantic
            .high_confidence_facts(ctx, gates::CONSISTENCY_FLOOR, 200)
            .await?;
        let mut fact_candidates: Vec<FactCandidate> = Vec::new();
        let mut procedure_candidates: Vec<ProcedureCandidate> = Vec::new();
        let mut entities: HashSet<EntityRef> = HashSet::new();
        let mut relations: Vec<RelationCandidate> = Vec::new();

        for cluster in &clustering.clusters {
            ctx.checkpoint()?;
            if cluster.len() >= params.min_cluster_size {
                if let Some(candidate) = propose_fact(cluster, &high_confidence) {
                    fact_candidates.push(candidate);
                }
            }
            if let Some(candidate) = propose_procedure(cluster, params.min_procedure_events) {
                procedure_candidates.push(candidate);
            }
            propose_graph_updates(cluster, &mut entities, &mut relations);
        }

        // 4. System 2: deep validation for uncertain or contradictory candidates
        let mut system2_disabled = !params.deep_validation || !self.validator.is_enabled();
        let mut consecutive_failures = 0u32;
        let mut validated: Vec<FactCandidate> = Vec::new();
        for mut candidate in fact_candidates {
            ctx.checkpoint()?;
            let needs_deep = params.validate_all
                || candidate.uncertainty > DEEP_VALIDATION_UNCERTAINTY
                || candidate.conflicting_statement.is_some();
            if needs_deep && !system2_disabled {
                report.llm_calls += 1;
                match self.deep_validate(&candidate).await {
                    Ok(Verdict {
                        decision: VerdictDecision::Confirm,
                        confidence,
                    }) => {
                        consecutive_failures = 0;
                        candidate.confidence = candidate.confidence.max(confidence);
                    }
                    Ok(Verdict {
                        decision: VerdictDecision::Refute,
                        ..
                    }) => {
                        consecutive_failures = 0;
                        continue;
                    }
                    Ok(Verdict {
                        decision: VerdictDecision::Refine(text),
                        confidence,
                    }) => {
                        consecutive_failures = 0;
                        candidate.statement = truncate_statement(&text);
                        candidate.confidence = confidence;
                        candidate.embedding = None;
                    }
                    Err(e) => {
                        report.llm_failures += 1;
                        consecutive_failures += 1;
                        candidate.confidence *= VALIDATOR_FALLBACK_FACTOR;
                        tracing::warn!(error = %e, "validator call failed; keeping heuristic decision");
                        if consecutive_failures >= VALIDATOR_FAILURE_LIMIT {
                            system2_disabled = true;
                            report.warnings.push(
                                "validator consistently failing; deep validation disabled for this run"
                                    .to_string(),
                            );
                        }
                    }
                }
            } else if needs_deep {
                // System 2 requested but unavailable: keep System 1 decision
                // at reduced confidence.
                candidate.confidence *= VALIDATOR_FALLBACK_FACTOR;
            }
            validated.push(candidate);
        }

        // Contradictory candidate pairs: prefer the better-evidenced one;
        // ties keep both as alternatives at half confidence.
        let mut fact_candidates = resolve_contradictions(validated, &mut report);

        // 5. Grounding and quality gates, for every artifact kind
        self.embed_candidates(&mut fact_candidates).await;
        fact_candidates.retain(|candidate| {
            let grounding =
                gates::grounding_gate(candidate.source_event_ids.len(), candidate.cluster_size);
            if grounding.outcome.is_fatal() {
                report.warnings.push("fact candidate dropped: no grounding".to_string());
                return false;
            }
            true
        });
        procedure_candidates.retain(|candidate| {
            let grounding = gates::grounding_gate(
                candidate.grounding_event_ids.len(),
                candidate.cluster_size,
            );
            if grounding.outcome.is_fatal() {
                report
                    .warnings
                    .push("procedure candidate dropped: no grounding".to_string());
                return false;
            }
            true
        });
        // A relation's evidence must be an event this run actually read
        let selected_ids: HashSet<i64> = clustering
            .clusters
            .iter()
            .flat_map(|cluster| cluster.events.iter().map(|event| event.id))
            .collect();
        relations.retain(|candidate| {
            let cited = usize::from(selected_ids.contains(&candidate.evidence_event_id));
            let grounding = gates::grounding_gate(cited, 1);
            if grounding.outcome.is_fatal() {
                report
                    .warnings
                    .push("relation candidate dropped: no grounding".to_string());
                return false;
            }
            true
        });
        let mut kept: Vec<FactCandidate> = Vec::new();
        for mut candidate in fact_candidates {
            candidate.confidence = candidate.confidence.clamp(0.0, 1.0);
            if let Some(embedding) = &candidate.embedding {
                let near = self
                    .vectors
                    .search(Collection::Facts, ctx.project_id, &embedding.vector, 1, 0.0)
                    .ok()
                    .and_then(|hits| hits.into_iter().next());
                if let Some((existing_id, similarity)) = near {
                    if similarity > MINIMALITY_SIMILARITY {
                        if let Ok(existing) = self.semantic.get_fact(ctx, existing_id).await {
                            if existing.statement != candidate.statement {
                                report.warnings.push(format!(
                                    "candidate dropped as near-duplicate of fact {existing_id}"
                                ));
                                continue;
                            }
                        }
                    }
                }
            }
            kept.push(candidate);
        }

        ctx.checkpoint()?;

        // 6. Persist everything in a single transaction and seal sources
        let run_id = report.run_id.clone();
        let persisted = self
            .persist(ctx, &run_id, &fp, strategy, start_nanos, end_nanos, &kept,
                     &procedure_candidates, &entities, &relations, started, &mut report)
            .await?;

        // Post-commit: vector index additions
        for (fact_id, embedding) in persisted {
            if let Err(e) =
                self.vectors
                    .add(Collection::Facts, ctx.project_id, fact_id, &embedding.vector)
            {
                tracing::warn!(fact_id, error = %e, "vector index add failed");
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            run_id = %report.run_id,
            events_in = report.events_in,
            clusters = report.clusters,
            facts_created = report.facts_created,
            facts_reinforced = report.facts_reinforced,
            procedures_created = report.procedures_created,
            "consolidation run complete"
        );
        Ok(report)
    }

    /// Embed events the batch stored without vectors (in memory only)
    async fn fill_missing_embeddings(
        &self,
        ctx: &RequestContext,
        selected: &mut [(Event, Option<Embedding>)],
        report: &mut RunReport,
    ) -> Result<()> {
        let missing: Vec<usize> = selected
            .iter()
            .enumerate()
            .filter_map(|(idx, (_, e))| e.is_none().then_some(idx))
            .collect();
        for chunk in missing.chunks(MAX_BATCH) {
            ctx.checkpoint()?;
            let texts: Vec<String> = chunk
                .iter()
                .map(|&idx| selected[idx].0.content.clone())
                .collect();
            match self.embedder.embed_batch(&texts).await {
                Ok(vectors) => {
                    for (&idx, vector) in chunk.iter().zip(vectors) {
                        selected[idx].1 = Some(vector);
                    }
                }
                Err(e) => {
                    report
                        .warnings
                        .push(format!("embedding during selection failed: {e}"));
                    break;
                }
            }
        }
        Ok(())
    }

    /// One validator call under the configured deadline
    async fn deep_validate(&self, candidate: &FactCandidate) -> Result<Verdict> {
        let request = ValidationRequest {
            candidate_kind: "fact".to_string(),
            proposal: candidate.statement.clone(),
            cluster_samples: candidate.samples.clone(),
            conflicting_statement: candidate.conflicting_statement.clone(),
        };
        match tokio::time::timeout(self.validator_timeout, self.validator.validate(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::cancelled("validator deadline exceeded")),
        }
    }

    /// Embed candidate statements that lost or never had an embedding
    async fn embed_candidates(&self, candidates: &mut [FactCandidate]) {
        if !self.embedder.is_available() {
            return;
        }
        let missing: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| c.embedding.is_none().then_some(idx))
            .collect();
        for chunk in missing.chunks(MAX_BATCH) {
            let texts: Vec<String> = chunk
                .iter()
                .map(|&idx| candidates[idx].statement.clone())
                .collect();
            match self.embedder.embed_batch(&texts).await {
                Ok(vectors) => {
                    for (&idx, vector) in chunk.iter().zip(vectors) {
                        candidates[idx].embedding = Some(vector);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "candidate embedding failed");
                    break;
                }
            }
        }
    }

    /// Step 6: one transaction for all artifacts, sealing, and the report row
    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &self,
        ctx: &RequestContext,
        run_id: &str,
        fp: &str,
        strategy: Strategy,
        window_start: i64,
        window_end: i64,
        facts: &[FactCandidate],
        procedures: &[ProcedureCandidate],
        entities: &HashSet<EntityRef>,
        relations: &[RelationCandidate],
        started: Instant,
        report: &mut RunReport,
    ) -> Result<Vec<(i64, Embedding)>> {
        let now = now_nanos();
        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;
        let mut new_fact_embeddings: Vec<(i64, Embedding)> = Vec::new();
        let mut sealed: HashSet<i64> = HashSet::new();

        for candidate in facts {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM facts WHERE project_id = ?1 AND domain = ?2 AND statement = ?3",
                    params![ctx.project_id, candidate.domain, candidate.statement],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            match existing {
                Some(fact_id) => {
                    tx.execute(
                        "UPDATE facts SET support_count = support_count + 1,
                           confidence = MIN(1.0, confidence + ?2),
                           last_reinforced_at = ?3, version = version + 1
                         WHERE id = ?1",
                        params![fact_id, REINFORCE_STEP, now],
                    )?;
                    for event_id in &candidate.source_event_ids {
                        tx.execute(
                            "INSERT OR IGNORE INTO fact_sources (fact_id, event_id) VALUES (?1, ?2)",
                            params![fact_id, event_id],
                        )?;
                    }
                    report.facts_reinforced += 1;
                }
                None => {
                    tx.execute(
                        "INSERT INTO facts
                         (project_id, statement, domain, confidence, support_count,
                          contradiction_count, last_reinforced_at, created_at)
                         VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?5)",
                        params![
                            ctx.project_id,
                            candidate.statement,
                            candidate.domain,
                            candidate.confidence,
                            now
                        ],
                    )?;
                    let fact_id = tx.last_insert_rowid();
                    for event_id in &candidate.source_event_ids {
                        tx.execute(
                            "INSERT OR IGNORE INTO fact_sources (fact_id, event_id) VALUES (?1, ?2)",
                            params![fact_id, event_id],
                        )?;
                    }
                    if let Some(embedding) = &candidate.embedding {
                        tx.execute(
                            "INSERT INTO fact_embeddings (fact_id, embedding, dimensions, created_at)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![
                                fact_id,
                                embedding.to_bytes(),
                                embedding.dimensions() as i64,
                                now
                            ],
                        )?;
                        new_fact_embeddings.push((fact_id, embedding.clone()));
                    }
                    report.facts_created += 1;
                }
            }
            sealed.extend(candidate.source_event_ids.iter().copied());
        }

        for candidate in procedures {
            let steps_json = serde_json::to_string(&candidate.steps)?;
            let grounding_json = serde_json::to_string(&candidate.grounding_event_ids)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO procedures
                 (project_id, name, category, steps, parameters, grounding_event_ids, created_at)
                 VALUES (?1, ?2, ?3, ?4, '[]', ?5, ?6)",
                params![
                    ctx.project_id,
                    candidate.name,
                    candidate.category,
                    steps_json,
                    grounding_json,
                    now
                ],
            )?;
            if inserted > 0 {
                let procedure_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO procedure_versions
                     (procedure_id, version, steps, parameters, recorded_at)
                     VALUES (?1, 1, ?2, '[]', ?3)",
                    params![procedure_id, steps_json, now],
                )?;
                report.procedures_created += 1;
                sealed.extend(candidate.grounding_event_ids.iter().copied());
            }
        }

        let mut entity_ids: HashMap<EntityRef, i64> = HashMap::new();
        for entity in entities {
            tx.execute(
                "INSERT OR IGNORE INTO entities (project_id, name, kind, properties, created_at)
                 VALUES (?1, ?2, ?3, '{}', ?4)",
                params![ctx.project_id, entity.name, entity.kind, now],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM entities WHERE project_id = ?1 AND name = ?2 AND kind = ?3",
                params![ctx.project_id, entity.name, entity.kind],
                |row| row.get(0),
            )?;
            entity_ids.insert(entity.clone(), id);
            report.entities_updated += 1;
        }

        for relation in relations {
            let (Some(&from_id), Some(&to_id)) =
                (entity_ids.get(&relation.from), entity_ids.get(&relation.to))
            else {
                continue;
            };
            let existing: Option<(i64, f64)> = tx
                .query_row(
                    "SELECT id, weight FROM relations
                     WHERE project_id = ?1 AND from_id = ?2 AND to_id = ?3 AND kind = ?4",
                    params![ctx.project_id, from_id, to_id, relation.kind],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            let relation_id = match existing {
                Some((id, weight)) => {
                    tx.execute(
                        "UPDATE relations SET weight = ?2, version = version + 1 WHERE id = ?1",
                        params![id, (weight + relation.weight) / 2.0],
                    )?;
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO relations (project_id, from_id, to_id, kind, weight, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            ctx.project_id,
                            from_id,
                            to_id,
                            relation.kind,
                            relation.weight,
                            now
                        ],
                    )?;
                    tx.last_insert_rowid()
                }
            };
            tx.execute(
                "INSERT OR IGNORE INTO relation_evidence (relation_id, event_id) VALUES (?1, ?2)",
                params![relation_id, relation.evidence_event_id],
            )?;
            sealed.insert(relation.evidence_event_id);
            report.relations_updated += 1;
        }

        // Seal the contributing events under this run's identity
        for event_id in &sealed {
            tx.execute(
                "UPDATE events SET consolidation_state = 'sealed', consolidation_run_id = ?2,
                   version = version + 1
                 WHERE id = ?1 AND project_id = ?3 AND consolidation_state = 'unsealed'",
                params![event_id, run_id, ctx.project_id],
            )?;
        }

        tx.execute(
            "INSERT INTO consolidation_runs
             (id, project_id, fingerprint, strategy, window_start, window_end, events_in,
              clusters, facts_created, facts_reinforced, procedures_created, duration_ms,
              llm_calls, llm_failures, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                run_id,
                ctx.project_id,
                fp,
                strategy.as_str(),
                window_start,
                window_end,
                report.events_in as i64,
                report.clusters as i64,
                report.facts_created as i64,
                report.facts_reinforced as i64,
                report.procedures_created as i64,
                started.elapsed().as_millis() as i64,
                report.llm_calls as i64,
                report.llm_failures as i64,
                now,
            ],
        )?;

        tx.commit()?;
        Ok(new_fact_embeddings)
    }
}

// ============================================================================
// PROPOSAL HELPERS
// ============================================================================

/// Propose a fact summarizing a cluster's recurrent content
fn propose_fact(cluster: &Cluster, high_confidence: &[crate::model::Fact]) -> Option<FactCandidate> {
    let medoid = cluster
        .events
        .iter()
        .max_by(|a, b| {
            medoid_score(cluster, a)
                .partial_cmp(&medoid_score(cluster, b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.id.cmp(&a.id))
        })?;

    let statement = truncate_statement(&normalize_whitespace(&medoid.content));
    if statement.is_empty() {
        return None;
    }
    let uncertainty = cluster.uncertainty();
    let confidence = (0.6 + 0.3 * (1.0 - uncertainty)).clamp(0.5, 0.9);
    let conflicting_statement = high_confidence
        .iter()
        .find(|fact| is_negation(&statement, &fact.statement))
        .map(|fact| fact.statement.clone());

    Some(FactCandidate {
        statement,
        domain: infer_domain(&cluster.events),
        source_event_ids: cluster.events.iter().map(|e| e.id).collect(),
        cluster_size: cluster.len(),
        confidence,
        uncertainty,
        samples: cluster
            .events
            .iter()
            .take(5)
            .map(|e| truncate_statement(&e.content))
            .collect(),
        conflicting_statement,
        embedding: None,
    })
}

/// Without per-member embeddings retained, medoid selection approximates
/// closeness to the centroid by how typical the content length is.
fn medoid_score(cluster: &Cluster, event: &Event) -> f64 {
    let mean_len: f64 =
        cluster.events.iter().map(|e| e.content.len() as f64).sum::<f64>() / cluster.len() as f64;
    -((event.content.len() as f64 - mean_len).abs())
}

/// Propose a procedure when the cluster repeats a tool sequence
fn propose_procedure(cluster: &Cluster, min_events: usize) -> Option<ProcedureCandidate> {
    let tool_events: Vec<&Event> = cluster
        .events
        .iter()
        .filter(|e| e.kind == EventKind::ToolUse)
        .collect();
    if tool_events.len() < min_events {
        return None;
    }

    let actions: Vec<String> = tool_events.iter().map(|e| action_name(e)).collect();
    let unit = repeating_unit(&actions)?;

    let steps: Vec<ProcedureStep> = unit
        .iter()
        .map(|action| ProcedureStep {
            action: action.clone(),
            params_template: serde_json::json!({}),
            required_preconditions: vec![],
        })
        .collect();

    Some(ProcedureCandidate {
        name: unit.join(" then "),
        category: infer_domain(&cluster.events),
        steps,
        grounding_event_ids: tool_events.iter().map(|e| e.id).collect(),
        cluster_size: cluster.len(),
        uncertainty: cluster.uncertainty(),
        samples: tool_events
            .iter()
            .take(5)
            .map(|e| truncate_statement(&e.content))
            .collect(),
    })
}

/// Action label for a tool_use event: explicit context key, else first token
fn action_name(event: &Event) -> String {
    if let Some(tool) = event.context.get("tool") {
        return tool.to_lowercase();
    }
    event
        .content
        .split_whitespace()
        .next()
        .unwrap_or("unknown")
        .to_lowercase()
}

/// Smallest unit the action list is a whole-number repetition of
///
/// `[a, b, a, b]` yields `[a, b]`; a list with no repetition yields None.
fn repeating_unit(actions: &[String]) -> Option<Vec<String>> {
    let len = actions.len();
    for period in 1..=len / 2 {
        if len % period != 0 {
            continue;
        }
        if (period..len).all(|i| actions[i] == actions[i % period]) {
            return Some(actions[..period].to_vec());
        }
    }
    None
}

/// Entity and relation updates from referenced context names
fn propose_graph_updates(
    cluster: &Cluster,
    entities: &mut HashSet<EntityRef>,
    relations: &mut Vec<RelationCandidate>,
) {
    for event in &cluster.events {
        let file = event.context.get("file").map(|f| EntityRef {
            name: f.clone(),
            kind: "file".to_string(),
        });
        let tool = (event.kind == EventKind::ToolUse).then(|| EntityRef {
            name: action_name(event),
            kind: "tool".to_string(),
        });
        if let Some(file) = &file {
            entities.insert(file.clone());
        }
        if let Some(tool) = &tool {
            entities.insert(tool.clone());
        }
        if let (Some(file), Some(tool)) = (file, tool) {
            relations.push(RelationCandidate {
                from: tool,
                to: file,
                kind: "touches".to_string(),
                weight: 0.6,
                evidence_event_id: event.id,
            });
        }
    }
}

/// Contradictory candidate pairs: more events wins; ties keep both at half
/// confidence as stored alternatives
fn resolve_contradictions(
    candidates: Vec<FactCandidate>,
    report: &mut RunReport,
) -> Vec<FactCandidate> {
    let mut dropped: HashSet<usize> = HashSet::new();
    let mut halved: HashSet<usize> = HashSet::new();

    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            if dropped.contains(&i) || dropped.contains(&j) {
                continue;
            }
            if !is_negation(&candidates[i].statement, &candidates[j].statement) {
                continue;
            }
            match candidates[i].cluster_size.cmp(&candidates[j].cluster_size) {
                std::cmp::Ordering::Greater => {
                    dropped.insert(j);
                }
                std::cmp::Ordering::Less => {
                    dropped.insert(i);
                }
                std::cmp::Ordering::Equal => {
                    halved.insert(i);
                    halved.insert(j);
                    report
                        .warnings
                        .push("contradictory candidates stored as alternatives".to_string());
                }
            }
        }
    }

    candidates
        .into_iter()
        .enumerate()
        .filter(|(idx, _)| !dropped.contains(idx))
        .map(|(idx, mut candidate)| {
            if halved.contains(&idx) {
                candidate.confidence *= 0.5;
            }
            candidate
        })
        .collect()
}

/// Domain inference from context keys, falling back to the dominant kind
fn infer_domain(events: &[Event]) -> String {
    let mut domains: BTreeMap<String, usize> = BTreeMap::new();
    for event in events {
        if let Some(domain) = event.context.get("domain") {
            *domains.entry(domain.clone()).or_default() += 1;
        }
    }
    if let Some((domain, _)) = domains.iter().max_by_key(|(_, count)| *count) {
        return domain.clone();
    }

    let mut files: BTreeMap<String, usize> = BTreeMap::new();
    for event in events {
        if let Some(file) = event.context.get("file") {
            let stem = file.split('/').next_back().unwrap_or(file);
            *files.entry(stem.to_string()).or_default() += 1;
        }
    }
    if let Some((file, _)) = files.iter().max_by_key(|(_, count)| *count) {
        return file.clone();
    }

    let mut kinds: BTreeMap<&'static str, usize> = BTreeMap::new();
    for event in events {
        *kinds.entry(event.kind.as_str()).or_default() += 1;
    }
    kinds
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(kind, _)| kind.to_string())
        .unwrap_or_else(|| "general".to_string())
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_statement(text: &str) -> String {
    if text.len() <= MAX_PROPOSED_STATEMENT {
        return text.to_string();
    }
    let mut end = MAX_PROPOSED_STATEMENT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

// ============================================================================
// TESTS
// ============================================================================

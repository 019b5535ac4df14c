//! Meta Layer
//!
//! Passive observer of the other layers. On a fixed cadence it samples
//! density, coverage, coherence, saturation, and a retrieval-quality proxy
//! into bounded ring buffers, and raises alerts when trends cross their
//! thresholds (saturation high for too long, ingest overflow, degraded
//! consolidation).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use rusqlite::params;

use crate::context::RequestContext;
use crate::error::{lock_poisoned, Result};
use crate::layers::episodic::EpisodicLayer;
use crate::layers::graph::GraphLayer;
use crate::layers::semantic::SemanticLayer;
use crate::model::{
    now_nanos, LayerKind, QualityAlert, QualityRecord, QualitySample, SampleRing,
};
use crate::storage::Pool;

/// Miller's working-memory capacity; saturation is working set / 7
pub const MILLER_CAP: f64 = 7.0;

/// Retrieval scores kept for the recall proxy
const RECALL_WINDOW: usize = 20;

/// Samples kept per (project, layer) ring
const RING_CAPACITY: usize = 64;

/// Rolling window for domain coverage, days
const COVERAGE_WINDOW_DAYS: i64 = 7;

/// Saturation level that, sustained, raises an alert
const SATURATION_ALERT_LEVEL: f64 = 0.8;

/// How long saturation must stay high before alerting, seconds
const SATURATION_ALERT_SECS: u64 = 600;

// ============================================================================
// LAYER
// ============================================================================

/// The quality-observation layer
pub struct MetaLayer {
    pool: Pool,
    episodic: Arc<EpisodicLayer>,
    semantic: Arc<SemanticLayer>,
    graph: Arc<GraphLayer>,
    cadence_sec: u64,
    state: Mutex<MetaState>,
}

#[derive(Default)]
struct MetaState {
    /// Ring buffers keyed by (project, layer)
    rings: HashMap<(i64, LayerKind), SampleRing>,
    /// Recent retrieval scores per project
    recall_scores: HashMap<i64, VecDeque<f64>>,
    /// Distinct facts touched by retrieval since the last sample
    working_set: HashMap<i64, HashSet<i64>>,
    /// Standing alerts raised by other components
    standing_alerts: Vec<QualityAlert>,
}

impl MetaLayer {
    /// Build the layer over the observed layer handles
    pub fn new(
        pool: Pool,
        episodic: Arc<EpisodicLayer>,
        semantic: Arc<SemanticLayer>,
        graph: Arc<GraphLayer>,
        cadence_sec: u64,
    ) -> Self {
        Self {
            pool,
            episodic,
            semantic,
            graph,
            cadence_sec: cadence_sec.max(1),
            state: Mutex::new(MetaState::default()),
        }
    }

    // ========================================================================
    // OBSERVATION HOOKS
    // ========================================================================

    /// Record a retrieval's mean score and the facts it touched
    pub fn observe_retrieval(&self, project_id: i64, score: f64, touched_fact_ids: &[i64]) {
        if let Ok(mut state) = self.state.lock() {
            let scores = state.recall_scores.entry(project_id).or_default();
            if scores.len() == RECALL_WINDOW {
                scores.pop_front();
            }
            scores.push_back(score.clamp(0.0, 1.0));
            let working = state.working_set.entry(project_id).or_default();
            working.extend(touched_fact_ids.iter().copied());
        }
    }

    /// Raise a standing alert (ingest overflow, degraded dependency, ...)
    pub fn raise_alert(&self, alert: QualityAlert) {
        tracing::warn!(code = %alert.code, detail = %alert.detail, "meta alert raised");
        if let Ok(mut state) = self.state.lock() {
            // One standing alert per code; newest detail wins
            state.standing_alerts.retain(|a| a.code != alert.code);
            state.standing_alerts.push(alert);
        }
    }

    /// Clear a standing alert by code
    pub fn clear_alert(&self, code: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.standing_alerts.retain(|a| a.code != code);
        }
    }

    // ========================================================================
    // SAMPLING
    // ========================================================================

    /// Take one quality sample for every layer of a project
    pub async fn sample(&self, ctx: &RequestContext) -> Result<QualitySample> {
        ctx.checkpoint()?;
        let events = self.episodic.count(ctx).await? as f64;
        let facts = self.semantic.count(ctx).await? as f64;

        // Log squash keeps the ratio meaningful across corpus sizes
        let density = if events > 0.0 {
            ((1.0 + facts).ln() / (1.0 + events).ln()).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let coverage = self.domain_coverage(ctx).await?;
        let coherence = self.graph.mean_relation_weight(ctx).await?.clamp(0.0, 1.0);

        let (recall_proxy, saturation) = {
            let mut state = self.state.lock().map_err(lock_poisoned)?;
            let recall_proxy = state
                .recall_scores
                .get(&ctx.project_id)
                .filter(|s| !s.is_empty())
                .map(|s| s.iter().sum::<f64>() / s.len() as f64)
                .unwrap_or(0.0);
            let working = state
                .working_set
                .remove(&ctx.project_id)
                .map(|set| set.len())
                .unwrap_or(0);
            let saturation = (working as f64 / MILLER_CAP).clamp(0.0, 1.0);
            (recall_proxy, saturation)
        };

        let sample = QualitySample {
            density,
            coverage,
            coherence,
            recall_proxy,
            saturation,
            sampled_at: chrono::Utc::now(),
        };

        // Persist one row per layer and feed the rings
        {
            let conn = self.pool.acquire().await?;
            for layer in LayerKind::all() {
                conn.execute(
                    "INSERT INTO quality_samples
                     (project_id, layer, density, coverage, coherence, recall_proxy, saturation, sampled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        ctx.project_id,
                        layer.as_str(),
                        sample.density,
                        sample.coverage,
                        sample.coherence,
                        sample.recall_proxy,
                        sample.saturation,
                        now_nanos(),
                    ],
                )?;
            }
        }
        {
            let mut state = self.state.lock().map_err(lock_poisoned)?;
            for layer in LayerKind::all() {
                state
                    .rings
                    .entry((ctx.project_id, layer))
                    .or_insert_with(|| SampleRing::new(RING_CAPACITY))
                    .push(sample);
            }
        }

        Ok(sample)
    }

    /// Fraction of active domains with a fact reinforced in the window
    async fn domain_coverage(&self, ctx: &RequestContext) -> Result<f64> {
        let cutoff = now_nanos() - COVERAGE_WINDOW_DAYS * 86_400_000_000_000;
        let conn = self.pool.acquire().await?;
        let total: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT domain) FROM facts WHERE project_id = ?1 AND archived = 0",
            params![ctx.project_id],
            |row| row.get(0),
        )?;
        if total == 0 {
            return Ok(0.0);
        }
        let recent: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT domain) FROM facts
             WHERE project_id = ?1 AND archived = 0 AND last_reinforced_at >= ?2",
            params![ctx.project_id, cutoff],
            |row| row.get(0),
        )?;
        Ok((recent as f64 / total as f64).clamp(0.0, 1.0))
    }

    // ========================================================================
    // SUMMARY & ALERTS
    // ========================================================================

    /// Quality records for every layer of a project
    pub fn quality_summary(&self, project_id: i64) -> Result<Vec<QualityRecord>> {
        let state = self.state.lock().map_err(lock_poisoned)?;
        let mut records = Vec::new();
        for layer in LayerKind::all() {
            if let Some(ring) = state.rings.get(&(project_id, layer)) {
                if let Some(latest) = ring.latest() {
                    records.push(QualityRecord {
                        layer,
                        latest: *latest,
                        mean_saturation: ring.mean_of(|s| s.saturation),
                        mean_recall_proxy: ring.mean_of(|s| s.recall_proxy),
                        p90_saturation: ring.percentile_of(90.0, |s| s.saturation),
                        p90_recall_proxy: ring.percentile_of(90.0, |s| s.recall_proxy),
                        sample_count: ring.len(),
                    });
                }
            }
        }
        Ok(records)
    }

    /// Current alerts: standing alerts plus threshold trends
    pub fn alerts(&self, project_id: i64) -> Result<Vec<QualityAlert>> {
        let state = self.state.lock().map_err(lock_poisoned)?;
        let mut alerts: Vec<QualityAlert> = state.standing_alerts.clone();

        // Sustained saturation: trailing run of high samples spanning the
        // alert window at the configured cadence.
        if let Some(ring) = state.rings.get(&(project_id, LayerKind::Semantic)) {
            let run = ring.trailing_run(|s| s.saturation > SATURATION_ALERT_LEVEL);
            if run as u64 * self.cadence_sec > SATURATION_ALERT_SECS {
                let since = chrono::Utc::now()
                    - chrono::Duration::seconds((run as u64 * self.cadence_sec) as i64);
                alerts.push(QualityAlert {
                    code: "saturation_high".to_string(),
                    layer: Some(LayerKind::Semantic),
                    detail: format!(
                        "saturation above {SATURATION_ALERT_LEVEL} for {} consecutive samples",
                        run
                    ),
                    since,
                });
            }
        }

        Ok(alerts)
    }

    /// Recent consolidation run reports, newest first
    pub async fn recent_runs(
        &self,
        ctx: &RequestContext,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT id, strategy, events_in, clusters, facts_created, facts_reinforced,
                    procedures_created, duration_ms, llm_calls, llm_failures, completed_at
             FROM consolidation_runs WHERE project_id = ?1
             ORDER BY completed_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![ctx.project_id, limit as i64], |row| {
                Ok(serde_json::json!({
                    "runId": row.get::<_, String>(0)?,
                    "strategy": row.get::<_, String>(1)?,
                    "eventsIn": row.get::<_, i64>(2)?,
                    "clusters": row.get::<_, i64>(3)?,
                    "factsCreated": row.get::<_, i64>(4)?,
                    "factsReinforced": row.get::<_, i64>(5)?,
                    "proceduresCreated": row.get::<_, i64>(6)?,
                    "durationMs": row.get::<_, i64>(7)?,
                    "llmCalls": row.get::<_, i64>(8)?,
                    "llmFailures": row.get::<_, i64>(9)?,
                }))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Procedural Layer
//!
//! Parameterized workflow store with effectiveness statistics. Every
//! definition change snapshots the previous version for rollback; execution
//! stats update atomically so `success_rate = successes / execution_count`
//! holds at every observable moment.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use crate::context::RequestContext;
use crate::embed::{Embedder, Embedding};
use crate::error::{Error, Result};
use crate::model::{
    nanos_to_datetime, now_nanos, running_mean, ExecutionRecord, Outcome, ParameterSlot,
    Procedure, ProcedureInput, ProcedureStep, ProcedureVersion,
};
use crate::search::{Collection, VectorStore};
use crate::storage::Pool;

/// Weight of success_rate in find_procedures ranking
pub const RANK_GAMMA: f64 = 0.4;

// ============================================================================
// LAYER
// ============================================================================

/// The procedural workflow store
pub struct ProceduralLayer {
    pool: Pool,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl ProceduralLayer {
    /// Build the layer over shared storage handles
    pub fn new(pool: Pool, vectors: Arc<VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            pool,
            vectors,
            embedder,
        }
    }

    // ========================================================================
    // CREATE & VERSIONS
    // ========================================================================

    /// Create a procedure; the name is unique within the project
    pub async fn create_procedure(
        &self,
        ctx: &RequestContext,
        input: ProcedureInput,
    ) -> Result<Procedure> {
        ctx.checkpoint()?;
        input.validate()?;

        let steps_json = serde_json::to_string(&input.steps)?;
        let params_json = serde_json::to_string(&input.parameters)?;
        let grounding_json = serde_json::to_string(&input.grounding_event_ids)?;
        let now = now_nanos();

        let id = {
            let mut conn = self.pool.acquire().await?;
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO procedures
                 (project_id, name, category, steps, parameters, grounding_event_ids, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    ctx.project_id,
                    input.name,
                    input.category,
                    steps_json,
                    params_json,
                    grounding_json,
                    now
                ],
            )?;
            if inserted == 0 {
                return Err(Error::conflict(format!(
                    "procedure '{}' already exists",
                    input.name
                )));
            }
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO procedure_versions (procedure_id, version, steps, parameters, recorded_at)
                 VALUES (?1, 1, ?2, ?3, ?4)",
                params![id, steps_json, params_json, now],
            )?;
            tx.commit()?;
            id
        };

        if let Some(embedding) = self.embed_descriptor(&input.name, &input.category).await {
            let _ = self
                .vectors
                .add(Collection::Procedures, ctx.project_id, id, &embedding.vector);
            let conn = self.pool.acquire().await?;
            conn.execute(
                "INSERT OR REPLACE INTO procedure_embeddings
                 (procedure_id, embedding, dimensions, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, embedding.to_bytes(), embedding.dimensions() as i64, now],
            )?;
        }

        self.get_procedure(ctx, id).await
    }

    /// Definition snapshots, newest first
    pub async fn versions(
        &self,
        ctx: &RequestContext,
        procedure_id: i64,
    ) -> Result<Vec<ProcedureVersion>> {
        // Existence check scoped to the project
        self.get_procedure(ctx, procedure_id).await?;
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT version, steps, parameters, recorded_at FROM procedure_versions
             WHERE procedure_id = ?1 ORDER BY version DESC",
        )?;
        let versions = stmt
            .query_map(params![procedure_id], |row| {
                let steps: String = row.get(1)?;
                let parameters: String = row.get(2)?;
                Ok(ProcedureVersion {
                    version: row.get(0)?,
                    steps: serde_json::from_str(&steps).unwrap_or_default(),
                    parameters: serde_json::from_str(&parameters).unwrap_or_default(),
                    recorded_at: nanos_to_datetime(row.get(3)?),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(versions)
    }

    /// Restore a snapshot; the restore itself is recorded as a new version
    pub async fn rollback(
        &self,
        ctx: &RequestContext,
        procedure_id: i64,
        version: i64,
    ) -> Result<Procedure> {
        ctx.checkpoint()?;
        let current = self.get_procedure(ctx, procedure_id).await?;

        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;
        let snapshot: Option<(String, String)> = tx
            .query_row(
                "SELECT steps, parameters FROM procedure_versions
                 WHERE procedure_id = ?1 AND version = ?2",
                params![procedure_id, version],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((steps_json, params_json)) = snapshot else {
            return Err(Error::not_found(
                "procedure version",
                format!("{procedure_id}@{version}"),
            ));
        };

        let now = now_nanos();
        let next_version = current.version + 1;
        tx.execute(
            "UPDATE procedures SET steps = ?2, parameters = ?3, version = ?4
             WHERE id = ?1",
            params![procedure_id, steps_json, params_json, next_version],
        )?;
        tx.execute(
            "INSERT INTO procedure_versions (procedure_id, version, steps, parameters, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![procedure_id, next_version, steps_json, params_json, now],
        )?;
        tx.commit()?;
        drop(conn);

        self.get_procedure(ctx, procedure_id).await
    }

    // ========================================================================
    // EXECUTION STATS
    // ========================================================================

    /// Record an execution, atomically updating count, rate, and mean duration
    pub async fn record_execution(
        &self,
        ctx: &RequestContext,
        procedure_id: i64,
        outcome: Outcome,
        duration_ms: i64,
        exec_params: serde_json::Value,
    ) -> Result<Procedure> {
        ctx.checkpoint()?;
        if duration_ms < 0 {
            return Err(Error::validation("duration must be non-negative"));
        }
        let current = self.get_procedure(ctx, procedure_id).await?;

        let success_increment = i64::from(outcome == Outcome::Success);
        let new_mean = running_mean(
            current.avg_duration_ms,
            current.execution_count,
            duration_ms as f64,
        );
        let now = now_nanos();

        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE procedures SET
               execution_count = execution_count + 1,
               success_count = success_count + ?2,
               avg_duration_ms = ?3,
               underperforming = CASE
                 WHEN execution_count + 1 >= ?4
                  AND CAST(success_count + ?2 AS REAL) / (execution_count + 1) < ?5
                 THEN 1 ELSE 0 END,
               version = version + 1
             WHERE id = ?1 AND version = ?6",
            params![
                procedure_id,
                success_increment,
                new_mean,
                crate::model::UNDERPERFORMING_MIN_EXECUTIONS,
                crate::model::UNDERPERFORMING_RATE,
                current.version,
            ],
        )?;
        if updated == 0 {
            return Err(Error::conflict(format!(
                "procedure {procedure_id} changed concurrently"
            )));
        }
        tx.execute(
            "INSERT INTO procedure_executions (procedure_id, outcome, duration_ms, params, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                procedure_id,
                outcome.as_str(),
                duration_ms,
                serde_json::to_string(&exec_params)?,
                now
            ],
        )?;
        tx.commit()?;
        drop(conn);

        self.get_procedure(ctx, procedure_id).await
    }

    /// Raw execution history, newest first
    pub async fn executions(
        &self,
        ctx: &RequestContext,
        procedure_id: i64,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        self.get_procedure(ctx, procedure_id).await?;
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT outcome, duration_ms, params, recorded_at FROM procedure_executions
             WHERE procedure_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![procedure_id, limit as i64], |row| {
                let outcome: String = row.get(0)?;
                let params_json: String = row.get(2)?;
                Ok(ExecutionRecord {
                    procedure_id,
                    outcome: Outcome::parse_name(&outcome).unwrap_or_default(),
                    duration_ms: row.get(1)?,
                    params: serde_json::from_str(&params_json)
                        .unwrap_or(serde_json::Value::Null),
                    recorded_at: nanos_to_datetime(row.get(3)?),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(records)
    }

    // ========================================================================
    // FIND
    // ========================================================================

    /// Rank procedures by `gamma * success_rate + (1 - gamma) * similarity`
    ///
    /// Similarity is cosine between the query embedding and the procedure's
    /// name+category embedding; without an embedding the lexical name match
    /// alone carries the similarity term.
    pub async fn find_procedures(
        &self,
        ctx: &RequestContext,
        query: &str,
        query_embedding: Option<&Embedding>,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(Procedure, f64)>> {
        ctx.checkpoint()?;
        let limit = limit.clamp(1, 50);

        let semantic: std::collections::HashMap<i64, f32> = match query_embedding {
            Some(embedding) => self
                .vectors
                .search(
                    Collection::Procedures,
                    ctx.project_id,
                    &embedding.vector,
                    limit * 4,
                    0.0,
                )?
                .into_iter()
                .collect(),
            None => std::collections::HashMap::new(),
        };

        let candidates = self.candidates(ctx, query, category, limit * 4).await?;

        let mut ranked: Vec<(Procedure, f64)> = candidates
            .into_iter()
            .map(|(proc, lexical)| {
                let similarity = semantic
                    .get(&proc.id)
                    .map(|s| f64::from(*s))
                    .unwrap_or(lexical);
                let score = RANK_GAMMA * proc.success_rate + (1.0 - RANK_GAMMA) * similarity;
                (proc, score)
            })
            .collect();

        ranked.sort_by(|(pa, sa), (pb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| pa.id.cmp(&pb.id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Candidate set with a crude lexical score from name/category matching
    async fn candidates(
        &self,
        ctx: &RequestContext,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(Procedure, f64)>> {
        let conn = self.pool.acquire().await?;
        let pattern = format!("%{}%", query.trim().to_lowercase());
        let mut results = Vec::new();

        let sql = format!(
            "SELECT {PROCEDURE_COLUMNS} FROM procedures p
             WHERE p.project_id = ?1 AND (?2 IS NULL OR p.category = ?2)
             ORDER BY p.id LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![ctx.project_id, category, limit as i64],
            map_procedure_row,
        )?;
        for row in rows {
            let proc = row?;
            let haystack = format!("{} {}", proc.name, proc.category).to_lowercase();
            let lexical = if pattern.len() > 2 && haystack.contains(pattern.trim_matches('%')) {
                1.0
            } else {
                0.0
            };
            results.push((proc, lexical));
        }
        Ok(results)
    }

    /// Procedures flagged underperforming, surfaced to consolidation review
    pub async fn underperforming(&self, ctx: &RequestContext) -> Result<Vec<Procedure>> {
        let conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT {PROCEDURE_COLUMNS} FROM procedures p
             WHERE p.project_id = ?1 AND p.underperforming = 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let procs = stmt
            .query_map(params![ctx.project_id], map_procedure_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(procs)
    }

    /// Fetch one procedure
    pub async fn get_procedure(&self, ctx: &RequestContext, id: i64) -> Result<Procedure> {
        let conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT {PROCEDURE_COLUMNS} FROM procedures p
             WHERE p.project_id = ?1 AND p.id = ?2"
        );
        conn.query_row(&sql, params![ctx.project_id, id], map_procedure_row)
            .optional()?
            .ok_or_else(|| Error::not_found("procedure", id))
    }

    /// Find by name
    pub async fn find_by_name(&self, ctx: &RequestContext, name: &str) -> Result<Option<i64>> {
        let conn = self.pool.acquire().await?;
        let id = conn
            .query_row(
                "SELECT id FROM procedures WHERE project_id = ?1 AND name = ?2",
                params![ctx.project_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Total procedures in the project
    pub async fn count(&self, ctx: &RequestContext) -> Result<u64> {
        let conn = self.pool.acquire().await?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM procedures WHERE project_id = ?1",
            params![ctx.project_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn embed_descriptor(&self, name: &str, category: &str) -> Option<Embedding> {
        if !self.embedder.is_available() {
            return None;
        }
        let descriptor = format!("{name} {category}");
        match self.embedder.embed_batch(&[descriptor]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
            _ => None,
        }
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

/// Column list matching [`map_procedure_row`]
const PROCEDURE_COLUMNS: &str = "p.id, p.project_id, p.name, p.category, p.steps, p.parameters, \
     p.success_count, p.execution_count, p.avg_duration_ms, p.grounding_event_ids, \
     p.underperforming, p.created_at, p.version";

fn map_procedure_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Procedure> {
    let steps_json: String = row.get(4)?;
    let params_json: String = row.get(5)?;
    let grounding_json: String = row.get(9)?;
    let success_count: i64 = row.get(6)?;
    let execution_count: i64 = row.get(7)?;
    let steps: Vec<ProcedureStep> = serde_json::from_str(&steps_json).unwrap_or_default();
    let parameters: Vec<ParameterSlot> = serde_json::from_str(&params_json).unwrap_or_default();
    Ok(Procedure {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        category: row.get(3)?,
        steps,
        parameters,
        success_rate: if execution_count > 0 {
            success_count as f64 / execution_count as f64
        } else {
            0.0
        },
        execution_count,
        avg_duration_ms: row.get(8)?,
        grounding_event_ids: serde_json::from_str(&grounding_json).unwrap_or_default(),
        underperforming: row.get::<_, i64>(10)? != 0,
        created_at: nanos_to_datetime(row.get(11)?),
        version: row.get(12)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

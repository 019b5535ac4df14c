//! Semantic Layer
//!
//! The fact store. Facts are grounded in events, deduplicated by
//! (domain, statement), and ranked by hybrid lexical+semantic retrieval.
//! Confidence moves with reinforcement and contradiction signals; dormant
//! low-confidence facts are archived, not deleted.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use crate::context::RequestContext;
use crate::embed::{Embedder, Embedding};
use crate::error::{Error, Result};
use crate::model::{
    confidence_score, datetime_to_nanos, nanos_to_datetime, now_nanos, Fact, FactInput,
    DEFAULT_BASE_CONFIDENCE,
};
use crate::search::{fuse, normalize_bm25, sanitize_fts5_query, Collection, VectorStore};
use crate::storage::Pool;

/// Hard cap on fact recall page size
pub const MAX_RECALL_LIMIT: usize = 50;

/// Facts below this confidence are excluded from recall by default
pub const RETRIEVAL_THRESHOLD: f64 = 0.3;

/// Confidence below which a fact is a candidate for archival
pub const DORMANCY_CONFIDENCE: f64 = 0.1;

/// Days a fact must sit below the dormancy confidence before archival
pub const DORMANCY_WINDOW_DAYS: i64 = 14;

// ============================================================================
// LAYER
// ============================================================================

/// The semantic fact store
pub struct SemanticLayer {
    pool: Pool,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
}

/// How `remember` resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RememberOutcome {
    /// A new fact was created
    Created,
    /// An existing fact with the same (domain, statement) was reinforced
    Reinforced,
}

impl SemanticLayer {
    /// Build the layer over shared storage handles
    pub fn new(pool: Pool, vectors: Arc<VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            pool,
            vectors,
            embedder,
        }
    }

    // ========================================================================
    // REMEMBER
    // ========================================================================

    /// Store a fact, or reinforce the existing fact with the same statement
    ///
    /// Rejected when `source_event_ids` is empty or cites events that do not
    /// exist in the project.
    pub async fn remember(
        &self,
        ctx: &RequestContext,
        input: FactInput,
    ) -> Result<(Fact, RememberOutcome)> {
        ctx.checkpoint()?;
        input.validate()?;

        // Grounding: every cited event must exist
        let cited = self.count_existing_events(ctx, &input.source_event_ids).await?;
        if cited != input.source_event_ids.len() {
            return Err(Error::validation(format!(
                "{} of {} cited events do not exist",
                input.source_event_ids.len() - cited,
                input.source_event_ids.len()
            )));
        }

        // Statements are unique within a domain; an existing row absorbs the
        // new sources as reinforcement.
        if let Some(existing_id) = self.find_by_statement(ctx, &input.domain, &input.statement).await? {
            let now = now_nanos();
            {
                let mut conn = self.pool.acquire().await?;
                let tx = conn.transaction()?;
                for event_id in &input.source_event_ids {
                    tx.execute(
                        "INSERT OR IGNORE INTO fact_sources (fact_id, event_id) VALUES (?1, ?2)",
                        params![existing_id, event_id],
                    )?;
                }
                tx.execute(
                    "UPDATE facts SET
                       support_count = support_count + 1,
                       confidence = MIN(1.0, confidence + ?2),
                       last_reinforced_at = ?3,
                       version = version + 1
                     WHERE id = ?1",
                    params![existing_id, crate::model::REINFORCE_STEP, now],
                )?;
                tx.commit()?;
            }
            let fact = self.get_fact(ctx, existing_id).await?;
            return Ok((fact, RememberOutcome::Reinforced));
        }

        let embedding = self.embed_statement(&input.statement).await;
        let confidence = input.confidence.unwrap_or(DEFAULT_BASE_CONFIDENCE);
        let now = now_nanos();

        let fact_id = {
            let mut conn = self.pool.acquire().await?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO facts
                 (project_id, statement, domain, confidence, support_count,
                  contradiction_count, last_reinforced_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?5)",
                params![ctx.project_id, input.statement, input.domain, confidence, now],
            )?;
            let fact_id = tx.last_insert_rowid();
            for event_id in &input.source_event_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO fact_sources (fact_id, event_id) VALUES (?1, ?2)",
                    params![fact_id, event_id],
                )?;
            }
            if let Some(embedding) = &embedding {
                tx.execute(
                    "INSERT INTO fact_embeddings (fact_id, embedding, dimensions, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![fact_id, embedding.to_bytes(), embedding.dimensions() as i64, now],
                )?;
            }
            tx.commit()?;
            fact_id
        };

        if let Some(embedding) = &embedding {
            if let Err(e) =
                self.vectors
                    .add(Collection::Facts, ctx.project_id, fact_id, &embedding.vector)
            {
                tracing::warn!(fact_id, error = %e, "vector index add failed");
            }
        }

        let fact = self.get_fact(ctx, fact_id).await?;
        Ok((fact, RememberOutcome::Created))
    }

    async fn embed_statement(&self, statement: &str) -> Option<Embedding> {
        if !self.embedder.is_available() {
            return None;
        }
        match self.embedder.embed_batch(&[statement.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "fact embedding failed");
                None
            }
        }
    }

    // ========================================================================
    // RECALL
    // ========================================================================

    /// Hybrid recall: `R = alpha * semantic + (1 - alpha) * lexical`
    ///
    /// Facts under the retrieval threshold are excluded unless
    /// `include_low_confidence`; ties break by confidence then recency of
    /// reinforcement. Archived facts never surface.
    #[allow(clippy::too_many_arguments)]
    pub async fn recall(
        &self,
        ctx: &RequestContext,
        query: &str,
        query_embedding: Option<&Embedding>,
        domain: Option<&str>,
        limit: usize,
        include_low_confidence: bool,
        alpha: f32,
    ) -> Result<Vec<(Fact, f32)>> {
        ctx.checkpoint()?;
        let limit = limit.clamp(1, MAX_RECALL_LIMIT);
        let fetch = limit * 2;

        let lexical = self.lexical_search(ctx, query, fetch).await?;
        let semantic: Vec<(i64, f32)> = match query_embedding {
            Some(embedding) => self.vectors.search(
                Collection::Facts,
                ctx.project_id,
                &embedding.vector,
                fetch,
                0.0,
            )?,
            None => vec![],
        };

        let fused = fuse(&lexical, &semantic, alpha);

        let mut results: Vec<(Fact, f32)> = Vec::new();
        for scored in fused {
            let Some(fact) = self.try_get_fact(ctx, scored.id).await? else {
                continue;
            };
            if fact.archived {
                continue;
            }
            if let Some(domain) = domain {
                if fact.domain != domain {
                    continue;
                }
            }
            if !include_low_confidence && fact.confidence < RETRIEVAL_THRESHOLD {
                continue;
            }
            results.push((fact, scored.score));
        }

        // Stable ordering: fused score, then confidence, then most recently
        // reinforced.
        results.sort_by(|(fa, sa), (fb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    fb.confidence
                        .partial_cmp(&fa.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| fb.last_reinforced_at.cmp(&fa.last_reinforced_at))
                .then_with(|| fa.id.cmp(&fb.id))
        });
        results.truncate(limit);
        Ok(results)
    }

    async fn lexical_search(
        &self,
        ctx: &RequestContext,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(i64, f32)>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT f.id, rank FROM facts f
             JOIN facts_fts fts ON f.id = fts.rowid
             WHERE facts_fts MATCH ?1 AND f.project_id = ?2 AND f.archived = 0
             ORDER BY rank LIMIT ?3",
        )?;
        let rows: Vec<(i64, f64)> = stmt
            .query_map(params![sanitized, ctx.project_id, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(normalize_bm25(rows))
    }

    // ========================================================================
    // REINFORCEMENT
    // ========================================================================

    /// Raise confidence with a supporting event
    pub async fn reinforce(
        &self,
        ctx: &RequestContext,
        fact_id: i64,
        supporting_event_id: i64,
    ) -> Result<Fact> {
        self.apply_signal(ctx, fact_id, supporting_event_id, true).await
    }

    /// Lower confidence with a contradicting event
    pub async fn contradict(
        &self,
        ctx: &RequestContext,
        fact_id: i64,
        contradicting_event_id: i64,
    ) -> Result<Fact> {
        self.apply_signal(ctx, fact_id, contradicting_event_id, false).await
    }

    async fn apply_signal(
        &self,
        ctx: &RequestContext,
        fact_id: i64,
        event_id: i64,
        supporting: bool,
    ) -> Result<Fact> {
        ctx.checkpoint()?;
        if self.count_existing_events(ctx, &[event_id]).await? != 1 {
            return Err(Error::not_found("event", event_id));
        }
        let fact = self.get_fact(ctx, fact_id).await?;
        let new_confidence = confidence_score(fact.confidence, supporting);
        let now = now_nanos();

        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;
        let updated = if supporting {
            tx.execute(
                "UPDATE facts SET confidence = ?2, support_count = support_count + 1,
                   last_reinforced_at = ?3, version = version + 1
                 WHERE id = ?1 AND version = ?4",
                params![fact_id, new_confidence, now, fact.version],
            )?
        } else {
            tx.execute(
                "UPDATE facts SET confidence = ?2,
                   contradiction_count = contradiction_count + 1,
                   last_reinforced_at = ?3, version = version + 1
                 WHERE id = ?1 AND version = ?4",
                params![fact_id, new_confidence, now, fact.version],
            )?
        };
        if updated == 0 {
            return Err(Error::conflict(format!(
                "fact {fact_id} changed concurrently"
            )));
        }
        if supporting {
            tx.execute(
                "INSERT OR IGNORE INTO fact_sources (fact_id, event_id) VALUES (?1, ?2)",
                params![fact_id, event_id],
            )?;
        }
        tx.commit()?;
        drop(conn);

        self.get_fact(ctx, fact_id).await
    }

    // ========================================================================
    // FORGET & ARCHIVAL
    // ========================================================================

    /// Mark a fact archived; retained for audit, excluded from recall
    pub async fn forget(&self, ctx: &RequestContext, fact_id: i64) -> Result<()> {
        let conn = self.pool.acquire().await?;
        let updated = conn.execute(
            "UPDATE facts SET archived = 1, version = version + 1
             WHERE id = ?1 AND project_id = ?2",
            params![fact_id, ctx.project_id],
        )?;
        if updated == 0 {
            return Err(Error::not_found("fact", fact_id));
        }
        let _ = self.vectors.remove(Collection::Facts, ctx.project_id, fact_id);
        Ok(())
    }

    /// Archive facts dormant below the confidence floor
    pub async fn archive_dormant(&self, ctx: &RequestContext) -> Result<usize> {
        let cutoff = now_nanos() - DORMANCY_WINDOW_DAYS * 86_400_000_000_000;
        let conn = self.pool.acquire().await?;
        let ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM facts
                 WHERE project_id = ?1 AND archived = 0
                   AND confidence < ?2 AND last_reinforced_at < ?3",
            )?;
            stmt.query_map(params![ctx.project_id, DORMANCY_CONFIDENCE, cutoff], |row| {
                row.get(0)
            })?
            .collect::<rusqlite::Result<_>>()?
        };
        for id in &ids {
            conn.execute(
                "UPDATE facts SET archived = 1, version = version + 1 WHERE id = ?1",
                params![id],
            )?;
            let _ = self.vectors.remove(Collection::Facts, ctx.project_id, *id);
        }
        if !ids.is_empty() {
            tracing::info!(project_id = ctx.project_id, count = ids.len(), "archived dormant facts");
        }
        Ok(ids.len())
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    /// Fetch one fact
    pub async fn get_fact(&self, ctx: &RequestContext, fact_id: i64) -> Result<Fact> {
        self.try_get_fact(ctx, fact_id)
            .await?
            .ok_or_else(|| Error::not_found("fact", fact_id))
    }

    async fn try_get_fact(&self, ctx: &RequestContext, fact_id: i64) -> Result<Option<Fact>> {
        let conn = self.pool.acquire().await?;
        let fact = conn
            .query_row(
                &format!("SELECT {FACT_COLUMNS} FROM facts f WHERE f.project_id = ?1 AND f.id = ?2"),
                params![ctx.project_id, fact_id],
                map_fact_row,
            )
            .optional()?;
        Ok(fact)
    }

    /// Find a fact id by exact (domain, statement)
    pub async fn find_by_statement(
        &self,
        ctx: &RequestContext,
        domain: &str,
        statement: &str,
    ) -> Result<Option<i64>> {
        let conn = self.pool.acquire().await?;
        let id = conn
            .query_row(
                "SELECT id FROM facts
                 WHERE project_id = ?1 AND domain = ?2 AND statement = ?3",
                params![ctx.project_id, domain, statement],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Active facts with confidence at or above a floor, for gate checks
    pub async fn high_confidence_facts(
        &self,
        ctx: &RequestContext,
        floor: f64,
        limit: usize,
    ) -> Result<Vec<Fact>> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FACT_COLUMNS} FROM facts f
             WHERE f.project_id = ?1 AND f.archived = 0 AND f.confidence >= ?2
             ORDER BY f.confidence DESC LIMIT ?3"
        ))?;
        let facts = stmt
            .query_map(params![ctx.project_id, floor, limit as i64], map_fact_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(facts)
    }

    /// Total active facts in the project
    pub async fn count(&self, ctx: &RequestContext) -> Result<u64> {
        let conn = self.pool.acquire().await?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM facts WHERE project_id = ?1 AND archived = 0",
            params![ctx.project_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn count_existing_events(&self, ctx: &RequestContext, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.pool.acquire().await?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT COUNT(DISTINCT id) FROM events
             WHERE project_id = ? AND id IN ({placeholders})"
        );
        let values: Vec<i64> = std::iter::once(ctx.project_id)
            .chain(ids.iter().copied())
            .collect();
        let count: i64 = conn.query_row(&sql, rusqlite::params_from_iter(values.iter()), |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

/// Column list matching [`map_fact_row`]
const FACT_COLUMNS: &str = "f.id, f.project_id, f.statement, f.domain, f.confidence, \
     f.support_count, f.contradiction_count, f.last_reinforced_at, f.archived, \
     f.created_at, f.version, \
     (SELECT group_concat(event_id) FROM fact_sources fs WHERE fs.fact_id = f.id), \
     EXISTS (SELECT 1 FROM fact_embeddings x WHERE x.fact_id = f.id)";

fn map_fact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    let sources: Option<String> = row.get(11)?;
    let source_event_ids = sources
        .map(|s| s.split(',').filter_map(|id| id.parse().ok()).collect())
        .unwrap_or_default();
    Ok(Fact {
        id: row.get(0)?,
        project_id: row.get(1)?,
        statement: row.get(2)?,
        domain: row.get(3)?,
        confidence: row.get(4)?,
        support_count: row.get(5)?,
        contradiction_count: row.get(6)?,
        last_reinforced_at: nanos_to_datetime(row.get(7)?),
        archived: row.get::<_, i64>(8)? != 0,
        created_at: nanos_to_datetime(row.get(9)?),
        version: row.get(10)?,
        source_event_ids,
        has_embedding: row.get::<_, i64>(12)? != 0,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestConfig, StorageConfig};
    use crate::layers::episodic::EpisodicLayer;
    use crate::model::{EventInput, EventKind};
    use crate::testing::{unit_vector, StubEmbedder};

    struct Fixture {
        _dir: tempfile::TempDir,
        episodic: EpisodicLayer,
        semantic: SemanticLayer,
        ctx: RequestContext,
    }

    async fn fixture_with(embedder: Arc<dyn Embedder>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool =
            crate::storage::open(&dir.path().join("test.db"), &StorageConfig::default()).unwrap();
        let project_id = {
            let conn = pool.acquire_blocking().unwrap();
            crate::storage::resolve_project(&conn, "test").unwrap()
        };
        let vectors = Arc::new(VectorStore::new().unwrap());
        let episodic = EpisodicLayer::new(
            pool.clone(),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            &IngestConfig::default(),
        );
        let semantic = SemanticLayer::new(pool, vectors, embedder);
        Fixture {
            _dir: dir,
            episodic,
            semantic,
            ctx: RequestContext::new(project_id),
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(StubEmbedder::new())).await
    }

    async fn seed_event(f: &Fixture, content: &str) -> i64 {
        f.episodic
            .record_event(
                &f.ctx,
                EventInput {
                    content: content.to_string(),
                    kind: EventKind::ToolUse,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id()
    }

    fn fact_input(statement: &str, domain: &str, sources: Vec<i64>) -> FactInput {
        FactInput {
            statement: statement.to_string(),
            domain: domain.to_string(),
            source_event_ids: sources,
            confidence: None,
        }
    }

    #[tokio::test]
    async fn test_remember_requires_existing_events() {
        let f = fixture().await;
        let err = f
            .semantic
            .remember(&f.ctx, fact_input("orphan", "misc", vec![999]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_remember_and_get() {
        let f = fixture().await;
        let event = seed_event(&f, "observed pool exhaustion").await;
        let (fact, outcome) = f
            .semantic
            .remember(&f.ctx, fact_input("pool needs tuning", "database", vec![event]))
            .await
            .unwrap();
        assert_eq!(outcome, RememberOutcome::Created);
        assert_eq!(fact.source_event_ids, vec![event]);
        assert!((fact.confidence - DEFAULT_BASE_CONFIDENCE).abs() < 1e-9);
        assert!(fact.has_embedding);
    }

    #[tokio::test]
    async fn test_duplicate_statement_reinforces() {
        let f = fixture().await;
        let e1 = seed_event(&f, "first observation").await;
        let e2 = seed_event(&f, "second observation").await;
        let (first, _) = f
            .semantic
            .remember(&f.ctx, fact_input("tests are flaky", "ci", vec![e1]))
            .await
            .unwrap();
        let (second, outcome) = f
            .semantic
            .remember(&f.ctx, fact_input("tests are flaky", "ci", vec![e2]))
            .await
            .unwrap();
        assert_eq!(outcome, RememberOutcome::Reinforced);
        assert_eq!(first.id, second.id);
        assert_eq!(second.support_count, 2);
        assert!(second.confidence > first.confidence);
        assert_eq!(second.source_event_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_reinforce_contradict_bounds_and_monotonicity() {
        let f = fixture().await;
        let event = seed_event(&f, "signal").await;
        let (fact, _) = f
            .semantic
            .remember(&f.ctx, fact_input("monotone fact", "misc", vec![event]))
            .await
            .unwrap();

        let mut last = fact.confidence;
        // Alternate signals many times; confidence stays within [0, 1] and
        // moves with the net signed count.
        for i in 0..20 {
            let updated = if i % 2 == 0 {
                f.semantic.reinforce(&f.ctx, fact.id, event).await.unwrap()
            } else {
                f.semantic.contradict(&f.ctx, fact.id, event).await.unwrap()
            };
            assert!((0.0..=1.0).contains(&updated.confidence));
            if i % 2 == 0 {
                assert!(updated.confidence >= last);
            } else {
                assert!(updated.confidence <= last);
            }
            last = updated.confidence;
        }
    }

    #[tokio::test]
    async fn test_forget_excludes_from_recall() {
        let f = fixture().await;
        let event = seed_event(&f, "observed").await;
        let (fact, _) = f
            .semantic
            .remember(&f.ctx, fact_input("forget me", "misc", vec![event]))
            .await
            .unwrap();
        f.semantic.forget(&f.ctx, fact.id).await.unwrap();

        let results = f
            .semantic
            .recall(&f.ctx, "forget", None, None, 10, true, crate::search::DEFAULT_ALPHA)
            .await
            .unwrap();
        assert!(results.is_empty());

        // Still present for audit
        let archived = f.semantic.get_fact(&f.ctx, fact.id).await.unwrap();
        assert!(archived.archived);
    }

    #[tokio::test]
    async fn test_low_confidence_excluded_unless_requested() {
        let f = fixture().await;
        let event = seed_event(&f, "weak signal").await;
        let (fact, _) = f
            .semantic
            .remember(
                &f.ctx,
                FactInput {
                    confidence: Some(0.2),
                    ..fact_input("barely believed", "misc", vec![event])
                },
            )
            .await
            .unwrap();
        assert!(fact.confidence < RETRIEVAL_THRESHOLD);

        let hidden = f
            .semantic
            .recall(&f.ctx, "barely believed", None, None, 10, false, 0.6)
            .await
            .unwrap();
        assert!(hidden.is_empty());

        let shown = f
            .semantic
            .recall(&f.ctx, "barely believed", None, None, 10, true, 0.6)
            .await
            .unwrap();
        assert_eq!(shown.len(), 1);
    }

    #[tokio::test]
    async fn test_hybrid_ranking_prefers_semantic_match() {
        // Controlled embeddings: the query maps near F1 and far from F2.
        let anchor = unit_vector("anchor topic");
        let far = unit_vector("unrelated");
        let embedder = StubEmbedder::new()
            .with_mapping("database connection pool tuning", anchor.clone())
            .with_mapping("how to tune connection pool", crate::testing::blend(&anchor, &far, 0.05))
            .with_mapping("unrelated pool metaphor", far.clone());
        let f = fixture_with(Arc::new(embedder)).await;

        let e1 = seed_event(&f, "observed tuning").await;
        f.semantic
            .remember(
                &f.ctx,
                FactInput {
                    confidence: Some(0.9),
                    ..fact_input("database connection pool tuning", "database", vec![e1])
                },
            )
            .await
            .unwrap();
        f.semantic
            .remember(
                &f.ctx,
                FactInput {
                    confidence: Some(0.9),
                    ..fact_input("unrelated pool metaphor", "prose", vec![e1])
                },
            )
            .await
            .unwrap();

        let query_embedding =
            Embedding::new(crate::testing::blend(&anchor, &far, 0.05));
        let results = f
            .semantic
            .recall(
                &f.ctx,
                "how to tune connection pool",
                Some(&query_embedding),
                None,
                10,
                false,
                0.6,
            )
            .await
            .unwrap();
        assert!(results.len() >= 2);
        assert_eq!(results[0].0.statement, "database connection pool tuning");

        // Same inputs, same ranking: reproducible under fixed alpha
        let again = f
            .semantic
            .recall(
                &f.ctx,
                "how to tune connection pool",
                Some(&query_embedding),
                None,
                10,
                false,
                0.6,
            )
            .await
            .unwrap();
        let ids: Vec<i64> = results.iter().map(|(f, _)| f.id).collect();
        let again_ids: Vec<i64> = again.iter().map(|(f, _)| f.id).collect();
        assert_eq!(ids, again_ids);
    }

    #[tokio::test]
    async fn test_reinforce_missing_event_rejected() {
        let f = fixture().await;
        let event = seed_event(&f, "real").await;
        let (fact, _) = f
            .semantic
            .remember(&f.ctx, fact_input("grounded", "misc", vec![event]))
            .await
            .unwrap();
        let err = f.semantic.reinforce(&f.ctx, fact.id, 9999).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}

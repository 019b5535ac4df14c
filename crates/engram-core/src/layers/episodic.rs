//! Episodic Layer
//!
//! Durable append-only event log with content-hash deduplication. Batches
//! dedup in three stages: an in-memory set within the batch, a bounded LRU of
//! recently seen hashes, and one bulk lookup against persistent state.
//! Embedding generation runs concurrently with the persistent lookup and its
//! failure never blocks insertion.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use rusqlite::{params, types::Value as SqlValue, OptionalExtension};

use crate::config::{IngestConfig, RetentionConfig};
use crate::context::RequestContext;
use crate::embed::{Embedder, Embedding, MAX_BATCH};
use crate::error::{lock_poisoned, Error, Result};
use crate::hash;
use crate::model::{
    datetime_to_nanos, nanos_to_datetime, now_nanos, BatchError, BatchReport, ConsolidationState,
    Event, EventContext, EventFilter, EventInput, EventKind, Outcome, Page, Paginated,
    RecordOutcome,
};
use crate::search::{normalize_bm25, sanitize_fts5_query, Collection, VectorStore};
use crate::storage::Pool;

/// Hard cap on recall page size
pub const MAX_RECALL_LIMIT: u32 = 100;

// ============================================================================
// LAYER
// ============================================================================

/// The episodic event log
pub struct EpisodicLayer {
    pool: Pool,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    /// Recent content hashes → event id, shared across batches
    dedup_cache: Mutex<LruCache<String, i64>>,
    batch_size: usize,
}

impl EpisodicLayer {
    /// Build the layer over shared storage handles
    pub fn new(
        pool: Pool,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: &IngestConfig,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.dedup_lru_size.max(1))
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            pool,
            vectors,
            embedder,
            dedup_cache: Mutex::new(LruCache::new(cache_size)),
            batch_size: config.batch_size.max(1),
        }
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    /// Record a single event; duplicate hashes return the existing id
    pub async fn record_event(
        &self,
        ctx: &RequestContext,
        input: EventInput,
    ) -> Result<RecordOutcome> {
        let mut report = self.record_batch(ctx, vec![input]).await?;
        if let Some(err) = report.errors.pop() {
            return Err(Error::validation(err.reason));
        }
        let id = *report
            .ids
            .first()
            .ok_or_else(|| Error::internal("batch report missing id"))?;
        Ok(if report.inserted == 1 {
            RecordOutcome::Inserted(id)
        } else {
            RecordOutcome::Duplicate(id)
        })
    }

    /// Record up to the configured batch size of events in one transaction
    pub async fn record_batch(
        &self,
        ctx: &RequestContext,
        inputs: Vec<EventInput>,
    ) -> Result<BatchReport> {
        ctx.checkpoint()?;
        if inputs.len() > self.batch_size {
            return Err(Error::validation(format!(
                "batch of {} exceeds maximum of {}",
                inputs.len(),
                self.batch_size
            )));
        }

        let mut report = BatchReport::default();
        report.ids = vec![0; inputs.len()];

        // Stage 0: validate and hash
        let mut candidates: Vec<(usize, EventInput, String)> = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.into_iter().enumerate() {
            match input.validate() {
                Ok(()) => {
                    let hex = hash::hash_event_hex(&input);
                    candidates.push((index, input, hex));
                }
                Err(e) => report.errors.push(BatchError {
                    index,
                    reason: e.detail,
                }),
            }
        }

        // Stage a: within-batch dedup. First occurrence of a hash proceeds;
        // later occurrences resolve to its id after insert.
        let mut first_of: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut in_batch_dups: Vec<(usize, String)> = Vec::new();
        let mut fresh: Vec<(usize, EventInput, String)> = Vec::new();
        for (index, input, hex) in candidates {
            if first_of.contains_key(&hex) {
                in_batch_dups.push((index, hex));
            } else {
                first_of.insert(hex.clone(), index);
                fresh.push((index, input, hex));
            }
        }

        // Stage b: recent-hash LRU
        let mut lru_dups: Vec<(usize, i64)> = Vec::new();
        {
            let mut cache = self.dedup_cache.lock().map_err(lock_poisoned)?;
            fresh.retain(|(index, _, hex)| {
                if let Some(&id) = cache.get(hex) {
                    lru_dups.push((*index, id));
                    false
                } else {
                    true
                }
            });
        }

        // Stage c: one bulk lookup against persistent state, with embedding
        // generation for the fresh contents running concurrently.
        let texts: Vec<String> = fresh.iter().map(|(_, input, _)| input.content.clone()).collect();
        let hashes: Vec<String> = fresh.iter().map(|(_, _, hex)| hex.clone()).collect();

        let (existing, embeddings) = tokio::join!(
            self.lookup_existing(ctx.project_id, hashes.clone()),
            self.embed_best_effort(texts),
        );
        let existing = existing?;

        let mut db_dups: Vec<(usize, i64)> = Vec::new();
        let mut to_insert: Vec<(usize, EventInput, String, Option<Embedding>)> = Vec::new();
        for (pos, (index, input, hex)) in fresh.into_iter().enumerate() {
            if let Some(&id) = existing.get(&hex) {
                db_dups.push((index, id));
            } else {
                let embedding = embeddings.as_ref().and_then(|e| e.get(pos).cloned());
                to_insert.push((index, input, hex, embedding));
            }
        }

        ctx.checkpoint()?;

        // Insert everything new in a single transaction; rollback is total.
        let inserted = self.insert_rows(ctx.project_id, &to_insert).await?;

        // Post-commit: vector index and LRU updates
        for ((_, _, hex, embedding), id) in to_insert.iter().zip(inserted.iter()) {
            if let Some(embedding) = embedding {
                if let Err(e) =
                    self.vectors
                        .add(Collection::Events, ctx.project_id, *id, &embedding.vector)
                {
                    tracing::warn!(event_id = *id, error = %e, "vector index add failed");
                }
            }
            if let Ok(mut cache) = self.dedup_cache.lock() {
                cache.put(hex.clone(), *id);
            }
        }

        // Assemble the report in input order
        for ((index, _, _, embedding), id) in to_insert.iter().zip(inserted.iter()) {
            report.ids[*index] = *id;
            report.inserted += 1;
            if embedding.is_none() {
                report.missing_embeddings += 1;
            }
        }
        for (index, id) in lru_dups.into_iter().chain(db_dups) {
            report.ids[index] = id;
            report.duplicates += 1;
        }
        for (index, hex) in in_batch_dups {
            // Duplicate of an earlier input in this same batch; that input
            // either inserted fresh or resolved to an existing row.
            let first_index = first_of[&hex];
            report.ids[index] = report.ids[first_index];
            report.duplicates += 1;
        }

        Ok(report)
    }

    /// Bulk hash lookup: hex → existing event id
    async fn lookup_existing(
        &self,
        project_id: i64,
        hashes: Vec<String>,
    ) -> Result<std::collections::HashMap<String, i64>> {
        let mut found = std::collections::HashMap::new();
        if hashes.is_empty() {
            return Ok(found);
        }
        let conn = self.pool.acquire().await?;
        let placeholders = vec!["?"; hashes.len()].join(", ");
        let sql = format!(
            "SELECT content_hash, id FROM events
             WHERE project_id = ? AND content_hash IN ({placeholders})"
        );
        let mut values: Vec<SqlValue> = Vec::with_capacity(hashes.len() + 1);
        values.push(SqlValue::Integer(project_id));
        values.extend(hashes.into_iter().map(SqlValue::Text));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (hex, id) = row?;
            found.insert(hex, id);
        }
        Ok(found)
    }

    /// Embed texts in service-sized chunks; None when the embedder is down
    async fn embed_best_effort(&self, texts: Vec<String>) -> Option<Vec<Embedding>> {
        if texts.is_empty() {
            return Some(vec![]);
        }
        if !self.embedder.is_available() {
            return None;
        }
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH) {
            match self.embedder.embed_batch(chunk).await {
                Ok(vectors) => all.extend(vectors),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding failed; events stored without vectors");
                    return None;
                }
            }
        }
        Some(all)
    }

    /// Insert new rows transactionally, returning their ids in order
    async fn insert_rows(
        &self,
        project_id: i64,
        rows: &[(usize, EventInput, String, Option<Embedding>)],
    ) -> Result<Vec<i64>> {
        if rows.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(rows.len());
        {
            let mut insert_event = tx.prepare(
                "INSERT INTO events
                 (project_id, content, kind, outcome, context, content_hash, importance, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let mut insert_embedding = tx.prepare(
                "INSERT INTO event_embeddings (event_id, embedding, dimensions, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (_, input, hex, embedding) in rows {
                let created_at = input
                    .created_at
                    .map(datetime_to_nanos)
                    .unwrap_or_else(now_nanos);
                let context_json = serde_json::to_string(&input.context)?;
                insert_event.execute(params![
                    project_id,
                    input.content,
                    input.kind.as_str(),
                    input.outcome.as_str(),
                    context_json,
                    hex,
                    input.importance,
                    created_at,
                ])?;
                let id = tx.last_insert_rowid();
                if let Some(embedding) = embedding {
                    insert_embedding.execute(params![
                        id,
                        embedding.to_bytes(),
                        embedding.dimensions() as i64,
                        created_at,
                    ])?;
                }
                ids.push(id);
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    // ========================================================================
    // RECALL
    // ========================================================================

    /// Recall events matching a filter, newest first, paginated
    pub async fn recall_events(
        &self,
        ctx: &RequestContext,
        filter: &EventFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Paginated<Event>> {
        ctx.checkpoint()?;
        let limit = limit.clamp(1, MAX_RECALL_LIMIT);

        let (where_sql, values) = build_filter(ctx.project_id, filter);
        let conn = self.pool.acquire().await?;

        let count_sql = format!("SELECT COUNT(*) FROM events e {where_sql}");
        let total_count: i64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let select_sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e {where_sql}
             ORDER BY e.created_at DESC, e.id DESC
             LIMIT ? OFFSET ?"
        );
        let mut select_values = values;
        select_values.push(SqlValue::Integer(i64::from(limit)));
        select_values.push(SqlValue::Integer(i64::from(offset)));
        let mut stmt = conn.prepare(&select_sql)?;
        let items: Vec<Event> = stmt
            .query_map(rusqlite::params_from_iter(select_values.iter()), map_event_row)?
            .collect::<rusqlite::Result<_>>()?;

        Ok(Paginated {
            items,
            page: Page::new(limit, offset, total_count as u64),
        })
    }

    /// Fetch one event
    pub async fn get_event(&self, ctx: &RequestContext, id: i64) -> Result<Event> {
        let conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e WHERE e.project_id = ?1 AND e.id = ?2"
        );
        conn.query_row(&sql, params![ctx.project_id, id], map_event_row)
            .optional()?
            .ok_or_else(|| Error::not_found("event", id))
    }

    /// Lexical + semantic search over events, for unified retrieval
    pub async fn search(
        &self,
        ctx: &RequestContext,
        query: &str,
        query_embedding: Option<&Embedding>,
        limit: usize,
    ) -> Result<Vec<(Event, f32)>> {
        ctx.checkpoint()?;
        let conn = self.pool.acquire().await?;

        let sanitized = sanitize_fts5_query(query);
        let lexical: Vec<(i64, f32)> = if sanitized.is_empty() {
            vec![]
        } else {
            let mut stmt = conn.prepare(
                "SELECT e.id, rank FROM events e
                 JOIN events_fts fts ON e.id = fts.rowid
                 WHERE events_fts MATCH ?1 AND e.project_id = ?2
                 ORDER BY rank LIMIT ?3",
            )?;
            let rows: Vec<(i64, f64)> = stmt
                .query_map(params![sanitized, ctx.project_id, limit as i64 * 2], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<rusqlite::Result<_>>()?;
            normalize_bm25(rows)
        };
        drop(conn);

        let semantic: Vec<(i64, f32)> = match query_embedding {
            Some(embedding) => self.vectors.search(
                Collection::Events,
                ctx.project_id,
                &embedding.vector,
                limit * 2,
                0.0,
            )?,
            None => vec![],
        };

        let fused = crate::search::fuse(&lexical, &semantic, crate::search::DEFAULT_ALPHA);
        let mut results = Vec::with_capacity(limit.min(fused.len()));
        for scored in fused.into_iter().take(limit) {
            if let Ok(event) = self.get_event(ctx, scored.id).await {
                results.push((event, scored.score));
            }
        }
        Ok(results)
    }

    // ========================================================================
    // CURSORS
    // ========================================================================

    /// Persisted cursor for a source, if any
    pub async fn cursor_for_source(
        &self,
        ctx: &RequestContext,
        source_id: &str,
    ) -> Result<Option<String>> {
        let conn = self.pool.acquire().await?;
        let cursor = conn
            .query_row(
                "SELECT cursor FROM ingest_cursors WHERE project_id = ?1 AND source_id = ?2",
                params![ctx.project_id, source_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    /// Persist a source cursor verbatim
    pub async fn advance_cursor(
        &self,
        ctx: &RequestContext,
        source_id: &str,
        cursor: &str,
    ) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.execute(
            "INSERT INTO ingest_cursors (project_id, source_id, cursor, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (project_id, source_id) DO UPDATE SET
               cursor = excluded.cursor, updated_at = excluded.updated_at",
            params![ctx.project_id, source_id, cursor, now_nanos()],
        )?;
        Ok(())
    }

    // ========================================================================
    // CONSOLIDATION SUPPORT
    // ========================================================================

    /// Unsealed events in a time window, oldest first, with embeddings
    pub async fn unsealed_in_window(
        &self,
        ctx: &RequestContext,
        window_start: i64,
        window_end: i64,
        limit: usize,
    ) -> Result<Vec<(Event, Option<Embedding>)>> {
        let conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS}, emb.embedding FROM events e
             LEFT JOIN event_embeddings emb ON emb.event_id = e.id
             WHERE e.project_id = ?1 AND e.consolidation_state = 'unsealed'
               AND e.created_at >= ?2 AND e.created_at < ?3
             ORDER BY e.created_at ASC, e.id ASC
             LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![ctx.project_id, window_start, window_end, limit as i64],
            |row| {
                let event = map_event_row(row)?;
                let blob: Option<Vec<u8>> = row.get(EVENT_COLUMN_COUNT)?;
                Ok((event, blob))
            },
        )?;
        let mut results = Vec::new();
        for row in rows {
            let (event, blob) = row?;
            let embedding = blob.as_deref().and_then(Embedding::from_bytes);
            results.push((event, embedding));
        }
        Ok(results)
    }

    /// Count events without embeddings, flagged for backfill
    pub async fn missing_embedding_count(&self, ctx: &RequestContext) -> Result<u64> {
        let conn = self.pool.acquire().await?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events e
             LEFT JOIN event_embeddings emb ON emb.event_id = e.id
             WHERE e.project_id = ?1 AND emb.event_id IS NULL",
            params![ctx.project_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Re-embed up to `limit` events recorded without vectors
    pub async fn backfill_embeddings(&self, ctx: &RequestContext, limit: usize) -> Result<usize> {
        if !self.embedder.is_available() {
            return Ok(0);
        }
        let pending: Vec<(i64, String)> = {
            let conn = self.pool.acquire().await?;
            let mut stmt = conn.prepare(
                "SELECT e.id, e.content FROM events e
                 LEFT JOIN event_embeddings emb ON emb.event_id = e.id
                 WHERE e.project_id = ?1 AND emb.event_id IS NULL
                 ORDER BY e.id ASC LIMIT ?2",
            )?;
            stmt.query_map(params![ctx.project_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let mut done = 0;
        for chunk in pending.chunks(MAX_BATCH) {
            ctx.checkpoint()?;
            let texts: Vec<String> = chunk.iter().map(|(_, c)| c.clone()).collect();
            let vectors = match self.embedder.embed_batch(&texts).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "embedding backfill halted");
                    break;
                }
            };
            let conn = self.pool.acquire().await?;
            for ((id, _), embedding) in chunk.iter().zip(vectors.iter()) {
                conn.execute(
                    "INSERT OR REPLACE INTO event_embeddings
                     (event_id, embedding, dimensions, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id,
                        embedding.to_bytes(),
                        embedding.dimensions() as i64,
                        now_nanos()
                    ],
                )?;
                self.vectors
                    .add(Collection::Events, ctx.project_id, *id, &embedding.vector)?;
                done += 1;
            }
        }
        Ok(done)
    }

    // ========================================================================
    // RETENTION
    // ========================================================================

    /// Delete sealed events older than the retention window, unless cited
    ///
    /// A cited event (fact source or relation evidence) is never removed.
    pub async fn retention_sweep(
        &self,
        ctx: &RequestContext,
        config: &RetentionConfig,
    ) -> Result<usize> {
        let cutoff = now_nanos() - (config.event_max_age_days as i64) * 86_400_000_000_000;
        let conn = self.pool.acquire().await?;
        let deleted = conn.execute(
            "DELETE FROM events
             WHERE project_id = ?1
               AND consolidation_state = 'sealed'
               AND created_at < ?2
               AND NOT EXISTS (SELECT 1 FROM fact_sources fs WHERE fs.event_id = events.id)
               AND NOT EXISTS (SELECT 1 FROM relation_evidence re WHERE re.event_id = events.id)",
            params![ctx.project_id, cutoff],
        )?;
        if deleted > 0 {
            tracing::info!(project_id = ctx.project_id, deleted, "retention sweep removed events");
        }
        Ok(deleted)
    }

    /// Total events in the project (test and stats hook)
    pub async fn count(&self, ctx: &RequestContext) -> Result<u64> {
        let conn = self.pool.acquire().await?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE project_id = ?1",
            params![ctx.project_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

/// Column list matching [`map_event_row`]
pub(crate) const EVENT_COLUMNS: &str = "e.id, e.project_id, e.content, e.kind, e.outcome, \
     e.context, e.content_hash, e.importance, e.consolidation_state, e.consolidation_run_id, \
     e.created_at, e.version, \
     EXISTS (SELECT 1 FROM event_embeddings x WHERE x.event_id = e.id)";

/// Number of columns in [`EVENT_COLUMNS`]
pub(crate) const EVENT_COLUMN_COUNT: usize = 13;

/// Map a row selected with [`EVENT_COLUMNS`] to an [`Event`]
pub(crate) fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let kind: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    let context_json: String = row.get(5)?;
    let state: String = row.get(8)?;
    Ok(Event {
        id: row.get(0)?,
        project_id: row.get(1)?,
        content: row.get(2)?,
        kind: EventKind::parse_name(&kind).unwrap_or_default(),
        outcome: Outcome::parse_name(&outcome).unwrap_or_default(),
        context: serde_json::from_str::<EventContext>(&context_json).unwrap_or_default(),
        content_hash: row.get(6)?,
        importance: row.get(7)?,
        consolidation_state: if state == "sealed" {
            ConsolidationState::Sealed
        } else {
            ConsolidationState::Unsealed
        },
        consolidation_run_id: row.get(9)?,
        created_at: nanos_to_datetime(row.get(10)?),
        version: row.get(11)?,
        has_embedding: row.get::<_, i64>(12)? != 0,
    })
}

/// Build the WHERE clause and bound values for an event filter
fn build_filter(project_id: i64, filter: &EventFilter) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["e.project_id = ?".to_string()];
    let mut values: Vec<SqlValue> = vec![SqlValue::Integer(project_id)];

    if let Some(since) = filter.since {
        clauses.push("e.created_at >= ?".to_string());
        values.push(SqlValue::Integer(datetime_to_nanos(since)));
    }
    if let Some(until) = filter.until {
        clauses.push("e.created_at < ?".to_string());
        values.push(SqlValue::Integer(datetime_to_nanos(until)));
    }
    if let Some(kind) = filter.kind {
        clauses.push("e.kind = ?".to_string());
        values.push(SqlValue::Text(kind.as_str().to_string()));
    }
    if let Some(outcome) = filter.outcome {
        clauses.push("e.outcome = ?".to_string());
        values.push(SqlValue::Text(outcome.as_str().to_string()));
    }
    if let Some(session) = &filter.session {
        clauses.push("json_extract(e.context, '$.session') = ?".to_string());
        values.push(SqlValue::Text(session.clone()));
    }
    for (key, value) in &filter.context {
        // Context keys become JSON paths inside the SQL text; only identifier
        // characters are allowed through.
        if key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && !key.is_empty() {
            clauses.push(format!("json_extract(e.context, '$.{key}') = ?"));
            values.push(SqlValue::Text(value.clone()));
        }
    }
    if let Some(query) = &filter.query {
        let sanitized = sanitize_fts5_query(query);
        if !sanitized.is_empty() {
            clauses.push(
                "e.id IN (SELECT rowid FROM events_fts WHERE events_fts MATCH ?)".to_string(),
            );
            values.push(SqlValue::Text(sanitized));
        }
    }

    (format!("WHERE {}", clauses.join(" AND ")), values)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::testing::StubEmbedder;

    fn layer() -> (tempfile::TempDir, EpisodicLayer, RequestContext) {
        let dir = tempfile::tempdir().unwrap();
        let pool =
            crate::storage::open(&dir.path().join("test.db"), &StorageConfig::default()).unwrap();
        let project_id = {
            let conn = pool.acquire_blocking().unwrap();
            crate::storage::resolve_project(&conn, "test").unwrap()
        };
        let layer = EpisodicLayer::new(
            pool,
            Arc::new(VectorStore::new().unwrap()),
            Arc::new(StubEmbedder::new()),
            &IngestConfig::default(),
        );
        (dir, layer, RequestContext::new(project_id))
    }

    fn input(content: &str) -> EventInput {
        EventInput {
            content: content.to_string(),
            kind: EventKind::ToolUse,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_record_then_duplicate() {
        let (_dir, layer, ctx) = layer();
        let first = layer.record_event(&ctx, input("cargo test passed")).await.unwrap();
        assert!(first.is_inserted());
        let second = layer.record_event(&ctx, input("cargo test passed")).await.unwrap();
        assert!(!second.is_inserted());
        assert_eq!(first.id(), second.id());
        assert_eq!(layer.count(&ctx).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dedup_under_burst() {
        let (_dir, layer, ctx) = layer();
        // 1,000 events where 200 duplicate the first 200
        let mut inputs: Vec<EventInput> = (0..800).map(|i| input(&format!("event {i}"))).collect();
        for i in 0..200 {
            inputs.push(input(&format!("event {i}")));
        }

        let mut inserted = 0;
        let mut duplicates = 0;
        for chunk in inputs.chunks(500) {
            let report = layer.record_batch(&ctx, chunk.to_vec()).await.unwrap();
            inserted += report.inserted;
            duplicates += report.duplicates;
        }
        assert_eq!(inserted, 800);
        assert_eq!(duplicates, 200);
        assert_eq!(layer.count(&ctx).await.unwrap(), 800);
    }

    #[tokio::test]
    async fn test_within_batch_duplicates_share_id() {
        let (_dir, layer, ctx) = layer();
        let report = layer
            .record_batch(&ctx, vec![input("same"), input("same"), input("other")])
            .await
            .unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.ids[0], report.ids[1]);
        assert_ne!(report.ids[0], report.ids[2]);
    }

    #[tokio::test]
    async fn test_invalid_inputs_reported_not_fatal() {
        let (_dir, layer, ctx) = layer();
        let bad = EventInput {
            content: String::new(),
            ..Default::default()
        };
        let report = layer
            .record_batch(&ctx, vec![input("good"), bad])
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 1);
    }

    #[tokio::test]
    async fn test_recall_orders_newest_first() {
        let (_dir, layer, ctx) = layer();
        let mut early = input("first");
        early.created_at = Some(chrono::Utc::now() - chrono::Duration::hours(2));
        let mut late = input("second");
        late.created_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        layer.record_batch(&ctx, vec![early, late]).await.unwrap();

        let page = layer
            .recall_events(&ctx, &EventFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].content, "second");
        assert_eq!(page.page.total_count, 2);
        assert!(!page.page.has_more);
    }

    #[tokio::test]
    async fn test_recall_filters_by_kind_and_outcome() {
        let (_dir, layer, ctx) = layer();
        let mut failed = input("deploy failed");
        failed.outcome = Outcome::Failure;
        let mut ok = input("deploy ok");
        ok.outcome = Outcome::Success;
        layer.record_batch(&ctx, vec![failed, ok]).await.unwrap();

        let filter = EventFilter {
            outcome: Some(Outcome::Failure),
            ..Default::default()
        };
        let page = layer.recall_events(&ctx, &filter, 10, 0).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].content, "deploy failed");
    }

    #[tokio::test]
    async fn test_recall_limit_capped() {
        let (_dir, layer, ctx) = layer();
        layer.record_batch(&ctx, vec![input("one")]).await.unwrap();
        let page = layer
            .recall_events(&ctx, &EventFilter::default(), 10_000, 0)
            .await
            .unwrap();
        assert_eq!(page.page.limit, MAX_RECALL_LIMIT);
    }

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let (_dir, layer, ctx) = layer();
        assert!(layer.cursor_for_source(&ctx, "git").await.unwrap().is_none());
        layer.advance_cursor(&ctx, "git", "sha:abc123").await.unwrap();
        assert_eq!(
            layer.cursor_for_source(&ctx, "git").await.unwrap().as_deref(),
            Some("sha:abc123")
        );
        layer.advance_cursor(&ctx, "git", "sha:def456").await.unwrap();
        assert_eq!(
            layer.cursor_for_source(&ctx, "git").await.unwrap().as_deref(),
            Some("sha:def456")
        );
    }

    #[tokio::test]
    async fn test_unsealed_window_selection() {
        let (_dir, layer, ctx) = layer();
        let now = chrono::Utc::now();
        let mut inside = input("inside window");
        inside.created_at = Some(now - chrono::Duration::hours(1));
        let mut outside = input("outside window");
        outside.created_at = Some(now - chrono::Duration::days(3));
        layer.record_batch(&ctx, vec![inside, outside]).await.unwrap();

        let start = datetime_to_nanos(now - chrono::Duration::days(1));
        let end = datetime_to_nanos(now);
        let selected = layer
            .unsealed_in_window(&ctx, start, end, 100)
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0.content, "inside window");
        assert!(selected[0].1.is_some());
    }

    #[tokio::test]
    async fn test_embedder_outage_inserts_null_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let pool =
            crate::storage::open(&dir.path().join("test.db"), &StorageConfig::default()).unwrap();
        let project_id = {
            let conn = pool.acquire_blocking().unwrap();
            crate::storage::resolve_project(&conn, "test").unwrap()
        };
        let layer = EpisodicLayer::new(
            pool,
            Arc::new(VectorStore::new().unwrap()),
            Arc::new(crate::testing::StubEmbedder::offline()),
            &IngestConfig::default(),
        );
        let ctx = RequestContext::new(project_id);

        let report = layer
            .record_batch(&ctx, vec![input("no vector for me")])
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.missing_embeddings, 1);
        assert_eq!(layer.missing_embedding_count(&ctx).await.unwrap(), 1);
    }
}

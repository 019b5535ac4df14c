//! Knowledge Graph Layer
//!
//! Entity and relation store. Entities merge on (project, name, kind);
//! relations merge on (from, to, kind) by averaging weight and unioning
//! evidence. Communities come from label propagation over the undirected
//! projection, recomputed lazily once edge churn exceeds 5%.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use rusqlite::{params, OptionalExtension};

use crate::context::RequestContext;
use crate::error::{lock_poisoned, Error, Result};
use crate::model::{
    nanos_to_datetime, now_nanos, Entity, EntityInput, Relation, RelationInput,
};
use crate::storage::Pool;

/// Maximum BFS depth for neighbor queries
pub const MAX_NEIGHBOR_DEPTH: u32 = 3;

/// Edge churn fraction that invalidates the community partition
pub const COMMUNITY_CHURN_THRESHOLD: f64 = 0.05;

/// Label propagation iteration cap
const MAX_PROPAGATION_ROUNDS: usize = 10;

// ============================================================================
// LAYER
// ============================================================================

/// The entity/relation store
pub struct GraphLayer {
    pool: Pool,
    churn: Mutex<HashMap<i64, ChurnState>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChurnState {
    /// Edge count when communities were last computed
    edges_at_compute: usize,
    /// Edge mutations since then
    mutations: usize,
    /// Whether a partition has ever been computed
    computed: bool,
}

impl GraphLayer {
    /// Build the layer over the shared pool
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            churn: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // ENTITIES
    // ========================================================================

    /// Insert or merge an entity on (project, name, kind)
    ///
    /// Properties merge key-wise; incoming values win.
    pub async fn upsert_entity(&self, ctx: &RequestContext, input: EntityInput) -> Result<Entity> {
        ctx.checkpoint()?;
        input.validate()?;

        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, properties FROM entities
                 WHERE project_id = ?1 AND name = ?2 AND kind = ?3",
                params![ctx.project_id, input.name, input.kind],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let id = match existing {
            Some((id, properties_json)) => {
                let mut merged: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(&properties_json).unwrap_or_default();
                if let serde_json::Value::Object(incoming) = &input.properties {
                    for (key, value) in incoming {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                tx.execute(
                    "UPDATE entities SET properties = ?2, version = version + 1 WHERE id = ?1",
                    params![id, serde_json::to_string(&merged)?],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO entities (project_id, name, kind, properties, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        ctx.project_id,
                        input.name,
                        input.kind,
                        serde_json::to_string(&input.properties)?,
                        now_nanos()
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };
        tx.commit()?;
        drop(conn);

        self.get_entity(ctx, id).await
    }

    /// Fetch one entity
    pub async fn get_entity(&self, ctx: &RequestContext, id: i64) -> Result<Entity> {
        let conn = self.pool.acquire().await?;
        conn.query_row(
            &format!("SELECT {ENTITY_COLUMNS} FROM entities n WHERE n.project_id = ?1 AND n.id = ?2"),
            params![ctx.project_id, id],
            map_entity_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("entity", id))
    }

    /// Find an entity id by exact (name, kind)
    pub async fn find_entity(
        &self,
        ctx: &RequestContext,
        name: &str,
        kind: &str,
    ) -> Result<Option<i64>> {
        let conn = self.pool.acquire().await?;
        let id = conn
            .query_row(
                "SELECT id FROM entities WHERE project_id = ?1 AND name = ?2 AND kind = ?3",
                params![ctx.project_id, name, kind],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Entities whose names appear inside the query text
    pub async fn entities_in_text(
        &self,
        ctx: &RequestContext,
        text: &str,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let lowered = text.to_lowercase();
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities n WHERE n.project_id = ?1"
        ))?;
        let all: Vec<Entity> = stmt
            .query_map(params![ctx.project_id], map_entity_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(all
            .into_iter()
            .filter(|e| e.name.len() >= 3 && lowered.contains(&e.name.to_lowercase()))
            .take(limit)
            .collect())
    }

    /// Delete an entity; relations cascade
    pub async fn delete_entity(&self, ctx: &RequestContext, id: i64) -> Result<()> {
        let conn = self.pool.acquire().await?;
        let deleted = conn.execute(
            "DELETE FROM entities WHERE project_id = ?1 AND id = ?2",
            params![ctx.project_id, id],
        )?;
        if deleted == 0 {
            return Err(Error::not_found("entity", id));
        }
        self.note_churn(ctx.project_id, 1)?;
        Ok(())
    }

    // ========================================================================
    // RELATIONS
    // ========================================================================

    /// Create or merge a relation on (from, to, kind)
    ///
    /// A merge averages the stored and incoming weight and unions evidence.
    pub async fn link(&self, ctx: &RequestContext, input: RelationInput) -> Result<Relation> {
        ctx.checkpoint()?;
        input.validate()?;

        // Endpoints must exist in this project
        for endpoint in [input.from_id, input.to_id] {
            self.get_entity(ctx, endpoint).await?;
        }
        if let Some(event_id) = input.evidence_event_id {
            let conn = self.pool.acquire().await?;
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM events WHERE project_id = ?1 AND id = ?2",
                    params![ctx.project_id, event_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(Error::not_found("evidence event", event_id));
            }
        }

        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;
        let existing: Option<(i64, f64)> = tx
            .query_row(
                "SELECT id, weight FROM relations
                 WHERE project_id = ?1 AND from_id = ?2 AND to_id = ?3 AND kind = ?4",
                params![ctx.project_id, input.from_id, input.to_id, input.kind],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let id = match existing {
            Some((id, weight)) => {
                let merged = (weight + input.weight) / 2.0;
                tx.execute(
                    "UPDATE relations SET weight = ?2, version = version + 1 WHERE id = ?1",
                    params![id, merged],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO relations (project_id, from_id, to_id, kind, weight, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        ctx.project_id,
                        input.from_id,
                        input.to_id,
                        input.kind,
                        input.weight,
                        now_nanos()
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };
        if let Some(event_id) = input.evidence_event_id {
            tx.execute(
                "INSERT OR IGNORE INTO relation_evidence (relation_id, event_id) VALUES (?1, ?2)",
                params![id, event_id],
            )?;
        }
        tx.commit()?;
        drop(conn);

        self.note_churn(ctx.project_id, 1)?;
        self.get_relation(ctx, id).await
    }

    /// Fetch one relation
    pub async fn get_relation(&self, ctx: &RequestContext, id: i64) -> Result<Relation> {
        let conn = self.pool.acquire().await?;
        conn.query_row(
            &format!(
                "SELECT {RELATION_COLUMNS} FROM relations r WHERE r.project_id = ?1 AND r.id = ?2"
            ),
            params![ctx.project_id, id],
            map_relation_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("relation", id))
    }

    // ========================================================================
    // TRAVERSAL
    // ========================================================================

    /// Bounded BFS over the undirected projection from one entity
    pub async fn neighbors(
        &self,
        ctx: &RequestContext,
        entity_id: i64,
        kind: Option<&str>,
        depth: u32,
    ) -> Result<Vec<Entity>> {
        ctx.checkpoint()?;
        let depth = depth.clamp(1, MAX_NEIGHBOR_DEPTH);
        self.get_entity(ctx, entity_id).await?;

        let adjacency = self.load_adjacency(ctx.project_id, kind).await?;

        let mut seen: HashSet<i64> = HashSet::from([entity_id]);
        let mut frontier: VecDeque<(i64, u32)> = VecDeque::from([(entity_id, 0)]);
        let mut found: Vec<i64> = Vec::new();
        while let Some((node, dist)) = frontier.pop_front() {
            if dist == depth {
                continue;
            }
            if let Some(nexts) = adjacency.get(&node) {
                for &(next, _) in nexts {
                    if seen.insert(next) {
                        found.push(next);
                        frontier.push_back((next, dist + 1));
                    }
                }
            }
        }

        let mut entities = Vec::with_capacity(found.len());
        for id in found {
            entities.push(self.get_entity(ctx, id).await?);
        }
        Ok(entities)
    }

    // ========================================================================
    // COMMUNITIES
    // ========================================================================

    /// Community partition: entity id → community label
    ///
    /// Label propagation over the undirected, weight-summed projection.
    /// Recomputed only when edge churn since the last pass exceeds 5%.
    pub async fn communities(&self, ctx: &RequestContext) -> Result<HashMap<i64, i64>> {
        ctx.checkpoint()?;
        if self.partition_is_fresh(ctx.project_id).await? {
            return self.load_partition(ctx).await;
        }

        let adjacency = self.load_adjacency(ctx.project_id, None).await?;
        let all_ids = self.all_entity_ids(ctx.project_id).await?;

        // Every node starts in its own community; each round adopts the
        // neighbor label with the highest summed weight. Ties pick the
        // smaller label so the pass is deterministic.
        let mut labels: HashMap<i64, i64> = all_ids.iter().map(|&id| (id, id)).collect();
        for _ in 0..MAX_PROPAGATION_ROUNDS {
            let mut changed = false;
            for &node in &all_ids {
                let Some(nexts) = adjacency.get(&node) else {
                    continue;
                };
                let mut weight_by_label: HashMap<i64, f64> = HashMap::new();
                for &(next, weight) in nexts {
                    if let Some(&label) = labels.get(&next) {
                        *weight_by_label.entry(label).or_default() += weight;
                    }
                }
                let best = weight_by_label.into_iter().max_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.0.cmp(&a.0))
                });
                if let Some((label, _)) = best {
                    if labels.get(&node) != Some(&label) {
                        labels.insert(node, label);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        // Persist labels and reset the churn counter
        {
            let conn = self.pool.acquire().await?;
            for (&id, &label) in &labels {
                conn.execute(
                    "UPDATE entities SET community = ?2 WHERE id = ?1",
                    params![id, label],
                )?;
            }
        }
        let edge_count = self.edge_count(ctx.project_id).await?;
        let mut churn = self.churn.lock().map_err(lock_poisoned)?;
        churn.insert(
            ctx.project_id,
            ChurnState {
                edges_at_compute: edge_count,
                mutations: 0,
                computed: true,
            },
        );

        Ok(labels)
    }

    /// Whether the stored partition is still within the churn budget
    async fn partition_is_fresh(&self, project_id: i64) -> Result<bool> {
        let state = {
            let churn = self.churn.lock().map_err(lock_poisoned)?;
            churn.get(&project_id).copied().unwrap_or_default()
        };
        if !state.computed {
            return Ok(false);
        }
        let baseline = state.edges_at_compute.max(1);
        Ok((state.mutations as f64 / baseline as f64) <= COMMUNITY_CHURN_THRESHOLD)
    }

    async fn load_partition(&self, ctx: &RequestContext) -> Result<HashMap<i64, i64>> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT id, community FROM entities WHERE project_id = ?1 AND community IS NOT NULL",
        )?;
        let partition = stmt
            .query_map(params![ctx.project_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(partition)
    }

    fn note_churn(&self, project_id: i64, mutations: usize) -> Result<()> {
        let mut churn = self.churn.lock().map_err(lock_poisoned)?;
        churn.entry(project_id).or_default().mutations += mutations;
        Ok(())
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Average relation weight (the meta layer's coherence signal)
    pub async fn mean_relation_weight(&self, ctx: &RequestContext) -> Result<f64> {
        let conn = self.pool.acquire().await?;
        let mean: Option<f64> = conn.query_row(
            "SELECT AVG(weight) FROM relations WHERE project_id = ?1",
            params![ctx.project_id],
            |row| row.get(0),
        )?;
        Ok(mean.unwrap_or(0.0))
    }

    /// Entity count in the project
    pub async fn entity_count(&self, ctx: &RequestContext) -> Result<u64> {
        let conn = self.pool.acquire().await?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE project_id = ?1",
            params![ctx.project_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    async fn edge_count(&self, project_id: i64) -> Result<usize> {
        let conn = self.pool.acquire().await?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM relations WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn all_entity_ids(&self, project_id: i64) -> Result<Vec<i64>> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare("SELECT id FROM entities WHERE project_id = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![project_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    /// Undirected adjacency with per-edge weights
    async fn load_adjacency(
        &self,
        project_id: i64,
        kind: Option<&str>,
    ) -> Result<HashMap<i64, Vec<(i64, f64)>>> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT from_id, to_id, weight FROM relations
             WHERE project_id = ?1 AND (?2 IS NULL OR kind = ?2)",
        )?;
        let mut adjacency: HashMap<i64, Vec<(i64, f64)>> = HashMap::new();
        let rows = stmt.query_map(params![project_id, kind], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;
        for row in rows {
            let (from, to, weight) = row?;
            adjacency.entry(from).or_default().push((to, weight));
            adjacency.entry(to).or_default().push((from, weight));
        }
        Ok(adjacency)
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

/// Column list matching [`map_entity_row`]
const ENTITY_COLUMNS: &str =
    "n.id, n.project_id, n.name, n.kind, n.properties, n.community, n.created_at, n.version";

fn map_entity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    let properties_json: String = row.get(4)?;
    Ok(Entity {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        kind: row.get(3)?,
        properties: serde_json::from_str(&properties_json)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        community: row.get(5)?,
        created_at: nanos_to_datetime(row.get(6)?),
        version: row.get(7)?,
    })
}

/// Column list matching [`map_relation_row`]
const RELATION_COLUMNS: &str = "r.id, r.project_id, r.from_id, r.to_id, r.kind, r.weight, \
     r.created_at, r.version, \
     (SELECT group_concat(event_id) FROM relation_evidence re WHERE re.relation_id = r.id)";

fn map_relation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relation> {
    let evidence: Option<String> = row.get(8)?;
    Ok(Relation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        from_id: row.get(2)?,
        to_id: row.get(3)?,
        kind: row.get(4)?,
        weight: row.get(5)?,
        created_at: nanos_to_datetime(row.get(6)?),
        version: row.get(7)?,
        evidence_event_ids: evidence
            .map(|s| s.split(',').filter_map(|id| id.parse().ok()).collect())
            .unwrap_or_default(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn layer() -> (tempfile::TempDir, GraphLayer, RequestContext) {
        let dir = tempfile::tempdir().unwrap();
        let pool =
            crate::storage::open(&dir.path().join("test.db"), &StorageConfig::default()).unwrap();
        let project_id = {
            let conn = pool.acquire_blocking().unwrap();
            crate::storage::resolve_project(&conn, "test").unwrap()
        };
        (dir, GraphLayer::new(pool), RequestContext::new(project_id))
    }

    fn entity(name: &str, kind: &str) -> EntityInput {
        EntityInput {
            name: name.to_string(),
            kind: kind.to_string(),
            properties: serde_json::json!({}),
        }
    }

    fn relation(from: i64, to: i64, weight: f64) -> RelationInput {
        RelationInput {
            from_id: from,
            to_id: to,
            kind: "depends_on".to_string(),
            weight,
            evidence_event_id: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_merges_properties() {
        let (_dir, layer, ctx) = layer();
        let first = layer
            .upsert_entity(
                &ctx,
                EntityInput {
                    properties: serde_json::json!({"lang": "rust", "loc": 100}),
                    ..entity("src/pool.rs", "file")
                },
            )
            .await
            .unwrap();
        let second = layer
            .upsert_entity(
                &ctx,
                EntityInput {
                    properties: serde_json::json!({"loc": 150}),
                    ..entity("src/pool.rs", "file")
                },
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.properties["lang"], "rust");
        assert_eq!(second.properties["loc"], 150);
    }

    #[tokio::test]
    async fn test_link_merges_weight_average() {
        let (_dir, layer, ctx) = layer();
        let a = layer.upsert_entity(&ctx, entity("a", "module")).await.unwrap();
        let b = layer.upsert_entity(&ctx, entity("b", "module")).await.unwrap();

        let first = layer.link(&ctx, relation(a.id, b.id, 0.4)).await.unwrap();
        let second = layer.link(&ctx, relation(a.id, b.id, 0.8)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!((second.weight - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_link_requires_endpoints() {
        let (_dir, layer, ctx) = layer();
        let a = layer.upsert_entity(&ctx, entity("a", "module")).await.unwrap();
        let err = layer.link(&ctx, relation(a.id, 999, 0.5)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_neighbors_bounded_bfs() {
        let (_dir, layer, ctx) = layer();
        // Chain a - b - c - d - e
        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d", "e"] {
            ids.push(layer.upsert_entity(&ctx, entity(name, "node")).await.unwrap().id);
        }
        for pair in ids.windows(2) {
            layer.link(&ctx, relation(pair[0], pair[1], 0.9)).await.unwrap();
        }

        let depth1 = layer.neighbors(&ctx, ids[0], None, 1).await.unwrap();
        assert_eq!(depth1.len(), 1);

        let depth3 = layer.neighbors(&ctx, ids[0], None, 3).await.unwrap();
        assert_eq!(depth3.len(), 3);

        // Depth clamps at 3: requesting more cannot reach "e"
        let clamped = layer.neighbors(&ctx, ids[0], None, 10).await.unwrap();
        assert_eq!(clamped.len(), 3);
    }

    #[tokio::test]
    async fn test_communities_split_disconnected_clusters() {
        let (_dir, layer, ctx) = layer();
        // Two triangles with no edge between them
        let mut ids = Vec::new();
        for name in ["a1", "a2", "a3", "b1", "b2", "b3"] {
            ids.push(layer.upsert_entity(&ctx, entity(name, "node")).await.unwrap().id);
        }
        for (from, to) in [(0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3)] {
            layer.link(&ctx, relation(ids[from], ids[to], 0.9)).await.unwrap();
        }

        let partition = layer.communities(&ctx).await.unwrap();
        let a_label = partition[&ids[0]];
        assert_eq!(partition[&ids[1]], a_label);
        assert_eq!(partition[&ids[2]], a_label);
        let b_label = partition[&ids[3]];
        assert_eq!(partition[&ids[4]], b_label);
        assert_eq!(partition[&ids[5]], b_label);
        assert_ne!(a_label, b_label);
    }

    #[tokio::test]
    async fn test_communities_cached_until_churn() {
        let (_dir, layer, ctx) = layer();
        let mut ids = Vec::new();
        for i in 0..30 {
            ids.push(
                layer
                    .upsert_entity(&ctx, entity(&format!("n{i}"), "node"))
                    .await
                    .unwrap()
                    .id,
            );
        }
        for pair in ids.windows(2) {
            layer.link(&ctx, relation(pair[0], pair[1], 0.5)).await.unwrap();
        }
        let first = layer.communities(&ctx).await.unwrap();

        // One new edge on 29 is ~3.4% churn: partition served from storage
        layer.link(&ctx, relation(ids[0], ids[5], 0.5)).await.unwrap();
        let cached = layer.communities(&ctx).await.unwrap();
        assert_eq!(first, cached);
    }

    #[tokio::test]
    async fn test_delete_entity_cascades() {
        let (_dir, layer, ctx) = layer();
        let a = layer.upsert_entity(&ctx, entity("a", "module")).await.unwrap();
        let b = layer.upsert_entity(&ctx, entity("b", "module")).await.unwrap();
        let rel = layer.link(&ctx, relation(a.id, b.id, 0.5)).await.unwrap();

        layer.delete_entity(&ctx, a.id).await.unwrap();
        let err = layer.get_relation(&ctx, rel.id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_entities_in_text() {
        let (_dir, layer, ctx) = layer();
        layer.upsert_entity(&ctx, entity("pool.rs", "file")).await.unwrap();
        layer.upsert_entity(&ctx, entity("scheduler", "module")).await.unwrap();

        let found = layer
            .entities_in_text(&ctx, "why does pool.rs leak connections", 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "pool.rs");
    }
}

//! Prospective Layer
//!
//! Task/goal DAG with dependency-aware scheduling. The dependency graph is
//! acyclic at every observable moment (DFS check on every edge addition),
//! status transitions are serialized per task by an optimistic version guard,
//! and every transition writes a system event to the episodic log for audit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::layers::episodic::EpisodicLayer;
use crate::model::{
    datetime_to_nanos, nanos_to_datetime, now_nanos, EventContext, EventInput, EventKind, Outcome,
    Priority, Task, TaskInput, TaskStatus,
};
use crate::storage::Pool;

// ============================================================================
// LAYER
// ============================================================================

/// The prospective task store
pub struct ProspectiveLayer {
    pool: Pool,
    episodic: Arc<EpisodicLayer>,
}

impl ProspectiveLayer {
    /// Build the layer; the episodic handle receives transition audit events
    pub fn new(pool: Pool, episodic: Arc<EpisodicLayer>) -> Self {
        Self { pool, episodic }
    }

    // ========================================================================
    // CREATE
    // ========================================================================

    /// Create a task; dependency cycles are rejected at insert time
    pub async fn create_task(&self, ctx: &RequestContext, input: TaskInput) -> Result<Task> {
        ctx.checkpoint()?;
        input.validate()?;

        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;

        // Referenced tasks must exist in this project
        for dep in &input.dependencies {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM tasks WHERE project_id = ?1 AND id = ?2",
                    params![ctx.project_id, dep],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(Error::not_found("dependency task", *dep));
            }
        }
        if let Some(parent) = input.parent_id {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM tasks WHERE project_id = ?1 AND id = ?2",
                    params![ctx.project_id, parent],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(Error::not_found("parent task", parent));
            }
        }

        tx.execute(
            "INSERT INTO tasks
             (project_id, content, status, priority, phase, parent_id,
              estimated_effort_min, deadline, created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                ctx.project_id,
                input.content,
                input.priority.rank(),
                input.phase,
                input.parent_id,
                input.estimated_effort_min,
                input.deadline.map(datetime_to_nanos),
                now_nanos(),
            ],
        )?;
        let task_id = tx.last_insert_rowid();

        // A fresh node with only outgoing edges cannot close a cycle, but the
        // check runs anyway so the invariant never depends on that reasoning.
        let mut edges = load_dependency_edges(&tx, ctx.project_id)?;
        for dep in &input.dependencies {
            edges.entry(task_id).or_default().push(*dep);
        }
        if has_cycle(&edges) {
            return Err(Error::validation(
                "dependency graph would contain a cycle",
            ));
        }

        for dep in &input.dependencies {
            tx.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
                params![task_id, dep],
            )?;
        }
        tx.commit()?;
        drop(conn);

        self.get_task(ctx, task_id).await
    }

    /// Add a dependency edge; rejected when it would close a cycle
    pub async fn add_dependency(
        &self,
        ctx: &RequestContext,
        task_id: i64,
        depends_on_id: i64,
    ) -> Result<()> {
        ctx.checkpoint()?;
        if task_id == depends_on_id {
            return Err(Error::validation("a task cannot depend on itself"));
        }
        self.get_task(ctx, task_id).await?;
        self.get_task(ctx, depends_on_id).await?;

        let mut conn = self.pool.acquire().await?;
        let tx = conn.transaction()?;
        let mut edges = load_dependency_edges(&tx, ctx.project_id)?;
        edges.entry(task_id).or_default().push(depends_on_id);
        if has_cycle(&edges) {
            return Err(Error::validation(format!(
                "dependency {task_id} -> {depends_on_id} would create a cycle"
            )));
        }
        tx.execute(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
            params![task_id, depends_on_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    /// Transition a task through the state machine
    ///
    /// The update is guarded on the task's version: a concurrent transition
    /// loses with `Conflict`. Entering `running` requires every dependency
    /// completed. Every successful transition records a system event.
    pub async fn transition(
        &self,
        ctx: &RequestContext,
        task_id: i64,
        new_status: TaskStatus,
        actual_effort_min: Option<i64>,
    ) -> Result<Task> {
        ctx.checkpoint()?;
        let task = self.get_task(ctx, task_id).await?;

        if !task.status.can_transition_to(new_status) {
            return Err(Error::conflict(format!(
                "illegal transition {} -> {} for task {task_id}",
                task.status, new_status
            )));
        }
        if new_status == TaskStatus::Running {
            let incomplete = self.incomplete_dependencies(ctx, task_id).await?;
            if !incomplete.is_empty() {
                return Err(Error::conflict(format!(
                    "task {task_id} has incomplete dependencies: {incomplete:?}"
                )));
            }
        }

        let updated = {
            let conn = self.pool.acquire().await?;
            conn.execute(
                "UPDATE tasks SET status = ?2, actual_effort_min = COALESCE(?3, actual_effort_min),
                   version = version + 1
                 WHERE id = ?1 AND version = ?4",
                params![task_id, new_status.as_str(), actual_effort_min, task.version],
            )?
        };
        if updated == 0 {
            return Err(Error::conflict(format!(
                "task {task_id} changed concurrently"
            )));
        }

        let after = self.get_task(ctx, task_id).await?;
        self.audit_transition(ctx, &task, &after).await;
        if matches!(new_status, TaskStatus::Completed | TaskStatus::Failed) {
            self.record_metric(ctx, &after).await;
        }
        Ok(after)
    }

    /// Write the transition audit record into the episodic log
    async fn audit_transition(&self, ctx: &RequestContext, before: &Task, after: &Task) {
        let mut context = EventContext::new();
        context.insert("task".to_string(), after.id.to_string());
        context.insert("task_version".to_string(), after.version.to_string());
        if let Some(agent) = &ctx.agent_id {
            context.insert("agent".to_string(), agent.clone());
        }
        let input = EventInput {
            content: format!(
                "task {} transitioned {} -> {}",
                after.id, before.status, after.status
            ),
            kind: EventKind::System,
            outcome: Outcome::Success,
            context,
            ..Default::default()
        };
        if let Err(e) = self.episodic.record_event(ctx, input).await {
            tracing::warn!(task_id = after.id, error = %e, "transition audit event failed");
        }
    }

    /// Emit an execution metric on terminal completion/failure
    async fn record_metric(&self, ctx: &RequestContext, task: &Task) {
        let outcome = if task.status == TaskStatus::Completed {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        let duration_ms = task.actual_effort_min.unwrap_or(0) * 60_000;
        let result = async {
            let conn = self.pool.acquire().await?;
            conn.execute(
                "INSERT INTO execution_metrics
                 (project_id, task_id, duration_ms, outcome, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ctx.project_id, task.id, duration_ms, outcome.as_str(), now_nanos()],
            )?;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(task_id = task.id, error = %e, "execution metric write failed");
        }
    }

    // ========================================================================
    // SCHEDULING QUERIES
    // ========================================================================

    /// Pending tasks whose dependencies are all completed
    ///
    /// Sorted by (priority desc, deadline asc with nulls last, created_at asc).
    pub async fn ready_tasks(
        &self,
        ctx: &RequestContext,
        phase: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        ctx.checkpoint()?;
        let conn = self.pool.acquire().await?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t
             WHERE t.project_id = ?1 AND t.status = 'pending'
               AND (?2 IS NULL OR t.phase = ?2)
               AND NOT EXISTS (
                 SELECT 1 FROM task_dependencies d
                 JOIN tasks dep ON dep.id = d.depends_on_id
                 WHERE d.task_id = t.id AND dep.status != 'completed'
               )
             ORDER BY t.priority DESC,
                      CASE WHEN t.deadline IS NULL THEN 1 ELSE 0 END,
                      t.deadline ASC,
                      t.created_at ASC
             LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params![ctx.project_id, phase, limit as i64], map_task_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(tasks)
    }

    /// Longest path (summed estimated effort) from a goal to any leaf
    pub async fn critical_path(&self, ctx: &RequestContext, goal_id: i64) -> Result<Vec<i64>> {
        ctx.checkpoint()?;
        self.get_task(ctx, goal_id).await?;

        let conn = self.pool.acquire().await?;
        let edges = load_dependency_edges_conn(&conn, ctx.project_id)?;
        let efforts: HashMap<i64, i64> = {
            let mut stmt =
                conn.prepare("SELECT id, COALESCE(estimated_effort_min, 0) FROM tasks WHERE project_id = ?1")?;
            stmt.query_map(params![ctx.project_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?
        };

        // Memoized longest path over the DAG; cycles are impossible by the
        // insert-time invariant.
        let mut memo: HashMap<i64, (i64, Vec<i64>)> = HashMap::new();
        let path = longest_path(goal_id, &edges, &efforts, &mut memo);
        Ok(path.1)
    }

    /// Dependencies of a task that are not yet completed
    async fn incomplete_dependencies(&self, ctx: &RequestContext, task_id: i64) -> Result<Vec<i64>> {
        let conn = self.pool.acquire().await?;
        let mut stmt = conn.prepare(
            "SELECT d.depends_on_id FROM task_dependencies d
             JOIN tasks dep ON dep.id = d.depends_on_id
             WHERE d.task_id = ?1 AND dep.project_id = ?2 AND dep.status != 'completed'",
        )?;
        let ids = stmt
            .query_map(params![task_id, ctx.project_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }

    /// Fetch one task
    pub async fn get_task(&self, ctx: &RequestContext, id: i64) -> Result<Task> {
        let conn = self.pool.acquire().await?;
        let sql =
            format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.project_id = ?1 AND t.id = ?2");
        conn.query_row(&sql, params![ctx.project_id, id], map_task_row)
            .optional()?
            .ok_or_else(|| Error::not_found("task", id))
    }

    /// Count tasks by status (stats hook)
    pub async fn count_by_status(
        &self,
        ctx: &RequestContext,
        status: TaskStatus,
    ) -> Result<u64> {
        let conn = self.pool.acquire().await?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = ?2",
            params![ctx.project_id, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// ============================================================================
// GRAPH HELPERS
// ============================================================================

fn load_dependency_edges(
    tx: &rusqlite::Transaction<'_>,
    project_id: i64,
) -> Result<HashMap<i64, Vec<i64>>> {
    load_edges_impl(&**tx, project_id)
}

fn load_dependency_edges_conn(
    conn: &rusqlite::Connection,
    project_id: i64,
) -> Result<HashMap<i64, Vec<i64>>> {
    load_edges_impl(conn, project_id)
}

fn load_edges_impl(
    conn: &rusqlite::Connection,
    project_id: i64,
) -> Result<HashMap<i64, Vec<i64>>> {
    let mut stmt = conn.prepare(
        "SELECT d.task_id, d.depends_on_id FROM task_dependencies d
         JOIN tasks t ON t.id = d.task_id
         WHERE t.project_id = ?1",
    )?;
    let mut edges: HashMap<i64, Vec<i64>> = HashMap::new();
    let rows = stmt.query_map(params![project_id], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (from, to) = row?;
        edges.entry(from).or_default().push(to);
    }
    Ok(edges)
}

/// Iterative DFS cycle check over the dependency adjacency
fn has_cycle(edges: &HashMap<i64, Vec<i64>>) -> bool {
    let mut visited: HashSet<i64> = HashSet::new();
    let mut in_stack: HashSet<i64> = HashSet::new();

    for &start in edges.keys() {
        if visited.contains(&start) {
            continue;
        }
        // (node, next child index) stack
        let mut stack: Vec<(i64, usize)> = vec![(start, 0)];
        in_stack.insert(start);
        while let Some((node, child_idx)) = stack.pop() {
            let children = edges.get(&node).map(Vec::as_slice).unwrap_or(&[]);
            if child_idx < children.len() {
                stack.push((node, child_idx + 1));
                let child = children[child_idx];
                if in_stack.contains(&child) {
                    return true;
                }
                if !visited.contains(&child) {
                    in_stack.insert(child);
                    stack.push((child, 0));
                }
            } else {
                in_stack.remove(&node);
                visited.insert(node);
            }
        }
    }
    false
}

/// Longest path by summed effort from `node` to any leaf, memoized
fn longest_path(
    node: i64,
    edges: &HashMap<i64, Vec<i64>>,
    efforts: &HashMap<i64, i64>,
    memo: &mut HashMap<i64, (i64, Vec<i64>)>,
) -> (i64, Vec<i64>) {
    if let Some(cached) = memo.get(&node) {
        return cached.clone();
    }
    let own = efforts.get(&node).copied().unwrap_or(0);
    let mut best = (own, vec![node]);
    if let Some(children) = edges.get(&node) {
        for &child in children {
            let (child_weight, child_path) = longest_path(child, edges, efforts, memo);
            if own + child_weight > best.0 {
                let mut path = vec![node];
                path.extend(child_path.iter());
                best = (own + child_weight, path);
            }
        }
    }
    memo.insert(node, best.clone());
    best
}

// ============================================================================
// ROW MAPPING
// ============================================================================

/// Column list matching [`map_task_row`]
const TASK_COLUMNS: &str = "t.id, t.project_id, t.content, t.status, t.priority, t.phase, \
     t.parent_id, t.estimated_effort_min, t.actual_effort_min, t.deadline, t.created_at, \
     t.version, \
     (SELECT group_concat(depends_on_id) FROM task_dependencies d WHERE d.task_id = t.id)";

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let deps: Option<String> = row.get(12)?;
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        content: row.get(2)?,
        status: TaskStatus::parse_name(&status).unwrap_or_default(),
        priority: Priority::from_rank(row.get(4)?),
        phase: row.get(5)?,
        parent_id: row.get(6)?,
        estimated_effort_min: row.get(7)?,
        actual_effort_min: row.get(8)?,
        deadline: row.get::<_, Option<i64>>(9)?.map(nanos_to_datetime),
        created_at: nanos_to_datetime(row.get(10)?),
        version: row.get(11)?,
        dependencies: deps
            .map(|s| s.split(',').filter_map(|id| id.parse().ok()).collect())
            .unwrap_or_default(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

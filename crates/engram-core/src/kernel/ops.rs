//! Operation Catalogue & Router
//!
//! The closed set of operations the kernel recognizes, parsed from
//! (name, parameter mapping) pairs into a discriminated enum, plus the
//! uniform structured-result envelope every dispatch returns. The router is
//! a match over the enum; adding an operation is a compile-time change here.

use std::time::Instant;

use serde::Deserialize;

use crate::context::RequestContext;
use crate::error::{Error, ErrorKind, Result};
use crate::kernel::Kernel;
use crate::model::{
    EventFilter, EventInput, FactInput, Outcome, Page, ProcedureInput, TaskInput, TaskStatus,
};
use crate::retrieval::{CacheStatus, RecallScope, RetrievalStrategy};
use crate::verify::gates;

// ============================================================================
// OPERATIONS
// ============================================================================

/// Every operation the kernel understands
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "snake_case")]
pub enum Operation {
    /// Store a fact grounded in events
    Remember {
        /// The statement
        statement: String,
        /// Domain tag
        domain: String,
        /// Grounding event ids
        source_events: Vec<i64>,
        /// Optional initial confidence
        #[serde(default)]
        confidence: Option<f64>,
    },
    /// Recall facts (or, with a scope, a unified cross-layer result)
    Recall {
        /// Search query
        query: String,
        /// Optional cross-layer scope; absent means facts only
        #[serde(default)]
        scope: Option<RecallScope>,
        /// Restrict facts to a domain
        #[serde(default)]
        domain: Option<String>,
        /// Page size
        #[serde(default)]
        limit: Option<usize>,
        /// Page offset
        #[serde(default)]
        offset: Option<usize>,
        /// Include facts under the confidence threshold
        #[serde(default)]
        include_low_confidence: Option<bool>,
    },
    /// Strategy-selected unified retrieval
    SmartRetrieve {
        /// Search query
        query: String,
        /// Force a strategy instead of the decision tree
        #[serde(default)]
        strategy: Option<String>,
        /// Result cap
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Record one event
    RecordEvent {
        /// The event
        event: EventInput,
    },
    /// Record a batch of events
    RecordEvents {
        /// The events
        events: Vec<EventInput>,
    },
    /// Recall events by filter, newest first
    RecallEvents {
        /// Filter
        #[serde(default)]
        filter: EventFilter,
        /// Page size
        #[serde(default)]
        limit: Option<u32>,
        /// Page offset
        #[serde(default)]
        offset: Option<u32>,
    },
    /// Create a procedure
    CreateProcedure(ProcedureInput),
    /// Rank procedures for a query
    FindProcedures {
        /// Search query
        query: String,
        /// Restrict to a category
        #[serde(default)]
        category: Option<String>,
        /// Result cap
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Record a procedure execution
    RecordExecution {
        /// The procedure
        procedure_id: i64,
        /// How it went
        outcome: Outcome,
        /// Wall-clock duration
        duration_ms: i64,
        /// Bound parameters
        #[serde(default)]
        params: serde_json::Value,
    },
    /// Create a task
    CreateTask(TaskInput),
    /// Transition a task's status
    TransitionTask {
        /// The task
        task_id: i64,
        /// Target status
        status: TaskStatus,
        /// Actual effort, recorded on completion
        #[serde(default)]
        actual_effort_min: Option<i64>,
    },
    /// Pending tasks whose dependencies are complete
    ReadyTasks {
        /// Restrict to a phase
        #[serde(default)]
        phase: Option<String>,
        /// Result cap
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Longest-effort path from a goal task
    CriticalPath {
        /// The goal task
        goal_id: i64,
    },
    /// Upsert a knowledge-graph entity
    UpsertEntity {
        /// Entity name
        name: String,
        /// Entity kind
        kind: String,
        /// Properties to merge
        #[serde(default)]
        properties: serde_json::Value,
    },
    /// Link two entities
    LinkEntities {
        /// Source entity
        from_id: i64,
        /// Target entity
        to_id: i64,
        /// Relation kind
        kind: String,
        /// Strength in (0, 1]
        weight: f64,
        /// Evidence event
        #[serde(default)]
        evidence_event_id: Option<i64>,
    },
    /// Bounded BFS neighborhood of an entity
    Neighbors {
        /// Start entity
        entity_id: i64,
        /// Restrict relation kind
        #[serde(default)]
        kind: Option<String>,
        /// BFS depth, capped at 3
        #[serde(default)]
        depth: Option<u32>,
    },
    /// Community partition of the project graph
    Communities {},
    /// Run consolidation on demand
    Consolidate {
        /// Window length in hours ending now; defaults to the configured interval
        #[serde(default)]
        window_hours: Option<u64>,
        /// Strategy name; defaults to the configured strategy
        #[serde(default)]
        strategy: Option<String>,
    },
    /// Quality summary for the project
    QualitySummary {},
    /// Current meta-layer alerts
    Alerts {},
}

impl Operation {
    /// Parse an operation from its name and parameter mapping
    pub fn parse(name: &str, params: serde_json::Value) -> Result<Operation> {
        let wrapped = serde_json::json!({ "op": name, "params": params });
        serde_json::from_value(wrapped)
            .map_err(|e| Error::validation(format!("operation '{name}': {e}")))
    }
}

// ============================================================================
// STRUCTURED RESULT
// ============================================================================

/// Envelope status
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Success
    Ok,
    /// Success with warnings attached
    Warn,
    /// Failure; see `error`
    Error,
}

/// Error body inside an envelope
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Error kind name
    pub kind: ErrorKind,
    /// Detail text
    pub detail: String,
}

/// Per-response metrics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetrics {
    /// Wall-clock handling time
    pub duration_ms: u64,
    /// Cache disposition: hit, miss, coalesced, or none
    pub cache: &'static str,
}

/// The uniform response envelope
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredResult {
    /// Envelope status
    pub status: ResultStatus,
    /// Operation payload
    pub data: serde_json::Value,
    /// Pagination, for paged operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Page>,
    /// Warnings from gates and degraded dependencies
    pub warnings: Vec<String>,
    /// Error body when status is error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Handling metrics
    pub metrics: ResultMetrics,
}

/// Internal execution output before enveloping
struct Outcome3 {
    data: serde_json::Value,
    pagination: Option<Page>,
    warnings: Vec<String>,
    cache: CacheStatus,
}

impl Outcome3 {
    fn plain(data: serde_json::Value) -> Self {
        Self {
            data,
            pagination: None,
            warnings: Vec::new(),
            cache: CacheStatus::Miss,
        }
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

impl Kernel {
    /// Route one operation and produce its structured result
    ///
    /// Errors never escape as `Err`; they fold into the envelope with the
    /// error kind surfaced, so the transport in front of the kernel stays a
    /// dumb pipe.
    pub async fn dispatch(&self, ctx: &RequestContext, op: Operation) -> StructuredResult {
        let started = Instant::now();
        let result = self.execute(ctx, op).await;
        let elapsed = started.elapsed().as_millis() as u64;

        match result {
            Ok(mut outcome) => {
                // Efficiency gate: over-budget operations pass with a warning
                let check =
                    gates::efficiency_gate(elapsed, self.config().kernel.handler_budget_ms);
                if let gates::GateOutcome::Warn(detail) = check.outcome {
                    outcome.warnings.push(format!("efficiency: {detail}"));
                }
                StructuredResult {
                    status: if outcome.warnings.is_empty() {
                        ResultStatus::Ok
                    } else {
                        ResultStatus::Warn
                    },
                    data: outcome.data,
                    pagination: outcome.pagination,
                    warnings: outcome.warnings,
                    error: None,
                    metrics: ResultMetrics {
                        duration_ms: elapsed,
                        cache: outcome.cache.as_str(),
                    },
                }
            }
            Err(e) => StructuredResult {
                status: ResultStatus::Error,
                data: serde_json::Value::Null,
                pagination: None,
                warnings: Vec::new(),
                error: Some(ErrorBody {
                    kind: e.kind,
                    detail: e.detail,
                }),
                metrics: ResultMetrics {
                    duration_ms: elapsed,
                    cache: "none",
                },
            },
        }
    }

    async fn execute(&self, ctx: &RequestContext, op: Operation) -> Result<Outcome3> {
        ctx.checkpoint()?;
        match op {
            Operation::Remember {
                statement,
                domain,
                source_events,
                confidence,
            } => {
                let mut input = FactInput {
                    statement,
                    domain,
                    source_event_ids: source_events,
                    confidence,
                };
                input.validate()?;
                let cited = input.source_event_ids.len();
                let embedding = self.orchestrator().embed_query(&input.statement).await;
                let gate_set = self
                    .gateway()
                    .verify_fact(ctx, &mut input, embedding.as_ref(), cited, false)
                    .await?;
                let (fact, _) = self.semantic().remember(ctx, input).await?;
                self.orchestrator().invalidate_project(ctx.project_id);
                Ok(Outcome3 {
                    data: serde_json::to_value(&fact)?,
                    pagination: None,
                    warnings: gate_set.warnings(),
                    cache: CacheStatus::Miss,
                })
            }

            Operation::Recall {
                query,
                scope,
                domain,
                limit,
                offset,
                include_low_confidence,
            } => match scope {
                None => {
                    let (page, cache) = self
                        .orchestrator()
                        .recall_facts(
                            ctx,
                            &query,
                            domain.as_deref(),
                            limit.unwrap_or(10),
                            offset.unwrap_or(0),
                            include_low_confidence.unwrap_or(false),
                        )
                        .await?;
                    Ok(Outcome3 {
                        data: serde_json::json!(page.items),
                        pagination: Some(page.page),
                        warnings: Vec::new(),
                        cache,
                    })
                }
                Some(scope) => {
                    let (result, cache) = self
                        .orchestrator()
                        .recall_unified(ctx, &query, scope, limit.unwrap_or(20))
                        .await?;
                    Ok(Outcome3 {
                        data: serde_json::to_value(&result)?,
                        pagination: None,
                        warnings: Vec::new(),
                        cache,
                    })
                }
            },

            Operation::SmartRetrieve {
                query,
                strategy,
                limit,
            } => {
                let strategy = match strategy.as_deref() {
                    Some(name) => Some(RetrievalStrategy::parse_name(name).ok_or_else(|| {
                        Error::validation(format!("unknown retrieval strategy '{name}'"))
                    })?),
                    None => None,
                };
                let (result, cache) = self
                    .orchestrator()
                    .smart_retrieve(ctx, &query, strategy, limit.unwrap_or(20))
                    .await?;
                Ok(Outcome3 {
                    data: serde_json::to_value(&result)?,
                    pagination: None,
                    warnings: Vec::new(),
                    cache,
                })
            }

            Operation::RecordEvent { event } => {
                let outcome = self.episodic().record_event(ctx, event).await?;
                self.orchestrator().invalidate_project(ctx.project_id);
                Ok(Outcome3::plain(serde_json::to_value(outcome)?))
            }

            Operation::RecordEvents { events } => {
                let mut inserted = 0u32;
                let mut duplicates = 0u32;
                let mut ids: Vec<i64> = Vec::with_capacity(events.len());
                let mut errors: Vec<serde_json::Value> = Vec::new();
                let mut warnings = Vec::new();
                let batch_size = self.config().ingest.batch_size.max(1);

                let mut base_index = 0usize;
                for chunk in events.chunks(batch_size) {
                    let report = self.episodic().record_batch(ctx, chunk.to_vec()).await?;
                    inserted += report.inserted;
                    duplicates += report.duplicates;
                    ids.extend(report.ids);
                    for error in report.errors {
                        errors.push(serde_json::json!({
                            "index": base_index + error.index,
                            "reason": error.reason,
                        }));
                    }
                    if report.missing_embeddings > 0 {
                        warnings.push(format!(
                            "{} events stored without embeddings, flagged for backfill",
                            report.missing_embeddings
                        ));
                    }
                    base_index += chunk.len();
                }
                self.orchestrator().invalidate_project(ctx.project_id);
                Ok(Outcome3 {
                    data: serde_json::json!({
                        "inserted": inserted,
                        "duplicates": duplicates,
                        "ids": ids,
                        "errors": errors,
                    }),
                    pagination: None,
                    warnings,
                    cache: CacheStatus::Miss,
                })
            }

            Operation::RecallEvents {
                filter,
                limit,
                offset,
            } => {
                let page = self
                    .episodic()
                    .recall_events(ctx, &filter, limit.unwrap_or(20), offset.unwrap_or(0))
                    .await?;
                Ok(Outcome3 {
                    data: serde_json::json!(page.items),
                    pagination: Some(page.page),
                    warnings: Vec::new(),
                    cache: CacheStatus::Miss,
                })
            }

            Operation::CreateProcedure(input) => {
                // Soundness: the step list must be a total order with
                // forward-only output references
                let soundness =
                    gates::soundness_gate(input.validate().map_err(|e| e.detail));
                if soundness.outcome.is_fatal() {
                    return Err(Error::validation(match soundness.outcome {
                        gates::GateOutcome::Violation(_, detail) => detail,
                        _ => "soundness violation".to_string(),
                    }));
                }
                let procedure = self.procedural().create_procedure(ctx, input).await?;
                Ok(Outcome3::plain(serde_json::to_value(&procedure)?))
            }

            Operation::FindProcedures {
                query,
                category,
                limit,
            } => {
                let embedding = self.orchestrator().embed_query(&query).await;
                let ranked = self
                    .procedural()
                    .find_procedures(
                        ctx,
                        &query,
                        embedding.as_ref(),
                        category.as_deref(),
                        limit.unwrap_or(10),
                    )
                    .await?;
                let data: Vec<serde_json::Value> = ranked
                    .into_iter()
                    .map(|(procedure, score)| {
                        let mut value = serde_json::to_value(&procedure).unwrap_or_default();
                        if let Some(object) = value.as_object_mut() {
                            object.insert("score".to_string(), serde_json::json!(score));
                        }
                        value
                    })
                    .collect();
                Ok(Outcome3::plain(serde_json::json!(data)))
            }

            Operation::RecordExecution {
                procedure_id,
                outcome,
                duration_ms,
                params,
            } => {
                let procedure = self
                    .procedural()
                    .record_execution(ctx, procedure_id, outcome, duration_ms, params)
                    .await?;
                let mut warnings = Vec::new();
                if procedure.underperforming {
                    warnings.push(format!(
                        "procedure {} is underperforming ({} executions at {:.2} success rate)",
                        procedure.id, procedure.execution_count, procedure.success_rate
                    ));
                }
                Ok(Outcome3 {
                    data: serde_json::to_value(&procedure)?,
                    pagination: None,
                    warnings,
                    cache: CacheStatus::Miss,
                })
            }

            Operation::CreateTask(input) => {
                let task = self.prospective().create_task(ctx, input).await?;
                Ok(Outcome3::plain(serde_json::to_value(&task)?))
            }

            Operation::TransitionTask {
                task_id,
                status,
                actual_effort_min,
            } => {
                let task = self
                    .prospective()
                    .transition(ctx, task_id, status, actual_effort_min)
                    .await?;
                Ok(Outcome3::plain(serde_json::to_value(&task)?))
            }

            Operation::ReadyTasks { phase, limit } => {
                let tasks = self
                    .prospective()
                    .ready_tasks(ctx, phase.as_deref(), limit.unwrap_or(50))
                    .await?;
                Ok(Outcome3::plain(serde_json::to_value(&tasks)?))
            }

            Operation::CriticalPath { goal_id } => {
                let path = self.prospective().critical_path(ctx, goal_id).await?;
                Ok(Outcome3::plain(serde_json::json!({ "path": path })))
            }

            Operation::UpsertEntity {
                name,
                kind,
                properties,
            } => {
                let explicitly_isolated = properties
                    .get("isolated")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                let entity = self
                    .graph()
                    .upsert_entity(
                        ctx,
                        crate::model::EntityInput {
                            name,
                            kind,
                            properties,
                        },
                    )
                    .await?;
                // Coherence: a new entity should join an existing community
                // unless explicitly isolated
                let connected = !self
                    .graph()
                    .neighbors(ctx, entity.id, None, 1)
                    .await?
                    .is_empty();
                let coherence = gates::coherence_gate(connected, explicitly_isolated);
                let mut warnings = Vec::new();
                if let gates::GateOutcome::Warn(detail) = coherence.outcome {
                    warnings.push(format!("coherence: {detail}"));
                }
                Ok(Outcome3 {
                    data: serde_json::to_value(&entity)?,
                    pagination: None,
                    warnings,
                    cache: CacheStatus::Miss,
                })
            }

            Operation::LinkEntities {
                from_id,
                to_id,
                kind,
                weight,
                evidence_event_id,
            } => {
                let relation = self
                    .graph()
                    .link(
                        ctx,
                        crate::model::RelationInput {
                            from_id,
                            to_id,
                            kind,
                            weight,
                            evidence_event_id,
                        },
                    )
                    .await?;
                Ok(Outcome3::plain(serde_json::to_value(&relation)?))
            }

            Operation::Neighbors {
                entity_id,
                kind,
                depth,
            } => {
                let neighbors = self
                    .graph()
                    .neighbors(ctx, entity_id, kind.as_deref(), depth.unwrap_or(1))
                    .await?;
                Ok(Outcome3::plain(serde_json::to_value(&neighbors)?))
            }

            Operation::Communities {} => {
                let partition = self.graph().communities(ctx).await?;
                let as_strings: std::collections::BTreeMap<String, i64> = partition
                    .into_iter()
                    .map(|(id, label)| (id.to_string(), label))
                    .collect();
                Ok(Outcome3::plain(serde_json::to_value(&as_strings)?))
            }

            Operation::Consolidate {
                window_hours,
                strategy,
            } => {
                let strategy = match strategy.as_deref() {
                    Some(name) => {
                        crate::consolidation::Strategy::parse_name(name).ok_or_else(|| {
                            Error::validation(format!("unknown strategy '{name}'"))
                        })?
                    }
                    None => crate::consolidation::Strategy::parse_name(
                        &self.config().consolidation.strategy,
                    )
                    .unwrap_or_default(),
                };
                let hours = window_hours.unwrap_or(self.config().consolidation.interval_hours);
                let end = chrono::Utc::now();
                let start = end - chrono::Duration::hours(hours as i64);
                let report = self.engine().run(ctx, start, end, strategy).await?;
                self.orchestrator().invalidate_project(ctx.project_id);
                let warnings = report.warnings.clone();
                Ok(Outcome3 {
                    data: serde_json::to_value(&report)?,
                    pagination: None,
                    warnings,
                    cache: CacheStatus::Miss,
                })
            }

            Operation::QualitySummary {} => {
                let records = self.meta().quality_summary(ctx.project_id)?;
                Ok(Outcome3::plain(serde_json::to_value(&records)?))
            }

            Operation::Alerts {} => {
                let alerts = self.meta().alerts(ctx.project_id)?;
                Ok(Outcome3::plain(serde_json::to_value(&alerts)?))
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Operation catalogue round-trips
//!
//! Exercises the kernel through the public dispatch surface: parsing,
//! structured-result envelopes, cache dispositions, gate warnings, and the
//! graph and meta operations.

use engram_core::{Operation, ResultStatus};
use engram_e2e_tests::{fixtures, TestKernel};

#[tokio::test]
async fn record_then_recall_events_roundtrip() {
    let harness = TestKernel::new();
    let ctx = harness.context("ops").await;

    let record = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "record_event",
                serde_json::json!({"event": {"content": "deployed build 42", "kind": "tool_use"}}),
            )
            .unwrap(),
        )
        .await;
    assert_eq!(record.status, ResultStatus::Ok);
    assert!(record.metrics.duration_ms < 60_000);

    let recall = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "recall_events",
                serde_json::json!({"filter": {"query": "deployed"}, "limit": 10}),
            )
            .unwrap(),
        )
        .await;
    assert_eq!(recall.status, ResultStatus::Ok);
    let page = recall.pagination.unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(recall.data.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn remember_requires_real_grounding() {
    let harness = TestKernel::new();
    let ctx = harness.context("ops").await;

    let result = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "remember",
                serde_json::json!({
                    "statement": "ungrounded claim",
                    "domain": "misc",
                    "source_events": [999]
                }),
            )
            .unwrap(),
        )
        .await;
    assert_eq!(result.status, ResultStatus::Error);
    assert_eq!(
        result.error.unwrap().kind,
        engram_core::ErrorKind::Validation
    );
}

#[tokio::test]
async fn remember_then_recall_with_cache_disposition() {
    let harness = TestKernel::new();
    let ctx = harness.context("ops").await;

    let event = harness
        .kernel
        .episodic()
        .record_event(&ctx, fixtures::message("observed the retry behavior"))
        .await
        .unwrap()
        .id();

    let remember = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "remember",
                serde_json::json!({
                    "statement": "the embedder retries with backoff",
                    "domain": "reliability",
                    "source_events": [event]
                }),
            )
            .unwrap(),
        )
        .await;
    assert_ne!(remember.status, ResultStatus::Error);

    let recall_op = Operation::parse(
        "recall",
        serde_json::json!({"query": "embedder retry backoff", "limit": 5}),
    )
    .unwrap();
    let first = harness.kernel.dispatch(&ctx, recall_op.clone()).await;
    assert_eq!(first.metrics.cache, "miss");
    assert!(!first.data.as_array().unwrap().is_empty());

    let second = harness.kernel.dispatch(&ctx, recall_op).await;
    assert_eq!(second.metrics.cache, "hit");
    assert_eq!(first.data, second.data);

    // A write invalidates; the next identical read rebuilds
    harness
        .kernel
        .dispatch(
            &ctx,
            Operation::RecordEvent {
                event: fixtures::message("new knowledge arrived"),
            },
        )
        .await;
    let third = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "recall",
                serde_json::json!({"query": "embedder retry backoff", "limit": 5}),
            )
            .unwrap(),
        )
        .await;
    assert_eq!(third.metrics.cache, "miss");
}

#[tokio::test]
async fn graph_operations_roundtrip() {
    let harness = TestKernel::new();
    let ctx = harness.context("ops").await;

    let a = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "upsert_entity",
                serde_json::json!({"name": "pool.rs", "kind": "file"}),
            )
            .unwrap(),
        )
        .await;
    let b = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "upsert_entity",
                serde_json::json!({"name": "scheduler.rs", "kind": "file"}),
            )
            .unwrap(),
        )
        .await;
    let a_id = a.data["id"].as_i64().unwrap();
    let b_id = b.data["id"].as_i64().unwrap();

    let link = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "link_entities",
                serde_json::json!({
                    "from_id": a_id, "to_id": b_id, "kind": "depends_on", "weight": 0.7
                }),
            )
            .unwrap(),
        )
        .await;
    assert_eq!(link.status, ResultStatus::Ok);

    let neighbors = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse("neighbors", serde_json::json!({"entity_id": a_id})).unwrap(),
        )
        .await;
    let names: Vec<&str> = neighbors
        .data
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["scheduler.rs"]);

    let communities = harness
        .kernel
        .dispatch(&ctx, Operation::parse("communities", serde_json::json!({})).unwrap())
        .await;
    assert_eq!(communities.status, ResultStatus::Ok);
    assert_eq!(communities.data.as_object().unwrap().len(), 2);
}

#[tokio::test]
async fn procedures_through_the_catalogue() {
    let harness = TestKernel::new();
    let ctx = harness.context("ops").await;

    let created = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "create_procedure",
                serde_json::json!({
                    "name": "release checklist",
                    "category": "deploy",
                    "steps": [
                        {"action": "cargo_test", "paramsTemplate": {}},
                        {"action": "cargo_publish", "paramsTemplate": {"registry": "{registry}"}}
                    ]
                }),
            )
            .unwrap(),
        )
        .await;
    assert_eq!(created.status, ResultStatus::Ok);
    let procedure_id = created.data["id"].as_i64().unwrap();

    let executed = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "record_execution",
                serde_json::json!({
                    "procedure_id": procedure_id,
                    "outcome": "success",
                    "duration_ms": 1200
                }),
            )
            .unwrap(),
        )
        .await;
    assert_eq!(executed.status, ResultStatus::Ok);
    assert_eq!(executed.data["executionCount"], 1);
    assert_eq!(executed.data["successRate"], 1.0);

    let found = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "find_procedures",
                serde_json::json!({"query": "release", "limit": 5}),
            )
            .unwrap(),
        )
        .await;
    assert_eq!(found.data.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn quality_summary_and_alerts() {
    let harness = TestKernel::new();
    let ctx = harness.context("ops").await;
    harness
        .kernel
        .episodic()
        .record_event(&ctx, fixtures::message("some activity"))
        .await
        .unwrap();
    harness.kernel.meta().sample(&ctx).await.unwrap();

    let summary = harness
        .kernel
        .dispatch(&ctx, Operation::QualitySummary {})
        .await;
    assert_eq!(summary.status, ResultStatus::Ok);
    assert!(!summary.data.as_array().unwrap().is_empty());

    let alerts = harness.kernel.dispatch(&ctx, Operation::Alerts {}).await;
    assert_eq!(alerts.status, ResultStatus::Ok);
    assert!(alerts.data.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn smart_retrieve_reports_its_strategy() {
    let harness = TestKernel::new();
    let ctx = harness.context("ops").await;
    harness
        .kernel
        .episodic()
        .record_event(&ctx, fixtures::message("cache warming details"))
        .await
        .unwrap();

    let result = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "smart_retrieve",
                serde_json::json!({"query": "how to warm the cache quickly"}),
            )
            .unwrap(),
        )
        .await;
    assert_ne!(result.status, ResultStatus::Error);
    assert_eq!(result.data["strategy"], "hypothetical_document");
}

#[tokio::test]
async fn unknown_operation_is_a_validation_error() {
    let err = Operation::parse("definitely_not_real", serde_json::json!({})).unwrap_err();
    assert_eq!(err.kind, engram_core::ErrorKind::Validation);
}

//! Consolidation grounding and idempotence
//!
//! Ten related events consolidate into a grounded fact citing at least half
//! the cluster; re-running the same window creates nothing new; similar
//! fresh events reinforce instead of duplicating; and identical inputs
//! produce identical fact sets under a deterministic strategy.

use chrono::{Duration, Utc};
use engram_core::testing::unit_vector;
use engram_core::{EventContext, EventInput, EventKind, Strategy};
use engram_e2e_tests::TestKernel;

/// Embedder where every pytest event lands on one tight cluster
fn pytest_embedder() -> engram_core::testing::StubEmbedder {
    engram_core::testing::StubEmbedder::new()
        .with_mapping("pytest failure", unit_vector("pytest failures in module x"))
}

fn pytest_event(i: usize, session: &str) -> EventInput {
    let mut context = EventContext::new();
    context.insert("domain".to_string(), "testing".to_string());
    context.insert("session".to_string(), session.to_string());
    EventInput {
        content: format!("pytest failure in module x run {i}"),
        kind: EventKind::ToolUse,
        context,
        created_at: Some(Utc::now() - Duration::minutes(30)),
        ..Default::default()
    }
}

#[tokio::test]
async fn run_produces_a_grounded_fact() {
    let harness = TestKernel::with_embedder(pytest_embedder());
    let ctx = harness.context("grounding").await;

    let events: Vec<EventInput> = (0..10).map(|i| pytest_event(i, "s1")).collect();
    let report = harness
        .kernel
        .episodic()
        .record_batch(&ctx, events)
        .await
        .unwrap();
    assert_eq!(report.inserted, 10);
    let event_ids = report.ids.clone();

    let window_start = Utc::now() - Duration::hours(2);
    let window_end = Utc::now() + Duration::minutes(5);
    let run = harness
        .kernel
        .engine()
        .run(&ctx, window_start, window_end, Strategy::Balanced)
        .await
        .unwrap();

    assert_eq!(run.events_in, 10);
    assert_eq!(run.facts_created, 1);

    let facts = harness
        .kernel
        .semantic()
        .recall(&ctx, "pytest failure module", None, None, 10, true, 0.6)
        .await
        .unwrap();
    assert_eq!(facts.len(), 1);
    let fact = &facts[0].0;
    // Grounding: citations are a subset of the fed events, covering >= 5/10
    assert!(fact.source_event_ids.iter().all(|id| event_ids.contains(id)));
    assert!(fact.source_event_ids.len() >= 5);
    assert!(fact.confidence >= 0.6);
    assert_eq!(fact.domain, "testing");
}

#[tokio::test]
async fn duplicate_run_creates_nothing_new() {
    let harness = TestKernel::with_embedder(pytest_embedder());
    let ctx = harness.context("grounding").await;

    let events: Vec<EventInput> = (0..10).map(|i| pytest_event(i, "s1")).collect();
    harness.kernel.episodic().record_batch(&ctx, events).await.unwrap();

    let window_start = Utc::now() - Duration::hours(2);
    let window_end = Utc::now() + Duration::minutes(5);
    let first = harness
        .kernel
        .engine()
        .run(&ctx, window_start, window_end, Strategy::Balanced)
        .await
        .unwrap();
    assert_eq!(first.facts_created, 1);

    // The contributing events are sealed; the same window is now empty
    let second = harness
        .kernel
        .engine()
        .run(&ctx, window_start, window_end, Strategy::Balanced)
        .await
        .unwrap();
    assert_eq!(second.events_in, 0);
    assert_eq!(second.facts_created, 0);
    assert_eq!(harness.kernel.semantic().count(&ctx).await.unwrap(), 1);
}

#[tokio::test]
async fn similar_fresh_events_reinforce_the_fact() {
    let harness = TestKernel::with_embedder(pytest_embedder());
    let ctx = harness.context("grounding").await;

    let events: Vec<EventInput> = (0..10).map(|i| pytest_event(i, "s1")).collect();
    harness.kernel.episodic().record_batch(&ctx, events).await.unwrap();

    let window_start = Utc::now() - Duration::hours(2);
    let window_end = Utc::now() + Duration::minutes(5);
    harness
        .kernel
        .engine()
        .run(&ctx, window_start, window_end, Strategy::Balanced)
        .await
        .unwrap();
    let before = harness
        .kernel
        .semantic()
        .recall(&ctx, "pytest failure module", None, None, 10, true, 0.6)
        .await
        .unwrap();
    let before_support = before[0].0.support_count;

    // Three fresh events repeating the recurring content; sessions differ so
    // the content hashes differ
    let fresh: Vec<EventInput> = ["s2", "s3", "s4"]
        .iter()
        .map(|session| pytest_event(0, session))
        .collect();
    let report = harness.kernel.episodic().record_batch(&ctx, fresh).await.unwrap();
    assert_eq!(report.inserted, 3);

    let rerun = harness
        .kernel
        .engine()
        .run(
            &ctx,
            window_start,
            Utc::now() + Duration::minutes(10),
            Strategy::Balanced,
        )
        .await
        .unwrap();
    assert_eq!(rerun.facts_created, 0);
    assert_eq!(rerun.facts_reinforced, 1);

    let after = harness
        .kernel
        .semantic()
        .recall(&ctx, "pytest failure module", None, None, 10, true, 0.6)
        .await
        .unwrap();
    assert_eq!(after.len(), 1, "no duplicate fact may appear");
    assert!(after[0].0.support_count > before_support);
}

#[tokio::test]
async fn deterministic_strategy_is_reproducible_across_stores() {
    let make_facts = || async {
        let harness = TestKernel::with_embedder(pytest_embedder());
        let ctx = harness.context("grounding").await;
        let base = Utc::now() - Duration::minutes(30);
        let events: Vec<EventInput> = (0..10)
            .map(|i| {
                let mut input = pytest_event(i, "s1");
                input.created_at = Some(base);
                input
            })
            .collect();
        harness.kernel.episodic().record_batch(&ctx, events).await.unwrap();
        harness
            .kernel
            .engine()
            .run(
                &ctx,
                base - Duration::hours(1),
                Utc::now() + Duration::minutes(5),
                Strategy::Balanced,
            )
            .await
            .unwrap();
        let mut statements: Vec<String> = harness
            .kernel
            .semantic()
            .recall(&ctx, "pytest failure module", None, None, 10, true, 0.6)
            .await
            .unwrap()
            .into_iter()
            .map(|(fact, _)| fact.statement)
            .collect();
        statements.sort();
        statements
    };

    let first = make_facts().await;
    let second = make_facts().await;
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[tokio::test]
async fn empty_window_is_a_no_op() {
    let harness = TestKernel::new();
    let ctx = harness.context("grounding").await;
    let report = harness
        .kernel
        .engine()
        .run(
            &ctx,
            Utc::now() - Duration::hours(1),
            Utc::now(),
            Strategy::Balanced,
        )
        .await
        .unwrap();
    assert_eq!(report.events_in, 0);
    assert_eq!(report.facts_created, 0);
    assert_eq!(report.clusters, 0);
}

#[tokio::test]
async fn embedder_outage_defers_the_run() {
    let harness = TestKernel::with_embedder(engram_core::testing::StubEmbedder::offline());
    let ctx = harness.context("grounding").await;

    harness
        .kernel
        .episodic()
        .record_batch(&ctx, (0..4).map(|i| pytest_event(i, "s1")).collect())
        .await
        .unwrap();

    let report = harness
        .kernel
        .engine()
        .run(
            &ctx,
            Utc::now() - Duration::hours(2),
            Utc::now() + Duration::minutes(5),
            Strategy::Balanced,
        )
        .await
        .unwrap();
    assert!(report.deferred);
    assert_eq!(report.facts_created, 0);
    // Nothing was sealed; the window is intact for a later run
    assert_eq!(harness.kernel.episodic().count(&ctx).await.unwrap(), 4);
}

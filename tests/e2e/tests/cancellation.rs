//! Cancellation atomicity
//!
//! A cancelled consolidation run leaves no persistent side effect: no new
//! facts, no sealed events, and the fingerprint lock releases immediately.
//! Handlers honor deadlines and explicit cancellation at suspension points.

use chrono::{Duration as ChronoDuration, Utc};
use engram_core::testing::unit_vector;
use engram_core::{ErrorKind, EventContext, EventInput, EventKind, RequestContext, Strategy};
use engram_e2e_tests::TestKernel;
use std::time::Duration;

fn seed_embedder() -> engram_core::testing::StubEmbedder {
    engram_core::testing::StubEmbedder::new()
        .with_mapping("recurring signal", unit_vector("recurring cluster"))
}

fn signal_event(i: usize) -> EventInput {
    let mut context = EventContext::new();
    context.insert("domain".to_string(), "signals".to_string());
    EventInput {
        content: format!("recurring signal number {i}"),
        kind: EventKind::Message,
        context,
        created_at: Some(Utc::now() - ChronoDuration::minutes(30)),
        ..Default::default()
    }
}

#[tokio::test]
async fn cancelled_run_leaves_no_artifacts() {
    let harness = TestKernel::with_embedder(seed_embedder());
    let ctx = harness.context("cancel").await;

    harness
        .kernel
        .episodic()
        .record_batch(&ctx, (0..6).map(signal_event).collect())
        .await
        .unwrap();
    let events_before = harness.kernel.episodic().count(&ctx).await.unwrap();

    // Cancel before the run reaches its first checkpoint
    let cancelled_ctx = RequestContext::new(ctx.project_id);
    cancelled_ctx.cancel.cancel();
    let window_start = Utc::now() - ChronoDuration::hours(2);
    let window_end = Utc::now() + ChronoDuration::minutes(5);
    let err = harness
        .kernel
        .engine()
        .run(&cancelled_ctx, window_start, window_end, Strategy::Balanced)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);

    // Post-state: nothing changed
    assert_eq!(
        harness.kernel.episodic().count(&ctx).await.unwrap(),
        events_before
    );
    assert_eq!(harness.kernel.semantic().count(&ctx).await.unwrap(), 0);

    // The fingerprint lock released; the identical run now succeeds
    let retry = tokio::time::timeout(
        Duration::from_secs(1),
        harness
            .kernel
            .engine()
            .run(&ctx, window_start, window_end, Strategy::Balanced),
    )
    .await
    .expect("fingerprint lock must release within a second")
    .unwrap();
    assert!(!retry.coalesced);
    assert_eq!(retry.events_in, 6);
    assert!(retry.facts_created > 0);
}

#[tokio::test]
async fn expired_deadline_cancels_handlers() {
    let harness = TestKernel::new();
    let ctx = harness.context("cancel").await;

    let mut expired = RequestContext::new(ctx.project_id).with_budget(Duration::ZERO);
    expired.agent_id = Some("deadline-test".to_string());
    tokio::time::sleep(Duration::from_millis(2)).await;

    let err = harness
        .kernel
        .episodic()
        .record_event(&expired, signal_event(0))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(harness.kernel.episodic().count(&ctx).await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_surfaces_in_the_envelope() {
    let harness = TestKernel::new();
    let ctx = harness.context("cancel").await;
    ctx.cancel.cancel();

    let result = harness
        .kernel
        .dispatch(
            &ctx,
            engram_core::Operation::RecordEvent {
                event: signal_event(0),
            },
        )
        .await;
    assert_eq!(result.status, engram_core::ResultStatus::Error);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
}

#[tokio::test]
async fn concurrent_identical_runs_coalesce() {
    let harness = TestKernel::with_embedder(seed_embedder());
    let ctx = harness.context("cancel").await;
    harness
        .kernel
        .episodic()
        .record_batch(&ctx, (0..6).map(signal_event).collect())
        .await
        .unwrap();

    let window_start = Utc::now() - ChronoDuration::hours(2);
    let window_end = Utc::now() + ChronoDuration::minutes(5);

    let engine = std::sync::Arc::clone(harness.kernel.engine());
    let ctx_a = RequestContext::new(ctx.project_id);
    let ctx_b = RequestContext::new(ctx.project_id);
    let (a, b) = tokio::join!(
        engine.run(&ctx_a, window_start, window_end, Strategy::Balanced),
        engine.run(&ctx_b, window_start, window_end, Strategy::Balanced),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    // At most one run did the work; the other coalesced onto it or found
    // the window already sealed
    assert!(a.coalesced != b.coalesced || a.events_in == 0 || b.events_in == 0);
    assert!(a.facts_created + b.facts_created <= 1);
    assert!(harness.kernel.semantic().count(&ctx).await.unwrap() <= 1);
}

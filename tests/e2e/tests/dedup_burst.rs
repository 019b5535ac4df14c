//! Deduplication under burst load
//!
//! Submits 1,000 events where 200 duplicate the first 200 and checks the
//! report and post-state, plus the single-event inserted/duplicate contract.

use engram_core::{Operation, ResultStatus};
use engram_e2e_tests::{fixtures, TestKernel};

#[tokio::test]
async fn burst_with_duplicates_reports_exact_counts() {
    let harness = TestKernel::new();
    let ctx = harness.context("burst").await;

    let mut events = Vec::with_capacity(1_000);
    for i in 0..800 {
        events.push(fixtures::message(&format!("burst event number {i}")));
    }
    for i in 0..200 {
        events.push(fixtures::message(&format!("burst event number {i}")));
    }

    let result = harness
        .kernel
        .dispatch(&ctx, Operation::RecordEvents { events })
        .await;
    assert_ne!(result.status, ResultStatus::Error);
    assert_eq!(result.data["inserted"], 800);
    assert_eq!(result.data["duplicates"], 200);
    assert_eq!(result.data["ids"].as_array().unwrap().len(), 1_000);
    assert!(result.data["errors"].as_array().unwrap().is_empty());

    assert_eq!(harness.kernel.episodic().count(&ctx).await.unwrap(), 800);
}

#[tokio::test]
async fn duplicate_ids_point_at_the_original_rows() {
    let harness = TestKernel::new();
    let ctx = harness.context("burst").await;

    let mut events = Vec::new();
    for i in 0..10 {
        events.push(fixtures::message(&format!("event {i}")));
    }
    events.push(fixtures::message("event 3"));

    let result = harness
        .kernel
        .dispatch(&ctx, Operation::RecordEvents { events })
        .await;
    let ids = result.data["ids"].as_array().unwrap();
    // The duplicate input resolves to the id of its first occurrence
    assert_eq!(ids[10], ids[3]);
}

#[tokio::test]
async fn record_event_twice_returns_inserted_then_duplicate() {
    let harness = TestKernel::new();
    let ctx = harness.context("single").await;

    let first = harness
        .kernel
        .episodic()
        .record_event(&ctx, fixtures::message("exactly once"))
        .await
        .unwrap();
    assert!(first.is_inserted());

    let second = harness
        .kernel
        .episodic()
        .record_event(&ctx, fixtures::message("exactly once"))
        .await
        .unwrap();
    assert!(!second.is_inserted());
    assert_eq!(first.id(), second.id());
    assert_eq!(harness.kernel.episodic().count(&ctx).await.unwrap(), 1);
}

#[tokio::test]
async fn duplicates_are_scoped_to_the_project() {
    let harness = TestKernel::new();
    let alpha = harness.context("alpha").await;
    let beta = harness.context("beta").await;

    let a = harness
        .kernel
        .episodic()
        .record_event(&alpha, fixtures::message("shared content"))
        .await
        .unwrap();
    let b = harness
        .kernel
        .episodic()
        .record_event(&beta, fixtures::message("shared content"))
        .await
        .unwrap();
    // Same hash in a different project still inserts
    assert!(a.is_inserted());
    assert!(b.is_inserted());
}

#[tokio::test]
async fn embedder_outage_does_not_block_ingestion() {
    let harness = TestKernel::with_embedder(engram_core::testing::StubEmbedder::offline());
    let ctx = harness.context("degraded").await;

    let result = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::RecordEvents {
                events: vec![
                    fixtures::message("stored without a vector"),
                    fixtures::message("another one"),
                ],
            },
        )
        .await;
    assert_ne!(result.status, ResultStatus::Error);
    assert_eq!(result.data["inserted"], 2);
    // Stored events are flagged for backfill
    assert!(result.warnings.iter().any(|w| w.contains("backfill")));
    assert_eq!(
        harness
            .kernel
            .episodic()
            .missing_embedding_count(&ctx)
            .await
            .unwrap(),
        2
    );
}

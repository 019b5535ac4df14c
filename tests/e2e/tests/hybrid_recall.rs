//! Hybrid recall weighting
//!
//! With controlled embeddings, the semantically-close fact outranks the
//! lexically-overlapping decoy, and rankings are reproducible for a fixed
//! weighting, embedding set, and corpus.

use engram_core::testing::{blend, unit_vector, StubEmbedder};
use engram_core::{Embedding, FactInput, Operation, ResultStatus};
use engram_e2e_tests::{fixtures, TestKernel};

/// Embedder where the query lands next to the pool-tuning fact and far from
/// the metaphor decoy
fn controlled_embedder() -> StubEmbedder {
    let tuning = unit_vector("pool tuning topic");
    let metaphor = unit_vector("literary metaphor topic");
    StubEmbedder::new()
        .with_mapping("database connection pool tuning", tuning.clone())
        .with_mapping("unrelated pool metaphor", metaphor)
        .with_mapping("how to tune connection pool", blend(&tuning, &unit_vector("noise"), 0.05))
}

async fn seed_facts(harness: &TestKernel, ctx: &engram_core::RequestContext) {
    let event = harness
        .kernel
        .episodic()
        .record_event(ctx, fixtures::message("observed pool behavior"))
        .await
        .unwrap()
        .id();
    for (statement, domain) in [
        ("database connection pool tuning", "database"),
        ("unrelated pool metaphor", "prose"),
    ] {
        harness
            .kernel
            .semantic()
            .remember(
                ctx,
                FactInput {
                    statement: statement.to_string(),
                    domain: domain.to_string(),
                    source_event_ids: vec![event],
                    confidence: Some(0.9),
                },
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn semantic_weighting_prefers_the_close_fact() {
    let harness = TestKernel::with_embedder(controlled_embedder());
    let ctx = harness.context("recall").await;
    seed_facts(&harness, &ctx).await;

    let result = harness
        .kernel
        .dispatch(
            &ctx,
            Operation::parse(
                "recall",
                serde_json::json!({"query": "how to tune connection pool", "limit": 10}),
            )
            .unwrap(),
        )
        .await;
    assert_ne!(result.status, ResultStatus::Error);
    let items = result.data.as_array().unwrap();
    assert!(items.len() >= 2);
    assert_eq!(items[0]["statement"], "database connection pool tuning");
}

#[tokio::test]
async fn ranking_is_reproducible_under_fixed_alpha() {
    let harness = TestKernel::with_embedder(controlled_embedder());
    let ctx = harness.context("recall").await;
    seed_facts(&harness, &ctx).await;

    let query_embedding = Embedding::new(blend(
        &unit_vector("pool tuning topic"),
        &unit_vector("noise"),
        0.05,
    ));

    for alpha in [0.6_f32, 0.0_f32] {
        let first: Vec<i64> = harness
            .kernel
            .semantic()
            .recall(
                &ctx,
                "how to tune connection pool",
                Some(&query_embedding),
                None,
                10,
                false,
                alpha,
            )
            .await
            .unwrap()
            .iter()
            .map(|(fact, _)| fact.id)
            .collect();
        let second: Vec<i64> = harness
            .kernel
            .semantic()
            .recall(
                &ctx,
                "how to tune connection pool",
                Some(&query_embedding),
                None,
                10,
                false,
                alpha,
            )
            .await
            .unwrap()
            .iter()
            .map(|(fact, _)| fact.id)
            .collect();
        assert_eq!(first, second, "ranking must be stable for alpha {alpha}");
    }
}

#[tokio::test]
async fn limit_shrink_yields_a_subset() {
    let harness = TestKernel::new();
    let ctx = harness.context("recall").await;
    let event = harness
        .kernel
        .episodic()
        .record_event(&ctx, fixtures::message("observed"))
        .await
        .unwrap()
        .id();
    for i in 0..6 {
        harness
            .kernel
            .semantic()
            .remember(
                &ctx,
                FactInput {
                    statement: format!("retrieval subject fact {i}"),
                    domain: "test".to_string(),
                    source_event_ids: vec![event],
                    confidence: Some(0.8),
                },
            )
            .await
            .unwrap();
    }

    let wide: Vec<i64> = harness
        .kernel
        .semantic()
        .recall(&ctx, "retrieval subject", None, None, 6, false, 0.6)
        .await
        .unwrap()
        .iter()
        .map(|(fact, _)| fact.id)
        .collect();
    let narrow: Vec<i64> = harness
        .kernel
        .semantic()
        .recall(&ctx, "retrieval subject", None, None, 3, false, 0.6)
        .await
        .unwrap()
        .iter()
        .map(|(fact, _)| fact.id)
        .collect();

    assert_eq!(narrow.len(), 3);
    // Shrinking the limit never surfaces anything the wider query missed
    assert!(narrow.iter().all(|id| wide.contains(id)));
}

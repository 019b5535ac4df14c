//! Validator outage during consolidation
//!
//! With the deep validator failing, runs still complete: the report counts
//! the failures, every emitted fact carries downgraded confidence, and
//! repeated failures disable deep validation for the rest of the run.

use chrono::{Duration, Utc};
use engram_core::testing::{unit_vector, StubEmbedder, StubValidator, ValidatorScript};
use engram_core::{EventContext, EventInput, EventKind, Strategy};
use engram_e2e_tests::TestKernel;

/// Three well-separated topics so the run proposes three fact candidates
fn three_topic_embedder() -> StubEmbedder {
    StubEmbedder::new()
        .with_mapping("alpha topic", unit_vector("alpha cluster"))
        .with_mapping("beta topic", unit_vector("beta cluster"))
        .with_mapping("gamma topic", unit_vector("gamma cluster"))
}

fn topic_event(topic: &str, i: usize) -> EventInput {
    let mut context = EventContext::new();
    context.insert("domain".to_string(), topic.split_whitespace().next().unwrap().to_string());
    EventInput {
        content: format!("{topic} observation {i}"),
        kind: EventKind::Message,
        context,
        created_at: Some(Utc::now() - Duration::minutes(30)),
        ..Default::default()
    }
}

async fn seed_topics(harness: &TestKernel, ctx: &engram_core::RequestContext) {
    let mut events = Vec::new();
    for topic in ["alpha topic", "beta topic", "gamma topic"] {
        for i in 0..3 {
            events.push(topic_event(topic, i));
        }
    }
    harness.kernel.episodic().record_batch(ctx, events).await.unwrap();
}

#[tokio::test]
async fn failing_validator_downgrades_but_completes() {
    let harness = TestKernel::with_parts(
        engram_core::EngineConfig::default(),
        std::sync::Arc::new(three_topic_embedder()),
        std::sync::Arc::new(StubValidator::failing()),
    );
    let ctx = harness.context("outage").await;
    seed_topics(&harness, &ctx).await;

    // Quality strategy deep-validates every candidate
    let report = harness
        .kernel
        .engine()
        .run(
            &ctx,
            Utc::now() - Duration::hours(2),
            Utc::now() + Duration::minutes(5),
            Strategy::Quality,
        )
        .await
        .unwrap();

    assert!(report.llm_calls > 0);
    assert!(report.llm_failures > 0);
    assert!(report.facts_created > 0);
    // Three consecutive failures disable deep validation for the run
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("deep validation disabled")));

    // Every emitted fact carries at most 0.7x the heuristic base confidence
    // (tight clusters have base 0.9)
    let facts = harness
        .kernel
        .semantic()
        .recall(&ctx, "topic observation", None, None, 10, true, 0.6)
        .await
        .unwrap();
    assert!(!facts.is_empty());
    for (fact, _) in &facts {
        assert!(
            fact.confidence <= 0.7 * 0.9 + 1e-9,
            "fact {} confidence {} exceeds the degraded ceiling",
            fact.id,
            fact.confidence
        );
    }
}

#[tokio::test]
async fn confirming_validator_keeps_full_confidence() {
    let harness = TestKernel::with_parts(
        engram_core::EngineConfig::default(),
        std::sync::Arc::new(three_topic_embedder()),
        std::sync::Arc::new(StubValidator::confirming()),
    );
    let ctx = harness.context("outage").await;
    seed_topics(&harness, &ctx).await;

    let report = harness
        .kernel
        .engine()
        .run(
            &ctx,
            Utc::now() - Duration::hours(2),
            Utc::now() + Duration::minutes(5),
            Strategy::Quality,
        )
        .await
        .unwrap();
    assert_eq!(report.llm_failures, 0);
    assert!(report.llm_calls >= 3);

    let facts = harness
        .kernel
        .semantic()
        .recall(&ctx, "topic observation", None, None, 10, true, 0.6)
        .await
        .unwrap();
    for (fact, _) in &facts {
        assert!(fact.confidence >= 0.85);
    }
}

#[tokio::test]
async fn refuting_validator_drops_candidates() {
    let harness = TestKernel::with_parts(
        engram_core::EngineConfig::default(),
        std::sync::Arc::new(three_topic_embedder()),
        std::sync::Arc::new(StubValidator::with_script(ValidatorScript::Refute)),
    );
    let ctx = harness.context("outage").await;
    seed_topics(&harness, &ctx).await;

    let report = harness
        .kernel
        .engine()
        .run(
            &ctx,
            Utc::now() - Duration::hours(2),
            Utc::now() + Duration::minutes(5),
            Strategy::Quality,
        )
        .await
        .unwrap();
    assert_eq!(report.facts_created, 0);
    assert_eq!(harness.kernel.semantic().count(&ctx).await.unwrap(), 0);
}

#[tokio::test]
async fn disabled_validator_never_gets_called() {
    let harness = TestKernel::with_parts(
        engram_core::EngineConfig::default(),
        std::sync::Arc::new(three_topic_embedder()),
        std::sync::Arc::new(StubValidator::disabled()),
    );
    let ctx = harness.context("outage").await;
    seed_topics(&harness, &ctx).await;

    let report = harness
        .kernel
        .engine()
        .run(
            &ctx,
            Utc::now() - Duration::hours(2),
            Utc::now() + Duration::minutes(5),
            Strategy::Quality,
        )
        .await
        .unwrap();
    assert_eq!(report.llm_calls, 0);
    assert_eq!(harness.validator.call_count(), 0);
    // System 1 decisions survive at reduced confidence
    assert!(report.facts_created > 0);
}

//! Verification Gateway
//!
//! Wraps mutating operations with the seven quality gates. Warnings ride
//! along on the structured result; an error-severity violation triggers one
//! remediation attempt (a candidate rewrite) before re-verification, and a
//! second violation aborts the operation.

pub mod gates;

pub use gates::{
    coherence_gate, confidence_gate, consistency_gate, efficiency_gate, grounding_gate,
    is_negation, minimality_gate, soundness_gate, GateCheck, GateOutcome, Severity,
    CONSISTENCY_FLOOR, GROUNDING_COVERAGE, MINIMALITY_SIMILARITY, NEGATION_OVERLAP,
};

use std::sync::Arc;

use crate::context::RequestContext;
use crate::embed::Embedding;
use crate::error::{Error, Result};
use crate::layers::SemanticLayer;
use crate::model::FactInput;
use crate::search::{Collection, VectorStore};

// ============================================================================
// GATE SET
// ============================================================================

/// The collected results of one verification pass
#[derive(Debug, Clone, Default)]
pub struct GateSet {
    /// Individual gate results
    pub checks: Vec<GateCheck>,
}

impl GateSet {
    /// Warnings to attach to the structured result
    pub fn warnings(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter_map(|check| match &check.outcome {
                GateOutcome::Warn(detail)
                | GateOutcome::Violation(Severity::Warning, detail) => {
                    Some(format!("{}: {detail}", check.gate))
                }
                _ => None,
            })
            .collect()
    }

    /// First error-severity violation, if any
    pub fn first_fatal(&self) -> Option<&GateCheck> {
        self.checks.iter().find(|check| check.outcome.is_fatal())
    }
}

// ============================================================================
// GATEWAY
// ============================================================================

/// Gatekeeper for mutating operations
pub struct Gateway {
    semantic: Arc<SemanticLayer>,
    vectors: Arc<VectorStore>,
}

impl Gateway {
    /// Build over the layers the gates consult
    pub fn new(semantic: Arc<SemanticLayer>, vectors: Arc<VectorStore>) -> Self {
        Self { semantic, vectors }
    }

    /// Verify a fact candidate before insertion
    ///
    /// `cluster_size` is the evidence pool the citations are measured
    /// against (for direct `remember` calls it equals the citation count).
    /// Remediation clamps an out-of-range confidence once; any remaining
    /// fatal violation aborts.
    pub async fn verify_fact(
        &self,
        ctx: &RequestContext,
        input: &mut FactInput,
        statement_embedding: Option<&Embedding>,
        cluster_size: usize,
        has_contradiction_evidence: bool,
    ) -> Result<GateSet> {
        let mut gate_set = self
            .run_fact_gates(ctx, input, statement_embedding, cluster_size, has_contradiction_evidence)
            .await?;

        if let Some(fatal) = gate_set.first_fatal() {
            let gate = fatal.gate;
            if !remediate_fact(gate, input) {
                return Err(Error::validation(format!(
                    "{gate} gate violation: {}",
                    fatal_detail(fatal)
                )));
            }
            tracing::debug!(gate, "fact candidate remediated, re-verifying");
            gate_set = self
                .run_fact_gates(ctx, input, statement_embedding, cluster_size, has_contradiction_evidence)
                .await?;
            if let Some(fatal) = gate_set.first_fatal() {
                return Err(Error::validation(format!(
                    "{} gate violation after remediation: {}",
                    fatal.gate,
                    fatal_detail(fatal)
                )));
            }
        }

        Ok(gate_set)
    }

    async fn run_fact_gates(
        &self,
        ctx: &RequestContext,
        input: &FactInput,
        statement_embedding: Option<&Embedding>,
        cluster_size: usize,
        has_contradiction_evidence: bool,
    ) -> Result<GateSet> {
        let mut checks = Vec::with_capacity(4);

        checks.push(grounding_gate(
            input.source_event_ids.len(),
            cluster_size.max(input.source_event_ids.len()),
        ));
        checks.push(confidence_gate(
            input
                .confidence
                .unwrap_or(crate::model::DEFAULT_BASE_CONFIDENCE),
        ));

        let high_confidence = self
            .semantic
            .high_confidence_facts(ctx, CONSISTENCY_FLOOR, 200)
            .await?;
        checks.push(consistency_gate(
            &input.statement,
            &high_confidence,
            has_contradiction_evidence,
        ));

        // Minimality compares against the closest existing fact, excluding an
        // exact statement match (that path is reinforcement, not duplication).
        let max_similarity = match statement_embedding {
            Some(embedding) => {
                let mut nearest = None;
                let hits = self.vectors.search(
                    Collection::Facts,
                    ctx.project_id,
                    &embedding.vector,
                    3,
                    0.0,
                )?;
                for (fact_id, similarity) in hits {
                    let existing = self.semantic.get_fact(ctx, fact_id).await;
                    if let Ok(existing) = existing {
                        if existing.statement != input.statement
                            && nearest.map(|n: f32| similarity > n).unwrap_or(true)
                        {
                            nearest = Some(similarity);
                        }
                    }
                }
                nearest
            }
            None => None,
        };
        checks.push(minimality_gate(max_similarity));

        Ok(GateSet { checks })
    }
}

/// Per-gate remediation; true when the candidate was rewritten
fn remediate_fact(gate: &'static str, input: &mut FactInput) -> bool {
    match gate {
        "confidence" => {
            if let Some(confidence) = input.confidence {
                input.confidence = Some(confidence.clamp(0.0, 1.0));
                return true;
            }
            false
        }
        // Grounding, consistency, and minimality violations need different
        // inputs, not a rewrite of this one.
        _ => false,
    }
}

fn fatal_detail(check: &GateCheck) -> String {
    match &check.outcome {
        GateOutcome::Violation(_, detail) => detail.clone(),
        _ => String::new(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestConfig, StorageConfig};
    use crate::layers::EpisodicLayer;
    use crate::model::{EventInput, FactInput};
    use crate::testing::StubEmbedder;

    struct Fixture {
        _dir: tempfile::TempDir,
        episodic: Arc<EpisodicLayer>,
        semantic: Arc<SemanticLayer>,
        gateway: Gateway,
        ctx: RequestContext,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let pool =
            crate::storage::open(&dir.path().join("test.db"), &StorageConfig::default()).unwrap();
        let project_id = {
            let conn = pool.acquire_blocking().unwrap();
            crate::storage::resolve_project(&conn, "test").unwrap()
        };
        let vectors = Arc::new(VectorStore::new().unwrap());
        let embedder: Arc<dyn crate::embed::Embedder> = Arc::new(StubEmbedder::new());
        let episodic = Arc::new(EpisodicLayer::new(
            pool.clone(),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            &IngestConfig::default(),
        ));
        let semantic = Arc::new(SemanticLayer::new(pool, Arc::clone(&vectors), embedder));
        let gateway = Gateway::new(Arc::clone(&semantic), vectors);
        Fixture {
            _dir: dir,
            episodic,
            semantic,
            gateway,
            ctx: RequestContext::new(project_id),
        }
    }

    async fn seed_event(f: &Fixture, content: &str) -> i64 {
        f.episodic
            .record_event(
                &f.ctx,
                EventInput {
                    content: content.to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id()
    }

    #[tokio::test]
    async fn test_clean_candidate_passes() {
        let f = fixture().await;
        let event = seed_event(&f, "observed").await;
        let mut input = FactInput {
            statement: "fresh observation".to_string(),
            domain: "misc".to_string(),
            source_event_ids: vec![event],
            confidence: Some(0.6),
        };
        let gate_set = f
            .gateway
            .verify_fact(&f.ctx, &mut input, None, 1, false)
            .await
            .unwrap();
        assert!(gate_set.first_fatal().is_none());
        assert!(gate_set.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_confidence_remediation_clamps_once() {
        let f = fixture().await;
        let event = seed_event(&f, "observed").await;
        let mut input = FactInput {
            statement: "overconfident".to_string(),
            domain: "misc".to_string(),
            source_event_ids: vec![event],
            confidence: Some(1.4),
        };
        let gate_set = f
            .gateway
            .verify_fact(&f.ctx, &mut input, None, 1, false)
            .await
            .unwrap();
        // Clamped to 1.0, which still warns against the calibration ceiling
        assert_eq!(input.confidence, Some(1.0));
        assert!(!gate_set.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_consistency_violation_aborts() {
        let f = fixture().await;
        let event = seed_event(&f, "tests passed").await;
        f.semantic
            .remember(
                &f.ctx,
                FactInput {
                    statement: "integration tests passed on main".to_string(),
                    domain: "ci".to_string(),
                    source_event_ids: vec![event],
                    confidence: Some(0.9),
                },
            )
            .await
            .unwrap();

        let mut contradicting = FactInput {
            statement: "integration tests failed on main".to_string(),
            domain: "ci".to_string(),
            source_event_ids: vec![event],
            confidence: Some(0.6),
        };
        let err = f
            .gateway
            .verify_fact(&f.ctx, &mut contradicting, None, 1, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);

        // With contradiction evidence the same candidate passes with a warning
        let gate_set = f
            .gateway
            .verify_fact(&f.ctx, &mut contradicting, None, 1, true)
            .await
            .unwrap();
        assert!(gate_set.first_fatal().is_none());
        assert!(!gate_set.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_minimality_blocks_near_duplicates() {
        let f = fixture().await;
        let event = seed_event(&f, "observed").await;
        let (fact, _) = f
            .semantic
            .remember(
                &f.ctx,
                FactInput {
                    statement: "the cache layer needs warming".to_string(),
                    domain: "perf".to_string(),
                    source_event_ids: vec![event],
                    confidence: Some(0.7),
                },
            )
            .await
            .unwrap();
        assert!(fact.has_embedding);

        // Same embedding as the stored fact, different statement text
        let duplicate_embedding =
            Embedding::new(crate::testing::unit_vector("the cache layer needs warming"));
        let mut near_duplicate = FactInput {
            statement: "cache layer warming is needed".to_string(),
            domain: "perf".to_string(),
            source_event_ids: vec![event],
            confidence: Some(0.7),
        };
        let err = f
            .gateway
            .verify_fact(&f.ctx, &mut near_duplicate, Some(&duplicate_embedding), 1, false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}

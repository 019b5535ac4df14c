//! Quality Gates
//!
//! Seven per-operation checks. Each gate returns pass, warn, or a violation
//! with severity; a warning rides along on the structured result while an
//! error-severity violation aborts the operation after one remediation
//! attempt.

use std::collections::HashSet;

use crate::model::Fact;

/// Minimum fraction of a cluster an artifact must cite
pub const GROUNDING_COVERAGE: f64 = 0.5;

/// Confidence calibration bounds; outside is a warning
pub const CONFIDENCE_FLOOR: f64 = 0.05;
/// Upper calibration bound
pub const CONFIDENCE_CEIL: f64 = 0.95;

/// Existing-fact confidence above which contradictions are policed
pub const CONSISTENCY_FLOOR: f64 = 0.8;

/// Semantic similarity above which a candidate is a duplicate
pub const MINIMALITY_SIMILARITY: f32 = 0.95;

/// Token-overlap (Jaccard) floor for treating two statements as the same
/// claim with opposing polarity
pub const NEGATION_OVERLAP: f64 = 0.5;

// ============================================================================
// OUTCOMES
// ============================================================================

/// Violation severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Passes through with the warning attached
    Warning,
    /// Aborts the operation
    Error,
}

/// Result of one gate
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// No issue
    Pass,
    /// Issue worth surfacing; operation proceeds
    Warn(String),
    /// Rule violated
    Violation(Severity, String),
}

impl GateOutcome {
    /// True for error-severity violations
    pub fn is_fatal(&self) -> bool {
        matches!(self, GateOutcome::Violation(Severity::Error, _))
    }
}

/// A gate's named result
#[derive(Debug, Clone)]
pub struct GateCheck {
    /// Gate name: grounding, confidence, consistency, soundness,
    /// minimality, coherence, efficiency
    pub gate: &'static str,
    /// What the gate found
    pub outcome: GateOutcome,
}

// ============================================================================
// GATES
// ============================================================================

/// Grounding: artifact cites events, covering enough of its cluster
pub fn grounding_gate(cited: usize, cluster_size: usize) -> GateCheck {
    let outcome = if cited == 0 {
        GateOutcome::Violation(Severity::Error, "artifact cites no events".to_string())
    } else if cluster_size > 0 && (cited as f64 / cluster_size as f64) < GROUNDING_COVERAGE {
        GateOutcome::Violation(
            Severity::Warning,
            format!("citations cover {cited}/{cluster_size} of the cluster"),
        )
    } else {
        GateOutcome::Pass
    };
    GateCheck {
        gate: "grounding",
        outcome,
    }
}

/// Confidence: value in range and inside calibration bounds
pub fn confidence_gate(confidence: f64) -> GateCheck {
    let outcome = if !(0.0..=1.0).contains(&confidence) {
        GateOutcome::Violation(
            Severity::Error,
            format!("confidence {confidence} outside [0, 1]"),
        )
    } else if !(CONFIDENCE_FLOOR..=CONFIDENCE_CEIL).contains(&confidence) {
        GateOutcome::Warn(format!(
            "confidence {confidence} outside calibration bounds [{CONFIDENCE_FLOOR}, {CONFIDENCE_CEIL}]"
        ))
    } else {
        GateOutcome::Pass
    };
    GateCheck {
        gate: "confidence",
        outcome,
    }
}

/// Consistency: no direct negation of a high-confidence fact without
/// contradiction evidence
pub fn consistency_gate(
    statement: &str,
    high_confidence: &[Fact],
    has_contradiction_evidence: bool,
) -> GateCheck {
    for fact in high_confidence {
        if fact.confidence >= CONSISTENCY_FLOOR && is_negation(statement, &fact.statement) {
            let outcome = if has_contradiction_evidence {
                GateOutcome::Warn(format!(
                    "contradicts fact {} with evidence attached",
                    fact.id
                ))
            } else {
                GateOutcome::Violation(
                    Severity::Error,
                    format!("directly negates fact {} without contradiction evidence", fact.id),
                )
            };
            return GateCheck {
                gate: "consistency",
                outcome,
            };
        }
    }
    GateCheck {
        gate: "consistency",
        outcome: GateOutcome::Pass,
    }
}

/// Soundness: structural legality checked by the owning layer
///
/// The prospective layer enforces acyclicity and the state machine itself;
/// the gate records the result of that enforcement.
pub fn soundness_gate(layer_check: Result<(), String>) -> GateCheck {
    GateCheck {
        gate: "soundness",
        outcome: match layer_check {
            Ok(()) => GateOutcome::Pass,
            Err(detail) => GateOutcome::Violation(Severity::Error, detail),
        },
    }
}

/// Minimality: no duplicate semantic content above the similarity ceiling
pub fn minimality_gate(max_similarity_to_existing: Option<f32>) -> GateCheck {
    let outcome = match max_similarity_to_existing {
        Some(similarity) if similarity > MINIMALITY_SIMILARITY => GateOutcome::Violation(
            Severity::Error,
            format!("duplicates existing content at similarity {similarity:.3}"),
        ),
        _ => GateOutcome::Pass,
    };
    GateCheck {
        gate: "minimality",
        outcome,
    }
}

/// Coherence: new entities connect to an existing community or are
/// explicitly isolated
pub fn coherence_gate(connects_to_existing: bool, explicitly_isolated: bool) -> GateCheck {
    let outcome = if connects_to_existing || explicitly_isolated {
        GateOutcome::Pass
    } else {
        GateOutcome::Warn("entity joins no existing community".to_string())
    };
    GateCheck {
        gate: "coherence",
        outcome,
    }
}

/// Efficiency: the operation stayed within its latency budget
pub fn efficiency_gate(elapsed_ms: u64, budget_ms: u64) -> GateCheck {
    let outcome = if budget_ms > 0 && elapsed_ms > budget_ms {
        GateOutcome::Warn(format!("took {elapsed_ms} ms against a {budget_ms} ms budget"))
    } else {
        GateOutcome::Pass
    };
    GateCheck {
        gate: "efficiency",
        outcome,
    }
}

// ============================================================================
// NEGATION HEURISTIC
// ============================================================================

const NEGATORS: &[&str] = &["not", "no", "never", "cannot", "without", "isn't", "doesn't", "won't"];

const POLARITY_PAIRS: &[(&str, &str)] = &[
    ("succeeds", "fails"),
    ("succeeded", "failed"),
    ("passes", "fails"),
    ("passed", "failed"),
    ("works", "breaks"),
];

/// Direct-negation detection between two statements
///
/// Embeddings place a statement and its negation close together, so negation
/// is detected lexically: high token overlap with opposing polarity, where
/// polarity comes from explicit negators or antonym outcome pairs.
pub fn is_negation(a: &str, b: &str) -> bool {
    let (a_tokens, a_negated, a_polarity) = analyze(a);
    let (b_tokens, b_negated, b_polarity) = analyze(b);

    let overlap = jaccard(&a_tokens, &b_tokens);
    if overlap < NEGATION_OVERLAP {
        return false;
    }
    if a_negated != b_negated {
        return true;
    }
    matches!((a_polarity, b_polarity), (Some(x), Some(y)) if x != y)
}

fn analyze(statement: &str) -> (HashSet<String>, bool, Option<usize>) {
    let mut tokens = HashSet::new();
    let mut negated = false;
    let mut polarity = None;
    for raw in statement.to_lowercase().split_whitespace() {
        let token: String = raw.chars().filter(|c| c.is_alphanumeric()).collect();
        if token.is_empty() {
            continue;
        }
        if NEGATORS.contains(&token.as_str()) {
            negated = !negated;
            continue;
        }
        for (idx, (pos, neg)) in POLARITY_PAIRS.iter().enumerate() {
            if token == *pos {
                polarity = Some(idx * 2);
                tokens.insert(format!("polarity{idx}"));
            } else if token == *neg {
                polarity = Some(idx * 2 + 1);
                tokens.insert(format!("polarity{idx}"));
            }
        }
        if !tokens.contains(&token) {
            tokens.insert(token);
        }
    }
    (tokens, negated, polarity)
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fact(id: i64, statement: &str, confidence: f64) -> Fact {
        Fact {
            id,
            project_id: 1,
            statement: statement.to_string(),
            domain: "test".to_string(),
            confidence,
            has_embedding: false,
            source_event_ids: vec![1],
            support_count: 1,
            contradiction_count: 0,
            last_reinforced_at: Utc::now(),
            archived: false,
            created_at: Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn test_grounding_gate() {
        assert!(matches!(grounding_gate(5, 10).outcome, GateOutcome::Pass));
        assert!(matches!(
            grounding_gate(4, 10).outcome,
            GateOutcome::Violation(Severity::Warning, _)
        ));
        assert!(grounding_gate(0, 10).outcome.is_fatal());
    }

    #[test]
    fn test_confidence_gate() {
        assert!(matches!(confidence_gate(0.6).outcome, GateOutcome::Pass));
        assert!(matches!(confidence_gate(0.99).outcome, GateOutcome::Warn(_)));
        assert!(confidence_gate(1.5).outcome.is_fatal());
    }

    #[test]
    fn test_negation_detection() {
        assert!(is_negation(
            "the deploy script works on staging",
            "the deploy script does not work on staging"
        ));
        assert!(is_negation(
            "integration tests passed on main",
            "integration tests failed on main"
        ));
        assert!(!is_negation(
            "the deploy script works on staging",
            "connection pool tuning reduces latency"
        ));
        assert!(!is_negation(
            "tests passed on main",
            "tests passed on main"
        ));
    }

    #[test]
    fn test_consistency_gate() {
        let existing = vec![fact(1, "integration tests passed on main", 0.9)];
        let check = consistency_gate("integration tests failed on main", &existing, false);
        assert!(check.outcome.is_fatal());

        // Evidence converts the violation into a warning
        let check = consistency_gate("integration tests failed on main", &existing, true);
        assert!(matches!(check.outcome, GateOutcome::Warn(_)));

        // Low-confidence facts are not policed
        let weak = vec![fact(1, "integration tests passed on main", 0.5)];
        let check = consistency_gate("integration tests failed on main", &weak, false);
        assert!(matches!(check.outcome, GateOutcome::Pass));
    }

    #[test]
    fn test_minimality_gate() {
        assert!(matches!(minimality_gate(None).outcome, GateOutcome::Pass));
        assert!(matches!(minimality_gate(Some(0.9)).outcome, GateOutcome::Pass));
        assert!(minimality_gate(Some(0.97)).outcome.is_fatal());
    }

    #[test]
    fn test_coherence_and_efficiency() {
        assert!(matches!(coherence_gate(true, false).outcome, GateOutcome::Pass));
        assert!(matches!(coherence_gate(false, true).outcome, GateOutcome::Pass));
        assert!(matches!(coherence_gate(false, false).outcome, GateOutcome::Warn(_)));
        assert!(matches!(efficiency_gate(10, 100).outcome, GateOutcome::Pass));
        assert!(matches!(efficiency_gate(200, 100).outcome, GateOutcome::Warn(_)));
    }

    #[test]
    fn test_soundness_gate() {
        assert!(matches!(soundness_gate(Ok(())).outcome, GateOutcome::Pass));
        assert!(soundness_gate(Err("cycle detected".to_string())).outcome.is_fatal());
    }
}

//! Score Fusion
//!
//! Combines lexical and semantic result lists into one ranking. The final
//! score is `R = alpha * semantic + (1 - alpha) * lexical` over normalized
//! per-source scores; items present in only one list contribute the term
//! they have.

use std::collections::HashMap;

/// Default semantic weight in the fused score
pub const DEFAULT_ALPHA: f32 = 0.6;

// ============================================================================
// FUSION
// ============================================================================

/// One fused result with its per-signal scores
#[derive(Debug, Clone, PartialEq)]
pub struct FusedScore {
    /// Row id
    pub id: i64,
    /// Fused score
    pub score: f32,
    /// Lexical score when the lexical leg matched
    pub lexical: Option<f32>,
    /// Semantic score when the semantic leg matched
    pub semantic: Option<f32>,
}

/// Fuse lexical and semantic result lists
///
/// Both inputs are (id, score) with scores already normalized to [0, 1].
/// The output is sorted by fused score descending; ties keep smaller ids
/// first so rankings are reproducible.
pub fn fuse(
    lexical: &[(i64, f32)],
    semantic: &[(i64, f32)],
    alpha: f32,
) -> Vec<FusedScore> {
    let mut by_id: HashMap<i64, (Option<f32>, Option<f32>)> = HashMap::new();

    for (id, score) in lexical {
        by_id.entry(*id).or_default().0 = Some(*score);
    }
    for (id, score) in semantic {
        by_id.entry(*id).or_default().1 = Some(*score);
    }

    let mut results: Vec<FusedScore> = by_id
        .into_iter()
        .map(|(id, (lex, sem))| {
            let score = alpha * sem.unwrap_or(0.0) + (1.0 - alpha) * lex.unwrap_or(0.0);
            FusedScore {
                id,
                score,
                lexical: lex,
                semantic: sem,
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    results
}

// ============================================================================
// TESTS
// ============================================================================

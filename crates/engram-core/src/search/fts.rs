//! FTS5 Query Handling
//!
//! User queries go to FTS5 as quoted phrase terms so operator characters
//! cannot change query semantics. BM25 ranks come back negative
//! (better = more negative); scores are flipped and max-normalized to [0, 1].

// ============================================================================
// SANITIZATION
// ============================================================================

/// Sanitize a free-text query for FTS5 MATCH
///
/// Each whitespace-separated term is stripped of FTS5 operator characters and
/// double-quoted, then terms are OR-joined. An empty result means the query
/// had no searchable content and the caller should skip the lexical leg.
pub fn sanitize_fts5_query(query: &str) -> String {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| {
            term.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || *c == '.')
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();

    terms.join(" OR ")
}

/// Flip BM25 ranks into positive scores and max-normalize to [0, 1]
///
/// Input pairs are (id, bm25_rank) where smaller (more negative) rank is
/// better. Output preserves input order.
pub fn normalize_bm25(rows: Vec<(i64, f64)>) -> Vec<(i64, f32)> {
    let flipped: Vec<(i64, f32)> = rows
        .into_iter()
        .map(|(id, rank)| (id, (-rank).max(0.0) as f32))
        .collect();

    let max_score = flipped.iter().map(|(_, s)| *s).fold(0.0_f32, f32::max);
    if max_score > 0.0 {
        flipped
            .into_iter()
            .map(|(id, s)| (id, s / max_score))
            .collect()
    } else {
        flipped
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Query Expansion
//!
//! Template-based expansion for conceptual queries: classify the query's
//! intent, generate variants that cover adjacent phrasings, and embed their
//! centroid for a broader semantic target. The hypothetical-document
//! strategy writes a short pseudo-answer and embeds that instead.

// ============================================================================
// INTENT
// ============================================================================

/// Coarse query intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    /// "What is X?" / "Explain X"
    Definition,
    /// "How to X?" / "Steps to X"
    HowTo,
    /// "Why does X?" / causal questions
    Reasoning,
    /// Multi-word topical lookup
    Lookup,
    /// Code identifiers, paths, exact terms
    Technical,
}

/// Classify a query's intent from surface features
pub fn classify_intent(query: &str) -> QueryIntent {
    let lower = query.to_lowercase();
    let words = lower.split_whitespace().count();

    if lower.contains("how to") || lower.starts_with("how do") || lower.starts_with("steps") {
        return QueryIntent::HowTo;
    }
    if lower.starts_with("what is")
        || lower.starts_with("what are")
        || lower.starts_with("define")
        || lower.starts_with("explain")
    {
        return QueryIntent::Definition;
    }
    if lower.starts_with("why") || lower.contains("reason") {
        return QueryIntent::Reasoning;
    }
    if query.contains("::") || query.contains('(') || query.contains('/') || query.contains('_') {
        return QueryIntent::Technical;
    }
    if words >= 2 {
        QueryIntent::Lookup
    } else {
        QueryIntent::Technical
    }
}

// ============================================================================
// EXPANSION
// ============================================================================

/// Generate expanded variants of a query for centroid embedding
pub fn expand_query(query: &str) -> Vec<String> {
    let clean = query.trim().trim_end_matches('?').trim_end_matches('.');
    let mut variants = vec![query.to_string()];

    match classify_intent(query) {
        QueryIntent::Definition => {
            variants.push(format!("{clean} is"));
            variants.push(format!("definition of {clean}"));
        }
        QueryIntent::HowTo => {
            variants.push(format!("steps to {clean}"));
            variants.push(format!("to accomplish {clean} you need to"));
        }
        QueryIntent::Reasoning => {
            variants.push(format!("the cause of {clean}"));
            variants.push(format!("{clean} happens because"));
        }
        QueryIntent::Lookup => {
            variants.push(format!("information about {clean}"));
            variants.push(format!("key facts about {clean}"));
        }
        QueryIntent::Technical => {
            variants.push(format!("{clean} usage"));
        }
    }

    variants
}

/// Write a short hypothetical answer for a query
///
/// The pseudo-answer sits in answer-space rather than question-space, which
/// is where the stored statements live.
pub fn hypothetical_document(query: &str) -> String {
    let clean = query.trim().trim_end_matches('?').trim_end_matches('.');
    match classify_intent(query) {
        QueryIntent::HowTo => format!(
            "To {clean}: first check the preconditions, then apply the known working steps, \
             then verify the outcome."
        ),
        QueryIntent::Reasoning => format!(
            "{clean} because of an underlying cause observed in past events and their outcomes."
        ),
        _ => format!("{clean}: the relevant facts, observations, and outcomes recorded about this topic."),
    }
}

// ============================================================================
// TESTS
// ============================================================================

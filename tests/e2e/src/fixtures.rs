//! Event Fixtures
//!
//! Builders for the event shapes the scenarios feed in.

use chrono::{DateTime, Duration, Utc};
use engram_core::{EventContext, EventInput, EventKind, Outcome};

/// A message event with the given content
pub fn message(content: &str) -> EventInput {
    EventInput {
        content: content.to_string(),
        kind: EventKind::Message,
        ..Default::default()
    }
}

/// A tool_use event with a tool context key
pub fn tool_use(content: &str, tool: &str) -> EventInput {
    let mut context = EventContext::new();
    context.insert("tool".to_string(), tool.to_string());
    EventInput {
        content: content.to_string(),
        kind: EventKind::ToolUse,
        context,
        ..Default::default()
    }
}

/// A failed tool_use event tagged with a domain
pub fn failure_in_domain(content: &str, domain: &str) -> EventInput {
    let mut context = EventContext::new();
    context.insert("domain".to_string(), domain.to_string());
    EventInput {
        content: content.to_string(),
        kind: EventKind::ToolUse,
        outcome: Outcome::Failure,
        context,
        ..Default::default()
    }
}

/// Pin an event to a specific time
pub fn at(mut input: EventInput, when: DateTime<Utc>) -> EventInput {
    input.created_at = Some(when);
    input
}

/// A time `hours` hours before now
pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}

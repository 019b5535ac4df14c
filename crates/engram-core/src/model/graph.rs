//! Knowledge Graph - entities and relations
//!
//! Entities merge on (project, name, kind); relations merge on
//! (from, to, kind) by averaging weight and unioning evidence. Deleting an
//! entity cascades to its relations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ENTITY
// ============================================================================

/// A named entity in the knowledge graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Monotone rowid within the project
    pub id: i64,
    /// Owning project
    pub project_id: i64,
    /// Entity name
    pub name: String,
    /// Kind tag: file, module, person, concept, ...
    pub kind: String,
    /// Free-form properties
    #[serde(default)]
    pub properties: serde_json::Value,
    /// Community label from the last label-propagation pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community: Option<i64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Mutation counter
    pub version: i64,
}

/// Input for upserting an entity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntityInput {
    /// Entity name
    pub name: String,
    /// Kind tag
    pub kind: String,
    /// Free-form properties, merged over existing on upsert
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl EntityInput {
    /// Validate name and kind
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::error::Error::validation("entity name is empty"));
        }
        if self.kind.trim().is_empty() {
            return Err(crate::error::Error::validation("entity kind is empty"));
        }
        Ok(())
    }
}

// ============================================================================
// RELATION
// ============================================================================

/// A weighted, evidenced relation between two entities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// Monotone rowid within the project
    pub id: i64,
    /// Owning project
    pub project_id: i64,
    /// Source entity
    pub from_id: i64,
    /// Target entity
    pub to_id: i64,
    /// Relation kind: depends_on, edits, mentions, ...
    pub kind: String,
    /// Strength in (0, 1]
    pub weight: f64,
    /// Events evidencing this relation
    pub evidence_event_ids: Vec<i64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Mutation counter
    pub version: i64,
}

/// Input for linking two entities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelationInput {
    /// Source entity id
    pub from_id: i64,
    /// Target entity id
    pub to_id: i64,
    /// Relation kind
    pub kind: String,
    /// Strength in (0, 1]
    pub weight: f64,
    /// Evidence event id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_event_id: Option<i64>,
}

impl RelationInput {
    /// Validate weight bounds and endpoint distinctness
    pub fn validate(&self) -> crate::error::Result<()> {
        if !(self.weight > 0.0 && self.weight <= 1.0) {
            return Err(crate::error::Error::validation(format!(
                "relation weight {} outside (0, 1]",
                self.weight
            )));
        }
        if self.kind.trim().is_empty() {
            return Err(crate::error::Error::validation("relation kind is empty"));
        }
        if self.from_id == self.to_id {
            return Err(crate::error::Error::validation(
                "relation endpoints must differ",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_input_validation() {
        let input = EntityInput {
            name: "src/pool.rs".to_string(),
            kind: "file".to_string(),
            properties: serde_json::json!({}),
        };
        assert!(input.validate().is_ok());

        let input = EntityInput {
            name: "".to_string(),
            ..input
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn test_relation_weight_bounds() {
        let base = RelationInput {
            from_id: 1,
            to_id: 2,
            kind: "depends_on".to_string(),
            weight: 0.8,
            evidence_event_id: None,
        };
        assert!(base.validate().is_ok());

        let zero = RelationInput {
            weight: 0.0,
            ..base.clone()
        };
        assert!(zero.validate().is_err());

        let over = RelationInput {
            weight: 1.1,
            ..base.clone()
        };
        assert!(over.validate().is_err());

        let self_loop = RelationInput { to_id: 1, ..base };
        assert!(self_loop.validate().is_err());
    }
}

//! Entity and Relation records - the knowledge graph
//!
//! Entities are nodes; Relations are directed weak-referenced edges.
//! Deleting an entity cascades to its incident relations in one transaction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::{Envelope, EvidenceType};
use crate::error::{EngineError, Result};

/// A graph node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub name: String,
    pub entity_type: String,
    /// Small keyed attribute bag
    pub attributes: BTreeMap<String, String>,
}

/// A directed graph edge between two entities.
///
/// Both endpoint references are weak: the edge never owns its entities, and
/// entity deletion removes the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: String,
    /// Edge strength in [0, 1]
    pub strength: f64,
}

/// Input for creating an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntityInput {
    pub project_id: String,
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default = "super::event::default_importance")]
    pub importance: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl EntityInput {
    pub fn into_entity(self) -> Result<Entity> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("entity name is empty".to_string()));
        }
        let mut envelope = Envelope::new(self.project_id, EvidenceType::Observed);
        envelope.importance = self.importance;
        envelope.tags = self.tags;
        envelope.check()?;

        Ok(Entity {
            envelope,
            name: self.name,
            entity_type: self.entity_type,
            attributes: self.attributes,
        })
    }
}

/// Input for creating a relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelationInput {
    pub project_id: String,
    pub from_entity: String,
    pub to_entity: String,
    pub relation_type: String,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
}

fn default_strength() -> f64 {
    1.0
}

impl RelationInput {
    pub fn into_relation(self) -> Result<Relation> {
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(EngineError::Validation(format!(
                "relation strength {} outside [0, 1]",
                self.strength
            )));
        }
        if self.from_entity == self.to_entity {
            return Err(EngineError::Validation(
                "relation endpoints are the same entity".to_string(),
            ));
        }

        let mut envelope = Envelope::new(self.project_id, EvidenceType::Observed);
        envelope.valid_from = self.valid_from;
        envelope.valid_to = self.valid_to;
        envelope.check()?;

        Ok(Relation {
            envelope,
            from_entity: self.from_entity,
            to_entity: self.to_entity,
            relation_type: self.relation_type,
            strength: self.strength,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_rejects_self_loop() {
        let input = RelationInput {
            project_id: "p".into(),
            from_entity: "a".into(),
            to_entity: "a".into(),
            relation_type: "depends_on".into(),
            strength: 0.5,
            valid_from: None,
            valid_to: None,
        };
        assert!(input.into_relation().is_err());
    }

    #[test]
    fn test_relation_rejects_bad_strength() {
        let input = RelationInput {
            project_id: "p".into(),
            from_entity: "a".into(),
            to_entity: "b".into(),
            relation_type: "depends_on".into(),
            strength: 1.5,
            valid_from: None,
            valid_to: None,
        };
        assert!(input.into_relation().is_err());
    }

    #[test]
    fn test_entity_input() {
        let input = EntityInput {
            project_id: "p".into(),
            name: "parser".into(),
            entity_type: "module".into(),
            attributes: BTreeMap::from([("path".into(), "src/parser.rs".into())]),
            importance: 0.7,
            tags: vec![],
        };
        let entity = input.into_entity().unwrap();
        assert_eq!(entity.entity_type, "module");
        assert_eq!(entity.envelope.importance, 0.7);
    }
}

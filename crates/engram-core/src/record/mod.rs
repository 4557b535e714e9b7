//! Record layer - typed, versioned records over a common envelope
//!
//! Seven record kinds share one envelope (scope, bi-temporal stamps,
//! lifecycle, confidence, evidence, activation, importance, tags) and extend
//! it with kind-specific fields. Kind-generic paths use the `Record` tagged
//! variant; every CRUD surface is typed per kind.

pub mod envelope;
pub mod event;
pub mod fact;
pub mod graph;
pub mod pattern;
pub mod procedure;
pub mod task;

pub use envelope::{derive_evidence_quality, Envelope, EvidenceType, Lifecycle};
pub use event::{CodeContext, Event, EventContext, EventInput, Outcome};
pub use fact::{Fact, FactInput, MemoryType};
pub use graph::{Entity, EntityInput, Relation, RelationInput};
pub use pattern::{Pattern, PatternType, ProvenanceNote};
pub use procedure::{Procedure, ProcedureCode, ProcedureInput, TriggerPattern};
pub use task::{PlanStep, Task, TaskInput, TaskPhase, TaskPriority, TaskStatus};

use serde::{Deserialize, Serialize};

// ============================================================================
// RECORD KIND
// ============================================================================

/// Discriminant for the seven record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Event,
    Fact,
    Procedure,
    Task,
    Entity,
    Relation,
    Pattern,
}

impl RecordKind {
    /// All kinds, in stable order.
    pub const ALL: [RecordKind; 7] = [
        RecordKind::Event,
        RecordKind::Fact,
        RecordKind::Procedure,
        RecordKind::Task,
        RecordKind::Entity,
        RecordKind::Relation,
        RecordKind::Pattern,
    ];

    /// Kinds that carry searchable free text and participate in hybrid
    /// retrieval by default.
    pub const SEARCHABLE: [RecordKind; 3] =
        [RecordKind::Event, RecordKind::Fact, RecordKind::Pattern];

    /// Substrate table backing this kind.
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Event => "events",
            RecordKind::Fact => "facts",
            RecordKind::Procedure => "procedures",
            RecordKind::Task => "tasks",
            RecordKind::Entity => "entities",
            RecordKind::Relation => "relations",
            RecordKind::Pattern => "patterns",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Event => "event",
            RecordKind::Fact => "fact",
            RecordKind::Procedure => "procedure",
            RecordKind::Task => "task",
            RecordKind::Entity => "entity",
            RecordKind::Relation => "relation",
            RecordKind::Pattern => "pattern",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "event" => Some(RecordKind::Event),
            "fact" => Some(RecordKind::Fact),
            "procedure" => Some(RecordKind::Procedure),
            "task" => Some(RecordKind::Task),
            "entity" => Some(RecordKind::Entity),
            "relation" => Some(RecordKind::Relation),
            "pattern" => Some(RecordKind::Pattern),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// TAGGED RECORD
// ============================================================================

/// A record of any kind, used on kind-generic paths (retrieval results,
/// arbitration, diagnostics). Typed CRUD goes through the per-kind surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Record {
    Event(Event),
    Fact(Fact),
    Procedure(Procedure),
    Task(Task),
    Entity(Entity),
    Relation(Relation),
    Pattern(Pattern),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Event(_) => RecordKind::Event,
            Record::Fact(_) => RecordKind::Fact,
            Record::Procedure(_) => RecordKind::Procedure,
            Record::Task(_) => RecordKind::Task,
            Record::Entity(_) => RecordKind::Entity,
            Record::Relation(_) => RecordKind::Relation,
            Record::Pattern(_) => RecordKind::Pattern,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            Record::Event(r) => &r.envelope,
            Record::Fact(r) => &r.envelope,
            Record::Procedure(r) => &r.envelope,
            Record::Task(r) => &r.envelope,
            Record::Entity(r) => &r.envelope,
            Record::Relation(r) => &r.envelope,
            Record::Pattern(r) => &r.envelope,
        }
    }

    /// Searchable free text, if the kind carries any.
    pub fn content(&self) -> Option<&str> {
        match self {
            Record::Event(r) => Some(&r.content),
            Record::Fact(r) => Some(&r.content),
            Record::Pattern(r) => Some(&r.content),
            Record::Task(r) => Some(&r.content),
            Record::Procedure(_) | Record::Entity(_) | Record::Relation(_) => None,
        }
    }

    pub fn id(&self) -> &str {
        &self.envelope().id
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::parse_name(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse_name("nope"), None);
    }

    #[test]
    fn test_tables_are_distinct() {
        let tables: std::collections::HashSet<_> =
            RecordKind::ALL.iter().map(|k| k.table()).collect();
        assert_eq!(tables.len(), RecordKind::ALL.len());
    }

    #[test]
    fn test_record_accessors() {
        let (event, _) = EventInput {
            project_id: "p".into(),
            session_id: "s".into(),
            content: "saved file".into(),
            event_type: "save".into(),
            outcome: Outcome::Success,
            context: EventContext::new(),
            code: None,
            embedding: None,
            evidence_type: EvidenceType::Observed,
            confidence: 0.5,
            importance: 0.5,
            tags: vec![],
            valid_from: None,
            valid_to: None,
        }
        .into_event()
        .unwrap();
        let id = event.envelope.id.clone();
        let record = Record::Event(event);
        assert_eq!(record.kind(), RecordKind::Event);
        assert_eq!(record.id(), id);
        assert_eq!(record.content(), Some("saved file"));
    }
}

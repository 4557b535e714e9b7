//! Row mapping between record structs and their tables
//!
//! Every record table leads with the same envelope columns in the same
//! order; kind-specific columns follow. Keep `ENVELOPE_COLS` and
//! `envelope_from_row` in lockstep.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use crate::record::{
    CodeContext, Entity, Envelope, Event, EventContext, EvidenceType, Fact, Lifecycle, MemoryType,
    Outcome, Pattern, PatternType, PlanStep, Procedure, ProcedureCode, ProvenanceNote, Relation,
    Task, TaskPhase, TaskPriority, TaskStatus, TriggerPattern,
};

/// Envelope column list shared by every record table. Indices 0..17 in every
/// per-kind SELECT.
pub(crate) const ENVELOPE_COLS: &str = "id, project_id, created_at, valid_from, valid_to, \
     lifecycle, confidence, evidence_type, evidence_quality, source_id, \
     activation_count, last_activation_at, importance, tags, labile_until, \
     window_dirty, version";

/// Number of envelope columns; kind-specific columns start here.
pub(crate) const ENVELOPE_WIDTH: usize = 17;

pub(crate) fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| bad_column(idx, format!("malformed JSON column: {e}")))
}

pub(crate) fn envelope_from_row(row: &Row<'_>) -> rusqlite::Result<Envelope> {
    let lifecycle_raw: String = row.get(5)?;
    let lifecycle = Lifecycle::parse_name(&lifecycle_raw)
        .ok_or_else(|| bad_column(5, format!("unknown lifecycle '{lifecycle_raw}'")))?;
    let evidence_raw: String = row.get(7)?;
    let evidence_type = EvidenceType::parse_name(&evidence_raw)
        .ok_or_else(|| bad_column(7, format!("unknown evidence type '{evidence_raw}'")))?;
    let tags: Vec<String> = parse_json(13, row.get::<_, String>(13)?)?;

    Ok(Envelope {
        id: row.get(0)?,
        project_id: row.get(1)?,
        created_at: row.get::<_, DateTime<Utc>>(2)?,
        valid_from: row.get::<_, Option<DateTime<Utc>>>(3)?,
        valid_to: row.get::<_, Option<DateTime<Utc>>>(4)?,
        lifecycle,
        confidence: row.get(6)?,
        evidence_type,
        evidence_quality: row.get(8)?,
        source_id: row.get(9)?,
        activation_count: row.get(10)?,
        last_activation_at: row.get::<_, Option<DateTime<Utc>>>(11)?,
        importance: row.get(12)?,
        tags,
        labile_until: row.get::<_, Option<DateTime<Utc>>>(14)?,
        window_dirty: row.get::<_, i64>(15)? != 0,
        version: row.get(16)?,
    })
}

// ============================================================================
// PER-KIND SELECT LISTS AND MAPPERS
// ============================================================================

pub(crate) const EVENT_COLS: &str = "session_id, event_type, content, outcome, context, code_context, has_embedding";

pub(crate) fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let envelope = envelope_from_row(row)?;
    let base = ENVELOPE_WIDTH;
    let outcome_raw: String = row.get(base + 3)?;
    let outcome = Outcome::parse_name(&outcome_raw)
        .ok_or_else(|| bad_column(base + 3, format!("unknown outcome '{outcome_raw}'")))?;
    let context: EventContext = parse_json(base + 4, row.get::<_, String>(base + 4)?)?;
    let code: Option<CodeContext> = match row.get::<_, Option<String>>(base + 5)? {
        Some(raw) => Some(parse_json(base + 5, raw)?),
        None => None,
    };

    Ok(Event {
        envelope,
        session_id: row.get(base)?,
        event_type: row.get(base + 1)?,
        content: row.get(base + 2)?,
        outcome,
        context,
        code,
        has_embedding: row.get::<_, i64>(base + 6)? != 0,
    })
}

pub(crate) const FACT_COLS: &str = "content, memory_type, usefulness, has_embedding";

pub(crate) fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<Fact> {
    let envelope = envelope_from_row(row)?;
    let base = ENVELOPE_WIDTH;
    let memory_raw: String = row.get(base + 1)?;
    let memory_type = MemoryType::parse_name(&memory_raw)
        .ok_or_else(|| bad_column(base + 1, format!("unknown memory type '{memory_raw}'")))?;

    Ok(Fact {
        envelope,
        content: row.get(base)?,
        memory_type,
        usefulness: row.get(base + 2)?,
        has_embedding: row.get::<_, i64>(base + 3)? != 0,
    })
}

pub(crate) const PROCEDURE_COLS: &str = "name, category, trigger_pattern, steps, success_rate, usage_count, avg_duration_ms, code";

pub(crate) fn procedure_from_row(row: &Row<'_>) -> rusqlite::Result<Procedure> {
    let envelope = envelope_from_row(row)?;
    let base = ENVELOPE_WIDTH;
    let trigger_pattern: TriggerPattern = parse_json(base + 2, row.get::<_, String>(base + 2)?)?;
    let steps: Vec<String> = parse_json(base + 3, row.get::<_, String>(base + 3)?)?;
    let code: Option<ProcedureCode> = match row.get::<_, Option<String>>(base + 7)? {
        Some(raw) => Some(parse_json(base + 7, raw)?),
        None => None,
    };

    Ok(Procedure {
        envelope,
        name: row.get(base)?,
        category: row.get(base + 1)?,
        trigger_pattern,
        steps,
        success_rate: row.get(base + 4)?,
        usage_count: row.get(base + 5)?,
        avg_duration_ms: row.get(base + 6)?,
        code,
    })
}

pub(crate) const TASK_COLS: &str = "content, status, phase, priority, plan, due_at, assignee, effort_estimate";

pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let envelope = envelope_from_row(row)?;
    let base = ENVELOPE_WIDTH;
    let status_raw: String = row.get(base + 1)?;
    let status = TaskStatus::parse_name(&status_raw)
        .ok_or_else(|| bad_column(base + 1, format!("unknown status '{status_raw}'")))?;
    let phase_raw: String = row.get(base + 2)?;
    let phase = TaskPhase::parse_name(&phase_raw)
        .ok_or_else(|| bad_column(base + 2, format!("unknown phase '{phase_raw}'")))?;
    let priority_raw: String = row.get(base + 3)?;
    let priority = TaskPriority::parse_name(&priority_raw)
        .ok_or_else(|| bad_column(base + 3, format!("unknown priority '{priority_raw}'")))?;
    let plan: Vec<PlanStep> = parse_json(base + 4, row.get::<_, String>(base + 4)?)?;

    Ok(Task {
        envelope,
        content: row.get(base)?,
        status,
        phase,
        priority,
        plan,
        due_at: row.get::<_, Option<DateTime<Utc>>>(base + 5)?,
        assignee: row.get(base + 6)?,
        effort_estimate: row.get(base + 7)?,
    })
}

pub(crate) const ENTITY_COLS: &str = "name, entity_type, attributes";

pub(crate) fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let envelope = envelope_from_row(row)?;
    let base = ENVELOPE_WIDTH;
    let attributes = parse_json(base + 2, row.get::<_, String>(base + 2)?)?;

    Ok(Entity {
        envelope,
        name: row.get(base)?,
        entity_type: row.get(base + 1)?,
        attributes,
    })
}

pub(crate) const RELATION_COLS: &str = "from_entity, to_entity, relation_type, strength";

pub(crate) fn relation_from_row(row: &Row<'_>) -> rusqlite::Result<Relation> {
    let envelope = envelope_from_row(row)?;
    let base = ENVELOPE_WIDTH;

    Ok(Relation {
        envelope,
        from_entity: row.get(base)?,
        to_entity: row.get(base + 1)?,
        relation_type: row.get(base + 2)?,
        strength: row.get(base + 3)?,
    })
}

pub(crate) const PATTERN_COLS: &str = "pattern_type, content, source_event_ids, support, \
     confidence_before_validation, confidence_after_validation, provenance, has_embedding";

pub(crate) fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<Pattern> {
    let envelope = envelope_from_row(row)?;
    let base = ENVELOPE_WIDTH;
    let type_raw: String = row.get(base)?;
    let pattern_type = PatternType::parse_name(&type_raw)
        .ok_or_else(|| bad_column(base, format!("unknown pattern type '{type_raw}'")))?;
    let source_event_ids: Vec<String> = parse_json(base + 2, row.get::<_, String>(base + 2)?)?;
    let provenance: Vec<ProvenanceNote> = parse_json(base + 6, row.get::<_, String>(base + 6)?)?;

    Ok(Pattern {
        envelope,
        pattern_type,
        content: row.get(base + 1)?,
        source_event_ids,
        support: row.get(base + 3)?,
        confidence_before_validation: row.get(base + 4)?,
        confidence_after_validation: row.get(base + 5)?,
        provenance,
        has_embedding: row.get::<_, i64>(base + 7)? != 0,
    })
}

/// JSON-encode a serializable column value, falling back to the type's empty
/// form on the (unreachable) encode failure.
pub(crate) fn json_column<T: serde::Serialize>(value: &T, empty: &'static str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| empty.to_string())
}

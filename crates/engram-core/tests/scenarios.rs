//! End-to-end scenarios: store/retrieve/activate, idempotent consolidation,
//! contradiction resolution.

mod common;

use std::sync::Arc;

use chrono::Utc;
use engram_core::{
    EventContext, EvidenceType, Lifecycle, Outcome, PatternType, Record, RecordKind,
    RetrievalOptions, RetrievalQuery, ScopeFilters, Strategy,
};

use common::{event, fact, testbed, StubEmbedder};

// ============================================================================
// SCENARIO A: STORE, RETRIEVE, ACTIVATE
// ============================================================================

#[tokio::test]
async fn scenario_a_store_retrieve_activate() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-a";

    let mut save = event(project, "user saved file X", "save", Outcome::Success);
    save.tags = vec!["fs".into(), "save".into()];
    let saved = bed.engine.record_event(save, None).await.unwrap();

    let mut delete = event(project, "user deleted file Y", "delete", Outcome::Success);
    delete.tags = vec!["fs".into(), "delete".into()];
    bed.engine.record_event(delete, None).await.unwrap();

    let results = bed
        .engine
        .retrieve(
            project,
            RetrievalQuery::text("save file"),
            1,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.id(), saved.envelope.id);
    assert!(results[0].diagnostics.labile);

    // Activation side effects landed: one hit, window open for ~60 minutes.
    let Record::Event(after) = bed
        .engine
        .get(RecordKind::Event, &saved.envelope.id, None)
        .await
        .unwrap()
    else {
        panic!("expected an event");
    };
    assert_eq!(after.envelope.activation_count, 1);
    assert_eq!(after.envelope.lifecycle, Lifecycle::Labile);
    let labile_until = after.envelope.labile_until.expect("window open");
    let remaining = (labile_until - Utc::now()).num_seconds();
    assert!((3500..=3660).contains(&remaining), "window was {remaining}s");
}

// ============================================================================
// SCENARIO B: IDEMPOTENT CONSOLIDATION
// ============================================================================

#[tokio::test]
async fn scenario_b_idempotent_consolidation() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-b";

    let mut source_ids = Vec::new();
    for i in 0..12 {
        let mut input = event(
            project,
            &format!("edited main.rs pass {i}"),
            "edit",
            Outcome::Success,
        );
        input.context = EventContext::from([("file".to_string(), "src/main.rs".to_string())]);
        let stored = bed.engine.record_event(input, None).await.unwrap();
        source_ids.push(stored.envelope.id);
    }

    let quality_before: Vec<f64> = {
        let mut out = Vec::new();
        for id in &source_ids {
            let Record::Event(e) = bed.engine.get(RecordKind::Event, id, None).await.unwrap()
            else {
                panic!("expected event");
            };
            out.push(e.envelope.evidence_quality);
        }
        out
    };

    let first = bed
        .engine
        .consolidate(project, Strategy::Fast, Some(10), None)
        .await
        .unwrap();
    assert_eq!(first.events_scored, 12);
    assert_eq!(first.patterns_emitted, 1);

    let patterns = bed
        .engine
        .scope_query(project, RecordKind::Pattern, ScopeFilters::default(), None)
        .await
        .unwrap();
    assert_eq!(patterns.len(), 1);
    let Record::Pattern(pattern) = &patterns[0] else {
        panic!("expected pattern");
    };
    assert_eq!(pattern.pattern_type, PatternType::Workflow);
    assert_eq!(pattern.support, 12);
    assert_eq!(pattern.source_event_ids, source_ids);

    // Every source flipped to consolidated, and consolidation never lowered
    // evidence quality.
    for (id, before) in source_ids.iter().zip(&quality_before) {
        let Record::Event(e) = bed.engine.get(RecordKind::Event, id, None).await.unwrap()
        else {
            panic!("expected event");
        };
        assert_eq!(e.envelope.lifecycle, Lifecycle::Consolidated);
        assert!(e.envelope.evidence_quality >= *before);
    }

    // Reruns find nothing new: same pattern set, same lifecycle states.
    let second = bed
        .engine
        .consolidate(project, Strategy::Fast, Some(10), None)
        .await
        .unwrap();
    assert_eq!(second.patterns_emitted, 0);
    let third = bed
        .engine
        .consolidate(project, Strategy::Fast, Some(10), None)
        .await
        .unwrap();
    assert_eq!(third.patterns_emitted, 0);

    let patterns_after = bed
        .engine
        .scope_query(project, RecordKind::Pattern, ScopeFilters::default(), None)
        .await
        .unwrap();
    assert_eq!(patterns_after.len(), 1);
    assert_eq!(patterns_after[0].id(), patterns[0].id());

    // A 12-strong all-success workflow also spawned one procedure, once.
    let procedures = bed
        .engine
        .scope_query(project, RecordKind::Procedure, ScopeFilters::default(), None)
        .await
        .unwrap();
    assert_eq!(procedures.len(), 1);
    let Record::Procedure(procedure) = &procedures[0] else {
        panic!("expected procedure");
    };
    assert_eq!(procedure.success_rate, 1.0);
    assert_eq!(
        procedure.envelope.source_id.as_deref(),
        Some(patterns[0].id())
    );
}

// ============================================================================
// SCENARIO C: CONTRADICTION RESOLUTION
// ============================================================================

#[tokio::test]
async fn scenario_c_contradiction_resolution() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-c";

    let strong = bed
        .engine
        .assert_fact(
            fact(
                project,
                "Python uses reference counting",
                0.9,
                EvidenceType::Observed,
            ),
            None,
        )
        .await
        .unwrap();
    let weak = bed
        .engine
        .assert_fact(
            fact(
                project,
                "Python does not use reference counting",
                0.4,
                EvidenceType::Hypothetical,
            ),
            None,
        )
        .await
        .unwrap();

    let report = bed
        .engine
        .consolidate(project, Strategy::Balanced, None, None)
        .await
        .unwrap();
    assert_eq!(report.conflicts_detected, 1);

    // Auto picked the observed, high-confidence fact; the hypothesis now
    // points back at the survivor.
    let Record::Fact(survivor) = bed
        .engine
        .get(RecordKind::Fact, &strong.envelope.id, None)
        .await
        .unwrap()
    else {
        panic!("expected fact");
    };
    assert_eq!(survivor.envelope.lifecycle, Lifecycle::Active);

    let Record::Fact(superseded) = bed
        .engine
        .get(RecordKind::Fact, &weak.envelope.id, None)
        .await
        .unwrap()
    else {
        panic!("expected fact");
    };
    assert_eq!(superseded.envelope.lifecycle, Lifecycle::Superseded);
    assert_eq!(
        superseded.envelope.source_id.as_deref(),
        Some(strong.envelope.id.as_str())
    );

    // Retrieval only surfaces the survivor.
    let results = bed
        .engine
        .retrieve(
            project,
            RetrievalQuery::text("reference counting"),
            5,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results
        .iter()
        .all(|hit| hit.record.id() != weak.envelope.id));
    assert!(results
        .iter()
        .any(|hit| hit.record.id() == strong.envelope.id));
}

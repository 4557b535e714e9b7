//! Quantified invariants and boundary behaviors.

mod common;

use std::sync::Arc;
use std::time::Duration;

use engram_core::{
    EvidenceType, Lifecycle, Outcome, Record, RecordKind, RecordPatch, ResolutionPolicy,
    RetrievalOptions, RetrievalQuery, Strategy,
};

use common::{event, fact, testbed, testbed_with, FailingEmbedder, StubEmbedder, StubValidator};

// ============================================================================
// P1: SCOPING
// ============================================================================

#[tokio::test]
async fn p1_retrieval_never_crosses_projects() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    for i in 0..3 {
        bed.engine
            .record_event(
                event("project-a", &format!("alpha build step {i}"), "build", Outcome::Success),
                None,
            )
            .await
            .unwrap();
        bed.engine
            .record_event(
                event("project-b", &format!("alpha build step {i}"), "build", Outcome::Success),
                None,
            )
            .await
            .unwrap();
    }

    let results = bed
        .engine
        .retrieve(
            "project-a",
            RetrievalQuery::text("alpha build"),
            10,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    for hit in &results {
        assert_eq!(hit.record.envelope().project_id, "project-a");
    }
}

// ============================================================================
// P2: LIFECYCLE MONOTONICITY
// ============================================================================

#[tokio::test]
async fn p2_no_reverse_transitions_except_labile_active() {
    let bed = testbed(None, None);
    let stored = bed
        .engine
        .record_event(event("proj", "one-off probe", "probe", Outcome::Success), None)
        .await
        .unwrap();
    let id = stored.envelope.id;

    bed.engine
        .transition(RecordKind::Event, &id, Lifecycle::Consolidated, "test", None)
        .await
        .unwrap();

    // Consolidated never returns to active.
    let err = bed
        .engine
        .transition(RecordKind::Event, &id, Lifecycle::Active, "test", None)
        .await
        .unwrap_err();
    assert_eq!(err.tag(), "invariant");

    // Terminal states admit no exit at all.
    bed.engine
        .transition(RecordKind::Event, &id, Lifecycle::Archived, "test", None)
        .await
        .unwrap();
    for target in [Lifecycle::Active, Lifecycle::Labile, Lifecycle::Superseded] {
        let err = bed
            .engine
            .transition(RecordKind::Event, &id, target, "test", None)
            .await
            .unwrap_err();
        assert_eq!(err.tag(), "invariant");
    }
}

// ============================================================================
// P3: RECONSOLIDATION BOUNDEDNESS
// ============================================================================

#[tokio::test]
async fn p3_windows_close_after_expiry_and_version_bumps_only_when_dirty() {
    let bed = testbed_with(Some(Arc::new(StubEmbedder)), None, |config| {
        config.reconsolidation_window = Duration::from_millis(300);
    });
    let project = "proj-window";
    let stored = bed
        .engine
        .record_event(event(project, "window probe entry", "probe", Outcome::Success), None)
        .await
        .unwrap();
    let id = stored.envelope.id;

    // Retrieval opens the window.
    bed.engine
        .retrieve(
            project,
            RetrievalQuery::text("window probe"),
            1,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    let Record::Event(open) = bed.engine.get(RecordKind::Event, &id, None).await.unwrap() else {
        panic!("expected event");
    };
    assert_eq!(open.envelope.lifecycle, Lifecycle::Labile);
    assert_eq!(open.envelope.version, 1);

    // Untouched window closes without a version bump.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let closed = bed.engine.close_expired_windows(Some(project), None).await.unwrap();
    assert_eq!(closed, 1);
    let Record::Event(after) = bed.engine.get(RecordKind::Event, &id, None).await.unwrap() else {
        panic!("expected event");
    };
    assert_eq!(after.envelope.lifecycle, Lifecycle::Active);
    assert_eq!(after.envelope.version, 1);
    assert!(after.envelope.labile_until.is_none());

    // A rewritten window bumps version exactly once at close.
    bed.engine
        .retrieve(
            project,
            RetrievalQuery::text("window probe"),
            1,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    bed.engine
        .update(
            RecordKind::Event,
            &id,
            RecordPatch {
                content: Some("window probe entry, annotated".into()),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    bed.engine.close_expired_windows(Some(project), None).await.unwrap();
    let Record::Event(bumped) = bed.engine.get(RecordKind::Event, &id, None).await.unwrap()
    else {
        panic!("expected event");
    };
    assert_eq!(bumped.envelope.version, 2);
}

// ============================================================================
// P5: CONTRADICTION RESOLUTION TERMINATES
// ============================================================================

#[tokio::test]
async fn p5_arbiter_pass_terminates_and_leaves_no_active_contradictions() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-p5";
    bed.engine
        .assert_fact(
            fact(
                project,
                "tls verification is enabled in production",
                0.9,
                EvidenceType::Observed,
            ),
            None,
        )
        .await
        .unwrap();
    bed.engine
        .assert_fact(
            fact(
                project,
                "tls verification is not enabled in production",
                0.3,
                EvidenceType::Hypothetical,
            ),
            None,
        )
        .await
        .unwrap();

    let first_pass = bed
        .engine
        .resolve_contradictions(project, ResolutionPolicy::Auto, None)
        .await
        .unwrap();
    assert_eq!(first_pass.len(), 1);

    // Finite: a second pass over the settled state detects nothing.
    let second_pass = bed
        .engine
        .resolve_contradictions(project, ResolutionPolicy::Auto, None)
        .await
        .unwrap();
    assert!(second_pass.is_empty());
}

// ============================================================================
// P6: RETRIEVAL UPPER BOUND
// ============================================================================

#[tokio::test]
async fn p6_retrieve_bounded_and_hides_terminal_states() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-p6";

    let mut ids = Vec::new();
    for i in 0..6 {
        let stored = bed
            .engine
            .record_event(
                event(project, &format!("gamma deploy attempt {i}"), "deploy", Outcome::Success),
                None,
            )
            .await
            .unwrap();
        ids.push(stored.envelope.id);
    }
    bed.engine
        .transition(RecordKind::Event, &ids[0], Lifecycle::Archived, "test", None)
        .await
        .unwrap();
    bed.engine
        .transition(RecordKind::Event, &ids[1], Lifecycle::Superseded, "test", None)
        .await
        .unwrap();

    let bounded = bed
        .engine
        .retrieve(
            project,
            RetrievalQuery::text("gamma deploy"),
            3,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert!(bounded.len() <= 3);

    let all = bed
        .engine
        .retrieve(
            project,
            RetrievalQuery::text("gamma deploy"),
            10,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    for hit in &all {
        assert_ne!(hit.record.id(), ids[0]);
        assert_ne!(hit.record.id(), ids[1]);
        assert!(hit.record.envelope().lifecycle.is_retrievable());
    }
}

// ============================================================================
// P7: ACTIVATION ACCOUNTING
// ============================================================================

#[tokio::test]
async fn p7_activation_count_tracks_returned_results() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-p7";
    let stored = bed
        .engine
        .record_event(event(project, "delta migration finished", "migrate", Outcome::Success), None)
        .await
        .unwrap();

    for _ in 0..2 {
        let results = bed
            .engine
            .retrieve(
                project,
                RetrievalQuery::text("delta migration"),
                1,
                RetrievalOptions::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    let Record::Event(after) = bed
        .engine
        .get(RecordKind::Event, &stored.envelope.id, None)
        .await
        .unwrap()
    else {
        panic!("expected event");
    };
    assert_eq!(after.envelope.activation_count, 2);
}

// ============================================================================
// P8: WORKING-SET CAP
// ============================================================================

#[tokio::test]
async fn p8_attended_set_never_exceeds_cap() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-p8";

    for i in 0..10 {
        let stored = bed
            .engine
            .assert_fact(
                fact(project, &format!("working set entry {i}"), 0.7, EvidenceType::Learned),
                None,
            )
            .await
            .unwrap();
        bed.engine
            .attend(project, RecordKind::Fact, &stored.envelope.id, None)
            .await
            .unwrap();
        let load = bed.engine.cognitive_load(project, None).await.unwrap();
        assert!(load.attended <= load.cap, "attended {} > cap {}", load.attended, load.cap);
    }
    let load = bed.engine.cognitive_load(project, None).await.unwrap();
    assert_eq!(load.cap, 7);
    assert_eq!(load.attended, 7);
}

// ============================================================================
// P10: DEGRADED RETRIEVAL
// ============================================================================

#[tokio::test]
async fn p10_embedder_outage_degrades_to_lexical() {
    let bed = testbed(Some(Arc::new(FailingEmbedder)), None);
    let project = "proj-p10";
    bed.engine
        .record_event(
            event(project, "staging deploy rolled back", "deploy", Outcome::Failure),
            None,
        )
        .await
        .unwrap();

    let results = bed
        .engine
        .retrieve(
            project,
            RetrievalQuery::text("staging deploy"),
            5,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert!(!results.is_empty());
    for hit in &results {
        assert!(hit.diagnostics.degraded);
    }
}

// ============================================================================
// BOUNDARY BEHAVIORS
// ============================================================================

#[tokio::test]
async fn boundary_k_zero_returns_empty() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    bed.engine
        .record_event(event("proj", "anything at all", "misc", Outcome::Success), None)
        .await
        .unwrap();
    let results = bed
        .engine
        .retrieve(
            "proj",
            RetrievalQuery::text("anything"),
            0,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn boundary_k_above_ceiling_is_clamped_and_annotated() {
    let bed = testbed_with(Some(Arc::new(StubEmbedder)), None, |config| {
        config.retrieval.k_ceiling = 2;
    });
    let project = "proj-clamp";
    for i in 0..5 {
        bed.engine
            .record_event(
                event(project, &format!("epsilon check {i}"), "check", Outcome::Success),
                None,
            )
            .await
            .unwrap();
    }
    let results = bed
        .engine
        .retrieve(
            project,
            RetrievalQuery::text("epsilon check"),
            50,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|hit| hit.diagnostics.clamped_k));
}

#[tokio::test]
async fn boundary_tag_only_query_is_structural() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-structural";
    let mut tagged = event(project, "tagged entry", "misc", Outcome::Success);
    tagged.tags = vec!["fs".into()];
    let stored = bed.engine.record_event(tagged, None).await.unwrap();
    bed.engine
        .record_event(event(project, "untagged entry", "misc", Outcome::Success), None)
        .await
        .unwrap();

    let results = bed
        .engine
        .retrieve(
            project,
            RetrievalQuery {
                tags: vec!["fs".into()],
                ..Default::default()
            },
            10,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].record.id(), stored.envelope.id);
    assert_eq!(
        results[0].diagnostics.stage,
        engram_core::retrieval::MatchStage::Structural
    );
}

#[tokio::test]
async fn boundary_empty_project_returns_empty_not_error() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let results = bed
        .engine
        .retrieve(
            "never-written",
            RetrievalQuery::text("anything"),
            5,
            RetrievalOptions::default(),
            None,
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn boundary_identical_pair_inhibits_both() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-tie";
    let first = bed
        .engine
        .assert_fact(
            fact(project, "the cache is enabled by default", 0.5, EvidenceType::Observed),
            None,
        )
        .await
        .unwrap();
    let second = bed
        .engine
        .assert_fact(
            fact(project, "the cache is not enabled by default", 0.5, EvidenceType::Observed),
            None,
        )
        .await
        .unwrap();

    let outcomes = bed
        .engine
        .resolve_contradictions(project, ResolutionPolicy::Auto, None)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].resolution, "inhibit_both");
    assert!(outcomes[0].survivor_id.is_none());

    for id in [&first.envelope.id, &second.envelope.id] {
        let record = bed.engine.get(RecordKind::Fact, id, None).await.unwrap();
        assert_eq!(record.envelope().lifecycle, Lifecycle::NeedsReview);
    }

    let health = bed.engine.health(project, None).await.unwrap();
    assert_eq!(health.contradiction_backlog, 2);
}

#[tokio::test]
async fn keep_latest_below_age_gap_falls_back_to_auto() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-fallback";

    // Both asserted just now, so the age gap is far below the 24h minimum
    // and keep_latest cannot apply; the applied resolution must say so.
    let strong = bed
        .engine
        .assert_fact(
            fact(project, "deploys are gated in staging", 0.9, EvidenceType::Observed),
            None,
        )
        .await
        .unwrap();
    let weak = bed
        .engine
        .assert_fact(
            fact(project, "deploys are not gated in staging", 0.5, EvidenceType::Observed),
            None,
        )
        .await
        .unwrap();

    let outcomes = bed
        .engine
        .resolve_contradictions(project, ResolutionPolicy::KeepLatest, None)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].resolution, "auto");
    assert_eq!(
        outcomes[0].survivor_id.as_deref(),
        Some(strong.envelope.id.as_str())
    );

    let record = bed
        .engine
        .get(RecordKind::Fact, &weak.envelope.id, None)
        .await
        .unwrap();
    assert_eq!(record.envelope().lifecycle, Lifecycle::Superseded);
}

// ============================================================================
// RERANK AND HEALTH SURFACE
// ============================================================================

#[tokio::test]
async fn rerank_replaces_order_and_annotates() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), Some(Arc::new(StubValidator)));
    let project = "proj-rerank";
    for i in 0..3 {
        bed.engine
            .record_event(
                event(project, &format!("zeta probe number {i}"), "probe", Outcome::Success),
                None,
            )
            .await
            .unwrap();
    }

    let options = RetrievalOptions {
        use_rerank: true,
        ..Default::default()
    };
    let results = bed
        .engine
        .retrieve(project, RetrievalQuery::text("zeta probe"), 3, options, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|hit| hit.diagnostics.reranked));
}

#[tokio::test]
async fn health_reports_counts_and_consolidation_age() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let project = "proj-health";
    for i in 0..4 {
        bed.engine
            .record_event(
                event(project, &format!("eta step {i}"), "step", Outcome::Success),
                None,
            )
            .await
            .unwrap();
    }

    let before = bed.engine.health(project, None).await.unwrap();
    assert_eq!(before.unconsolidated_events, 4);
    assert!(before.last_consolidation_at.is_none());
    assert!(before.pool_size >= 2);

    bed.engine
        .consolidate(project, Strategy::Fast, None, None)
        .await
        .unwrap();
    let after = bed.engine.health(project, None).await.unwrap();
    assert_eq!(after.unconsolidated_events, 0);
    assert!(after.last_consolidation_at.is_some());
    assert!(after.counts.contains_key("event"));
}

#[tokio::test]
async fn scheduler_starts_and_shuts_down() {
    let bed = testbed(Some(Arc::new(StubEmbedder)), None);
    let handle = bed.engine.start_scheduler();
    handle.shutdown().await;
}

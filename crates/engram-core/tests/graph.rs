//! Graph invariants: bounded traversal, cascade deletion, community labels.

mod common;

use std::collections::BTreeMap;

use engram_core::{EntityInput, EvidenceType, RelationInput};

use common::{fact, testbed};

fn entity(project: &str, name: &str) -> EntityInput {
    EntityInput {
        project_id: project.to_string(),
        name: name.to_string(),
        entity_type: "module".to_string(),
        attributes: BTreeMap::new(),
        importance: 0.5,
        tags: Vec::new(),
    }
}

fn relation(project: &str, from: &str, to: &str) -> RelationInput {
    RelationInput {
        project_id: project.to_string(),
        from_entity: from.to_string(),
        to_entity: to.to_string(),
        relation_type: "depends_on".to_string(),
        strength: 0.8,
        valid_from: None,
        valid_to: None,
    }
}

#[tokio::test]
async fn traversal_is_depth_bounded() {
    let bed = testbed(None, None);
    let project = "proj-graph";

    // a -> b -> c chain.
    let a = bed.engine.add_entity(entity(project, "a"), None).await.unwrap();
    let b = bed.engine.add_entity(entity(project, "b"), None).await.unwrap();
    let c = bed.engine.add_entity(entity(project, "c"), None).await.unwrap();
    bed.engine
        .add_relation(relation(project, &a.envelope.id, &b.envelope.id), None)
        .await
        .unwrap();
    bed.engine
        .add_relation(relation(project, &b.envelope.id, &c.envelope.id), None)
        .await
        .unwrap();

    let one_hop = bed
        .engine
        .find_related(&a.envelope.id, None, 1, None)
        .await
        .unwrap();
    assert_eq!(one_hop.len(), 1);
    assert_eq!(one_hop[0].entity.name, "b");
    assert_eq!(one_hop[0].depth, 1);

    let two_hops = bed
        .engine
        .find_related(&a.envelope.id, None, 2, None)
        .await
        .unwrap();
    assert_eq!(two_hops.len(), 2);
    let names: Vec<&str> = two_hops.iter().map(|r| r.entity.name.as_str()).collect();
    assert!(names.contains(&"b") && names.contains(&"c"));
    // The path to c walks two relation edges.
    let c_hit = two_hops.iter().find(|r| r.entity.name == "c").unwrap();
    assert_eq!(c_hit.path.len(), 2);
}

#[tokio::test]
async fn traversal_of_missing_entity_is_not_found() {
    let bed = testbed(None, None);
    let err = bed
        .engine
        .find_related("no-such-entity", None, 2, None)
        .await
        .unwrap_err();
    assert_eq!(err.tag(), "not_found");
}

#[tokio::test]
async fn entity_deletion_cascades_to_relations() {
    let bed = testbed(None, None);
    let project = "proj-cascade";

    let hub = bed.engine.add_entity(entity(project, "hub"), None).await.unwrap();
    let left = bed.engine.add_entity(entity(project, "left"), None).await.unwrap();
    let right = bed.engine.add_entity(entity(project, "right"), None).await.unwrap();
    bed.engine
        .add_relation(relation(project, &left.envelope.id, &hub.envelope.id), None)
        .await
        .unwrap();
    bed.engine
        .add_relation(relation(project, &hub.envelope.id, &right.envelope.id), None)
        .await
        .unwrap();

    let removed = bed.engine.delete_entity(&hub.envelope.id, None).await.unwrap();
    assert_eq!(removed, 2);

    // Neighbors survive with no dangling edges.
    let from_left = bed
        .engine
        .find_related(&left.envelope.id, None, 3, None)
        .await
        .unwrap();
    assert!(from_left.is_empty());
}

#[tokio::test]
async fn relation_requires_existing_endpoints() {
    let bed = testbed(None, None);
    let project = "proj-endpoints";
    let a = bed.engine.add_entity(entity(project, "a"), None).await.unwrap();

    let err = bed
        .engine
        .add_relation(relation(project, &a.envelope.id, "ghost"), None)
        .await
        .unwrap_err();
    assert_eq!(err.tag(), "not_found");
}

#[tokio::test]
async fn communities_label_connected_components() {
    let bed = testbed(None, None);
    let project = "proj-communities";

    // Two components: {a, b} and {c}.
    let a = bed.engine.add_entity(entity(project, "a"), None).await.unwrap();
    let b = bed.engine.add_entity(entity(project, "b"), None).await.unwrap();
    let c = bed.engine.add_entity(entity(project, "c"), None).await.unwrap();
    bed.engine
        .add_relation(relation(project, &a.envelope.id, &b.envelope.id), None)
        .await
        .unwrap();

    let communities = bed.engine.assign_communities(project, None).await.unwrap();
    assert_eq!(communities, 2);

    let community_of = |tags: &[String]| {
        tags.iter()
            .find(|t| t.starts_with("community:"))
            .cloned()
            .expect("community tag")
    };
    let a_after = bed.engine.get(engram_core::RecordKind::Entity, &a.envelope.id, None).await.unwrap();
    let b_after = bed.engine.get(engram_core::RecordKind::Entity, &b.envelope.id, None).await.unwrap();
    let c_after = bed.engine.get(engram_core::RecordKind::Entity, &c.envelope.id, None).await.unwrap();
    assert_eq!(
        community_of(&a_after.envelope().tags),
        community_of(&b_after.envelope().tags)
    );
    assert_ne!(
        community_of(&a_after.envelope().tags),
        community_of(&c_after.envelope().tags)
    );
}

#[tokio::test]
async fn expertise_averages_learned_quality() {
    let bed = testbed(None, None);
    let project = "proj-expertise";

    let mut learned = fact(project, "prefer exponential backoff", 0.8, EvidenceType::Learned);
    learned.tags = vec!["reliability".into()];
    bed.engine.assert_fact(learned, None).await.unwrap();

    // Observed facts under the same tag do not count toward expertise.
    let mut observed = fact(project, "retries happened", 0.9, EvidenceType::Observed);
    observed.tags = vec!["reliability".into()];
    bed.engine.assert_fact(observed, None).await.unwrap();

    let expertise = bed
        .engine
        .expertise(project, "reliability", None)
        .await
        .unwrap()
        .expect("some expertise");
    // Learned base quality is 0.8.
    assert!((expertise - 0.8).abs() < 1e-9);

    assert!(bed
        .engine
        .expertise(project, "untouched-domain", None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn mutations_land_in_the_audit_trail() {
    let bed = testbed(None, None);
    bed.engine
        .assert_fact(
            fact("proj-audit", "audited write", 0.5, EvidenceType::Observed),
            None,
        )
        .await
        .unwrap();

    let entries = bed.engine.audit_trail(10).await.unwrap();
    assert!(entries.iter().any(|e| e.operation == "insert_fact" && e.outcome == "ok"));
}

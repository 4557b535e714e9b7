//! Graph operations - bounded traversal and offline community labeling
//!
//! Entities and relations live in the record store; this component adds
//! breadth-first traversal bounded by depth and a global node budget, and the
//! offline connected-components pass whose output is an opaque community
//! label on each entity.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::Result;
use crate::record::Entity;
use crate::store::RecordStore;
use crate::substrate::Deadline;

/// Hard bound on nodes visited by one traversal.
pub const TRAVERSAL_NODE_BUDGET: usize = 500;

/// One traversal hit: the entity and the relation-id path that reached it.
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    pub entity: Entity,
    /// Relation ids walked from the start entity, in order
    pub path: Vec<String>,
    pub depth: usize,
}

/// Graph operations over the record store.
pub struct GraphOps {
    store: Arc<RecordStore>,
}

impl GraphOps {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Breadth-first neighborhood of an entity, cut off at `max_depth` and at
    /// the global node budget. Edges are walked in both directions.
    pub async fn find_related(
        &self,
        entity_id: &str,
        relation_type: Option<&str>,
        max_depth: usize,
        deadline: Deadline,
    ) -> Result<Vec<RelatedEntity>> {
        // Verify the start exists up front so a bad id is NotFound, not an
        // empty result.
        let start = self.store.get_entity(entity_id, deadline).await?;

        let mut visited: HashSet<String> = HashSet::from([start.envelope.id.clone()]);
        let mut queue: VecDeque<(String, Vec<String>, usize)> =
            VecDeque::from([(start.envelope.id.clone(), Vec::new(), 0)]);
        let mut found = Vec::new();
        let mut budget = TRAVERSAL_NODE_BUDGET;

        while let Some((current, path, depth)) = queue.pop_front() {
            if depth >= max_depth || budget == 0 {
                continue;
            }
            let relations = self
                .store
                .relations_of(&current, relation_type, deadline)
                .await?;
            for relation in relations {
                let neighbor = if relation.from_entity == current {
                    relation.to_entity.clone()
                } else {
                    relation.from_entity.clone()
                };
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                if budget == 0 {
                    break;
                }
                budget -= 1;

                let mut next_path = path.clone();
                next_path.push(relation.envelope.id.clone());
                match self.store.get_entity(&neighbor, deadline).await {
                    Ok(entity) => {
                        found.push(RelatedEntity {
                            entity,
                            path: next_path.clone(),
                            depth: depth + 1,
                        });
                        queue.push_back((neighbor, next_path, depth + 1));
                    }
                    // Dangling edge mid-delete; skip it.
                    Err(crate::error::EngineError::NotFound(_)) => continue,
                    Err(other) => return Err(other),
                }
            }
        }
        Ok(found)
    }

    /// Offline community pass: connected components over the project graph,
    /// written back as an opaque `community:<label>` tag on each entity.
    /// Returns the number of communities found.
    pub async fn assign_communities(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<usize> {
        let entities = self.store.project_entities(project_id, deadline).await?;
        let relations = self.store.project_relations(project_id, deadline).await?;
        if entities.is_empty() {
            return Ok(0);
        }

        // Union-find over entity ids.
        let ids: Vec<String> = entities.iter().map(|e| e.envelope.id.clone()).collect();
        let index: HashMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let mut parent: Vec<usize> = (0..ids.len()).collect();

        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            let mut root = i;
            while parent[root] != root {
                root = parent[root];
            }
            let mut cursor = i;
            while parent[cursor] != root {
                let next = parent[cursor];
                parent[cursor] = root;
                cursor = next;
            }
            root
        }

        for relation in &relations {
            let (Some(&a), Some(&b)) = (
                index.get(relation.from_entity.as_str()),
                index.get(relation.to_entity.as_str()),
            ) else {
                continue;
            };
            let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
            if ra != rb {
                parent[ra] = rb;
            }
        }

        // Stable labels: communities numbered by first appearance.
        let mut labels: HashMap<usize, usize> = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            let root = find(&mut parent, i);
            let next_label = labels.len();
            let label = *labels.entry(root).or_insert(next_label);
            self.store
                .set_entity_community(id, &label.to_string(), deadline)
                .await?;
        }
        Ok(labels.len())
    }
}

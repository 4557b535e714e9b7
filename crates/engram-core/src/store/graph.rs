//! Entity and Relation CRUD with cascade semantics

use rusqlite::params;

use crate::error::{EngineError, Result};
use crate::record::{Entity, EntityInput, Relation, RelationInput};
use crate::substrate::Deadline;

use super::rows::{
    entity_from_row, json_column, relation_from_row, ENTITY_COLS, ENVELOPE_COLS, RELATION_COLS,
};
use super::RecordStore;

impl RecordStore {
    pub async fn insert_entity(&self, input: EntityInput, deadline: Deadline) -> Result<Entity> {
        let entity = input.into_entity()?;
        let stored = entity.clone();
        let result = self
            .substrate()
            .transaction(deadline, "insert_entity", move |tx| {
                Self::ensure_project(tx, &stored.envelope.project_id)?;
                let env = &stored.envelope;
                tx.execute(
                    "INSERT INTO entities (
                        id, project_id, created_at, updated_at, valid_from, valid_to,
                        lifecycle, confidence, evidence_type, evidence_quality, source_id,
                        activation_count, last_activation_at, importance, tags,
                        labile_until, window_dirty, version,
                        name, entity_type, attributes
                    ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, ?11,
                              ?12, NULL, 0, 1, ?13, ?14, ?15)",
                    params![
                        env.id,
                        env.project_id,
                        env.created_at,
                        env.valid_from,
                        env.valid_to,
                        env.lifecycle.as_str(),
                        env.confidence,
                        env.evidence_type.as_str(),
                        env.evidence_quality,
                        env.source_id,
                        env.importance,
                        json_column(&env.tags, "[]"),
                        stored.name,
                        stored.entity_type,
                        json_column(&stored.attributes, "{}"),
                    ],
                )?;
                Ok(())
            })
            .await;

        match &result {
            Ok(_) => {
                self.audit()
                    .success("insert_entity", &[entity.envelope.id.clone()])
                    .await
            }
            Err(err) => {
                self.audit()
                    .failure("insert_entity", &[entity.envelope.id.clone()], err.tag())
                    .await
            }
        }
        result?;
        Ok(entity)
    }

    pub async fn get_entity(&self, id: &str, deadline: Deadline) -> Result<Entity> {
        let id_owned = id.to_string();
        self.substrate()
            .with_read(deadline, "get_entity", move |conn| {
                conn.query_row(
                    &format!("SELECT {ENVELOPE_COLS}, {ENTITY_COLS} FROM entities WHERE id = ?1"),
                    params![id_owned],
                    entity_from_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(id_owned.clone()),
                    other => other.into(),
                })
            })
            .await
    }

    /// Insert a relation. Both endpoints must exist in the same project; the
    /// references stay weak (deleting an entity deletes its edges).
    pub async fn insert_relation(
        &self,
        input: RelationInput,
        deadline: Deadline,
    ) -> Result<Relation> {
        let relation = input.into_relation()?;
        let stored = relation.clone();
        let result = self
            .substrate()
            .transaction(deadline, "insert_relation", move |tx| {
                Self::ensure_project(tx, &stored.envelope.project_id)?;
                for endpoint in [&stored.from_entity, &stored.to_entity] {
                    let exists: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM entities WHERE id = ?1 AND project_id = ?2",
                        params![endpoint, stored.envelope.project_id],
                        |row| row.get(0),
                    )?;
                    if exists == 0 {
                        return Err(EngineError::NotFound(format!(
                            "entity {endpoint} does not exist in project {}",
                            stored.envelope.project_id
                        )));
                    }
                }

                let env = &stored.envelope;
                tx.execute(
                    "INSERT INTO relations (
                        id, project_id, created_at, updated_at, valid_from, valid_to,
                        lifecycle, confidence, evidence_type, evidence_quality, source_id,
                        activation_count, last_activation_at, importance, tags,
                        labile_until, window_dirty, version,
                        from_entity, to_entity, relation_type, strength
                    ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, NULL, ?11,
                              ?12, NULL, 0, 1, ?13, ?14, ?15, ?16)",
                    params![
                        env.id,
                        env.project_id,
                        env.created_at,
                        env.valid_from,
                        env.valid_to,
                        env.lifecycle.as_str(),
                        env.confidence,
                        env.evidence_type.as_str(),
                        env.evidence_quality,
                        env.source_id,
                        env.importance,
                        json_column(&env.tags, "[]"),
                        stored.from_entity,
                        stored.to_entity,
                        stored.relation_type,
                        stored.strength,
                    ],
                )?;
                Ok(())
            })
            .await;

        match &result {
            Ok(_) => {
                self.audit()
                    .success("insert_relation", &[relation.envelope.id.clone()])
                    .await
            }
            Err(err) => {
                self.audit()
                    .failure("insert_relation", &[relation.envelope.id.clone()], err.tag())
                    .await
            }
        }
        result?;
        Ok(relation)
    }

    pub async fn get_relation(&self, id: &str, deadline: Deadline) -> Result<Relation> {
        let id_owned = id.to_string();
        self.substrate()
            .with_read(deadline, "get_relation", move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {ENVELOPE_COLS}, {RELATION_COLS} FROM relations WHERE id = ?1"
                    ),
                    params![id_owned],
                    relation_from_row,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound(id_owned.clone()),
                    other => other.into(),
                })
            })
            .await
    }

    /// Delete an entity and cascade to its incident relations in one
    /// transaction. Returns the number of relations removed.
    pub async fn delete_entity(&self, id: &str, deadline: Deadline) -> Result<u64> {
        let id_owned = id.to_string();
        let result = self
            .substrate()
            .transaction(deadline, "delete_entity", move |tx| {
                let exists: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM entities WHERE id = ?1",
                    params![id_owned],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    return Err(EngineError::NotFound(id_owned.clone()));
                }
                let relations = tx.execute(
                    "DELETE FROM relations WHERE from_entity = ?1 OR to_entity = ?1",
                    params![id_owned],
                )? as u64;
                tx.execute("DELETE FROM entities WHERE id = ?1", params![id_owned])?;
                Ok(relations)
            })
            .await;

        match &result {
            Ok(_) => {
                self.audit()
                    .success("delete_entity", &[id.to_string()])
                    .await
            }
            Err(err) => {
                self.audit()
                    .failure("delete_entity", &[id.to_string()], err.tag())
                    .await
            }
        }
        result
    }

    /// Outgoing and incoming edges of an entity.
    pub async fn relations_of(
        &self,
        entity_id: &str,
        relation_type: Option<&str>,
        deadline: Deadline,
    ) -> Result<Vec<Relation>> {
        let id_owned = entity_id.to_string();
        let type_filter = relation_type.map(|t| t.to_string());
        self.substrate()
            .with_read(deadline, "relations_of", move |conn| {
                let relations = match &type_filter {
                    Some(rt) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {ENVELOPE_COLS}, {RELATION_COLS} FROM relations
                             WHERE (from_entity = ?1 OR to_entity = ?1) AND relation_type = ?2
                             ORDER BY created_at, id"
                        ))?;
                        let rows = stmt
                            .query_map(params![id_owned, rt], relation_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {ENVELOPE_COLS}, {RELATION_COLS} FROM relations
                             WHERE from_entity = ?1 OR to_entity = ?1
                             ORDER BY created_at, id"
                        ))?;
                        let rows = stmt
                            .query_map(params![id_owned], relation_from_row)?
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        rows
                    }
                };
                Ok(relations)
            })
            .await
    }

    /// All entities of a project, for offline community labeling.
    pub async fn project_entities(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<Vec<Entity>> {
        let project = project_id.to_string();
        self.substrate()
            .with_read(deadline, "project_entities", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENVELOPE_COLS}, {ENTITY_COLS} FROM entities
                     WHERE project_id = ?1 ORDER BY created_at, id"
                ))?;
                let entities = stmt
                    .query_map(params![project], entity_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(entities)
            })
            .await
    }

    /// All relations of a project, for offline community labeling.
    pub async fn project_relations(
        &self,
        project_id: &str,
        deadline: Deadline,
    ) -> Result<Vec<Relation>> {
        let project = project_id.to_string();
        self.substrate()
            .with_read(deadline, "project_relations", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENVELOPE_COLS}, {RELATION_COLS} FROM relations
                     WHERE project_id = ?1 ORDER BY created_at, id"
                ))?;
                let relations = stmt
                    .query_map(params![project], relation_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(relations)
            })
            .await
    }

    /// Replace the community tag on an entity (offline pass output).
    pub async fn set_entity_community(
        &self,
        entity_id: &str,
        community: &str,
        deadline: Deadline,
    ) -> Result<()> {
        let entity = self.get_entity(entity_id, deadline).await?;
        let mut tags: Vec<String> = entity
            .envelope
            .tags
            .into_iter()
            .filter(|t| !t.starts_with("community:"))
            .collect();
        tags.push(format!("community:{community}"));

        let id_owned = entity_id.to_string();
        let tags_json = json_column(&tags, "[]");
        self.substrate()
            .with_write(deadline, "set_community", move |conn| {
                conn.execute(
                    "UPDATE entities SET tags = ?1, updated_at = ?2 WHERE id = ?3",
                    params![tags_json, chrono::Utc::now(), id_owned],
                )?;
                Ok(())
            })
            .await
    }
}

//! Relationship traversal
//!
//! Explicit, eager loading of the nodes on the other side of a relationship.

use tracing::debug;
use uuid::Uuid;

use crate::compiler::{label_fragment, quote, Params, Statement};
use crate::entity::{normalize_labels, EntityKey, EntityStore};
use crate::error::{MapperError, Result};
use crate::registry::QueryVariableRegistry;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Out,
    In,
    Both,
}

#[derive(Debug, Clone)]
pub struct RelationshipQuery {
    rel_type: String,
    direction: Direction,
    end_labels: Vec<String>,
    properties: Vec<(String, Value)>,
    skip: Option<u64>,
    limit: Option<u64>,
}

impl RelationshipQuery {
    pub fn new(rel_type: impl Into<String>) -> Self {
        Self {
            rel_type: rel_type.into(),
            direction: Direction::Out,
            end_labels: Vec::new(),
            properties: Vec::new(),
            skip: None,
            limit: None,
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn end_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.end_labels = normalize_labels(labels);
        self
    }

    /// Only follow relationships carrying this property value.
    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn rel_type(&self) -> &str {
        &self.rel_type
    }

    /// `MATCH (n0)-[:Type]->(node_x:Label) WHERE id(n0) = $p RETURN node_x`.
    /// An unsaved start node is matched on its labels instead of its id.
    pub fn compile(
        &self,
        start: EntityKey,
        store: &mut EntityStore,
        registry: &mut QueryVariableRegistry,
    ) -> Result<Statement> {
        let entity = store
            .get_mut(start)
            .ok_or_else(|| MapperError::Argument(format!("traversal start {} is unknown", start)))?;
        if entity.is_relationship() {
            return Err(MapperError::Argument(format!(
                "traversal start {} is a relationship",
                start
            )));
        }

        let variable = registry.define(entity);
        let entity = &*entity;
        let mut params = Params::new();
        let mut wheres = Vec::new();

        let start_pattern = match entity.id() {
            Some(id) => {
                let name = registry.next_param(entity, "id");
                wheres.push(format!("id({}) = ${}", variable, name));
                params.insert(name, Value::Integer(id));
                format!("({})", variable)
            }
            None => format!("({}{})", variable, label_fragment(entity.labels())),
        };

        let mut rel_props = Vec::new();
        for (field, value) in &self.properties {
            let name = registry.param("rel", &self.rel_type, field);
            rel_props.push(format!("{}: ${}", quote(field), name));
            params.insert(name, value.clone());
        }
        let rel_props = if rel_props.is_empty() {
            String::new()
        } else {
            format!(" {{{}}}", rel_props.join(", "))
        };
        let rel = format!("[:{}{}]", quote(&self.rel_type), rel_props);

        let end_variable = end_variable();
        let end_pattern = format!("({}{})", end_variable, label_fragment(&self.end_labels));

        let path = match self.direction {
            Direction::Out => format!("{}-{}->{}", start_pattern, rel, end_pattern),
            Direction::In => format!("{}<-{}-{}", start_pattern, rel, end_pattern),
            Direction::Both => format!("{}-{}-{}", start_pattern, rel, end_pattern),
        };

        let mut text = format!("MATCH {}", path);
        if !wheres.is_empty() {
            text.push_str(&format!(" WHERE {}", wheres.join(" AND ")));
        }
        text.push_str(&format!(" RETURN {}", end_variable));
        if let Some(skip) = self.skip {
            text.push_str(" SKIP $skip");
            params.insert("skip".to_string(), Value::Integer(skip as i64));
        }
        if let Some(limit) = self.limit {
            text.push_str(" LIMIT $limit");
            params.insert("limit".to_string(), Value::Integer(limit as i64));
        }

        debug!("🧭 Compiled traversal: {}", text);
        Ok(Statement {
            text,
            params,
            returns: vec![end_variable],
        })
    }
}

fn end_variable() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("node_{}", &id[id.len() - 12..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NewEntity, SchemaKind, SchemaRegistry};

    fn store_with(new: NewEntity) -> (EntityStore, EntityKey) {
        let entity = SchemaRegistry::default()
            .resolve("Person", SchemaKind::Node)
            .instantiate(new)
            .unwrap();
        let mut store = EntityStore::new();
        let key = store.insert(entity);
        (store, key)
    }

    #[test]
    fn test_outgoing_traversal_from_saved_node() {
        let (mut store, key) = store_with(NewEntity::new().id(3));
        let mut registry = QueryVariableRegistry::new();

        let statement = RelationshipQuery::new("Follows")
            .end_labels(["Person"])
            .skip(5)
            .limit(10)
            .compile(key, &mut store, &mut registry)
            .unwrap();

        let end = &statement.returns[0];
        assert!(end.starts_with("node_"));
        assert_eq!(
            statement.text,
            format!(
                "MATCH (n0)-[:Follows]->({}:Person) WHERE id(n0) = $n0_id_0 RETURN {} SKIP $skip LIMIT $limit",
                end, end
            )
        );
        assert_eq!(statement.params["limit"], Value::Integer(10));
        assert_eq!(statement.params.len(), 3);
    }

    #[test]
    fn test_unsaved_start_matches_on_labels() {
        let (mut store, key) = store_with(NewEntity::new());
        let mut registry = QueryVariableRegistry::new();

        let statement = RelationshipQuery::new("Follows")
            .direction(Direction::In)
            .property("since", 2020)
            .compile(key, &mut store, &mut registry)
            .unwrap();

        let end = &statement.returns[0];
        assert_eq!(
            statement.text,
            format!(
                "MATCH (n0:Person)<-[:Follows {{since: $rel_since_0}}]-({}) RETURN {}",
                end, end
            )
        );
    }

    #[test]
    fn test_missing_start_is_an_argument_error() {
        let (mut store, key) = store_with(NewEntity::new());
        let mut registry = QueryVariableRegistry::new();
        let entity = store.entity(key).unwrap().clone();
        let mut other = EntityStore::new();
        other.insert(entity.clone());
        let missing = other.insert(entity);

        let err = RelationshipQuery::new("Follows")
            .compile(missing, &mut store, &mut registry)
            .unwrap_err();

        assert!(matches!(err, MapperError::Argument(_)));
    }
}

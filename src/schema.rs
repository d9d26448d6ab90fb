//! Entity Schemas
//!
//! Explicit per-type registration: each entity type is described once by an
//! [`EntitySchema`] (kind, labels, property descriptors) and instantiated
//! through the [`SchemaRegistry`].

use std::collections::HashMap;

use crate::entity::{normalize_labels, Endpoint, Entity};
use crate::error::{MapperError, PropertyError, Result};
use crate::property::{Property, PropertyKind, PropertyManager};
use crate::value::Value;

pub const GENERIC_NODE: &str = "Node";
pub const GENERIC_RELATIONSHIP: &str = "Relationship";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Node,
    Relationship,
}

/// Labels derived from a type name: `Admin_User` becomes `Admin:User`.
pub fn derive_labels(type_name: &str) -> Vec<String> {
    normalize_labels(type_name.split('_'))
}

// ============================================================================
// Entity Schema
// ============================================================================

#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    kind: SchemaKind,
    labels: Vec<String>,
    allow_undefined: bool,
    properties: Vec<Property>,
}

impl EntitySchema {
    pub fn node(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            labels: derive_labels(&name),
            name,
            kind: SchemaKind::Node,
            allow_undefined: false,
            properties: Vec::new(),
        }
    }

    pub fn relationship(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            labels: vec![name.clone()],
            name,
            kind: SchemaKind::Relationship,
            allow_undefined: false,
            properties: Vec::new(),
        }
    }

    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = normalize_labels(labels);
        self
    }

    pub fn allow_undefined(mut self, allow: bool) -> Self {
        self.allow_undefined = allow;
        self
    }

    pub fn property(mut self, property: Property) -> Self {
        self.properties.retain(|p| p.name() != property.name());
        self.properties.push(property);
        self
    }

    pub fn field(self, name: &str, kind: PropertyKind) -> Self {
        self.property(Property::new(name, kind))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SchemaKind {
        self.kind
    }

    pub fn default_labels(&self) -> &[String] {
        &self.labels
    }

    pub fn allows_undefined(&self) -> bool {
        self.allow_undefined
    }

    pub fn declared(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    /// Build an in-memory entity. Initial properties become the change
    /// tracking baseline.
    pub fn instantiate(&self, new: NewEntity) -> Result<Entity> {
        let mut properties =
            PropertyManager::with_properties(self.properties.iter().cloned(), self.allow_undefined);

        if self.allow_undefined {
            for (name, value) in &new.properties {
                if !properties.contains(name) && PropertyKind::infer(value).is_none() {
                    return Err(PropertyError::UninferableType {
                        field: name.clone(),
                        value_type: value.type_name(),
                    }
                    .into());
                }
            }
        }
        properties.hydrate(new.properties, true)?;

        let labels = new.labels.unwrap_or_else(|| self.labels.clone());

        let entity = match self.kind {
            SchemaKind::Node => {
                if new.start.is_some() || new.end.is_some() {
                    return Err(MapperError::Argument(format!(
                        "`{}` is a node type and cannot have endpoints",
                        self.name
                    )));
                }
                Entity::node(self.name.clone(), labels, properties)
            }
            SchemaKind::Relationship => {
                Entity::relationship(self.name.clone(), labels, new.start, new.end, properties)
            }
        };

        Ok(match new.id {
            Some(id) => entity.with_id(id),
            None => entity,
        })
    }
}

/// Arguments for creating an entity.
#[derive(Debug, Clone, Default)]
pub struct NewEntity {
    pub id: Option<i64>,
    pub labels: Option<Vec<String>>,
    pub properties: Vec<(String, Value)>,
    pub start: Option<Endpoint>,
    pub end: Option<Endpoint>,
}

impl NewEntity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    pub fn start(mut self, endpoint: impl Into<Endpoint>) -> Self {
        self.start = Some(endpoint.into());
        self
    }

    pub fn end(mut self, endpoint: impl Into<Endpoint>) -> Self {
        self.end = Some(endpoint.into());
        self
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Static table of entity types, built once at startup.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, EntitySchema>,
    generic_node: EntitySchema,
    generic_relationship: EntitySchema,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SchemaRegistry {
    /// `allow_undefined` applies to the generic `Node`/`Relationship` types.
    pub fn new(allow_undefined: bool) -> Self {
        Self {
            schemas: HashMap::new(),
            generic_node: EntitySchema::node(GENERIC_NODE).allow_undefined(allow_undefined),
            generic_relationship: EntitySchema::relationship(GENERIC_RELATIONSHIP)
                .allow_undefined(allow_undefined),
        }
    }

    pub fn register(&mut self, schema: EntitySchema) -> &mut Self {
        self.schemas.insert(schema.name.clone(), schema);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EntitySchema> {
        match name {
            GENERIC_NODE => Some(&self.generic_node),
            GENERIC_RELATIONSHIP => Some(&self.generic_relationship),
            _ => self.schemas.get(name),
        }
    }

    /// Registered schema for `name`, or an untyped schema of `kind` named
    /// and labelled after `name`.
    pub fn resolve(&self, name: &str, kind: SchemaKind) -> EntitySchema {
        if let Some(schema) = self.get(name) {
            return schema.clone();
        }

        let mut schema = match kind {
            SchemaKind::Node => self.generic_node.clone().labels(derive_labels(name)),
            SchemaKind::Relationship => self.generic_relationship.clone().labels([name]),
        };
        schema.name = name.to_string();
        schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Representation;

    #[test]
    fn test_labels_derive_from_type_name() {
        assert_eq!(derive_labels("Admin_User"), vec!["Admin", "User"]);
        assert_eq!(EntitySchema::node("Person").default_labels(), &["Person"]);
    }

    #[test]
    fn test_instantiate_structured_node_ignores_unknown_fields() {
        let schema = EntitySchema::node("Person").field("name", PropertyKind::String);
        let entity = schema
            .instantiate(NewEntity::new().property("name", "mark").property("age", 3))
            .unwrap();

        assert_eq!(entity.get("name"), Some(Value::from("mark")));
        assert_eq!(entity.get("age"), None);
        assert!(entity.changed().is_empty());
    }

    #[test]
    fn test_instantiate_rejects_uninferable_initial_value() {
        let registry = SchemaRegistry::default();
        let schema = registry.resolve("Thing", SchemaKind::Node);
        let err = schema
            .instantiate(NewEntity::new().property("tags", Value::List(vec![])))
            .unwrap_err();

        assert!(matches!(err, MapperError::Property(_)));
    }

    #[test]
    fn test_node_schema_rejects_endpoints() {
        let err = EntitySchema::node("Person")
            .instantiate(NewEntity::new().start(1))
            .unwrap_err();

        assert!(matches!(err, MapperError::Argument(_)));
    }

    #[test]
    fn test_unregistered_name_falls_back_to_generic() {
        let registry = SchemaRegistry::default();
        let schema = registry.resolve("Follows", SchemaKind::Relationship);

        assert_eq!(schema.name(), "Follows");
        assert_eq!(schema.kind(), SchemaKind::Relationship);
        assert_eq!(schema.default_labels(), &["Follows"]);
        assert!(schema.allows_undefined());
    }

    #[test]
    fn test_declared_defaults_flow_into_data() {
        let schema = EntitySchema::node("Account")
            .property(Property::new("status", PropertyKind::String).with_default("open"));
        let entity = schema.instantiate(NewEntity::new()).unwrap();

        assert_eq!(
            entity.data(Representation::Graph).get("status"),
            Some(&Value::from("open"))
        );
    }
}

//! Entities
//!
//! Nodes and relationships with identity, labels, a property bag and
//! change/deletion tracking, plus the arena that owns them.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{MapperError, PropertyError, Result};
use crate::property::{Producer, PropertyChange, PropertyManager, Representation};
use crate::value::Value;

// ============================================================================
// Keys and Endpoints
// ============================================================================

/// Handle to an entity owned by an [`EntityStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey(usize);

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One end of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// A node held by the store; created or updated alongside the relationship.
    Entity(EntityKey),
    /// A persisted node known only by id.
    Id(i64),
}

impl From<EntityKey> for Endpoint {
    fn from(key: EntityKey) -> Self {
        Endpoint::Entity(key)
    }
}

impl From<i64> for Endpoint {
    fn from(id: i64) -> Self {
        Endpoint::Id(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    Node,
    Relationship {
        start: Option<Endpoint>,
        end: Option<Endpoint>,
    },
}

/// Sort and de-duplicate labels.
pub fn normalize_labels<I, S>(labels: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut labels: Vec<String> = labels
        .into_iter()
        .map(Into::into)
        .filter(|l| !l.is_empty())
        .collect();
    labels.sort();
    labels.dedup();
    labels
}

// ============================================================================
// Entity
// ============================================================================

#[derive(Debug, Clone)]
pub struct Entity {
    id: Option<i64>,
    type_name: String,
    labels: Vec<String>,
    kind: EntityKind,
    properties: PropertyManager,
    deleted: Vec<String>,
    query_variable: Option<String>,
}

impl Entity {
    pub fn node<I, S>(type_name: impl Into<String>, labels: I, properties: PropertyManager) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: None,
            type_name: type_name.into(),
            labels: normalize_labels(labels),
            kind: EntityKind::Node,
            properties,
            deleted: Vec::new(),
            query_variable: None,
        }
    }

    /// A relationship carries exactly one type; when several labels are
    /// supplied the first one in sorted order is kept.
    pub fn relationship<I, S>(
        type_name: impl Into<String>,
        labels: I,
        start: Option<Endpoint>,
        end: Option<Endpoint>,
        properties: PropertyManager,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let type_name = type_name.into();
        let labels = normalize_labels(labels)
            .into_iter()
            .next()
            .unwrap_or_else(|| type_name.clone());

        Self {
            id: None,
            type_name,
            labels: vec![labels],
            kind: EntityKind::Relationship { start, end },
            properties,
            deleted: Vec::new(),
            query_variable: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// Assign the persisted id. An id that is already set is never replaced.
    pub fn set_id(&mut self, id: i64) {
        if self.id.is_none() {
            self.id = Some(id);
        }
    }

    pub(crate) fn clear_id(&mut self) {
        self.id = None;
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn display_labels(&self) -> String {
        self.labels.join(":")
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn is_node(&self) -> bool {
        matches!(self.kind, EntityKind::Node)
    }

    pub fn is_relationship(&self) -> bool {
        matches!(self.kind, EntityKind::Relationship { .. })
    }

    pub fn start(&self) -> Option<Endpoint> {
        match self.kind {
            EntityKind::Relationship { start, .. } => start,
            EntityKind::Node => None,
        }
    }

    pub fn end(&self) -> Option<Endpoint> {
        match self.kind {
            EntityKind::Relationship { end, .. } => end,
            EntityKind::Node => None,
        }
    }

    pub fn set_start(&mut self, endpoint: impl Into<Endpoint>) -> Result<()> {
        match &mut self.kind {
            EntityKind::Relationship { start, .. } => {
                *start = Some(endpoint.into());
                Ok(())
            }
            EntityKind::Node => Err(MapperError::Argument(format!(
                "`{}` is a node and has no start endpoint",
                self.type_name
            ))),
        }
    }

    pub fn set_end(&mut self, endpoint: impl Into<Endpoint>) -> Result<()> {
        match &mut self.kind {
            EntityKind::Relationship { end, .. } => {
                *end = Some(endpoint.into());
                Ok(())
            }
            EntityKind::Node => Err(MapperError::Argument(format!(
                "`{}` is a node and has no end endpoint",
                self.type_name
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Property access
    // ------------------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<Value> {
        self.properties.get(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), PropertyError> {
        self.properties.set(name, value)?;
        self.deleted.retain(|d| d != name);
        Ok(())
    }

    pub fn set_producer(&mut self, name: &str, producer: Producer) -> Result<(), PropertyError> {
        self.properties.set_producer(name, producer)?;
        self.deleted.retain(|d| d != name);
        Ok(())
    }

    /// Remove a property and remember that it was explicitly removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let removed = self.properties.remove(name);
        if removed && !self.deleted.iter().any(|d| d == name) {
            self.deleted.push(name.to_string());
        }
        removed
    }

    pub fn deleted(&self) -> &[String] {
        &self.deleted
    }

    pub fn properties(&self) -> &PropertyManager {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut PropertyManager {
        &mut self.properties
    }

    pub fn data(&self, repr: Representation) -> BTreeMap<String, Value> {
        self.properties.data(repr)
    }

    pub fn changed(&self) -> BTreeMap<String, PropertyChange> {
        self.properties.changed()
    }

    pub fn commit(&mut self) {
        self.properties.commit();
        self.deleted.clear();
    }

    /// With `reset` the values replace current data and the baseline (load
    /// path); otherwise they are applied as ordinary, dirty assignments.
    pub fn hydrate<I, K>(&mut self, values: I, reset: bool) -> Result<(), PropertyError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.properties.hydrate(values, reset)?;
        if reset {
            self.deleted.clear();
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Batch-scoped query variable
    // ------------------------------------------------------------------------

    pub fn query_variable(&self) -> Option<&str> {
        self.query_variable.as_deref()
    }

    pub(crate) fn set_query_variable(&mut self, variable: String) {
        self.query_variable = Some(variable);
    }

    pub(crate) fn release_query_variable(&mut self) {
        self.query_variable = None;
    }
}

/// Structural equality: identifier, labels, endpoints and current data.
impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.labels == other.labels
            && self.kind == other.kind
            && self.data(Representation::Native) == other.data(Representation::Native)
    }
}

// ============================================================================
// Entity Store
// ============================================================================

/// Arena owning every entity of a mapper. Keys stay valid for the lifetime
/// of the store; entities persist across flushes.
#[derive(Debug, Default)]
pub struct EntityStore {
    entities: Vec<Entity>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity) -> EntityKey {
        self.entities.push(entity);
        EntityKey(self.entities.len() - 1)
    }

    pub fn get(&self, key: EntityKey) -> Option<&Entity> {
        self.entities.get(key.0)
    }

    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut Entity> {
        self.entities.get_mut(key.0)
    }

    pub fn entity(&self, key: EntityKey) -> Result<&Entity> {
        self.get(key).ok_or(MapperError::UnknownEntity(key))
    }

    pub fn entity_mut(&mut self, key: EntityKey) -> Result<&mut Entity> {
        self.get_mut(key).ok_or(MapperError::UnknownEntity(key))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityKey, &Entity)> {
        self.entities
            .iter()
            .enumerate()
            .map(|(i, e)| (EntityKey(i), e))
    }

    /// Find a persisted node (or relationship) already held by the store.
    pub fn find_by_id(&self, id: i64, relationship: bool) -> Option<EntityKey> {
        self.iter()
            .find(|(_, e)| e.id == Some(id) && e.is_relationship() == relationship)
            .map(|(k, _)| k)
    }

    pub fn release_query_variables(&mut self) {
        for entity in &mut self.entities {
            entity.release_query_variable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_node(props: &[(&str, &str)]) -> Entity {
        let mut manager = PropertyManager::new(true);
        manager
            .hydrate(props.iter().map(|(k, v)| (*k, Value::from(*v))), true)
            .unwrap();
        Entity::node("Node", ["Node"], manager)
    }

    #[test]
    fn test_labels_are_sorted_and_joined() {
        let node = Entity::node("Person", ["User", "Admin", "User"], PropertyManager::new(true));

        assert_eq!(node.labels(), &["Admin".to_string(), "User".to_string()]);
        assert_eq!(node.display_labels(), "Admin:User");
    }

    #[test]
    fn test_relationship_collapses_to_single_type() {
        let rel = Entity::relationship(
            "Follows",
            ["Zeta", "Follows"],
            None,
            None,
            PropertyManager::new(true),
        );

        assert_eq!(rel.labels(), &["Follows".to_string()]);
    }

    #[test]
    fn test_structural_equality() {
        let a = open_node(&[("name", "mark")]);
        let b = open_node(&[("name", "mark")]);
        let c = open_node(&[("name", "someone")]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a.clone().with_id(1), b);
    }

    #[test]
    fn test_relationships_with_different_endpoints_differ() {
        let rel = |end: i64| {
            Entity::relationship(
                "Knows",
                ["Knows"],
                Some(Endpoint::Id(1)),
                Some(Endpoint::Id(end)),
                PropertyManager::new(true),
            )
        };

        assert_eq!(rel(2), rel(2));
        assert_ne!(rel(2), rel(3));
    }

    #[test]
    fn test_remove_records_deleted_field() {
        let mut node = open_node(&[("name", "mark"), ("nick", "m")]);

        assert!(node.remove("nick"));
        assert!(!node.remove("missing"));
        assert_eq!(node.deleted(), &["nick".to_string()]);
        assert_eq!(node.get("nick"), None);

        node.set("nick", "again").unwrap();
        assert!(node.deleted().is_empty());
    }

    #[test]
    fn test_hydrate_without_reset_marks_dirty() {
        let mut node = open_node(&[("name", "mark")]);
        node.hydrate([("name", Value::from("kram"))], false).unwrap();

        assert_eq!(node.changed().len(), 1);

        node.hydrate([("name", Value::from("kram"))], true).unwrap();
        assert!(node.changed().is_empty());
    }

    #[test]
    fn test_persisted_id_is_not_overwritten() {
        let mut node = open_node(&[]).with_id(5);
        node.set_id(9);

        assert_eq!(node.id(), Some(5));
    }

    #[test]
    fn test_store_lookup_and_unknown_key() {
        let mut store = EntityStore::new();
        let key = store.insert(open_node(&[]).with_id(12));

        assert_eq!(store.find_by_id(12, false), Some(key));
        assert_eq!(store.find_by_id(12, true), None);
        assert!(matches!(
            store.entity(EntityKey(99)),
            Err(MapperError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_node_has_no_endpoints() {
        let mut node = open_node(&[]);

        assert!(node.set_start(3).is_err());
        assert_eq!(node.start(), None);
    }
}

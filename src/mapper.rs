//! Mapper
//!
//! Public facade tying together schemas, the entity store, lifecycle hooks,
//! the unit of work and a [`Connection`].

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::compiler::{QueryCompiler, Statement};
use crate::config::MapperConfig;
use crate::connection::{Connection, GraphValue, QueryResult, RawNode, RawRelationship};
use crate::entity::{Endpoint, Entity, EntityKey, EntityStore};
use crate::error::{ConnectionError, MapperError, Result};
use crate::lifecycle::{HookHandle, LifecycleHooks, Phase};
use crate::property::PropertyChange;
use crate::registry::QueryVariableRegistry;
use crate::schema::{EntitySchema, NewEntity, SchemaKind, SchemaRegistry, GENERIC_NODE, GENERIC_RELATIONSHIP};
use crate::traversal::RelationshipQuery;
use crate::unit_of_work::{self, UnitOfWork};
use crate::value::Value;

pub use crate::unit_of_work::Response;

pub struct Mapper<C: Connection> {
    connection: C,
    config: MapperConfig,
    schemas: SchemaRegistry,
    store: EntityStore,
    hooks: LifecycleHooks,
    work: UnitOfWork,
}

impl<C: Connection> Mapper<C> {
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, MapperConfig::default())
    }

    pub fn with_config(connection: C, config: MapperConfig) -> Self {
        Self {
            connection,
            schemas: SchemaRegistry::new(config.allow_undefined),
            config,
            store: EntityStore::new(),
            hooks: LifecycleHooks::new(),
            work: UnitOfWork::new(),
        }
    }

    pub fn register(&mut self, schema: EntitySchema) -> &mut Self {
        self.schemas.register(schema);
        self
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn entity(&self, key: EntityKey) -> Result<&Entity> {
        self.store.entity(key)
    }

    pub fn entity_mut(&mut self, key: EntityKey) -> Result<&mut Entity> {
        self.store.entity_mut(key)
    }

    // ------------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------------

    /// Build an in-memory entity of `type_name`. Nothing is scheduled.
    pub fn create(&mut self, type_name: &str, kind: SchemaKind, new: NewEntity) -> Result<EntityKey> {
        for endpoint in [new.start, new.end].into_iter().flatten() {
            if let Endpoint::Entity(key) = endpoint {
                self.store.entity(key)?;
            }
        }

        let entity = self.schemas.resolve(type_name, kind).instantiate(new)?;
        let key = self.store.insert(entity);
        debug!("Created {} {}", type_name, key);
        Ok(key)
    }

    pub fn create_node(&mut self, type_name: &str, new: NewEntity) -> Result<EntityKey> {
        self.create(type_name, SchemaKind::Node, new)
    }

    pub fn create_relationship(
        &mut self,
        type_name: &str,
        start: impl Into<Endpoint>,
        end: impl Into<Endpoint>,
        new: NewEntity,
    ) -> Result<EntityKey> {
        self.create(type_name, SchemaKind::Relationship, new.start(start).end(end))
    }

    // ------------------------------------------------------------------------
    // Unit of work
    // ------------------------------------------------------------------------

    pub fn save(&mut self, key: EntityKey) -> Result<()> {
        self.work.save(&mut self.store, key)
    }

    pub fn delete(&mut self, key: EntityKey, detach: bool) -> Result<()> {
        self.work.delete(&mut self.store, key, detach)
    }

    pub fn pending(&self) -> usize {
        self.work.len()
    }

    /// Statements the next [`send`](Self::send) would execute.
    pub fn queries(&mut self) -> Result<Vec<Statement>> {
        self.work.queries(&mut self.store)
    }

    /// Flush every pending operation.
    pub async fn send(&mut self) -> Result<Response> {
        self.work
            .send(&mut self.store, &mut self.hooks, &self.connection, &self.config)
            .await
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Load a persisted node or relationship by id. An entity already held
    /// by the mapper is refreshed in place.
    pub async fn get_by_id(&mut self, id: i64, kind: SchemaKind) -> Result<Option<EntityKey>> {
        let generic = match kind {
            SchemaKind::Node => GENERIC_NODE,
            SchemaKind::Relationship => GENERIC_RELATIONSHIP,
        };
        let probe = self
            .schemas
            .resolve(generic, kind)
            .instantiate(NewEntity::new().id(id))?;

        let mut scratch = EntityStore::new();
        let probe = scratch.insert(probe);
        let mut registry = QueryVariableRegistry::new();
        let statement = QueryCompiler::new(&mut scratch, &mut registry).get_by_id(probe)?;

        let result = unit_of_work::execute(&self.connection, &statement, &self.config).await?;
        let variable = statement.returns.first().map(String::as_str).unwrap_or_default();
        let values: Vec<&GraphValue> = result.column(variable).collect();

        match values.as_slice() {
            [] => Ok(None),
            [value] => self.load(value).map(Some),
            many => Err(MapperError::AmbiguousResult {
                id,
                count: many.len(),
            }),
        }
    }

    /// Follow relationships from `key` and load the nodes found at the other
    /// end.
    pub async fn related(&mut self, key: EntityKey, query: &RelationshipQuery) -> Result<Vec<EntityKey>> {
        let was_bound = self
            .store
            .get(key)
            .is_some_and(|e| e.query_variable().is_some());

        let mut registry = QueryVariableRegistry::new();
        let compiled = query.compile(key, &mut self.store, &mut registry);
        if !was_bound {
            if let Some(entity) = self.store.get_mut(key) {
                entity.release_query_variable();
            }
        }
        let statement = compiled?;

        let result = unit_of_work::execute(&self.connection, &statement, &self.config).await?;
        let variable = statement.returns.first().map(String::as_str).unwrap_or_default();

        let mut keys = Vec::new();
        for value in result.column(variable) {
            let loaded = self.load(value)?;
            if !keys.contains(&loaded) {
                keys.push(loaded);
            }
        }

        info!("🧭 Loaded {} node(s) over `{}`", keys.len(), query.rel_type());
        Ok(keys)
    }

    /// Run a hand-written statement and load every node and relationship it
    /// returns. Within a row nodes are loaded first, so relationships can
    /// reference them as endpoints.
    pub async fn query(&mut self, statement: &Statement) -> Result<(QueryResult, Vec<EntityKey>)> {
        let result = unit_of_work::execute(&self.connection, statement, &self.config).await?;

        let mut keys = Vec::new();
        for row in result.rows() {
            let nodes = row.iter().filter(|(_, v)| matches!(v, GraphValue::Node(_)));
            let relationships = row
                .iter()
                .filter(|(_, v)| matches!(v, GraphValue::Relationship(_)));

            for (_, value) in nodes.chain(relationships) {
                let loaded = self.load(value)?;
                if !keys.contains(&loaded) {
                    keys.push(loaded);
                }
            }
        }

        debug!("Loaded {} entities from {} row(s)", keys.len(), result.len());
        Ok((result, keys))
    }

    fn load(&mut self, value: &GraphValue) -> Result<EntityKey> {
        match value {
            GraphValue::Node(raw) => self.load_node(raw),
            GraphValue::Relationship(raw) => self.load_relationship(raw),
            GraphValue::Scalar(v) => Err(ConnectionError::Decode {
                variable: "entity".to_string(),
                message: format!("expected a node or relationship, got a {} value", v.type_name()),
            }
            .into()),
        }
    }

    fn load_node(&mut self, raw: &RawNode) -> Result<EntityKey> {
        if let Some(key) = self.store.find_by_id(raw.id, false) {
            self.refresh_loaded(key, &raw.properties)?;
            return Ok(key);
        }

        let mut labels = raw.labels.clone();
        labels.sort();
        let type_name = if labels.is_empty() {
            GENERIC_NODE.to_string()
        } else {
            labels.join("_")
        };

        let mut entity = self
            .schemas
            .resolve(&type_name, SchemaKind::Node)
            .instantiate(NewEntity::new().id(raw.id).labels(labels))?;
        entity.hydrate(raw.properties.clone(), true)?;
        Ok(self.store.insert(entity))
    }

    fn load_relationship(&mut self, raw: &RawRelationship) -> Result<EntityKey> {
        if let Some(key) = self.store.find_by_id(raw.id, true) {
            self.refresh_loaded(key, &raw.properties)?;
            return Ok(key);
        }

        let endpoint = |id: i64| match self.store.find_by_id(id, false) {
            Some(key) => Endpoint::Entity(key),
            None => Endpoint::Id(id),
        };
        let new = NewEntity::new()
            .id(raw.id)
            .start(endpoint(raw.start))
            .end(endpoint(raw.end));

        let mut entity = self
            .schemas
            .resolve(&raw.rel_type, SchemaKind::Relationship)
            .instantiate(new)?;
        entity.hydrate(raw.properties.clone(), true)?;
        Ok(self.store.insert(entity))
    }

    /// Apply server properties to an entity already held by the mapper.
    /// Entities with unsaved edits or a pending operation keep their state.
    fn refresh_loaded(&mut self, key: EntityKey, properties: &BTreeMap<String, Value>) -> Result<()> {
        let pending = self
            .work
            .operations()
            .iter()
            .any(|op| op.key() == key || op.absorbed().contains(&key));
        let entity = self.store.entity_mut(key)?;

        if pending || !entity.changed().is_empty() || !entity.deleted().is_empty() {
            debug!("Keeping unsaved state of {} {}", entity.type_name(), key);
            return Ok(());
        }

        entity.hydrate(properties.clone(), true)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------------

    pub fn on<F>(&mut self, type_name: &str, phase: Phase, hook: F) -> HookHandle
    where
        F: FnMut(&mut Entity, Option<&QueryResult>) -> anyhow::Result<()>
            + Send
            + 'static,
    {
        self.hooks.register(type_name, phase, hook)
    }

    pub fn on_property_changed<F>(&mut self, type_name: &str, field: &str, handler: F) -> HookHandle
    where
        F: FnMut(&mut Entity, &PropertyChange) -> anyhow::Result<()> + Send + 'static,
    {
        self.hooks.on_property_changed(type_name, field, handler)
    }

    pub fn remove_hook(&mut self, handle: HookHandle) -> bool {
        self.hooks.unregister(handle)
    }
}

//! Unit of Work
//!
//! Collects pending saves and deletes and flushes them one statement per
//! operation, driving lifecycle obligations around each statement.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compiler::{QueryCompiler, Statement};
use crate::config::MapperConfig;
use crate::connection::{Connection, QueryResult};
use crate::entity::{Endpoint, EntityKey, EntityStore};
use crate::error::{MapperError, Result};
use crate::lifecycle::{LifecycleHooks, Phase};
use crate::registry::QueryVariableRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Save,
    Delete { detach: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Scheduled,
    BeforeRun,
    Queried,
    AfterRun,
    Finalized,
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    key: EntityKey,
    kind: OperationKind,
    state: OperationState,
    /// Endpoint saves folded into this relationship save.
    absorbed: Vec<EntityKey>,
}

impl PendingOperation {
    fn new(key: EntityKey, kind: OperationKind) -> Self {
        Self {
            key,
            kind,
            state: OperationState::Scheduled,
            absorbed: Vec::new(),
        }
    }

    fn absorb(&mut self, key: EntityKey) {
        if !self.absorbed.contains(&key) {
            self.absorbed.push(key);
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn absorbed(&self) -> &[EntityKey] {
        &self.absorbed
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn state(&self) -> OperationState {
        self.state
    }
}

/// Ordered `(entity, phase)` work around one statement.
#[derive(Debug, Default, PartialEq)]
pub struct Obligations {
    pub before: Vec<(EntityKey, Phase)>,
    pub after: Vec<(EntityKey, Phase)>,
    pub finals: Vec<EntityKey>,
}

/// Aggregate outcome of a flush.
#[derive(Debug, Default, Serialize)]
pub struct Response {
    pub statements: Vec<Statement>,
    pub result: QueryResult,
    /// Every flushed operation with the state it reached.
    #[serde(skip)]
    pub operations: Vec<PendingOperation>,
}

/// Execute `statement`, promoting constraint failures to typed errors.
pub(crate) async fn execute<C: Connection>(
    connection: &C,
    statement: &Statement,
    config: &MapperConfig,
) -> Result<QueryResult> {
    if config.log_statements {
        debug!(
            "📤 {} {}",
            statement.text,
            serde_json::to_string(&statement.params).unwrap_or_default()
        );
    }

    connection.execute(statement).await.map_err(|e| {
        let err = MapperError::classify(e);
        warn!("⚠️  Statement failed: {}", err);
        err
    })
}

#[derive(Debug, Default)]
pub struct UnitOfWork {
    operations: Vec<PendingOperation>,
    registry: QueryVariableRegistry,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> &[PendingOperation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Schedule a create or update of `key`. A pending operation on the same
    /// or an equal entity is replaced; a relationship also absorbs pending
    /// saves of its endpoint nodes. Saves absorbed by a replaced operation are
    /// scheduled again unless the new one absorbs them too.
    pub fn save(&mut self, store: &mut EntityStore, key: EntityKey) -> Result<()> {
        let entity = store.entity(key)?;

        let mut endpoints: Vec<EntityKey> = Vec::new();
        for endpoint in [entity.start(), entity.end()].into_iter().flatten() {
            if let Endpoint::Entity(node) = endpoint {
                if !endpoints.contains(&node) {
                    endpoints.push(node);
                }
            }
        }

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.operations)
            .into_iter()
            .partition(|op| {
                op.key == key
                    || store.get(op.key) == Some(entity)
                    || (op.kind == OperationKind::Save && endpoints.contains(&op.key))
            });
        self.operations = kept;

        let mut op = PendingOperation::new(key, OperationKind::Save);
        let mut orphans = Vec::new();
        for removed in removed {
            if removed.kind == OperationKind::Save && endpoints.contains(&removed.key) {
                op.absorb(removed.key);
            }
            for absorbed in removed.absorbed {
                if endpoints.contains(&absorbed) {
                    op.absorb(absorbed);
                } else if absorbed != key {
                    orphans.push(absorbed);
                }
            }
        }
        self.reschedule(store, orphans);

        self.registry.define(store.entity_mut(key)?);
        for node in endpoints {
            if let Some(endpoint) = store.get_mut(node) {
                self.registry.define(endpoint);
            }
        }

        self.operations.push(op);
        Ok(())
    }

    /// Schedule a delete of `key`, replacing any pending operation on it.
    /// Endpoint saves absorbed by a replaced relationship save are scheduled
    /// again.
    pub fn delete(&mut self, store: &mut EntityStore, key: EntityKey, detach: bool) -> Result<()> {
        self.registry.define(store.entity_mut(key)?);

        let mut orphans = Vec::new();
        self.operations.retain_mut(|op| {
            op.absorbed.retain(|&absorbed| absorbed != key);
            if op.key == key {
                orphans.append(&mut op.absorbed);
                return false;
            }
            true
        });
        self.reschedule(store, orphans);

        self.operations
            .push(PendingOperation::new(key, OperationKind::Delete { detach }));
        Ok(())
    }

    fn reschedule(&mut self, store: &mut EntityStore, keys: Vec<EntityKey>) {
        for key in keys {
            if self.operations.iter().any(|op| op.key == key) {
                continue;
            }
            if let Some(entity) = store.get_mut(key) {
                self.registry.define(entity);
                debug!("Rescheduling absorbed save of {}", key);
                self.operations
                    .push(PendingOperation::new(key, OperationKind::Save));
            }
        }
    }

    /// Lifecycle obligations of `op`. Stored endpoint nodes of a saved
    /// relationship come first, in start/end order.
    pub fn obligations(&self, store: &EntityStore, op: &PendingOperation) -> Result<Obligations> {
        let entity = store.entity(op.key)?;
        let mut obligations = Obligations::default();

        if let OperationKind::Delete { .. } = op.kind {
            obligations.before.push((op.key, Phase::BeforeDelete));
            obligations.after.push((op.key, Phase::AfterDelete));
            obligations.finals.push(op.key);
            return Ok(obligations);
        }

        let mut targets = Vec::new();
        for endpoint in [entity.start(), entity.end()].into_iter().flatten() {
            if let Endpoint::Entity(node) = endpoint {
                if !targets.contains(&node) {
                    targets.push(node);
                }
            }
        }
        targets.push(op.key);

        for target in targets {
            let (before, after) = match store.entity(target)?.id() {
                Some(_) => (Phase::BeforeUpdate, Phase::AfterUpdate),
                None => (Phase::BeforeCreate, Phase::AfterCreate),
            };
            obligations.before.push((target, before));
            obligations.after.push((target, after));
            obligations.finals.push(target);
        }

        Ok(obligations)
    }

    /// Compile every pending operation without executing anything.
    pub fn queries(&self, store: &mut EntityStore) -> Result<Vec<Statement>> {
        let unbound: Vec<EntityKey> = store
            .iter()
            .filter(|(_, e)| e.query_variable().is_none())
            .map(|(k, _)| k)
            .collect();
        let mut registry = self.registry.clone();

        let compiled = self
            .operations
            .iter()
            .map(|op| compile(store, &mut registry, op))
            .collect::<Result<Vec<_>>>();

        for key in unbound {
            if let Some(entity) = store.get_mut(key) {
                entity.release_query_variable();
            }
        }

        Ok(compiled?.into_iter().flatten().collect())
    }

    /// Flush every pending operation in order. State is reset afterwards
    /// whether or not the flush succeeded.
    pub async fn send<C: Connection>(
        &mut self,
        store: &mut EntityStore,
        hooks: &mut LifecycleHooks,
        connection: &C,
        config: &MapperConfig,
    ) -> Result<Response> {
        let outcome = self.flush(store, hooks, connection, config).await;
        self.reset(store);
        outcome
    }

    async fn flush<C: Connection>(
        &mut self,
        store: &mut EntityStore,
        hooks: &mut LifecycleHooks,
        connection: &C,
        config: &MapperConfig,
    ) -> Result<Response> {
        let operations = std::mem::take(&mut self.operations);
        let total = operations.len();
        let mut response = Response::default();

        for mut op in operations {
            let key = op.key;
            self.run_operation(store, hooks, connection, config, &mut op, &mut response)
                .await
                .map_err(|e| {
                    warn!("⚠️  Operation on {} failed in state {:?}", key, op.state);
                    e
                })?;
            response.operations.push(op);
        }

        info!(
            "✅ Flushed {} operation(s) in {} statement(s), {} row(s)",
            total,
            response.statements.len(),
            response.result.len()
        );
        Ok(response)
    }

    async fn run_operation<C: Connection>(
        &mut self,
        store: &mut EntityStore,
        hooks: &mut LifecycleHooks,
        connection: &C,
        config: &MapperConfig,
        op: &mut PendingOperation,
        response: &mut Response,
    ) -> Result<()> {
        let obligations = self.obligations(store, op)?;

        op.state = OperationState::BeforeRun;
        for &(key, phase) in &obligations.before {
            hooks.run(phase, store.entity_mut(key)?, None)?;
        }

        let statement = compile(store, &mut self.registry, op)?;
        let result = match &statement {
            Some(statement) => execute(connection, statement, config).await?,
            None => QueryResult::default(),
        };
        op.state = OperationState::Queried;

        for &(key, phase) in &obligations.after {
            after_step(store, hooks, key, phase, &result)?;
        }
        op.state = OperationState::AfterRun;

        for &key in &obligations.finals {
            store.entity_mut(key)?.release_query_variable();
        }
        op.state = OperationState::Finalized;
        debug!("Operation on {} finished as {:?}", op.key, op.state);

        response.statements.extend(statement);
        response.result.extend(result);

        Ok(())
    }

    /// Drop pending operations, counters and batch-scoped variables.
    pub fn reset(&mut self, store: &mut EntityStore) {
        self.operations.clear();
        self.registry.reset();
        store.release_query_variables();
    }
}

fn compile(
    store: &mut EntityStore,
    registry: &mut QueryVariableRegistry,
    op: &PendingOperation,
) -> Result<Option<Statement>> {
    let mut compiler = QueryCompiler::new(store, registry);
    match op.kind {
        OperationKind::Save => compiler.save(&[op.key]).map(Some),
        OperationKind::Delete { detach } => compiler.delete(&[op.key], detach),
    }
}

/// Load the id and server-side properties bound to the entity's variable.
/// Without a returned value the current state becomes the baseline.
fn refresh(store: &mut EntityStore, key: EntityKey, result: &QueryResult) -> Result<()> {
    let entity = store.entity_mut(key)?;
    let returned = entity
        .query_variable()
        .and_then(|variable| result.first(variable))
        .and_then(|value| value.entity_parts());

    match returned {
        Some((id, properties)) => {
            entity.set_id(id);
            entity.hydrate(properties.clone(), true)?;
        }
        None => entity.commit(),
    }
    Ok(())
}

fn after_step(
    store: &mut EntityStore,
    hooks: &mut LifecycleHooks,
    key: EntityKey,
    phase: Phase,
    result: &QueryResult,
) -> Result<()> {
    match phase {
        Phase::AfterCreate => {
            refresh(store, key, result)?;
            hooks.run(phase, store.entity_mut(key)?, Some(result))
        }
        Phase::AfterUpdate => {
            let entity = store.entity_mut(key)?;
            let changes = entity.changed();
            if !changes.is_empty() {
                hooks.dispatch_changes(entity, &changes, Some(result))?;
            }
            hooks.run(phase, entity, Some(result))?;
            refresh(store, key, result)
        }
        Phase::AfterDelete => {
            let entity = store.entity_mut(key)?;
            hooks.run(phase, entity, Some(result))?;
            entity.clear_id();
            Ok(())
        }
        other => Err(MapperError::Compilation(format!(
            "{} is not an after phase",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NewEntity, SchemaKind, SchemaRegistry};

    fn node(store: &mut EntityStore, new: NewEntity) -> EntityKey {
        let entity = SchemaRegistry::default()
            .resolve("Node", SchemaKind::Node)
            .instantiate(new)
            .unwrap();
        store.insert(entity)
    }

    fn follows(store: &mut EntityStore, new: NewEntity) -> EntityKey {
        let entity = SchemaRegistry::default()
            .resolve("Follows", SchemaKind::Relationship)
            .instantiate(new)
            .unwrap();
        store.insert(entity)
    }

    #[test]
    fn test_saving_twice_schedules_once() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let key = node(&mut store, NewEntity::new().property("name", "mark"));

        work.save(&mut store, key).unwrap();
        work.save(&mut store, key).unwrap();

        assert_eq!(work.len(), 1);
        assert_eq!(store.entity(key).unwrap().query_variable(), Some("n0"));
    }

    #[test]
    fn test_equal_entities_are_deduplicated() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let a = node(&mut store, NewEntity::new().property("name", "mark"));
        let b = node(&mut store, NewEntity::new().property("name", "mark"));

        work.save(&mut store, a).unwrap();
        work.save(&mut store, b).unwrap();

        assert_eq!(work.len(), 1);
        assert_eq!(work.operations()[0].key(), b);
    }

    #[test]
    fn test_relationship_absorbs_endpoint_saves() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let a = node(&mut store, NewEntity::new().property("name", "mark"));
        let b = node(&mut store, NewEntity::new().property("name", "someone"));
        let rel = follows(&mut store, NewEntity::new().start(a).end(b));

        work.save(&mut store, a).unwrap();
        work.save(&mut store, b).unwrap();
        work.save(&mut store, rel).unwrap();

        assert_eq!(work.len(), 1);
        assert_eq!(work.operations()[0].kind(), OperationKind::Save);
    }

    #[test]
    fn test_replaced_relationship_save_restores_absorbed_endpoints() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let a = node(&mut store, NewEntity::new().property("name", "mark"));
        let rel = follows(&mut store, NewEntity::new().id(9).start(a).end(2i64));

        work.save(&mut store, a).unwrap();
        work.save(&mut store, rel).unwrap();
        assert_eq!(work.operations()[0].absorbed(), &[a]);

        work.delete(&mut store, rel, false).unwrap();

        let scheduled: Vec<(EntityKey, OperationKind)> =
            work.operations().iter().map(|op| (op.key(), op.kind())).collect();
        assert_eq!(
            scheduled,
            vec![
                (a, OperationKind::Save),
                (rel, OperationKind::Delete { detach: false })
            ]
        );
    }

    #[test]
    fn test_resaving_relationship_keeps_absorbed_endpoints() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let a = node(&mut store, NewEntity::new().property("name", "mark"));
        let rel = follows(&mut store, NewEntity::new().start(a).end(2i64));

        work.save(&mut store, a).unwrap();
        work.save(&mut store, rel).unwrap();
        work.save(&mut store, rel).unwrap();

        assert_eq!(work.len(), 1);
        assert_eq!(work.operations()[0].absorbed(), &[a]);
    }

    #[test]
    fn test_deleted_endpoint_is_not_restored() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let a = node(&mut store, NewEntity::new().id(1));
        let rel = follows(&mut store, NewEntity::new().id(9).start(a).end(2i64));

        work.save(&mut store, a).unwrap();
        work.save(&mut store, rel).unwrap();
        work.delete(&mut store, a, true).unwrap();
        work.delete(&mut store, rel, false).unwrap();

        assert!(work
            .operations()
            .iter()
            .all(|op| op.kind() != OperationKind::Save));
    }

    #[test]
    fn test_relationship_obligations_put_endpoints_first() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let a = node(&mut store, NewEntity::new().id(1));
        let b = node(&mut store, NewEntity::new());
        let rel = follows(&mut store, NewEntity::new().start(a).end(b));

        work.save(&mut store, rel).unwrap();
        let obligations = work.obligations(&store, &work.operations()[0]).unwrap();

        assert_eq!(
            obligations.before,
            vec![
                (a, Phase::BeforeUpdate),
                (b, Phase::BeforeCreate),
                (rel, Phase::BeforeCreate)
            ]
        );
        assert_eq!(
            obligations.after,
            vec![
                (a, Phase::AfterUpdate),
                (b, Phase::AfterCreate),
                (rel, Phase::AfterCreate)
            ]
        );
        assert_eq!(obligations.finals, vec![a, b, rel]);
    }

    #[test]
    fn test_delete_replaces_pending_save() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let key = node(&mut store, NewEntity::new().id(4));

        work.save(&mut store, key).unwrap();
        work.delete(&mut store, key, true).unwrap();

        assert_eq!(work.len(), 1);
        assert_eq!(
            work.operations()[0].kind(),
            OperationKind::Delete { detach: true }
        );
        assert_eq!(work.operations()[0].state(), OperationState::Scheduled);
    }

    #[test]
    fn test_queries_is_a_dry_run() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let a = node(&mut store, NewEntity::new().property("name", "mark"));

        work.save(&mut store, a).unwrap();
        let first = work.queries(&mut store).unwrap();
        let second = work.queries(&mut store).unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].text, "CREATE (n0:Node {name: $n0_name_0}) RETURN n0");
        assert_eq!(work.len(), 1);
    }

    #[test]
    fn test_reset_releases_variables() {
        let mut store = EntityStore::new();
        let mut work = UnitOfWork::new();
        let a = node(&mut store, NewEntity::new());

        work.save(&mut store, a).unwrap();
        work.reset(&mut store);

        assert!(work.is_empty());
        assert_eq!(store.entity(a).unwrap().query_variable(), None);
    }
}

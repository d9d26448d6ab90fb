//! Query Compiler
//!
//! Turns a batch of entities into one parameterized Cypher statement.
//! Values never appear in the text; each one is bound to a generated
//! parameter name.
//!
//! | Entity       | Persisted | Shape                                                   |
//! |--------------|-----------|---------------------------------------------------------|
//! | Node         | no        | `CREATE (v:Labels {props}) RETURN v`                    |
//! | Node         | yes       | `MATCH (v) SET v.f = $p WHERE id(v) = $id RETURN v`     |
//! | Relationship | no        | endpoints, then `CREATE (s)-[r:Type {props}]->(e)`      |
//! | Relationship | yes       | `MATCH (s)-[r:Type]->(e) SET ... WHERE id(r) = $id ...` |

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::entity::{Endpoint, Entity, EntityKey, EntityStore};
use crate::error::{MapperError, Result};
use crate::property::Representation;
use crate::registry::QueryVariableRegistry;
use crate::schema::GENERIC_NODE;
use crate::value::Value;

/// Bound parameters keyed by name, without the leading `$`.
pub type Params = BTreeMap<String, Value>;

/// A compiled statement ready for a [`Connection`](crate::connection::Connection).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub text: String,
    pub params: Params,
    /// Variables listed in the RETURN clause, in order.
    pub returns: Vec<String>,
}

impl Statement {
    /// A hand-written statement. Its RETURN variables are not tracked.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Params::new(),
            returns: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Emit `identifier` bare when it is a plain Cypher name, backtick-quoted
/// otherwise.
pub fn quote(identifier: &str) -> String {
    let mut chars = identifier.chars();
    let plain = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if plain {
        identifier.to_string()
    } else {
        format!("`{}`", identifier.replace('`', "``"))
    }
}

/// `:A:B` for a label set, empty when there are none.
pub fn label_fragment(labels: &[String]) -> String {
    labels.iter().map(|l| format!(":{}", quote(l))).collect()
}

// ============================================================================
// Clause Accumulator
// ============================================================================

#[derive(Debug, Default)]
struct Clauses {
    matches: Vec<String>,
    creates: Vec<String>,
    sets: Vec<String>,
    wheres: Vec<String>,
    returns: Vec<String>,
    distinct: bool,
    params: Params,
    /// Variables whose fragments have already been emitted.
    placed: HashSet<String>,
    /// Variables bound to bare endpoint ids.
    bound_ids: HashMap<i64, String>,
}

impl Clauses {
    fn bind(&mut self, name: String, value: Value) -> String {
        let placeholder = format!("${}", name);
        self.params.insert(name, value);
        placeholder
    }

    fn into_statement(self) -> Statement {
        let mut parts = Vec::new();

        if !self.matches.is_empty() {
            parts.push(format!("MATCH {}", self.matches.join(", ")));
        }
        if !self.creates.is_empty() {
            parts.push(format!("CREATE {}", self.creates.join(", ")));
        }
        if !self.sets.is_empty() {
            parts.push(format!("SET {}", self.sets.join(", ")));
        }
        if !self.wheres.is_empty() {
            parts.push(format!("WHERE {}", self.wheres.join(" AND ")));
        }
        if !self.returns.is_empty() {
            let keyword = if self.distinct { "RETURN DISTINCT" } else { "RETURN" };
            parts.push(format!("{} {}", keyword, self.returns.join(", ")));
        }

        Statement {
            text: parts.join(" "),
            params: self.params,
            returns: self.returns,
        }
    }
}

/// `{name: $p, ...}` with a leading space, or nothing for an empty bag.
fn inline_properties(entity: &Entity, registry: &mut QueryVariableRegistry, clauses: &mut Clauses) -> String {
    let data = entity.data(Representation::Graph);
    if data.is_empty() {
        return String::new();
    }

    let pairs: Vec<String> = data
        .into_iter()
        .map(|(field, value)| {
            let placeholder = clauses.bind(registry.next_param(entity, &field), value);
            format!("{}: {}", quote(&field), placeholder)
        })
        .collect();

    format!(" {{{}}}", pairs.join(", "))
}

/// SET fragments for every current property plus `NULL` for removed ones.
fn assign_properties(
    entity: &Entity,
    variable: &str,
    registry: &mut QueryVariableRegistry,
    clauses: &mut Clauses,
) {
    for (field, value) in entity.data(Representation::Graph) {
        let placeholder = clauses.bind(registry.next_param(entity, &field), value);
        clauses
            .sets
            .push(format!("{}.{} = {}", variable, quote(&field), placeholder));
    }

    for field in entity.deleted() {
        clauses.sets.push(format!("{}.{} = NULL", variable, quote(field)));
    }
}

fn match_id(
    entity: &Entity,
    variable: &str,
    id: i64,
    registry: &mut QueryVariableRegistry,
    clauses: &mut Clauses,
) {
    let placeholder = clauses.bind(registry.next_param(entity, "id"), Value::Integer(id));
    clauses.wheres.push(format!("id({}) = {}", variable, placeholder));
}

// ============================================================================
// Compiler
// ============================================================================

pub struct QueryCompiler<'a> {
    store: &'a mut EntityStore,
    registry: &'a mut QueryVariableRegistry,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(store: &'a mut EntityStore, registry: &'a mut QueryVariableRegistry) -> Self {
        Self { store, registry }
    }

    /// Compile a create/update of every entity in `keys` into one statement.
    pub fn save(&mut self, keys: &[EntityKey]) -> Result<Statement> {
        if keys.is_empty() {
            return Err(MapperError::Compilation("nothing to save".to_string()));
        }
        self.validate(keys)?;

        let mut clauses = Clauses::default();
        for &key in keys {
            if self.store.entity(key)?.is_relationship() {
                self.save_relationship(&mut clauses, key)?;
            } else {
                self.save_node(&mut clauses, key)?;
            }
        }

        let statement = clauses.into_statement();
        debug!("🧩 Compiled save: {}", statement.text);
        Ok(statement)
    }

    /// Compile a delete. Entities without an id are skipped; `None` when
    /// nothing is left to delete. Only batches containing a node detach.
    pub fn delete(&mut self, keys: &[EntityKey], detach: bool) -> Result<Option<Statement>> {
        let mut clauses = Clauses::default();
        let mut targets = Vec::new();
        let mut has_node = false;

        for &key in keys {
            let variable = self.define(key)?;
            let entity = self.store.entity(key)?;
            let Some(id) = entity.id() else {
                debug!("Skipping delete of unsaved {} {}", entity.type_name(), key);
                continue;
            };

            let pattern = if entity.is_node() {
                has_node = true;
                format!("({})", variable)
            } else {
                format!("()-[{}{}]-()", variable, label_fragment(entity.labels()))
            };
            let placeholder =
                clauses.bind(self.registry.next_param(entity, "id"), Value::Integer(id));
            targets.push(format!(
                "MATCH {} WHERE id({}) = {}",
                pattern, variable, placeholder
            ));
            clauses.returns.push(variable);
        }

        if targets.is_empty() {
            return Ok(None);
        }
        if detach && !has_node {
            debug!("Detach ignored for relationship-only delete");
        }

        let keyword = if has_node { "DETACH DELETE" } else { "DELETE" };
        let text = format!("{} {} {}", targets.join(" "), keyword, clauses.returns.join(", "));
        debug!("🧩 Compiled delete: {}", text);

        Ok(Some(Statement {
            text,
            params: clauses.params,
            returns: Vec::new(),
        }))
    }

    /// Compile a lookup of a persisted node or relationship by its id.
    pub fn get_by_id(&mut self, key: EntityKey) -> Result<Statement> {
        let variable = self.define(key)?;
        let entity = self.store.entity(key)?;
        let id = entity.id().ok_or_else(|| {
            MapperError::Argument(format!("{} {} has no id to look up", entity.type_name(), key))
        })?;

        let mut clauses = Clauses {
            distinct: true,
            ..Clauses::default()
        };
        let pattern = if entity.is_node() {
            format!("({})", variable)
        } else {
            format!("()-[{}]-()", variable)
        };
        clauses.matches.push(pattern);
        match_id(entity, &variable, id, self.registry, &mut clauses);
        clauses.returns.push(variable);

        Ok(clauses.into_statement())
    }

    fn define(&mut self, key: EntityKey) -> Result<String> {
        let entity = self
            .store
            .get_mut(key)
            .ok_or_else(|| MapperError::Compilation(format!("unknown entity {}", key)))?;
        Ok(self.registry.define(entity))
    }

    /// Every relationship must have two endpoints that resolve to nodes.
    fn validate(&self, keys: &[EntityKey]) -> Result<()> {
        for &key in keys {
            let entity = self
                .store
                .get(key)
                .ok_or_else(|| MapperError::Compilation(format!("unknown entity {}", key)))?;

            if entity.is_node() {
                continue;
            }

            for (side, endpoint) in [("start", entity.start()), ("end", entity.end())] {
                match endpoint {
                    None => {
                        return Err(MapperError::Argument(format!(
                            "relationship {} ({}) has no {} node",
                            entity.type_name(),
                            key,
                            side
                        )))
                    }
                    Some(Endpoint::Entity(other)) => match self.store.get(other) {
                        Some(node) if node.is_node() => {}
                        Some(_) => {
                            return Err(MapperError::Argument(format!(
                                "{} endpoint {} of {} is not a node",
                                side, other, key
                            )))
                        }
                        None => {
                            return Err(MapperError::Argument(format!(
                                "{} endpoint {} of {} is unknown",
                                side, other, key
                            )))
                        }
                    },
                    Some(Endpoint::Id(_)) => {}
                }
            }
        }

        Ok(())
    }

    fn save_node(&mut self, clauses: &mut Clauses, key: EntityKey) -> Result<()> {
        let variable = self.define(key)?;
        if !clauses.placed.insert(variable.clone()) {
            return Ok(());
        }

        let entity = self.store.entity(key)?;
        match entity.id() {
            None => {
                let props = inline_properties(entity, self.registry, clauses);
                clauses.creates.push(format!(
                    "({}{}{})",
                    variable,
                    label_fragment(entity.labels()),
                    props
                ));
            }
            Some(id) => {
                clauses.matches.push(format!("({})", variable));
                assign_properties(entity, &variable, self.registry, clauses);
                match_id(entity, &variable, id, self.registry, clauses);
            }
        }

        clauses.returns.push(variable);
        Ok(())
    }

    /// Pattern for one end of a relationship. New nodes are inlined,
    /// persisted ones are matched by id and updated.
    fn endpoint_pattern(&mut self, clauses: &mut Clauses, endpoint: Endpoint) -> Result<String> {
        let key = match endpoint {
            Endpoint::Entity(key) => key,
            Endpoint::Id(id) => {
                if let Some(variable) = clauses.bound_ids.get(&id) {
                    return Ok(format!("({})", variable));
                }

                let variable = self.registry.allocate(false);
                let placeholder = clauses.bind(
                    self.registry.param(&variable, GENERIC_NODE, "id"),
                    Value::Integer(id),
                );
                clauses.matches.push(format!("({})", variable));
                clauses
                    .wheres
                    .push(format!("id({}) = {}", variable, placeholder));
                clauses.bound_ids.insert(id, variable.clone());
                return Ok(format!("({})", variable));
            }
        };

        let variable = self.define(key)?;
        if !clauses.placed.insert(variable.clone()) {
            return Ok(format!("({})", variable));
        }

        let entity = self.store.entity(key)?;
        let pattern = match entity.id() {
            None => {
                let props = inline_properties(entity, self.registry, clauses);
                format!("({}{}{})", variable, label_fragment(entity.labels()), props)
            }
            Some(id) => {
                clauses.matches.push(format!("({})", variable));
                assign_properties(entity, &variable, self.registry, clauses);
                match_id(entity, &variable, id, self.registry, clauses);
                format!("({})", variable)
            }
        };

        clauses.returns.push(variable);
        Ok(pattern)
    }

    fn save_relationship(&mut self, clauses: &mut Clauses, key: EntityKey) -> Result<()> {
        let variable = self.define(key)?;
        if !clauses.placed.insert(variable.clone()) {
            return Ok(());
        }

        let (start, end) = {
            let entity = self.store.entity(key)?;
            let missing = |side: &str| {
                MapperError::Argument(format!("relationship {} has no {} node", key, side))
            };
            (
                entity.start().ok_or_else(|| missing("start"))?,
                entity.end().ok_or_else(|| missing("end"))?,
            )
        };

        let start = self.endpoint_pattern(clauses, start)?;
        let end = self.endpoint_pattern(clauses, end)?;

        let entity = self.store.entity(key)?;
        let rel_type = label_fragment(entity.labels());
        match entity.id() {
            None => {
                let props = inline_properties(entity, self.registry, clauses);
                clauses.creates.push(format!(
                    "{}-[{}{}{}]->{}",
                    start, variable, rel_type, props, end
                ));
            }
            Some(id) => {
                clauses
                    .matches
                    .push(format!("{}-[{}{}]->{}", start, variable, rel_type, end));
                assign_properties(entity, &variable, self.registry, clauses);
                match_id(entity, &variable, id, self.registry, clauses);
            }
        }

        clauses.returns.push(variable);
        Ok(())
    }
}

//! Query Variable Registry
//!
//! Hands out batch-scoped symbolic names (`n0`, `r1`, ...) for entities and
//! collision-free parameter names. Owned by one unit of work and reset after
//! every flush.

use std::collections::HashMap;

use crate::entity::Entity;

#[derive(Debug, Default, Clone)]
pub struct QueryVariableRegistry {
    nodes: usize,
    relationships: usize,
    params: HashMap<String, usize>,
}

impl QueryVariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh variable that is not bound to a stored entity.
    pub fn allocate(&mut self, relationship: bool) -> String {
        if relationship {
            let v = format!("r{}", self.relationships);
            self.relationships += 1;
            v
        } else {
            let v = format!("n{}", self.nodes);
            self.nodes += 1;
            v
        }
    }

    /// Variable of `entity`, allocating one on first use. Idempotent within
    /// a batch.
    pub fn define(&mut self, entity: &mut Entity) -> String {
        if let Some(existing) = entity.query_variable() {
            return existing.to_string();
        }

        let variable = self.allocate(entity.is_relationship());
        entity.set_query_variable(variable.clone());
        variable
    }

    /// Next parameter name for `field` of `entity`: `<var>_<field>_<seq>`.
    /// The sequence runs per entity type.
    pub fn next_param(&mut self, entity: &Entity, field: &str) -> String {
        let variable = entity.query_variable().unwrap_or(entity.type_name());
        self.param(variable, entity.type_name(), field)
    }

    pub fn param(&mut self, variable: &str, type_name: &str, field: &str) -> String {
        let seq = self.params.entry(type_name.to_string()).or_insert(0);
        let current = *seq;
        *seq += 1;

        format!("{}_{}_{}", variable, normalize_field(field), current).to_lowercase()
    }

    pub fn reset(&mut self) {
        self.nodes = 0;
        self.relationships = 0;
        self.params.clear();
    }
}

fn normalize_field(field: &str) -> String {
    field
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyManager;

    fn node(type_name: &str) -> Entity {
        Entity::node(type_name, [type_name], PropertyManager::new(true))
    }

    #[test]
    fn test_define_is_idempotent() {
        let mut registry = QueryVariableRegistry::new();
        let mut entity = node("Node");

        let first = registry.define(&mut entity);
        let second = registry.define(&mut entity);

        assert_eq!(first, "n0");
        assert_eq!(first, second);
    }

    #[test]
    fn test_nodes_and_relationships_count_separately() {
        let mut registry = QueryVariableRegistry::new();
        let mut a = node("Node");
        let mut b = node("Person");
        let mut rel = Entity::relationship("Follows", ["Follows"], None, None, PropertyManager::new(true));

        assert_eq!(registry.define(&mut a), "n0");
        assert_eq!(registry.define(&mut b), "n1");
        assert_eq!(registry.define(&mut rel), "r0");
    }

    #[test]
    fn test_param_names_are_normalized_and_sequenced_per_type() {
        let mut registry = QueryVariableRegistry::new();
        let mut a = node("Node");
        let mut b = node("Node");
        registry.define(&mut a);
        registry.define(&mut b);

        assert_eq!(registry.next_param(&a, "name"), "n0_name_0");
        assert_eq!(registry.next_param(&b, "name"), "n1_name_1");
        assert_eq!(registry.next_param(&a, "First Name"), "n0_first_name_2");
    }

    #[test]
    fn test_reset_restarts_counters() {
        let mut registry = QueryVariableRegistry::new();
        let mut a = node("Node");
        registry.define(&mut a);
        registry.next_param(&a, "name");

        registry.reset();
        a.release_query_variable();

        assert_eq!(registry.define(&mut a), "n0");
        assert_eq!(registry.next_param(&a, "name"), "n0_name_0");
    }
}

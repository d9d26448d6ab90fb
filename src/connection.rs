//! Connection contract
//!
//! The mapper talks to the database through [`Connection`]. Results come
//! back as rows of graph values keyed by the statement's RETURN variables.

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;

use crate::compiler::Statement;
use crate::error::ConnectionError;
use crate::value::Value;

pub trait Connection: Send + Sync {
    fn execute(
        &self,
        statement: &Statement,
    ) -> impl Future<Output = Result<QueryResult, ConnectionError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawNode {
    pub id: i64,
    pub labels: Vec<String>,
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRelationship {
    pub id: i64,
    pub rel_type: String,
    pub properties: BTreeMap<String, Value>,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GraphValue {
    Node(RawNode),
    Relationship(RawRelationship),
    Scalar(Value),
}

impl GraphValue {
    /// Persisted id and properties of a node or relationship.
    pub fn entity_parts(&self) -> Option<(i64, &BTreeMap<String, Value>)> {
        match self {
            GraphValue::Node(n) => Some((n.id, &n.properties)),
            GraphValue::Relationship(r) => Some((r.id, &r.properties)),
            GraphValue::Scalar(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultRow {
    values: BTreeMap<String, GraphValue>,
}

impl ResultRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, variable: impl Into<String>, value: GraphValue) -> Self {
        self.insert(variable, value);
        self
    }

    pub fn insert(&mut self, variable: impl Into<String>, value: GraphValue) {
        self.values.insert(variable.into(), value);
    }

    pub fn get(&self, variable: &str) -> Option<&GraphValue> {
        self.values.get(variable)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &GraphValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    rows: Vec<ResultRow>,
}

impl QueryResult {
    pub fn new(rows: Vec<ResultRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First value bound to `variable` in any row.
    pub fn first(&self, variable: &str) -> Option<&GraphValue> {
        self.rows.iter().find_map(|row| row.get(variable))
    }

    /// Every value bound to `variable`, in row order.
    pub fn column<'a>(&'a self, variable: &'a str) -> impl Iterator<Item = &'a GraphValue> + 'a {
        self.rows.iter().filter_map(move |row| row.get(variable))
    }

    pub fn extend(&mut self, other: QueryResult) {
        self.rows.extend(other.rows);
    }
}

impl From<Vec<ResultRow>> for QueryResult {
    fn from(rows: Vec<ResultRow>) -> Self {
        Self::new(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64) -> GraphValue {
        GraphValue::Node(RawNode {
            id,
            labels: vec!["Node".to_string()],
            properties: BTreeMap::new(),
        })
    }

    #[test]
    fn test_first_and_column_lookups() {
        let result = QueryResult::new(vec![
            ResultRow::new().with("n0", node(1)),
            ResultRow::new().with("n0", node(2)).with("x", GraphValue::Scalar(Value::Integer(3))),
        ]);

        assert_eq!(result.first("n0"), Some(&node(1)));
        assert_eq!(result.column("n0").count(), 2);
        assert_eq!(result.first("missing"), None);
        assert_eq!(result.rows()[1].get("x").and_then(GraphValue::entity_parts), None);
    }

    #[test]
    fn test_extend_appends_rows() {
        let mut total = QueryResult::default();
        total.extend(QueryResult::new(vec![ResultRow::new().with("n0", node(1))]));
        total.extend(QueryResult::new(vec![ResultRow::new().with("r0", node(2))]));

        assert_eq!(total.len(), 2);
    }
}

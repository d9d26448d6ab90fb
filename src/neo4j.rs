//! Neo4j Connection
//!
//! [`Connection`] implementation over a `neo4rs` graph. Parameters are bound
//! as Bolt values and returned nodes/relationships are decoded into
//! [`GraphValue`]s.

use neo4rs::{query, BoltList, BoltMap, BoltNull, BoltString, BoltType, Graph};
use std::collections::BTreeMap;
use std::fmt::Display;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::compiler::Statement;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, GraphValue, QueryResult, RawNode, RawRelationship, ResultRow};
use crate::error::ConnectionError;
use crate::value::Value;

pub struct Neo4jConnection {
    graph: Graph,
}

impl Neo4jConnection {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }

    /// Connect using `config`, retrying with exponential backoff.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let graph = connect_with_retry(
            &config.uri,
            &config.user,
            &config.password,
            config.connect_retries,
        )
        .await?;
        Ok(Self::new(graph))
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl Connection for Neo4jConnection {
    async fn execute(&self, statement: &Statement) -> Result<QueryResult, ConnectionError> {
        let mut q = query(&statement.text);
        for (name, value) in &statement.params {
            q = q.param(name, to_bolt(value));
        }

        let mut stream = self.graph.execute(q).await?;
        let mut rows = Vec::new();

        while let Some(row) = stream.next().await? {
            let mut result_row = ResultRow::new();
            for variable in &statement.returns {
                result_row.insert(variable.clone(), decode_column(&row, variable)?);
            }
            rows.push(result_row);
        }

        debug!("📥 {} row(s) returned", rows.len());
        Ok(QueryResult::new(rows))
    }
}

/// Backoff before retry `attempt` (1-based): 1s, 2s, 4s, 8s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt.saturating_sub(1).min(6)))
}

/// Connect to Neo4j with exponential backoff retry logic
pub async fn connect_with_retry(
    uri: &str,
    user: &str,
    password: &str,
    max_retries: u32,
) -> Result<Graph, ConnectionError> {
    let max_retries = max_retries.max(1);

    for attempt in 1..=max_retries {
        info!("🔄 Attempting to connect to Neo4j at {}... (attempt {}/{})", uri, attempt, max_retries);

        match Graph::new(uri, user, password).await {
            Ok(graph) => {
                info!("✅ Successfully connected to Neo4j");
                return Ok(graph);
            }
            Err(e) if attempt < max_retries => {
                let wait = backoff_delay(attempt);
                warn!(
                    "⚠️  Failed to connect to Neo4j: {}. Retrying in {}s (attempt {}/{})...",
                    e,
                    wait.as_secs(),
                    attempt,
                    max_retries
                );
                sleep(wait).await;
            }
            Err(e) => {
                error!("❌ Failed to connect to Neo4j after {} attempts: {}", max_retries, e);
                return Err(ConnectionError::Driver(e));
            }
        }
    }

    Err(ConnectionError::Backend("Failed to connect to Neo4j".to_string()))
}

// ============================================================================
// Value Conversion
// ============================================================================

fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => (*b).into(),
        Value::Integer(i) => (*i).into(),
        Value::Float(f) => (*f).into(),
        Value::String(s) => s.clone().into(),
        Value::DateTime(dt) => dt.to_rfc3339().into(),
        Value::List(items) => BoltType::List(BoltList {
            value: items.iter().map(to_bolt).collect(),
        }),
        Value::Map(map) => {
            let mut bolt = BoltMap::new();
            for (k, v) in map {
                bolt.put(BoltString::from(k.as_str()), to_bolt(v));
            }
            BoltType::Map(bolt)
        }
    }
}

fn decode_error(variable: &str, err: impl Display) -> ConnectionError {
    ConnectionError::Decode {
        variable: variable.to_string(),
        message: err.to_string(),
    }
}

fn decode_column(row: &neo4rs::Row, variable: &str) -> Result<GraphValue, ConnectionError> {
    let prefers_relationship = variable.starts_with('r');

    if !prefers_relationship {
        if let Ok(node) = row.get::<neo4rs::Node>(variable) {
            return decode_node(&node, variable).map(GraphValue::Node);
        }
    }
    if let Ok(rel) = row.get::<neo4rs::Relation>(variable) {
        return decode_relation(&rel, variable).map(GraphValue::Relationship);
    }
    if prefers_relationship {
        if let Ok(node) = row.get::<neo4rs::Node>(variable) {
            return decode_node(&node, variable).map(GraphValue::Node);
        }
    }

    row.get::<Value>(variable)
        .map(GraphValue::Scalar)
        .map_err(|e| decode_error(variable, e))
}

fn decode_node(node: &neo4rs::Node, variable: &str) -> Result<RawNode, ConnectionError> {
    let mut properties = BTreeMap::new();
    for key in node.keys() {
        let value = node
            .get::<Value>(&key)
            .map_err(|e| decode_error(variable, e))?;
        properties.insert(key.to_string(), value);
    }

    Ok(RawNode {
        id: node.id(),
        labels: node.labels().iter().map(|l| l.to_string()).collect(),
        properties,
    })
}

fn decode_relation(rel: &neo4rs::Relation, variable: &str) -> Result<RawRelationship, ConnectionError> {
    let mut properties = BTreeMap::new();
    for key in rel.keys() {
        let value = rel
            .get::<Value>(&key)
            .map_err(|e| decode_error(variable, e))?;
        properties.insert(key.to_string(), value);
    }

    Ok(RawRelationship {
        id: rel.id(),
        rel_type: rel.typ().to_string(),
        properties,
        start: rel.start_node_id(),
        end: rel.end_node_id(),
    })
}

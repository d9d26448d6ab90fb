//! Mapper error types.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use crate::entity::EntityKey;
use crate::lifecycle::Phase;

/// Shorthand used across the crate.
pub type Result<T, E = MapperError> = std::result::Result<T, E>;

/// Errors raised while assigning property values.
#[derive(Debug, Error)]
pub enum PropertyError {
    /// An undeclared property was assigned a value whose type cannot be
    /// mapped onto one of the scalar property kinds.
    #[error("Cannot infer a property type for `{field}` from a {value_type} value")]
    UninferableType {
        field: String,
        value_type: &'static str,
    },
}

/// Errors reported by a [`Connection`](crate::connection::Connection).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The backend rejected the statement.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The Neo4j driver failed.
    #[error("Neo4j driver error: {0}")]
    Driver(#[from] neo4rs::Error),

    /// A returned column could not be decoded.
    #[error("Failed to decode `{variable}`: {message}")]
    Decode { variable: String, message: String },
}

/// A uniqueness/constraint failure reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Constraint violation: `{label}`.`{field}` = {value} already exists")]
pub struct ConstraintViolation {
    pub label: String,
    pub field: String,
    pub value: String,
}

const CONSTRAINT_PATTERN: &str =
    r"already exists with label `([^`]+)` and property `([^`]+)` = (.+?)\s*$";

fn constraint_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CONSTRAINT_PATTERN).ok()).as_ref()
}

impl ConstraintViolation {
    /// Parse Neo4j's constraint message, e.g.
    /// ``Node(12) already exists with label `User` and property `email` = 'a@b.c'``.
    pub fn parse(message: &str) -> Option<Self> {
        let caps = constraint_regex()?.captures(message)?;

        let value = caps[3].trim();
        let value = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
            .unwrap_or(value);

        Some(Self {
            label: caps[1].to_string(),
            field: caps[2].to_string(),
            value: value.to_string(),
        })
    }
}

/// Errors surfaced by the mapper, compiler and unit of work.
#[derive(Debug, Error)]
pub enum MapperError {
    /// A relationship cannot be resolved to two node endpoints.
    #[error("Argument error: {0}")]
    Argument(String),

    /// The compiler was handed something it cannot render.
    #[error("Compilation error: {0}")]
    Compilation(String),

    #[error(transparent)]
    ConstraintViolation(#[from] ConstraintViolation),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A lifecycle hook returned an error; the flush was aborted.
    #[error("Lifecycle hook failed during {phase}: {message}")]
    Hook { phase: Phase, message: String },

    /// The key does not belong to this mapper's entity store.
    #[error("Unknown entity {0}")]
    UnknownEntity(EntityKey),

    /// A lookup by id returned more than one row.
    #[error("Expected at most one result for id {id}, got {count}")]
    AmbiguousResult { id: i64, count: usize },
}

impl MapperError {
    /// Promote backend failures that describe a constraint violation into
    /// the typed variant; everything else passes through unchanged.
    pub fn classify(err: ConnectionError) -> Self {
        match ConstraintViolation::parse(&err.to_string()) {
            Some(violation) => MapperError::ConstraintViolation(violation),
            None => MapperError::Connection(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_neo4j_constraint_message() {
        let msg = "Node(12) already exists with label `User` and property `email` = 'mark@example.com'";
        let violation = ConstraintViolation::parse(msg).expect("should parse");

        assert_eq!(violation.label, "User");
        assert_eq!(violation.field, "email");
        assert_eq!(violation.value, "mark@example.com");
    }

    #[test]
    fn test_parse_numeric_constraint_value() {
        let msg = "Node(3) already exists with label `Account` and property `number` = 42";
        let violation = ConstraintViolation::parse(msg).expect("should parse");

        assert_eq!(violation.value, "42");
    }

    #[test]
    fn test_pattern_compiles_once_and_is_reused() {
        let first = constraint_regex().expect("pattern should compile");
        let second = constraint_regex().expect("pattern should compile");

        assert!(std::ptr::eq(first, second));
        assert!(ConstraintViolation::parse("Node(1) already exists with label `A` and property `b` = 1").is_some());
        assert!(ConstraintViolation::parse("Node(2) already exists with label `A` and property `b` = 2").is_some());
    }

    #[test]
    fn test_unrelated_backend_error_stays_connection_error() {
        let err = MapperError::classify(ConnectionError::Backend("syntax error".to_string()));

        assert!(matches!(err, MapperError::Connection(_)));
    }

    #[test]
    fn test_constraint_backend_error_is_classified() {
        let err = MapperError::classify(ConnectionError::Backend(
            "Node(1) already exists with label `Person` and property `name` = 'mark'".to_string(),
        ));

        match err {
            MapperError::ConstraintViolation(v) => {
                assert_eq!(v.label, "Person");
                assert_eq!(v.field, "name");
                assert_eq!(v.value, "mark");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

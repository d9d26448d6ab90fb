//! Cypher Mapper
//!
//! An object-to-graph mapper for Neo4j. Entities (nodes and relationships)
//! live in an [`EntityStore`]; pending changes are collected by a
//! [`UnitOfWork`] and compiled into parameterized Cypher by the
//! [`QueryCompiler`], with lifecycle hooks run around every statement.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use cypher_mapper::{ConnectionConfig, Mapper, Neo4jConnection, NewEntity};
//!
//! let connection = Neo4jConnection::connect(&ConnectionConfig::from_env()).await?;
//! let mut mapper = Mapper::new(connection);
//!
//! let mark = mapper.create_node("Node", NewEntity::new().property("name", "mark"))?;
//! let other = mapper.create_node("Node", NewEntity::new().property("name", "someone"))?;
//! let follows = mapper.create_relationship("Follows", mark, other, NewEntity::new())?;
//!
//! mapper.save(follows)?;
//! mapper.send().await?;
//! # Ok(())
//! # }
//! ```

pub mod compiler;
pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod lifecycle;
pub mod mapper;
pub mod neo4j;
pub mod property;
pub mod registry;
pub mod schema;
pub mod traversal;
pub mod unit_of_work;
pub mod value;

pub use compiler::{Params, QueryCompiler, Statement};
pub use config::{ConnectionConfig, MapperConfig};
pub use connection::{Connection, GraphValue, QueryResult, RawNode, RawRelationship, ResultRow};
pub use entity::{Endpoint, Entity, EntityKey, EntityKind, EntityStore};
pub use error::{ConnectionError, ConstraintViolation, MapperError, PropertyError, Result};
pub use lifecycle::{HookHandle, LifecycleHooks, Phase};
pub use mapper::{Mapper, Response};
pub use neo4j::Neo4jConnection;
pub use property::{Producer, Property, PropertyChange, PropertyKind, PropertyManager, Representation};
pub use registry::QueryVariableRegistry;
pub use schema::{EntitySchema, NewEntity, SchemaKind, SchemaRegistry};
pub use traversal::{Direction, RelationshipQuery};
pub use unit_of_work::UnitOfWork;
pub use value::Value;

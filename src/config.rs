//! Configuration
//!
//! Connection settings come from the environment (with `.env` support);
//! mapper behavior is configured in code.

use std::env;

const DEFAULT_CONNECT_RETRIES: u32 = 4;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub connect_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
            connect_retries: DEFAULT_CONNECT_RETRIES,
        }
    }
}

impl ConnectionConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        Self {
            uri: env::var("NEO4J_URI").unwrap_or(defaults.uri),
            user: env::var("NEO4J_USER").unwrap_or(defaults.user),
            password: env::var("NEO4J_PASSWORD").unwrap_or(defaults.password),
            connect_retries: env::var("NEO4J_CONNECT_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.connect_retries),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapperConfig {
    /// Log every executed statement with its parameters at debug level.
    pub log_statements: bool,
    /// Whether the generic `Node`/`Relationship` types accept undeclared
    /// properties.
    pub allow_undefined: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            log_statements: true,
            allow_undefined: true,
        }
    }
}

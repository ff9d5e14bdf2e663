//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Record Store backend
    pub store: StoreConfig,
    /// Shared bearer token; when unset, requests are anonymous
    pub auth_secret: Option<String>,
}

/// Which Record Store backs the Reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// In-process store, lost on restart
    Memory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn name(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::Postgres { .. } => "postgres",
        }
    }

    fn from_parts(
        backend: Option<String>,
        database_url: Option<String>,
        max_connections: Option<String>,
    ) -> Result<Self, ConfigError> {
        match backend.as_deref().map(str::trim).unwrap_or("postgres") {
            "memory" => Ok(StoreConfig::Memory),
            "postgres" => {
                let database_url = database_url
                    .filter(|url| !url.trim().is_empty())
                    .ok_or(ConfigError::MissingDatabaseUrl)?;
                let max_connections = match max_connections {
                    Some(raw) => raw
                        .trim()
                        .parse()
                        .map_err(|_| ConfigError::InvalidMaxConnections)?,
                    None => DEFAULT_MAX_CONNECTIONS,
                };
                Ok(StoreConfig::Postgres {
                    database_url,
                    max_connections,
                })
            }
            other => Err(ConfigError::UnknownStoreBackend(other.to_string())),
        }
    }
}

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let store = StoreConfig::from_parts(
            env::var("STORE_BACKEND").ok(),
            env::var("DATABASE_URL").ok(),
            env::var("DB_MAX_CONNECTIONS").ok(),
        )?;

        let auth_secret = env::var("AUTH_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty());

        Ok(Self {
            host,
            port,
            store,
            auth_secret,
        })
    }

    /// In-memory configuration without auth, for local runs and tests.
    pub fn memory() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            store: StoreConfig::Memory,
            auth_secret: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required for the postgres store")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid DB_MAX_CONNECTIONS value")]
    InvalidMaxConnections,

    #[error("Unknown STORE_BACKEND '{0}' (expected 'postgres' or 'memory')")]
    UnknownStoreBackend(String),
}

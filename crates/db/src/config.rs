//! Entity store database configuration, read from the environment.

use anyhow::{Result, anyhow};
use std::env;

/// Supported external backends. When no backend is configured the store
/// reuses the host process's shared connection instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    MySql,
}

#[derive(Debug, Clone, Default)]
pub struct EntityDbConfig {
    pub db_type: Option<DbType>,
    pub db_host: String,
    pub db_name: String,
    pub db_user: String,
    pub db_pass: String,
    pub db_sslmode: String,
    /// Emit SQL and timings through the pool logger.
    pub log_queries: bool,
}

impl EntityDbConfig {
    /// Read the `ENTITY_API_*` variables, honouring a `.env` file.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let db_type = match env::var("ENTITY_API_DB_TYPE").unwrap_or_default().as_str() {
            "" => None,
            "postgres" => Some(DbType::Postgres),
            "mysql" => Some(DbType::MySql),
            other => return Err(anyhow!("invalid db type specified: {}", other)),
        };

        Ok(Self {
            db_type,
            db_host: env::var("ENTITY_API_DB_HOST").unwrap_or_default(),
            db_name: env::var("ENTITY_API_DB_NAME").unwrap_or_default(),
            db_user: env::var("ENTITY_API_DB_USER").unwrap_or_default(),
            db_pass: env::var("ENTITY_API_DB_PASS").unwrap_or_default(),
            db_sslmode: env::var("ENTITY_API_DB_SSLMODE")
                .unwrap_or_else(|_| "disable".to_string()),
            log_queries: env_flag("ENTITY_API_LOG_QUERIES"),
        })
    }
}

/// Feature flags consumed by the entity store.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureToggles {
    /// Master switch; nothing runs without it.
    pub entity_store: bool,
    /// Take an advisory lock around schema migrations.
    pub migration_locking: bool,
}

impl FeatureToggles {
    pub fn from_env() -> Self {
        Self {
            entity_store: env_flag("ENTITY_STORE_ENABLED"),
            migration_locking: env_flag("ENTITY_MIGRATION_LOCKING"),
        }
    }
}

/// Deployment environment. The schema migrator refuses to run in
/// production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match env::var("APP_ENV").unwrap_or_default().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

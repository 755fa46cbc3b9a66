//! Database connection service for the entity store.
//!
//! Selects the backend from configuration (postgres or mysql), or
//! adopts the host process's shared connection when none is configured,
//! and runs the schema migrations at startup.

pub mod config;
pub mod dialect;
pub mod entity;
pub mod migrator;
pub mod query;

use std::time::Duration;

use anyhow::{Result, anyhow};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use tracing::info;

use config::{DbType, EntityDbConfig, Environment, FeatureToggles};
use dialect::Dialect;

pub struct EntityDb {
    connection: DatabaseConnection,
    dialect: Dialect,
}

impl EntityDb {
    /// Open the configured backend (or adopt `shared`), then migrate.
    pub async fn provide(
        cfg: &EntityDbConfig,
        env: Environment,
        features: FeatureToggles,
        shared: Option<DatabaseConnection>,
    ) -> Result<Self> {
        let connection = match cfg.db_type {
            Some(db_type) => Self::connect(cfg, db_type).await?,
            None => shared.ok_or_else(|| anyhow!("no shared db connection provided"))?,
        };

        let dialect = Dialect::new(connection.get_database_backend());
        let db = Self {
            connection,
            dialect,
        };
        migrator::migrate_entity_store(&db, env, features).await?;
        Ok(db)
    }

    async fn connect(cfg: &EntityDbConfig, db_type: DbType) -> Result<DatabaseConnection> {
        let url = match db_type {
            DbType::Postgres => {
                let (host, port) = split_host_port(&cfg.db_host, "127.0.0.1", "5432")?;
                format!(
                    "postgres://{}:{}@{}:{}/{}?sslmode={}",
                    cfg.db_user, cfg.db_pass, host, port, cfg.db_name, cfg.db_sslmode
                )
            }
            DbType::MySql => {
                let (host, port) = split_host_port(&cfg.db_host, "127.0.0.1", "3306")?;
                format!(
                    "mysql://{}:{}@{}:{}/{}",
                    cfg.db_user, cfg.db_pass, host, port, cfg.db_name
                )
            }
        };

        let mut opt = ConnectOptions::new(url);
        opt.max_connections(20)
            .min_connections(2)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(300))
            .sqlx_logging(cfg.log_queries);

        let connection = Database::connect(opt).await?;
        info!("connected to {:?} entity store backend", db_type);
        Ok(connection)
    }

    /// Wrap an already-open connection; the caller is responsible for
    /// having run the migrations. Used by tests and embedding hosts.
    pub fn from_connection(connection: DatabaseConnection) -> Self {
        let dialect = Dialect::new(connection.get_database_backend());
        Self {
            connection,
            dialect,
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }
}

fn split_host_port<'a>(
    host: &'a str,
    default_host: &'a str,
    default_port: &'a str,
) -> Result<(&'a str, &'a str)> {
    if host.is_empty() {
        return Ok((default_host, default_port));
    }
    match host.split_once(':') {
        Some((h, p)) => {
            if h.is_empty() || p.is_empty() {
                return Err(anyhow!("invalid host specifier '{}'", host));
            }
            Ok((h, p))
        }
        None => Ok((host, default_port)),
    }
}

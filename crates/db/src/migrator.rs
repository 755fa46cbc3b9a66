//! Schema migrations for the entity store tables.
//!
//! The schema is still settling, so the migrator carries an explicit
//! development escape hatch: when the migration log no longer contains
//! the current sentinel migration, every owned table is dropped and the
//! schema is rebuilt from scratch. The production environment guard
//! means this can never touch real data.

use std::collections::HashSet;

use anyhow::{Result, anyhow};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait, Set, Statement,
    TransactionTrait,
};
use tracing::{debug, info, warn};

use crate::EntityDb;
use crate::config::{Environment, FeatureToggles};
use crate::dialect::Dialect;
use crate::entity::migration_log;

const MIGRATION_LOCK_NAME: &str = "stash_entity_migrations";
const MIGRATION_LOCK_ID: i64 = 0x7374_6173_6821;

/// Tables owned by this migrator, in drop order.
const OWNED_TABLES: &[&str] = &[
    "entity_folder_tree",
    "entity_nested",
    "entity_ref",
    "entity_labels",
    "entity_history",
    "entity",
    "entity_migration_log",
];

/// Id of the final migration. A non-empty log lacking this marker was
/// written by an older schema generation and triggers the reset.
const SENTINEL_MIGRATION: &str = "create entity_folder_tree table";

struct Migration {
    id: &'static str,
    build: fn(&Dialect) -> Vec<String>,
}

fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            id: "create entity table",
            build: entity_table,
        },
        Migration {
            id: "create entity_history table",
            build: entity_history_table,
        },
        Migration {
            id: "create entity_labels table",
            build: entity_labels_table,
        },
        Migration {
            id: "create entity_ref table",
            build: entity_ref_table,
        },
        Migration {
            id: "create entity_nested table",
            build: entity_nested_table,
        },
        Migration {
            id: SENTINEL_MIGRATION,
            build: entity_folder_tree_table,
        },
    ]
}

/// Run the entity store migrations once at startup.
///
/// Skips silently unless the entity store feature flag is set, and never
/// runs in a production environment.
pub async fn migrate_entity_store(
    db: &EntityDb,
    env: Environment,
    features: FeatureToggles,
) -> Result<()> {
    if !features.entity_store {
        return Ok(());
    }
    if env == Environment::Production {
        return Ok(());
    }

    let conn = db.connection();
    let dialect = db.dialect();

    ensure_log_table(conn, &dialect).await?;

    if features.migration_locking {
        acquire_lock(conn).await?;
    }
    let result = run_migrations(conn, &dialect).await;
    if features.migration_locking {
        release_lock(conn).await;
    }
    result
}

async fn run_migrations(conn: &DatabaseConnection, dialect: &Dialect) -> Result<()> {
    let mut applied: HashSet<String> = migration_log::Entity::find()
        .all(conn)
        .await?
        .into_iter()
        .map(|m| m.migration_id)
        .collect();

    if !applied.is_empty() && !applied.contains(SENTINEL_MIGRATION) {
        warn!("entity schema generation changed, dropping and rebuilding all entity tables");
        reset_schema(conn, dialect).await?;
        applied.clear();
    }

    for migration in migrations() {
        if applied.contains(migration.id) {
            continue;
        }
        info!(migration = migration.id, "running entity store migration");
        for sql in (migration.build)(dialect) {
            conn.execute(Statement::from_string(dialect.backend(), sql))
                .await?;
        }
        migration_log::ActiveModel {
            migration_id: Set(migration.id.to_string()),
            executed_at: Set(Utc::now().timestamp_millis()),
            success: Set(true),
        }
        .insert(conn)
        .await?;
    }
    Ok(())
}

async fn ensure_log_table(conn: &DatabaseConnection, dialect: &Dialect) -> Result<()> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS entity_migration_log ({} VARCHAR(190) NOT NULL PRIMARY KEY, {} BIGINT NOT NULL, {} BOOLEAN NOT NULL)",
        dialect.quote("migration_id"),
        dialect.quote("executed_at"),
        dialect.quote("success"),
    );
    conn.execute(Statement::from_string(dialect.backend(), sql))
        .await?;
    Ok(())
}

async fn reset_schema(conn: &DatabaseConnection, dialect: &Dialect) -> Result<()> {
    let txn = conn.begin().await?;
    for table in OWNED_TABLES {
        txn.execute(Statement::from_string(
            dialect.backend(),
            format!("DROP TABLE IF EXISTS {}", table),
        ))
        .await?;
    }
    txn.commit().await?;
    ensure_log_table(conn, dialect).await
}

async fn acquire_lock(conn: &DatabaseConnection) -> Result<()> {
    match conn.get_database_backend() {
        DbBackend::MySql => {
            let row = conn
                .query_one(Statement::from_string(
                    DbBackend::MySql,
                    format!("SELECT GET_LOCK('{}', 60)", MIGRATION_LOCK_NAME),
                ))
                .await?;
            let acquired = row
                .and_then(|r| r.try_get_by_index::<Option<i64>>(0).ok())
                .flatten()
                .unwrap_or(0);
            if acquired != 1 {
                return Err(anyhow!("timed out waiting for the migration lock"));
            }
        }
        DbBackend::Postgres => {
            conn.execute(Statement::from_string(
                DbBackend::Postgres,
                format!("SELECT pg_advisory_lock({})", MIGRATION_LOCK_ID),
            ))
            .await?;
        }
        _ => {}
    }
    Ok(())
}

async fn release_lock(conn: &DatabaseConnection) {
    let stmt = match conn.get_database_backend() {
        DbBackend::MySql => Statement::from_string(
            DbBackend::MySql,
            format!("SELECT RELEASE_LOCK('{}')", MIGRATION_LOCK_NAME),
        ),
        DbBackend::Postgres => Statement::from_string(
            DbBackend::Postgres,
            format!("SELECT pg_advisory_unlock({})", MIGRATION_LOCK_ID),
        ),
        _ => return,
    };
    if let Err(e) = conn.execute(stmt).await {
        debug!("failed to release migration lock: {}", e);
    }
}

fn entity_table(d: &Dialect) -> Vec<String> {
    let q = |c: &str| d.quote(c);
    vec![
        format!(
            "CREATE TABLE entity (\
             {guid} VARCHAR(36) NOT NULL PRIMARY KEY, \
             {tenant_id} BIGINT NOT NULL, \
             {kind} VARCHAR(190) NOT NULL, \
             {uid} VARCHAR(64) NOT NULL, \
             {folder} VARCHAR(64) NOT NULL, \
             {slug} VARCHAR(190) NOT NULL, \
             {version} VARCHAR(36) NOT NULL, \
             {size} BIGINT NOT NULL, \
             {etag} VARCHAR(64) NOT NULL, \
             {body} {blob} NULL, \
             {meta} {blob} NULL, \
             {status} {blob} NULL, \
             {name} VARCHAR(255) NOT NULL, \
             {description} TEXT NULL, \
             {labels} TEXT NULL, \
             {fields} TEXT NULL, \
             {errors} TEXT NULL, \
             {created_at} BIGINT NOT NULL, \
             {created_by} VARCHAR(190) NOT NULL, \
             {updated_at} BIGINT NOT NULL, \
             {updated_by} VARCHAR(190) NOT NULL, \
             {origin} VARCHAR(190) NOT NULL, \
             {origin_key} VARCHAR(190) NOT NULL, \
             {origin_ts} BIGINT NOT NULL)",
            guid = q("guid"),
            tenant_id = q("tenant_id"),
            kind = q("kind"),
            uid = q("uid"),
            folder = q("folder"),
            slug = q("slug"),
            version = q("version"),
            size = q("size"),
            etag = q("etag"),
            body = q("body"),
            meta = q("meta"),
            status = q("status"),
            name = q("name"),
            description = q("description"),
            labels = q("labels"),
            fields = q("fields"),
            errors = q("errors"),
            created_at = q("created_at"),
            created_by = q("created_by"),
            updated_at = q("updated_at"),
            updated_by = q("updated_by"),
            origin = q("origin"),
            origin_key = q("origin_key"),
            origin_ts = q("origin_ts"),
            blob = d.blob_type(),
        ),
        format!(
            "CREATE UNIQUE INDEX idx_entity_identity ON entity ({},{},{})",
            q("tenant_id"),
            q("kind"),
            q("uid"),
        ),
        format!(
            "CREATE INDEX idx_entity_folder ON entity ({},{})",
            q("tenant_id"),
            q("folder"),
        ),
    ]
}

fn entity_history_table(d: &Dialect) -> Vec<String> {
    let q = |c: &str| d.quote(c);
    vec![
        format!(
            "CREATE TABLE entity_history (\
             {guid} VARCHAR(36) NOT NULL, \
             {version} VARCHAR(36) NOT NULL, \
             {tenant_id} BIGINT NOT NULL, \
             {kind} VARCHAR(190) NOT NULL, \
             {uid} VARCHAR(64) NOT NULL, \
             {folder} VARCHAR(64) NOT NULL, \
             {size} BIGINT NOT NULL, \
             {body} {blob} NULL, \
             {etag} VARCHAR(64) NOT NULL, \
             {message} TEXT NULL, \
             {created_at} BIGINT NOT NULL, \
             {created_by} VARCHAR(190) NOT NULL, \
             {updated_at} BIGINT NOT NULL, \
             {updated_by} VARCHAR(190) NOT NULL, \
             PRIMARY KEY ({guid},{version}))",
            guid = q("guid"),
            version = q("version"),
            tenant_id = q("tenant_id"),
            kind = q("kind"),
            uid = q("uid"),
            folder = q("folder"),
            size = q("size"),
            body = q("body"),
            etag = q("etag"),
            message = q("message"),
            created_at = q("created_at"),
            created_by = q("created_by"),
            updated_at = q("updated_at"),
            updated_by = q("updated_by"),
            blob = d.blob_type(),
        ),
        format!(
            "CREATE INDEX idx_entity_history_identity ON entity_history ({},{},{},{})",
            q("tenant_id"),
            q("kind"),
            q("uid"),
            q("version"),
        ),
    ]
}

fn entity_labels_table(d: &Dialect) -> Vec<String> {
    let q = |c: &str| d.quote(c);
    vec![format!(
        "CREATE TABLE entity_labels (\
         {guid} VARCHAR(190) NOT NULL, \
         {label} VARCHAR(190) NOT NULL, \
         {value} VARCHAR(190) NOT NULL, \
         {parent_grn} VARCHAR(190) NOT NULL, \
         PRIMARY KEY ({guid},{label}))",
        guid = q("guid"),
        label = q("label"),
        value = q("value"),
        parent_grn = q("parent_grn"),
    )]
}

fn entity_ref_table(d: &Dialect) -> Vec<String> {
    let q = |c: &str| d.quote(c);
    vec![
        format!(
            "CREATE TABLE entity_ref (\
             {guid} VARCHAR(190) NOT NULL, \
             {parent_grn} VARCHAR(190) NOT NULL, \
             {family} VARCHAR(190) NOT NULL, \
             {ref_type} VARCHAR(190) NOT NULL, \
             {ref_id} VARCHAR(190) NOT NULL, \
             {resolved_ok} BOOLEAN NOT NULL, \
             {resolved_to} VARCHAR(190) NOT NULL, \
             {resolved_warning} TEXT NULL, \
             {resolved_time} BIGINT NOT NULL)",
            guid = q("guid"),
            parent_grn = q("parent_grn"),
            family = q("family"),
            ref_type = q("type"),
            ref_id = q("id"),
            resolved_ok = q("resolved_ok"),
            resolved_to = q("resolved_to"),
            resolved_warning = q("resolved_warning"),
            resolved_time = q("resolved_time"),
        ),
        format!("CREATE INDEX idx_entity_ref_guid ON entity_ref ({})", q("guid")),
        format!(
            "CREATE INDEX idx_entity_ref_target ON entity_ref ({},{})",
            q("family"),
            q("resolved_to"),
        ),
    ]
}

fn entity_nested_table(d: &Dialect) -> Vec<String> {
    let q = |c: &str| d.quote(c);
    vec![
        format!(
            "CREATE TABLE entity_nested (\
             {grn} VARCHAR(190) NOT NULL PRIMARY KEY, \
             {guid} VARCHAR(36) NOT NULL, \
             {parent_grn} VARCHAR(190) NOT NULL, \
             {tenant_id} BIGINT NOT NULL, \
             {kind} VARCHAR(190) NOT NULL, \
             {uid} VARCHAR(64) NOT NULL, \
             {folder} VARCHAR(64) NOT NULL, \
             {name} VARCHAR(255) NOT NULL, \
             {slug} VARCHAR(190) NOT NULL, \
             {description} TEXT NULL, \
             {labels} TEXT NULL, \
             {fields} TEXT NULL, \
             {errors} TEXT NULL)",
            grn = q("grn"),
            guid = q("guid"),
            parent_grn = q("parent_grn"),
            tenant_id = q("tenant_id"),
            kind = q("kind"),
            uid = q("uid"),
            folder = q("folder"),
            name = q("name"),
            slug = q("slug"),
            description = q("description"),
            labels = q("labels"),
            fields = q("fields"),
            errors = q("errors"),
        ),
        format!(
            "CREATE INDEX idx_entity_nested_guid ON entity_nested ({})",
            q("guid"),
        ),
    ]
}

fn entity_folder_tree_table(d: &Dialect) -> Vec<String> {
    let q = |c: &str| d.quote(c);
    vec![
        format!(
            "CREATE TABLE entity_folder_tree (\
             {guid} VARCHAR(36) NOT NULL PRIMARY KEY, \
             {tenant_id} BIGINT NOT NULL, \
             {uid} VARCHAR(64) NOT NULL, \
             {slug_path} TEXT NOT NULL, \
             {tree} TEXT NOT NULL, \
             {depth} BIGINT NOT NULL, \
             {detached} BOOLEAN NOT NULL)",
            guid = q("guid"),
            tenant_id = q("tenant_id"),
            uid = q("uid"),
            slug_path = q("slug_path"),
            tree = q("tree"),
            depth = q("depth"),
            detached = q("detached"),
        ),
        format!(
            "CREATE INDEX idx_entity_folder_tree_tenant ON entity_folder_tree ({})",
            q("tenant_id"),
        ),
    ]
}

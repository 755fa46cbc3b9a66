//! Migration log entity: one row per executed migration.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "entity_migration_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub migration_id: String,
    pub executed_at: i64,
    pub success: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

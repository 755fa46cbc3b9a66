//! The SQL entity server: the transactional write/read/delete/history/
//! search/find-references engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, QueryResult, TransactionTrait, Value,
};
use tracing::{debug, error};

use db::EntityDb;
use db::dialect::Dialect;
use db::query::SelectQuery;
use grn::Grn;

use crate::api::{
    AdminWriteEntityRequest, BatchReadEntityRequest, BatchReadEntityResponse, DeleteEntityRequest,
    DeleteEntityResponse, Entity, EntityHistoryRequest, EntityHistoryResponse, EntityOriginInfo,
    EntitySearchRequest, EntitySearchResponse, EntitySearchResult, EntityStore, EntityVersionInfo,
    ReadEntityRequest, ReferenceRequest, WriteEntityRequest, WriteEntityResponse, WriteStatus,
};
use crate::ctx::RequestContext;
use crate::error::{EntityError, Result};
use crate::folders;
use crate::identity;
use crate::kind::{KindRegistry, STANDARD_KIND_FOLDER};
use crate::meta::ResourceMetadata;
use crate::resolver::ReferenceResolver;
use crate::summary::{SummarySupport, slugify, summary_from_projections};

const DEFAULT_SEARCH_LIMIT: i64 = 100;

pub struct SqlEntityServer {
    db: DatabaseConnection,
    dialect: Dialect,
    kinds: Arc<KindRegistry>,
    resolver: Arc<dyn ReferenceResolver>,
}

impl SqlEntityServer {
    pub fn new(
        db: &EntityDb,
        kinds: Arc<KindRegistry>,
        resolver: Arc<dyn ReferenceResolver>,
    ) -> Self {
        Self {
            db: db.connection().clone(),
            dialect: db.dialect(),
            kinds,
            resolver,
        }
    }

    /// Scope the GRN to the authenticated tenant and check the
    /// identifier rules. A zero tenant adopts the caller's; an explicit
    /// mismatch is rejected.
    fn validate_grn(&self, ctx: &RequestContext, grn: Option<&Grn>) -> Result<Grn> {
        let mut grn = grn
            .ok_or_else(|| EntityError::InvalidInput("missing GRN".to_string()))?
            .clone();
        let user = ctx.user()?;
        if grn.tenant_id == 0 {
            grn.tenant_id = user.tenant_id;
        } else if grn.tenant_id != user.tenant_id {
            return Err(EntityError::InvalidInput(
                "tenant id does not match the authenticated user".to_string(),
            ));
        }
        grn.validate_resource()?;
        Ok(grn)
    }

    fn read_fields(r: &ReadEntityRequest) -> Vec<&'static str> {
        let mut fields = vec![
            "guid",
            "tenant_id",
            "kind",
            "uid",
            "folder",
            "version",
            "size",
            "etag",
            "errors",
            "created_at",
            "created_by",
            "updated_at",
            "updated_by",
            "origin",
            "origin_key",
            "origin_ts",
        ];
        if r.with_body {
            fields.push("body");
        }
        if r.with_meta {
            fields.push("meta");
        }
        if r.with_summary {
            fields.extend(["name", "slug", "description", "labels", "fields"]);
        }
        fields
    }

    fn read_select(&self, r: &ReadEntityRequest) -> String {
        let quoted: Vec<String> = Self::read_fields(r)
            .iter()
            .map(|f| self.dialect.quote(f))
            .collect();
        format!("SELECT {} FROM entity WHERE ", quoted.join(","))
    }

    fn row_to_entity(&self, row: &QueryResult, r: &ReadEntityRequest) -> Result<Entity> {
        let mut entity = Entity {
            guid: row.try_get_by_index(0)?,
            folder: row.try_get_by_index(4)?,
            version: row.try_get_by_index(5)?,
            size: row.try_get_by_index(6)?,
            etag: row.try_get_by_index(7)?,
            created_at: row.try_get_by_index(9)?,
            created_by: row.try_get_by_index(10)?,
            updated_at: row.try_get_by_index(11)?,
            updated_by: row.try_get_by_index(12)?,
            ..Default::default()
        };
        entity.grn = Some(Grn {
            tenant_id: row.try_get_by_index(1)?,
            resource_group: String::new(),
            resource_kind: row.try_get_by_index(2)?,
            resource_identifier: row.try_get_by_index(3)?,
        });
        let errors: Option<String> = row.try_get_by_index(8)?;

        let origin_source: String = row.try_get_by_index(13)?;
        if !origin_source.is_empty() {
            entity.origin = Some(EntityOriginInfo {
                source: origin_source,
                key: row.try_get_by_index(14)?,
                time: row.try_get_by_index(15)?,
            });
        }

        let mut idx = 16;
        if r.with_body {
            entity.body = row.try_get_by_index(idx)?;
            idx += 1;
        }
        if r.with_meta {
            entity.meta = row.try_get_by_index(idx)?;
            idx += 1;
        }

        if r.with_summary || errors.is_some() {
            let (name, slug, description, labels, fields) = if r.with_summary {
                (
                    row.try_get_by_index(idx)?,
                    row.try_get_by_index(idx + 1)?,
                    row.try_get_by_index(idx + 2)?,
                    row.try_get_by_index(idx + 3)?,
                    row.try_get_by_index(idx + 4)?,
                )
            } else {
                (String::new(), String::new(), None, None, None)
            };
            let summary = summary_from_projections(name, slug, description, labels, fields, errors)?;
            entity.summary_json = Some(serde_json::to_vec(&summary)?);
        }

        Ok(entity)
    }

    async fn read_from_history(&self, ctx: &RequestContext, r: ReadEntityRequest) -> Result<Entity> {
        let grn = self.validate_grn(ctx, r.grn.as_ref())?;

        let stmt = self.dialect.statement(
            "SELECT guid,body,size,etag,version,created_at,created_by,updated_at,updated_by \
             FROM entity_history \
             WHERE (tenant_id=? AND kind=? AND uid=? AND version=?)"
                .to_string(),
            vec![
                grn.tenant_id.into(),
                grn.resource_kind.as_str().into(),
                grn.resource_identifier.as_str().into(),
                r.version.as_str().into(),
            ],
        );

        let Some(row) = self.db.query_one(stmt).await? else {
            // Version or key not found
            return Ok(Entity::default());
        };

        let mut entity = Entity {
            guid: row.try_get_by_index(0)?,
            body: row.try_get_by_index(1)?,
            size: row.try_get_by_index(2)?,
            etag: row.try_get_by_index(3)?,
            version: row.try_get_by_index(4)?,
            created_at: row.try_get_by_index(5)?,
            created_by: row.try_get_by_index(6)?,
            updated_at: row.try_get_by_index(7)?,
            updated_by: row.try_get_by_index(8)?,
            ..Default::default()
        };

        // The history row carries no projections; rebuild the summary
        // from the historical body on demand.
        if r.with_summary {
            if let Some(builder) = self.kinds.get_summary_builder(&grn.resource_kind) {
                if let Some(body) = entity.body.clone() {
                    if let Ok((summary, normalised)) =
                        builder.build(&grn.resource_identifier, &body).await
                    {
                        entity.body = Some(normalised);
                        entity.summary_json = Some(serde_json::to_vec(&summary)?);
                    }
                }
            }
        }

        if !r.with_body {
            entity.body = None;
        }

        entity.grn = Some(grn);
        Ok(entity)
    }

    /// Read the current version row, locking it where the backend
    /// supports row locks, so concurrent writers to the same identity
    /// serialise here.
    async fn select_for_update(
        &self,
        txn: &DatabaseTransaction,
        grn: &Grn,
    ) -> Result<Option<EntityVersionInfo>> {
        let sql = format!(
            "SELECT guid,etag,version,created_at,created_by,updated_at,updated_by,size \
             FROM entity WHERE (tenant_id=? AND kind=? AND uid=?){}",
            self.dialect.for_update_clause()
        );
        let stmt = self.dialect.statement(
            sql,
            vec![
                grn.tenant_id.into(),
                grn.resource_kind.as_str().into(),
                grn.resource_identifier.as_str().into(),
            ],
        );

        let Some(row) = txn.query_one(stmt).await? else {
            return Ok(None);
        };
        Ok(Some(EntityVersionInfo {
            guid: row.try_get_by_index(0)?,
            etag: row.try_get_by_index(1)?,
            version: row.try_get_by_index(2)?,
            created_at: row.try_get_by_index(3)?,
            created_by: row.try_get_by_index(4)?,
            updated_at: row.try_get_by_index(5)?,
            updated_by: row.try_get_by_index(6)?,
            size: row.try_get_by_index(7)?,
            comment: String::new(),
        }))
    }

    /// Run the kind's summary builder and derive the slug.
    async fn prepare(
        &self,
        r: &AdminWriteEntityRequest,
        grn: &Grn,
    ) -> Result<(SummarySupport, Vec<u8>)> {
        let builder = self
            .kinds
            .get_summary_builder(&grn.resource_kind)
            .ok_or_else(|| EntityError::UnsupportedKind(grn.resource_kind.clone()))?;

        let (mut summary, body) = builder.build(&grn.resource_identifier, &r.body).await?;

        if summary.slug.is_empty() {
            let source = if summary.name.is_empty() {
                &grn.resource_identifier
            } else {
                &summary.name
            };
            summary.slug = slugify(source);
        }

        Ok((SummarySupport::new(summary)?, body))
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_prepared(
        &self,
        txn: &DatabaseTransaction,
        grn: &Grn,
        r: &AdminWriteEntityRequest,
        summary: &mut SummarySupport,
        body: &[u8],
        etag: &str,
        mut created_at: i64,
        mut created_by: String,
        updated_at: i64,
        updated_by: String,
        origin: &EntityOriginInfo,
        timestamp: i64,
    ) -> Result<WriteEntityResponse> {
        let mut is_update = false;

        let mut version_info = match self.select_for_update(txn, grn).await? {
            None => EntityVersionInfo::default(),
            Some(current) if r.clear_history => {
                // Optionally keep the original creation metadata
                if created_at < 1000 || created_by.is_empty() {
                    created_at = current.created_at;
                    created_by = current.created_by.clone();
                }
                self.delete_entity_rows(txn, &current.guid, grn).await?;
                EntityVersionInfo::default()
            }
            Some(current) if current.etag == etag => {
                // Same content; touch nothing.
                return Ok(WriteEntityResponse {
                    status: WriteStatus::Unchanged,
                    guid: current.guid.clone(),
                    entity: Some(current),
                    body: Vec::new(),
                    meta_json: r.meta.clone(),
                    status_json: Vec::new(),
                    summary_json: Vec::new(),
                });
            }
            Some(current) => {
                is_update = true;
                // Clear the derived rows; they are rebuilt below.
                for table in ["entity_labels", "entity_ref", "entity_nested"] {
                    txn.execute(self.dialect.statement(
                        format!("DELETE FROM {} WHERE guid=?", table),
                        vec![current.guid.as_str().into()],
                    ))
                    .await?;
                }
                current
            }
        };

        // Optimistic locking
        if !r.previous_version.is_empty() && r.previous_version != version_info.version {
            return Err(EntityError::OptimisticLock);
        }

        if version_info.guid.is_empty() {
            version_info.guid = identity::new_guid();
        }
        version_info.comment = r.comment.clone();
        version_info.version = identity::next_version(&version_info.version);
        version_info.size = body.len() as i64;
        version_info.etag = etag.to_string();
        version_info.updated_at = updated_at;
        version_info.updated_by = updated_by.clone();

        if !is_update {
            if created_at < 1000 {
                created_at = updated_at;
            }
            if created_by.is_empty() {
                created_by = updated_by.clone();
            }
            version_info.created_at = created_at;
            version_info.created_by = created_by.clone();
        }

        // The history insert is the commit point of the new version.
        let stmt = self.dialect.insert_query(
            "entity_history",
            &[
                ("guid", version_info.guid.as_str().into()),
                ("version", version_info.version.as_str().into()),
                ("tenant_id", grn.tenant_id.into()),
                ("kind", grn.resource_kind.as_str().into()),
                ("uid", grn.resource_identifier.as_str().into()),
                ("folder", r.folder.as_str().into()),
                ("size", version_info.size.into()),
                ("body", bytes_value(body)),
                ("etag", version_info.etag.as_str().into()),
                ("message", version_info.comment.as_str().into()),
                ("created_at", version_info.created_at.into()),
                ("created_by", version_info.created_by.as_str().into()),
                ("updated_at", version_info.updated_at.into()),
                ("updated_by", version_info.updated_by.as_str().into()),
            ],
        );
        txn.execute(stmt).await?;

        // Rebuild the persisted meta document.
        let mut meta: ResourceMetadata = if r.meta.is_empty() {
            ResourceMetadata::default()
        } else {
            serde_json::from_slice(&r.meta)
                .map_err(|e| EntityError::InvalidInput(format!("invalid meta document: {}", e)))?
        };
        meta.name = grn.resource_identifier.clone();
        meta.namespace = grn::tenant_namespace(grn.tenant_id);
        if meta.uid.is_empty() {
            meta.uid = version_info.guid.clone();
        }
        meta.resource_version = version_info.version.clone();
        meta.set_folder(&r.folder);
        let creation_ms = if is_update {
            version_info.created_at
        } else {
            created_at
        };
        if creation_ms > 0 {
            meta.creation_timestamp = Some(creation_ms);
        }
        meta.set_updated_timestamp(updated_at);
        if !origin.source.is_empty() || !origin.key.is_empty() || origin.time > 0 {
            meta.set_origin_info(origin);
        }

        // Labels from the meta document are merged over the summary's.
        if !meta.labels.is_empty() {
            for (k, v) in &meta.labels {
                summary.model.labels.insert(k.clone(), v.clone());
            }
            summary.refresh_labels()?;
        }
        let meta_json = serde_json::to_vec(&meta)?;

        let shared_columns: Vec<(&str, Value)> = vec![
            ("folder", r.folder.as_str().into()),
            ("slug", summary.model.slug.as_str().into()),
            ("updated_at", version_info.updated_at.into()),
            ("updated_by", version_info.updated_by.as_str().into()),
            ("body", bytes_value(body)),
            ("meta", bytes_value(&meta_json)),
            ("status", bytes_value(&r.status)),
            ("size", version_info.size.into()),
            ("etag", version_info.etag.as_str().into()),
            ("version", version_info.version.as_str().into()),
            ("name", summary.model.name.as_str().into()),
            ("description", summary.model.description.as_str().into()),
            ("labels", opt_str_value(&summary.labels)),
            ("fields", opt_str_value(&summary.fields)),
            ("errors", opt_str_value(&summary.errors)),
            ("origin", origin.source.as_str().into()),
            ("origin_key", origin.key.as_str().into()),
            ("origin_ts", timestamp.into()),
        ];

        let status = if is_update {
            let stmt = self.dialect.update_query(
                "entity",
                &shared_columns,
                &[("guid", version_info.guid.as_str().into())],
            );
            txn.execute(stmt).await?;
            WriteStatus::Updated
        } else {
            let mut columns: Vec<(&str, Value)> = vec![
                // below are only set at creation
                ("guid", version_info.guid.as_str().into()),
                ("tenant_id", grn.tenant_id.into()),
                ("kind", grn.resource_kind.as_str().into()),
                ("uid", grn.resource_identifier.as_str().into()),
                ("created_at", version_info.created_at.into()),
                ("created_by", version_info.created_by.as_str().into()),
            ];
            columns.extend(shared_columns);
            txn.execute(self.dialect.insert_query("entity", &columns))
                .await?;
            WriteStatus::Created
        };

        if grn.resource_kind == STANDARD_KIND_FOLDER {
            folders::update_folder_tree(txn, &self.dialect, grn.tenant_id).await?;
        }

        summary.folder = r.folder.clone();
        summary.parent_grn = Some(grn.clone());
        self.write_search_info(
            txn,
            version_info.guid.clone(),
            version_info.guid.clone(),
            summary.clone(),
        )
        .await?;

        Ok(WriteEntityResponse {
            status,
            guid: version_info.guid.clone(),
            entity: Some(version_info),
            body: Vec::new(),
            meta_json,
            status_json: Vec::new(),
            summary_json: Vec::new(),
        })
    }

    /// Insert the derived index rows for one summary and, recursively,
    /// for each nested child it emits.
    ///
    /// `owner_guid` is the top-level entity row every derived row
    /// cascades from; `index_guid` is what the label/ref rows carry in
    /// their guid column — the owner's guid at the top level, the
    /// child's GRN string below it.
    fn write_search_info<'a>(
        &'a self,
        txn: &'a DatabaseTransaction,
        owner_guid: String,
        index_guid: String,
        summary: SummarySupport,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let parent_grn = summary.parent_grn_string();

            for (label, value) in &summary.model.labels {
                let stmt = self.dialect.insert_query(
                    "entity_labels",
                    &[
                        ("guid", index_guid.as_str().into()),
                        ("label", label.as_str().into()),
                        ("value", value.as_str().into()),
                        ("parent_grn", parent_grn.as_str().into()),
                    ],
                );
                txn.execute(stmt).await?;
            }

            for reference in &summary.model.references {
                let resolved = self.resolver.resolve(reference).await?;
                let stmt = self.dialect.insert_query(
                    "entity_ref",
                    &[
                        ("guid", index_guid.as_str().into()),
                        ("parent_grn", parent_grn.as_str().into()),
                        ("family", reference.family.as_str().into()),
                        ("type", reference.ref_type.as_str().into()),
                        ("id", reference.identifier.as_str().into()),
                        ("resolved_ok", resolved.ok.into()),
                        ("resolved_to", resolved.key.as_str().into()),
                        ("resolved_warning", resolved.warning.as_str().into()),
                        ("resolved_time", resolved.timestamp.into()),
                    ],
                );
                txn.execute(stmt).await?;
            }

            let parent = match &summary.parent_grn {
                Some(parent) => parent.clone(),
                None if summary.model.nested.is_empty() => return Ok(()),
                None => {
                    return Err(EntityError::InvalidInput(
                        "nested summary without a parent GRN".to_string(),
                    ));
                }
            };

            for child_model in &summary.model.nested {
                let child_grn = Grn::new(parent.tenant_id, &child_model.kind, &child_model.uid);
                let child_grn_str = child_grn.to_grn_string();

                let mut child = SummarySupport::new(child_model.clone())?;
                child.is_nested = true;
                child.folder = summary.folder.clone();
                child.parent_grn = Some(parent.clone());
                let child_parent_grn = child.parent_grn_string();

                let stmt = self.dialect.insert_query(
                    "entity_nested",
                    &[
                        ("grn", child_grn_str.as_str().into()),
                        ("guid", owner_guid.as_str().into()),
                        ("parent_grn", child_parent_grn.as_str().into()),
                        ("tenant_id", child_grn.tenant_id.into()),
                        ("kind", child_model.kind.as_str().into()),
                        ("uid", child_model.uid.as_str().into()),
                        ("folder", child.folder.as_str().into()),
                        ("name", child.model.name.as_str().into()),
                        ("slug", child.model.slug.as_str().into()),
                        ("description", child.model.description.as_str().into()),
                        ("labels", opt_str_value(&child.labels)),
                        ("fields", opt_str_value(&child.fields)),
                        ("errors", opt_str_value(&child.errors)),
                    ],
                );
                txn.execute(stmt).await?;

                self.write_search_info(txn, owner_guid.clone(), child_grn_str, child)
                    .await?;
            }

            Ok(())
        })
    }

    /// Remove the entity row, its whole history chain and every derived
    /// row, then fix the folder tree if a folder went away.
    async fn delete_entity_rows(
        &self,
        txn: &DatabaseTransaction,
        guid: &str,
        grn: &Grn,
    ) -> Result<()> {
        for table in [
            "entity",
            "entity_history",
            "entity_labels",
            "entity_ref",
            "entity_nested",
        ] {
            txn.execute(self.dialect.statement(
                format!("DELETE FROM {} WHERE guid=?", table),
                vec![guid.into()],
            ))
            .await?;
        }

        if grn.resource_kind == STANDARD_KIND_FOLDER {
            folders::update_folder_tree(txn, &self.dialect, grn.tenant_id).await?;
        }
        Ok(())
    }

    fn row_to_search_result(
        &self,
        row: &QueryResult,
        with_body: bool,
        with_labels: bool,
        with_fields: bool,
    ) -> Result<EntitySearchResult> {
        let mut result = EntitySearchResult {
            guid: row.try_get_by_index(0)?,
            version: row.try_get_by_index(4)?,
            folder: row.try_get_by_index(5)?,
            slug: row.try_get_by_index(6)?,
            size: row.try_get_by_index(8)?,
            updated_at: row.try_get_by_index(9)?,
            updated_by: row.try_get_by_index(10)?,
            name: row.try_get_by_index(11)?,
            ..Default::default()
        };
        result.grn = Some(Grn {
            tenant_id: row.try_get_by_index(1)?,
            resource_group: String::new(),
            resource_kind: row.try_get_by_index(2)?,
            resource_identifier: row.try_get_by_index(3)?,
        });
        let errors: Option<String> = row.try_get_by_index(7)?;
        let description: Option<String> = row.try_get_by_index(12)?;

        let mut idx = 13;
        if with_body {
            result.body = row.try_get_by_index(idx)?;
            result.meta = row.try_get_by_index(idx + 1)?;
            result.status = row.try_get_by_index(idx + 2)?;
            idx += 3;
        }
        if with_labels {
            let labels: Option<String> = row.try_get_by_index(idx)?;
            if let Some(labels) = labels {
                result.labels = serde_json::from_str(&labels)?;
            }
            idx += 1;
        }
        if with_fields {
            let fields: Option<String> = row.try_get_by_index(idx)?;
            result.fields_json = fields.map(String::into_bytes);
        }

        result.description = description.unwrap_or_default();
        result.error_json = errors.map(String::into_bytes);
        Ok(result)
    }
}

#[async_trait]
impl EntityStore for SqlEntityServer {
    async fn read(&self, ctx: &RequestContext, r: ReadEntityRequest) -> Result<Entity> {
        if !r.version.is_empty() {
            return self.read_from_history(ctx, r).await;
        }
        let grn = self.validate_grn(ctx, r.grn.as_ref())?;

        let sql = self.read_select(&r) + "(tenant_id=? AND kind=? AND uid=?)";
        let stmt = self.dialect.statement(
            sql,
            vec![
                grn.tenant_id.into(),
                grn.resource_kind.as_str().into(),
                grn.resource_identifier.as_str().into(),
            ],
        );

        match self.db.query_one(stmt).await? {
            None => Ok(Entity::default()),
            Some(row) => self.row_to_entity(&row, &r),
        }
    }

    async fn batch_read(
        &self,
        ctx: &RequestContext,
        r: BatchReadEntityRequest,
    ) -> Result<BatchReadEntityResponse> {
        let Some(first) = r.batch.first() else {
            return Err(EntityError::InvalidInput("missing queries".to_string()));
        };

        let mut constraints = Vec::with_capacity(r.batch.len());
        let mut args: Vec<Value> = Vec::with_capacity(r.batch.len() * 3);
        let mut request_order = Vec::with_capacity(r.batch.len());

        for req in &r.batch {
            if req.with_body != first.with_body
                || req.with_meta != first.with_meta
                || req.with_summary != first.with_summary
            {
                return Err(EntityError::InvalidInput(
                    "batch requests must ask for the same projections".to_string(),
                ));
            }
            if !req.version.is_empty() {
                return Err(EntityError::Unimplemented("version in batch read"));
            }

            let grn = self.validate_grn(ctx, req.grn.as_ref())?;
            constraints.push("(tenant_id=? AND kind=? AND uid=?)");
            args.extend([
                grn.tenant_id.into(),
                grn.resource_kind.as_str().into(),
                grn.resource_identifier.as_str().into(),
            ]);
            request_order.push((
                grn.tenant_id,
                grn.resource_kind.clone(),
                grn.resource_identifier.clone(),
            ));
        }

        let sql = self.read_select(first) + "(" + &constraints.join(" OR ") + ")";
        let rows = self.db.query_all(self.dialect.statement(sql, args)).await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in &rows {
            let entity = self.row_to_entity(row, first)?;
            if let Some(grn) = &entity.grn {
                found.insert(
                    (
                        grn.tenant_id,
                        grn.resource_kind.clone(),
                        grn.resource_identifier.clone(),
                    ),
                    entity,
                );
            }
        }

        // Results come back in request order, missing rows as empties.
        let results = request_order
            .iter()
            .map(|key| found.remove(key).unwrap_or_default())
            .collect();
        Ok(BatchReadEntityResponse { results })
    }

    async fn write(
        &self,
        ctx: &RequestContext,
        r: WriteEntityRequest,
    ) -> Result<WriteEntityResponse> {
        self.admin_write(ctx, r.into()).await
    }

    async fn admin_write(
        &self,
        ctx: &RequestContext,
        r: AdminWriteEntityRequest,
    ) -> Result<WriteEntityResponse> {
        let grn = self.validate_grn(ctx, r.grn.as_ref())?;

        let timestamp = Utc::now().timestamp_millis();
        let created_at = r.created_at;
        let created_by = r.created_by.clone();
        let mut updated_at = r.updated_at;
        let mut updated_by = r.updated_by.clone();
        if updated_by.is_empty() {
            updated_by = ctx.user()?.user_id.clone();
        }
        if updated_at < 1000 {
            updated_at = timestamp;
        }

        let (mut summary, body) = self.prepare(&r, &grn).await?;
        let etag = identity::content_etag(&body, &r.meta, &r.status);
        let origin = r.origin.clone().unwrap_or_default();

        let txn = self.db.begin().await?;
        let result = self
            .write_prepared(
                &txn, &grn, &r, &mut summary, &body, &etag, created_at, created_by, updated_at,
                updated_by, &origin, timestamp,
            )
            .await;

        match result {
            Ok(mut rsp) => {
                txn.commit().await?;
                debug!(grn = %grn, status = ?rsp.status, "wrote entity");
                rsp.body = body;
                rsp.status_json = r.status;
                rsp.summary_json = summary.marshaled.clone();
                Ok(rsp)
            }
            Err(e) => {
                error!("error writing entity {}: {}", grn, e);
                txn.rollback().await?;
                Err(e)
            }
        }
    }

    async fn delete(
        &self,
        ctx: &RequestContext,
        r: DeleteEntityRequest,
    ) -> Result<DeleteEntityResponse> {
        let grn = self.validate_grn(ctx, r.grn.as_ref())?;

        let txn = self.db.begin().await?;
        let result: Result<DeleteEntityResponse> = async {
            let Some(current) = self.select_for_update(&txn, &grn).await? else {
                return Ok(DeleteEntityResponse { ok: false });
            };
            if !r.previous_version.is_empty() && r.previous_version != current.version {
                return Err(EntityError::OptimisticLock);
            }
            self.delete_entity_rows(&txn, &current.guid, &grn).await?;
            Ok(DeleteEntityResponse { ok: true })
        }
        .await;

        match result {
            Ok(rsp) => {
                txn.commit().await?;
                Ok(rsp)
            }
            Err(e) => {
                error!("error deleting entity {}: {}", grn, e);
                txn.rollback().await?;
                Err(e)
            }
        }
    }

    async fn history(
        &self,
        ctx: &RequestContext,
        r: EntityHistoryRequest,
    ) -> Result<EntityHistoryResponse> {
        let grn = self.validate_grn(ctx, r.grn.as_ref())?;

        if !r.next_page_token.is_empty() {
            return Err(EntityError::Unimplemented("history pagination"));
        }

        let stmt = self.dialect.statement(
            "SELECT guid,version,size,etag,updated_at,updated_by,message \
             FROM entity_history \
             WHERE (tenant_id=? AND kind=? AND uid=?) \
             ORDER BY updated_at DESC, version DESC \
             LIMIT 100"
                .to_string(),
            vec![
                grn.tenant_id.into(),
                grn.resource_kind.as_str().into(),
                grn.resource_identifier.as_str().into(),
            ],
        );

        let rows = self.db.query_all(stmt).await?;
        let mut versions = Vec::with_capacity(rows.len());
        for row in rows {
            let message: Option<String> = row.try_get_by_index(6)?;
            versions.push(EntityVersionInfo {
                guid: row.try_get_by_index(0)?,
                version: row.try_get_by_index(1)?,
                size: row.try_get_by_index(2)?,
                etag: row.try_get_by_index(3)?,
                updated_at: row.try_get_by_index(4)?,
                updated_by: row.try_get_by_index(5)?,
                comment: message.unwrap_or_default(),
                ..Default::default()
            });
        }

        Ok(EntityHistoryResponse {
            grn: Some(grn),
            versions,
            next_page_token: String::new(),
        })
    }

    /// List entities of the caller's tenant. Results are always ordered
    /// by guid ascending so the keyset page token stays valid from the
    /// first page on; a missing limit defaults to 100.
    async fn search(
        &self,
        ctx: &RequestContext,
        r: EntitySearchRequest,
    ) -> Result<EntitySearchResponse> {
        let user = ctx.user()?;

        if !r.sort.is_empty() {
            return Err(EntityError::Unimplemented("sorted search"));
        }

        let mut fields = vec![
            "guid",
            "tenant_id",
            "kind",
            "uid",
            "version",
            "folder",
            "slug",
            "errors",
            "size",
            "updated_at",
            "updated_by",
            "name",
            "description",
        ];
        if r.with_body {
            fields.extend(["body", "meta", "status"]);
        }
        if r.with_labels {
            fields.push("labels");
        }
        if r.with_fields {
            fields.push("fields");
        }

        let limit = if r.limit > 0 {
            r.limit
        } else {
            DEFAULT_SEARCH_LIMIT
        };

        let mut query = SelectQuery::new(self.dialect, "entity");
        query.fields(&fields).add_where("tenant_id", user.tenant_id);

        if !r.kind.is_empty() {
            query.add_where_in("kind", r.kind.iter().map(|k| k.as_str().into()).collect());
        }

        // Folder uid
        if !r.folder.is_empty() {
            query.add_where("folder", r.folder.as_str());
        }

        if !r.next_page_token.is_empty() {
            query.add_where_gt("guid", r.next_page_token.as_str());
        }

        if !r.labels.is_empty() {
            let mut pairs: Vec<(&String, &String)> = r.labels.iter().collect();
            pairs.sort();
            let mut conditions = Vec::with_capacity(pairs.len());
            let mut args: Vec<Value> = Vec::with_capacity(pairs.len() * 2 + 1);
            for (label, value) in pairs {
                conditions.push("(label = ? AND value = ?)");
                args.push(label.as_str().into());
                args.push(value.as_str().into());
            }
            let subquery = format!(
                "SELECT guid FROM entity_labels WHERE ({}) GROUP BY guid HAVING COUNT(label) = ?",
                conditions.join(" OR ")
            );
            args.push((r.labels.len() as i64).into());
            query.add_where_in_subquery("guid", &subquery, args);
        }

        query.order_by_asc("guid").limit(limit, true);

        let rows = self.db.query_all(query.to_statement()).await?;
        let mut rsp = EntitySearchResponse::default();
        for row in rows {
            // The probe row past the limit only proves a next page.
            if rsp.results.len() as i64 >= limit {
                rsp.next_page_token = rsp
                    .results
                    .last()
                    .map(|result| result.guid.clone())
                    .unwrap_or_default();
                break;
            }
            rsp.results.push(self.row_to_search_result(
                &row,
                r.with_body,
                r.with_labels,
                r.with_fields,
            )?);
        }
        Ok(rsp)
    }

    /// Entities whose summary emitted a resolved reference to the
    /// target. Results are not tenant scoped yet.
    async fn find_references(
        &self,
        ctx: &RequestContext,
        r: ReferenceRequest,
    ) -> Result<EntitySearchResponse> {
        ctx.user()?;

        let fields = [
            "guid",
            "tenant_id",
            "kind",
            "uid",
            "version",
            "folder",
            "slug",
            "errors",
            "size",
            "updated_at",
            "updated_by",
            "name",
            "description",
            "meta",
        ];
        let columns: Vec<String> = fields.iter().map(|f| format!("entity.{}", f)).collect();
        let sql = format!(
            "SELECT {} FROM entity_ref JOIN entity ON entity_ref.guid = entity.guid \
             WHERE (family=? AND resolved_to=?)",
            columns.join(",")
        );
        let stmt = self
            .dialect
            .statement(sql, vec![r.kind.as_str().into(), r.uid.as_str().into()]);

        let rows = self.db.query_all(stmt).await?;
        let mut rsp = EntitySearchResponse::default();
        for row in rows {
            let mut result = self.row_to_search_result(&row, false, false, false)?;
            result.meta = row.try_get_by_index(13)?;
            rsp.results.push(result);
        }
        Ok(rsp)
    }

    async fn watch(&self, _ctx: &RequestContext) -> Result<()> {
        Err(EntityError::Unimplemented("watch"))
    }
}

fn bytes_value(bytes: &[u8]) -> Value {
    Value::Bytes(Some(Box::new(bytes.to_vec())))
}

fn opt_str_value(value: &Option<String>) -> Value {
    Value::String(value.clone().map(Box::new))
}

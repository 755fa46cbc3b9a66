//! Transport-agnostic request and response types, and the remote
//! interface of the entity store. Any RPC binding can wrap these; they
//! are all serde-serialisable.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use grn::Grn;

use crate::ctx::RequestContext;
use crate::error::Result;

/// Provenance of an imported entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityOriginInfo {
    pub source: String,
    pub key: String,
    /// Millisecond epoch, zero when unknown.
    pub time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Entity {
    pub guid: String,
    pub grn: Option<Grn>,
    pub folder: String,
    pub version: String,
    pub size: i64,
    pub etag: String,
    pub body: Option<Vec<u8>>,
    pub meta: Option<Vec<u8>>,
    pub status: Option<Vec<u8>>,
    pub summary_json: Option<Vec<u8>>,
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: i64,
    pub updated_by: String,
    pub origin: Option<EntityOriginInfo>,
}

impl Entity {
    /// Missing rows read as this rather than an error.
    pub fn is_empty(&self) -> bool {
        self.guid.is_empty() && self.version.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityVersionInfo {
    pub guid: String,
    pub version: String,
    pub size: i64,
    pub etag: String,
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: i64,
    pub updated_by: String,
    pub comment: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadEntityRequest {
    pub grn: Option<Grn>,
    /// When set, the read is served from history.
    pub version: String,
    pub with_body: bool,
    pub with_meta: bool,
    pub with_summary: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReadEntityRequest {
    pub batch: Vec<ReadEntityRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReadEntityResponse {
    pub results: Vec<Entity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WriteEntityRequest {
    pub grn: Option<Grn>,
    pub folder: String,
    pub body: Vec<u8>,
    pub meta: Vec<u8>,
    pub status: Vec<u8>,
    /// Optimistic concurrency check against the stored version.
    pub previous_version: String,
    pub comment: String,
}

/// Write with provenance control: import paths may pin creation and
/// update metadata, set the origin triple, or clear history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdminWriteEntityRequest {
    pub grn: Option<Grn>,
    pub folder: String,
    pub body: Vec<u8>,
    pub meta: Vec<u8>,
    pub status: Vec<u8>,
    pub previous_version: String,
    pub comment: String,
    pub created_at: i64,
    pub created_by: String,
    pub updated_at: i64,
    pub updated_by: String,
    pub origin: Option<EntityOriginInfo>,
    /// Delete the current entity and every derived row first, fusing a
    /// delete and a create in one transaction.
    pub clear_history: bool,
}

impl From<WriteEntityRequest> for AdminWriteEntityRequest {
    fn from(r: WriteEntityRequest) -> Self {
        Self {
            grn: r.grn,
            folder: r.folder,
            body: r.body,
            meta: r.meta,
            status: r.status,
            previous_version: r.previous_version,
            comment: r.comment,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteStatus {
    Created,
    Updated,
    Unchanged,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteEntityResponse {
    pub status: WriteStatus,
    pub guid: String,
    pub entity: Option<EntityVersionInfo>,
    pub body: Vec<u8>,
    pub meta_json: Vec<u8>,
    pub status_json: Vec<u8>,
    pub summary_json: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteEntityRequest {
    pub grn: Option<Grn>,
    pub previous_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteEntityResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityHistoryRequest {
    pub grn: Option<Grn>,
    pub next_page_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityHistoryResponse {
    pub grn: Option<Grn>,
    pub versions: Vec<EntityVersionInfo>,
    pub next_page_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntitySearchRequest {
    /// Kinds to include; empty means all.
    pub kind: Vec<String>,
    pub folder: String,
    /// Conjunctive label filter.
    pub labels: HashMap<String, String>,
    pub sort: Vec<String>,
    pub with_body: bool,
    pub with_labels: bool,
    pub with_fields: bool,
    pub next_page_token: String,
    pub limit: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntitySearchResult {
    pub guid: String,
    pub grn: Option<Grn>,
    pub name: String,
    pub description: String,
    pub slug: String,
    pub folder: String,
    pub version: String,
    pub size: i64,
    pub updated_at: i64,
    pub updated_by: String,
    pub body: Option<Vec<u8>>,
    pub meta: Option<Vec<u8>>,
    pub status: Option<Vec<u8>>,
    pub labels: HashMap<String, String>,
    pub fields_json: Option<Vec<u8>>,
    pub error_json: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntitySearchResponse {
    pub results: Vec<EntitySearchResult>,
    pub next_page_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReferenceRequest {
    /// Reference family, e.g. the referenced kind.
    pub kind: String,
    pub uid: String,
}

/// The remote interface of the entity store.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn read(&self, ctx: &RequestContext, r: ReadEntityRequest) -> Result<Entity>;

    async fn batch_read(
        &self,
        ctx: &RequestContext,
        r: BatchReadEntityRequest,
    ) -> Result<BatchReadEntityResponse>;

    async fn write(&self, ctx: &RequestContext, r: WriteEntityRequest)
        -> Result<WriteEntityResponse>;

    async fn admin_write(
        &self,
        ctx: &RequestContext,
        r: AdminWriteEntityRequest,
    ) -> Result<WriteEntityResponse>;

    async fn delete(
        &self,
        ctx: &RequestContext,
        r: DeleteEntityRequest,
    ) -> Result<DeleteEntityResponse>;

    async fn history(
        &self,
        ctx: &RequestContext,
        r: EntityHistoryRequest,
    ) -> Result<EntityHistoryResponse>;

    async fn search(
        &self,
        ctx: &RequestContext,
        r: EntitySearchRequest,
    ) -> Result<EntitySearchResponse>;

    async fn find_references(
        &self,
        ctx: &RequestContext,
        r: ReferenceRequest,
    ) -> Result<EntitySearchResponse>;

    /// Live change notification; not designed yet.
    async fn watch(&self, ctx: &RequestContext) -> Result<()>;
}

//! Kind registry and the summary builder contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Kind string of folder entities; writes and deletes of this kind
/// trigger the folder tree maintainer.
pub const STANDARD_KIND_FOLDER: &str = "folder";

/// Outbound reference emitted by a summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityExternalReference {
    pub family: String,
    #[serde(rename = "type")]
    pub ref_type: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntityErrorInfo {
    pub code: i64,
    pub message: String,
}

/// Structured projection of an entity body, produced by the kind's
/// summary builder. Drives every search index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntitySummary {
    pub uid: String,
    pub kind: String,
    pub name: String,
    pub description: String,
    pub slug: String,
    pub labels: HashMap<String, String>,
    pub fields: HashMap<String, serde_json::Value>,
    pub error: Option<EntityErrorInfo>,
    pub references: Vec<EntityExternalReference>,
    pub nested: Vec<EntitySummary>,
}

/// Parses the opaque body of one kind.
#[async_trait]
pub trait SummaryBuilder: Send + Sync {
    /// Returns the parsed summary and the normalised body (the builder
    /// may canonicalise or strip parts of the input).
    async fn build(&self, uid: &str, body: &[u8]) -> Result<(EntitySummary, Vec<u8>)>;
}

/// Explicit registry keyed by kind string; filled at startup and
/// read-only thereafter.
#[derive(Default)]
pub struct KindRegistry {
    builders: HashMap<String, Arc<dyn SummaryBuilder>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &str, builder: Arc<dyn SummaryBuilder>) {
        self.builders.insert(kind.to_string(), builder);
    }

    pub fn get_summary_builder(&self, kind: &str) -> Option<Arc<dyn SummaryBuilder>> {
        self.builders.get(kind).cloned()
    }
}

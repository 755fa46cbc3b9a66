//! The persisted meta document: a Kubernetes-style object-meta block
//! stored alongside the body and rebuilt on every write.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::api::EntityOriginInfo;

pub const ANNO_FOLDER: &str = "stash.app/folder";
pub const ANNO_UPDATED_TIMESTAMP: &str = "stash.app/updatedTimestamp";
pub const ANNO_ORIGIN_NAME: &str = "stash.app/originName";
pub const ANNO_ORIGIN_KEY: &str = "stash.app/originKey";
pub const ANNO_ORIGIN_TIMESTAMP: &str = "stash.app/originTimestamp";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    /// Millisecond epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ResourceMetadata {
    pub fn set_folder(&mut self, folder: &str) {
        if folder.is_empty() {
            self.annotations.remove(ANNO_FOLDER);
        } else {
            self.annotations
                .insert(ANNO_FOLDER.to_string(), folder.to_string());
        }
    }

    pub fn set_updated_timestamp(&mut self, millis: i64) {
        self.annotations
            .insert(ANNO_UPDATED_TIMESTAMP.to_string(), millis.to_string());
    }

    pub fn set_origin_info(&mut self, origin: &EntityOriginInfo) {
        self.annotations
            .insert(ANNO_ORIGIN_NAME.to_string(), origin.source.clone());
        self.annotations
            .insert(ANNO_ORIGIN_KEY.to_string(), origin.key.clone());
        if origin.time > 0 {
            self.annotations
                .insert(ANNO_ORIGIN_TIMESTAMP.to_string(), origin.time.to_string());
        }
    }
}

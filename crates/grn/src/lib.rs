//! Resource identity (GRN) and the external hierarchical key codec.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters that may not appear in a resource identifier.
const RESERVED_IDENTIFIER_CHARS: &[char] = &['/', '#', '$', '@', '?'];

/// Maximum length of a resource identifier.
pub const MAX_IDENTIFIER_LEN: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GrnError {
    #[error("invalid key (expecting 4 parts): {0}")]
    InvalidKey(String),

    #[error("invalid namespace, expected default|org-<n>|tenant-<n>: {0}")]
    InvalidNamespace(String),

    #[error("GRN missing resource kind")]
    MissingKind,

    #[error("GRN missing resource identifier")]
    MissingIdentifier,

    #[error("GRN resource identifier is too long (>{MAX_IDENTIFIER_LEN})")]
    IdentifierTooLong,

    #[error("invalid character in GRN resource identifier: {0:?}")]
    InvalidCharacter(char),
}

/// Tenant-scoped resource identity.
///
/// Serialises as a dotted path `tenant.group.kind.identifier`; derived
/// index rows store this form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grn {
    pub tenant_id: i64,
    pub resource_group: String,
    pub resource_kind: String,
    pub resource_identifier: String,
}

impl Grn {
    pub fn new(tenant_id: i64, kind: &str, identifier: &str) -> Self {
        Self {
            tenant_id,
            resource_group: String::new(),
            resource_kind: kind.to_string(),
            resource_identifier: identifier.to_string(),
        }
    }

    /// Canonical string form used by the derived index tables.
    pub fn to_grn_string(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.tenant_id, self.resource_group, self.resource_kind, self.resource_identifier
        )
    }

    /// Check the kind and identifier rules. Tenant checks belong to the
    /// caller, which knows the authenticated user.
    pub fn validate_resource(&self) -> Result<(), GrnError> {
        if self.resource_kind.is_empty() {
            return Err(GrnError::MissingKind);
        }
        if self.resource_identifier.is_empty() {
            return Err(GrnError::MissingIdentifier);
        }
        if self.resource_identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(GrnError::IdentifierTooLong);
        }
        if let Some(c) = self
            .resource_identifier
            .chars()
            .find(|c| RESERVED_IDENTIFIER_CHARS.contains(c))
        {
            return Err(GrnError::InvalidCharacter(c));
        }
        Ok(())
    }
}

impl std::fmt::Display for Grn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_grn_string())
    }
}

/// External hierarchical key: `/<group>/<kind plural>/<namespace>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl Key {
    /// Parse the five slash-separated parts (the leading one empty).
    pub fn parse(key: &str) -> Result<Self, GrnError> {
        let parts: Vec<&str> = key.split('/').collect();
        if parts.len() != 5 || !parts[0].is_empty() {
            return Err(GrnError::InvalidKey(key.to_string()));
        }
        Ok(Self {
            group: parts[1].to_string(),
            kind: parts[2].to_string(),
            namespace: parts[3].to_string(),
            name: parts[4].to_string(),
        })
    }

    /// Map the namespace to a tenant id: `default` is tenant 1,
    /// `org-<n>` and `tenant-<n>` parse the number.
    pub fn tenant_id(&self) -> Result<i64, GrnError> {
        if self.namespace == "default" {
            return Ok(1);
        }
        let (prefix, n) = self
            .namespace
            .split_once('-')
            .ok_or_else(|| GrnError::InvalidNamespace(self.namespace.clone()))?;
        if prefix != "org" && prefix != "tenant" {
            return Err(GrnError::InvalidNamespace(self.namespace.clone()));
        }
        n.parse::<i64>()
            .map_err(|_| GrnError::InvalidNamespace(self.namespace.clone()))
    }

    /// Translate to the internal tenant-scoped identity.
    ///
    /// The key carries the plural kind; the caller supplies the kind
    /// name the registry knows.
    pub fn to_grn(&self, kind_name: &str) -> Result<Grn, GrnError> {
        let grn = Grn {
            tenant_id: self.tenant_id()?,
            resource_group: self.group.clone(),
            resource_kind: kind_name.to_string(),
            resource_identifier: self.name.clone(),
        };
        grn.validate_resource()?;
        Ok(grn)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            self.group, self.kind, self.namespace, self.name
        )
    }
}

/// Reverse of [`Key::tenant_id`]: tenant 1 is the default namespace.
pub fn tenant_namespace(tenant_id: i64) -> String {
    if tenant_id == 1 {
        "default".to_string()
    } else {
        format!("tenant-{}", tenant_id)
    }
}

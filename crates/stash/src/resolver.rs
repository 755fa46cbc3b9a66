//! Outbound reference resolution contract.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;
use crate::kind::EntityExternalReference;

/// Verdict for one outbound reference.
#[derive(Debug, Clone, Default)]
pub struct ResolutionResult {
    pub ok: bool,
    /// Canonical key of the referenced object, when found.
    pub key: String,
    pub warning: String,
    /// Millisecond epoch of the resolution.
    pub timestamp: i64,
}

/// Validates a summary's outbound references. Called synchronously
/// inside the write transaction, so implementations must stay cheap.
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn resolve(&self, reference: &EntityExternalReference) -> Result<ResolutionResult>;
}

/// Resolver that accepts every reference without consulting anything.
pub struct NoopReferenceResolver;

#[async_trait]
impl ReferenceResolver for NoopReferenceResolver {
    async fn resolve(&self, reference: &EntityExternalReference) -> Result<ResolutionResult> {
        Ok(ResolutionResult {
            ok: true,
            key: reference.identifier.clone(),
            warning: String::new(),
            timestamp: Utc::now().timestamp_millis(),
        })
    }
}

//! Request-scoped caller identity.

use crate::error::{EntityError, Result};

/// The authenticated caller: the tenant every row is scoped to, plus a
/// stable user identifier string recorded on writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUser {
    pub tenant_id: i64,
    pub user_id: String,
}

/// Ambient context carried with every request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    user: Option<RequestUser>,
}

impl RequestContext {
    pub fn with_user(tenant_id: i64, user_id: impl Into<String>) -> Self {
        Self {
            user: Some(RequestUser {
                tenant_id,
                user_id: user_id.into(),
            }),
        }
    }

    pub fn anonymous() -> Self {
        Self { user: None }
    }

    pub fn user(&self) -> Result<&RequestUser> {
        self.user.as_ref().ok_or(EntityError::Unauthenticated)
    }
}

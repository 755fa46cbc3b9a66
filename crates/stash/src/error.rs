use thiserror::Error;

#[derive(Error, Debug)]
pub enum EntityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no user found in context")]
    Unauthenticated,

    #[error("not found")]
    NotFound,

    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),

    #[error("optimistic lock failed")]
    OptimisticLock,

    #[error("{0} not supported yet")]
    Unimplemented(&'static str),

    #[error("database error: {0}")]
    Backend(#[from] sea_orm::DbErr),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<grn::GrnError> for EntityError {
    fn from(e: grn::GrnError) -> Self {
        EntityError::InvalidInput(e.to_string())
    }
}

impl From<sea_orm::TryGetError> for EntityError {
    fn from(e: sea_orm::TryGetError) -> Self {
        EntityError::Backend(e.into())
    }
}

impl From<serde_json::Error> for EntityError {
    fn from(e: serde_json::Error) -> Self {
        EntityError::InvalidInput(format!("invalid json: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, EntityError>;

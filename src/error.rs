use thiserror::Error;

pub type DomainResult<T> = std::result::Result<T, DomainError>;

/// Errors raised by the workflow modules. Each variant maps to a stable
/// protocol error code via [`DomainError::code`].
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("login required")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    BadParams(String),

    #[error("invalid outcome: {0}")]
    InvalidOutcome(String),

    #[error("invalid level catalog: {0}")]
    InvalidCatalog(String),

    #[error("not eligible: {0}")]
    NotEligible(String),

    #[error("cannot {action} a request in status {from}")]
    InvalidTransition { from: String, action: String },

    /// The stored status moved between load and write.
    #[error("request {0} was modified concurrently")]
    Conflict(String),

    #[error("student already has an active request: {0}")]
    ActiveRequestExists(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::NotFound(_) => "not_found",
            DomainError::Unauthenticated => "unauthenticated",
            DomainError::Forbidden(_) => "forbidden",
            DomainError::BadParams(_) => "bad_params",
            DomainError::InvalidOutcome(_) => "invalid_outcome",
            DomainError::InvalidCatalog(_) => "invalid_catalog",
            DomainError::NotEligible(_) => "not_eligible",
            DomainError::InvalidTransition { .. } => "invalid_transition",
            DomainError::Conflict(_) => "conflict",
            DomainError::ActiveRequestExists(_) => "active_request_exists",
            DomainError::Db(_) => "db_query_failed",
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        DomainError::Forbidden(msg.into())
    }

    pub fn bad_params(msg: impl Into<String>) -> Self {
        DomainError::BadParams(msg.into())
    }
}

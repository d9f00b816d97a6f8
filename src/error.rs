use thiserror::Error;

/// Errors raised by the attendance engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid membership: {0}")]
    InvalidMembership(String),

    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock/counter store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Stable code carried in IPC error responses.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidSelection(_) => "invalid_selection",
            EngineError::InvalidBatch(_) => "invalid_batch",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidMembership(_) => "invalid_membership",
            EngineError::InvalidPeriod(_) => "invalid_period",
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Conflict(_) => "conflict",
            EngineError::Store(_) => "store_failed",
            EngineError::Db(_) => "db_query_failed",
            EngineError::Serialization(_) => "bad_payload",
        }
    }

    /// Whether a job that failed with this error may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(_) => true,
            EngineError::Db(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        match self {
            EngineError::Db(rusqlite::Error::SqliteFailure(e, _)) => {
                e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            }
            _ => false,
        }
    }
}

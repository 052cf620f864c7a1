use thiserror::Error;

/// Error kinds surfaced by the engine and the document service.
///
/// Diagnostics are safe to display verbatim: they never carry row ids,
/// owner ids, or server paths. "Not found" deliberately covers both a
/// missing row and a row the caller may not see.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("not found")]
    NotFound,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("ordering conflict: {0}")]
    Conflict(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("operation timed out")]
    Timeout,
}

impl From<rusqlite::Error> for VfsError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => VfsError::NotFound,
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                VfsError::Conflict(msg.unwrap_or_else(|| "constraint violation".to_string()))
            }
            other => VfsError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for VfsError {
    fn from(e: serde_json::Error) -> Self {
        VfsError::Database(e.to_string())
    }
}

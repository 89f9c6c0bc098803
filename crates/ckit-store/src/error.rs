use ckit_core::errors::ExecutionError;
use ckit_core::ids::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("Session {0} does not exist; it must be created before tool execution")]
    SessionMissing(SessionId),

    #[error("session {0} already exists")]
    AlreadyExists(SessionId),

    #[error("Session update failed: {0}")]
    UpdateFailed(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for ExecutionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionMissing(_) => ExecutionError::NotFound(e.to_string()),
            other => ExecutionError::Persistence(other.to_string()),
        }
    }
}

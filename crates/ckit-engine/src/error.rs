use ckit_core::schema::SchemaError;
use ckit_store::StoreError;

/// Failures while assembling the engine, before any request is served.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("invalid schema for tool '{tool}': {source}")]
    Schema {
        tool: String,
        #[source]
        source: SchemaError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

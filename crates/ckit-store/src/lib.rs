pub mod backend;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use backend::{MemoryBackend, SessionBackend, SqliteBackend};
pub use database::Database;
pub use error::StoreError;
pub use sessions::{SessionStore, SessionStoreConfig, SweeperHandle};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use ckit_core::ids::SessionId;
use ckit_core::session::SessionState;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Raw persistence for session records.
///
/// Backends are plain storage: they do not serialize writers or interpret
/// expiry beyond `delete_expired`. [`crate::SessionStore`] layers the
/// per-key locking on top.
pub trait SessionBackend: Send + Sync {
    fn load(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError>;

    /// Insert a new record; fails with `AlreadyExists` on id collision.
    fn insert(&self, state: &SessionState) -> Result<(), StoreError>;

    /// Insert or overwrite a record.
    fn save(&self, state: &SessionState) -> Result<(), StoreError>;

    fn delete(&self, id: &SessionId) -> Result<bool, StoreError>;

    /// All records, newest first.
    fn list(&self) -> Result<Vec<SessionState>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;

    /// Id of the least recently updated record.
    fn least_recent(&self) -> Result<Option<SessionId>, StoreError>;

    /// Remove records whose expiry is strictly before `now`.
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Epoch milliseconds, so SQL ordering matches time ordering for every
/// representable instant.
fn ts(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Sessions persisted as JSON documents in the `sessions` table.
pub struct SqliteBackend {
    db: Database,
}

impl SqliteBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl SessionBackend for SqliteBackend {
    fn load(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT state FROM sessions WHERE id = ?1")?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "sessions", "state")?;
                    Ok(Some(row_helpers::parse_json(&raw, "sessions", "state")?))
                }
                None => Ok(None),
            }
        })
    }

    fn insert(&self, state: &SessionState) -> Result<(), StoreError> {
        let doc = serde_json::to_string(state)?;
        self.db.with_conn(|conn| {
            let result = conn.execute(
                "INSERT INTO sessions (id, state, created_at, updated_at, ttl_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    state.session_id.as_str(),
                    doc,
                    ts(state.created_at),
                    ts(state.updated_at),
                    ts(state.ttl_expires_at),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::AlreadyExists(state.session_id.clone()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        let doc = serde_json::to_string(state)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, state, created_at, updated_at, ttl_expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    updated_at = excluded.updated_at,
                    ttl_expires_at = excluded.ttl_expires_at",
                rusqlite::params![
                    state.session_id.as_str(),
                    doc,
                    ts(state.created_at),
                    ts(state.updated_at),
                    ts(state.ttl_expires_at),
                ],
            )?;
            Ok(())
        })
    }

    fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(n > 0)
        })
    }

    fn list(&self) -> Result<Vec<SessionState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT state FROM sessions ORDER BY created_at DESC")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "sessions", "state")?;
                out.push(row_helpers::parse_json(&raw, "sessions", "state")?);
            }
            Ok(out)
        })
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    fn least_recent(&self) -> Result<Option<SessionId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM sessions ORDER BY updated_at ASC LIMIT 1")?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Ok(Some(SessionId::from_raw(row_helpers::get::<String>(
                    row, 0, "sessions", "id",
                )?))),
                None => Ok(None),
            }
        })
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM sessions WHERE ttl_expires_at < ?1",
                [ts(now)],
            )?;
            Ok(n)
        })
    }
}

/// Process-local backend for tests and session-less deployments.
#[derive(Default)]
pub struct MemoryBackend {
    sessions: DashMap<SessionId, SessionState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionBackend for MemoryBackend {
    fn load(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError> {
        Ok(self.sessions.get(id).map(|s| s.value().clone()))
    }

    fn insert(&self, state: &SessionState) -> Result<(), StoreError> {
        match self.sessions.entry(state.session_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(state.session_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
                Ok(())
            }
        }
    }

    fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        self.sessions.insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.sessions.remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<SessionState>, StoreError> {
        let mut all: Vec<SessionState> = self.sessions.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.sessions.len())
    }

    fn least_recent(&self) -> Result<Option<SessionId>, StoreError> {
        Ok(self
            .sessions
            .iter()
            .min_by_key(|s| s.value().updated_at)
            .map(|s| s.key().clone()))
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        Ok(before.saturating_sub(self.sessions.len()))
    }
}

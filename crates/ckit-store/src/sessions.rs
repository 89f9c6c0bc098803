use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use ckit_core::ids::SessionId;
use ckit_core::session::{SessionPatch, SessionState, SessionSummary, ToolExecution};

use crate::backend::{MemoryBackend, SessionBackend, SqliteBackend};
use crate::database::Database;
use crate::error::StoreError;

/// Oldest entries are dropped once a session's history reaches this length.
pub const HISTORY_LIMIT: usize = 100;

#[derive(Clone, Debug)]
pub struct SessionStoreConfig {
    /// Sliding expiry window applied on every successful write.
    pub ttl: Duration,
    /// Upper bound on live sessions; `0` disables eviction.
    pub max_sessions: usize,
    pub sweep_interval: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            max_sessions: 1000,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Linearizable session state on top of a [`SessionBackend`].
///
/// Writers to one session id are serialized through a per-key async mutex;
/// reads go straight to the backend and see the last committed snapshot.
/// Every mutation returns `Result`, and a backend fault during a write is
/// reported as [`StoreError::UpdateFailed`] carrying the underlying cause.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    config: SessionStoreConfig,
    locks: DashMap<SessionId, Arc<AsyncMutex<()>>>,
    create_lock: AsyncMutex<()>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>, config: SessionStoreConfig) -> Self {
        Self {
            backend,
            config,
            locks: DashMap::new(),
            create_lock: AsyncMutex::new(()),
        }
    }

    pub fn sqlite(db: Database, config: SessionStoreConfig) -> Self {
        Self::new(Arc::new(SqliteBackend::new(db)), config)
    }

    pub fn in_memory(config: SessionStoreConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), config)
    }

    pub fn config(&self) -> &SessionStoreConfig {
        &self.config
    }

    fn lock_for(&self, id: &SessionId) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop the key's mutex if nobody else holds a clone of it.
    fn release_lock(&self, id: &SessionId) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Create a session, generating an id when none is given.
    ///
    /// A live session with the same id is a collision. An expired record that
    /// has not been swept yet is replaced. Capacity eviction only happens once
    /// the new id is known to be free.
    #[instrument(skip(self), fields(session_id))]
    pub async fn create(&self, id: Option<SessionId>) -> Result<SessionState, StoreError> {
        let id = id.unwrap_or_default();
        tracing::Span::current().record("session_id", id.as_str());

        let _create = self.create_lock.lock().await;
        let lock = self.lock_for(&id);
        let created = {
            let _guard = lock.lock().await;
            self.create_locked(&id).await
        };
        drop(lock);
        self.release_lock(&id);

        let state = created?;
        debug!("session created");
        Ok(state)
    }

    async fn create_locked(&self, id: &SessionId) -> Result<SessionState, StoreError> {
        let now = Utc::now();
        match self.backend.load(id)? {
            Some(existing) if !existing.is_expired(now) => {
                Err(StoreError::AlreadyExists(id.clone()))
            }
            Some(_) => {
                debug!("replacing expired session record");
                let state = SessionState::new(id.clone(), now, self.config.ttl);
                self.backend.delete(id)?;
                self.backend.insert(&state)?;
                Ok(state)
            }
            None => {
                if self.config.max_sessions > 0
                    && self.backend.count()? >= self.config.max_sessions
                {
                    self.evict_least_recent().await?;
                }
                let state = SessionState::new(id.clone(), now, self.config.ttl);
                self.backend.insert(&state)?;
                Ok(state)
            }
        }
    }

    async fn evict_least_recent(&self) -> Result<(), StoreError> {
        let Some(victim) = self.backend.least_recent()? else {
            return Ok(());
        };
        let lock = self.lock_for(&victim);
        {
            let _guard = lock.lock().await;
            self.backend.delete(&victim)?;
        }
        drop(lock);
        self.release_lock(&victim);
        info!(session_id = %victim, "evicted least recently used session at capacity");
        Ok(())
    }

    /// Fetch a snapshot. Unknown and expired sessions both read as `None`.
    pub async fn get(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError> {
        let now = Utc::now();
        Ok(self.backend.load(id)?.filter(|s| !s.is_expired(now)))
    }

    /// Atomic read-modify-write of one session.
    ///
    /// The closure runs while the key's writer lock is held; keep it free of
    /// I/O and `.await` points.
    #[instrument(skip(self, f), fields(session_id = %id))]
    pub async fn modify<F>(&self, id: &SessionId, f: F) -> Result<SessionState, StoreError>
    where
        F: FnOnce(&mut SessionState),
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut state = self
            .backend
            .load(id)
            .map_err(|e| StoreError::UpdateFailed(e.to_string()))?
            .filter(|s| !s.is_expired(now))
            .ok_or_else(|| StoreError::SessionMissing(id.clone()))?;

        f(&mut state);
        state.touch(now, self.config.ttl);

        if let Err(e) = self.backend.save(&state) {
            warn!(error = %e, "session write rejected by backend");
            return Err(StoreError::UpdateFailed(e.to_string()));
        }
        Ok(state)
    }

    /// Replace the top-level fields named in `patch`.
    pub async fn update(
        &self,
        id: &SessionId,
        patch: SessionPatch,
    ) -> Result<SessionState, StoreError> {
        self.modify(id, |s| s.apply(patch)).await
    }

    /// Set `metadata.results[tool_name]`, leaving other tools' results intact.
    ///
    /// Without a session id this is a successful no-op.
    pub async fn store_tool_result(
        &self,
        id: Option<&SessionId>,
        tool_name: &str,
        value: Value,
    ) -> Result<Option<SessionState>, StoreError> {
        let Some(id) = id else {
            return Ok(None);
        };
        let state = self
            .modify(id, |s| {
                s.metadata.results.insert(tool_name.to_string(), value);
            })
            .await?;
        Ok(Some(state))
    }

    /// Store a result and append the run to the session history in one write.
    pub async fn record_execution(
        &self,
        id: &SessionId,
        value: Value,
        execution: ToolExecution,
    ) -> Result<SessionState, StoreError> {
        self.modify(id, |s| {
            s.metadata.results.insert(execution.tool.clone(), value);
            s.history.push(execution);
            if s.history.len() > HISTORY_LIMIT {
                let excess = s.history.len() - HISTORY_LIMIT;
                s.history.drain(..excess);
            }
        })
        .await
    }

    pub async fn complete_step(
        &self,
        id: &SessionId,
        step: &str,
    ) -> Result<SessionState, StoreError> {
        self.modify(id, |s| {
            s.completed_steps.insert(step.to_string());
        })
        .await
    }

    pub async fn add_label(&self, id: &SessionId, label: &str) -> Result<SessionState, StoreError> {
        self.modify(id, |s| {
            s.metadata.labels.insert(label.to_string());
        })
        .await
    }

    pub async fn remove_label(
        &self,
        id: &SessionId,
        label: &str,
    ) -> Result<SessionState, StoreError> {
        self.modify(id, |s| {
            s.metadata.labels.remove(label);
        })
        .await
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let lock = self.lock_for(id);
        let removed = {
            let _guard = lock.lock().await;
            self.backend.delete(id)?
        };
        drop(lock);
        self.release_lock(id);
        Ok(removed)
    }

    /// Live sessions, newest first.
    pub async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let now = Utc::now();
        Ok(self
            .backend
            .list()?
            .iter()
            .filter(|s| !s.is_expired(now))
            .map(SessionState::summary)
            .collect())
    }

    pub async fn sessions_by_label(&self, label: &str) -> Result<Vec<SessionSummary>, StoreError> {
        let now = Utc::now();
        Ok(self
            .backend
            .list()?
            .iter()
            .filter(|s| !s.is_expired(now) && s.metadata.labels.contains(label))
            .map(SessionState::summary)
            .collect())
    }

    /// Remove every expired session and prune idle writer locks.
    pub fn sweep_expired(&self) -> Result<usize, StoreError> {
        let removed = self.backend.delete_expired(Utc::now())?;
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(removed)
    }

    /// Run [`Self::sweep_expired`] on a fixed interval until the handle is stopped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let store = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match store.sweep_expired() {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "expired sessions swept"),
                            Err(e) => warn!(error = %e, "session sweep failed"),
                        }
                    }
                }
            }
            debug!("session sweeper stopped");
        });
        SweeperHandle { cancel, task }
    }
}

/// Stops the background sweep when asked (or when dropped).
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn store() -> SessionStore {
        SessionStore::in_memory(SessionStoreConfig::default())
    }

    /// Backend whose writes always fail, as a full disk would.
    struct FailingBackend {
        inner: MemoryBackend,
    }

    impl SessionBackend for FailingBackend {
        fn load(&self, id: &SessionId) -> Result<Option<SessionState>, StoreError> {
            self.inner.load(id)
        }
        fn insert(&self, state: &SessionState) -> Result<(), StoreError> {
            self.inner.insert(state)
        }
        fn save(&self, _state: &SessionState) -> Result<(), StoreError> {
            Err(StoreError::Io("disk full".into()))
        }
        fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
            self.inner.delete(id)
        }
        fn list(&self) -> Result<Vec<SessionState>, StoreError> {
            self.inner.list()
        }
        fn count(&self) -> Result<usize, StoreError> {
            self.inner.count()
        }
        fn least_recent(&self) -> Result<Option<SessionId>, StoreError> {
            self.inner.least_recent()
        }
        fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.delete_expired(now)
        }
    }

    #[tokio::test]
    async fn create_generates_id() {
        let store = store();
        let s = store.create(None).await.unwrap();
        assert!(s.session_id.as_str().starts_with("sess_"));
        assert!(store.get(&s.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_collision_fails() {
        let store = store();
        let id = SessionId::from_raw("fixed");
        store.create(Some(id.clone())).await.unwrap();
        let err = store.create(Some(id)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn get_unknown_is_none() {
        let store = store();
        assert!(store.get(&SessionId::from_raw("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_result_requires_existing_session() {
        let store = store();
        for raw in ["never-created", "sess_0000", ""] {
            let err = store
                .store_tool_result(Some(&SessionId::from_raw(raw)), "build-image", json!({}))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("does not exist"), "{raw}: {err}");
        }
        assert!(store.list().await.unwrap().is_empty(), "no implicit creation");
    }

    #[tokio::test]
    async fn store_result_without_session_is_noop() {
        let store = store();
        let out = store
            .store_tool_result(None, "build-image", json!({"imageId": "sha256:abc"}))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn results_are_isolated_per_tool() {
        let store = store();
        let id = store.create(None).await.unwrap().session_id;
        store
            .store_tool_result(Some(&id), "analyze", json!({"lang": "go"}))
            .await
            .unwrap();
        store
            .store_tool_result(Some(&id), "build-image", json!({"imageId": "sha256:abc"}))
            .await
            .unwrap();
        let s = store.get(&id).await.unwrap().unwrap();
        assert_eq!(s.result("analyze"), Some(&json!({"lang": "go"})));
        assert_eq!(s.result("build-image"), Some(&json!({"imageId": "sha256:abc"})));
    }

    #[tokio::test]
    async fn sequential_writes_to_one_key_apply_in_order() {
        let store = store();
        let id = store.create(None).await.unwrap().session_id;
        for i in 0..5 {
            store
                .store_tool_result(Some(&id), "scan", json!({"run": i}))
                .await
                .unwrap();
        }
        let s = store.get(&id).await.unwrap().unwrap();
        assert_eq!(s.result("scan"), Some(&json!({"run": 4})));
    }

    #[tokio::test]
    async fn backend_fault_propagates_with_cause() {
        let store = SessionStore::new(
            Arc::new(FailingBackend {
                inner: MemoryBackend::new(),
            }),
            SessionStoreConfig::default(),
        );
        let id = store.create(None).await.unwrap().session_id;
        let err = store
            .store_tool_result(Some(&id), "build-image", json!({"imageId": "sha256:abc"}))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Session update failed"), "{msg}");
        assert!(msg.contains("disk full"), "{msg}");

        let s = store.get(&id).await.unwrap().unwrap();
        assert!(s.result("build-image").is_none());
    }

    #[tokio::test]
    async fn update_failure_is_a_result_not_a_panic() {
        let store = SessionStore::new(
            Arc::new(FailingBackend {
                inner: MemoryBackend::new(),
            }),
            SessionStoreConfig::default(),
        );
        let id = store.create(None).await.unwrap().session_id;
        let result = store
            .update(
                &id,
                SessionPatch {
                    completed_steps: Some(BTreeSet::from(["build".to_string()])),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::UpdateFailed(_))));
    }

    #[tokio::test]
    async fn update_slides_ttl() {
        let store = store();
        let created = store.create(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let updated = store
            .update(&created.session_id, SessionPatch::default())
            .await
            .unwrap();
        assert!(updated.ttl_expires_at > created.ttl_expires_at);
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(updated.created_at, created.created_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_merges_lose_nothing() {
        const WORKERS: usize = 8;
        const MERGES: usize = 25;

        let store = Arc::new(store());
        let id = store.create(None).await.unwrap().session_id;

        let mut handles = Vec::new();
        for _ in 0..WORKERS {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..MERGES {
                    store
                        .modify(&id, |s| {
                            let n = s.metadata.results.get("counter").and_then(Value::as_u64).unwrap_or(0);
                            s.metadata.results.insert("counter".into(), json!(n + 1));
                        })
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let s = store.get(&id).await.unwrap().unwrap();
        assert_eq!(s.result("counter"), Some(&json!(WORKERS * MERGES)));
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_updated() {
        let store = SessionStore::in_memory(SessionStoreConfig {
            max_sessions: 2,
            ..Default::default()
        });
        let a = store.create(Some(SessionId::from_raw("a"))).await.unwrap().session_id;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let b = store.create(Some(SessionId::from_raw("b"))).await.unwrap().session_id;
        tokio::time::sleep(Duration::from_millis(2)).await;
        store.complete_step(&a, "analyze").await.unwrap();

        store.create(Some(SessionId::from_raw("c"))).await.unwrap();
        assert!(store.get(&a).await.unwrap().is_some());
        assert!(store.get(&b).await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_create_at_capacity_keeps_other_sessions() {
        let store = SessionStore::in_memory(SessionStoreConfig {
            max_sessions: 2,
            ..Default::default()
        });
        let a = store.create(Some(SessionId::from_raw("a"))).await.unwrap().session_id;
        let b = store.create(Some(SessionId::from_raw("b"))).await.unwrap().session_id;

        let err = store.create(Some(b.clone())).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert!(store.get(&a).await.unwrap().is_some());
        assert!(store.get(&b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_id_can_be_created_again_before_sweep() {
        for store in [
            SessionStore::in_memory(SessionStoreConfig {
                ttl: Duration::from_millis(10),
                ..Default::default()
            }),
            SessionStore::sqlite(
                Database::in_memory().unwrap(),
                SessionStoreConfig {
                    ttl: Duration::from_millis(10),
                    ..Default::default()
                },
            ),
        ] {
            let id = SessionId::from_raw("job-1");
            let first = store.create(Some(id.clone())).await.unwrap();
            store.add_label(&id, "stale").await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(store.get(&id).await.unwrap().is_none());

            let second = store.create(Some(id.clone())).await.unwrap();
            assert!(second.created_at > first.created_at);
            assert!(second.metadata.labels.is_empty());
            store
                .store_tool_result(Some(&id), "build-image", json!({"imageId": "sha256:abc"}))
                .await
                .unwrap();
            assert_eq!(store.list().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn expired_sessions_read_as_missing_and_get_swept() {
        let store = SessionStore::in_memory(SessionStoreConfig {
            ttl: Duration::from_millis(10),
            ..Default::default()
        });
        let id = store.create(None).await.unwrap().session_id;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get(&id).await.unwrap().is_none());
        let err = store
            .store_tool_result(Some(&id), "scan", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionMissing(_)));
        assert_eq!(store.sweep_expired().unwrap(), 1);
    }

    #[tokio::test]
    async fn labels_roundtrip() {
        let store = store();
        let a = store.create(None).await.unwrap().session_id;
        let b = store.create(None).await.unwrap().session_id;
        store.add_label(&a, "team-x").await.unwrap();
        store.add_label(&b, "team-y").await.unwrap();

        let found = store.sessions_by_label("team-x").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].session_id, a);

        store.remove_label(&a, "team-x").await.unwrap();
        assert!(store.sessions_by_label("team-x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_execution_caps_history() {
        let store = store();
        let id = store.create(None).await.unwrap().session_id;
        for i in 0..(HISTORY_LIMIT + 5) {
            store
                .record_execution(
                    &id,
                    json!(i),
                    ToolExecution {
                        tool: "ops".into(),
                        started_at: Utc::now(),
                        duration_ms: 1,
                    },
                )
                .await
                .unwrap();
        }
        let s = store.get(&id).await.unwrap().unwrap();
        assert_eq!(s.history.len(), HISTORY_LIMIT);
        assert_eq!(s.result("ops"), Some(&json!(HISTORY_LIMIT + 4)));
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = store();
        let id = store.create(None).await.unwrap().session_id;
        assert!(store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_on_interval_and_stops() {
        let store = Arc::new(SessionStore::in_memory(SessionStoreConfig {
            ttl: Duration::from_secs(1),
            ..Default::default()
        }));
        // Backdate a record so it is already expired by wall-clock time.
        let mut stale = SessionState::new(
            SessionId::from_raw("stale"),
            Utc::now() - chrono::Duration::hours(1),
            Duration::from_secs(1),
        );
        stale.metadata.labels.insert("old".into());
        store.backend.insert(&stale).unwrap();

        let handle = store.spawn_sweeper(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.backend.load(&SessionId::from_raw("stale")).unwrap().is_none());

        handle.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let id = {
            let store = SessionStore::sqlite(Database::open(&path).unwrap(), SessionStoreConfig::default());
            let id = store.create(None).await.unwrap().session_id;
            store
                .store_tool_result(Some(&id), "analyze", json!({"lang": "rust"}))
                .await
                .unwrap();
            id
        };
        let store = SessionStore::sqlite(Database::open(&path).unwrap(), SessionStoreConfig::default());
        let s = store.get(&id).await.unwrap().unwrap();
        assert_eq!(s.result("analyze"), Some(&json!({"lang": "rust"})));
    }
}

//! Per-request execution context.
//!
//! A [`ToolContext`] is built fresh for every request by the
//! [`ContextFactory`] and dropped when the request finishes. It bundles the
//! cancellation signal, a session facade, the AI sampling handle, a progress
//! sink and the request's tracing span.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use ckit_core::errors::ExecutionError;
use ckit_core::progress::{NoopProgress, ProgressSink, ProgressUpdate};
use ckit_core::request::ExecutionRequest;
use ckit_core::sampling::{SamplingClient, SamplingError, SamplingRequest, SamplingResponse};
use ckit_core::session::{SessionState, ToolExecution};
use ckit_core::{RequestId, SessionId};
use ckit_store::SessionStore;

/// Session access bound to the request's session id.
///
/// Exists even when no store is configured or the session record is absent;
/// writes then either no-op or fail as the store dictates.
#[derive(Clone)]
pub struct SessionHandle {
    store: Option<Arc<SessionStore>>,
    id: Option<SessionId>,
}

impl SessionHandle {
    pub fn new(store: Option<Arc<SessionStore>>, id: Option<SessionId>) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }

    pub fn store(&self) -> Option<&Arc<SessionStore>> {
        self.store.as_ref()
    }

    pub async fn get(&self) -> Result<Option<SessionState>, ExecutionError> {
        match (&self.store, &self.id) {
            (Some(store), Some(id)) => Ok(store.get(id).await?),
            _ => Ok(None),
        }
    }

    /// Store `value` under `tool_name`. No store or no id is a no-op.
    pub async fn store_result(&self, tool_name: &str, value: Value) -> Result<(), ExecutionError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store
            .store_tool_result(self.id.as_ref(), tool_name, value)
            .await?;
        Ok(())
    }

    /// Store the result and append `execution` to the history in one write.
    pub async fn record(&self, value: Value, execution: ToolExecution) -> Result<(), ExecutionError> {
        let (Some(store), Some(id)) = (&self.store, &self.id) else {
            return Ok(());
        };
        store.record_execution(id, value, execution).await?;
        Ok(())
    }

    pub async fn complete_step(&self, step: &str) -> Result<(), ExecutionError> {
        let (Some(store), Some(id)) = (&self.store, &self.id) else {
            return Ok(());
        };
        store.complete_step(id, step).await?;
        Ok(())
    }
}

/// The request's view of the AI channel.
///
/// Applies the caller's token ceiling and stop sequences, and races every
/// call against the cancellation signal.
#[derive(Clone)]
pub struct Sampler {
    client: Option<Arc<dyn SamplingClient>>,
    max_tokens: Option<u32>,
    stop_sequences: Vec<String>,
    signal: CancellationToken,
}

impl Sampler {
    pub fn new(
        client: Option<Arc<dyn SamplingClient>>,
        max_tokens: Option<u32>,
        stop_sequences: Vec<String>,
        signal: CancellationToken,
    ) -> Self {
        Self {
            client,
            max_tokens,
            stop_sequences,
            signal,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    fn shape(&self, request: &SamplingRequest) -> SamplingRequest {
        let mut shaped = request.clone();
        shaped.max_tokens = match (shaped.max_tokens, self.max_tokens) {
            (Some(asked), Some(ceiling)) => Some(asked.min(ceiling)),
            (asked, ceiling) => asked.or(ceiling),
        };
        if shaped.stop_sequences.is_empty() {
            shaped.stop_sequences = self.stop_sequences.clone();
        }
        shaped
    }
}

#[async_trait]
impl SamplingClient for Sampler {
    async fn create_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<SamplingResponse, SamplingError> {
        let Some(client) = &self.client else {
            return Err(SamplingError::NotConfigured);
        };
        if self.signal.is_cancelled() {
            return Err(SamplingError::Cancelled);
        }
        let shaped = self.shape(request);
        tokio::select! {
            _ = self.signal.cancelled() => Err(SamplingError::Cancelled),
            result = client.create_message(&shaped) => result,
        }
    }
}

/// Everything a tool may touch while running one request.
pub struct ToolContext {
    pub request_id: RequestId,
    pub tool_name: String,
    pub signal: CancellationToken,
    pub session: SessionHandle,
    pub sampling: Sampler,
    pub progress: Arc<dyn ProgressSink>,
    /// Logger context; every event emitted under it carries the request fields.
    pub span: tracing::Span,
    registered_tools: Arc<[String]>,
}

impl ToolContext {
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// `Err(Cancelled)` once the signal has fired.
    pub fn ensure_active(&self) -> Result<(), ExecutionError> {
        if self.signal.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn report_progress(&self, progress: f64, total: Option<f64>, message: impl Into<String>) {
        self.progress.report(ProgressUpdate {
            progress,
            total,
            message: Some(message.into()),
        });
    }

    pub fn registered_tools(&self) -> &[String] {
        &self.registered_tools
    }
}

/// Builds one isolated [`ToolContext`] per request.
#[derive(Clone)]
pub struct ContextFactory {
    store: Option<Arc<SessionStore>>,
    sampling: Option<Arc<dyn SamplingClient>>,
    registered_tools: Arc<[String]>,
}

impl ContextFactory {
    pub fn new(
        store: Option<Arc<SessionStore>>,
        sampling: Option<Arc<dyn SamplingClient>>,
        registered_tools: Vec<String>,
    ) -> Self {
        Self {
            store,
            sampling,
            registered_tools: registered_tools.into(),
        }
    }

    pub fn build(
        &self,
        request: &ExecutionRequest,
        request_id: RequestId,
        span: tracing::Span,
    ) -> ToolContext {
        let meta = &request.metadata;
        let signal = meta.signal.clone().unwrap_or_else(CancellationToken::new);
        let progress: Arc<dyn ProgressSink> = meta
            .progress
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgress));

        ToolContext {
            request_id,
            tool_name: request.tool_name.clone(),
            session: SessionHandle::new(self.store.clone(), request.session_id.clone()),
            sampling: Sampler::new(
                self.sampling.clone(),
                meta.max_tokens,
                meta.stop_sequences.clone().unwrap_or_default(),
                signal.clone(),
            ),
            signal,
            progress,
            span,
            registered_tools: Arc::clone(&self.registered_tools),
        }
    }
}

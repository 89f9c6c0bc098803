use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ids::SessionId;
use crate::progress::ProgressSink;

/// Transport-level knobs attached to a request. Every field is optional.
#[derive(Clone, Default)]
pub struct RequestMetadata {
    pub signal: Option<CancellationToken>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl std::fmt::Debug for RequestMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMetadata")
            .field("signal", &self.signal.as_ref().map(|s| s.is_cancelled()))
            .field("max_tokens", &self.max_tokens)
            .field("stop_sequences", &self.stop_sequences)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// One call into the orchestrator.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub tool_name: String,
    pub params: Value,
    pub session_id: Option<SessionId>,
    pub metadata: RequestMetadata,
}

impl ExecutionRequest {
    pub fn new(tool_name: impl Into<String>, params: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            params,
            session_id: None,
            metadata: RequestMetadata::default(),
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.metadata.signal = Some(signal);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.metadata.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop_sequences(mut self, stops: Vec<String>) -> Self {
        self.metadata.stop_sequences = Some(stops);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.metadata.progress = Some(progress);
        self
    }
}

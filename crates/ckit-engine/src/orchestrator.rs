//! Request entry point.
//!
//! `execute` looks the tool up, validates params against the compiled
//! schema, builds a fresh [`ToolContext`], runs the handler (under the tool's
//! retry policy, with panics caught), persists the value to the caller's
//! session and folds every outcome into an [`Outcome`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{error, field, info, info_span, warn, Instrument};

use ckit_core::errors::{ErrorKind, ExecutionError, Failure, Guidance, Outcome};
use ckit_core::request::ExecutionRequest;
use ckit_core::sampling::SamplingClient;
use ckit_core::session::ToolExecution;
use ckit_core::RequestId;
use ckit_llm::RetryExecutor;
use ckit_store::{SessionStore, SweeperHandle};

use crate::context::{ContextFactory, ToolContext};
use crate::registry::ToolRegistry;
use crate::sanitize::{panic_message, sanitize_message};
use crate::tool::Tool;

pub struct OrchestratorBuilder {
    registry: ToolRegistry,
    store: Option<Arc<SessionStore>>,
    sampling: Option<Arc<dyn SamplingClient>>,
    sweep_interval: Option<Duration>,
}

impl OrchestratorBuilder {
    pub fn session_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn sampling(mut self, client: Arc<dyn SamplingClient>) -> Self {
        self.sampling = Some(client);
        self
    }

    /// Override the store's configured sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Assemble the orchestrator. With a session store attached this spawns
    /// the TTL sweeper, so it must run inside a Tokio runtime.
    pub fn build(self) -> Orchestrator {
        let sweeper = self.store.as_ref().map(|store| {
            let interval = self
                .sweep_interval
                .unwrap_or(store.config().sweep_interval);
            store.spawn_sweeper(interval)
        });
        let factory = ContextFactory::new(
            self.store.clone(),
            self.sampling,
            self.registry.names(),
        );
        info!(
            tools = self.registry.count(),
            sessions = self.store.is_some(),
            "orchestrator ready"
        );
        Orchestrator {
            registry: Arc::new(self.registry),
            factory,
            store: self.store,
            sweeper: Mutex::new(sweeper),
            closed: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }
}

pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    factory: ContextFactory,
    store: Option<Arc<SessionStore>>,
    sweeper: Mutex<Option<SweeperHandle>>,
    closed: AtomicBool,
    started_at: Instant,
}

impl Orchestrator {
    pub fn builder(registry: ToolRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            store: None,
            sampling: None,
            sweep_interval: None,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn session_store(&self) -> Option<&Arc<SessionStore>> {
        self.store.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop background work. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        info!("orchestrator closed");
    }

    /// Run one request to completion. Never panics.
    pub async fn execute(&self, request: ExecutionRequest) -> Outcome<Value> {
        let request_id = RequestId::new();
        let span = info_span!(
            "tool",
            tool_name = %request.tool_name,
            request_id = %request_id,
            session_id = field::Empty,
        );
        if let Some(id) = &request.session_id {
            span.record("session_id", id.as_str());
        }
        self.execute_in_span(request, request_id, span.clone())
            .instrument(span)
            .await
    }

    async fn execute_in_span(
        &self,
        request: ExecutionRequest,
        request_id: RequestId,
        span: tracing::Span,
    ) -> Outcome<Value> {
        if self.is_closed() {
            return Err(Failure::new(ErrorKind::Internal, "orchestrator is closed")
                .with_guidance(
                    Guidance::new("The orchestrator has been shut down")
                        .with_resolution("Start a new orchestrator instance"),
                ));
        }

        let Some(entry) = self.registry.get(&request.tool_name) else {
            warn!("unknown tool requested");
            return Err(self.not_found(&request.tool_name));
        };

        let params = match &request.params {
            Value::Null => json!({}),
            other => other.clone(),
        };
        if let Err(e) = entry.validate(&params) {
            info!(error = %e, "parameters rejected");
            return Err(e.into());
        }

        let tool = Arc::clone(entry.tool());
        let ctx = self.factory.build(&request, request_id, span);
        let started_at = Utc::now();
        let clock = Instant::now();

        let value = match Self::invoke(tool.as_ref(), params, &ctx).await {
            Ok(value) => value,
            Err(e) => return Err(Self::fail(e, clock)),
        };
        let duration_ms = clock.elapsed().as_millis() as u64;

        if tool.persists_result() {
            let execution = ToolExecution {
                tool: tool.name().to_string(),
                started_at,
                duration_ms,
            };
            if let Err(e) = ctx.session.record(value.clone(), execution).await {
                error!(error = %e, "failed to persist tool result");
                return Err(Self::fail(e, clock));
            }
        }

        info!(duration_ms, "tool completed");
        Ok(value)
    }

    async fn invoke(
        tool: &dyn Tool,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ExecutionError> {
        match tool.retry_policy() {
            None => Self::guarded(tool, params, ctx).await,
            Some(policy) => {
                let params = &params;
                RetryExecutor::new(policy)
                    .run_cancellable(
                        move |_| Self::guarded(tool, params.clone(), ctx),
                        ExecutionError::is_retryable,
                        &ctx.signal,
                    )
                    .await
            }
        }
    }

    /// Run the handler once, converting a panic into an internal error.
    async fn guarded(
        tool: &dyn Tool,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ExecutionError> {
        match AssertUnwindSafe(tool.execute(params, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(panic = %msg, "tool panicked during execution");
                Err(ExecutionError::Internal(format!(
                    "Internal error: tool '{}' crashed: {}",
                    tool.name(),
                    msg
                )))
            }
        }
    }

    fn fail(err: ExecutionError, clock: Instant) -> Failure {
        let kind = err.kind();
        let mut failure = Failure::from(err);
        if kind == ErrorKind::Internal {
            failure.error = sanitize_message(&failure.error);
        }
        warn!(
            kind = %kind,
            error = %failure.error,
            duration_ms = clock.elapsed().as_millis() as u64,
            "tool failed"
        );
        failure
    }

    fn not_found(&self, name: &str) -> Failure {
        let names = self.registry.names();
        Failure::from(ExecutionError::tool_not_found(name)).with_guidance(
            Guidance::new(format!("Tool '{name}' is not registered"))
                .with_hint(format!("Available tools: {}", names.join(", ")))
                .with_resolution("Call one of the available tools by its exact name")
                .with_details(json!({ "available_tools": names })),
        )
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.close();
    }
}

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use ckit_core::errors::ExecutionError;

use crate::context::ToolContext;
use crate::tool::{decode_params, Tool};

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
enum OpsParams {
    Ping { message: Option<String> },
    Status,
}

/// Liveness and status probe.
pub struct OpsTool {
    started_at: Instant,
}

impl OpsTool {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }
}

impl Default for OpsTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for OpsTool {
    fn name(&self) -> &str {
        "ops"
    }

    fn description(&self) -> &str {
        "Operational probes: ping the server or report its status"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["operation"],
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["ping", "status"],
                    "description": "Probe to run"
                },
                "message": {
                    "type": "string",
                    "description": "Text echoed back by ping"
                }
            },
            "additionalProperties": false
        })
    }

    fn persists_result(&self) -> bool {
        false
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ExecutionError> {
        ctx.ensure_active()?;
        match decode_params::<OpsParams>(params)? {
            OpsParams::Ping { message } => {
                let echo = message.unwrap_or_else(|| "ping".to_string());
                Ok(json!({
                    "message": format!("pong: {echo}"),
                    "timestamp": Utc::now().to_rfc3339(),
                }))
            }
            OpsParams::Status => {
                let sessions = match ctx.session.store() {
                    Some(store) => Some(store.list().await?.len()),
                    None => None,
                };
                Ok(json!({
                    "status": "ok",
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_secs": self.started_at.elapsed().as_secs(),
                    "tools": ctx.registered_tools().len(),
                    "sampling": ctx.sampling.is_configured(),
                    "active_sessions": sessions,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFactory;
    use ckit_core::request::ExecutionRequest;
    use ckit_core::RequestId;
    use tokio_util::sync::CancellationToken;

    fn ctx(request: &ExecutionRequest) -> ToolContext {
        ContextFactory::new(None, None, vec!["ops".into(), "session".into()]).build(
            request,
            RequestId::new(),
            tracing::Span::none(),
        )
    }

    #[tokio::test]
    async fn ping_echoes_operation() {
        let params = json!({"operation": "ping"});
        let req = ExecutionRequest::new("ops", params.clone());
        let out = OpsTool::new().execute(params, &ctx(&req)).await.unwrap();
        assert_eq!(out["message"], "pong: ping");
    }

    #[tokio::test]
    async fn ping_echoes_message() {
        let params = json!({"operation": "ping", "message": "hello"});
        let req = ExecutionRequest::new("ops", params.clone());
        let out = OpsTool::new().execute(params, &ctx(&req)).await.unwrap();
        assert_eq!(out["message"], "pong: hello");
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let params = json!({"operation": "status"});
        let req = ExecutionRequest::new("ops", params.clone());
        let out = OpsTool::new().execute(params, &ctx(&req)).await.unwrap();
        assert_eq!(out["status"], "ok");
        assert_eq!(out["tools"], 2);
        assert_eq!(out["sampling"], false);
        assert!(out["active_sessions"].is_null());
    }

    #[tokio::test]
    async fn cancelled_before_work() {
        let token = CancellationToken::new();
        token.cancel();
        let params = json!({"operation": "ping"});
        let req = ExecutionRequest::new("ops", params.clone()).with_signal(token);
        let err = OpsTool::new().execute(params, &ctx(&req)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
    }
}

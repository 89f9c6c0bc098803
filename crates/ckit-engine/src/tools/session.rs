use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use ckit_core::errors::{ExecutionError, Guidance};
use ckit_core::SessionId;
use ckit_store::SessionStore;

use crate::context::ToolContext;
use crate::tool::{decode_params, Tool};

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum SessionParams {
    Create {
        session_id: Option<String>,
    },
    Get {
        session_id: Option<String>,
    },
    List {
        label: Option<String>,
    },
    Delete {
        session_id: Option<String>,
    },
    Label {
        session_id: Option<String>,
        label: String,
    },
    Unlabel {
        session_id: Option<String>,
        label: String,
    },
}

/// Session lifecycle management.
pub struct SessionTool;

impl SessionTool {
    fn store(ctx: &ToolContext) -> Result<&Arc<SessionStore>, ExecutionError> {
        ctx.session.store().ok_or_else(|| ExecutionError::Tool {
            message: "session store is not configured".into(),
            retryable: false,
            guidance: Some(
                Guidance::new("Sessions are unavailable")
                    .with_resolution("Start the server with a session database configured"),
            ),
        })
    }

    /// Explicit id, else the id the request is bound to.
    fn target(ctx: &ToolContext, explicit: Option<String>) -> Result<SessionId, ExecutionError> {
        explicit
            .map(SessionId::from_raw)
            .or_else(|| ctx.session.id().cloned())
            .ok_or_else(|| {
                ExecutionError::InvalidParams(
                    "session_id is required when the request is not bound to a session".into(),
                )
            })
    }
}

#[async_trait]
impl Tool for SessionTool {
    fn name(&self) -> &str {
        "session"
    }

    fn description(&self) -> &str {
        "Create, inspect, list, label and delete sessions"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["create", "get", "list", "delete", "label", "unlabel"]
                },
                "session_id": {"type": "string", "minLength": 1},
                "label": {"type": "string", "minLength": 1}
            },
            "additionalProperties": false,
            "allOf": [
                {
                    "if": {"properties": {"action": {"enum": ["label", "unlabel"]}}},
                    "then": {"required": ["label"]}
                }
            ]
        })
    }

    fn persists_result(&self) -> bool {
        false
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ExecutionError> {
        ctx.ensure_active()?;
        let store = Self::store(ctx)?;
        let params: SessionParams = decode_params(params)?;

        match params {
            SessionParams::Create { session_id } => {
                let state = store.create(session_id.map(SessionId::from_raw)).await?;
                Ok(json!({ "session": state.summary() }))
            }
            SessionParams::Get { session_id } => {
                let id = Self::target(ctx, session_id)?;
                match store.get(&id).await? {
                    Some(state) => Ok(json!({ "session": state })),
                    None => Err(ExecutionError::NotFound(format!("session '{id}' not found"))),
                }
            }
            SessionParams::List { label } => {
                let sessions = match label {
                    Some(label) => store.sessions_by_label(&label).await?,
                    None => store.list().await?,
                };
                Ok(json!({ "count": sessions.len(), "sessions": sessions }))
            }
            SessionParams::Delete { session_id } => {
                let id = Self::target(ctx, session_id)?;
                let deleted = store.delete(&id).await?;
                Ok(json!({ "session_id": id, "deleted": deleted }))
            }
            SessionParams::Label { session_id, label } => {
                let id = Self::target(ctx, session_id)?;
                let state = store.add_label(&id, &label).await?;
                Ok(json!({ "session": state.summary() }))
            }
            SessionParams::Unlabel { session_id, label } => {
                let id = Self::target(ctx, session_id)?;
                let state = store.remove_label(&id, &label).await?;
                Ok(json!({ "session": state.summary() }))
            }
        }
    }
}

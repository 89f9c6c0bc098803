use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ckit_core::errors::ExecutionError;
use ckit_llm::RetryPolicy;

use crate::context::ToolContext;

/// Public description of a registered tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: Value,
}

/// A named, schema-validated unit of work.
///
/// `execute` only ever sees params that already passed `parameters_schema`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    /// Whether a successful value is written to the caller's session.
    fn persists_result(&self) -> bool {
        true
    }

    /// Retry schedule for retryable failures. `None` runs the handler once.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ExecutionError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

/// Decode already-validated params into a tool's request type.
pub fn decode_params<T: DeserializeOwned>(params: Value) -> Result<T, ExecutionError> {
    serde_json::from_value(params).map_err(|e| ExecutionError::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(tag = "operation", rename_all = "lowercase")]
    enum Op {
        Ping { message: Option<String> },
        Status,
    }

    #[test]
    fn decodes_tagged_params() {
        let op: Op = decode_params(json!({"operation": "ping", "message": "hi"})).unwrap();
        assert_eq!(op, Op::Ping { message: Some("hi".into()) });
        let op: Op = decode_params(json!({"operation": "status"})).unwrap();
        assert_eq!(op, Op::Status);
    }

    #[test]
    fn decode_failure_is_validation() {
        let err = decode_params::<Op>(json!({"operation": "reboot"})).unwrap_err();
        assert_eq!(err.kind(), ckit_core::ErrorKind::Validation);
        assert!(err.to_string().starts_with("invalid parameters"));
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::sampling::SamplingError;

/// One offending field reported by schema validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    /// JSON pointer into the params (`/` for the root object).
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Coarse classification every failure maps onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Persistence,
    AiProtocol,
    Cancellation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Persistence => "persistence",
            Self::AiProtocol => "ai_protocol",
            Self::Cancellation => "cancellation",
            Self::Internal => "internal",
        }
    }

    /// Default operator-facing guidance for this kind.
    pub fn guidance(&self) -> Guidance {
        let (message, hint, resolution) = match self {
            Self::Validation => (
                "Invalid tool parameters",
                "Check parameter names and types against the tool's schema",
                "Fix the listed fields and retry",
            ),
            Self::NotFound => (
                "Requested resource not found",
                "The tool or session is not registered",
                "List available tools with `ckit tools`, or create the session first",
            ),
            Self::Persistence => (
                "Session state could not be saved",
                "The session store rejected the write",
                "Check storage availability (disk space, permissions) and retry",
            ),
            Self::AiProtocol => (
                "AI output could not be used",
                "The model response was not valid structured output, even after one repair attempt",
                "Retry the request; simplify the input if it keeps failing",
            ),
            Self::Cancellation => (
                "Request cancelled",
                "The cancellation signal fired before the work completed",
                "Re-issue the request if the work is still needed",
            ),
            Self::Internal => (
                "Unexpected internal error",
                "The tool failed in a way it did not anticipate",
                "Retry; report the issue if it persists",
            ),
        };
        Guidance {
            message: message.into(),
            hint: Some(hint.into()),
            resolution: Some(resolution.into()),
            details: None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, user-facing supplementary error information.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Guidance {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Guidance {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
            resolution: None,
            details: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_resolution(mut self, resolution: impl Into<String>) -> Self {
        self.resolution = Some(resolution.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Errors produced while executing a tool request.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("invalid parameters for '{tool}': {}", join_issues(.issues))]
    Validation { tool: String, issues: Vec<FieldIssue> },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Persistence(String),

    #[error("AI output rejected: {0}")]
    AiOutput(String),

    #[error("AI output rejected: {original}; repair attempt failed: {repair}")]
    AiRepairFailed { original: String, repair: String },

    #[error("sampling failed: {0}")]
    Sampling(#[from] SamplingError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{message}")]
    Tool {
        message: String,
        retryable: bool,
        guidance: Option<Guidance>,
    },

    #[error("{0}")]
    Internal(String),
}

impl ExecutionError {
    pub fn tool_not_found(name: &str) -> Self {
        Self::NotFound(format!("tool '{name}' not found"))
    }

    /// A tool-level failure that should not be retried.
    pub fn tool(message: impl Into<String>) -> Self {
        Self::Tool {
            message: message.into(),
            retryable: false,
            guidance: None,
        }
    }

    /// A tool-level failure worth retrying under the tool's retry policy.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Tool {
            message: message.into(),
            retryable: true,
            guidance: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::InvalidParams(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Sampling(SamplingError::Cancelled) => ErrorKind::Cancellation,
            Self::AiOutput(_) | Self::AiRepairFailed { .. } | Self::Sampling(_) => {
                ErrorKind::AiProtocol
            }
            Self::Cancelled => ErrorKind::Cancellation,
            Self::Tool { .. } | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sampling(e) => e.is_retryable(),
            Self::Tool { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Guidance for this error: an explicit tool override, else the kind default
    /// enriched with any structured details.
    pub fn guidance(&self) -> Guidance {
        match self {
            Self::Tool {
                guidance: Some(g), ..
            } => g.clone(),
            Self::Validation { issues, .. } => {
                let fields: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
                self.kind()
                    .guidance()
                    .with_details(json!({ "fields": fields }))
            }
            _ => self.kind().guidance(),
        }
    }
}

/// The failure half of an [`Outcome`].
#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    pub error: String,
    pub kind: ErrorKind,
    pub guidance: Option<Guidance>,
}

impl Failure {
    pub fn new(kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind,
            guidance: Some(kind.guidance()),
        }
    }

    pub fn with_guidance(mut self, guidance: Guidance) -> Self {
        self.guidance = Some(guidance);
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.error)
    }
}

impl std::error::Error for Failure {}

impl From<ExecutionError> for Failure {
    fn from(e: ExecutionError) -> Self {
        Self {
            error: e.to_string(),
            kind: e.kind(),
            guidance: Some(e.guidance()),
        }
    }
}

/// Uniform result of every boundary operation.
pub type Outcome<T = Value> = Result<T, Failure>;

/// Render an outcome as the `{ok, value}` / `{ok, error, guidance}` envelope.
pub fn to_envelope<T: Serialize>(outcome: &Outcome<T>) -> Value {
    match outcome {
        Ok(value) => json!({
            "ok": true,
            "value": serde_json::to_value(value).unwrap_or(Value::Null),
        }),
        Err(failure) => {
            let mut env = json!({ "ok": false, "error": failure.error });
            if let Some(g) = &failure.guidance {
                env["guidance"] = serde_json::to_value(g).unwrap_or(Value::Null);
            }
            env
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_lists_every_path() {
        let err = ExecutionError::Validation {
            tool: "ops".into(),
            issues: vec![
                FieldIssue {
                    path: "/operation".into(),
                    message: "\"reboot\" is not one of [\"ping\",\"status\"]".into(),
                },
                FieldIssue {
                    path: "/message".into(),
                    message: "42 is not of type \"string\"".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("/operation"));
        assert!(msg.contains("/message"));
        assert_eq!(err.kind(), ErrorKind::Validation);
        let g = err.guidance();
        assert_eq!(g.details.unwrap()["fields"], json!(["/operation", "/message"]));
    }

    #[test]
    fn not_found_message() {
        let err = ExecutionError::tool_not_found("missing-tool");
        assert_eq!(err.to_string(), "tool 'missing-tool' not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn repair_failure_keeps_both_errors() {
        let err = ExecutionError::AiRepairFailed {
            original: "trailing comma at line 1".into(),
            repair: "expected value at line 1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("trailing comma"));
        assert!(msg.contains("expected value"));
    }

    #[test]
    fn retryable_classification() {
        assert!(ExecutionError::transient("busy").is_retryable());
        assert!(!ExecutionError::tool("bad input").is_retryable());
        assert!(ExecutionError::Sampling(SamplingError::Unavailable("503".into())).is_retryable());
        assert!(!ExecutionError::Cancelled.is_retryable());
        assert!(!ExecutionError::Persistence("disk full".into()).is_retryable());
    }

    #[test]
    fn tool_guidance_override_wins() {
        let err = ExecutionError::Tool {
            message: "registry unreachable".into(),
            retryable: false,
            guidance: Some(Guidance::new("Registry offline").with_hint("check VPN")),
        };
        let failure = Failure::from(err);
        assert_eq!(failure.guidance.unwrap().message, "Registry offline");
    }

    #[test]
    fn envelope_shapes() {
        let ok: Outcome = Ok(json!({"message": "pong: ping"}));
        let env = to_envelope(&ok);
        assert_eq!(env["ok"], true);
        assert_eq!(env["value"]["message"], "pong: ping");

        let failed: Outcome = Err(ExecutionError::Cancelled.into());
        let env = to_envelope(&failed);
        assert_eq!(env["ok"], false);
        assert_eq!(env["error"], "operation cancelled");
        assert_eq!(env["guidance"]["message"], "Request cancelled");
        assert!(env["guidance"]["resolution"].is_string());
    }
}

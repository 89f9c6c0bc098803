use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use ckit_core::errors::ExecutionError;
use ckit_core::sampling::{SamplingClient, SamplingRequest};
use ckit_llm::{OutputValidator, RetryPolicy};

use crate::context::ToolContext;
use crate::error::EngineError;
use crate::tool::{decode_params, Tool};

const SYSTEM_PROMPT: &str = "You are a build and deployment troubleshooter. \
Answer with a single JSON object and nothing else.";

const STEPS: f64 = 3.0;

#[derive(Debug, Deserialize)]
struct DiagnoseParams {
    error: String,
    context: Option<String>,
}

/// Structured root-cause analysis returned by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: String,
    pub fix_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

fn diagnosis_schema() -> Value {
    json!({
        "type": "object",
        "required": ["root_cause", "fix_steps"],
        "properties": {
            "root_cause": {"type": "string", "minLength": 1},
            "fix_steps": {"type": "array", "items": {"type": "string"}},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1}
        }
    })
}

/// Asks the AI channel to explain a failure.
pub struct DiagnoseTool {
    validator: OutputValidator,
    retry: RetryPolicy,
}

impl DiagnoseTool {
    pub fn new() -> Result<Self, EngineError> {
        let validator = OutputValidator::new(&diagnosis_schema())
            .map_err(|source| EngineError::Schema {
                tool: "diagnose".into(),
                source,
            })?
            .with_alias("steps", "fix_steps");
        Ok(Self {
            validator,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    fn prompt(params: &DiagnoseParams) -> SamplingRequest {
        let mut text = format!(
            "Diagnose the following failure.\n\nError:\n{}\n",
            params.error
        );
        if let Some(context) = &params.context {
            text.push_str(&format!("\nContext:\n{context}\n"));
        }
        text.push_str(
            "\nRespond with JSON of the form \
             {\"root_cause\": string, \"fix_steps\": [string], \"confidence\": number between 0 and 1}.",
        );
        SamplingRequest::prompt(text).with_system(SYSTEM_PROMPT)
    }
}

#[async_trait]
impl Tool for DiagnoseTool {
    fn name(&self) -> &str {
        "diagnose"
    }

    fn description(&self) -> &str {
        "Root-cause analysis of an error message using the AI channel"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["error"],
            "properties": {
                "error": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Error output to analyse"
                },
                "context": {
                    "type": "string",
                    "description": "Extra detail such as the failing command or file"
                }
            },
            "additionalProperties": false
        })
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.retry.clone())
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, ExecutionError> {
        ctx.ensure_active()?;
        let params: DiagnoseParams = decode_params(params)?;

        ctx.report_progress(0.0, Some(STEPS), "requesting analysis");
        let response = ctx.sampling.create_message(&Self::prompt(&params)).await?;

        ctx.report_progress(1.0, Some(STEPS), "validating analysis");
        let diagnosis: Diagnosis = self
            .validator
            .validate_as(&response.joined_text(), &ctx.sampling)
            .await?;
        debug!(steps = diagnosis.fix_steps.len(), "diagnosis accepted");

        ctx.report_progress(STEPS, Some(STEPS), "done");
        serde_json::to_value(diagnosis).map_err(|e| ExecutionError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFactory;
    use ckit_core::progress::ChannelProgress;
    use ckit_core::request::ExecutionRequest;
    use ckit_core::RequestId;
    use ckit_llm::{MockResponse, MockSampler};
    use std::sync::Arc;

    #[tokio::test]
    async fn returns_validated_diagnosis_with_progress() {
        let mock = Arc::new(MockSampler::new(vec![MockResponse::text(
            "```json\n{\"root_cause\": \"base image missing\", \"steps\": [\"pin FROM\"], \"confidence\": 0.8}\n```",
        )]));
        let factory = ContextFactory::new(None, Some(mock.clone()), vec![]);
        let (sink, mut rx) = ChannelProgress::new();
        let params = json!({"error": "manifest unknown", "context": "docker build"});
        let req = ExecutionRequest::new("diagnose", params.clone()).with_progress(Arc::new(sink));
        let ctx = factory.build(&req, RequestId::new(), tracing::Span::none());

        let out = DiagnoseTool::new().unwrap().execute(params, &ctx).await.unwrap();
        assert_eq!(out["root_cause"], "base image missing");
        assert_eq!(out["fix_steps"], json!(["pin FROM"]));
        assert_eq!(mock.call_count(), 1);

        let prompt = &mock.requests()[0].messages[0].content;
        assert!(prompt.contains("manifest unknown"));
        assert!(prompt.contains("docker build"));

        let mut last = None;
        while let Ok(update) = rx.try_recv() {
            last = Some(update);
        }
        assert_eq!(last.unwrap().progress, STEPS);
    }

    #[tokio::test]
    async fn malformed_output_repaired_once() {
        let mock = Arc::new(MockSampler::new(vec![
            MockResponse::text("{\"root_cause\": \"x\", \"fix_steps\": [],}"),
            MockResponse::text("{\"root_cause\": \"x\", \"fix_steps\": []}"),
        ]));
        let factory = ContextFactory::new(None, Some(mock.clone()), vec![]);
        let params = json!({"error": "boom"});
        let ctx = factory.build(
            &ExecutionRequest::new("diagnose", params.clone()),
            RequestId::new(),
            tracing::Span::none(),
        );
        let out = DiagnoseTool::new().unwrap().execute(params, &ctx).await.unwrap();
        assert_eq!(out["root_cause"], "x");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn without_sampling_client_fails_cleanly() {
        let factory = ContextFactory::new(None, None, vec![]);
        let params = json!({"error": "boom"});
        let ctx = factory.build(
            &ExecutionRequest::new("diagnose", params.clone()),
            RequestId::new(),
            tracing::Span::none(),
        );
        let err = DiagnoseTool::new().unwrap().execute(params, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("AI sampling is not configured"), "{err}");
    }
}

//! Turns untrusted model text into schema-validated JSON.
//!
//! Local pass: strip code fences, parse, apply key normalizations, reject
//! undeclared top-level fields, validate against the schema. If the local
//! pass rejects non-empty text, the same sampling channel is asked exactly
//! once to repair it, and the local pass runs again on the reply.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use ckit_core::errors::ExecutionError;
use ckit_core::sampling::{SamplingClient, SamplingRequest};
use ckit_core::schema::{CompiledSchema, SchemaError};

const REPAIR_SYSTEM: &str = "You repair malformed JSON documents.";

#[derive(Debug, PartialEq)]
enum Rejection {
    Empty,
    Invalid(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("empty response"),
            Self::Invalid(reason) => f.write_str(reason),
        }
    }
}

/// A fence that wraps the whole response.
static WRAPPING_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\A```[A-Za-z0-9_-]*[ \t]*(?:\r?\n)?(.*?)\s*```\z").unwrap()
});

/// The first fence inside surrounding prose.
static EMBEDDED_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)```").unwrap()
});

/// Remove markdown code-fence wrapping.
///
/// A fence wrapping the whole text is always stripped. Text that already
/// opens like a JSON document is otherwise returned as is, so fences quoted
/// inside string values survive; anything else yields the first embedded
/// fence's body.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(inner) = WRAPPING_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed;
    }
    match EMBEDDED_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

pub struct OutputValidator {
    schema: CompiledSchema,
    aliases: Vec<(String, String)>,
}

impl OutputValidator {
    pub fn new(schema: &Value) -> Result<Self, SchemaError> {
        Ok(Self {
            schema: CompiledSchema::compile(schema)?,
            aliases: Vec::new(),
        })
    }

    /// Rename top-level `alias` to `canonical` when only the alias is present.
    pub fn with_alias(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.aliases.push((alias.into(), canonical.into()));
        self
    }

    fn normalize(&self, value: &mut Value) {
        let Some(obj) = value.as_object_mut() else {
            return;
        };
        for (alias, canonical) in &self.aliases {
            if obj.contains_key(canonical) {
                continue;
            }
            if let Some(v) = obj.remove(alias) {
                obj.insert(canonical.clone(), v);
            }
        }
    }

    fn check(&self, raw: &str) -> Result<Value, Rejection> {
        let text = strip_fences(raw);
        if text.is_empty() {
            return Err(Rejection::Empty);
        }
        let mut value: Value = serde_json::from_str(text)
            .map_err(|e| Rejection::Invalid(format!("invalid JSON: {e}")))?;
        self.normalize(&mut value);

        let undeclared = self.schema.undeclared_fields(&value);
        if !undeclared.is_empty() {
            return Err(Rejection::Invalid(format!(
                "undeclared fields: {}",
                undeclared.join(", ")
            )));
        }
        let issues = self.schema.check(&value);
        if !issues.is_empty() {
            let joined: Vec<String> = issues.iter().map(ToString::to_string).collect();
            return Err(Rejection::Invalid(format!(
                "schema violation: {}",
                joined.join("; ")
            )));
        }
        Ok(value)
    }

    fn repair_request(&self, raw: &str, reason: &str) -> SamplingRequest {
        SamplingRequest::prompt(format!(
            "The text below was meant to be a single JSON value but was rejected ({reason}).\n\
             Fix the JSON syntax only. Preserve every field name exactly as written.\n\
             Return pure JSON with no markdown fences and no commentary.\n\n{raw}"
        ))
        .with_system(REPAIR_SYSTEM)
    }

    /// Validate `raw`, spending at most one repair call on `sampler`.
    pub async fn validate(
        &self,
        raw: &str,
        sampler: &dyn SamplingClient,
    ) -> Result<Value, ExecutionError> {
        let original = match self.check(raw) {
            Ok(value) => return Ok(value),
            Err(Rejection::Empty) => {
                return Err(ExecutionError::AiOutput(Rejection::Empty.to_string()))
            }
            Err(Rejection::Invalid(reason)) => reason,
        };

        info!(reason = %original, "AI output rejected, requesting one repair");
        let repaired = sampler
            .create_message(&self.repair_request(raw, &original))
            .await
            .map_err(|e| ExecutionError::AiRepairFailed {
                original: original.clone(),
                repair: e.to_string(),
            })?;

        self.check(&repaired.joined_text()).map_err(|e| {
            debug!(reason = %e, "repaired output still rejected");
            ExecutionError::AiRepairFailed {
                original,
                repair: e.to_string(),
            }
        })
    }

    /// [`Self::validate`], then deserialize into `T`.
    pub async fn validate_as<T: DeserializeOwned>(
        &self,
        raw: &str,
        sampler: &dyn SamplingClient,
    ) -> Result<T, ExecutionError> {
        let value = self.validate(raw, sampler).await?;
        serde_json::from_value(value)
            .map_err(|e| ExecutionError::AiOutput(format!("unexpected shape: {e}")))
    }
}

//! Minimal contract for the AI sampling channel.
//!
//! Only the shape the validator and built-in tools depend on is modelled:
//! a request carrying messages plus token/stop limits, and a response made of
//! text content blocks. Vendor protocols live behind [`SamplingClient`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: Role,
    pub content: String,
}

impl SamplingMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplingRequest {
    pub messages: Vec<SamplingMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

impl SamplingRequest {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            messages: vec![SamplingMessage::user(text)],
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingResponse {
    pub content: Vec<ContentBlock>,
}

impl SamplingResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text of all content blocks.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.as_str(),
            })
            .collect()
    }
}

/// Failures of the sampling channel itself (not of the content it returns).
#[derive(Clone, Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("AI sampling is not configured")]
    NotConfigured,
    #[error("invalid sampling request: {0}")]
    InvalidRequest(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("sampling channel unavailable: {0}")]
    Unavailable(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl SamplingError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable(_) | Self::Timeout(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// The AI channel: `create_message(request) -> { content: [{type: "text", text}] }`.
#[async_trait]
pub trait SamplingClient: Send + Sync {
    async fn create_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<SamplingResponse, SamplingError>;
}

#[async_trait]
impl<T: SamplingClient + ?Sized> SamplingClient for std::sync::Arc<T> {
    async fn create_message(
        &self,
        request: &SamplingRequest,
    ) -> Result<SamplingResponse, SamplingError> {
        (**self).create_message(request).await
    }
}

//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so partial
//! JSON deserializes with the remaining fields at their defaults.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Longest accepted session TTL (30 days).
pub const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Root settings type.
///
/// ```json
/// {
///   "session": { "ttlSecs": 3600, "dbPath": "/var/lib/ckit/sessions.db" },
///   "logging": { "level": "debug", "modules": { "ckit_store": "trace" } }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CkitSettings {
    pub session: SessionSettings,
    pub retry: RetrySettings,
    pub sampling: SamplingSettings,
    pub logging: LoggingSettings,
}

impl CkitSettings {
    /// Reject combinations the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.session.ttl_secs == 0 || self.session.ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(SettingsError::InvalidValue(format!(
                "session.ttlSecs must be within 1-{MAX_SESSION_TTL_SECS}, got {}",
                self.session.ttl_secs
            )));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "session.sweepIntervalSecs must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "retry.maxAttempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "retry.jitterFactor must be within 0.0-1.0, got {}",
                self.retry.jitter_factor
            )));
        }
        if matches!(self.retry.backoff, BackoffKind::Exponential) && self.retry.factor < 1.0 {
            return Err(SettingsError::InvalidValue(
                "retry.factor must be >= 1.0 for exponential backoff".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Sliding expiry window in seconds.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Oldest session is evicted beyond this; `0` disables the cap.
    pub max_sessions: usize,
    /// SQLite file; `None` uses `~/.ckit/sessions.db`, `":memory:"` keeps
    /// sessions in process memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl SessionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            max_sessions: 1000,
            db_path: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Retry schedule for retry-declaring tools and the AI channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before each retry; the last entry repeats.
    pub delays_ms: Vec<u64>,
    pub backoff: BackoffKind,
    /// Growth factor for exponential backoff.
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Jitter factor (0.0–1.0) applied to retry delays.
    pub jitter_factor: f64,
}

impl RetrySettings {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays_ms.iter().copied().map(Duration::from_millis).collect()
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delays_ms: vec![500, 1000],
            backoff: BackoffKind::Fixed,
            factor: 2.0,
            max_delay_ms: 10_000,
            jitter_factor: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplingSettings {
    /// Memoization window for identical AI requests; `0` disables the cache.
    pub cache_ttl_secs: u64,
    /// Token ceiling applied when the caller gives none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl SamplingSettings {
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            max_tokens: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"ckit_store": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

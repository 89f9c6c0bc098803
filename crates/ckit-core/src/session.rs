use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Last value returned by each tool, keyed by tool name.
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
}

/// One successful tool run recorded against a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub completed_steps: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ToolExecution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: SessionId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            session_id,
            metadata: SessionMetadata::default(),
            completed_steps: BTreeSet::new(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            ttl_expires_at: expiry(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.ttl_expires_at
    }

    /// Stamp a successful write and slide the expiry window forward.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.updated_at = now;
        self.ttl_expires_at = expiry(now, ttl);
    }

    /// Replace the named top-level fields.
    pub fn apply(&mut self, patch: SessionPatch) {
        if let Some(metadata) = patch.metadata {
            self.metadata = metadata;
        }
        if let Some(steps) = patch.completed_steps {
            self.completed_steps = steps;
        }
    }

    pub fn result(&self, tool_name: &str) -> Option<&Value> {
        self.metadata.results.get(tool_name)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            labels: self.metadata.labels.iter().cloned().collect(),
            tools_run: self.metadata.results.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            ttl_expires_at: self.ttl_expires_at,
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Top-level replacement patch for [`SessionState`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_steps: Option<BTreeSet<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub labels: Vec<String>,
    pub tools_run: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_session_expires_after_ttl() {
        let now = Utc::now();
        let state = SessionState::new(SessionId::new(), now, Duration::from_secs(60));
        assert!(!state.is_expired(now));
        assert!(!state.is_expired(now + chrono::Duration::seconds(60)));
        assert!(state.is_expired(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn touch_slides_expiry() {
        let start = Utc::now();
        let mut state = SessionState::new(SessionId::new(), start, Duration::from_secs(60));
        let later = start + chrono::Duration::seconds(45);
        state.touch(later, Duration::from_secs(60));
        assert_eq!(state.updated_at, later);
        assert!(!state.is_expired(start + chrono::Duration::seconds(90)));
    }

    #[test]
    fn huge_ttl_saturates() {
        let now = Utc::now();
        let state = SessionState::new(SessionId::new(), now, Duration::MAX);
        assert_eq!(state.ttl_expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn patch_replaces_only_named_fields() {
        let now = Utc::now();
        let mut state = SessionState::new(SessionId::new(), now, Duration::from_secs(60));
        state.metadata.results.insert("analyze".into(), json!({"lang": "go"}));
        state.completed_steps.insert("analyze".into());

        state.apply(SessionPatch {
            completed_steps: Some(BTreeSet::from(["analyze".into(), "build".into()])),
            ..Default::default()
        });

        assert_eq!(state.completed_steps.len(), 2);
        assert_eq!(state.result("analyze"), Some(&json!({"lang": "go"})));
    }

    #[test]
    fn persisted_layout_uses_snake_case_keys() {
        let now = Utc::now();
        let state = SessionState::new(SessionId::from_raw("s1"), now, Duration::from_secs(1));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert!(json["metadata"]["results"].is_object());
        assert!(json["completed_steps"].is_array());
        assert!(json["ttl_expires_at"].is_string());
        assert!(json.get("history").is_none());
    }
}

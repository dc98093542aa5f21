//! Per-pipeline persisted alert state.
//!
//! One JSON document per pipeline, schema version 1. Unknown top-level
//! fields are captured into `extra` and written back verbatim so that
//! newer builds can add fields without older builds destroying them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Candidate;

/// Current state file schema version.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// When a key was last alerted, and at what score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMark {
    /// Unix time of the last emitted alert for this key
    #[serde(with = "chrono::serde::ts_seconds")]
    pub at: DateTime<Utc>,

    /// Score at the time of that alert (refreshed by cool-down demotions)
    pub score: f64,
}

/// Durable per-pipeline state, owned exclusively by the state store and
/// mutated only through the diff stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    /// State file schema version
    #[serde(default = "default_schema")]
    pub schema: u32,

    /// The snapshot of the last successful tick
    #[serde(default)]
    pub last_snapshot: Vec<Candidate>,

    /// Per-key last-alerted bookkeeping for cool-down enforcement
    #[serde(default)]
    pub last_alerted: BTreeMap<String, AlertMark>,

    /// Consecutive source failures since the last successful tick
    #[serde(default)]
    pub consecutive_failures: u32,

    /// Unix time of the last successful tick
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub last_success_at: Option<DateTime<Utc>>,

    /// Unknown top-level fields, preserved on rewrite
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_schema() -> u32 {
    STATE_SCHEMA_VERSION
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            schema: STATE_SCHEMA_VERSION,
            last_snapshot: Vec::new(),
            last_alerted: BTreeMap::new(),
            consecutive_failures: 0,
            last_success_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl AlertState {
    /// Record one absorbed source failure.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Previous rank of a key, if it was in the last snapshot.
    pub fn previous_rank(&self, key: &str) -> Option<usize> {
        self.last_snapshot
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_roundtrip_preserves_unknown_fields() {
        let raw = r#"{
            "schema": 1,
            "last_snapshot": [],
            "last_alerted": { "BTC/USD": { "at": 1755900000, "score": 10.0 } },
            "consecutive_failures": 2,
            "last_success_at": 1755900000,
            "operator_note": "manually inspected"
        }"#;

        let state: AlertState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_alerted["BTC/USD"].score, 10.0);

        let rewritten = serde_json::to_value(&state).unwrap();
        assert_eq!(rewritten["operator_note"], "manually inspected");
        assert_eq!(rewritten["last_success_at"], 1755900000i64);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let state: AlertState = serde_json::from_str(r#"{ "schema": 1 }"#).unwrap();
        assert!(state.last_snapshot.is_empty());
        assert!(state.last_alerted.is_empty());
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_success_at.is_none());
    }

    #[test]
    fn test_record_failure_saturates() {
        let mut state = AlertState {
            consecutive_failures: u32::MAX,
            ..AlertState::default()
        };
        state.record_failure();
        assert_eq!(state.consecutive_failures, u32::MAX);
    }
}

//! Job state objects handed over by the host framework.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known state names used by listings and statistics.
pub mod names {
    pub const ENQUEUED: &str = "Enqueued";
    pub const SCHEDULED: &str = "Scheduled";
    pub const PROCESSING: &str = "Processing";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const DELETED: &str = "Deleted";
    pub const AWAITING: &str = "Awaiting";
}

/// A state transition requested by the host framework.
///
/// The storage layer never interprets state data; it only persists the
/// name, the optional reason and the serialized key/value payload.
pub trait JobState {
    fn name(&self) -> &str;

    fn reason(&self) -> Option<&str>;

    fn serialize_data(&self) -> BTreeMap<String, String>;
}

/// Snapshot of a job's current state as stored on the job document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl StateData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn from_state(state: &dyn JobState) -> Self {
        Self {
            name: state.name().to_string(),
            reason: state.reason().map(str::to_string),
            data: state.serialize_data(),
        }
    }

    /// Case-insensitive lookup of a state data field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

impl JobState for StateData {
    fn name(&self) -> &str {
        &self.name
    }

    fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    fn serialize_data(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}

/// One entry of a job's state history (most recent first on the document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl StateHistoryEntry {
    pub fn from_state(state: &dyn JobState, created_at: DateTime<Utc>) -> Self {
        Self {
            state_name: state.name().to_string(),
            reason: state.reason().map(str::to_string),
            data: state.serialize_data(),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_data_lookup_ignores_case() {
        let state = StateData::new(names::FAILED).with_data("ExceptionMessage", "boom");
        assert_eq!(state.get("exceptionmessage"), Some("boom"));
        assert_eq!(state.get("missing"), None);
    }

    #[test]
    fn history_entry_copies_state_fields() {
        let state = StateData::new(names::SUCCEEDED)
            .with_reason("done")
            .with_data("Latency", "12");
        let now = Utc::now();
        let entry = StateHistoryEntry::from_state(&state, now);

        assert_eq!(entry.state_name, "Succeeded");
        assert_eq!(entry.reason.as_deref(), Some("done"));
        assert_eq!(entry.data.get("Latency").map(String::as_str), Some("12"));
        assert_eq!(entry.created_at, now);
    }
}

//! Persisted document shapes.
//!
//! Every entity the storage layer keeps is one JSON document addressed by a
//! [`DocumentId`](crate::DocumentId). The collection names and field names
//! below form the on-disk schema: renaming them orphans existing data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ModelError, ModelResult};
use crate::id::{DocumentId, JobId};
use crate::state::{StateData, StateHistoryEntry};

/// Collection names.
pub mod collections {
    pub const JOBS: &str = "jobs";
    pub const JOB_QUEUES: &str = "job_queues";
    pub const COUNTERS: &str = "counters";
    pub const SETS: &str = "sets";
    pub const LISTS: &str = "lists";
    pub const HASHES: &str = "hashes";
    pub const SERVERS: &str = "servers";
}

/// A typed document kind stored in one collection.
///
/// Kinds that also implement `Default` can be used with find-or-create: the
/// default value is the "empty" document registered when a key is missing.
pub trait Document: Serialize + DeserializeOwned + Send + 'static {
    const COLLECTION: &'static str;

    /// Id of the document of this kind stored under `key`.
    fn id_for(key: &str) -> DocumentId {
        DocumentId::new(Self::COLLECTION, key)
    }

    fn to_json(&self) -> ModelResult<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_json(value: JsonValue) -> ModelResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Serialized method invocation of a job.
///
/// `parameter_types` and `arguments` hold JSON arrays encoded as strings; the
/// host framework decides what goes in them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationData {
    pub type_name: String,
    pub method: String,
    pub parameter_types: String,
    pub arguments: String,
}

/// Decoded form of [`InvocationData`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub type_name: String,
    pub method: String,
    pub parameter_types: Vec<String>,
    pub args: Vec<JsonValue>,
}

impl InvocationData {
    pub fn new(
        type_name: impl Into<String>,
        method: impl Into<String>,
        parameter_types: &[&str],
        args: &[JsonValue],
    ) -> ModelResult<Self> {
        Ok(Self {
            type_name: type_name.into(),
            method: method.into(),
            parameter_types: serde_json::to_string(parameter_types)?,
            arguments: serde_json::to_string(args)?,
        })
    }

    /// Decode the invocation; fails when the payload is corrupt.
    pub fn deserialize(&self) -> ModelResult<Invocation> {
        if self.type_name.is_empty() || self.method.is_empty() {
            return Err(ModelError::serialization("invocation without type or method"));
        }

        let parameter_types: Vec<String> = serde_json::from_str(&self.parameter_types)?;
        let args: Vec<JsonValue> = serde_json::from_str(&self.arguments)?;

        if parameter_types.len() != args.len() {
            return Err(ModelError::serialization(format!(
                "{} parameter types but {} arguments",
                parameter_types.len(),
                args.len()
            )));
        }

        Ok(Invocation {
            type_name: self.type_name.clone(),
            method: self.method.clone(),
            parameter_types,
            args,
        })
    }
}

/// A job: invocation, parameters, current state and history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    pub invocation_data: InvocationData,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateData>,
    /// Most recent first.
    #[serde(default)]
    pub history: Vec<StateHistoryEntry>,
}

impl JobDocument {
    pub fn state_name(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.name.as_str())
    }
}

impl Document for JobDocument {
    const COLLECTION: &'static str = collections::JOBS;
}

/// One pending or leased delivery of a job on a named queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub queue: String,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(queue: impl Into<String>, job_id: JobId) -> Self {
        Self {
            job_id,
            queue: queue.into(),
            fetched_at: None,
        }
    }

    /// Whether a consumer may claim this entry at `now`.
    ///
    /// Entries leased longer ago than `invisibility_timeout` count as
    /// abandoned by a dead worker. A timeout reaching past the representable
    /// range never expires.
    pub fn is_claimable(&self, now: DateTime<Utc>, invisibility_timeout: chrono::Duration) -> bool {
        match self.fetched_at {
            None => true,
            Some(fetched_at) => fetched_at
                .checked_add_signed(invisibility_timeout)
                .is_some_and(|visible_again| visible_again < now),
        }
    }
}

impl Document for QueueEntry {
    const COLLECTION: &'static str = collections::JOB_QUEUES;
}

/// Integer counter, mutated through server-side increments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDocument {
    pub value: i64,
}

impl CounterDocument {
    /// Field targeted by increment patches.
    pub const VALUE_FIELD: &'static str = "value";
}

impl Document for CounterDocument {
    const COLLECTION: &'static str = collections::COUNTERS;
}

/// Scored set of members.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetDocument {
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
}

impl SetDocument {
    /// Members ordered by ascending score, then by member.
    pub fn ranked(&self) -> Vec<(&str, f64)> {
        let mut ranked: Vec<(&str, f64)> =
            self.scores.iter().map(|(m, s)| (m.as_str(), *s)).collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        ranked
    }
}

impl Document for SetDocument {
    const COLLECTION: &'static str = collections::SETS;
}

/// Ordered list of values (insertion order).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDocument {
    #[serde(default)]
    pub values: Vec<String>,
}

impl ListDocument {
    /// Keep only the inclusive index range `[keep_from, keep_to]`.
    pub fn trim(&mut self, keep_from: usize, keep_to: usize) {
        if keep_to < keep_from {
            self.values.clear();
            return;
        }
        let kept: Vec<String> = self
            .values
            .drain(..)
            .skip(keep_from)
            .take((keep_to - keep_from).saturating_add(1))
            .collect();
        self.values = kept;
    }
}

impl Document for ListDocument {
    const COLLECTION: &'static str = collections::LISTS;
}

/// Field/value map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashDocument {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Document for HashDocument {
    const COLLECTION: &'static str = collections::HASHES;
}

/// Data announced by a worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerData {
    pub worker_count: u32,
    #[serde(default)]
    pub queues: Vec<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Heartbeat record of a worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDocument {
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub data: ServerData,
}

impl Document for ServerDocument {
    const COLLECTION: &'static str = collections::SERVERS;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invocation_round_trips() {
        let data = InvocationData::new(
            "Mailer",
            "send",
            &["String", "Int32"],
            &[json!("hello"), json!(3)],
        )
        .unwrap();

        let invocation = data.deserialize().unwrap();
        assert_eq!(invocation.method, "send");
        assert_eq!(invocation.args, vec![json!("hello"), json!(3)]);
    }

    #[test]
    fn corrupt_invocation_is_an_error() {
        let data = InvocationData {
            type_name: "Mailer".to_string(),
            method: "send".to_string(),
            parameter_types: "[\"String\"]".to_string(),
            arguments: "{not json".to_string(),
        };
        assert!(data.deserialize().is_err());

        let mismatched = InvocationData {
            arguments: "[]".to_string(),
            ..data
        };
        assert!(mismatched.deserialize().is_err());
    }

    #[test]
    fn trim_keeps_inclusive_range() {
        let mut list = ListDocument {
            values: ["a", "b", "c", "d", "e"].iter().map(|s| s.to_string()).collect(),
        };
        list.trim(1, 3);
        assert_eq!(list.values, vec!["b", "c", "d"]);

        list.trim(5, 9);
        assert!(list.values.is_empty());
    }

    #[test]
    fn trim_to_usize_max_keeps_the_tail() {
        let mut list = ListDocument {
            values: ["a", "b", "c"].iter().map(|s| s.to_string()).collect(),
        };
        list.trim(0, usize::MAX);
        assert_eq!(list.values, vec!["a", "b", "c"]);

        list.trim(1, usize::MAX);
        assert_eq!(list.values, vec!["b", "c"]);
    }

    #[test]
    fn ranked_orders_by_score() {
        let mut set = SetDocument::default();
        set.scores.insert("late".to_string(), 10.0);
        set.scores.insert("early".to_string(), -1.0);
        set.scores.insert("mid".to_string(), 2.5);

        let members: Vec<&str> = set.ranked().into_iter().map(|(m, _)| m).collect();
        assert_eq!(members, vec!["early", "mid", "late"]);
    }

    #[test]
    fn leased_entries_become_claimable_after_timeout() {
        let now = Utc::now();
        let mut entry = QueueEntry::new("default", JobId::from("J1"));
        assert!(entry.is_claimable(now, chrono::Duration::minutes(30)));

        entry.fetched_at = Some(now - chrono::Duration::minutes(5));
        assert!(!entry.is_claimable(now, chrono::Duration::minutes(30)));
        assert!(entry.is_claimable(now, chrono::Duration::minutes(1)));
    }

    #[test]
    fn unbounded_invisibility_timeout_never_expires() {
        let now = Utc::now();
        let mut entry = QueueEntry::new("default", JobId::from("J1"));
        entry.fetched_at = Some(now - chrono::Duration::days(365));
        assert!(!entry.is_claimable(now, chrono::Duration::MAX));
    }

    #[test]
    fn counter_field_matches_serialized_name() {
        let json = CounterDocument { value: 4 }.to_json().unwrap();
        assert_eq!(json[CounterDocument::VALUE_FIELD], json!(4));
    }
}

//! Identifiers used across the persisted model.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;

/// Opaque identifier of a background job.
///
/// The host framework owns id generation; ids are stored as plain strings so
/// any scheme round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh, time-ordered id (UUIDv7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl FromStr for JobId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ModelError::invalid_id("JobId: empty"));
        }
        Ok(Self(s.to_string()))
    }
}

/// Full identifier of a stored document: `<collection>/<logical key>`.
///
/// Identifier construction is part of the on-disk schema, so both halves are
/// kept verbatim. The key may itself contain `/`; only the first separator
/// splits collection from key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId {
    collection: String,
    key: String,
}

impl DocumentId {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Build an id from several key parts joined with `/`.
    pub fn from_parts(collection: impl Into<String>, parts: &[&str]) -> Self {
        Self::new(collection, parts.join("/"))
    }

    /// Identifier for a document that has no natural key (queue entries).
    pub fn generated(collection: impl Into<String>) -> Self {
        Self::new(collection, Uuid::now_v7().to_string())
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl core::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

impl FromStr for DocumentId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((collection, key)) if !collection.is_empty() && !key.is_empty() => {
                Ok(Self::new(collection, key))
            }
            _ => Err(ModelError::invalid_id(format!("DocumentId: '{s}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_round_trips_through_display() {
        let id = DocumentId::new("counters", "stats:succeeded:2024-01-01");
        let parsed: DocumentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.key(), "stats:succeeded:2024-01-01");
    }

    #[test]
    fn keys_may_contain_separators() {
        let id = DocumentId::from_parts("servers", &["host", "worker:1"]);
        assert_eq!(id.to_string(), "servers/host/worker:1");

        let parsed: DocumentId = "servers/host/worker:1".parse().unwrap();
        assert_eq!(parsed.collection(), "servers");
        assert_eq!(parsed.key(), "host/worker:1");
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!("no-separator".parse::<DocumentId>().is_err());
        assert!("/key".parse::<DocumentId>().is_err());
        assert!("jobs/".parse::<DocumentId>().is_err());
        assert!("".parse::<JobId>().is_err());
    }
}

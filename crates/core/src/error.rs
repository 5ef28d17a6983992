//! Model error type.

use thiserror::Error;

/// Result type used across the model layer.
pub type ModelResult<T> = Result<T, ModelError>;

/// Model-level error.
///
/// Covers failures that do not involve IO: malformed identifiers, bad keys and
/// payloads that cannot be (de)serialized into a persisted document shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// An identifier was invalid (e.g. missing collection prefix).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A logical key was rejected (empty keys are not addressable).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A document body did not match its expected shape.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl ModelError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

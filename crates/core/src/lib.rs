//! `jobdoc-core`: persisted model of the job storage layer.
//!
//! This crate contains identifiers, document shapes and state objects only
//! (no storage or IO concerns).

pub mod document;
pub mod error;
pub mod id;
pub mod state;

pub use document::{
    collections, CounterDocument, Document, HashDocument, Invocation, InvocationData,
    JobDocument, ListDocument, QueueEntry, ServerData, ServerDocument, SetDocument,
};
pub use error::{ModelError, ModelResult};
pub use id::{DocumentId, JobId};
pub use state::{names as state_names, JobState, StateData, StateHistoryEntry};

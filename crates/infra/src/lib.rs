//! Infrastructure layer: document store backends, sessions, the job queue,
//! write transactions, monitoring and expiration.
//!
//! [`storage::JobStorage`] is the entry point; everything else can also be
//! wired by hand around a [`repository::Repository`].

pub mod config;
pub mod connection;
pub mod expiration;
pub mod monitoring;
pub mod queue;
pub mod repository;
pub mod session;
pub mod storage;
pub mod store;
pub mod transaction;


pub use config::{ConfigError, StorageOptions};
pub use connection::{JobData, StorageConnection};
pub use expiration::{ExpirationReaper, ExpirationReaperHandle, ReaperStats};
pub use monitoring::MonitoringApi;
pub use queue::{CancellationToken, FetchedJob, QueueError};
pub use repository::Repository;
pub use session::DocumentSession;
pub use storage::{JobStorage, StorageError};
pub use store::{DocumentStore, StoreError};
pub use transaction::WriteOnlyTransaction;

//! Storage configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: String, value: String },

    #[error("{0}")]
    OutOfRange(String),
}

/// Storage options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Upper bound of a dequeue wait before re-querying the queue.
    pub queue_poll_interval: Duration,
    /// A lease older than this is considered abandoned by a dead worker.
    pub invisibility_timeout: Duration,
    /// How often the reaper purges expired documents.
    pub expiration_check_interval: Duration,
    /// Maximum documents purged per reaper pass.
    pub expiration_batch_size: usize,
    /// Postgres connection string; `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Queues a worker process listens on, highest priority first.
    pub queues: Vec<String>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            queue_poll_interval: Duration::from_secs(15),
            invisibility_timeout: Duration::from_secs(30 * 60),
            expiration_check_interval: Duration::from_secs(30 * 60),
            expiration_batch_size: 1000,
            database_url: None,
            max_connections: 10,
            queues: vec!["default".to_string()],
        }
    }
}

impl StorageOptions {
    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn with_invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    pub fn with_expiration_check_interval(mut self, interval: Duration) -> Self {
        self.expiration_check_interval = interval;
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Read overrides from the process environment.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `JOBDOC_QUEUE_POLL_INTERVAL_MS` | `queue_poll_interval` |
    /// | `JOBDOC_INVISIBILITY_TIMEOUT_SECS` | `invisibility_timeout` |
    /// | `JOBDOC_EXPIRATION_CHECK_INTERVAL_SECS` | `expiration_check_interval` |
    /// | `JOBDOC_EXPIRATION_BATCH_SIZE` | `expiration_batch_size` |
    /// | `JOBDOC_MAX_CONNECTIONS` | `max_connections` |
    /// | `JOBDOC_QUEUES` (comma separated) | `queues` |
    /// | `DATABASE_URL` | `database_url` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(ms) = parse::<u64, _>(&lookup, "JOBDOC_QUEUE_POLL_INTERVAL_MS")? {
            options.queue_poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "JOBDOC_INVISIBILITY_TIMEOUT_SECS")? {
            options.invisibility_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "JOBDOC_EXPIRATION_CHECK_INTERVAL_SECS")? {
            options.expiration_check_interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse::<usize, _>(&lookup, "JOBDOC_EXPIRATION_BATCH_SIZE")? {
            options.expiration_batch_size = size;
        }
        if let Some(max) = parse::<u32, _>(&lookup, "JOBDOC_MAX_CONNECTIONS")? {
            options.max_connections = max;
        }
        if let Some(raw) = lookup("JOBDOC_QUEUES") {
            options.queues = raw.split(',').map(|q| q.trim().to_string()).collect();
        }
        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.is_empty()) {
            options.database_url = Some(url);
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_poll_interval.is_zero() {
            return Err(ConfigError::OutOfRange(
                "queue_poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.expiration_check_interval.is_zero() {
            return Err(ConfigError::OutOfRange(
                "expiration_check_interval must be greater than zero".to_string(),
            ));
        }
        if self.expiration_batch_size == 0 {
            return Err(ConfigError::OutOfRange(
                "expiration_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.queues.is_empty() || self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(ConfigError::OutOfRange(
                "queues must name at least one non-empty queue".to_string(),
            ));
        }
        if chrono::Duration::from_std(self.invisibility_timeout).is_err() {
            return Err(ConfigError::OutOfRange(
                "invisibility_timeout is too large".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn invisibility_timeout_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.invisibility_timeout).unwrap_or(chrono::Duration::MAX)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let options = StorageOptions::from_lookup(lookup(&[])).unwrap();
        assert_eq!(options, StorageOptions::default());
        assert_eq!(options.queue_poll_interval, Duration::from_secs(15));
    }

    #[test]
    fn variables_override_defaults() {
        let options = StorageOptions::from_lookup(lookup(&[
            ("JOBDOC_QUEUE_POLL_INTERVAL_MS", "250"),
            ("JOBDOC_INVISIBILITY_TIMEOUT_SECS", "60"),
            ("DATABASE_URL", "postgres://localhost/jobs"),
        ]))
        .unwrap();

        assert_eq!(options.queue_poll_interval, Duration::from_millis(250));
        assert_eq!(options.invisibility_timeout, Duration::from_secs(60));
        assert_eq!(options.database_url.as_deref(), Some("postgres://localhost/jobs"));
    }

    #[test]
    fn malformed_and_out_of_range_values_fail() {
        let err = StorageOptions::from_lookup(lookup(&[("JOBDOC_MAX_CONNECTIONS", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "JOBDOC_MAX_CONNECTIONS"));

        let err = StorageOptions::from_lookup(lookup(&[("JOBDOC_QUEUE_POLL_INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange(_)));

        let err = StorageOptions::from_lookup(lookup(&[("JOBDOC_QUEUES", "critical,,default")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange(_)));
    }

    #[test]
    fn queue_list_is_split_and_trimmed() {
        let options = StorageOptions::from_lookup(lookup(&[("JOBDOC_QUEUES", "critical, default")])).unwrap();
        assert_eq!(options.queues, vec!["critical", "default"]);
        assert_eq!(StorageOptions::default().queues, vec!["default"]);
    }
}

//! Error taxonomy for the polling pipeline.
//!
//! Errors are split by the boundary they cross:
//! - [`AdapterError`]: anything a platform adapter can fail with. Contained per source.
//! - [`StorageError`]: database and migration failures.
//! - [`ScoringInputError`]: malformed item fields; scoring falls back to a zero score.
//! - [`PollError`]: the outcome of one source, hashtag or aggregation batch.
//! - [`ConfigError`]: loading the YAML configuration file.

use std::time::Duration;

use crate::models::Platform;

/// Failure raised by a platform adapter while fetching or searching.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status code: {0}")]
    HttpStatus(u16),
    #[error("rate limited by platform")]
    RateLimited { retry_after: Option<Duration> },
    #[error("could not parse platform payload: {0}")]
    Parse(String),
    #[error("operation not supported by adapter: {0}")]
    Unsupported(&'static str),
    #[error("missing credentials for {0}")]
    MissingCredentials(Platform),
    #[error("adapter call timed out")]
    Timeout,
}

impl AdapterError {
    /// Whether a retry in place has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            AdapterError::Request(_) | AdapterError::Timeout => true,
            AdapterError::HttpStatus(code) => *code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoringInputError {
    #[error("item has no posted-at timestamp")]
    MissingTimestamp,
    #[error("counter `{0}` is negative: {1}")]
    NegativeCounter(&'static str, i64),
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("no adapter registered for platform {0}")]
    NoAdapter(Platform),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("unknown platform `{0}`")]
pub struct UnknownPlatform(pub String);

#[derive(Debug, thiserror::Error)]
#[error("unknown poll status `{0}`")]
pub struct UnknownStatus(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(AdapterError::Timeout.is_transient());
        assert!(AdapterError::HttpStatus(503).is_transient());
        assert!(!AdapterError::HttpStatus(404).is_transient());
        assert!(!AdapterError::RateLimited { retry_after: None }.is_transient());
        assert!(!AdapterError::Unsupported("search").is_transient());
    }
}

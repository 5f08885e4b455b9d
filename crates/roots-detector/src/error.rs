//! Error types for detector construction and execution.

use roots_core::PropertyError;
use roots_datastore::DataStoreError;
use thiserror::Error;

/// A descriptor that cannot be turned into a detector.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required property: {0}")]
    MissingProperty(&'static str),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("unknown detector type: {0}")]
    UnknownDetector(String),

    #[error("unknown data store: {0}")]
    UnknownDataStore(String),

    #[error("{0} requires the statistics engine, which is not configured")]
    StatsUnavailable(&'static str),

    #[error("invalid detector configuration: {0}")]
    Invalid(String),
}

/// Failure of one detector run. The cursor is left where it was, so the
/// same window is retried on the next tick.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("data store query failed: {0}")]
    DataStore(#[from] DataStoreError),
}

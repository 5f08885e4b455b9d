use roots_core::PropertyError;
use roots_datastore::DataStoreError;
use roots_stats::StatsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("data store query failed: {0}")]
    DataStore(#[from] DataStoreError),

    #[error("statistics engine: {0}")]
    Stats(#[from] StatsError),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("unknown change point method: {0}")]
    UnknownChangePointMethod(String),

    #[error("invalid analysis setting: {0}")]
    Invalid(String),
}

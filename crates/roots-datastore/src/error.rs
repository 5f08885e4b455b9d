//! Error type shared by every data store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("data store request failed: {0}")]
    Request(String),

    #[error("unexpected data store response: {0}")]
    Response(String),

    #[error("invalid data store query: {0}")]
    InvalidQuery(String),

    #[error("{store} does not support {operation}")]
    Unsupported {
        store: &'static str,
        operation: &'static str,
    },

    #[error("unknown data store: {0}")]
    Unknown(String),
}

impl From<reqwest::Error> for DataStoreError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

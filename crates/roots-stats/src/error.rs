//! Error types for the statistics engine client.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("failed to start statistics engine: {0}")]
    Spawn(String),

    #[error("statistics engine handshake failed: {0}")]
    Handshake(String),

    #[error("statistics engine closed the connection")]
    Closed,

    #[error("statistics engine did not answer within {0:?}")]
    Timeout(Duration),

    #[error("evaluation of `{expression}` failed: {message}")]
    Evaluation { expression: String, message: String },

    #[error("`{expression}` returned {actual}, expected {expected}")]
    UnexpectedType {
        expression: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("malformed engine response: {0}")]
    Protocol(String),

    #[error("statistics pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    #[error("statistics pool is closed")]
    PoolClosed,

    #[error("statistics engine io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("statistics engine json error: {0}")]
    Json(#[from] serde_json::Error),
}

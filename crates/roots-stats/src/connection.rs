//! Connection seam between the pool and an engine transport.
//!
//! The process-backed implementation lives in [`crate::process`]; tests use
//! scripted in-memory connections.

use async_trait::async_trait;

use crate::error::StatsError;
use crate::value::{StatsValue, StatsVector};

/// One stateful engine connection. Symbols assigned through it stay defined
/// until removed, so connections must not be shared between callers.
#[async_trait]
pub trait StatsConnection: Send {
    /// Bind `name` to a vector.
    async fn assign(&mut self, name: &str, value: &StatsVector) -> Result<(), StatsError>;

    /// Evaluate an expression and return its value.
    async fn eval(&mut self, expression: &str) -> Result<StatsValue, StatsError>;

    /// Evaluate an expression and bind its result to `name` without
    /// transferring it back.
    async fn eval_assign(&mut self, name: &str, expression: &str) -> Result<(), StatsError>;

    /// Remove symbols from the engine's workspace.
    async fn remove(&mut self, names: &[String]) -> Result<(), StatsError>;

    /// False once the transport is known to be unusable.
    fn is_alive(&mut self) -> bool;
}

/// Opens new connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StatsConnection>, StatsError>;
}

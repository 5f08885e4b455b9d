//! roots-stats: client for the external statistics engine.
//!
//! The engine is a long-lived child process speaking newline-delimited
//! JSON-RPC 2.0 over stdio. Callers never talk to a connection directly:
//! they borrow a [`PooledSession`] from a bounded [`StatsPool`], assign
//! vectors, evaluate expressions, and the session removes whatever it
//! assigned when it is released.

pub mod connection;
pub mod error;
pub mod pool;
pub mod process;
pub mod scripted;
pub mod value;

pub use connection::{ConnectionFactory, StatsConnection};
pub use error::StatsError;
pub use pool::{PoolConfig, PooledSession, StatsPool};
pub use process::{EngineCommand, ProcessConnection, ProcessConnectionFactory};
pub use scripted::{ScriptedEngine, Workspace};
pub use value::{StatsValue, StatsVector};

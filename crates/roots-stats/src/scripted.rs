//! In-memory engine for tests of code that borrows statistics sessions.
//!
//! Assigned vectors are kept per connection in a [`Workspace`]; every
//! evaluation is answered by a caller-supplied handler that can read them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::connection::{ConnectionFactory, StatsConnection};
use crate::error::StatsError;
use crate::pool::{PoolConfig, StatsPool};
use crate::value::{StatsValue, StatsVector};

/// Symbols defined on one scripted connection.
#[derive(Debug, Default, Clone)]
pub struct Workspace {
    vectors: HashMap<String, StatsVector>,
    bound: HashMap<String, String>,
}

impl Workspace {
    pub fn doubles(&self, name: &str) -> Option<&[f64]> {
        match self.vectors.get(name)? {
            StatsVector::Doubles(v) => Some(v),
            StatsVector::Strings(_) => None,
        }
    }

    pub fn strings(&self, name: &str) -> Option<&[String]> {
        match self.vectors.get(name)? {
            StatsVector::Strings(v) => Some(v),
            StatsVector::Doubles(_) => None,
        }
    }

    /// Expression a name was bound to through `eval_assign`.
    pub fn bound(&self, name: &str) -> Option<&str> {
        self.bound.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vectors.contains_key(name) || self.bound.contains_key(name)
    }
}

type Handler = dyn Fn(&str, &Workspace) -> Result<StatsValue, String> + Send + Sync;

pub struct ScriptedEngine {
    handler: Box<Handler>,
    log: Mutex<Vec<String>>,
    connects: AtomicUsize,
}

impl ScriptedEngine {
    /// `handler` answers `eval`; an `Err` becomes an evaluation error.
    pub fn new(
        handler: impl Fn(&str, &Workspace) -> Result<StatsValue, String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        })
    }

    /// Pool whose connections all talk to this engine.
    pub fn pool(self: &Arc<Self>, config: PoolConfig) -> StatsPool {
        StatsPool::new(Arc::new(ScriptedFactory(self.clone())), config)
    }

    /// Every call in order, e.g. `assign x`, `eval cor(x, y)`, `remove x,y`.
    pub fn log(&self) -> Vec<String> {
        self.lock_log().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn record(&self, entry: String) {
        self.lock_log().push(entry);
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.log.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct ScriptedFactory(Arc<ScriptedEngine>);

#[async_trait]
impl ConnectionFactory for ScriptedFactory {
    async fn connect(&self) -> Result<Box<dyn StatsConnection>, StatsError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            engine: self.0.clone(),
            workspace: Workspace::default(),
        }))
    }
}

struct ScriptedConnection {
    engine: Arc<ScriptedEngine>,
    workspace: Workspace,
}

#[async_trait]
impl StatsConnection for ScriptedConnection {
    async fn assign(&mut self, name: &str, value: &StatsVector) -> Result<(), StatsError> {
        self.engine.record(format!("assign {name}"));
        self.workspace.bound.remove(name);
        self.workspace.vectors.insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn eval(&mut self, expression: &str) -> Result<StatsValue, StatsError> {
        self.engine.record(format!("eval {expression}"));
        (self.engine.handler)(expression, &self.workspace).map_err(|message| {
            StatsError::Evaluation {
                expression: expression.to_string(),
                message,
            }
        })
    }

    async fn eval_assign(&mut self, name: &str, expression: &str) -> Result<(), StatsError> {
        self.engine.record(format!("assign_eval {name} {expression}"));
        self.workspace.vectors.remove(name);
        self.workspace
            .bound
            .insert(name.to_string(), expression.to_string());
        Ok(())
    }

    async fn remove(&mut self, names: &[String]) -> Result<(), StatsError> {
        self.engine.record(format!("remove {}", names.join(",")));
        for name in names {
            self.workspace.vectors.remove(name);
            self.workspace.bound.remove(name);
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        true
    }
}

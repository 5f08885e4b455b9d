//! Bounded pool of engine connections.
//!
//! `max_total` connections may be borrowed at once (a semaphore permit per
//! session); at most `max_idle` are kept around after release, and idle
//! connections older than `min_evictable_idle` are dropped by
//! [`StatsPool::evict_idle`]. A session returns its connection when dropped,
//! so early returns and `?` paths release it too. Symbols a dropped session
//! left behind are removed by the next borrower before reuse.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionFactory, StatsConnection};
use crate::error::StatsError;
use crate::value::{StatsValue, StatsVector};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_total: usize,
    pub max_idle: usize,
    pub min_evictable_idle: Duration,
    pub borrow_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 10,
            max_idle: 2,
            min_evictable_idle: Duration::from_millis(10_000),
            borrow_timeout: Duration::from_secs(30),
        }
    }
}

struct IdleConnection {
    conn: Box<dyn StatsConnection>,
    since: Instant,
    /// Symbols a session dropped without cleaning up.
    stale: Vec<String>,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct StatsPool {
    inner: Arc<PoolInner>,
}

impl StatsPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_total.max(1)));
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                permits,
                idle: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a session, waiting up to `borrow_timeout` for a free slot.
    pub async fn borrow(&self) -> Result<PooledSession, StatsError> {
        if self.is_closed() {
            return Err(StatsError::PoolClosed);
        }
        let wait = self.inner.config.borrow_timeout;
        let permit = match tokio::time::timeout(wait, self.inner.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(StatsError::PoolClosed),
            Err(_) => return Err(StatsError::PoolExhausted(wait)),
        };

        while let Some(mut idle) = self.pop_idle() {
            if !idle.conn.is_alive() {
                tracing::debug!("discarding dead statistics connection");
                continue;
            }
            if !idle.stale.is_empty() {
                if let Err(e) = idle.conn.remove(&idle.stale).await {
                    tracing::warn!("failed to clean up stale symbols, discarding connection: {e}");
                    continue;
                }
            }
            return Ok(PooledSession::new(idle.conn, self.clone(), permit));
        }

        let conn = self.inner.factory.connect().await?;
        Ok(PooledSession::new(conn, self.clone(), permit))
    }

    /// Drop idle connections that have been idle for at least
    /// `min_evictable_idle`. Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let min_idle = self.inner.config.min_evictable_idle;
        let mut idle = self.lock_idle();
        let before = idle.len();
        idle.retain(|c| c.since.elapsed() < min_idle);
        before - idle.len()
    }

    /// Run [`Self::evict_idle`] every `every` until `cancel` fires.
    pub fn spawn_evictor(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = pool.evict_idle();
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted idle statistics connections");
                        }
                    }
                }
            }
        })
    }

    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    /// Sessions currently borrowed.
    pub fn active_count(&self) -> usize {
        self.inner.config.max_total.max(1) - self.inner.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Reject further borrows and drop idle connections. Sessions still out
    /// are dropped when released.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.permits.close();
        let drained = std::mem::take(&mut *self.lock_idle());
        tracing::info!(idle = drained.len(), "statistics pool closed");
    }

    fn pop_idle(&self) -> Option<IdleConnection> {
        self.lock_idle().pop_front()
    }

    fn give_back(&self, mut conn: Box<dyn StatsConnection>, stale: Vec<String>) {
        if self.is_closed() || !conn.is_alive() {
            return;
        }
        let mut idle = self.lock_idle();
        if idle.len() >= self.inner.config.max_idle {
            return;
        }
        idle.push_back(IdleConnection {
            conn,
            since: Instant::now(),
            stale,
        });
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, VecDeque<IdleConnection>> {
        // A panic while holding the lock leaves the queue structurally valid.
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ─── Session ────────────────────────────────────────────────────────

/// A borrowed connection plus the symbols assigned through it.
pub struct PooledSession {
    conn: Option<Box<dyn StatsConnection>>,
    symbols: Vec<String>,
    pool: StatsPool,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    fn new(conn: Box<dyn StatsConnection>, pool: StatsPool, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            symbols: Vec::new(),
            pool,
            _permit: permit,
        }
    }

    fn conn(&mut self) -> Result<&mut Box<dyn StatsConnection>, StatsError> {
        self.conn.as_mut().ok_or(StatsError::Closed)
    }

    fn track(&mut self, name: &str) {
        if !self.symbols.iter().any(|s| s == name) {
            self.symbols.push(name.to_string());
        }
    }

    /// Names assigned so far, in assignment order.
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub async fn assign_doubles(&mut self, name: &str, values: &[f64]) -> Result<(), StatsError> {
        self.conn()?
            .assign(name, &StatsVector::Doubles(values.to_vec()))
            .await?;
        self.track(name);
        Ok(())
    }

    pub async fn assign_strings(
        &mut self,
        name: &str,
        values: &[String],
    ) -> Result<(), StatsError> {
        self.conn()?
            .assign(name, &StatsVector::Strings(values.to_vec()))
            .await?;
        self.track(name);
        Ok(())
    }

    pub async fn eval(&mut self, expression: &str) -> Result<StatsValue, StatsError> {
        self.conn()?.eval(expression).await
    }

    pub async fn eval_doubles(&mut self, expression: &str) -> Result<Vec<f64>, StatsError> {
        self.eval(expression).await?.into_doubles(expression)
    }

    /// First element of a numeric result.
    pub async fn eval_double(&mut self, expression: &str) -> Result<f64, StatsError> {
        self.eval_doubles(expression)
            .await?
            .first()
            .copied()
            .ok_or_else(|| StatsError::Evaluation {
                expression: expression.to_string(),
                message: "empty result".to_string(),
            })
    }

    pub async fn eval_integers(&mut self, expression: &str) -> Result<Vec<i64>, StatsError> {
        self.eval(expression).await?.into_integers(expression)
    }

    pub async fn eval_strings(&mut self, expression: &str) -> Result<Vec<String>, StatsError> {
        self.eval(expression).await?.into_strings(expression)
    }

    /// Evaluate `expression` and keep the result in the engine as `name`.
    pub async fn eval_and_assign(&mut self, name: &str, expression: &str) -> Result<(), StatsError> {
        self.conn()?.eval_assign(name, expression).await?;
        self.track(name);
        Ok(())
    }

    /// Remove every assigned symbol and return the connection to the pool.
    /// A connection that fails cleanup is discarded instead.
    pub async fn close(mut self) -> Result<(), StatsError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let symbols = std::mem::take(&mut self.symbols);
        if !symbols.is_empty() {
            conn.remove(&symbols).await?;
        }
        self.pool.give_back(conn, Vec::new());
        Ok(())
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let stale = std::mem::take(&mut self.symbols);
            self.pool.give_back(conn, stale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    // ── Fake engine ──────────────────────────────────────────────────

    #[derive(Default)]
    struct Script {
        results: HashMap<String, StatsValue>,
        log: Mutex<Vec<String>>,
        connects: AtomicUsize,
        dead: AtomicBool,
    }

    struct FakeConnection {
        script: Arc<Script>,
    }

    #[async_trait]
    impl StatsConnection for FakeConnection {
        async fn assign(&mut self, name: &str, _value: &StatsVector) -> Result<(), StatsError> {
            self.script.log.lock().unwrap().push(format!("assign {name}"));
            Ok(())
        }

        async fn eval(&mut self, expression: &str) -> Result<StatsValue, StatsError> {
            self.script.log.lock().unwrap().push(format!("eval {expression}"));
            self.script
                .results
                .get(expression)
                .cloned()
                .ok_or_else(|| StatsError::Evaluation {
                    expression: expression.to_string(),
                    message: "object not found".to_string(),
                })
        }

        async fn eval_assign(&mut self, name: &str, expression: &str) -> Result<(), StatsError> {
            self.script
                .log
                .lock()
                .unwrap()
                .push(format!("assign_eval {name} {expression}"));
            Ok(())
        }

        async fn remove(&mut self, names: &[String]) -> Result<(), StatsError> {
            self.script
                .log
                .lock()
                .unwrap()
                .push(format!("remove {}", names.join(",")));
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            !self.script.dead.load(Ordering::SeqCst)
        }
    }

    struct FakeFactory(Arc<Script>);

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        async fn connect(&self) -> Result<Box<dyn StatsConnection>, StatsError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                script: self.0.clone(),
            }))
        }
    }

    fn pool_with(script: Arc<Script>, config: PoolConfig) -> StatsPool {
        StatsPool::new(Arc::new(FakeFactory(script)), config)
    }

    fn log(script: &Script) -> Vec<String> {
        script.log.lock().unwrap().clone()
    }

    // ── 1. reuse ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn released_connection_is_reused() {
        let script = Arc::new(Script::default());
        let pool = pool_with(script.clone(), PoolConfig::default());

        let session = pool.borrow().await.expect("borrow");
        assert_eq!(pool.active_count(), 1);
        session.close().await.expect("close");
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 1);

        let _session = pool.borrow().await.expect("borrow again");
        assert_eq!(script.connects.load(Ordering::SeqCst), 1);
    }

    // ── 2. exhaustion ─────────────────────────────────────────────────

    #[tokio::test]
    async fn borrow_times_out_when_exhausted() {
        let script = Arc::new(Script::default());
        let pool = pool_with(
            script,
            PoolConfig {
                max_total: 1,
                borrow_timeout: Duration::from_millis(30),
                ..PoolConfig::default()
            },
        );
        let _held = pool.borrow().await.expect("first borrow");
        let err = pool.borrow().await.err().expect("second borrow must fail");
        assert!(matches!(err, StatsError::PoolExhausted(_)));
    }

    // ── 3. symbol cleanup ─────────────────────────────────────────────

    #[tokio::test]
    async fn close_removes_assigned_symbols() {
        let script = Arc::new(Script {
            results: HashMap::from([(
                "cor(x, y)".to_string(),
                StatsValue::Doubles(vec![0.25]),
            )]),
            ..Script::default()
        });
        let pool = pool_with(script.clone(), PoolConfig::default());

        let mut session = pool.borrow().await.expect("borrow");
        session.assign_doubles("x", &[1.0, 2.0]).await.expect("assign x");
        session.assign_doubles("y", &[2.0, 4.0]).await.expect("assign y");
        session.assign_doubles("x", &[3.0, 4.0]).await.expect("reassign x");
        session.eval_and_assign("tw", "dtw(x, y)").await.expect("dtw");
        assert_eq!(session.eval_double("cor(x, y)").await.expect("cor"), 0.25);
        assert_eq!(session.symbols(), ["x", "y", "tw"]);
        session.close().await.expect("close");

        assert_eq!(log(&script).last().map(String::as_str), Some("remove x,y,tw"));
    }

    #[tokio::test]
    async fn dropped_session_is_cleaned_by_next_borrower() {
        let script = Arc::new(Script::default());
        let pool = pool_with(script.clone(), PoolConfig::default());

        {
            let mut session = pool.borrow().await.expect("borrow");
            session.assign_doubles("x", &[1.0]).await.expect("assign");
            // Failing evaluation followed by an early drop.
            assert!(session.eval("undefined(x)").await.is_err());
        }
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_count(), 0);

        let _session = pool.borrow().await.expect("borrow");
        assert_eq!(log(&script).last().map(String::as_str), Some("remove x"));
    }

    // ── 4. idle bounds ────────────────────────────────────────────────

    #[tokio::test]
    async fn idle_connections_capped_at_max_idle() {
        let script = Arc::new(Script::default());
        let pool = pool_with(script.clone(), PoolConfig::default());

        let a = pool.borrow().await.expect("a");
        let b = pool.borrow().await.expect("b");
        let c = pool.borrow().await.expect("c");
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(script.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn evicts_connections_idle_past_threshold() {
        let script = Arc::new(Script::default());
        let pool = pool_with(
            script,
            PoolConfig {
                min_evictable_idle: Duration::ZERO,
                ..PoolConfig::default()
            },
        );
        drop(pool.borrow().await.expect("borrow"));
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn fresh_idle_connections_survive_eviction() {
        let pool = pool_with(Arc::new(Script::default()), PoolConfig::default());
        drop(pool.borrow().await.expect("borrow"));
        assert_eq!(pool.evict_idle(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    // ── 5. lifecycle ──────────────────────────────────────────────────

    #[tokio::test]
    async fn dead_connections_are_not_reused() {
        let script = Arc::new(Script::default());
        let pool = pool_with(script.clone(), PoolConfig::default());
        let session = pool.borrow().await.expect("borrow");
        script.dead.store(true, Ordering::SeqCst);
        drop(session);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn closed_pool_rejects_borrow() {
        let pool = pool_with(Arc::new(Script::default()), PoolConfig::default());
        drop(pool.borrow().await.expect("borrow"));
        pool.close();
        assert_eq!(pool.idle_count(), 0);
        let err = pool.borrow().await.err().expect("closed");
        assert!(matches!(err, StatsError::PoolClosed));
    }
}

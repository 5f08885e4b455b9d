//! Anomaly event bus.
//!
//! Detectors publish each anomaly once; every registered subscriber receives
//! it. In [`BusMode::Sync`] `publish` returns after all subscribers ran. In
//! [`BusMode::Async`] `publish` only enqueues: a dispatch task fans events
//! out to subscribers on tracked tasks, at most `workers` deliveries at a
//! time. A failing or panicking subscriber is logged and never affects the
//! publisher or the other subscribers.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use roots_core::Anomaly;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

#[async_trait]
pub trait AnomalySubscriber: Send + Sync {
    /// Used in logs.
    fn name(&self) -> &str;

    async fn on_anomaly(&self, anomaly: &Anomaly) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Sync,
    Async { workers: usize },
}

type Subscribers = Arc<RwLock<Vec<Arc<dyn AnomalySubscriber>>>>;

struct AsyncDispatch {
    tx: Mutex<Option<mpsc::UnboundedSender<Arc<Anomaly>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
}

struct BusInner {
    mode: BusMode,
    subscribers: Subscribers,
    dispatch: Option<AsyncDispatch>,
    published: AtomicU64,
}

/// Cheap to clone; clones share subscribers and dispatch state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus. Async mode spawns the dispatch task, so it must be
    /// called from within a tokio runtime.
    pub fn new(mode: BusMode) -> Self {
        let subscribers: Subscribers = Arc::default();
        let dispatch = match mode {
            BusMode::Sync => None,
            BusMode::Async { workers } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let tracker = TaskTracker::new();
                let handle = tokio::spawn(dispatch_loop(
                    rx,
                    subscribers.clone(),
                    tracker.clone(),
                    Arc::new(Semaphore::new(workers.max(1))),
                ));
                Some(AsyncDispatch {
                    tx: Mutex::new(Some(tx)),
                    dispatcher: Mutex::new(Some(handle)),
                    tracker,
                })
            }
        };
        Self {
            inner: Arc::new(BusInner {
                mode,
                subscribers,
                dispatch,
                published: AtomicU64::new(0),
            }),
        }
    }

    pub fn mode(&self) -> BusMode {
        self.inner.mode
    }

    pub fn subscribe(&self, subscriber: Arc<dyn AnomalySubscriber>) {
        tracing::debug!(subscriber = subscriber.name(), "anomaly subscriber registered");
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        snapshot(&self.inner.subscribers).len()
    }

    /// Anomalies accepted by `publish` so far.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub async fn publish(&self, anomaly: Anomaly) {
        let anomaly = Arc::new(anomaly);
        match &self.inner.dispatch {
            None => {
                self.inner.published.fetch_add(1, Ordering::Relaxed);
                for subscriber in snapshot(&self.inner.subscribers) {
                    deliver(subscriber.as_ref(), &anomaly).await;
                }
            }
            Some(dispatch) => {
                let sent = dispatch
                    .tx
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .as_ref()
                    .map(|tx| tx.send(anomaly.clone()).is_ok())
                    .unwrap_or(false);
                if sent {
                    self.inner.published.fetch_add(1, Ordering::Relaxed);
                } else {
                    tracing::warn!(anomaly_id = anomaly.id(), "event bus is shut down, anomaly dropped");
                }
            }
        }
    }

    /// Stop accepting events and wait for queued deliveries to finish.
    pub async fn shutdown(&self) {
        let Some(dispatch) = &self.inner.dispatch else {
            return;
        };
        drop(dispatch.tx.lock().unwrap_or_else(|p| p.into_inner()).take());
        let handle = dispatch
            .dispatcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("event dispatcher terminated abnormally: {e}");
            }
        }
        dispatch.tracker.close();
        dispatch.tracker.wait().await;
        tracing::debug!("event bus drained");
    }
}

fn snapshot(subscribers: &Subscribers) -> Vec<Arc<dyn AnomalySubscriber>> {
    subscribers.read().unwrap_or_else(|p| p.into_inner()).clone()
}

async fn deliver(subscriber: &dyn AnomalySubscriber, anomaly: &Anomaly) {
    match AssertUnwindSafe(subscriber.on_anomaly(anomaly))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(
            subscriber = subscriber.name(),
            anomaly_id = anomaly.id(),
            "anomaly subscriber failed: {e:#}"
        ),
        Err(_) => tracing::error!(
            subscriber = subscriber.name(),
            anomaly_id = anomaly.id(),
            "anomaly subscriber panicked"
        ),
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Arc<Anomaly>>,
    subscribers: Subscribers,
    tracker: TaskTracker,
    workers: Arc<Semaphore>,
) {
    while let Some(anomaly) = rx.recv().await {
        for subscriber in snapshot(&subscribers) {
            let Ok(permit) = workers.clone().acquire_owned().await else {
                return;
            };
            let anomaly = anomaly.clone();
            tracker.spawn(async move {
                deliver(subscriber.as_ref(), &anomaly).await;
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roots_core::{DetectorInfo, Properties};

    pub(crate) struct Recorder {
        pub seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AnomalySubscriber for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_anomaly(&self, anomaly: &Anomaly) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(anomaly.operation().to_string());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl AnomalySubscriber for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_anomaly(&self, _anomaly: &Anomaly) -> anyhow::Result<()> {
            anyhow::bail!("downstream unavailable")
        }
    }

    struct Panicking;

    #[async_trait]
    impl AnomalySubscriber for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn on_anomaly(&self, _anomaly: &Anomaly) -> anyhow::Result<()> {
            panic!("subscriber bug")
        }
    }

    fn anomaly(op: &str) -> Anomaly {
        let info = Arc::new(DetectorInfo {
            application: "app".into(),
            data_store: "default".into(),
            period_secs: 60,
            history_secs: 3600,
            properties: Properties::new(),
        });
        Anomaly::builder(info)
            .interval(1, 2)
            .operation(op)
            .description("test")
            .build()
            .expect("anomaly")
    }

    #[tokio::test]
    async fn sync_publish_reaches_every_subscriber_despite_failures() {
        let bus = EventBus::new(BusMode::Sync);
        let first = Recorder::new();
        let last = Recorder::new();
        bus.subscribe(first.clone());
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(Arc::new(Panicking));
        bus.subscribe(last.clone());

        bus.publish(anomaly("GET /")).await;

        assert_eq!(first.seen(), vec!["GET /"]);
        assert_eq!(last.seen(), vec!["GET /"]);
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn async_publish_delivers_after_shutdown_drain() {
        let bus = EventBus::new(BusMode::Async { workers: 2 });
        let recorder = Recorder::new();
        bus.subscribe(Arc::new(Panicking));
        bus.subscribe(recorder.clone());

        for op in ["a", "b", "c"] {
            bus.publish(anomaly(op)).await;
        }
        bus.shutdown().await;

        let mut seen = recorder.seen();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_dropped() {
        let bus = EventBus::new(BusMode::Async { workers: 1 });
        let recorder = Recorder::new();
        bus.subscribe(recorder.clone());
        bus.shutdown().await;
        bus.publish(anomaly("late")).await;
        assert_eq!(bus.published(), 0);
        assert!(recorder.seen().is_empty());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(BusMode::Sync);
        bus.publish(anomaly("x")).await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}

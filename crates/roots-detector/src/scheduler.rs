//! Periodic execution of detectors.
//!
//! Each scheduled application gets a ticker task that fires once per detector
//! period. A firing takes the job's lock with `try_lock`: if the previous run
//! of the same application is still going the firing is skipped, never
//! queued. Runs of different applications proceed concurrently, bounded by a
//! shared worker semaphore. Every ticker and firing is tracked so `destroy`
//! can wait for in-flight runs.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::detector::{AnomalyDetector, RunReport};

pub const DEFAULT_WORKERS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Detector runs allowed at the same time across all applications.
    pub workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler has been destroyed")]
    Destroyed,

    #[error("a detector is already scheduled for application {0}")]
    Duplicate(String),

    #[error("no detector scheduled for application {0}")]
    NotScheduled(String),
}

/// What happened to one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Completed(RunReport),
    /// The run returned an error; the detector retries on the next firing.
    Failed,
    Panicked,
    /// The previous run of the same application was still in progress.
    Skipped,
}

/// Per-application firing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStats {
    pub fired: u64,
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct JobCounters {
    fired: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl JobCounters {
    fn snapshot(&self) -> JobStats {
        JobStats {
            fired: self.fired.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

type SharedDetector = Arc<tokio::sync::Mutex<Box<dyn AnomalyDetector>>>;

struct Job {
    detector: SharedDetector,
    counters: Arc<JobCounters>,
    cancel: CancellationToken,
}

struct SchedulerInner {
    jobs: Mutex<HashMap<String, Job>>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    root: CancellationToken,
    destroyed: AtomicBool,
}

/// Cheap to clone; clones drive the same set of jobs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                jobs: Mutex::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(config.workers.max(1))),
                tracker: TaskTracker::new(),
                root: CancellationToken::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.inner.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_alive(&self) -> Result<(), SchedulerError> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            Err(SchedulerError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Register a detector without starting its ticker. Firings come only
    /// from [`Scheduler::fire`].
    pub fn register(&self, detector: Box<dyn AnomalyDetector>) -> Result<(), SchedulerError> {
        self.insert_job(detector).map(|_| ())
    }

    fn insert_job(&self, detector: Box<dyn AnomalyDetector>) -> Result<CancellationToken, SchedulerError> {
        self.check_alive()?;
        let application = detector.application().to_string();
        let mut jobs = self.jobs();
        if jobs.contains_key(&application) {
            return Err(SchedulerError::Duplicate(application));
        }
        let cancel = self.inner.root.child_token();
        jobs.insert(
            application,
            Job {
                detector: Arc::new(tokio::sync::Mutex::new(detector)),
                counters: Arc::default(),
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    /// Register a detector and fire it once per period, starting one period
    /// from now. Must be called within a tokio runtime.
    pub fn schedule(&self, detector: Box<dyn AnomalyDetector>) -> Result<(), SchedulerError> {
        let application = detector.application().to_string();
        let period = detector.period();
        let cancel = self.insert_job(detector)?;
        tracing::info!(
            application = %application,
            period_secs = period.as_secs(),
            "anomaly detector scheduled"
        );
        let scheduler = self.clone();
        self.inner
            .tracker
            .spawn(scheduler.tick_loop(application, period, cancel));
        Ok(())
    }

    async fn tick_loop(self, application: String, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(application = %application, "detector ticker stopped");
                    break;
                }
                _ = interval.tick() => {
                    let scheduler = self.clone();
                    let application = application.clone();
                    self.inner.tracker.spawn(async move {
                        let _ = scheduler.fire(&application, roots_core::now_ms()).await;
                    });
                }
            }
        }
    }

    /// Run the application's detector once for `now`, unless its previous
    /// run is still in progress.
    pub async fn fire(&self, application: &str, now: i64) -> Result<FireOutcome, SchedulerError> {
        self.check_alive()?;
        let (detector, counters) = {
            let jobs = self.jobs();
            let job = jobs
                .get(application)
                .ok_or_else(|| SchedulerError::NotScheduled(application.to_string()))?;
            (job.detector.clone(), job.counters.clone())
        };
        counters.fired.fetch_add(1, Ordering::Relaxed);

        let Ok(mut guard) = detector.try_lock_owned() else {
            counters.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                application = %application,
                "previous detector run still in progress, firing skipped"
            );
            return Ok(FireOutcome::Skipped);
        };
        let _permit = self
            .inner
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SchedulerError::Destroyed)?;

        match AssertUnwindSafe(guard.run(now)).catch_unwind().await {
            Ok(Ok(report)) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    application = %application,
                    start = report.window.start,
                    end = report.window.end,
                    evaluated = report.evaluated,
                    delivered = report.delivered,
                    suppressed = report.suppressed,
                    "detector run completed"
                );
                Ok(FireOutcome::Completed(report))
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(application = %application, "detector run failed: {e}");
                Ok(FireOutcome::Failed)
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(application = %application, "detector run panicked");
                Ok(FireOutcome::Panicked)
            }
        }
    }

    /// Stop future firings for `application`. A run already in progress
    /// finishes normally.
    pub fn cancel(&self, application: &str) -> Result<(), SchedulerError> {
        let job = self
            .jobs()
            .remove(application)
            .ok_or_else(|| SchedulerError::NotScheduled(application.to_string()))?;
        job.cancel.cancel();
        tracing::info!(application = %application, "anomaly detector cancelled");
        Ok(())
    }

    pub fn stats(&self, application: &str) -> Option<JobStats> {
        self.jobs().get(application).map(|j| j.counters.snapshot())
    }

    pub fn applications(&self) -> Vec<String> {
        let mut apps: Vec<String> = self.jobs().keys().cloned().collect();
        apps.sort();
        apps
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Cancel every job and wait for in-flight runs. Later calls to
    /// `schedule` or `fire` fail with [`SchedulerError::Destroyed`].
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.root.cancel();
        let jobs = std::mem::take(&mut *self.jobs());
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.workers.close();
        tracing::info!(jobs = jobs.len(), "scheduler destroyed");
    }
}

//! The detector contract and the state every detector shares.
//!
//! [`DetectorCore`] owns the windowing cursor and the per-key wait state.
//! Concrete detectors embed one and drive it from `run`:
//!
//! 1. `next_window(now)`: the initial bulk window on the first run,
//!    `[end, end + period]` afterwards
//! 2. query the data store; on failure return early so the cursor stays put
//! 3. `commit(window)`, merge into history, evict anything older than
//!    `end - history`
//! 4. evaluate keys, handing proposed anomalies to `report`, which
//!    suppresses them while the key's wait period is running

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roots_core::{Anomaly, AnomalyBuilder, DetectorInfo, Properties};
use roots_datastore::DataStore;

use crate::bus::EventBus;
use crate::error::{ConfigError, DetectorError};

/// How far behind wall-clock time the first window ends, so that telemetry
/// still being indexed is not missed.
pub const DEFAULT_LAG_MS: i64 = 60_000;
pub const DEFAULT_PERIOD_SECS: u64 = 60;
pub const DEFAULT_HISTORY_SECS: u64 = 3600;
pub const DEFAULT_DATA_STORE: &str = "default";

#[async_trait]
pub trait AnomalyDetector: Send {
    fn core(&self) -> &DetectorCore;

    fn application(&self) -> &str {
        self.core().application()
    }

    fn period(&self) -> Duration {
        Duration::from_secs(self.core().config().period_secs)
    }

    /// One detection cycle for the window ending at or before `now`.
    async fn run(&mut self, now: i64) -> Result<RunReport, DetectorError>;
}

// ─── Wait policy ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitPolicy {
    /// Every proposed anomaly is delivered.
    None,
    /// Fixed quiet period after a delivered anomaly.
    Fixed { ms: i64 },
    /// Quiet period from the half-life of a per-minute reliability factor:
    /// `ln(0.5) / ln(reliability)` minutes.
    HalfLife { reliability: f64 },
}

impl WaitPolicy {
    pub fn duration_ms(&self) -> Option<i64> {
        match *self {
            Self::None => None,
            Self::Fixed { ms } => Some(ms),
            Self::HalfLife { reliability } => Some(half_life_ms(reliability)),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Self::None => Ok(()),
            Self::Fixed { ms } if ms > 0 => Ok(()),
            Self::Fixed { ms } => Err(ConfigError::Invalid(format!(
                "wait duration must be positive, got {ms} ms"
            ))),
            Self::HalfLife { reliability } if reliability > 0.0 && reliability < 1.0 => Ok(()),
            Self::HalfLife { reliability } => Err(ConfigError::Invalid(format!(
                "reliability factor must be in (0,1), got {reliability}"
            ))),
        }
    }
}

pub fn half_life_ms(reliability: f64) -> i64 {
    (0.5f64.ln() / reliability.ln() * 60_000.0) as i64
}

// ─── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub application: String,
    pub period_secs: u64,
    pub history_secs: u64,
    pub data_store: String,
    pub wait: WaitPolicy,
    pub lag_ms: i64,
    pub properties: Properties,
}

impl DetectorConfig {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            period_secs: DEFAULT_PERIOD_SECS,
            history_secs: DEFAULT_HISTORY_SECS,
            data_store: DEFAULT_DATA_STORE.to_string(),
            wait: WaitPolicy::None,
            lag_ms: DEFAULT_LAG_MS,
            properties: Properties::new(),
        }
    }

    /// Read the shared descriptor keys. `default_wait` applies when the
    /// descriptor sets neither `detector.waitDuration` nor
    /// `detector.reliabilityFactor`.
    pub fn from_properties(
        application: &str,
        props: &Properties,
        default_wait: WaitPolicy,
    ) -> Result<Self, ConfigError> {
        let wait = if let Some(secs) = props.duration_secs("detector.waitDuration")? {
            WaitPolicy::Fixed {
                ms: secs as i64 * 1000,
            }
        } else if let Some(reliability) = props.parse::<f64>("detector.reliabilityFactor")? {
            WaitPolicy::HalfLife { reliability }
        } else {
            default_wait
        };
        let data_store = props
            .get("dataStore")
            .or_else(|| props.get("detector.dataStore"))
            .unwrap_or(DEFAULT_DATA_STORE)
            .to_string();
        let config = Self {
            application: application.to_string(),
            period_secs: props
                .duration_secs("detector.period")?
                .unwrap_or(DEFAULT_PERIOD_SECS),
            history_secs: props
                .duration_secs("detector.history")?
                .unwrap_or(DEFAULT_HISTORY_SECS),
            data_store,
            wait,
            lag_ms: DEFAULT_LAG_MS,
            properties: props.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application.trim().is_empty() {
            return Err(ConfigError::Invalid("application name is required".into()));
        }
        if self.period_secs == 0 {
            return Err(ConfigError::Invalid("period must be positive".into()));
        }
        if self.history_secs == 0 {
            return Err(ConfigError::Invalid("history length must be positive".into()));
        }
        if self.history_secs % self.period_secs != 0 {
            return Err(ConfigError::Invalid(format!(
                "history length ({}s) must be a multiple of the period ({}s)",
                self.history_secs, self.period_secs
            )));
        }
        if self.data_store.trim().is_empty() {
            return Err(ConfigError::Invalid("data store name is required".into()));
        }
        if self.lag_ms < 0 {
            return Err(ConfigError::Invalid("lag must not be negative".into()));
        }
        self.wait.validate()
    }
}

// ─── Windows and reports ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: i64,
    pub end: i64,
    /// First run: the window spans the whole history.
    pub initial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Delivered,
    Suppressed,
    /// The proposed anomaly failed validation and was logged instead.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub window: Window,
    pub evaluated: usize,
    pub delivered: usize,
    pub suppressed: usize,
}

impl RunReport {
    pub fn new(window: Window) -> Self {
        Self {
            window,
            evaluated: 0,
            delivered: 0,
            suppressed: 0,
        }
    }

    pub fn record(&mut self, outcome: ReportOutcome) {
        match outcome {
            ReportOutcome::Delivered => self.delivered += 1,
            ReportOutcome::Suppressed => self.suppressed += 1,
            ReportOutcome::Rejected => {}
        }
    }
}

// ─── Core ───────────────────────────────────────────────────────────

pub struct DetectorCore {
    info: Arc<DetectorInfo>,
    config: DetectorConfig,
    data_store: Arc<dyn DataStore>,
    bus: EventBus,
    end: Option<i64>,
    last_anomaly: HashMap<String, i64>,
}

impl DetectorCore {
    pub fn new(
        config: DetectorConfig,
        data_store: Arc<dyn DataStore>,
        bus: EventBus,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let info = Arc::new(DetectorInfo {
            application: config.application.clone(),
            data_store: config.data_store.clone(),
            period_secs: config.period_secs,
            history_secs: config.history_secs,
            properties: config.properties.clone(),
        });
        Ok(Self {
            info,
            config,
            data_store,
            bus,
            end: None,
            last_anomaly: HashMap::new(),
        })
    }

    pub fn info(&self) -> &Arc<DetectorInfo> {
        &self.info
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn application(&self) -> &str {
        &self.config.application
    }

    pub fn data_store(&self) -> &Arc<dyn DataStore> {
        &self.data_store
    }

    pub fn period_ms(&self) -> i64 {
        self.config.period_secs as i64 * 1000
    }

    pub fn history_ms(&self) -> i64 {
        self.config.history_secs as i64 * 1000
    }

    /// End of the last committed window.
    pub fn end(&self) -> Option<i64> {
        self.end
    }

    pub fn next_window(&self, now: i64) -> Window {
        match self.end {
            None => {
                let end = now - self.config.lag_ms;
                Window {
                    start: end - self.history_ms(),
                    end,
                    initial: true,
                }
            }
            Some(end) => Window {
                start: end,
                end: end + self.period_ms(),
                initial: false,
            },
        }
    }

    /// Advance the cursor past `window`. Call only after its data was fetched.
    pub fn commit(&mut self, window: &Window) {
        tracing::debug!(
            application = %self.config.application,
            start = window.start,
            end = window.end,
            "window committed"
        );
        self.end = Some(window.end);
    }

    /// Oldest timestamp kept in history once `window` is committed.
    pub fn cutoff(&self, window: &Window) -> i64 {
        window.end - self.history_ms()
    }

    pub fn last_anomaly_time(&self, key: &str) -> Option<i64> {
        self.last_anomaly.get(key).copied()
    }

    pub fn is_waiting(&self, key: &str, now: i64) -> bool {
        match (self.config.wait.duration_ms(), self.last_anomaly_time(key)) {
            (Some(wait), Some(last)) => now - last < wait,
            _ => false,
        }
    }

    /// Start an anomaly for `key` over `[start, end]`, carrying this
    /// detector's identity and the key's previous anomaly time.
    pub fn anomaly(&self, start: i64, end: i64, key: &str) -> AnomalyBuilder {
        Anomaly::builder(self.info.clone())
            .interval(start, end)
            .operation(key)
            .previous_anomaly_time(self.last_anomaly_time(key))
    }

    /// Publish unless the key is waiting. `lastAnomalyTime` only moves on
    /// delivery.
    pub async fn report(&mut self, anomaly: AnomalyBuilder, now: i64) -> ReportOutcome {
        let key = anomaly.operation_name().to_string();
        if self.is_waiting(&key, now) {
            tracing::debug!(
                application = %self.config.application,
                operation = %key,
                "wait period in progress, anomaly suppressed"
            );
            return ReportOutcome::Suppressed;
        }
        match anomaly.build() {
            Ok(anomaly) => {
                tracing::info!(
                    application = %self.config.application,
                    operation = %key,
                    anomaly_id = anomaly.id(),
                    "anomaly detected: {}",
                    anomaly.description()
                );
                self.bus.publish(anomaly).await;
                self.last_anomaly.insert(key, now);
                ReportOutcome::Delivered
            }
            Err(e) => {
                tracing::error!(
                    application = %self.config.application,
                    operation = %key,
                    "discarding invalid anomaly: {e}"
                );
                ReportOutcome::Rejected
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bus::{AnomalySubscriber, BusMode};
    use roots_datastore::TestDataStore;
    use std::sync::Mutex;

    /// Records every delivered anomaly.
    #[derive(Default)]
    pub(crate) struct Collector {
        anomalies: Mutex<Vec<Anomaly>>,
    }

    impl Collector {
        pub(crate) fn anomalies(&self) -> Vec<Anomaly> {
            self.anomalies.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AnomalySubscriber for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        async fn on_anomaly(&self, anomaly: &Anomaly) -> anyhow::Result<()> {
            self.anomalies.lock().unwrap().push(anomaly.clone());
            Ok(())
        }
    }

    pub(crate) fn sync_bus() -> (EventBus, Arc<Collector>) {
        let bus = EventBus::new(BusMode::Sync);
        let collector = Arc::new(Collector::default());
        bus.subscribe(collector.clone());
        (bus, collector)
    }

    /// Proposes an anomaly for a fixed operation on every run.
    struct AlwaysAnomalous {
        core: DetectorCore,
    }

    #[async_trait]
    impl AnomalyDetector for AlwaysAnomalous {
        fn core(&self) -> &DetectorCore {
            &self.core
        }

        async fn run(&mut self, now: i64) -> Result<RunReport, DetectorError> {
            let window = self.core.next_window(now);
            self.core.commit(&window);
            let mut report = RunReport::new(window);
            let builder = self
                .core
                .anomaly(1, now, "GET /")
                .description("always");
            report.record(self.core.report(builder, now).await);
            Ok(report)
        }
    }

    fn always_anomalous(wait: WaitPolicy, bus: EventBus) -> AlwaysAnomalous {
        let mut config = DetectorConfig::new("app");
        config.period_secs = 1;
        config.history_secs = 5;
        config.wait = wait;
        AlwaysAnomalous {
            core: DetectorCore::new(config, Arc::new(TestDataStore::new()), bus).expect("core"),
        }
    }

    // ── 1. windowing ──────────────────────────────────────────────────

    #[test]
    fn first_window_spans_history_behind_lag() {
        let (bus, _) = sync_bus();
        let mut d = always_anomalous(WaitPolicy::None, bus);
        let w = d.core.next_window(70_000);
        assert_eq!(w, Window { start: 5000, end: 10_000, initial: true });
        d.core.commit(&w);
        let w = d.core.next_window(71_000);
        assert_eq!(w, Window { start: 10_000, end: 11_000, initial: false });
        assert_eq!(d.core.cutoff(&w), 6000);
    }

    // ── 2. suppression ────────────────────────────────────────────────

    #[tokio::test]
    async fn wait_period_suppresses_and_keeps_last_anomaly_time() {
        let (bus, collector) = sync_bus();
        let mut d = always_anomalous(WaitPolicy::Fixed { ms: 10_000 }, bus);

        let r = d.run(70_000).await.expect("run");
        assert_eq!(r.delivered, 1);
        assert_eq!(d.core.last_anomaly_time("GET /"), Some(70_000));

        let r = d.run(75_000).await.expect("run");
        assert_eq!((r.delivered, r.suppressed), (0, 1));
        assert_eq!(d.core.last_anomaly_time("GET /"), Some(70_000));

        let r = d.run(80_000).await.expect("run");
        assert_eq!(r.delivered, 1);
        assert_eq!(d.core.last_anomaly_time("GET /"), Some(80_000));

        let delivered = collector.anomalies();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].previous_anomaly_time(), None);
        assert_eq!(delivered[1].previous_anomaly_time(), Some(70_000));
    }

    #[tokio::test]
    async fn no_wait_policy_delivers_every_anomaly() {
        let (bus, collector) = sync_bus();
        let mut d = always_anomalous(WaitPolicy::None, bus);
        for now in [70_000, 71_000, 72_000] {
            d.run(now).await.expect("run");
        }
        assert_eq!(collector.anomalies().len(), 3);
    }

    #[tokio::test]
    async fn invalid_anomaly_is_rejected_without_state_change() {
        let (bus, collector) = sync_bus();
        let mut d = always_anomalous(WaitPolicy::None, bus);
        let builder = d.core.anomaly(5, 5, "GET /").description("empty interval");
        assert_eq!(d.core.report(builder, 10).await, ReportOutcome::Rejected);
        assert!(collector.anomalies().is_empty());
        assert_eq!(d.core.last_anomaly_time("GET /"), None);
    }

    // ── 3. configuration ──────────────────────────────────────────────

    #[test]
    fn half_life_of_095_is_about_13_minutes() {
        let ms = half_life_ms(0.95);
        assert_eq!(ms, 810_804);
        assert_eq!(
            WaitPolicy::HalfLife { reliability: 0.95 }.duration_ms(),
            Some(ms)
        );
    }

    #[test]
    fn config_from_properties() {
        let props = Properties::new()
            .with("detector.period", 1)
            .with("detector.period.timeUnit", "MINUTES")
            .with("detector.history", 2)
            .with("detector.history.timeUnit", "HOURS")
            .with("dataStore", "es")
            .with("detector.waitDuration", 30);
        let config =
            DetectorConfig::from_properties("watchtower", &props, WaitPolicy::None).expect("config");
        assert_eq!(config.period_secs, 60);
        assert_eq!(config.history_secs, 7200);
        assert_eq!(config.data_store, "es");
        assert_eq!(config.wait, WaitPolicy::Fixed { ms: 30_000 });
    }

    #[test]
    fn defaults_apply_when_properties_absent() {
        let config = DetectorConfig::from_properties(
            "app",
            &Properties::new(),
            WaitPolicy::HalfLife { reliability: 0.95 },
        )
        .expect("config");
        assert_eq!(config.period_secs, DEFAULT_PERIOD_SECS);
        assert_eq!(config.history_secs, DEFAULT_HISTORY_SECS);
        assert_eq!(config.data_store, DEFAULT_DATA_STORE);
        assert_eq!(config.wait, WaitPolicy::HalfLife { reliability: 0.95 });
    }

    #[test]
    fn history_must_be_multiple_of_period() {
        let props = Properties::new()
            .with("detector.period", 60)
            .with("detector.history", 90);
        let err = DetectorConfig::from_properties("app", &props, WaitPolicy::None).unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn reliability_factor_out_of_range() {
        let props = Properties::new().with("detector.reliabilityFactor", 1.5);
        assert!(DetectorConfig::from_properties("app", &props, WaitPolicy::None).is_err());
    }
}

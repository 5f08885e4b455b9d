//! SLO-threshold detector over raw benchmark samples.
//!
//! For each request type the detector keeps the benchmark samples inside the
//! history window. Once enough samples are present it computes the share of
//! samples at or below the response-time upper bound and raises an anomaly
//! when that share drops below the SLO percentage.

use std::collections::BTreeMap;

use async_trait::async_trait;
use roots_core::{BenchmarkResult, Properties};

use crate::detector::{AnomalyDetector, DetectorCore, RunReport};
use crate::error::{ConfigError, DetectorError};

#[derive(Debug, Clone, PartialEq)]
pub struct SloConfig {
    pub response_time_upper_bound: f64,
    pub slo_percentage: f64,
    pub window_fill_percentage: f64,
    pub sampling_interval_secs: u64,
}

impl SloConfig {
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        Ok(Self {
            response_time_upper_bound: props
                .parse("detector.responseTimeUpperBound")?
                .ok_or(ConfigError::MissingProperty("detector.responseTimeUpperBound"))?,
            slo_percentage: props.parse_or("detector.sloPercentage", 95.0)?,
            window_fill_percentage: props.parse_or("detector.windowFillPercentage", 95.0)?,
            sampling_interval_secs: props
                .duration_secs("detector.samplingInterval")?
                .unwrap_or(60),
        })
    }

    pub fn validate(&self, history_secs: u64) -> Result<(), ConfigError> {
        if self.response_time_upper_bound <= 0.0 {
            return Err(ConfigError::Invalid(
                "response time upper bound must be positive".into(),
            ));
        }
        if !(self.slo_percentage > 0.0 && self.slo_percentage < 100.0) {
            return Err(ConfigError::Invalid(
                "SLO percentage must be in the interval (0,100)".into(),
            ));
        }
        if !(self.window_fill_percentage > 0.0 && self.window_fill_percentage <= 100.0) {
            return Err(ConfigError::Invalid(
                "window fill percentage must be in the interval (0,100]".into(),
            ));
        }
        if self.sampling_interval_secs == 0 {
            return Err(ConfigError::Invalid("sampling interval must be positive".into()));
        }
        if history_secs <= self.sampling_interval_secs {
            return Err(ConfigError::Invalid(
                "history length must be larger than the sampling interval".into(),
            ));
        }
        Ok(())
    }

    /// Samples needed before the SLO is judged.
    pub fn required_samples(&self, history_secs: u64) -> f64 {
        (history_secs / self.sampling_interval_secs) as f64 * self.window_fill_percentage / 100.0
    }

    /// Strictly below the SLO percentage.
    pub fn is_violated(&self, satisfied_percentage: f64) -> bool {
        satisfied_percentage < self.slo_percentage
    }
}

/// Percentage of `samples` whose response time is within `upper_bound`.
pub fn satisfaction_percentage(samples: &[&BenchmarkResult], upper_bound: f64) -> f64 {
    if samples.is_empty() {
        return 100.0;
    }
    let satisfied = samples
        .iter()
        .filter(|r| r.response_time_ms as f64 <= upper_bound)
        .count();
    satisfied as f64 * 100.0 / samples.len() as f64
}

pub struct SloBasedDetector {
    core: DetectorCore,
    config: SloConfig,
    history: BTreeMap<String, Vec<BenchmarkResult>>,
}

impl SloBasedDetector {
    pub fn new(core: DetectorCore, config: SloConfig) -> Result<Self, ConfigError> {
        config.validate(core.config().history_secs)?;
        Ok(Self {
            core,
            config,
            history: BTreeMap::new(),
        })
    }

    /// Samples currently held for a request type.
    pub fn history(&self, key: &str) -> &[BenchmarkResult] {
        self.history.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[async_trait]
impl AnomalyDetector for SloBasedDetector {
    fn core(&self) -> &DetectorCore {
        &self.core
    }

    async fn run(&mut self, now: i64) -> Result<RunReport, DetectorError> {
        let window = self.core.next_window(now);
        let fresh = self
            .core
            .data_store()
            .benchmark_results(self.core.application(), window.start, window.end)
            .await?;
        self.core.commit(&window);

        let updated: Vec<String> = fresh.keys().cloned().collect();
        for (key, samples) in fresh {
            self.history.entry(key).or_default().extend(samples);
        }
        let cutoff = self.core.cutoff(&window);
        for samples in self.history.values_mut() {
            samples.retain(|s| s.timestamp >= cutoff);
        }
        self.history.retain(|_, samples| !samples.is_empty());

        let required = self.config.required_samples(self.core.config().history_secs);
        let mut report = RunReport::new(window);
        for key in updated {
            if self.core.is_waiting(&key, now) {
                tracing::debug!(
                    application = %self.core.application(),
                    operation = %key,
                    "wait period in progress"
                );
                continue;
            }
            let last_anomaly = self.core.last_anomaly_time(&key);
            let samples: Vec<&BenchmarkResult> = self
                .history(&key)
                .iter()
                .filter(|s| last_anomaly.is_none_or(|t| s.timestamp > t))
                .collect();
            if (samples.len() as f64) < required {
                tracing::debug!(
                    application = %self.core.application(),
                    operation = %key,
                    samples = samples.len(),
                    required,
                    "insufficient data points for SLO calculation"
                );
                continue;
            }

            report.evaluated += 1;
            let satisfied = satisfaction_percentage(&samples, self.config.response_time_upper_bound);
            tracing::debug!(
                application = %self.core.application(),
                operation = %key,
                satisfied,
                expected = self.config.slo_percentage,
                "SLO metrics"
            );
            if self.config.is_violated(satisfied) {
                let anomaly = self
                    .core
                    .anomaly(cutoff, window.end, &key)
                    .description(format!("SLA satisfaction: {satisfied:.4}"));
                let outcome = self.core.report(anomaly, now).await;
                report.record(outcome);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::tests::sync_bus;
    use crate::detector::{DetectorConfig, WaitPolicy, Window};
    use proptest::prelude::*;
    use roots_datastore::{DataStoreCall, TestDataStore};
    use std::sync::Arc;

    fn result(ts: i64, rt: u64) -> BenchmarkResult {
        BenchmarkResult {
            timestamp: ts,
            application: "app".into(),
            method: "GET".into(),
            path: "/".into(),
            response_time_ms: rt,
        }
    }

    fn detector(
        store: Arc<TestDataStore>,
        history_secs: u64,
        wait: WaitPolicy,
    ) -> (SloBasedDetector, Arc<crate::detector::tests::Collector>) {
        let (bus, collector) = sync_bus();
        let mut config = DetectorConfig::new("app");
        config.period_secs = 1;
        config.history_secs = history_secs;
        config.wait = wait;
        let core = DetectorCore::new(config, store, bus).expect("core");
        let slo = SloConfig {
            response_time_upper_bound: 100.0,
            slo_percentage: 95.0,
            window_fill_percentage: 95.0,
            sampling_interval_secs: 1,
        };
        (SloBasedDetector::new(core, slo).expect("detector"), collector)
    }

    /// `total` samples spread over the initial window, `slow` of them above
    /// the upper bound.
    fn load(store: &TestDataStore, start: i64, total: usize, slow: usize) {
        for i in 0..total {
            let rt = if i < slow { 150 } else { 50 };
            store.add_benchmark_result(result(start + i as i64 * 100, rt));
        }
    }

    // ── 1. windowing ──────────────────────────────────────────────────

    #[tokio::test]
    async fn queries_initial_then_incremental_windows() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, _) = detector(store.clone(), 5, WaitPolicy::None);

        let r = d.run(70_000).await.expect("run");
        assert_eq!(r.window, Window { start: 5000, end: 10_000, initial: true });
        d.run(71_000).await.expect("run");

        let windows: Vec<_> = store
            .calls_and_clear()
            .iter()
            .filter(|c| matches!(c, DataStoreCall::BenchmarkResults { .. }))
            .filter_map(DataStoreCall::window)
            .collect();
        assert_eq!(windows, vec![(5000, 10_000), (10_000, 11_000)]);
    }

    #[tokio::test]
    async fn data_store_failure_does_not_advance_cursor() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, _) = detector(store.clone(), 5, WaitPolicy::None);
        d.run(70_000).await.expect("run");

        store.fail_next(1);
        assert!(d.run(71_000).await.is_err());
        assert_eq!(d.core().end(), Some(10_000));

        let r = d.run(72_000).await.expect("retry");
        assert_eq!((r.window.start, r.window.end), (10_000, 11_000));
    }

    // ── 2. SLO evaluation ─────────────────────────────────────────────

    #[tokio::test]
    async fn exactly_at_slo_is_not_anomalous() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, collector) = detector(store.clone(), 20, WaitPolicy::None);
        // Initial window for now=100_000 with 20s history: [20_000, 40_000).
        load(&store, 20_000, 20, 1);

        let r = d.run(100_000).await.expect("run");
        assert_eq!(r.evaluated, 1);
        assert!(collector.anomalies().is_empty());
    }

    #[tokio::test]
    async fn violation_reports_satisfaction_percentage() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, collector) = detector(store.clone(), 21, WaitPolicy::None);
        load(&store, 19_000, 21, 3);

        d.run(100_000).await.expect("run");
        let anomalies = collector.anomalies();
        assert_eq!(anomalies.len(), 1);
        let a = &anomalies[0];
        assert_eq!(a.operation(), "GET /");
        assert!(a.description().contains("85.7"), "{}", a.description());
        assert_eq!(a.description(), "SLA satisfaction: 85.7143");
        assert_eq!((a.start(), a.end()), (19_000, 40_000));
    }

    #[tokio::test]
    async fn insufficient_samples_are_skipped() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, collector) = detector(store.clone(), 20, WaitPolicy::None);
        load(&store, 20_000, 10, 10);

        let r = d.run(100_000).await.expect("run");
        assert_eq!(r.evaluated, 0);
        assert!(collector.anomalies().is_empty());
    }

    #[tokio::test]
    async fn evicted_samples_stop_counting() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, collector) = detector(store.clone(), 20, WaitPolicy::None);
        load(&store, 20_000, 20, 1);
        d.run(100_000).await.expect("first");
        assert_eq!(d.history("GET /").len(), 20);

        // Cutoff moves to 21_000: the ten samples below it are dropped.
        store.add_benchmark_result(result(40_500, 50));
        let r = d.run(101_000).await.expect("second");
        assert_eq!(d.history("GET /").len(), 11);
        assert_eq!(r.evaluated, 0);
        assert!(collector.anomalies().is_empty());
    }

    #[tokio::test]
    async fn keys_without_new_samples_are_not_reevaluated() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, _) = detector(store.clone(), 20, WaitPolicy::None);
        load(&store, 20_000, 20, 0);
        assert_eq!(d.run(100_000).await.expect("first").evaluated, 1);
        assert_eq!(d.run(101_000).await.expect("second").evaluated, 0);
    }

    #[tokio::test]
    async fn rereading_a_failed_window_counts_samples_once() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, collector) = detector(store.clone(), 20, WaitPolicy::None);
        load(&store, 20_000, 20, 1);

        store.fail_next(1);
        assert!(d.run(100_000).await.is_err());
        assert!(d.history("GET /").is_empty());

        let r = d.run(100_000).await.expect("reread");
        assert_eq!(r.window, Window { start: 20_000, end: 40_000, initial: true });
        assert_eq!(d.history("GET /").len(), 20);
        assert_eq!(r.evaluated, 1);
        assert!(collector.anomalies().is_empty());
    }

    // ── 3. waiting ────────────────────────────────────────────────────

    #[tokio::test]
    async fn samples_before_last_anomaly_are_ignored() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, collector) = detector(store.clone(), 21, WaitPolicy::Fixed { ms: 500 });
        load(&store, 19_000, 21, 3);
        d.run(100_000).await.expect("run");
        assert_eq!(collector.anomalies().len(), 1);

        // Wait expired; the old slow samples precede the last anomaly (100_000)
        // and no longer count, leaving too few samples to judge.
        store.add_benchmark_result(result(40_100, 150));
        let r = d.run(101_000).await.expect("run");
        assert_eq!(r.evaluated, 0);
        assert_eq!(collector.anomalies().len(), 1);
    }

    #[test]
    fn config_validation() {
        let mut config = SloConfig {
            response_time_upper_bound: 100.0,
            slo_percentage: 95.0,
            window_fill_percentage: 95.0,
            sampling_interval_secs: 60,
        };
        assert!(config.validate(3600).is_ok());
        assert!(config.validate(60).is_err());
        config.slo_percentage = 100.0;
        assert!(config.validate(3600).is_err());
        config.slo_percentage = 95.0;
        config.window_fill_percentage = 0.0;
        assert!(config.validate(3600).is_err());
    }

    #[test]
    fn upper_bound_is_required() {
        let err = SloConfig::from_properties(&Properties::new()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingProperty("detector.responseTimeUpperBound")
        ));
    }

    proptest! {
        // A looser upper bound never lowers the satisfaction percentage.
        #[test]
        fn satisfaction_monotonic_in_upper_bound(
            times in prop::collection::vec(0u64..300, 1..60),
            bound in 1.0f64..300.0,
            extra in 0.0f64..100.0,
        ) {
            let samples: Vec<BenchmarkResult> =
                times.iter().enumerate().map(|(i, rt)| result(i as i64, *rt)).collect();
            let refs: Vec<&BenchmarkResult> = samples.iter().collect();
            let tight = satisfaction_percentage(&refs, bound);
            let loose = satisfaction_percentage(&refs, bound + extra);
            prop_assert!(loose >= tight);
            prop_assert!((0.0..=100.0).contains(&tight));
        }

        // Raising the SLO percentage on fixed data never clears a violation.
        #[test]
        fn stricter_slo_keeps_violation(
            times in prop::collection::vec(0u64..300, 1..60),
            slo in 1.0f64..99.0,
            raise in 0.0f64..50.0,
        ) {
            let samples: Vec<BenchmarkResult> =
                times.iter().enumerate().map(|(i, rt)| result(i as i64, *rt)).collect();
            let refs: Vec<&BenchmarkResult> = samples.iter().collect();
            let satisfied = satisfaction_percentage(&refs, 100.0);
            let config = |slo_percentage| SloConfig {
                response_time_upper_bound: 100.0,
                slo_percentage,
                window_fill_percentage: 95.0,
                sampling_interval_secs: 1,
            };
            if config(slo).is_violated(satisfied) {
                prop_assert!(config((slo + raise).min(99.999)).is_violated(satisfied));
            }
        }
    }
}

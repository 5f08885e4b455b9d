//! Execution-path distribution detector.
//!
//! Every traced request of an operation took one path: the ordered list of
//! API calls it made. For each period the detector records, per operation,
//! what share of requests took each path. A path whose latest share moves
//! more than `meanThreshold` standard deviations away from its own history
//! signals a workload change.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use roots_core::{AnomalyType, PathRatio, Properties, StatSummary};
use roots_datastore::RequestMap;

use crate::detector::{AnomalyDetector, DetectorCore, RunReport};
use crate::error::{ConfigError, DetectorError};

#[derive(Debug, Clone, PartialEq)]
pub struct PathConfig {
    pub mean_threshold: f64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self { mean_threshold: 2.0 }
    }
}

impl PathConfig {
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let config = Self {
            mean_threshold: props.parse_or("detector.meanThreshold", Self::default().mean_threshold)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mean_threshold <= 0.0 {
            return Err(ConfigError::Invalid("mean threshold must be positive".into()));
        }
        Ok(())
    }
}

// ─── Path history ───────────────────────────────────────────────────

/// A path whose latest share deviates from its baseline.
#[derive(Debug, Clone, PartialEq)]
pub struct PathShift {
    pub operation: String,
    pub path: String,
    pub timestamp: i64,
    pub ratio: f64,
    pub baseline: StatSummary,
}

impl PathShift {
    pub fn description(&self) -> String {
        format!(
            "Path distribution change for: {} [{:.4}%]",
            display_path(&self.path),
            self.baseline.percentage_difference(self.ratio)
        )
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "<no calls>" } else { path }
}

type OperationPaths = BTreeMap<String, Vec<PathRatio>>;

/// Per operation, per path ratio series.
///
/// Until [`PathHistory::evaluate`] trims a flagged path, all paths of an
/// operation carry the same timestamps: absent paths get zero entries and a
/// new path is backfilled with zeros.
#[derive(Debug, Default, Clone)]
pub struct PathHistory {
    operations: BTreeMap<String, OperationPaths>,
}

impl PathHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the path shares of one window.
    pub fn update_window(&mut self, window_start: i64, requests: &RequestMap) {
        let mut seen = BTreeSet::new();
        for (operation, requests) in requests {
            if requests.is_empty() {
                continue;
            }
            let mut counts: BTreeMap<String, usize> = BTreeMap::new();
            for request in requests {
                *counts.entry(request.path_key()).or_default() += 1;
            }
            let total = requests.len() as f64;
            let paths = self.operations.entry(operation.clone()).or_default();
            let longest: Vec<i64> = paths
                .values()
                .max_by_key(|ratios| ratios.len())
                .map(|ratios| ratios.iter().map(|r| r.timestamp).collect())
                .unwrap_or_default();

            for (path, count) in &counts {
                let ratios = paths.entry(path.clone()).or_insert_with(|| {
                    tracing::info!(
                        operation = %operation,
                        path = %display_path(path),
                        "new path detected"
                    );
                    longest.iter().map(|&ts| PathRatio::zero(ts)).collect()
                });
                ratios.push(PathRatio::new(window_start, *count as f64 * 100.0 / total));
            }
            for (path, ratios) in paths.iter_mut() {
                if !counts.contains_key(path) {
                    ratios.push(PathRatio::zero(window_start));
                }
            }
            seen.insert(operation.as_str());
        }

        for (operation, paths) in self.operations.iter_mut() {
            if !seen.contains(operation.as_str()) {
                for ratios in paths.values_mut() {
                    ratios.push(PathRatio::zero(window_start));
                }
            }
        }
    }

    /// Drop entries older than `cutoff`, then empty paths and operations.
    pub fn evict(&mut self, cutoff: i64) {
        for paths in self.operations.values_mut() {
            for ratios in paths.values_mut() {
                ratios.retain(|r| r.timestamp >= cutoff);
            }
            paths.retain(|_, ratios| !ratios.is_empty());
        }
        self.operations.retain(|_, paths| !paths.is_empty());
    }

    /// Judge the newest share of every path against the earlier ones. A
    /// flagged path keeps only its newest entry.
    pub fn evaluate(&mut self, mean_threshold: f64) -> Vec<PathShift> {
        let mut shifts = Vec::new();
        for (operation, paths) in self.operations.iter_mut() {
            for (path, ratios) in paths.iter_mut() {
                let Some((&last, baseline)) = ratios.split_last() else {
                    continue;
                };
                if baseline.len() < 2 {
                    continue;
                }
                let values: Vec<f64> = baseline.iter().map(|r| r.ratio).collect();
                let Some(summary) = StatSummary::of(&values) else {
                    continue;
                };
                tracing::debug!(
                    operation = %operation,
                    path = %display_path(path),
                    mean = summary.mean,
                    std_dev = summary.std_dev,
                    count = ratios.len(),
                    "path ratio statistics"
                );
                if summary.is_outlier(last.ratio, mean_threshold) {
                    shifts.push(PathShift {
                        operation: operation.clone(),
                        path: path.clone(),
                        timestamp: last.timestamp,
                        ratio: last.ratio,
                        baseline: summary,
                    });
                    ratios.retain(|r| r.timestamp >= last.timestamp);
                }
            }
        }
        shifts
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub fn paths(&self, operation: &str) -> Vec<&str> {
        self.operations
            .get(operation)
            .map(|paths| paths.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn ratios(&self, operation: &str, path: &str) -> &[PathRatio] {
        self.operations
            .get(operation)
            .and_then(|paths| paths.get(path))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Split a bulk request map into consecutive `period_ms` buckets starting at
/// `start`. Requests outside `[start, end)` are dropped.
fn bucket_requests(requests: RequestMap, start: i64, end: i64, period_ms: i64) -> Vec<(i64, RequestMap)> {
    let count = ((end - start) / period_ms).max(0) as usize;
    let mut buckets: Vec<(i64, RequestMap)> = (0..count)
        .map(|i| (start + i as i64 * period_ms, RequestMap::new()))
        .collect();
    for (operation, requests) in requests {
        for request in requests {
            if request.timestamp < start || request.timestamp >= end {
                continue;
            }
            let index = ((request.timestamp - start) / period_ms) as usize;
            if let Some((_, bucket)) = buckets.get_mut(index) {
                bucket.entry(operation.clone()).or_default().push(request);
            }
        }
    }
    buckets
}

// ─── Detector ───────────────────────────────────────────────────────

pub struct PathAnomalyDetector {
    core: DetectorCore,
    config: PathConfig,
    history: PathHistory,
}

impl PathAnomalyDetector {
    pub fn new(core: DetectorCore, config: PathConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            core,
            config,
            history: PathHistory::new(),
        })
    }

    pub fn history(&self) -> &PathHistory {
        &self.history
    }
}

#[async_trait]
impl AnomalyDetector for PathAnomalyDetector {
    fn core(&self) -> &DetectorCore {
        &self.core
    }

    async fn run(&mut self, now: i64) -> Result<RunReport, DetectorError> {
        let window = self.core.next_window(now);
        let requests = self
            .core
            .data_store()
            .request_info(self.core.application(), window.start, window.end)
            .await?;
        self.core.commit(&window);

        if window.initial {
            for (bucket_start, bucket) in
                bucket_requests(requests, window.start, window.end, self.core.period_ms())
            {
                self.history.update_window(bucket_start, &bucket);
            }
        } else {
            self.history.update_window(window.start, &requests);
        }
        let cutoff = self.core.cutoff(&window);
        self.history.evict(cutoff);

        let mut report = RunReport::new(window);
        report.evaluated = self.history.operations().count();
        for shift in self.history.evaluate(self.config.mean_threshold) {
            let anomaly = self
                .core
                .anomaly(cutoff, window.end, &shift.operation)
                .kind(AnomalyType::Workload)
                .description(shift.description());
            let outcome = self.core.report(anomaly, now).await;
            report.record(outcome);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::tests::{Collector, sync_bus};
    use crate::detector::{DetectorConfig, WaitPolicy};
    use proptest::prelude::*;
    use roots_core::{ApiCall, ApplicationRequest};
    use roots_datastore::TestDataStore;
    use std::sync::Arc;

    const T: i64 = 1_000_000;

    fn request(id: &str, ts: i64, op: &str, calls: &[&str]) -> ApplicationRequest {
        ApplicationRequest {
            request_id: id.to_string(),
            timestamp: ts,
            application: "app".into(),
            operation: op.into(),
            api_calls: calls
                .iter()
                .map(|c| ApiCall::new(ts, "datastore", *c, 5))
                .collect(),
            response_time_ms: 20,
        }
    }

    fn window(op: &str, paths: &[(&[&str], usize)]) -> RequestMap {
        let mut requests = Vec::new();
        for (p, (calls, n)) in paths.iter().enumerate() {
            for i in 0..*n {
                requests.push(request(&format!("{op}-{p}-{i}"), 0, op, calls));
            }
        }
        RequestMap::from([(op.to_string(), requests)])
    }

    fn detector(store: Arc<TestDataStore>) -> (PathAnomalyDetector, Arc<Collector>) {
        let (bus, collector) = sync_bus();
        let mut config = DetectorConfig::new("app");
        config.period_secs = 60;
        config.history_secs = 300;
        config.wait = WaitPolicy::None;
        let core = DetectorCore::new(config, store, bus).expect("core");
        (
            PathAnomalyDetector::new(core, PathConfig::default()).expect("detector"),
            collector,
        )
    }

    const A: &[&str] = &["get"];
    const B: &[&str] = &["get", "put"];

    // ── 1. history bookkeeping ────────────────────────────────────────

    #[test]
    fn new_path_is_backfilled_with_zeros() {
        let mut history = PathHistory::new();
        history.update_window(0, &window("GET /", &[(A, 4)]));
        history.update_window(60, &window("GET /", &[(A, 4)]));
        history.update_window(120, &window("GET /", &[(A, 3), (B, 1)]));

        let b = history.ratios("GET /", "datastore:get, datastore:put");
        assert_eq!(
            b.iter().map(|r| (r.timestamp, r.ratio)).collect::<Vec<_>>(),
            vec![(0, 0.0), (60, 0.0), (120, 25.0)]
        );
        assert_eq!(history.ratios("GET /", "datastore:get").len(), 3);
    }

    #[test]
    fn absent_paths_and_operations_get_zero_entries() {
        let mut history = PathHistory::new();
        history.update_window(0, &window("GET /", &[(A, 1), (B, 1)]));
        history.update_window(60, &window("GET /", &[(A, 2)]));
        history.update_window(120, &RequestMap::new());
        history.update_window(180, &RequestMap::from([("GET /".to_string(), Vec::new())]));

        let ratios = |path| {
            history
                .ratios("GET /", path)
                .iter()
                .map(|r| r.ratio)
                .collect::<Vec<_>>()
        };
        assert_eq!(ratios("datastore:get"), vec![50.0, 100.0, 0.0, 0.0]);
        assert_eq!(ratios("datastore:get, datastore:put"), vec![50.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn eviction_drops_old_entries_and_empty_operations() {
        let mut history = PathHistory::new();
        history.update_window(0, &window("GET /", &[(A, 1)]));
        history.update_window(60, &window("POST /", &[(A, 1)]));
        history.evict(60);
        assert_eq!(history.ratios("GET /", "datastore:get").len(), 1);
        history.evict(120);
        assert_eq!(history.operations().count(), 0);
    }

    // ── 2. evaluation ─────────────────────────────────────────────────

    #[test]
    fn needs_two_baseline_points() {
        let mut history = PathHistory::new();
        history.update_window(0, &window("GET /", &[(A, 1)]));
        history.update_window(60, &window("GET /", &[(A, 1), (B, 9)]));
        assert!(history.evaluate(2.0).is_empty());
    }

    #[test]
    fn shift_trims_flagged_path_only() {
        let mut history = PathHistory::new();
        for ts in [0, 60, 120] {
            history.update_window(ts, &window("GET /", &[(A, 1), (B, 1)]));
        }
        history.update_window(180, &window("GET /", &[(A, 1), (B, 1)]));
        assert!(history.evaluate(2.0).is_empty());

        history.update_window(240, &window("GET /", &[(A, 1), (B, 3)]));
        let shifts = history.evaluate(2.0);
        assert_eq!(shifts.len(), 2);
        assert_eq!(shifts[0].path, "datastore:get");
        assert_eq!(shifts[0].ratio, 25.0);
        assert_eq!(
            shifts[0].description(),
            "Path distribution change for: datastore:get [-50.0000%]"
        );
        assert_eq!(history.ratios("GET /", "datastore:get").len(), 1);
    }

    // ── 3. detector ───────────────────────────────────────────────────

    #[tokio::test]
    async fn bootstrap_then_path_shift_is_workload_anomaly() {
        let store = Arc::new(TestDataStore::new());
        let (mut d, collector) = detector(store.clone());

        // Initial window [640_000, 940_000): buckets 2..=5 see one request
        // on each path.
        for bucket in 1..5 {
            let ts = 640_000 + bucket * 60_000 + 1_000;
            store.add_request(request(&format!("a{bucket}"), ts, "GET /", A));
            store.add_request(request(&format!("b{bucket}"), ts, "GET /", B));
        }
        let r = d.run(T).await.expect("bootstrap");
        assert!(r.window.initial);
        assert_eq!(r.delivered, 0);
        assert_eq!(d.history().ratios("GET /", "datastore:get").len(), 4);

        store.add_request(request("a", 950_000, "GET /", A));
        for i in 0..19 {
            store.add_request(request(&format!("b{i}x"), 950_000, "GET /", B));
        }
        let r = d.run(T + 60_000).await.expect("run");
        assert_eq!(r.delivered, 2);

        let anomalies = collector.anomalies();
        assert_eq!(anomalies[0].kind(), AnomalyType::Workload);
        assert_eq!(anomalies[0].operation(), "GET /");
        assert_eq!(
            anomalies[0].description(),
            "Path distribution change for: datastore:get [-90.0000%]"
        );
        assert_eq!((anomalies[0].start(), anomalies[0].end()), (700_000, 1_000_000));

        let a: Vec<f64> = d
            .history()
            .ratios("GET /", "datastore:get")
            .iter()
            .map(|r| r.ratio)
            .collect();
        assert_eq!(a, vec![5.0]);
    }

    #[tokio::test]
    async fn wait_period_applies_per_operation() {
        let store = Arc::new(TestDataStore::new());
        let (bus, collector) = sync_bus();
        let mut config = DetectorConfig::new("app");
        config.period_secs = 60;
        config.history_secs = 300;
        config.wait = WaitPolicy::Fixed { ms: 600_000 };
        let core = DetectorCore::new(config, store.clone(), bus).expect("core");
        let mut d = PathAnomalyDetector::new(core, PathConfig::default()).expect("detector");

        for bucket in 1..5 {
            let ts = 640_000 + bucket * 60_000;
            store.add_request(request(&format!("a{bucket}"), ts, "GET /", A));
            store.add_request(request(&format!("b{bucket}"), ts, "GET /", B));
        }
        d.run(T).await.expect("bootstrap");
        store.add_request(request("a", 950_000, "GET /", A));
        store.add_request(request("b", 950_000, "GET /", B));
        store.add_request(request("c", 950_000, "GET /", B));
        store.add_request(request("d", 950_000, "GET /", B));
        let r = d.run(T + 60_000).await.expect("run");

        assert_eq!((r.delivered, r.suppressed), (1, 1));
        assert_eq!(collector.anomalies().len(), 1);
    }

    #[test]
    fn bucketing_splits_initial_window_by_period() {
        let requests = RequestMap::from([(
            "GET /".to_string(),
            vec![
                request("1", 0, "GET /", A),
                request("2", 59, "GET /", A),
                request("3", 60, "GET /", A),
                request("4", 180, "GET /", A),
            ],
        )]);
        let buckets = bucket_requests(requests, 0, 180, 60);
        let sizes: Vec<(i64, usize)> = buckets
            .iter()
            .map(|(ts, m)| (*ts, m.get("GET /").map_or(0, Vec::len)))
            .collect();
        assert_eq!(sizes, vec![(0, 2), (60, 1), (120, 0)]);
    }

    proptest! {
        // Without evaluation, every path of an operation shares one timeline.
        #[test]
        fn paths_stay_aligned(
            windows in prop::collection::vec(
                prop::collection::vec((0usize..4, 0usize..4), 0..4),
                1..12,
            ),
            cutoff_step in 0usize..6,
        ) {
            const PATHS: [&[&str]; 4] = [&["a"], &["b"], &["a", "b"], &[]];
            let mut history = PathHistory::new();
            for (i, entries) in windows.iter().enumerate() {
                let mut map = RequestMap::new();
                for (j, (op, path)) in entries.iter().enumerate() {
                    let op = format!("op{op}");
                    let req = request(&format!("{i}-{j}"), 0, &op, PATHS[*path]);
                    map.entry(op).or_default().push(req);
                }
                let ts = i as i64 * 60;
                history.update_window(ts, &map);
                history.evict(ts - cutoff_step as i64 * 60);

                let ops: Vec<String> = history.operations().map(String::from).collect();
                for op in ops {
                    let timelines: Vec<Vec<i64>> = history
                        .paths(&op)
                        .iter()
                        .map(|p| history.ratios(&op, p).iter().map(|r| r.timestamp).collect())
                        .collect();
                    for t in &timelines {
                        prop_assert_eq!(t, &timelines[0]);
                    }
                }
            }
        }
    }
}

//! Bottleneck identification for PERFORMANCE anomalies.
//!
//! The finder pulls the traced requests of the anomalous operation, groups
//! them by execution path and runs the configured strategies per path.
//! WORKLOAD anomalies are ignored: a shift in path mix is not slowness.

pub mod percentile;
pub mod relative_importance;

use std::collections::BTreeMap;

use async_trait::async_trait;
use roots_core::{Anomaly, AnomalyType, ApplicationRequest};
use roots_datastore::DataStoreRegistry;
use roots_detector::AnomalySubscriber;
use roots_stats::StatsPool;
use serde::Deserialize;
use tracing::Instrument;

use crate::anomaly_span;
use crate::error::AnalysisError;
use percentile::{PercentileFinder, PercentileOutcome};
use relative_importance::{ImportanceOutcome, RelativeImportanceFinder};

/// Detector property overriding [`BottleneckConfig::percentile`].
pub const BI_PERCENTILE: &str = "bi.percentile";
/// Detector property overriding [`BottleneckConfig::pelt_penalty`].
pub const BI_PELT_PENALTY: &str = "bi.pelt.penalty";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckStrategy {
    Percentile,
    #[default]
    RelativeImportance,
    Both,
}

impl BottleneckStrategy {
    pub fn percentile(self) -> bool {
        matches!(self, Self::Percentile | Self::Both)
    }

    pub fn relative_importance(self) -> bool {
        matches!(self, Self::RelativeImportance | Self::Both)
    }

    /// How many anomaly spans before the anomaly end the requests reach back.
    fn spans(self) -> i64 {
        if self.percentile() { 3 } else { 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BottleneckConfig {
    pub strategy: BottleneckStrategy,
    pub percentile: f64,
    pub pelt_penalty: f64,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            strategy: BottleneckStrategy::default(),
            percentile: 95.0,
            pelt_penalty: 0.1,
        }
    }
}

/// Per-path results of one analysis. Paths are keyed by their call list;
/// a path without calls has the empty key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BottleneckReport {
    pub percentile: BTreeMap<String, PercentileOutcome>,
    pub importance: BTreeMap<String, ImportanceOutcome>,
}

pub struct BottleneckFinder {
    data_stores: DataStoreRegistry,
    stats: Option<StatsPool>,
    config: BottleneckConfig,
}

impl BottleneckFinder {
    /// The relative-importance strategy needs the statistics engine.
    pub fn new(
        data_stores: DataStoreRegistry,
        stats: Option<StatsPool>,
        config: BottleneckConfig,
    ) -> Result<Self, AnalysisError> {
        if config.strategy.relative_importance() && stats.is_none() {
            return Err(AnalysisError::Invalid(
                "relative importance analysis requires the statistics engine".into(),
            ));
        }
        PercentileFinder::new(config.percentile)?;
        Ok(Self {
            data_stores,
            stats,
            config,
        })
    }

    pub fn config(&self) -> &BottleneckConfig {
        &self.config
    }

    /// `None` for WORKLOAD anomalies.
    pub async fn analyze(&self, anomaly: &Anomaly) -> Result<Option<BottleneckReport>, AnalysisError> {
        if anomaly.kind() == AnomalyType::Workload {
            return Ok(None);
        }
        let props = &anomaly.detector().properties;
        let strategy = self.config.strategy;
        let percentile = PercentileFinder::new(props.parse_or(BI_PERCENTILE, self.config.percentile)?)?;
        let importance = match (&self.stats, strategy.relative_importance()) {
            (Some(stats), true) => Some(RelativeImportanceFinder::new(
                stats.clone(),
                props.parse_or(BI_PELT_PENALTY, self.config.pelt_penalty)?,
            )?),
            _ => None,
        };

        let store = self.data_stores.get(&anomaly.detector().data_store)?;
        let span = anomaly.span_ms();
        let start = anomaly.end() - strategy.spans() * span;
        let requests = store
            .operation_request_info(anomaly.application(), anomaly.operation(), start, anomaly.end())
            .await?;
        tracing::debug!(requests = requests.len(), start, "requests received for analysis");

        let mut report = BottleneckReport::default();
        for (path, requests) in group_by_path(requests) {
            if strategy.percentile() {
                let outcome = percentile.analyze_path(&path, &requests, anomaly.start());
                report.percentile.insert(path.clone(), outcome);
            }
            if let Some(finder) = &importance {
                let window_start = anomaly.end() - 2 * span;
                let recent: Vec<ApplicationRequest> = requests
                    .into_iter()
                    .filter(|r| r.timestamp >= window_start)
                    .collect();
                let outcome = finder
                    .analyze_path(
                        &path,
                        &recent,
                        window_start,
                        anomaly.start(),
                        anomaly.detector().period_ms(),
                    )
                    .await?;
                report.importance.insert(path, outcome);
            }
        }
        Ok(Some(report))
    }
}

fn group_by_path(requests: Vec<ApplicationRequest>) -> BTreeMap<String, Vec<ApplicationRequest>> {
    let mut paths: BTreeMap<String, Vec<ApplicationRequest>> = BTreeMap::new();
    for request in requests {
        paths.entry(request.path_key()).or_default().push(request);
    }
    paths
}

#[async_trait]
impl AnomalySubscriber for BottleneckFinder {
    fn name(&self) -> &str {
        "bottleneck-finder"
    }

    async fn on_anomaly(&self, anomaly: &Anomaly) -> anyhow::Result<()> {
        self.analyze(anomaly).instrument(anomaly_span(anomaly)).await?;
        Ok(())
    }
}

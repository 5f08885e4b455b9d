//! Correlation/DTW detector.
//!
//! Under normal load, request count and mean response time of an operation
//! move together. The detector keeps one `(requests, mean response time)`
//! point per period and, for every operation seen in a new window, asks the
//! statistics engine for the Pearson correlation and the dynamic time warping
//! distance between the two series. A correlation drop together with a DTW
//! jump is reported as a performance anomaly.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use roots_core::{Properties, ResponseTimeSummary, StatSummary};
use roots_stats::{StatsError, StatsPool};

use crate::detector::{AnomalyDetector, DetectorCore, RunReport};
use crate::error::{ConfigError, DetectorError};

const MIN_POINTS: usize = 3;

/// How a new DTW distance is judged against the operation's DTW trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtwAnalysis {
    /// Percentage increase over the previous distance.
    CompareToLast,
    /// Above `mean + k * sd` of the whole trend.
    CompareToAll,
}

impl FromStr for DtwAnalysis {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "compare.to.last" => Ok(Self::CompareToLast),
            "compare.to.all" => Ok(Self::CompareToAll),
            other => Err(ConfigError::Invalid(format!(
                "unsupported DTW analysis method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationConfig {
    pub correlation_threshold: f64,
    pub dtw_analysis: DtwAnalysis,
    /// Percent, used by [`DtwAnalysis::CompareToLast`].
    pub dtw_increase_threshold: f64,
    /// Standard deviations, used by [`DtwAnalysis::CompareToAll`].
    pub dtw_mean_threshold: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            correlation_threshold: 0.5,
            dtw_analysis: DtwAnalysis::CompareToLast,
            dtw_increase_threshold: 200.0,
            dtw_mean_threshold: 2.0,
        }
    }
}

impl CorrelationConfig {
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            correlation_threshold: props
                .parse_or("detector.correlationThreshold", defaults.correlation_threshold)?,
            dtw_analysis: match props.get("detector.dtwAnalysis") {
                Some(mode) => mode.parse()?,
                None => defaults.dtw_analysis,
            },
            dtw_increase_threshold: props
                .parse_or("detector.dtwIncreaseThreshold", defaults.dtw_increase_threshold)?,
            dtw_mean_threshold: props
                .parse_or("detector.dtwMeanThreshold", defaults.dtw_mean_threshold)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.correlation_threshold) {
            return Err(ConfigError::Invalid(
                "correlation threshold must be in the interval [-1,1]".into(),
            ));
        }
        if self.dtw_increase_threshold <= 0.0 {
            return Err(ConfigError::Invalid("DTW increase threshold must be positive".into()));
        }
        if self.dtw_mean_threshold <= 0.0 {
            return Err(ConfigError::Invalid("DTW mean threshold must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct DtwPoint {
    timestamp: i64,
    dtw: f64,
}

#[derive(Debug, Clone, Copy)]
struct Correlation {
    r: f64,
    dtw: f64,
}

pub struct CorrelationBasedDetector {
    core: DetectorCore,
    config: CorrelationConfig,
    stats: StatsPool,
    history: BTreeMap<String, Vec<ResponseTimeSummary>>,
    trends: BTreeMap<String, Vec<DtwPoint>>,
}

impl CorrelationBasedDetector {
    pub fn new(
        core: DetectorCore,
        config: CorrelationConfig,
        stats: StatsPool,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            core,
            config,
            stats,
            history: BTreeMap::new(),
            trends: BTreeMap::new(),
        })
    }

    pub fn history(&self, key: &str) -> &[ResponseTimeSummary] {
        self.history.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// DTW distances currently forming the key's trend, oldest first.
    pub fn dtw_trend(&self, key: &str) -> Vec<f64> {
        self.trends
            .get(key)
            .map(|t| t.iter().map(|p| p.dtw).collect())
            .unwrap_or_default()
    }

    /// Replay the bulk-loaded history one point at a time so the trend has a
    /// baseline before the first incremental window.
    async fn seed_trend(&mut self, key: &str) -> Result<(), StatsError> {
        let summaries = self.history(key).to_vec();
        let mut session = self.stats.borrow().await?;
        let mut trend = Vec::new();
        for n in MIN_POINTS..=summaries.len() {
            let (x, y) = series(&summaries[..n]);
            session.assign_doubles("x", &x).await?;
            session.assign_doubles("y", &y).await?;
            session.eval_and_assign("time_warp", "dtw(x, y)").await?;
            let dtw = session.eval_double("time_warp$distance").await?;
            trend.push(DtwPoint {
                timestamp: summaries[n - 1].timestamp,
                dtw,
            });
            reset_on_outlier(&mut trend, self.config.dtw_mean_threshold);
        }
        session.close().await?;
        tracing::debug!(
            application = %self.core.application(),
            operation = %key,
            points = trend.len(),
            "DTW trend initialized"
        );
        self.trends.insert(key.to_string(), trend);
        Ok(())
    }

    async fn correlate(&self, key: &str) -> Result<Correlation, StatsError> {
        let (x, y) = series(self.history(key));
        let mut session = self.stats.borrow().await?;
        session.assign_doubles("x", &x).await?;
        session.assign_doubles("y", &y).await?;
        let r = session.eval_double("cor(x, y, method='pearson')").await?;
        session.eval_and_assign("time_warp", "dtw(x, y)").await?;
        let dtw = session.eval_double("time_warp$distance").await?;
        session.close().await?;
        tracing::debug!(
            application = %self.core.application(),
            operation = %key,
            correlation = r,
            dtw,
            points = x.len(),
            "correlation analysis"
        );
        Ok(Correlation { r, dtw })
    }

    /// Push the new distance onto the trend and return the DTW increase in
    /// percent if the distance counts as increased.
    fn dtw_increase(&mut self, key: &str, timestamp: i64, dtw: f64) -> Option<f64> {
        let trend = self.trends.entry(key.to_string()).or_default();
        trend.push(DtwPoint { timestamp, dtw });
        match self.config.dtw_analysis {
            DtwAnalysis::CompareToLast => {
                let previous = trend.iter().rev().nth(1)?.dtw;
                if previous <= 0.0 {
                    return None;
                }
                let increase = (dtw - previous) * 100.0 / previous;
                (increase > self.config.dtw_increase_threshold).then_some(increase)
            }
            DtwAnalysis::CompareToAll => {
                let values: Vec<f64> = trend.iter().map(|p| p.dtw).collect();
                let summary = StatSummary::of(&values)?;
                let upper = summary.mean + self.config.dtw_mean_threshold * summary.std_dev;
                reset_on_outlier(trend, self.config.dtw_mean_threshold);
                (dtw > upper).then(|| summary.percentage_difference(dtw))
            }
        }
    }
}

fn series(summaries: &[ResponseTimeSummary]) -> (Vec<f64>, Vec<f64>) {
    summaries
        .iter()
        .map(|s| (s.request_count, s.mean_response_time))
        .unzip()
}

/// If the newest distance lies outside `mean ± k * sd` of the trend, start
/// the trend over from it.
fn reset_on_outlier(trend: &mut Vec<DtwPoint>, k: f64) {
    let Some(&last) = trend.last() else {
        return;
    };
    let values: Vec<f64> = trend.iter().map(|p| p.dtw).collect();
    let Some(summary) = StatSummary::of(&values) else {
        return;
    };
    if summary.is_outlier(last.dtw, k) {
        trend.retain(|p| p.timestamp >= last.timestamp);
    }
}

#[async_trait]
impl AnomalyDetector for CorrelationBasedDetector {
    fn core(&self) -> &DetectorCore {
        &self.core
    }

    async fn run(&mut self, now: i64) -> Result<RunReport, DetectorError> {
        let window = self.core.next_window(now);
        let application = self.core.application().to_string();
        let store = self.core.data_store().clone();

        let updated: Vec<String> = if window.initial {
            let bulk = store
                .response_time_history(&application, window.start, window.end, self.core.period_ms())
                .await?;
            self.core.commit(&window);
            for (key, summaries) in bulk {
                self.history.entry(key).or_default().extend(summaries);
            }
            Vec::new()
        } else {
            let summaries = store
                .response_time_summary(&application, window.start, window.end)
                .await?;
            self.core.commit(&window);
            let keys = summaries.keys().cloned().collect();
            for (key, summary) in summaries {
                self.history.entry(key).or_default().push(summary);
            }
            keys
        };

        let cutoff = self.core.cutoff(&window);
        for summaries in self.history.values_mut() {
            summaries.retain(|s| s.timestamp >= cutoff);
        }
        self.history.retain(|_, s| !s.is_empty());
        for trend in self.trends.values_mut() {
            trend.retain(|p| p.timestamp >= cutoff);
        }

        let mut report = RunReport::new(window);
        if window.initial {
            let keys: Vec<String> = self
                .history
                .iter()
                .filter(|(_, s)| s.len() >= MIN_POINTS)
                .map(|(k, _)| k.clone())
                .collect();
            for key in keys {
                if let Err(e) = self.seed_trend(&key).await {
                    tracing::error!(
                        application = %application,
                        operation = %key,
                        "error computing the DTW trend: {e}"
                    );
                }
            }
            return Ok(report);
        }

        for key in updated {
            if self.history(&key).len() < MIN_POINTS {
                continue;
            }
            let correlation = match self.correlate(&key).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(
                        application = %application,
                        operation = %key,
                        "error computing the correlation statistics: {e}"
                    );
                    continue;
                }
            };
            report.evaluated += 1;
            let Some(increase) = self.dtw_increase(&key, window.start, correlation.dtw) else {
                continue;
            };
            if correlation.r < self.config.correlation_threshold {
                let anomaly = self.core.anomaly(cutoff, window.end, &key).description(format!(
                    "Correlation: {:.4}; DTW-Increase: {:.4}%",
                    correlation.r, increase
                ));
                let outcome = self.core.report(anomaly, now).await;
                report.record(outcome);
            }
        }
        Ok(report)
    }
}

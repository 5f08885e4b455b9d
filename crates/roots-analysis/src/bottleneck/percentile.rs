//! Percentile strategy: compare each post-anomaly request against the
//! pre-anomaly distribution of every call on its path.

use roots_core::model::LOCAL_CALL;
use roots_core::stats::percentile;
use roots_core::ApplicationRequest;

use crate::error::AnalysisError;

/// One call (or the local execution time) of one request that exceeded
/// the percentile of its pre-anomaly samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Exceedance {
    pub call: String,
    pub timestamp: i64,
    pub elapsed_ms: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PercentileOutcome {
    /// No request on the path predates the anomaly.
    InsufficientData,
    Checked {
        thresholds: Vec<f64>,
        exceedances: Vec<Exceedance>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentileFinder {
    percentile: f64,
}

impl PercentileFinder {
    pub fn new(percentile: f64) -> Result<Self, AnalysisError> {
        if !(percentile > 0.0 && percentile < 100.0) {
            return Err(AnalysisError::Invalid(format!(
                "percentile must be in (0, 100), got {percentile}"
            )));
        }
        Ok(Self { percentile })
    }

    pub fn percentile(&self) -> f64 {
        self.percentile
    }

    /// `requests` all took `path` and are time ordered. Requests before
    /// `anomaly_start` form the baseline; the rest are checked.
    pub fn analyze_path(
        &self,
        path: &str,
        requests: &[ApplicationRequest],
        anomaly_start: i64,
    ) -> PercentileOutcome {
        let Some(first) = requests.first() else {
            return PercentileOutcome::InsufficientData;
        };
        let names: Vec<String> = first
            .api_calls
            .iter()
            .map(|c| c.name())
            .chain(std::iter::once(LOCAL_CALL.to_string()))
            .collect();
        let (baseline, checked): (Vec<_>, Vec<_>) =
            requests.iter().partition(|r| r.timestamp < anomaly_start);
        if baseline.is_empty() {
            tracing::warn!(path, "insufficient data to compute percentiles");
            return PercentileOutcome::InsufficientData;
        }

        let mut columns = vec![Vec::with_capacity(baseline.len()); names.len()];
        for request in &baseline {
            for (column, value) in columns.iter_mut().zip(time_vector(request)) {
                column.push(value);
            }
        }
        let thresholds: Vec<f64> = columns
            .iter()
            .map(|c| percentile(c, self.percentile).unwrap_or(f64::INFINITY))
            .collect();
        tracing::debug!(path, samples = baseline.len(), ?thresholds, "percentiles computed");

        let mut exceedances = Vec::new();
        for request in checked {
            for ((name, value), threshold) in names.iter().zip(time_vector(request)).zip(&thresholds) {
                if value > *threshold {
                    tracing::info!(
                        path,
                        call = %name,
                        timestamp = request.timestamp,
                        elapsed_ms = value,
                        threshold,
                        percentile = self.percentile,
                        "anomalous execution time"
                    );
                    exceedances.push(Exceedance {
                        call: name.clone(),
                        timestamp: request.timestamp,
                        elapsed_ms: value,
                        threshold: *threshold,
                    });
                }
            }
        }
        PercentileOutcome::Checked {
            thresholds,
            exceedances,
        }
    }
}

/// Elapsed time of each call followed by the local execution time.
fn time_vector(request: &ApplicationRequest) -> impl Iterator<Item = f64> + '_ {
    request
        .api_calls
        .iter()
        .map(|c| c.elapsed_ms as f64)
        .chain(std::iter::once(request.local_time() as f64))
}

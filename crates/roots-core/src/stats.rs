//! Descriptive statistics computed in-process.
//!
//! Heavier numerics (correlation, DTW, regression, change points) go to the
//! external statistics engine; these helpers only cover what the detectors
//! need per tick.

/// Count, mean and sample standard deviation of a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSummary {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
}

impl StatSummary {
    /// Summarize `values`. Returns `None` for an empty series.
    /// The standard deviation uses the `n - 1` denominator and is 0 for a
    /// single value.
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let std_dev = if n > 1 {
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (n as f64 - 1.0)).sqrt()
        } else {
            0.0
        };
        Some(Self {
            count: n,
            mean,
            std_dev,
        })
    }

    /// `|value - mean| > k * sd`. With `sd == 0` any deviation is flagged.
    pub fn is_outlier(&self, value: f64, k: f64) -> bool {
        (value - self.mean).abs() > k * self.std_dev
    }

    /// Relative change of `value` against the mean, in percent.
    /// Infinite when the mean is zero and the value is not.
    pub fn percentage_difference(&self, value: f64) -> f64 {
        if self.mean == 0.0 {
            if value == 0.0 { 0.0 } else { f64::INFINITY }
        } else {
            (value - self.mean) * 100.0 / self.mean
        }
    }
}

/// Percentile using linear interpolation between closest ranks (R-7, the
/// default in R and in most spreadsheet tools). `p` is in `[0, 100]`.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=100.0).contains(&p) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let h = (sorted.len() - 1) as f64 * p / 100.0;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
}

//! roots-core: pure data model for the Roots anomaly-detection loop.
//! Telemetry records, anomalies, descriptor properties and the descriptive
//! statistics the detectors compute in-process. No IO, no async runtime.

pub mod anomaly;
pub mod model;
pub mod properties;
pub mod segment;
pub mod stats;

pub use anomaly::{Anomaly, AnomalyBuilder, AnomalyError, AnomalyType, DetectorInfo};
pub use model::{ApiCall, ApplicationRequest, BenchmarkResult, PathRatio, ResponseTimeSummary};
pub use properties::{Properties, PropertyError, TimeUnit};
pub use segment::Segment;
pub use stats::StatSummary;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

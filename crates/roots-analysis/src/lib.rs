//! roots-analysis: anomaly consumers.
//!
//! Both analyzers subscribe to the event bus, re-query the data store over
//! a window wider than the anomaly and explain it: [`BottleneckFinder`]
//! attributes response time to the API calls on each execution path,
//! [`WorkloadAnalyzer`] looks for level shifts in the request rate.
//! Findings are logged inside an `anomaly` span.

pub mod bottleneck;
pub mod changepoint;
pub mod error;
pub mod workload;

pub use bottleneck::{
    BottleneckConfig, BottleneckFinder, BottleneckReport, BottleneckStrategy,
    percentile::{Exceedance, PercentileFinder, PercentileOutcome},
    relative_importance::{ImportanceOutcome, RelativeImportance, RelativeImportanceFinder, RootCause},
};
pub use changepoint::{ChangePointDetector, ChangePointMethod};
pub use error::AnalysisError;
pub use workload::{WorkloadAnalyzer, WorkloadOutcome};

use roots_core::Anomaly;

pub(crate) fn anomaly_span(anomaly: &Anomaly) -> tracing::Span {
    tracing::info_span!(
        "anomaly",
        id = anomaly.id(),
        application = anomaly.application(),
        operation = anomaly.operation(),
    )
}

//! roots-detector: the detection half of the control loop.
//!
//! A [`Scheduler`] fires each application's [`AnomalyDetector`] once per
//! period. Detectors pull the next telemetry window from their data store,
//! update per-key history, run their algorithm and publish anomalies on the
//! [`EventBus`], subject to per-key wait (suppression) periods.

pub mod bus;
pub mod correlation;
pub mod detector;
pub mod error;
pub mod factory;
pub mod logger;
pub mod path;
pub mod scheduler;
pub mod slo;

pub use bus::{AnomalySubscriber, BusMode, EventBus};
pub use correlation::{CorrelationBasedDetector, CorrelationConfig, DtwAnalysis};
pub use detector::{
    AnomalyDetector, DetectorConfig, DetectorCore, ReportOutcome, RunReport, WaitPolicy, Window,
};
pub use error::{ConfigError, DetectorError};
pub use factory::DetectorFactory;
pub use logger::AnomalyLogger;
pub use path::{PathAnomalyDetector, PathConfig};
pub use scheduler::{FireOutcome, JobStats, Scheduler, SchedulerConfig, SchedulerError};
pub use slo::{SloBasedDetector, SloConfig};

//! Anomaly records and the validating builder that produces them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::properties::Properties;

#[derive(Debug, Error, PartialEq)]
pub enum AnomalyError {
    #[error("anomaly start and end must be positive (start={start}, end={end})")]
    NonPositiveTimestamp { start: i64, end: i64 },

    #[error("anomaly start must precede end (start={start}, end={end})")]
    EmptyInterval { start: i64, end: i64 },

    #[error("anomaly {0} must not be empty")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnomalyType {
    Performance,
    Workload,
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Performance => f.write_str("PERFORMANCE"),
            Self::Workload => f.write_str("WORKLOAD"),
        }
    }
}

/// Immutable description of the detector that raised an anomaly.
/// Shared by every anomaly that detector produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorInfo {
    pub application: String,
    pub data_store: String,
    pub period_secs: u64,
    pub history_secs: u64,
    pub properties: Properties,
}

impl DetectorInfo {
    pub fn period_ms(&self) -> i64 {
        self.period_secs as i64 * 1000
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    id: String,
    detector: Arc<DetectorInfo>,
    start: i64,
    end: i64,
    operation: String,
    description: String,
    kind: AnomalyType,
    previous_anomaly_time: Option<i64>,
}

impl Anomaly {
    pub fn builder(detector: Arc<DetectorInfo>) -> AnomalyBuilder {
        AnomalyBuilder::new(detector)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn detector(&self) -> &DetectorInfo {
        &self.detector
    }

    pub fn application(&self) -> &str {
        &self.detector.application
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    /// Length of the anomalous interval in milliseconds.
    pub fn span_ms(&self) -> i64 {
        self.end - self.start
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> AnomalyType {
        self.kind
    }

    pub fn previous_anomaly_time(&self) -> Option<i64> {
        self.previous_anomaly_time
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} anomaly in {} ({}) [{} - {}]: {}",
            self.id,
            self.kind,
            self.detector.application,
            self.operation,
            self.start,
            self.end,
            self.description
        )
    }
}

// ─── Builder ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AnomalyBuilder {
    detector: Arc<DetectorInfo>,
    start: i64,
    end: i64,
    operation: String,
    description: String,
    kind: AnomalyType,
    previous_anomaly_time: Option<i64>,
}

impl AnomalyBuilder {
    pub fn new(detector: Arc<DetectorInfo>) -> Self {
        Self {
            detector,
            start: -1,
            end: -1,
            operation: String::new(),
            description: String::new(),
            kind: AnomalyType::Performance,
            previous_anomaly_time: None,
        }
    }

    pub fn interval(mut self, start: i64, end: i64) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn kind(mut self, kind: AnomalyType) -> Self {
        self.kind = kind;
        self
    }

    pub fn previous_anomaly_time(mut self, time: Option<i64>) -> Self {
        self.previous_anomaly_time = time;
        self
    }

    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    pub fn build(self) -> Result<Anomaly, AnomalyError> {
        if self.start <= 0 || self.end <= 0 {
            return Err(AnomalyError::NonPositiveTimestamp {
                start: self.start,
                end: self.end,
            });
        }
        if self.start >= self.end {
            return Err(AnomalyError::EmptyInterval {
                start: self.start,
                end: self.end,
            });
        }
        if self.operation.trim().is_empty() {
            return Err(AnomalyError::MissingField("operation"));
        }
        if self.description.trim().is_empty() {
            return Err(AnomalyError::MissingField("description"));
        }
        Ok(Anomaly {
            id: Uuid::new_v4().to_string(),
            detector: self.detector,
            start: self.start,
            end: self.end,
            operation: self.operation,
            description: self.description,
            kind: self.kind,
            previous_anomaly_time: self.previous_anomaly_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> Arc<DetectorInfo> {
        Arc::new(DetectorInfo {
            application: "watchtower".into(),
            data_store: "default".into(),
            period_secs: 60,
            history_secs: 3600,
            properties: Properties::new(),
        })
    }

    #[test]
    fn builds_valid_anomaly() {
        let anomaly = Anomaly::builder(info())
            .interval(1000, 2000)
            .operation("GET /")
            .description("slow")
            .kind(AnomalyType::Workload)
            .previous_anomaly_time(Some(500))
            .build()
            .expect("anomaly should build");
        assert_eq!(anomaly.application(), "watchtower");
        assert_eq!(anomaly.span_ms(), 1000);
        assert_eq!(anomaly.kind(), AnomalyType::Workload);
        assert_eq!(anomaly.previous_anomaly_time(), Some(500));
        assert!(Uuid::parse_str(anomaly.id()).is_ok());
    }

    #[test]
    fn rejects_unset_interval() {
        let err = Anomaly::builder(info())
            .operation("GET /")
            .description("slow")
            .build()
            .unwrap_err();
        assert!(matches!(err, AnomalyError::NonPositiveTimestamp { .. }));
    }

    #[test]
    fn rejects_inverted_interval() {
        let err = Anomaly::builder(info())
            .interval(2000, 2000)
            .operation("GET /")
            .description("slow")
            .build()
            .unwrap_err();
        assert_eq!(err, AnomalyError::EmptyInterval { start: 2000, end: 2000 });
    }

    #[test]
    fn rejects_blank_operation_and_description() {
        let err = Anomaly::builder(info())
            .interval(1, 2)
            .operation("  ")
            .description("slow")
            .build()
            .unwrap_err();
        assert_eq!(err, AnomalyError::MissingField("operation"));

        let err = Anomaly::builder(info())
            .interval(1, 2)
            .operation("GET /")
            .build()
            .unwrap_err();
        assert_eq!(err, AnomalyError::MissingField("description"));
    }

    #[test]
    fn ids_are_unique() {
        let build = || {
            Anomaly::builder(info())
                .interval(1, 2)
                .operation("op")
                .description("d")
                .build()
                .expect("build")
        };
        assert_ne!(build().id(), build().id());
    }
}

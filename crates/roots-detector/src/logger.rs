use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use roots_core::Anomaly;

use crate::bus::AnomalySubscriber;

/// Writes every anomaly to the log at WARN.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnomalyLogger;

impl AnomalyLogger {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AnomalySubscriber for AnomalyLogger {
    fn name(&self) -> &str {
        "anomaly-logger"
    }

    async fn on_anomaly(&self, anomaly: &Anomaly) -> anyhow::Result<()> {
        let detected_at = Utc
            .timestamp_millis_opt(anomaly.end())
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| anomaly.end().to_string());
        tracing::warn!(
            anomaly_id = anomaly.id(),
            application = anomaly.application(),
            operation = anomaly.operation(),
            kind = %anomaly.kind(),
            start = anomaly.start(),
            end = anomaly.end(),
            detected_at = %detected_at,
            description = anomaly.description(),
            "anomaly detected"
        );
        Ok(())
    }
}

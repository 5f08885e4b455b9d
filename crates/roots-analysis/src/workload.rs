//! Request-rate level shifts around an anomaly.

use async_trait::async_trait;
use roots_core::{Anomaly, Segment};
use roots_datastore::DataStoreRegistry;
use roots_detector::AnomalySubscriber;
use roots_stats::StatsPool;
use tracing::Instrument;

use crate::anomaly_span;
use crate::changepoint::{ChangePointDetector, ChangePointMethod, WORKLOAD_ANALYZER};
use crate::error::AnalysisError;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadOutcome {
    /// The data store had no workload samples for the window.
    NoData,
    /// A single segment: the request rate held steady.
    Unchanged { mean: f64 },
    Shifted { segments: Vec<Segment> },
}

impl WorkloadOutcome {
    /// Change from the first to the last segment mean, in percent.
    pub fn net_change(&self) -> Option<f64> {
        match self {
            Self::Shifted { segments } => {
                let (first, last) = (segments.first()?, segments.last()?);
                Some(first.percentage_increase(last))
            }
            _ => None,
        }
    }
}

/// Segments the request rate over twice the anomaly span, bucketed by the
/// detector period.
pub struct WorkloadAnalyzer {
    data_stores: DataStoreRegistry,
    stats: StatsPool,
    default_method: ChangePointMethod,
}

impl WorkloadAnalyzer {
    pub fn new(data_stores: DataStoreRegistry, stats: StatsPool, default_method: ChangePointMethod) -> Self {
        Self {
            data_stores,
            stats,
            default_method,
        }
    }

    /// The detector's `workload.analyzer` property, else the global default.
    pub fn method_for(&self, anomaly: &Anomaly) -> Result<ChangePointMethod, AnalysisError> {
        match anomaly
            .detector()
            .properties
            .get(WORKLOAD_ANALYZER)
            .map(str::trim)
            .filter(|m| !m.is_empty())
        {
            Some(method) => method.parse(),
            None => Ok(self.default_method),
        }
    }

    pub async fn analyze(&self, anomaly: &Anomaly) -> Result<WorkloadOutcome, AnalysisError> {
        let detector = ChangePointDetector::new(self.method_for(anomaly)?);
        let store = self.data_stores.get(&anomaly.detector().data_store)?;
        let start = anomaly.end() - 2 * anomaly.span_ms();
        let series = store
            .workload_summary(
                anomaly.application(),
                anomaly.operation(),
                start,
                anomaly.end(),
                anomaly.detector().period_ms(),
            )
            .await?;
        if series.is_empty() {
            tracing::warn!(start, end = anomaly.end(), "no workload data found");
            return Ok(WorkloadOutcome::NoData);
        }

        let segments = detector.segments(&self.stats, &series).await?;
        Ok(report(segments))
    }
}

fn report(segments: Vec<Segment>) -> WorkloadOutcome {
    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        return WorkloadOutcome::Unchanged { mean: 0.0 };
    };
    if segments.len() == 1 {
        tracing::info!(mean = first.mean, "no significant change in workload");
        return WorkloadOutcome::Unchanged { mean: first.mean };
    }
    for pair in segments.windows(2) {
        tracing::info!(
            index = pair[1].start,
            from = pair[0].mean,
            to = pair[1].mean,
            change_pct = pair[0].percentage_increase(&pair[1]),
            "workload level shift"
        );
    }
    tracing::info!(
        from = first.mean,
        to = last.mean,
        change_pct = first.percentage_increase(last),
        "net change in workload"
    );
    WorkloadOutcome::Shifted { segments }
}

#[async_trait]
impl AnomalySubscriber for WorkloadAnalyzer {
    fn name(&self) -> &str {
        "workload-analyzer"
    }

    async fn on_anomaly(&self, anomaly: &Anomaly) -> anyhow::Result<()> {
        self.analyze(anomaly).instrument(anomaly_span(anomaly)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{END, PERIOD_SECS, anomaly, stores};
    use roots_core::{AnomalyType, Properties};
    use roots_datastore::DataStoreCall;
    use roots_stats::{PoolConfig, ScriptedEngine, StatsValue};
    use std::sync::Arc;

    /// Reports a change point after the last value equal to the first.
    fn engine() -> Arc<ScriptedEngine> {
        ScriptedEngine::new(|expr, ws| match expr {
            "cpts(result)" => {
                let x = ws.doubles("x").ok_or("object 'x' not found")?;
                let run = x.iter().take_while(|v| **v == x[0]).count();
                let points = if run < x.len() { vec![run as i64] } else { vec![] };
                Ok(StatsValue::Integers(points))
            }
            other => Err(format!("unexpected expression: {other}")),
        })
    }

    // ── 1. analysis ───────────────────────────────────────────────────

    #[tokio::test]
    async fn queries_twice_the_span_and_reports_shift() {
        let (registry, store) = stores();
        store.add_workload(vec![10.0, 10.0, 10.0, 40.0, 40.0]);
        let engine = engine();
        let analyzer = WorkloadAnalyzer::new(registry, engine.pool(PoolConfig::default()), ChangePointMethod::Pelt);

        let outcome = analyzer
            .analyze(&anomaly(Properties::new(), AnomalyType::Performance))
            .await
            .expect("analysis");

        assert_eq!(outcome.net_change(), Some(300.0));
        let WorkloadOutcome::Shifted { segments } = outcome else {
            panic!("expected a level shift");
        };
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start, 3);
        assert_eq!(
            store.calls_and_clear(),
            vec![DataStoreCall::WorkloadSummary {
                application: "watchtower".into(),
                operation: "GET /users".into(),
                start: 900_000,
                end: END,
                period_ms: PERIOD_SECS as i64 * 1000,
            }]
        );
    }

    #[tokio::test]
    async fn steady_workload_is_unchanged() {
        let (registry, store) = stores();
        store.add_workload(vec![12.0, 12.0, 12.0, 12.0]);
        let analyzer = WorkloadAnalyzer::new(registry, engine().pool(PoolConfig::default()), ChangePointMethod::Pelt);
        let outcome = analyzer
            .analyze(&anomaly(Properties::new(), AnomalyType::Performance))
            .await
            .expect("analysis");
        assert_eq!(outcome, WorkloadOutcome::Unchanged { mean: 12.0 });
        assert_eq!(outcome.net_change(), None);
    }

    #[tokio::test]
    async fn empty_series_is_no_data() {
        let (registry, _store) = stores();
        let engine = engine();
        let analyzer = WorkloadAnalyzer::new(registry, engine.pool(PoolConfig::default()), ChangePointMethod::Pelt);
        let outcome = analyzer
            .analyze(&anomaly(Properties::new(), AnomalyType::Workload))
            .await
            .expect("analysis");
        assert_eq!(outcome, WorkloadOutcome::NoData);
        assert_eq!(engine.connects(), 0);
    }

    // ── 2. method selection ───────────────────────────────────────────

    #[tokio::test]
    async fn detector_property_overrides_default_method() {
        let (registry, store) = stores();
        store.add_workload(vec![1.0, 1.0, 5.0]);
        let engine = engine();
        let analyzer = WorkloadAnalyzer::new(registry, engine.pool(PoolConfig::default()), ChangePointMethod::Pelt);
        let props = Properties::new().with(WORKLOAD_ANALYZER, "BinSeg");
        analyzer
            .analyze(&anomaly(props, AnomalyType::Performance))
            .await
            .expect("analysis");
        assert!(engine
            .log()
            .contains(&"assign_eval result cpt.mean(x, method='BinSeg')".to_string()));
    }

    #[tokio::test]
    async fn unknown_method_fails_before_querying() {
        let (registry, store) = stores();
        let analyzer = WorkloadAnalyzer::new(registry, engine().pool(PoolConfig::default()), ChangePointMethod::Pelt);
        let props = Properties::new().with(WORKLOAD_ANALYZER, "Magic");
        let err = analyzer
            .analyze(&anomaly(props, AnomalyType::Performance))
            .await
            .expect_err("must fail");
        assert!(matches!(err, AnalysisError::UnknownChangePointMethod(_)));
        assert_eq!(store.call_count(), 0);
    }

    // ── 3. failures ───────────────────────────────────────────────────

    #[tokio::test]
    async fn data_store_failure_surfaces_through_subscriber() {
        let (registry, store) = stores();
        store.fail_next(1);
        let analyzer = WorkloadAnalyzer::new(registry, engine().pool(PoolConfig::default()), ChangePointMethod::Pelt);
        let anomaly = anomaly(Properties::new(), AnomalyType::Performance);
        assert!(matches!(
            analyzer.analyze(&anomaly).await,
            Err(AnalysisError::DataStore(_))
        ));
        store.fail_next(1);
        assert!(analyzer.on_anomaly(&anomaly).await.is_err());
    }
}

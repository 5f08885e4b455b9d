//! Descriptor → detector construction.

use roots_core::Properties;
use roots_datastore::DataStoreRegistry;
use roots_stats::StatsPool;

use crate::bus::EventBus;
use crate::correlation::{CorrelationBasedDetector, CorrelationConfig};
use crate::detector::{AnomalyDetector, DetectorConfig, DetectorCore, WaitPolicy};
use crate::error::ConfigError;
use crate::path::{PathAnomalyDetector, PathConfig};
use crate::slo::{SloBasedDetector, SloConfig};

pub const CORRELATION_DETECTOR: &str = "CorrelationBasedDetector";
pub const SLO_DETECTOR: &str = "SLOBasedDetector";
pub const PATH_DETECTOR: &str = "PathAnomalyDetector";

/// Property holding the detector type tag.
pub const DETECTOR_TYPE: &str = "detector";

/// Builds validated detectors bound to the shared data stores, statistics
/// pool and event bus.
#[derive(Clone)]
pub struct DetectorFactory {
    data_stores: DataStoreRegistry,
    stats: Option<StatsPool>,
    bus: EventBus,
}

impl DetectorFactory {
    pub fn new(data_stores: DataStoreRegistry, stats: Option<StatsPool>, bus: EventBus) -> Self {
        Self {
            data_stores,
            stats,
            bus,
        }
    }

    pub fn create(
        &self,
        application: &str,
        props: &Properties,
    ) -> Result<Box<dyn AnomalyDetector>, ConfigError> {
        let kind = props
            .get(DETECTOR_TYPE)
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingProperty(DETECTOR_TYPE))?;
        let default_wait = match kind {
            SLO_DETECTOR => WaitPolicy::HalfLife { reliability: 0.95 },
            CORRELATION_DETECTOR | PATH_DETECTOR => WaitPolicy::None,
            other => return Err(ConfigError::UnknownDetector(other.to_string())),
        };

        let config = DetectorConfig::from_properties(application, props, default_wait)?;
        let store = self
            .data_stores
            .get(&config.data_store)
            .map_err(|_| ConfigError::UnknownDataStore(config.data_store.clone()))?;
        let (period_secs, history_secs) = (config.period_secs, config.history_secs);
        let core = DetectorCore::new(config, store, self.bus.clone())?;

        let detector: Box<dyn AnomalyDetector> = match kind {
            CORRELATION_DETECTOR => {
                let stats = self
                    .stats
                    .clone()
                    .ok_or(ConfigError::StatsUnavailable(CORRELATION_DETECTOR))?;
                let config = CorrelationConfig::from_properties(props)?;
                Box::new(CorrelationBasedDetector::new(core, config, stats)?)
            }
            SLO_DETECTOR => Box::new(SloBasedDetector::new(core, SloConfig::from_properties(props)?)?),
            _ => Box::new(PathAnomalyDetector::new(core, PathConfig::from_properties(props)?)?),
        };
        tracing::info!(
            application,
            detector = kind,
            period_secs,
            history_secs,
            "anomaly detector created"
        );
        Ok(detector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMode;
    use roots_datastore::TestDataStore;
    use roots_stats::{PoolConfig, ScriptedEngine, StatsValue};
    use std::sync::Arc;

    fn factory(with_stats: bool) -> DetectorFactory {
        let mut stores = DataStoreRegistry::new();
        stores.register("default", Arc::new(TestDataStore::new()));
        stores.register("es", Arc::new(TestDataStore::new()));
        let stats = with_stats.then(|| {
            ScriptedEngine::new(|_, _| Ok(StatsValue::Null)).pool(PoolConfig::default())
        });
        DetectorFactory::new(stores, stats, EventBus::new(BusMode::Sync))
    }

    fn err(result: Result<Box<dyn AnomalyDetector>, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("descriptor must be rejected"),
            Err(e) => e,
        }
    }

    // ── 1. construction ───────────────────────────────────────────────

    #[test]
    fn builds_every_detector_type() {
        let factory = factory(true);
        let correlation = Properties::new().with(DETECTOR_TYPE, CORRELATION_DETECTOR);
        let slo = Properties::new()
            .with(DETECTOR_TYPE, SLO_DETECTOR)
            .with("detector.responseTimeUpperBound", 50)
            .with("dataStore", "es");
        let path = Properties::new()
            .with(DETECTOR_TYPE, PATH_DETECTOR)
            .with("detector.period", 2)
            .with("detector.period.timeUnit", "MINUTES");

        let d = factory.create("a", &correlation).expect("correlation");
        assert_eq!(d.application(), "a");
        assert_eq!(d.core().config().wait, WaitPolicy::None);

        let d = factory.create("b", &slo).expect("slo");
        assert_eq!(d.core().config().data_store, "es");
        assert_eq!(d.core().config().wait, WaitPolicy::HalfLife { reliability: 0.95 });

        let d = factory.create("c", &path).expect("path");
        assert_eq!(d.period(), std::time::Duration::from_secs(120));
    }

    #[test]
    fn explicit_wait_overrides_default() {
        let props = Properties::new()
            .with(DETECTOR_TYPE, SLO_DETECTOR)
            .with("detector.responseTimeUpperBound", 50)
            .with("detector.waitDuration", 5)
            .with("detector.waitDuration.timeUnit", "MINUTES");
        let d = factory(false).create("a", &props).expect("slo");
        assert_eq!(d.core().config().wait, WaitPolicy::Fixed { ms: 300_000 });
    }

    // ── 2. rejection ──────────────────────────────────────────────────

    #[test]
    fn type_tag_is_required_and_checked() {
        let factory = factory(true);
        assert!(matches!(
            err(factory.create("a", &Properties::new())),
            ConfigError::MissingProperty(DETECTOR_TYPE)
        ));
        let props = Properties::new().with(DETECTOR_TYPE, "MagicDetector");
        assert!(matches!(
            err(factory.create("a", &props)),
            ConfigError::UnknownDetector(ref t) if t == "MagicDetector"
        ));
    }

    #[test]
    fn unknown_data_store_is_rejected() {
        let props = Properties::new()
            .with(DETECTOR_TYPE, PATH_DETECTOR)
            .with("dataStore", "missing");
        assert!(matches!(
            err(factory(true).create("a", &props)),
            ConfigError::UnknownDataStore(ref n) if n == "missing"
        ));
    }

    #[test]
    fn correlation_needs_statistics_engine() {
        let props = Properties::new().with(DETECTOR_TYPE, CORRELATION_DETECTOR);
        assert!(matches!(
            err(factory(false).create("a", &props)),
            ConfigError::StatsUnavailable(CORRELATION_DETECTOR)
        ));
    }

    #[test]
    fn detector_specific_validation_applies() {
        let props = Properties::new()
            .with(DETECTOR_TYPE, SLO_DETECTOR)
            .with("detector.responseTimeUpperBound", 50)
            .with("detector.sloPercentage", 120);
        assert!(matches!(
            err(factory(true).create("a", &props)),
            ConfigError::Invalid(_)
        ));
    }
}

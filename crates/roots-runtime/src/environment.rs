//! Process-wide component graph and its lifecycle.
//!
//! Start order: data stores, statistics pool, event bus with its
//! subscribers, detector factory, scheduler. `destroy` tears down in the
//! reverse order.

use std::sync::Arc;

use anyhow::Context;
use roots_analysis::{BottleneckFinder, WorkloadAnalyzer};
use roots_datastore::{DataStore, DataStoreRegistry, ElasticSearchDataStore, RandomDataStore};
use roots_detector::{AnomalyLogger, DetectorFactory, EventBus, Scheduler, SchedulerConfig};
use roots_stats::{ProcessConnectionFactory, StatsPool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{DataStoreSection, Descriptor, RootsConfig};

pub struct RootsEnvironment {
    id: String,
    data_stores: DataStoreRegistry,
    stats: Option<StatsPool>,
    evictor: Option<(CancellationToken, JoinHandle<()>)>,
    bus: EventBus,
    factory: DetectorFactory,
    scheduler: Scheduler,
}

/// What `load_detectors` did with each descriptor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub scheduled: Vec<String>,
    pub skipped: Vec<String>,
}

impl RootsEnvironment {
    pub fn init(config: &RootsConfig) -> anyhow::Result<Self> {
        let data_stores = build_data_stores(&config.data_stores)?;

        let (stats, evictor) = match &config.stats {
            Some(section) => {
                let factory = Arc::new(ProcessConnectionFactory::new(section.engine_command()));
                let pool = StatsPool::new(factory, section.pool_config());
                let cancel = CancellationToken::new();
                let handle = pool.spawn_evictor(section.eviction_interval(), cancel.clone());
                tracing::info!(
                    program = %section.program,
                    max_total = section.max_total,
                    "statistics engine pool initialized"
                );
                (Some(pool), Some((cancel, handle)))
            }
            None => {
                tracing::info!("no statistics engine configured");
                (None, None)
            }
        };

        let bus = EventBus::new(config.event_bus.bus_mode());
        bus.subscribe(Arc::new(AnomalyLogger::new()));
        subscribe_analyzers(config, &data_stores, stats.as_ref(), &bus)?;

        let factory = DetectorFactory::new(data_stores.clone(), stats.clone(), bus.clone());
        let scheduler = Scheduler::new(SchedulerConfig {
            workers: config.scheduler.workers,
        });

        tracing::info!(
            id = %config.id,
            data_stores = data_stores.len(),
            subscribers = bus.subscriber_count(),
            "environment initialized"
        );
        Ok(Self {
            id: config.id.clone(),
            data_stores,
            stats,
            evictor,
            bus,
            factory,
            scheduler,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Build and schedule one detector per descriptor. A descriptor that
    /// fails to load is logged and skipped; the rest still start.
    pub fn load_detectors(&self, config: &RootsConfig) -> anyhow::Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        for descriptor in config.descriptors()? {
            let descriptor = match descriptor {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(error = format!("{e:#}"), "skipping detector descriptor");
                    summary.skipped.push(describe(&e));
                    continue;
                }
            };
            match self.schedule(&descriptor) {
                Ok(()) => summary.scheduled.push(descriptor.application),
                Err(e) => {
                    tracing::error!(
                        application = %descriptor.application,
                        source = %descriptor.source,
                        error = format!("{e:#}"),
                        "skipping detector descriptor"
                    );
                    summary.skipped.push(descriptor.application);
                }
            }
        }
        tracing::info!(
            scheduled = summary.scheduled.len(),
            skipped = summary.skipped.len(),
            "detectors loaded"
        );
        Ok(summary)
    }

    fn schedule(&self, descriptor: &Descriptor) -> anyhow::Result<()> {
        let detector = self
            .factory
            .create(&descriptor.application, &descriptor.properties)?;
        self.scheduler.schedule(detector)?;
        Ok(())
    }

    /// Build every detector without scheduling any of them.
    pub fn check_detectors(
        &self,
        config: &RootsConfig,
    ) -> anyhow::Result<Vec<(String, anyhow::Result<()>)>> {
        let results = config
            .descriptors()?
            .into_iter()
            .map(|descriptor| match descriptor {
                Ok(d) => {
                    let result = self
                        .factory
                        .create(&d.application, &d.properties)
                        .map(|_| ())
                        .map_err(anyhow::Error::from);
                    (d.application, result)
                }
                Err(e) => (describe(&e), Err(e)),
            })
            .collect();
        Ok(results)
    }

    pub async fn destroy(mut self) {
        self.scheduler.destroy().await;
        self.bus.shutdown().await;
        if let Some((cancel, handle)) = self.evictor.take() {
            cancel.cancel();
            let _ = handle.await;
        }
        if let Some(stats) = &self.stats {
            stats.close();
        }
        self.data_stores.destroy().await;
        tracing::info!(id = %self.id, "environment destroyed");
    }
}

fn build_data_stores(sections: &[DataStoreSection]) -> anyhow::Result<DataStoreRegistry> {
    let mut registry = DataStoreRegistry::new();
    for section in sections {
        let store: Arc<dyn DataStore> = match section.elasticsearch_config() {
            Some(es) => Arc::new(
                ElasticSearchDataStore::new(es)
                    .with_context(|| format!("data store {}", section.name()))?,
            ),
            None => Arc::new(RandomDataStore::new()),
        };
        tracing::info!(name = section.name(), "data store registered");
        registry.register(section.name(), store);
    }
    Ok(registry)
}

fn subscribe_analyzers(
    config: &RootsConfig,
    data_stores: &DataStoreRegistry,
    stats: Option<&StatsPool>,
    bus: &EventBus,
) -> anyhow::Result<()> {
    let analysis = &config.analysis;
    if analysis.workload {
        match stats {
            Some(pool) => bus.subscribe(Arc::new(WorkloadAnalyzer::new(
                data_stores.clone(),
                pool.clone(),
                analysis.workload_analyzer,
            ))),
            None => tracing::warn!("workload analysis disabled: no statistics engine"),
        }
    }

    let bottleneck = &analysis.bottleneck;
    if bottleneck.enabled {
        if bottleneck.config.strategy.relative_importance() && stats.is_none() {
            tracing::warn!(
                strategy = ?bottleneck.config.strategy,
                "bottleneck analysis disabled: no statistics engine"
            );
        } else {
            let finder = BottleneckFinder::new(
                data_stores.clone(),
                stats.cloned(),
                bottleneck.config.clone(),
            )
            .context("invalid bottleneck analysis settings")?;
            bus.subscribe(Arc::new(finder));
        }
    }
    Ok(())
}

fn describe(error: &anyhow::Error) -> String {
    error
        .chain()
        .next()
        .map(|e| e.to_string())
        .unwrap_or_default()
}

/// Resolve on ctrl-c, or SIGTERM on unix.
pub async fn wait_for_shutdown() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for ctrl-c")?;
        tracing::info!("received ctrl-c, shutting down");
    }
    Ok(())
}

//! Main configuration file and detector descriptors.
//!
//! The main file is TOML. Detector descriptors come from inline
//! `[detectors.<application>]` tables and from one `*.toml` file per
//! application in `detectors_dir`. A descriptor table is flattened into
//! dotted properties: `[detector] period = 60` becomes `detector.period`,
//! and the top-level `type` key becomes the `detector` type tag.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use roots_analysis::{BottleneckConfig, ChangePointMethod};
use roots_core::Properties;
use roots_datastore::{ElasticSearchConfig, FieldMappings};
use roots_detector::{BusMode, SchedulerConfig};
use roots_stats::{EngineCommand, PoolConfig};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootsConfig {
    #[serde(default = "default_id")]
    pub id: String,
    /// Absent: no statistics engine. Detectors and analyzers that need it
    /// are rejected or skipped.
    pub stats: Option<StatsSection>,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub event_bus: EventBusSection,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub data_stores: Vec<DataStoreSection>,
    /// Relative paths resolve against the directory of the config file.
    pub detectors_dir: Option<PathBuf>,
    #[serde(default)]
    pub detectors: BTreeMap<String, toml::Table>,
    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_id() -> String {
    "Roots".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsSection {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub libraries: Vec<String>,
    pub max_total: usize,
    pub max_idle: usize,
    pub min_evictable_idle_ms: u64,
    pub borrow_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub eviction_interval_ms: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        let engine = EngineCommand::default();
        let pool = PoolConfig::default();
        Self {
            program: engine.program,
            args: engine.args,
            working_dir: engine.working_dir,
            libraries: engine.libraries,
            max_total: pool.max_total,
            max_idle: pool.max_idle,
            min_evictable_idle_ms: pool.min_evictable_idle.as_millis() as u64,
            borrow_timeout_ms: pool.borrow_timeout.as_millis() as u64,
            request_timeout_ms: engine.request_timeout.as_millis() as u64,
            eviction_interval_ms: 5_000,
        }
    }
}

impl StatsSection {
    pub fn engine_command(&self) -> EngineCommand {
        EngineCommand {
            program: self.program.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            libraries: self.libraries.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_total: self.max_total,
            max_idle: self.max_idle,
            min_evictable_idle: Duration::from_millis(self.min_evictable_idle_ms),
            borrow_timeout: Duration::from_millis(self.borrow_timeout_ms),
        }
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub workers: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            workers: SchedulerConfig::default().workers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusModeName {
    Sync,
    #[default]
    Async,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventBusSection {
    pub mode: BusModeName,
    pub workers: usize,
}

impl Default for EventBusSection {
    fn default() -> Self {
        Self {
            mode: BusModeName::Async,
            workers: 4,
        }
    }
}

impl EventBusSection {
    pub fn bus_mode(&self) -> BusMode {
        match self.mode {
            BusModeName::Sync => BusMode::Sync,
            BusModeName::Async => BusMode::Async {
                workers: self.workers.max(1),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisSection {
    pub workload: bool,
    pub workload_analyzer: ChangePointMethod,
    pub bottleneck: BottleneckSection,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            workload: true,
            workload_analyzer: ChangePointMethod::default(),
            bottleneck: BottleneckSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BottleneckSection {
    pub enabled: bool,
    #[serde(flatten)]
    pub config: BottleneckConfig,
}

impl Default for BottleneckSection {
    fn default() -> Self {
        Self {
            enabled: true,
            config: BottleneckConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum DataStoreSection {
    ElasticSearch {
        name: String,
        host: String,
        port: u16,
        access_log_index: Option<String>,
        benchmark_index: Option<String>,
        api_call_index: Option<String>,
        #[serde(default)]
        fields: FieldMappings,
        timeout_ms: Option<u64>,
    },
    Random {
        name: String,
    },
}

impl DataStoreSection {
    pub fn name(&self) -> &str {
        match self {
            Self::ElasticSearch { name, .. } | Self::Random { name } => name,
        }
    }

    pub fn elasticsearch_config(&self) -> Option<ElasticSearchConfig> {
        let Self::ElasticSearch {
            host,
            port,
            access_log_index,
            benchmark_index,
            api_call_index,
            fields,
            timeout_ms,
            ..
        } = self
        else {
            return None;
        };
        let mut config = ElasticSearchConfig::new(host.clone(), *port);
        config.access_log_index = access_log_index.clone();
        config.benchmark_index = benchmark_index.clone();
        config.api_call_index = api_call_index.clone();
        config.fields = fields.clone();
        if let Some(ms) = timeout_ms {
            config.timeout = Duration::from_millis(*ms);
        }
        Some(config)
    }
}

/// One application's detector settings and where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub application: String,
    pub properties: Properties,
    pub source: String,
}

impl RootsConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: RootsConfig =
            toml::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            bail!("id must not be empty");
        }
        if self.scheduler.workers == 0 {
            bail!("scheduler.workers must be at least 1");
        }
        let mut names = std::collections::BTreeSet::new();
        for store in &self.data_stores {
            if store.name().trim().is_empty() {
                bail!("data store name is required");
            }
            if !names.insert(store.name()) {
                bail!("duplicate data store name: {}", store.name());
            }
        }
        if let Some(stats) = &self.stats {
            if stats.max_total == 0 {
                bail!("stats.max_total must be at least 1");
            }
            if stats.program.trim().is_empty() {
                bail!("stats.program must not be empty");
            }
        }
        Ok(())
    }

    pub fn detectors_dir(&self) -> Option<PathBuf> {
        self.detectors_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.base_dir.join(dir)
            }
        })
    }

    /// Every descriptor, inline ones first. A descriptor that cannot be
    /// read or flattened is returned as an error in its slot so the caller
    /// can skip it without losing the rest.
    pub fn descriptors(&self) -> anyhow::Result<Vec<anyhow::Result<Descriptor>>> {
        let mut descriptors: Vec<anyhow::Result<Descriptor>> = self
            .detectors
            .iter()
            .map(|(name, table)| {
                descriptor(name, table, "inline".to_string())
                    .with_context(|| format!("detector descriptor {name}"))
            })
            .collect();

        if let Some(dir) = self.detectors_dir() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("failed to read detectors_dir {}", dir.display()))?;
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            files.sort();
            for file in files {
                descriptors.push(
                    load_descriptor(&file)
                        .with_context(|| format!("detector descriptor {}", file.display())),
                );
            }
        }
        Ok(descriptors)
    }
}

fn load_descriptor(path: &Path) -> anyhow::Result<Descriptor> {
    let raw = std::fs::read_to_string(path)?;
    let table: toml::Table = toml::from_str(&raw)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    descriptor(&stem, &table, path.display().to_string())
}

fn descriptor(default_name: &str, table: &toml::Table, source: String) -> anyhow::Result<Descriptor> {
    let mut properties = Properties::new();
    let mut application = default_name.to_string();
    for (key, value) in table {
        match (key.as_str(), value) {
            ("application", toml::Value::String(name)) => application = name.clone(),
            ("application", _) => bail!("application must be a string"),
            ("type", toml::Value::String(kind)) => insert(&mut properties, "detector", kind.clone())?,
            ("type", _) => bail!("type must be a string"),
            _ => flatten(&mut properties, key, value)?,
        }
    }
    if application.trim().is_empty() {
        bail!("application name is required");
    }
    Ok(Descriptor {
        application,
        properties,
        source,
    })
}

fn flatten(properties: &mut Properties, key: &str, value: &toml::Value) -> anyhow::Result<()> {
    let scalar = match value {
        toml::Value::Table(table) => {
            for (child, value) in table {
                flatten(properties, &format!("{key}.{child}"), value)?;
            }
            return Ok(());
        }
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        toml::Value::Array(_) => bail!("{key}: arrays are not supported in detector descriptors"),
    };
    insert(properties, key, scalar)
}

fn insert(properties: &mut Properties, key: &str, value: String) -> anyhow::Result<()> {
    if properties.contains(key) {
        bail!("{key} is set more than once");
    }
    properties.insert(key, value);
    Ok(())
}

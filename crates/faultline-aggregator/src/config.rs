//! Configuration for the aggregation service.

use std::time::Duration;

use faultline_state::{KvConfig, LockConfig, QueueConfig, StateConfig};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::Result;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Cache, queue and lock backends.
    #[serde(default = "StateConfig::in_memory")]
    pub state: StateConfig,

    /// Durable error store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Queue names.
    #[serde(default)]
    pub queues: QueueNames,

    /// Batch leasing and commit settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Run admission settings.
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Aggregation runner settings.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Report intake settings.
    #[serde(default)]
    pub intake: IntakeConfig,

    /// Project lookup cache settings.
    #[serde(default)]
    pub projects: ProjectCacheConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            state: StateConfig::in_memory(),
            store: StoreConfig::default(),
            queues: QueueNames::default(),
            worker: WorkerConfig::default(),
            throttle: ThrottleConfig::default(),
            runner: RunnerConfig::default(),
            intake: IntakeConfig::default(),
            projects: ProjectCacheConfig::default(),
        }
    }
}

impl AggregatorConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `faultline.toml` in the current directory (if present)
    /// 3. Specified config file path (if provided)
    /// 4. Environment variables with `FAULTLINE_` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("faultline.toml"));

        if let Some(p) = path {
            figment = figment.merge(Toml::file(p));
        }

        let config: Self = figment
            .merge(Env::prefixed("FAULTLINE_").split("__"))
            .extract()?;
        Ok(config.normalised())
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = Figment::new().merge(Toml::string(content)).extract()?;
        Ok(config.normalised())
    }

    /// Fills unset state capabilities with in-memory backends and clamps
    /// values that would stall the worker.
    fn normalised(mut self) -> Self {
        self.state.kv.get_or_insert(KvConfig::Memory);
        self.state.queue.get_or_insert(QueueConfig::Memory);
        self.state.lock.get_or_insert(LockConfig::Memory);

        self.worker.lease_chunk = self.worker.lease_chunk.max(1);
        self.worker.batch_cap = self.worker.batch_cap.max(self.worker.lease_chunk);
        self.throttle.sample_every = self.throttle.sample_every.max(1);
        self
    }
}

/// Durable store backend.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    #[cfg(feature = "postgres")]
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

#[cfg(feature = "postgres")]
const fn default_max_connections() -> u32 {
    10
}

/// Names of the queues the service reads and writes.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueNames {
    /// Raw reports awaiting ingestion.
    #[serde(default = "default_reports_queue")]
    pub reports: String,

    /// Pending aggregation tasks.
    #[serde(default = "default_aggregation_queue")]
    pub aggregation: String,

    /// Worker run signals.
    #[serde(default = "default_runs_queue")]
    pub runs: String,
}

fn default_reports_queue() -> String {
    "reports".to_owned()
}

fn default_aggregation_queue() -> String {
    "aggregation".to_owned()
}

fn default_runs_queue() -> String {
    "aggregation-runs".to_owned()
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            reports: default_reports_queue(),
            aggregation: default_aggregation_queue(),
            runs: default_runs_queue(),
        }
    }
}

/// Aggregation worker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Tasks requested per lease call.
    #[serde(default = "default_lease_chunk")]
    pub lease_chunk: usize,

    /// Upper bound on tasks in one batch.
    #[serde(default = "default_batch_cap")]
    pub batch_cap: usize,

    /// How long leased tasks stay invisible to other workers.
    #[serde(default = "default_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// TTL of the per-aggregate advisory lock.
    #[serde(default = "default_ttl_secs")]
    pub lock_ttl_secs: u64,
}

const fn default_lease_chunk() -> usize {
    40
}

const fn default_batch_cap() -> usize {
    400
}

const fn default_ttl_secs() -> u64 {
    600
}

impl WorkerConfig {
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_chunk: default_lease_chunk(),
            batch_cap: default_batch_cap(),
            lease_ttl_secs: default_ttl_secs(),
            lock_ttl_secs: default_ttl_secs(),
        }
    }
}

/// Admission throttle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Cache key holding the run-id counter.
    #[serde(default = "default_counter_key")]
    pub counter_key: String,

    /// Runs whose id is a multiple of this are always admitted.
    #[serde(default = "default_sample_every")]
    pub sample_every: u64,
}

fn default_counter_key() -> String {
    "aggregation:run-id".to_owned()
}

const fn default_sample_every() -> u64 {
    50
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            counter_key: default_counter_key(),
            sample_every: default_sample_every(),
        }
    }
}

/// Aggregation runner settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Number of concurrent runners.
    #[serde(default = "default_runners")]
    pub runners: usize,

    /// Idle wait when no run signal is pending.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval between self-scheduled sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

const fn default_runners() -> usize {
    2
}

const fn default_poll_interval_ms() -> u64 {
    500
}

const fn default_sweep_interval_secs() -> u64 {
    60
}

impl RunnerConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runners: default_runners(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Report intake settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    /// Number of concurrent intake consumers.
    #[serde(default = "default_consumers")]
    pub consumers: usize,

    /// How long a received report stays invisible while it is ingested.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Idle wait when the reports queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

const fn default_consumers() -> usize {
    2
}

const fn default_visibility_timeout_secs() -> u64 {
    60
}

impl IntakeConfig {
    #[must_use]
    pub const fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            consumers: default_consumers(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Project lookup cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectCacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

const fn default_cache_ttl_secs() -> u64 {
    3600
}

impl ProjectCacheConfig {
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for ProjectCacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

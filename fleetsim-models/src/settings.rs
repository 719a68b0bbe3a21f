use crate::constants::{DEFAULT_CONFIG_FILE_NAME, ENV_PREFIX};
use config::{Config, Environment, File};
use fleetsim_error::FSResult;
use fleetsim_sdk::RetryPolicy;
use serde::{self, Deserialize};
use std::{ops::Deref, sync::Arc, time::Duration};

#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(Arc::new(Inner::default()))
    }
}

impl Settings {
    /// Layers the optional config file under `FLEETSIM__*` environment overrides.
    pub fn new(config_path: Option<&str>) -> FSResult<Self> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_FILE_NAME);
        let builder = Config::builder()
            .add_source(File::with_name(path).required(config_path.is_some()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    pub fn from_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// One of `trace`, `debug`, `info`, `warn`, `error`
    #[serde(default = "General::log_level_default")]
    pub log_level: String,
    #[serde(default = "General::log_dir_default")]
    pub log_dir: String,
    /// JSON snapshot backing the object store. Empty keeps everything in memory.
    #[serde(default = "General::data_file_default")]
    pub data_file: String,
}

impl Default for General {
    fn default() -> Self {
        General {
            log_level: General::log_level_default(),
            log_dir: General::log_dir_default(),
            data_file: General::data_file_default(),
        }
    }
}

impl General {
    fn log_level_default() -> String {
        "info".into()
    }

    fn log_dir_default() -> String {
        "logs".into()
    }

    fn data_file_default() -> String {
        "data/fleetsim.json".into()
    }
}

/// Engine level knobs shared by every simulation run.
///
/// Timeouts are in milliseconds. Concurrency limits bound the worker pools and
/// the registration and delete fan-outs.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "SimulationConfig::timeout_ms_default")]
    pub connection_timeout_ms: u64,
    #[serde(default = "SimulationConfig::timeout_ms_default")]
    pub telemetry_timeout_ms: u64,
    #[serde(default = "SimulationConfig::timeout_ms_default")]
    pub twin_update_timeout_ms: u64,
    #[serde(default = "SimulationConfig::timeout_ms_default")]
    pub command_timeout_ms: u64,
    #[serde(default = "SimulationConfig::registration_attempt_timeout_ms_default")]
    pub registration_attempt_timeout_ms: u64,
    #[serde(default = "SimulationConfig::concurrency_default")]
    pub max_concurrent_connections: usize,
    #[serde(default = "SimulationConfig::concurrency_default")]
    pub max_concurrent_twin_updates: usize,
    #[serde(default = "SimulationConfig::concurrency_default")]
    pub max_concurrent_registrations: usize,
    #[serde(default = "SimulationConfig::concurrency_default")]
    pub max_concurrent_deletes: usize,
    #[serde(default = "SimulationConfig::max_registration_attempts_default")]
    pub max_registration_attempts: u32,
    #[serde(default = "SimulationConfig::enabled_default")]
    pub enable_telemetry: bool,
    #[serde(default = "SimulationConfig::enabled_default")]
    pub enable_reported_props: bool,
    #[serde(default = "SimulationConfig::enabled_default")]
    pub enable_twin_update_acks: bool,
    #[serde(default = "SimulationConfig::enabled_default")]
    pub enable_command_acks: bool,
    /// Delay before the reported property pump starts its first cycle
    #[serde(default = "SimulationConfig::reported_props_warmup_ms_default")]
    pub reported_props_warmup_ms: u64,
    /// Request queue capacity per worker
    #[serde(default = "SimulationConfig::queue_capacity_factor_default")]
    pub queue_capacity_factor: usize,
    /// Backoff applied when a registration submit is throttled
    #[serde(default = "SimulationConfig::register_retry_default")]
    pub register_retry: RetryPolicy,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            connection_timeout_ms: SimulationConfig::timeout_ms_default(),
            telemetry_timeout_ms: SimulationConfig::timeout_ms_default(),
            twin_update_timeout_ms: SimulationConfig::timeout_ms_default(),
            command_timeout_ms: SimulationConfig::timeout_ms_default(),
            registration_attempt_timeout_ms:
                SimulationConfig::registration_attempt_timeout_ms_default(),
            max_concurrent_connections: SimulationConfig::concurrency_default(),
            max_concurrent_twin_updates: SimulationConfig::concurrency_default(),
            max_concurrent_registrations: SimulationConfig::concurrency_default(),
            max_concurrent_deletes: SimulationConfig::concurrency_default(),
            max_registration_attempts: SimulationConfig::max_registration_attempts_default(),
            enable_telemetry: SimulationConfig::enabled_default(),
            enable_reported_props: SimulationConfig::enabled_default(),
            enable_twin_update_acks: SimulationConfig::enabled_default(),
            enable_command_acks: SimulationConfig::enabled_default(),
            reported_props_warmup_ms: SimulationConfig::reported_props_warmup_ms_default(),
            queue_capacity_factor: SimulationConfig::queue_capacity_factor_default(),
            register_retry: SimulationConfig::register_retry_default(),
        }
    }
}

impl SimulationConfig {
    fn timeout_ms_default() -> u64 {
        10_000
    }

    fn registration_attempt_timeout_ms_default() -> u64 {
        30_000
    }

    fn concurrency_default() -> usize {
        10
    }

    fn max_registration_attempts_default() -> u32 {
        10
    }

    fn enabled_default() -> bool {
        true
    }

    fn reported_props_warmup_ms_default() -> u64 {
        300_000 // 5 minutes
    }

    fn queue_capacity_factor_default() -> usize {
        2
    }

    fn register_retry_default() -> RetryPolicy {
        RetryPolicy::with_max_attempts(3)
    }

    #[inline]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[inline]
    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }

    #[inline]
    pub fn twin_update_timeout(&self) -> Duration {
        Duration::from_millis(self.twin_update_timeout_ms)
    }

    #[inline]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    #[inline]
    pub fn registration_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_attempt_timeout_ms)
    }

    #[inline]
    pub fn reported_props_warmup(&self) -> Duration {
        Duration::from_millis(self.reported_props_warmup_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metrics {
    /// Export through OTLP when enabled, otherwise only the in-process summary is kept
    #[serde(default = "Metrics::enabled_default")]
    pub enabled: bool,
    #[serde(default = "Metrics::endpoint_default")]
    pub endpoint: String,
    #[serde(default = "Metrics::export_interval_default")]
    pub export_interval: u64,
    #[serde(default = "Metrics::service_name_default")]
    pub service_name: String,
    /// Interval of the periodic statistics log line, 0 disables it
    #[serde(default = "Metrics::summary_interval_ms_default")]
    pub summary_interval_ms: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: Metrics::enabled_default(),
            endpoint: Metrics::endpoint_default(),
            export_interval: Metrics::export_interval_default(),
            service_name: Metrics::service_name_default(),
            summary_interval_ms: Metrics::summary_interval_ms_default(),
        }
    }
}

impl Metrics {
    fn enabled_default() -> bool {
        false
    }

    fn endpoint_default() -> String {
        "http://localhost:4317".into()
    }

    fn export_interval_default() -> u64 {
        10_000
    }

    fn service_name_default() -> String {
        "fleetsim".into()
    }

    fn summary_interval_ms_default() -> u64 {
        30_000
    }
}

//! Worker configuration.
//!
//! Layered: serde defaults, then an optional TOML file, then `CWMP_*`
//! environment variables. The result is validated before use.

pub mod error;

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

pub use error::ConfigError;

use crate::coordination::CacheConfig;
use crate::coordination::LockConfig;
use crate::diagnostics::DiagnosticsConfig;
use crate::ingest::ExistenceGate;
use crate::ingest::IngestConfig;
use crate::lifecycle::ExtensionSpec;
use crate::lifecycle::LifecycleConfig;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "CWMP_";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; only meaningful for a single worker.
    #[default]
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown backend '{other}', expected memory or redis")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Connection URL, required for `redis`.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// Empty process-local store; holds no real devices.
    #[default]
    Memory,
    Mongodb,
}

impl FromStr for DeviceBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "mongodb" => Ok(Self::Mongodb),
            other => Err(format!("unknown backend '{other}', expected memory or mongodb")),
        }
    }
}

/// Document store holding device records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DevicesConfig {
    pub backend: DeviceBackend,
    /// Connection URL, required for `mongodb`.
    pub url: Option<String>,
    pub database: String,
    pub collection: String,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::Memory,
            url: None,
            database: "genieacs".to_string(),
            collection: "devices".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Deployment instance number, `None` for a lone instance.
    pub instance_id: Option<u32>,
    /// Worker processes per instance.
    pub worker_processes: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            worker_processes: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub devices: DevicesConfig,
    pub cache: CacheConfig,
    pub lock: LockConfig,
    pub ingest: IngestConfig,
    pub diagnostics: DiagnosticsConfig,
    pub lifecycle: LifecycleConfig,
    pub worker: WorkerConfig,
    pub extensions: Vec<ExtensionSpec>,
}

impl AppConfig {
    /// Load with all layers applied, reading overrides from the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                tracing::info!(path = %path.display(), "loading configuration file");
                Self::from_toml_file(path)?
            }
            None => {
                tracing::info!("no configuration file given, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `CWMP_*` overrides. `lookup` returns the raw value of a
    /// variable, or `None` when it is unset.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(val) = var("STORE_BACKEND") {
            self.store.backend = parse("STORE_BACKEND", &val)?;
        }
        if let Some(val) = var("STORE_URL") {
            self.store.url = Some(val);
        }
        if let Some(val) = var("DEVICES_BACKEND") {
            self.devices.backend = parse("DEVICES_BACKEND", &val)?;
        }
        if let Some(val) = var("DEVICES_URL") {
            self.devices.url = Some(val);
        }
        if let Some(val) = var("CACHE_MAX_TTL_SECS") {
            self.cache.max_ttl_secs = parse("CACHE_MAX_TTL_SECS", &val)?;
        }
        if let Some(val) = var("CLOCK_SKEW_TOLERANCE_MS") {
            self.cache.clock_skew_tolerance_ms = parse("CLOCK_SKEW_TOLERANCE_MS", &val)?;
        }
        if let Some(val) = var("LOCK_BACKOFF_BASE_MS") {
            self.lock.backoff_base_ms = parse("LOCK_BACKOFF_BASE_MS", &val)?;
        }
        if let Some(val) = var("LOCK_BACKOFF_JITTER_MS") {
            self.lock.backoff_jitter_ms = parse("LOCK_BACKOFF_JITTER_MS", &val)?;
        }
        if let Some(val) = var("INGEST_ENABLED") {
            self.ingest.enabled = parse("INGEST_ENABLED", &val)?;
        }
        if let Some(val) = var("INGEST_CHANNEL_PREFIX") {
            self.ingest.channel_prefix = val;
        }
        if let Some(val) = var("INGEST_SUBSCRIBE_DELAY_MS") {
            self.ingest.subscribe_delay_ms = parse("INGEST_SUBSCRIBE_DELAY_MS", &val)?;
        }
        if let Some(val) = var("INGEST_NAME_SUFFIX") {
            self.ingest.policy.name_suffix = Some(val).filter(|suffix| !suffix.is_empty());
        }
        if let Some(val) = var("INGEST_EXISTENCE_GATE") {
            self.ingest.policy.existence_gate = match val.as_str() {
                "all_leaves" => ExistenceGate::AllLeaves,
                "record_only" => ExistenceGate::RecordOnly,
                _ => {
                    return Err(invalid("INGEST_EXISTENCE_GATE", &val, "expected all_leaves or record_only"));
                }
            };
        }
        if let Some(val) = var("DIAGNOSTICS_CHANNEL") {
            self.diagnostics.channel = val;
        }
        if let Some(val) = var("SHUTDOWN_DEADLINE_SECS") {
            self.lifecycle.shutdown_deadline_secs = parse("SHUTDOWN_DEADLINE_SECS", &val)?;
        }
        if let Some(val) = var("INSTANCE_ID") {
            self.worker.instance_id = Some(parse("INSTANCE_ID", &val)?);
        }
        if let Some(val) = var("WORKER_PROCESSES") {
            self.worker.worker_processes = parse("WORKER_PROCESSES", &val)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Redis && self.store.url.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingRequired {
                key: "store.url".into(),
                hint: format!("required for the redis backend, or set {ENV_PREFIX}STORE_URL"),
            });
        }
        if self.devices.backend == DeviceBackend::Mongodb && self.devices.url.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingRequired {
                key: "devices.url".into(),
                hint: format!("required for the mongodb backend, or set {ENV_PREFIX}DEVICES_URL"),
            });
        }
        if self.cache.max_ttl_secs == 0 {
            return Err(invalid("cache.max_ttl_secs", "0", "must be positive"));
        }
        if self.ingest.channel_prefix.is_empty() {
            return Err(invalid("ingest.channel_prefix", "", "must not be empty"));
        }
        if self.ingest.channel_prefix.contains(GLOB_METACHARACTERS) {
            return Err(invalid(
                "ingest.channel_prefix",
                &self.ingest.channel_prefix,
                "must not contain glob metacharacters (* ? [ ] \\)",
            ));
        }
        if self.diagnostics.channel.is_empty() {
            return Err(invalid("diagnostics.channel", "", "must not be empty"));
        }
        if self.lifecycle.shutdown_deadline_secs == 0 {
            return Err(invalid("lifecycle.shutdown_deadline_secs", "0", "must be positive"));
        }
        if self.worker.worker_processes == 0 {
            return Err(invalid("worker.worker_processes", "0", "must be at least 1"));
        }
        if self.worker.instance_id == Some(0) {
            return Err(invalid("worker.instance_id", "0", "instance ids start at 1"));
        }
        if let Some(spec) = self.extensions.iter().find(|spec| spec.name.is_empty() || spec.command.is_empty()) {
            return Err(invalid("extensions", &spec.name, "name and command are required"));
        }
        Ok(())
    }

    /// Whether this worker runs inform ingestion.
    ///
    /// It must own the deployment-wide subscription and write to a shared
    /// device store. The in-memory store holds no devices, so every event
    /// would be dropped as unmatched.
    pub fn runs_ingestion(&self) -> bool {
        if !self.ingest.should_subscribe(self.worker.instance_id, self.worker.worker_processes) {
            return false;
        }
        if self.devices.backend == DeviceBackend::Memory {
            tracing::warn!("inform ingestion needs a shared device store; the in-memory store stays unused");
            return false;
        }
        true
    }
}

const GLOB_METACHARACTERS: &[char] = &['*', '?', '[', ']', '\\'];

fn parse<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|err: T::Err| invalid(&format!("{ENV_PREFIX}{name}"), raw, &err.to_string()))
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

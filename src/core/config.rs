//! Configuration for every component of the orchestration substrate.
//!
//! All sections deserialize with `#[serde(default)]`, so a partial YAML or JSON
//! file only needs to name the options it overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::errors::{MaestroError, Result};

/// Which entry the cache removes under capacity pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used entry (head of the recency order)
    #[default]
    Lru,
    /// Entry with the greatest estimated size
    Largest,
}

/// What happens to waiting dependents when a process fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Dependents stay `Waiting` forever
    #[default]
    Stall,
    /// Waiting dependents are marked `Failed`, transitively
    Cascade,
}

/// Cache manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub max_size: usize,
    /// Maximum aggregate estimated size in bytes
    pub max_memory: usize,
    /// Default time-to-live for entries
    #[serde(rename = "ttl_secs", with = "secs")]
    pub ttl: Duration,
    pub eviction_policy: EvictionPolicy,
    /// Persist cache contents during maintenance and reload them at startup
    pub persistent: bool,
    #[serde(rename = "maintenance_interval_ms", with = "millis")]
    pub maintenance_interval: Duration,
    /// Location of the sled database used when `persistent` is set
    pub storage_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            max_memory: 100 * 1024 * 1024, // 100MB
            ttl: Duration::from_secs(3600),
            eviction_policy: EvictionPolicy::Lru,
            persistent: false,
            maintenance_interval: Duration::from_secs(60),
            storage_path: PathBuf::from("data/cache"),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(MaestroError::configuration_field(
                "max_size cannot be zero",
                "cache.max_size",
            ));
        }
        if self.max_memory == 0 {
            return Err(MaestroError::configuration_field(
                "max_memory cannot be zero",
                "cache.max_memory",
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(MaestroError::configuration_field(
                "maintenance interval must be greater than zero",
                "cache.maintenance_interval_ms",
            ));
        }
        Ok(())
    }
}

/// Task scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Poll interval of the scheduler loop
    #[serde(rename = "tick_ms", with = "millis")]
    pub tick: Duration,
    /// Maximum number of task bodies running at once
    pub max_concurrent_tasks: usize,
    /// Per-task execution limit; expiry counts as a task failure
    #[serde(rename = "task_timeout_secs", with = "opt_secs")]
    pub task_timeout: Option<Duration>,
    /// Use `priority` as a secondary sort key after `scheduled_time`
    pub priority_tiebreak: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            max_concurrent_tasks: 16,
            task_timeout: None,
            priority_tiebreak: false,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(MaestroError::configuration_field(
                "tick must be greater than zero",
                "scheduler.tick_ms",
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(MaestroError::configuration_field(
                "max_concurrent_tasks must be greater than 0",
                "scheduler.max_concurrent_tasks",
            ));
        }
        Ok(())
    }
}

/// Workflow manager configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// sled database receiving terminal workflow snapshots; no history when unset
    pub history_path: Option<PathBuf>,
}

/// Process orchestrator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub failure_policy: FailurePolicy,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaestroConfig {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub workflow: WorkflowConfig,
    pub orchestrator: OrchestratorConfig,
}

impl MaestroConfig {
    /// Validates every section
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = read_config(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Loads a configuration file, picking the format from its extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            Some("json") => Self::from_json_file(path),
            other => Err(MaestroError::configuration(format!(
                "Unsupported configuration format {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

fn read_config(path: &Path) -> Result<String> {
    debug!("Loading configuration from {}", path.display());
    fs::read_to_string(path)
        .map_err(|e| MaestroError::io(format!("read config {}", path.display()), e))
}

// Duration <-> integer helpers for config files
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use worldspace_kernel::SpaceConfig;

use crate::error::ConfigError;

pub const DEFAULT_CHUNK_SIZE: usize = 10;

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// How a viewer's operations reach its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerKind {
    /// One batch per operation, sent as soon as it is produced.
    Immediate,
    /// One batch per cycle, sent at the end of the cycle.
    #[default]
    Aggregated,
    /// Background task drains a pending queue `chunk_size` ops at a time.
    Chunked {
        #[serde(default = "default_chunk_size")]
        chunk_size: usize,
    },
}

impl SchedulerKind {
    pub fn chunked() -> Self {
        Self::Chunked {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Per-viewer cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Radius of the proximity sphere around the viewer's view cell.
    pub radius: f32,
    pub scheduler: SchedulerKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            radius: 64.0,
            scheduler: SchedulerKind::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverMode {
    /// Each viewer runs its own periodic task.
    #[default]
    PerViewer,
    /// One periodic task revalidates every viewer, at most
    /// `max_concurrent` at a time.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub mode: DriverMode,
    pub interval_ms: u64,
    pub initial_delay_ms: u64,
    /// Cycles slower than this are logged as anomalies.
    pub slow_cycle_ms: u64,
    /// Shared mode only; 1 serializes all cycles.
    pub max_concurrent: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mode: DriverMode::default(),
            interval_ms: 2000,
            initial_delay_ms: 1000,
            slow_cycle_ms: 250,
            max_concurrent: 4,
        }
    }
}

impl DriverConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn slow_cycle(&self) -> Duration {
        Duration::from_millis(self.slow_cycle_ms)
    }
}

/// Top-level settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub space: SpaceConfig,
    pub cache: CacheConfig,
    pub driver: DriverConfig,
}

impl StreamSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loading stream settings");
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.space.space_size.is_finite() && self.space.space_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "space.space_size must be positive, got {}",
                self.space.space_size
            )));
        }
        if !(self.cache.radius.is_finite() && self.cache.radius > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "cache.radius must be positive, got {}",
                self.cache.radius
            )));
        }
        if let SchedulerKind::Chunked { chunk_size: 0 } = self.cache.scheduler {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        if self.driver.interval_ms == 0 {
            return Err(ConfigError::Invalid("driver.interval_ms must be non-zero".into()));
        }
        if self.driver.max_concurrent == 0 {
            return Err(ConfigError::Invalid("driver.max_concurrent must be at least 1".into()));
        }
        Ok(())
    }
}

//! Configuration types for the shoal core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, ShoalError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoalConfig {
    /// Background task scheduler settings.
    pub scheduler: SchedulerConfig,
}

/// Background task scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period between two scheduler ticks driven by the host loop, in ms.
    pub tick_interval_ms: u64,
    /// Global time budget shared by all runnable tasks in one tick, in µs.
    ///
    /// Must stay well below `tick_interval_ms` or the host loop never gets
    /// a chance to service its own events.
    pub max_life_us: u64,
    /// Minimum slice granted to each task in one tick, in µs.
    pub min_life_us: u64,
    /// Largest factor by which a task's tick allotment may grow or shrink
    /// between two consecutive invocations.
    pub delta_factor: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_life_us: 150_000,
            min_life_us: 40_000,
            delta_factor: 4,
        }
    }
}

impl SchedulerConfig {
    /// Check the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ShoalError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(ShoalError::Config(
                "scheduler.tick_interval_ms must be > 0".to_owned(),
            ));
        }
        if self.max_life_us == 0 {
            return Err(ShoalError::Config(
                "scheduler.max_life_us must be > 0".to_owned(),
            ));
        }
        if self.min_life_us > self.max_life_us {
            return Err(ShoalError::Config(format!(
                "scheduler.min_life_us ({}) exceeds max_life_us ({})",
                self.min_life_us, self.max_life_us
            )));
        }
        if self.delta_factor == 0 {
            return Err(ShoalError::Config(
                "scheduler.delta_factor must be >= 1".to_owned(),
            ));
        }
        Ok(())
    }

    /// Host tick period as a [`std::time::Duration`].
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_interval_ms)
    }
}

impl ShoalConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// holds invalid scheduler settings.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ShoalError::Config(e.to_string()))?;
        config.scheduler.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ShoalError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path, `config_dir()/shoal/config.toml`.
    ///
    /// The directory can be overridden with the `SHOAL_CONFIG_DIR`
    /// environment variable.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        let dir = match std::env::var_os("SHOAL_CONFIG_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .map(|d| d.join("shoal"))
                .unwrap_or_else(|| PathBuf::from("/tmp/shoal-config")),
        };
        dir.join("config.toml")
    }
}

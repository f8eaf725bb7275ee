use crate::anomaly::AnomalyConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed: {0}")]
    Validation(String),
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_concurrency() -> usize {
    2
}

fn default_top_n() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Cadence of the due-source scan.
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Idle sleep between queue polls.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Parallel worker tasks; each processes one task at a time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSettings {
    /// Entries kept per top-K rollup.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
        }
    }
}

/// Immutable process configuration, passed through constructors rather than
/// read from globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub aggregation: AggregationSettings,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval < Duration::from_secs(1) {
            return Err(ConfigError::Validation(
                "scheduler.tick_interval must be at least one second".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Validation(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.aggregation.top_n == 0 {
            return Err(ConfigError::Validation(
                "aggregation.top_n must be at least 1".to_string(),
            ));
        }
        if self.anomaly.z_threshold <= 0.0 {
            return Err(ConfigError::Validation(
                "anomaly.z_threshold must be positive".to_string(),
            ));
        }
        if self.anomaly.min_baseline_hours < 2 {
            return Err(ConfigError::Validation(
                "anomaly.min_baseline_hours must be at least 2".to_string(),
            ));
        }
        if self.anomaly.baseline_days < 1 {
            return Err(ConfigError::Validation(
                "anomaly.baseline_days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load settings from a YAML file, or defaults when no path is given.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let settings = match path {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| {
                ConfigError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to open config file '{}': {}", path.display(), e),
                ))
            })?;
            serde_yaml::from_str(&text)?
        }
        None => Settings::default(),
    };
    settings.validate()?;
    Ok(settings)
}

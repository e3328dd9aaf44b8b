//! CLI configuration management.

use anyhow::{Context, Result, anyhow, bail};
use gantry_core::{parse_duration, parse_timeout};
use gantry_notify::NotificationChannel;
use gantry_scheduler::{SchedulerConfig, WorkerSpec};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// CLI configuration, stored as `config.yaml` in the platform config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Maximum jobs running at once.
    pub concurrency: usize,
    /// How long a canceled job may keep running, e.g. `10s`.
    pub grace_period: String,
    /// Timeout for jobs that set none, e.g. `1h`.
    pub default_timeout: String,
    /// Shell used for script lines.
    pub shell: String,
    /// Tagged workers; empty means `concurrency` untagged local workers.
    pub workers: Vec<WorkerSpec>,
    pub notifications: Vec<NotificationChannel>,
    /// Log format.
    pub log_format: LogFormat,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            grace_period: "10s".to_string(),
            default_timeout: "1h".to_string(),
            shell: "sh".to_string(),
            workers: Vec::new(),
            notifications: Vec::new(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("dev", "gantry", "gantry")
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "concurrency" => {
                self.concurrency = value
                    .parse()
                    .map_err(|_| anyhow!("Invalid concurrency: {}", value))?;
                if self.concurrency == 0 {
                    bail!("concurrency must be at least 1");
                }
            }
            "grace_period" => {
                parse_duration(value)?;
                self.grace_period = value.to_string();
            }
            "default_timeout" => {
                parse_timeout(value)?;
                self.default_timeout = value.to_string();
            }
            "shell" => self.shell = value.to_string(),
            "log_format" => {
                self.log_format = match value {
                    "text" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => bail!("Invalid log format: {}", value),
                };
            }
            _ => bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Scheduler settings with durations parsed.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            concurrency: self.concurrency.max(1),
            grace_period: parse_duration(&self.grace_period).context("grace_period")?,
            default_timeout: Some(
                parse_timeout(&self.default_timeout).context("default_timeout")?,
            ),
            workers: self.workers.clone(),
            ..SchedulerConfig::default()
        })
    }
}

//! Configuration management
//!
//! Logging, both retraining controllers, the training backend, the
//! scheduler and the prompt log are configured from one TOML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::AdapterStrategy;
use crate::logs::DEFAULT_CAPACITY;
use crate::trainer::{AutoTrainerConfig, RecentTrainerConfig, SchedulerConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Console logging and the in-memory log buffer
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Usage-threshold retraining
    #[serde(default)]
    pub auto_trainer: AutoTrainerConfig,
    /// Recent-memory retraining
    #[serde(default)]
    pub recent_trainer: RecentTrainerConfig,
    /// Fine-tuning backend
    #[serde(default)]
    pub training: TrainingConfig,
    /// Periodic retraining loop
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Prompt history storage
    #[serde(default)]
    pub prompt_log: PromptLogConfig,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit console logs as JSON lines
    #[serde(default)]
    pub json: bool,
    /// Records kept by the in-memory log store
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_buffer_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

/// Which training gateway to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingBackend {
    #[default]
    Simulated,
    Command,
}

/// Fine-tuning backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub backend: TrainingBackend,
    /// Program run by the command backend
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub adapter: AdapterStrategy,
    /// Abandon a training call after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// How long the simulated backend pretends to train
    #[serde(default = "default_simulated_delay_ms")]
    pub simulated_delay_ms: u64,
}

fn default_command() -> String {
    "locentra-finetune".to_string()
}

fn default_simulated_delay_ms() -> u64 {
    500
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            backend: TrainingBackend::default(),
            command: default_command(),
            args: Vec::new(),
            adapter: AdapterStrategy::default(),
            timeout_secs: None,
            simulated_delay_ms: default_simulated_delay_ms(),
        }
    }
}

impl TrainingConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Prompt log settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptLogConfig {
    /// JSONL file; defaults to `prompts.jsonl` in the data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl PromptLogConfig {
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("prompts.jsonl")),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    /// Load configuration from `path`, writing defaults there if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "locentra", "locentra").context("Failed to get project directories")
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}

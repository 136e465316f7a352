//! Shared control-plane state
//!
//! One [`ControlPlane`] is built at startup and handed to whatever needs the
//! registry, the log store or a controller. Controllers are assembled from
//! the configuration on demand.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, TrainingBackend};
use crate::gateway::{CommandTrainer, PromptLog, SimulatedTrainer, TrainingGateway, WhitespaceTokenCounter};
use crate::logs::LogStore;
use crate::registry::Registry;
use crate::trainer::{AutoTrainer, RecentTrainer, RetrainScheduler};

/// Locked registry key describing this process
pub const RUNTIME_SESSION_KEY: &str = "runtime_session";

/// Registry, log store, configuration and the root shutdown token
pub struct ControlPlane {
    config: Arc<Config>,
    registry: Arc<Registry>,
    logs: Arc<LogStore>,
    prompt_log: Mutex<Option<Arc<PromptLog>>>,
    shutdown: CancellationToken,
}

impl ControlPlane {
    pub fn new(config: Config) -> Self {
        let logs = Arc::new(LogStore::new(config.logging.buffer_capacity));
        Self::with_log_store(config, logs)
    }

    /// Use an existing log store, typically the one tracing already feeds
    pub fn with_log_store(config: Config, logs: Arc<LogStore>) -> Self {
        let registry = Arc::new(Registry::new());
        let session = serde_json::json!({
            "id": Uuid::new_v4().to_string(),
            "started_at": Utc::now(),
            "name": crate::NAME,
            "version": crate::VERSION,
        });
        // Fresh registry, so the key cannot already be locked
        if let Err(e) = registry.register(RUNTIME_SESSION_KEY, session, None, true) {
            tracing::warn!(source = "state", "Failed to record runtime session: {}", e);
        }

        info!(source = "state", "Control plane initialized");
        Self {
            config: Arc::new(config),
            registry,
            logs,
            prompt_log: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use `prompt_log` instead of opening the configured file
    pub fn with_prompt_log(self, prompt_log: Arc<PromptLog>) -> Self {
        *self.prompt_log.lock().unwrap_or_else(|p| p.into_inner()) = Some(prompt_log);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn logs(&self) -> Arc<LogStore> {
        self.logs.clone()
    }

    /// The prompt log, opened from the configured path on first use
    pub fn prompt_log(&self) -> Result<Arc<PromptLog>> {
        let mut slot = self.prompt_log.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(log) = slot.as_ref() {
            return Ok(log.clone());
        }

        let path = self.config.prompt_log.resolved_path()?;
        let log = Arc::new(
            PromptLog::open(&path).with_context(|| format!("Failed to open prompt log {}", path.display()))?,
        );
        *slot = Some(log.clone());
        Ok(log)
    }

    /// Build the configured training backend
    pub fn training_gateway(&self) -> Arc<dyn TrainingGateway> {
        let training = &self.config.training;
        match training.backend {
            TrainingBackend::Simulated => Arc::new(
                SimulatedTrainer::new(Duration::from_millis(training.simulated_delay_ms))
                    .with_adapter(training.adapter),
            ),
            TrainingBackend::Command => Arc::new(
                CommandTrainer::new(training.command.clone(), training.args.clone()).with_adapter(training.adapter),
            ),
        }
    }

    pub fn auto_trainer(&self) -> Result<AutoTrainer> {
        Ok(AutoTrainer::new(
            self.config.auto_trainer.clone(),
            self.prompt_log()?,
            self.training_gateway(),
        )
        .with_training_timeout(self.config.training.timeout()))
    }

    pub fn recent_trainer(&self) -> Result<RecentTrainer> {
        Ok(RecentTrainer::new(
            self.config.recent_trainer.clone(),
            self.prompt_log()?,
            self.training_gateway(),
            Arc::new(WhitespaceTokenCounter),
        )
        .with_training_timeout(self.config.training.timeout()))
    }

    pub fn scheduler(&self) -> Result<RetrainScheduler> {
        Ok(RetrainScheduler::new(
            self.config.scheduler.clone(),
            Arc::new(self.auto_trainer()?),
            self.registry(),
        ))
    }

    /// Child of the root token; cancelled by [`ControlPlane::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn shutdown(&self) {
        info!(source = "state", "Control plane shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

//! Recent-memory retraining controller
//!
//! Samples the most recently logged prompts, drops short, duplicate and
//! low-token ones, and fine-tunes on whatever survives. There is no
//! dry-run branch: see [`RecentTrainer::SUPPORTS_DRY_RUN`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::guarded_fine_tune;
use crate::gateway::{MemoryGateway, RecentQuery, TokenCounter, TrainingGateway};
use crate::types::TrainingSample;

const SOURCE: &str = "recent_trainer";

/// Reason reported when no prompt survived filtering
pub const REASON_NO_VALID_PROMPTS: &str = "no_valid_prompts";
/// Reason reported when a collaborator failed
pub const REASON_ERROR: &str = "error";

/// RecentTrainer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentTrainerConfig {
    /// Maximum accepted prompts per cycle
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Minimum trimmed prompt length in characters
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Accept each distinct prompt text at most once per cycle
    #[serde(default = "default_deduplicate")]
    pub deduplicate: bool,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default)]
    pub since_minutes: Option<u32>,
}

fn default_limit() -> usize {
    20
}

fn default_min_length() -> usize {
    5
}

fn default_deduplicate() -> bool {
    true
}

fn default_min_tokens() -> usize {
    5
}

impl Default for RecentTrainerConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            min_length: default_min_length(),
            tag: None,
            user_id: None,
            deduplicate: default_deduplicate(),
            min_tokens: default_min_tokens(),
            since_minutes: None,
        }
    }
}

/// Result of one RecentTrainer cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentTrainingReport {
    pub trained: bool,
    /// Prompts trained on, zero when nothing was trained
    #[serde(default)]
    pub samples: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

impl RecentTrainingReport {
    fn not_trained(reason: &str, message: Option<String>) -> Self {
        Self {
            trained: false,
            samples: 0,
            reason: Some(reason.to_string()),
            message,
            tag: None,
            user_id: None,
            timestamp: Utc::now(),
            loss: None,
            output_path: None,
        }
    }
}

/// Recent-prompt retraining controller
pub struct RecentTrainer {
    config: RecentTrainerConfig,
    memory: Arc<dyn MemoryGateway>,
    training: Arc<dyn TrainingGateway>,
    tokens: Arc<dyn TokenCounter>,
    training_timeout: Option<Duration>,
}

impl RecentTrainer {
    /// Every cycle with accepted prompts trains; there is nothing to simulate
    pub const SUPPORTS_DRY_RUN: bool = false;

    pub fn new(
        config: RecentTrainerConfig,
        memory: Arc<dyn MemoryGateway>,
        training: Arc<dyn TrainingGateway>,
        tokens: Arc<dyn TokenCounter>,
    ) -> Self {
        Self {
            config,
            memory,
            training,
            tokens,
            training_timeout: None,
        }
    }

    pub fn with_training_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.training_timeout = timeout;
        self
    }

    pub fn config(&self) -> &RecentTrainerConfig {
        &self.config
    }

    pub async fn run_cycle(&self) -> RecentTrainingReport {
        self.run_cycle_with_cancel(&CancellationToken::new()).await
    }

    /// Run one cycle, abandoning the training call if `cancel` fires
    pub async fn run_cycle_with_cancel(&self, cancel: &CancellationToken) -> RecentTrainingReport {
        let config = &self.config;
        let query = RecentQuery {
            limit: config.limit.saturating_mul(2),
            tag: config.tag.clone(),
            user_id: config.user_id,
            since_minutes: config.since_minutes,
        };

        let candidates = match self.memory.recent_prompts(&query).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(source = SOURCE, "Failed to load recent prompts: {}", e);
                return RecentTrainingReport::not_trained(REASON_ERROR, Some(e.to_string()));
            }
        };

        let mut seen = HashSet::new();
        let mut samples = Vec::new();
        for candidate in candidates {
            if samples.len() >= config.limit {
                break;
            }
            // Only the length check looks at the trimmed text
            let text = candidate.prompt;
            if text.trim().chars().count() < config.min_length {
                continue;
            }
            if config.deduplicate && seen.contains(&text) {
                continue;
            }
            if self.tokens.count_tokens(&text) < config.min_tokens {
                continue;
            }
            seen.insert(text.clone());
            samples.push(TrainingSample::from(text));
        }

        if samples.is_empty() {
            warn!(source = SOURCE, "No valid recent prompts found for fine-tuning.");
            return RecentTrainingReport::not_trained(REASON_NO_VALID_PROMPTS, None);
        }

        let count = samples.len();
        info!(source = SOURCE, "Fine-tuning on {} recent prompts...", count);

        match guarded_fine_tune(self.training.as_ref(), samples, self.training_timeout, cancel).await {
            Ok(outcome) => {
                info!(source = SOURCE, "Recent-memory fine-tuning complete.");
                RecentTrainingReport {
                    trained: true,
                    samples: count,
                    reason: None,
                    message: None,
                    tag: config.tag.clone(),
                    user_id: config.user_id,
                    timestamp: Utc::now(),
                    loss: Some(outcome.loss),
                    output_path: Some(outcome.output_path),
                }
            }
            Err(e) => {
                error!(source = SOURCE, "Recent-memory fine-tuning failed: {}", e);
                RecentTrainingReport::not_trained(REASON_ERROR, Some(e.to_string()))
            }
        }
    }
}

//! Gateways - the seams between the control plane and its collaborators
//!
//! Usage analytics, prompt memory, token counting and fine-tuning all live
//! outside the control plane. The controllers only see these traits; the
//! submodules provide in-process implementations good enough to run the
//! control loop end to end.

pub mod prompt_log;
pub mod trainer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{PromptUsage, RecentPrompt, TrainingOutcome, TrainingSample};

pub use prompt_log::{PromptLog, PromptLogEntry};
pub use trainer::{AdapterStrategy, CommandTrainer, SimulatedTrainer};

/// Operational failure of a collaborator.
///
/// Controllers never propagate these; they turn them into an `error`
/// status on the cycle result.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("analytics unavailable: {0}")]
    Analytics(String),
    #[error("prompt memory unavailable: {0}")]
    Memory(String),
    #[error("training failed: {0}")]
    Training(String),
    #[error("training timed out after {0:?}")]
    Timeout(Duration),
    #[error("training cancelled")]
    Cancelled,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Parameters for an aggregated usage lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageQuery {
    /// Maximum rows to return
    pub limit: usize,
    /// Minimum trimmed prompt length in characters
    pub min_length: usize,
    pub since_days: Option<u32>,
    pub tag: Option<String>,
    pub user_id: Option<i64>,
    /// Group prompts that differ only by case
    pub case_insensitive: bool,
}

impl UsageQuery {
    pub fn top(limit: usize) -> Self {
        Self {
            limit,
            min_length: 5,
            since_days: None,
            tag: None,
            user_id: None,
            case_insensitive: false,
        }
    }
}

/// Parameters for a recent-prompts lookup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecentQuery {
    pub limit: usize,
    pub tag: Option<String>,
    pub user_id: Option<i64>,
    pub since_minutes: Option<u32>,
}

/// Aggregated prompt usage, most frequent first
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalyticsGateway: Send + Sync {
    async fn most_common_prompts(&self, query: &UsageQuery) -> GatewayResult<Vec<PromptUsage>>;
}

/// Recently logged prompts, newest first
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemoryGateway: Send + Sync {
    async fn recent_prompts(&self, query: &RecentQuery) -> GatewayResult<Vec<RecentPrompt>>;
}

/// Fine-tuning backend. Duration is unbounded.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrainingGateway: Send + Sync {
    async fn fine_tune(&self, samples: Vec<TrainingSample>) -> GatewayResult<TrainingOutcome>;
}

/// Counts tokens in a prompt
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// Approximates tokens as whitespace-separated words
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenCounter;

impl TokenCounter for WhitespaceTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitespace_token_counter() {
        let counter = WhitespaceTokenCounter;
        assert_eq!(counter.count_tokens("how do  solana validators vote"), 5);
        assert_eq!(counter.count_tokens("   "), 0);
    }

    #[test]
    fn test_gateway_error_messages() {
        assert_eq!(GatewayError::Timeout(Duration::from_secs(30)).to_string(), "training timed out after 30s");
        assert_eq!(
            GatewayError::Training("out of memory".to_string()).to_string(),
            "training failed: out of memory"
        );
    }
}

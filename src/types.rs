//! Shared types used across modules
//!
//! Samples, usage rows and training outcomes flow between the gateways
//! and both retraining controllers, so they live here to avoid circular
//! dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One aggregated usage row returned by the analytics gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptUsage {
    pub prompt: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
}

impl PromptUsage {
    pub fn new(prompt: impl Into<String>, count: u64) -> Self {
        Self {
            prompt: prompt.into(),
            count,
            completion: None,
        }
    }

    pub fn with_completion(mut self, completion: impl Into<String>) -> Self {
        self.completion = Some(completion.into());
        self
    }
}

/// A recently logged prompt returned by the memory gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentPrompt {
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

/// A unit of fine-tuning data.
///
/// Serialized untagged: a bare prompt is a JSON string, a pair is an
/// object with `prompt` and `completion`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrainingSample {
    Prompt(String),
    Pair { prompt: String, completion: String },
}

impl TrainingSample {
    /// The prompt text regardless of shape
    pub fn prompt(&self) -> &str {
        match self {
            TrainingSample::Prompt(prompt) => prompt,
            TrainingSample::Pair { prompt, .. } => prompt,
        }
    }
}

impl From<&str> for TrainingSample {
    fn from(prompt: &str) -> Self {
        TrainingSample::Prompt(prompt.to_string())
    }
}

impl From<String> for TrainingSample {
    fn from(prompt: String) -> Self {
        TrainingSample::Prompt(prompt)
    }
}

/// What a successful fine-tuning run reports back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub loss: f64,
    pub output_path: String,
}

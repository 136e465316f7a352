//! Threshold-gated retraining controller
//!
//! One cycle: fetch the most used prompts, keep those used at least
//! `threshold` times, shape them into samples, then train (or, in dry-run,
//! stop short of training). Steps run strictly in that order and the
//! configuration is snapshotted when the cycle starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use super::guarded_fine_tune;
use crate::gateway::{AnalyticsGateway, TrainingGateway, UsageQuery};
use crate::types::{PromptUsage, TrainingOutcome, TrainingSample};

const SOURCE: &str = "auto_trainer";

/// AutoTrainer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTrainerConfig {
    /// Minimum usage count for a prompt to qualify
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    /// How many top prompts to request per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Run the whole pipeline but skip the training call
    #[serde(default)]
    pub dry_run: bool,
    /// Train on prompt/completion pairs instead of bare prompts
    #[serde(default)]
    pub include_completions: bool,
    /// Minimum prompt length passed to analytics
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default)]
    pub since_days: Option<u32>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

fn default_threshold() -> u64 {
    10
}

fn default_batch_size() -> usize {
    50
}

fn default_min_length() -> usize {
    5
}

impl Default for AutoTrainerConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            batch_size: default_batch_size(),
            dry_run: false,
            include_completions: false,
            min_length: default_min_length(),
            since_days: None,
            tag: None,
            user_id: None,
        }
    }
}

impl AutoTrainerConfig {
    fn usage_query(&self) -> UsageQuery {
        UsageQuery {
            limit: self.batch_size,
            min_length: self.min_length,
            since_days: self.since_days,
            tag: self.tag.clone(),
            user_id: self.user_id,
            case_insensitive: false,
        }
    }
}

/// Terminal state of one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Skipped,
    Trained,
    DryRun,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Skipped => write!(f, "skipped"),
            SessionStatus::Trained => write!(f, "trained"),
            SessionStatus::DryRun => write!(f, "dry-run"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// Result of one AutoTrainer cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainingSession {
    pub session_id: String,
    pub status: SessionStatus,
    pub qualified: usize,
    pub trained: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

impl RetrainingSession {
    /// `started_at` is when the cycle began, not when it finished
    fn new(
        session_id: &str,
        started_at: DateTime<Utc>,
        status: SessionStatus,
        qualified: usize,
        trained: usize,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            status,
            qualified,
            trained,
            timestamp: started_at,
            error_message: None,
            loss: None,
            output_path: None,
        }
    }

    fn failed(session_id: &str, started_at: DateTime<Utc>, qualified: usize, message: String) -> Self {
        let mut session = Self::new(session_id, started_at, SessionStatus::Error, qualified, 0);
        session.error_message = Some(message);
        session
    }

    fn with_outcome(mut self, outcome: TrainingOutcome) -> Self {
        self.loss = Some(outcome.loss);
        self.output_path = Some(outcome.output_path);
        self
    }
}

/// Shape qualified usage rows into training samples
fn shape_samples(qualified: Vec<PromptUsage>, include_completions: bool) -> Vec<TrainingSample> {
    qualified
        .into_iter()
        .map(|usage| {
            if include_completions {
                TrainingSample::Pair {
                    prompt: usage.prompt,
                    completion: usage.completion.unwrap_or_default(),
                }
            } else {
                TrainingSample::Prompt(usage.prompt)
            }
        })
        .collect()
}

/// Usage-threshold retraining controller
pub struct AutoTrainer {
    config: RwLock<AutoTrainerConfig>,
    analytics: Arc<dyn AnalyticsGateway>,
    training: Arc<dyn TrainingGateway>,
    training_timeout: Option<Duration>,
}

impl AutoTrainer {
    /// This controller can simulate a cycle without training
    pub const SUPPORTS_DRY_RUN: bool = true;

    pub fn new(
        config: AutoTrainerConfig,
        analytics: Arc<dyn AnalyticsGateway>,
        training: Arc<dyn TrainingGateway>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            analytics,
            training,
            training_timeout: None,
        }
    }

    /// Bound every training call by `timeout`
    pub fn with_training_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.training_timeout = timeout;
        self
    }

    /// Current configuration
    pub fn config(&self) -> AutoTrainerConfig {
        self.config.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Update the usage threshold for subsequent cycles
    pub fn set_threshold(&self, threshold: u64) {
        self.config.write().unwrap_or_else(|p| p.into_inner()).threshold = threshold;
        info!(source = SOURCE, "Threshold updated to {}", threshold);
    }

    /// Toggle dry-run for subsequent cycles
    pub fn set_dry_run(&self, dry_run: bool) {
        self.config.write().unwrap_or_else(|p| p.into_inner()).dry_run = dry_run;
        info!(source = SOURCE, "Dry-run mode set to {}", dry_run);
    }

    /// Toggle prompt/completion pairs for subsequent cycles
    pub fn set_include_completions(&self, include: bool) {
        self.config.write().unwrap_or_else(|p| p.into_inner()).include_completions = include;
        info!(source = SOURCE, "Include completions set to {}", include);
    }

    /// Run one analysis-and-maybe-train cycle
    pub async fn run_cycle(&self) -> RetrainingSession {
        self.run_cycle_with_cancel(&CancellationToken::new()).await
    }

    /// Run one cycle, abandoning the training call if `cancel` fires
    pub async fn run_cycle_with_cancel(&self, cancel: &CancellationToken) -> RetrainingSession {
        let session_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let config = self.config();
        info!(source = SOURCE, "[{}] Starting auto-training analysis...", session_id);

        let prompts = match self.analytics.most_common_prompts(&config.usage_query()).await {
            Ok(prompts) => prompts,
            Err(e) => {
                error!(source = SOURCE, "[{}] Error during auto-training: {}", session_id, e);
                return RetrainingSession::failed(&session_id, started_at, 0, e.to_string());
            }
        };

        let qualified: Vec<PromptUsage> = prompts
            .into_iter()
            .filter(|p| p.count >= config.threshold)
            .collect();

        if qualified.is_empty() {
            info!(source = SOURCE, "[{}] No prompts met training threshold ({}).", session_id, config.threshold);
            return RetrainingSession::new(&session_id, started_at, SessionStatus::Skipped, 0, 0);
        }

        let samples = shape_samples(qualified, config.include_completions);
        let qualified_count = samples.len();
        info!(source = SOURCE, "[{}] Qualified prompts: {}", session_id, qualified_count);

        if config.dry_run {
            info!(source = SOURCE, "[{}] Dry-run mode enabled. Training skipped.", session_id);
            return RetrainingSession::new(&session_id, started_at, SessionStatus::DryRun, qualified_count, 0);
        }

        match guarded_fine_tune(self.training.as_ref(), samples, self.training_timeout, cancel).await {
            Ok(outcome) => {
                info!(source = SOURCE, "[{}] Fine-tuning complete (loss: {:.4}).", session_id, outcome.loss);
                RetrainingSession::new(&session_id, started_at, SessionStatus::Trained, qualified_count, qualified_count)
                    .with_outcome(outcome)
            }
            Err(e) => {
                error!(source = SOURCE, "[{}] Error during auto-training: {}", session_id, e);
                RetrainingSession::failed(&session_id, started_at, qualified_count, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayError, MockAnalyticsGateway, MockTrainingGateway};

    fn usage(counts: &[u64]) -> Vec<PromptUsage> {
        counts
            .iter()
            .enumerate()
            .map(|(i, count)| PromptUsage::new(format!("prompt number {}", i), *count))
            .collect()
    }

    fn analytics_returning(rows: Vec<PromptUsage>) -> MockAnalyticsGateway {
        let mut analytics = MockAnalyticsGateway::new();
        analytics
            .expect_most_common_prompts()
            .returning(move |_| Ok(rows.clone()));
        analytics
    }

    fn config(threshold: u64, dry_run: bool) -> AutoTrainerConfig {
        AutoTrainerConfig {
            threshold,
            dry_run,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dry_run_reports_qualified_without_training() {
        let mut training = MockTrainingGateway::new();
        training.expect_fine_tune().times(0);

        let trainer = AutoTrainer::new(
            config(10, true),
            Arc::new(analytics_returning(usage(&[12, 8, 15]))),
            Arc::new(training),
        );

        let session = trainer.run_cycle().await;
        assert_eq!(session.status, SessionStatus::DryRun);
        assert_eq!(session.qualified, 2);
        assert_eq!(session.trained, 0);
        assert!(session.error_message.is_none());
    }

    #[tokio::test]
    async fn test_nothing_qualifies_skips_training() {
        let mut training = MockTrainingGateway::new();
        training.expect_fine_tune().times(0);

        let trainer = AutoTrainer::new(
            config(10, false),
            Arc::new(analytics_returning(usage(&[3, 2, 1]))),
            Arc::new(training),
        );

        let session = trainer.run_cycle().await;
        assert_eq!(session.status, SessionStatus::Skipped);
        assert_eq!(session.qualified, 0);
        assert_eq!(session.trained, 0);
    }

    #[tokio::test]
    async fn test_trains_on_qualified_prompts() {
        let mut training = MockTrainingGateway::new();
        training
            .expect_fine_tune()
            .times(1)
            .withf(|samples: &Vec<TrainingSample>| {
                samples
                    == &vec![
                        TrainingSample::from("prompt number 0"),
                        TrainingSample::from("prompt number 2"),
                    ]
            })
            .returning(|_| Ok(TrainingOutcome { loss: 0.8, output_path: "outputs/x".to_string() }));

        let trainer = AutoTrainer::new(
            config(10, false),
            Arc::new(analytics_returning(usage(&[12, 8, 15]))),
            Arc::new(training),
        );

        let session = trainer.run_cycle().await;
        assert_eq!(session.status, SessionStatus::Trained);
        assert_eq!(session.qualified, 2);
        assert_eq!(session.trained, 2);
        assert_eq!(session.output_path.as_deref(), Some("outputs/x"));
    }

    #[tokio::test]
    async fn test_session_timestamp_marks_cycle_start() {
        let training_seen_at = Arc::new(std::sync::Mutex::new(None));
        let mut training = MockTrainingGateway::new();
        let seen = training_seen_at.clone();
        training.expect_fine_tune().returning(move |_| {
            std::thread::sleep(Duration::from_millis(20));
            *seen.lock().unwrap() = Some(Utc::now());
            Ok(TrainingOutcome { loss: 0.5, output_path: "outputs/slow".to_string() })
        });
        let trainer = AutoTrainer::new(
            config(1, false),
            Arc::new(analytics_returning(usage(&[3]))),
            Arc::new(training),
        );

        let before = Utc::now();
        let session = trainer.run_cycle().await;
        let trained_at = training_seen_at.lock().unwrap().unwrap();

        assert_eq!(session.status, SessionStatus::Trained);
        assert!(session.timestamp >= before);
        assert!(session.timestamp < trained_at);
    }

    #[tokio::test]
    async fn test_include_completions_defaults_to_empty() {
        let rows = vec![
            PromptUsage::new("with completion", 20).with_completion("an answer"),
            PromptUsage::new("without completion", 20),
        ];
        let mut training = MockTrainingGateway::new();
        training
            .expect_fine_tune()
            .times(1)
            .withf(|samples: &Vec<TrainingSample>| {
                samples
                    == &vec![
                        TrainingSample::Pair {
                            prompt: "with completion".to_string(),
                            completion: "an answer".to_string(),
                        },
                        TrainingSample::Pair {
                            prompt: "without completion".to_string(),
                            completion: String::new(),
                        },
                    ]
            })
            .returning(|_| Ok(TrainingOutcome { loss: 0.5, output_path: "outputs/y".to_string() }));

        let trainer = AutoTrainer::new(
            AutoTrainerConfig { include_completions: true, ..Default::default() },
            Arc::new(analytics_returning(rows)),
            Arc::new(training),
        );

        assert_eq!(trainer.run_cycle().await.status, SessionStatus::Trained);
    }

    #[tokio::test]
    async fn test_gateway_failures_become_error_status() {
        let mut analytics = MockAnalyticsGateway::new();
        analytics
            .expect_most_common_prompts()
            .returning(|_| Err(GatewayError::Analytics("database offline".to_string())));
        let mut training = MockTrainingGateway::new();
        training.expect_fine_tune().times(0);

        let trainer = AutoTrainer::new(AutoTrainerConfig::default(), Arc::new(analytics), Arc::new(training));
        let session = trainer.run_cycle().await;
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.qualified, 0);
        assert!(session.error_message.unwrap().contains("database offline"));

        let mut training = MockTrainingGateway::new();
        training
            .expect_fine_tune()
            .returning(|_| Err(GatewayError::Training("CUDA out of memory".to_string())));
        let trainer = AutoTrainer::new(
            config(10, false),
            Arc::new(analytics_returning(usage(&[11]))),
            Arc::new(training),
        );
        let session = trainer.run_cycle().await;
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.qualified, 1);
        assert_eq!(session.trained, 0);
        assert!(session.error_message.unwrap().contains("CUDA out of memory"));
    }

    #[tokio::test]
    async fn test_mutators_apply_to_next_cycle() {
        let mut training = MockTrainingGateway::new();
        training.expect_fine_tune().times(0);
        let trainer = AutoTrainer::new(
            config(10, false),
            Arc::new(analytics_returning(usage(&[5]))),
            Arc::new(training),
        );

        assert_eq!(trainer.run_cycle().await.status, SessionStatus::Skipped);

        trainer.set_threshold(5);
        trainer.set_dry_run(true);
        let session = trainer.run_cycle().await;
        assert_eq!(session.status, SessionStatus::DryRun);
        assert_eq!(session.qualified, 1);
        assert_eq!(trainer.config().threshold, 5);
    }

    #[test]
    fn test_session_serializes_status_names() {
        let session = RetrainingSession::new("abc", Utc::now(), SessionStatus::DryRun, 2, 0);
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "dry-run");
        assert!(json.get("error_message").is_none());
        assert_eq!(SessionStatus::DryRun.to_string(), "dry-run");
    }
}

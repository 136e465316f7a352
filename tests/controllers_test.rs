//! End-to-end tests for the retraining controllers:
//! - AutoTrainer over a real prompt log
//! - RecentTrainer dedup and filtering
//! - Scheduler lease sharing between two schedulers
//! - Timeout and cancellation at the training boundary

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use locentra::gateway::{GatewayResult, PromptLogEntry, SimulatedTrainer, WhitespaceTokenCounter};
use locentra::registry::REGISTRY_RETRAIN_LEASE;
use locentra::trainer::{AutoTrainerConfig, RecentTrainerConfig, SchedulerConfig};
use locentra::types::{TrainingOutcome, TrainingSample};
use locentra::{AutoTrainer, PromptLog, RecentTrainer, Registry, RetrainScheduler, SessionStatus, TrainingGateway};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records every batch it is asked to train on
#[derive(Default)]
struct RecordingTrainer {
    batches: Mutex<Vec<Vec<TrainingSample>>>,
    delay: Duration,
}

impl RecordingTrainer {
    fn slow(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }

    fn batches(&self) -> Vec<Vec<TrainingSample>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrainingGateway for RecordingTrainer {
    async fn fine_tune(&self, samples: Vec<TrainingSample>) -> GatewayResult<TrainingOutcome> {
        tokio::time::sleep(self.delay).await;
        self.batches.lock().unwrap().push(samples);
        Ok(TrainingOutcome { loss: 0.9, output_path: "outputs/recorded".to_string() })
    }
}

fn log_times(log: &PromptLog, prompt: &str, times: usize) {
    for _ in 0..times {
        log.log_prompt(prompt, None, None, None, "test", true).unwrap();
    }
}

// =====================================================================
// AUTO TRAINER
// =====================================================================

#[tokio::test]
async fn test_auto_trainer_threshold_over_prompt_log() {
    let log = Arc::new(PromptLog::in_memory());
    log_times(&log, "how do validators earn rewards", 12);
    log_times(&log, "what is a stake account", 8);
    log_times(&log, "explain leader schedule rotation", 15);

    let recorder = Arc::new(RecordingTrainer::default());
    let trainer = AutoTrainer::new(
        AutoTrainerConfig { threshold: 10, dry_run: true, ..Default::default() },
        log.clone(),
        recorder.clone(),
    );

    let session = trainer.run_cycle().await;
    assert_eq!(session.status, SessionStatus::DryRun);
    assert_eq!(session.qualified, 2);
    assert_eq!(session.trained, 0);
    assert!(recorder.batches().is_empty());

    trainer.set_dry_run(false);
    let session = trainer.run_cycle().await;
    assert_eq!(session.status, SessionStatus::Trained);
    assert_eq!(session.trained, 2);

    let batches = recorder.batches();
    assert_eq!(batches.len(), 1);
    // Most used first
    assert_eq!(batches[0][0], TrainingSample::from("explain leader schedule rotation"));
    assert_eq!(batches[0][1], TrainingSample::from("how do validators earn rewards"));
}

#[tokio::test]
async fn test_auto_trainer_with_simulated_backend() {
    let log = Arc::new(PromptLog::in_memory());
    log_times(&log, "summarize the epoch boundary", 3);

    let trainer = AutoTrainer::new(
        AutoTrainerConfig { threshold: 3, ..Default::default() },
        log,
        Arc::new(SimulatedTrainer::new(Duration::from_millis(1))),
    );

    let session = trainer.run_cycle().await;
    assert_eq!(session.status, SessionStatus::Trained);
    assert!(session.output_path.unwrap().starts_with("outputs/fine_tuned_"));
    assert!(session.loss.is_some());
}

#[tokio::test]
async fn test_training_timeout_becomes_error_status() {
    let log = Arc::new(PromptLog::in_memory());
    log_times(&log, "a prompt used very often", 20);

    let trainer = AutoTrainer::new(
        AutoTrainerConfig::default(),
        log,
        Arc::new(RecordingTrainer::slow(Duration::from_secs(5))),
    )
    .with_training_timeout(Some(Duration::from_millis(20)));

    let session = trainer.run_cycle().await;
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(session.qualified, 1);
    assert_eq!(session.trained, 0);
    assert!(session.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_cancelled_cycle_becomes_error_status() {
    let log = Arc::new(PromptLog::in_memory());
    log_times(&log, "a prompt used very often", 20);

    let trainer = AutoTrainer::new(
        AutoTrainerConfig::default(),
        log,
        Arc::new(RecordingTrainer::slow(Duration::from_secs(5))),
    );

    let token = CancellationToken::new();
    token.cancel();
    let session = trainer.run_cycle_with_cancel(&token).await;
    assert_eq!(session.status, SessionStatus::Error);
    assert!(session.error_message.unwrap().contains("cancelled"));
}

// =====================================================================
// RECENT TRAINER
// =====================================================================

#[tokio::test]
async fn test_recent_trainer_dedups_newest_first() {
    let log = Arc::new(PromptLog::in_memory());
    let now = Utc::now();
    let prompts = [
        "how does turbine propagate shreds",
        "why did my transaction expire early",
        "how does turbine propagate shreds",
        "hi",
        "what is gulf stream forwarding exactly",
    ];
    for (i, prompt) in prompts.iter().enumerate() {
        log.insert(PromptLogEntry::new(*prompt).at(now - ChronoDuration::seconds(10 - i as i64)))
            .unwrap();
    }

    let recorder = Arc::new(RecordingTrainer::default());
    let trainer = RecentTrainer::new(
        RecentTrainerConfig::default(),
        log,
        recorder.clone(),
        Arc::new(WhitespaceTokenCounter),
    );

    let report = trainer.run_cycle().await;
    assert!(report.trained);
    assert_eq!(report.samples, 3);

    let batch = &recorder.batches()[0];
    assert_eq!(
        batch,
        &vec![
            TrainingSample::from("what is gulf stream forwarding exactly"),
            TrainingSample::from("how does turbine propagate shreds"),
            TrainingSample::from("why did my transaction expire early"),
        ]
    );
}

#[tokio::test]
async fn test_recent_trainer_with_empty_log() {
    let recorder = Arc::new(RecordingTrainer::default());
    let trainer = RecentTrainer::new(
        RecentTrainerConfig::default(),
        Arc::new(PromptLog::in_memory()),
        recorder.clone(),
        Arc::new(WhitespaceTokenCounter),
    );

    let report = trainer.run_cycle().await;
    assert_eq!(report.samples, 0);
    assert!(!report.trained);
    assert_eq!(report.reason.as_deref(), Some("no_valid_prompts"));
    assert!(recorder.batches().is_empty());
}

// =====================================================================
// SCHEDULER
// =====================================================================

#[tokio::test]
async fn test_two_schedulers_share_one_lease() {
    let log = Arc::new(PromptLog::in_memory());
    log_times(&log, "how are priority fees computed", 15);

    let registry = Arc::new(Registry::new());
    let recorder = Arc::new(RecordingTrainer::slow(Duration::from_millis(200)));
    let make_scheduler = || {
        RetrainScheduler::new(
            SchedulerConfig::default(),
            Arc::new(AutoTrainer::new(AutoTrainerConfig::default(), log.clone(), recorder.clone())),
            registry.clone(),
        )
    };
    let first = make_scheduler();
    let second = make_scheduler();

    let slow_tick = first.tick();
    let busy_tick = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.exists(REGISTRY_RETRAIN_LEASE));
        second.tick().await
    };
    let (ran, skipped) = tokio::join!(slow_tick, busy_tick);

    assert_eq!(ran.unwrap().status, SessionStatus::Trained);
    assert!(skipped.is_none());
    assert_eq!(second.stats().skipped_busy, 1);
    assert_eq!(recorder.batches().len(), 1);
    assert!(!registry.exists(REGISTRY_RETRAIN_LEASE));

    // Lease released, so the second scheduler may run now
    assert!(second.tick().await.is_some());
}

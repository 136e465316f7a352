//! Periodic driver for AutoTrainer cycles
//!
//! Each tick takes the `retrain_lease` registry key with a TTL, runs one
//! cycle, then releases the lease. A second scheduler (or a manual run that
//! takes the same lease) sees the key held and skips its tick. If a holder
//! dies mid-cycle the lease simply expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auto::{AutoTrainer, RetrainingSession};
use crate::registry::{Registry, REGISTRY_RETRAIN_LEASE};

const SOURCE: &str = "scheduler";

/// Registry key holding the most recent scheduled session
pub const LAST_SESSION_KEY: &str = "last_retrain_session";

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Start the loop automatically with `locentra schedule`
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Lease lifetime; should exceed the longest expected cycle
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_lease_ttl_secs() -> u64 {
    1800
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub cycles: u64,
    pub skipped_busy: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

/// Runs [`AutoTrainer`] cycles on an interval under a registry lease
pub struct RetrainScheduler {
    config: SchedulerConfig,
    trainer: Arc<AutoTrainer>,
    registry: Arc<Registry>,
    holder_id: String,
    stats: Mutex<SchedulerStats>,
}

impl RetrainScheduler {
    pub fn new(config: SchedulerConfig, trainer: Arc<AutoTrainer>, registry: Arc<Registry>) -> Self {
        Self {
            config,
            trainer,
            registry,
            holder_id: Uuid::new_v4().to_string(),
            stats: Mutex::new(SchedulerStats::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn record<F: FnOnce(&mut SchedulerStats)>(&self, update: F) {
        update(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }

    /// One guarded cycle. `None` when another holder has the lease.
    pub async fn tick(&self) -> Option<RetrainingSession> {
        self.tick_with_cancel(&CancellationToken::new()).await
    }

    /// One guarded cycle whose training call is abandoned if `cancel` fires
    pub async fn tick_with_cancel(&self, cancel: &CancellationToken) -> Option<RetrainingSession> {
        self.record(|s| {
            s.ticks += 1;
            s.last_tick = Some(Utc::now());
        });

        let lease = serde_json::json!({ "holder": self.holder_id, "acquired_at": Utc::now() });
        match self
            .registry
            .try_acquire(REGISTRY_RETRAIN_LEASE, lease, Some(self.config.lease_ttl_secs))
        {
            Ok(true) => {}
            Ok(false) => {
                info!(source = SOURCE, "Retraining already in progress, skipping tick");
                self.record(|s| s.skipped_busy += 1);
                return None;
            }
            Err(e) => {
                warn!(source = SOURCE, "Cannot take retrain lease: {}", e);
                self.record(|s| s.skipped_busy += 1);
                return None;
            }
        }

        let session = self.trainer.run_cycle_with_cancel(cancel).await;
        self.release_lease();
        self.record(|s| s.cycles += 1);

        if let Err(e) = self.registry.register_as(LAST_SESSION_KEY, &session, None, false) {
            warn!(source = SOURCE, "Failed to record last session: {}", e);
        }
        info!(source = SOURCE, "Scheduled cycle finished with status {}", session.status);
        Some(session)
    }

    /// Drop the lease only if this scheduler still holds it
    fn release_lease(&self) {
        let released = self.registry.remove_if(REGISTRY_RETRAIN_LEASE, |lease| {
            lease.get("holder").and_then(|h| h.as_str()) == Some(self.holder_id.as_str())
        });
        if !released {
            debug!(source = SOURCE, "Retrain lease expired or taken over before release");
        }
    }

    /// Tick every `interval_secs` until `shutdown` is cancelled.
    ///
    /// The first cycle runs immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(source = SOURCE, "Retrain scheduler started (every {}s)", self.config.interval_secs);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(source = SOURCE, "Retrain scheduler received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.tick_with_cancel(&shutdown).await;
                }
            }
        }

        info!(source = SOURCE, "Retrain scheduler exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockAnalyticsGateway, MockTrainingGateway};
    use crate::trainer::{AutoTrainerConfig, SessionStatus};
    use crate::types::PromptUsage;

    fn dry_run_trainer() -> Arc<AutoTrainer> {
        let mut analytics = MockAnalyticsGateway::new();
        analytics
            .expect_most_common_prompts()
            .returning(|_| Ok(vec![PromptUsage::new("explain stake delegation", 30)]));
        let mut training = MockTrainingGateway::new();
        training.expect_fine_tune().times(0);
        Arc::new(AutoTrainer::new(
            AutoTrainerConfig { dry_run: true, ..Default::default() },
            Arc::new(analytics),
            Arc::new(training),
        ))
    }

    #[tokio::test]
    async fn test_tick_runs_cycle_and_releases_lease() {
        let registry = Arc::new(Registry::new());
        let scheduler = RetrainScheduler::new(SchedulerConfig::default(), dry_run_trainer(), registry.clone());

        let session = scheduler.tick().await.unwrap();
        assert_eq!(session.status, SessionStatus::DryRun);
        assert!(!registry.exists(REGISTRY_RETRAIN_LEASE));

        let recorded: RetrainingSession = registry.get_as(LAST_SESSION_KEY).unwrap().unwrap();
        assert_eq!(recorded.session_id, session.session_id);

        let stats = scheduler.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.skipped_busy, 0);
    }

    #[tokio::test]
    async fn test_tick_skips_while_lease_is_held() {
        let registry = Arc::new(Registry::new());
        registry
            .register(REGISTRY_RETRAIN_LEASE, serde_json::json!({ "holder": "someone-else" }), Some(600), false)
            .unwrap();
        let scheduler = RetrainScheduler::new(SchedulerConfig::default(), dry_run_trainer(), registry.clone());

        assert!(scheduler.tick().await.is_none());
        let stats = scheduler.stats();
        assert_eq!(stats.skipped_busy, 1);
        assert_eq!(stats.cycles, 0);
        // Foreign lease is left alone
        assert!(registry.exists(REGISTRY_RETRAIN_LEASE));
    }

    #[tokio::test]
    async fn test_release_keeps_lease_taken_over_mid_cycle() {
        let registry = Arc::new(Registry::new());
        let mut analytics = MockAnalyticsGateway::new();
        let shared = registry.clone();
        analytics.expect_most_common_prompts().returning(move |_| {
            shared
                .register(REGISTRY_RETRAIN_LEASE, serde_json::json!({ "holder": "usurper" }), Some(600), false)
                .unwrap();
            Ok(vec![])
        });
        let trainer = Arc::new(AutoTrainer::new(
            AutoTrainerConfig { dry_run: true, ..Default::default() },
            Arc::new(analytics),
            Arc::new(MockTrainingGateway::new()),
        ));
        let scheduler = RetrainScheduler::new(SchedulerConfig::default(), trainer, registry.clone());

        assert!(scheduler.tick().await.is_some());
        let lease = registry.get(REGISTRY_RETRAIN_LEASE).unwrap();
        assert_eq!(lease["holder"], "usurper");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let registry = Arc::new(Registry::new());
        let scheduler = Arc::new(RetrainScheduler::new(
            SchedulerConfig { interval_secs: 3600, ..Default::default() },
            dry_run_trainer(),
            registry,
        ));
        let token = CancellationToken::new();

        let handle = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert_eq!(scheduler.stats().cycles, 1);
    }
}

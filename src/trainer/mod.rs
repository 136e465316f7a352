//! Retraining controllers
//!
//! Two orchestrators decide, per invocation, whether to fine-tune:
//! - [`AutoTrainer`] gates on aggregated usage counts and supports dry-run
//! - [`RecentTrainer`] samples recently logged prompts, deduplicating and
//!   filtering them, and always trains when anything survives
//!
//! [`RetrainScheduler`] drives AutoTrainer cycles periodically. Neither
//! controller ever returns an error: collaborator failures become an
//! `error` status on the result.

pub mod auto;
pub mod recent;
pub mod scheduler;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::gateway::{GatewayError, GatewayResult, TrainingGateway};
use crate::types::{TrainingOutcome, TrainingSample};

pub use auto::{AutoTrainer, AutoTrainerConfig, RetrainingSession, SessionStatus};
pub use recent::{RecentTrainer, RecentTrainerConfig, RecentTrainingReport};
pub use scheduler::{RetrainScheduler, SchedulerConfig, SchedulerStats};

/// Call the training gateway, bounded by an optional timeout and a
/// cancellation token. This is the only unbounded step of a cycle.
pub(crate) async fn guarded_fine_tune(
    gateway: &dyn TrainingGateway,
    samples: Vec<TrainingSample>,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> GatewayResult<TrainingOutcome> {
    if cancel.is_cancelled() {
        return Err(GatewayError::Cancelled);
    }

    let training = gateway.fine_tune(samples);
    let bounded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, training).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(limit)),
            },
            None => training.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        result = bounded => result,
    }
}

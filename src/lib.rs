//! Locentra - operational control plane for a self-retraining LLM backend
//!
//! - Ephemeral registry of shared runtime objects with TTL and locking
//! - Bounded in-memory log store fed by `tracing`
//! - Usage-threshold and recent-memory retraining controllers
//! - Periodic retrain scheduler guarded by a registry lease
//!
//! # Example
//!
//! ```ignore
//! use locentra::{Config, ControlPlane};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let plane = ControlPlane::new(Config::load()?);
//!     let session = plane.auto_trainer()?.run_cycle().await;
//!     println!("{}", session.status);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod types;
pub mod registry;
pub mod logs;
pub mod gateway;
pub mod trainer;
pub mod config;
pub mod state;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;

pub use registry::{ImportPolicy, Registry, RegistryError};

pub use logs::{LogLevel, LogQuery, LogRecord, LogStore};

pub use gateway::{
    AnalyticsGateway,
    GatewayError,
    MemoryGateway,
    PromptLog,
    TokenCounter,
    TrainingGateway,
};

pub use trainer::{
    AutoTrainer,
    RecentTrainer,
    RetrainScheduler,
    RetrainingSession,
    SessionStatus,
};

pub use state::ControlPlane;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

//! Global tracing subscriber installation

use anyhow::Result;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use super::{LogStore, LogStoreLayer};
use crate::config::LoggingConfig;

/// Install the console layer and the log store layer.
///
/// The console honours `RUST_LOG`, falling back to `logging.level`, and
/// writes to stderr so command output on stdout stays machine readable.
/// The store always receives this crate's events from DEBUG up.
pub fn init_tracing(config: &LoggingConfig, store: Arc<LogStore>) -> Result<()> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (plain, json) = if config.json {
        let layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter);
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(console_filter);
        (Some(layer), None)
    };

    let store_layer = LogStoreLayer::new(store)
        .with_filter(Targets::new().with_target(env!("CARGO_CRATE_NAME"), Level::DEBUG));

    tracing_subscriber::registry()
        .with(store_layer)
        .with(plain)
        .with(json)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

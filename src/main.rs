//! Locentra - operational control plane for a self-retraining LLM backend

// Use the library crate for all modules
use locentra::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging is installed by the CLI once the config file is known
    cli::run().await
}

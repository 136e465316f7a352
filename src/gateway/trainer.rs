//! Training gateways
//!
//! Two backends: a simulated trainer for development and dry environments,
//! and a command trainer that hands the batch to an external fine-tuning
//! program and reads its outcome back.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{debug, info, warn};

use super::{GatewayError, GatewayResult, TrainingGateway};
use crate::types::{TrainingOutcome, TrainingSample};

/// Samples whose trimmed prompt is this short or shorter are dropped
const MIN_SAMPLE_CHARS: usize = 3;

/// Adapter layers applied to the base model before fine-tuning.
///
/// Resolved once when configuration is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStrategy {
    #[default]
    None,
    Lora,
    #[serde(rename = "quant", alias = "quantization")]
    Quantization,
}

impl AdapterStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterStrategy::None => "none",
            AdapterStrategy::Lora => "lora",
            AdapterStrategy::Quantization => "quant",
        }
    }
}

impl std::fmt::Display for AdapterStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn usable_samples(samples: Vec<TrainingSample>) -> GatewayResult<Vec<TrainingSample>> {
    let usable: Vec<TrainingSample> = samples
        .into_iter()
        .filter(|s| s.prompt().trim().chars().count() > MIN_SAMPLE_CHARS)
        .collect();
    if usable.is_empty() {
        return Err(GatewayError::Training("no valid training texts provided".to_string()));
    }
    Ok(usable)
}

fn output_path() -> String {
    format!("outputs/fine_tuned_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Pretends to fine-tune: waits, then reports a plausible loss
pub struct SimulatedTrainer {
    delay: Duration,
    adapter: AdapterStrategy,
    runs: AtomicU64,
}

impl SimulatedTrainer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            adapter: AdapterStrategy::None,
            runs: AtomicU64::new(0),
        }
    }

    pub fn with_adapter(mut self, adapter: AdapterStrategy) -> Self {
        self.adapter = adapter;
        self
    }

    /// Completed runs so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TrainingGateway for SimulatedTrainer {
    async fn fine_tune(&self, samples: Vec<TrainingSample>) -> GatewayResult<TrainingOutcome> {
        let samples = usable_samples(samples)?;
        info!(
            source = "trainer",
            "Simulating fine-tuning on {} samples (adapter: {})",
            samples.len(),
            self.adapter
        );

        tokio::time::sleep(self.delay).await;

        // Loss shrinks with batch size so repeated runs look like progress
        let loss = 2.0 / (1.0 + (samples.len() as f64).ln());
        self.runs.fetch_add(1, Ordering::Relaxed);

        Ok(TrainingOutcome {
            loss,
            output_path: output_path(),
        })
    }
}

/// Runs an external fine-tuning program.
///
/// The program receives the samples as a JSON array on stdin and
/// `--adapter <strategy>` as its last arguments. It must print
/// `{"loss": .., "output_path": ..}` as the last non-empty line of stdout.
/// The child is killed if the call is dropped, which is how timeouts and
/// cancellation reach it.
pub struct CommandTrainer {
    program: String,
    args: Vec<String>,
    adapter: AdapterStrategy,
}

impl CommandTrainer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            adapter: AdapterStrategy::None,
        }
    }

    pub fn with_adapter(mut self, adapter: AdapterStrategy) -> Self {
        self.adapter = adapter;
        self
    }
}

#[async_trait]
impl TrainingGateway for CommandTrainer {
    async fn fine_tune(&self, samples: Vec<TrainingSample>) -> GatewayResult<TrainingOutcome> {
        let samples = usable_samples(samples)?;
        let payload = serde_json::to_vec(&samples)
            .map_err(|e| GatewayError::Training(format!("failed to encode samples: {}", e)))?;

        info!(source = "trainer", "Starting '{}' on {} samples (adapter: {})", self.program, samples.len(), self.adapter);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--adapter")
            .arg(self.adapter.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Feed stdin while draining stdout and stderr so neither pipe can fill up
        let feed = feed_stdin(child.stdin.take(), payload);
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        match fed {
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(source = "trainer", "'{}' closed stdin before reading the whole batch", self.program);
            }
            other => other?,
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(source = "trainer", "trainer stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            warn!(source = "trainer", "Training command exited with {}", output.status);
            return Err(GatewayError::Training(format!(
                "'{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last_line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| GatewayError::Training("trainer printed no outcome".to_string()))?;

        serde_json::from_str(last_line.trim())
            .map_err(|e| GatewayError::Training(format!("unreadable trainer outcome '{}': {}", last_line.trim(), e)))
    }
}

async fn feed_stdin(stdin: Option<ChildStdin>, payload: Vec<u8>) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    stdin.write_all(&payload).await?;
    stdin.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(prompts: &[&str]) -> Vec<TrainingSample> {
        prompts.iter().map(|p| TrainingSample::from(*p)).collect()
    }

    #[test]
    fn test_adapter_strategy_parsing() {
        #[derive(Deserialize)]
        struct Wrapper {
            adapter: AdapterStrategy,
        }

        let parsed: Wrapper = toml::from_str("adapter = \"lora\"").unwrap();
        assert_eq!(parsed.adapter, AdapterStrategy::Lora);
        let parsed: Wrapper = toml::from_str("adapter = \"quant\"").unwrap();
        assert_eq!(parsed.adapter, AdapterStrategy::Quantization);
        let parsed: Wrapper = toml::from_str("adapter = \"quantization\"").unwrap();
        assert_eq!(parsed.adapter, AdapterStrategy::Quantization);
        assert!(toml::from_str::<Wrapper>("adapter = \"magic\"").is_err());
    }

    #[tokio::test]
    async fn test_simulated_trainer_reports_outcome() {
        let trainer = SimulatedTrainer::new(Duration::from_millis(1));
        let outcome = trainer
            .fine_tune(batch(&["first prompt", "second prompt"]))
            .await
            .unwrap();
        assert!(outcome.loss > 0.0);
        assert!(outcome.output_path.starts_with("outputs/fine_tuned_"));
        assert_eq!(trainer.runs(), 1);
    }

    #[tokio::test]
    async fn test_simulated_trainer_rejects_unusable_batch() {
        let trainer = SimulatedTrainer::new(Duration::ZERO);
        let err = trainer.fine_tune(batch(&["hi", "   "])).await.unwrap_err();
        assert!(matches!(err, GatewayError::Training(_)));
        assert_eq!(trainer.runs(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_trainer_parses_stdout() {
        let script = r#"cat > /dev/null; echo "epoch 1"; echo '{"loss": 0.42, "output_path": "outputs/run"}'"#;
        let trainer = CommandTrainer::new("sh", vec!["-c".to_string(), script.to_string()])
            .with_adapter(AdapterStrategy::Lora);

        let outcome = trainer.fine_tune(batch(&["a real prompt"])).await.unwrap();
        assert_eq!(outcome.output_path, "outputs/run");
        assert!((outcome.loss - 0.42).abs() < f64::EPSILON);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_trainer_survives_chatty_child() {
        // Writes well past a pipe buffer before reading any input
        let script = r#"head -c 200000 /dev/zero | tr '\0' x; echo; cat > /dev/null; echo '{"loss": 0.5, "output_path": "outputs/chatty"}'"#;
        let trainer = CommandTrainer::new("sh", vec!["-c".to_string(), script.to_string()]);
        let samples = (0..5000)
            .map(|i| TrainingSample::from(format!("prompt number {} about validators", i)))
            .collect();

        let outcome = tokio::time::timeout(Duration::from_secs(30), trainer.fine_tune(samples))
            .await
            .expect("trainer deadlocked")
            .unwrap();
        assert_eq!(outcome.output_path, "outputs/chatty");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_trainer_ignoring_stdin_still_succeeds() {
        let script = r#"echo '{"loss": 0.1, "output_path": "outputs/deaf"}'"#;
        let trainer = CommandTrainer::new("sh", vec!["-c".to_string(), script.to_string()]);
        let samples = (0..5000)
            .map(|i| TrainingSample::from(format!("prompt number {} about validators", i)))
            .collect();

        let outcome = trainer.fine_tune(samples).await.unwrap();
        assert_eq!(outcome.output_path, "outputs/deaf");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_trainer_failure_is_gateway_error() {
        let trainer = CommandTrainer::new(
            "sh",
            vec!["-c".to_string(), "cat > /dev/null; echo boom >&2; exit 3".to_string()],
        );
        let err = trainer.fine_tune(batch(&["a real prompt"])).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}

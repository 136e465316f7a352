//! CLI interface for locentra

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{self, Config};
use crate::gateway::{AnalyticsGateway, TokenCounter, UsageQuery, WhitespaceTokenCounter};
use crate::logs::{init_tracing, LogQuery, LogStore, DEFAULT_QUERY_LIMIT};
use crate::state::ControlPlane;
use crate::trainer::{AutoTrainer, RecentTrainer};
use crate::types::TrainingSample;

#[derive(Parser)]
#[command(name = "locentra")]
#[command(about = "Operational control plane for a self-retraining LLM backend", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "LOCENTRA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Print buffered log records after the command finishes
    #[arg(long, global = true)]
    show_logs: bool,

    /// Only show log records of this level (DEBUG, INFO, WARNING, ERROR, CRITICAL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Maximum log records to show
    #[arg(long, global = true, default_value_t = DEFAULT_QUERY_LIMIT)]
    log_limit: usize,

    /// Print the registry snapshot after the command finishes
    #[arg(long, global = true)]
    show_registry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Control(ControlCommand),

    /// Configuration management
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Reset configuration to defaults
        #[arg(long)]
        reset: bool,
    },
}

/// Commands that run against a live control plane
#[derive(Subcommand)]
enum ControlCommand {
    /// Retrain on the most used prompts once they pass the usage threshold
    AutoTrain {
        /// Minimum usage count to qualify
        #[arg(short, long)]
        threshold: Option<u64>,

        /// Number of top prompts to inspect
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Analyse only, never train
        #[arg(long)]
        dry_run: bool,

        /// Train on prompt/completion pairs
        #[arg(long)]
        include_completions: bool,
    },

    /// Retrain on recently logged prompts
    RecentTrain {
        /// Maximum prompts to train on
        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(long)]
        tag: Option<String>,

        #[arg(long)]
        user_id: Option<i64>,

        /// Only consider prompts from the last N minutes
        #[arg(long)]
        since_minutes: Option<u32>,

        /// Keep repeated prompts
        #[arg(long)]
        no_dedup: bool,

        /// Minimum tokens per prompt
        #[arg(long)]
        min_tokens: Option<usize>,

        /// Not supported for this controller
        #[arg(long, hide = true)]
        dry_run: bool,
    },

    /// Fine-tune on prompts read from a file
    Train {
        /// Training data file
        #[arg(short, long)]
        file: PathBuf,

        /// File format (inferred from the extension when omitted)
        #[arg(long, value_enum)]
        format: Option<FileFormat>,

        /// Load and count samples without training
        #[arg(long)]
        dry_run: bool,

        /// Metadata tags recorded with the run
        #[arg(long, num_args = 0..)]
        tags: Vec<String>,

        /// Where the training data came from
        #[arg(long, default_value = "cli")]
        source: String,
    },

    /// Record a prompt in the prompt log
    LogPrompt {
        /// Prompt text
        prompt: String,

        #[arg(long)]
        completion: Option<String>,

        #[arg(long)]
        tag: Option<String>,

        #[arg(long)]
        user_id: Option<i64>,

        /// Log even if the same prompt was logged in the last minute
        #[arg(long)]
        allow_duplicates: bool,
    },

    /// Show the most used prompts
    TopPrompts {
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Group prompts that differ only by case
        #[arg(long)]
        case_insensitive: bool,

        #[arg(long)]
        tag: Option<String>,

        #[arg(long)]
        user_id: Option<i64>,

        #[arg(long)]
        since_days: Option<u32>,
    },

    /// Run auto-training periodically until interrupted
    Schedule {
        /// Seconds between cycles
        #[arg(short, long)]
        interval_secs: Option<u64>,
    },
}

/// Training data file layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FileFormat {
    /// One prompt per line
    Txt,
    /// One JSON object per line with a `text` field
    Jsonl,
}

impl FileFormat {
    fn infer(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("jsonl") => FileFormat::Jsonl,
            _ => FileFormat::Txt,
        }
    }
}

#[derive(Deserialize)]
struct JsonlRecord {
    text: String,
    #[serde(default)]
    completion: Option<String>,
}

/// Read training samples from a txt or jsonl file, skipping blank lines
pub fn load_training_file(path: &Path, format: FileFormat) -> Result<Vec<TrainingSample>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());
    match format {
        FileFormat::Txt => Ok(lines.map(TrainingSample::from).collect()),
        FileFormat::Jsonl => lines
            .enumerate()
            .map(|(i, line)| {
                let record: JsonlRecord = serde_json::from_str(line)
                    .with_context(|| format!("Invalid JSON on line {} of {}", i + 1, path.display()))?;
                Ok(match record.completion {
                    Some(completion) => TrainingSample::Pair { prompt: record.text, completion },
                    None => TrainingSample::Prompt(record.text),
                })
            })
            .collect(),
    }
}

/// Outcome of `locentra train`
#[derive(Debug, Serialize)]
struct ManualTrainingReport {
    session_id: String,
    samples: usize,
    token_estimate: usize,
    dry_run: bool,
    trained: bool,
    tags: Vec<String>,
    source: String,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to render output")?);
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_file = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_path()?,
    };

    // Config commands must work even when the file is unreadable
    let command = match cli.command {
        Commands::Config { show, reset } => return config_command(&config_file, show, reset),
        Commands::Control(command) => command,
    };

    let config = Config::load_from(&config_file)?;
    let logs = Arc::new(LogStore::new(config.logging.buffer_capacity));
    init_tracing(&config.logging, logs.clone())?;

    let plane = ControlPlane::with_log_store(config, logs);
    let result = dispatch(&plane, command).await;

    if cli.show_logs {
        let mut query = LogQuery::new(cli.log_limit, 0);
        if let Some(level) = &cli.log_level {
            query = query.level_str(level);
        }
        for record in plane.logs().query(&query) {
            println!("{}", serde_json::to_string(&record).context("Failed to render log record")?);
        }
    }

    if cli.show_registry {
        println!("{}", plane.registry().export_snapshot()?);
    }

    plane.shutdown();
    result
}

async fn dispatch(plane: &ControlPlane, command: ControlCommand) -> Result<()> {
    match command {
        ControlCommand::AutoTrain { threshold, batch_size, dry_run, include_completions } => {
            let mut config = plane.config().auto_trainer.clone();
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            let trainer = AutoTrainer::new(config, plane.prompt_log()?, plane.training_gateway())
                .with_training_timeout(plane.config().training.timeout());
            if let Some(threshold) = threshold {
                trainer.set_threshold(threshold);
            }
            if dry_run {
                trainer.set_dry_run(true);
            }
            if include_completions {
                trainer.set_include_completions(true);
            }

            let session = trainer.run_cycle_with_cancel(&plane.shutdown_token()).await;
            print_json(&session)?;
        }
        ControlCommand::RecentTrain { limit, tag, user_id, since_minutes, no_dedup, min_tokens, dry_run } => {
            if dry_run && !RecentTrainer::SUPPORTS_DRY_RUN {
                anyhow::bail!("recent-train has no dry-run mode; it always trains when prompts qualify");
            }

            let mut config = plane.config().recent_trainer.clone();
            if let Some(limit) = limit {
                config.limit = limit;
            }
            if tag.is_some() {
                config.tag = tag;
            }
            if user_id.is_some() {
                config.user_id = user_id;
            }
            if since_minutes.is_some() {
                config.since_minutes = since_minutes;
            }
            if no_dedup {
                config.deduplicate = false;
            }
            if let Some(min_tokens) = min_tokens {
                config.min_tokens = min_tokens;
            }

            let trainer = RecentTrainer::new(
                config,
                plane.prompt_log()?,
                plane.training_gateway(),
                Arc::new(WhitespaceTokenCounter),
            )
            .with_training_timeout(plane.config().training.timeout());
            let report = trainer.run_cycle_with_cancel(&plane.shutdown_token()).await;
            print_json(&report)?;
        }
        ControlCommand::Train { file, format, dry_run, tags, source } => {
            let format = format.unwrap_or_else(|| FileFormat::infer(&file));
            let samples = load_training_file(&file, format)?;
            if samples.is_empty() {
                anyhow::bail!("No valid training texts found in {}", file.display());
            }

            let session_id = Uuid::new_v4().to_string();
            let counter = WhitespaceTokenCounter;
            let token_estimate: usize = samples.iter().map(|s| counter.count_tokens(s.prompt())).sum();
            info!(
                source = "cli",
                "[{}] Loaded {} prompts (estimated tokens: {})",
                session_id,
                samples.len(),
                token_estimate
            );

            let mut report = ManualTrainingReport {
                session_id,
                samples: samples.len(),
                token_estimate,
                dry_run,
                trained: false,
                tags,
                source,
                timestamp: Utc::now(),
                duration_secs: None,
                loss: None,
                output_path: None,
                error: None,
            };

            if !dry_run {
                let started = std::time::Instant::now();
                let gateway = plane.training_gateway();
                match crate::trainer::guarded_fine_tune(
                    gateway.as_ref(),
                    samples,
                    plane.config().training.timeout(),
                    &plane.shutdown_token(),
                )
                .await
                {
                    Ok(outcome) => {
                        report.trained = true;
                        report.loss = Some(outcome.loss);
                        report.output_path = Some(outcome.output_path);
                    }
                    Err(e) => {
                        error!(source = "cli", "[{}] Training error: {}", report.session_id, e);
                        report.error = Some(e.to_string());
                    }
                }
                report.duration_secs = Some(started.elapsed().as_secs_f64());
            }

            print_json(&report)?;
        }
        ControlCommand::LogPrompt { prompt, completion, tag, user_id, allow_duplicates } => {
            let log = plane.prompt_log()?;
            match log.log_prompt(&prompt, completion.as_deref(), user_id, tag.as_deref(), "cli", allow_duplicates)? {
                Some(entry) => print_json(&entry)?,
                None => print_json(&serde_json::json!({ "logged": false, "reason": "duplicate" }))?,
            }
        }
        ControlCommand::TopPrompts { limit, case_insensitive, tag, user_id, since_days } => {
            let log = plane.prompt_log()?;
            let query = UsageQuery {
                tag,
                user_id,
                since_days,
                case_insensitive,
                ..UsageQuery::top(limit)
            };
            let prompts = log
                .most_common_prompts(&query)
                .await
                .context("Failed to aggregate prompt usage")?;
            print_json(&prompts)?;
        }
        ControlCommand::Schedule { interval_secs } => {
            let mut config = plane.config().scheduler.clone();
            if let Some(interval_secs) = interval_secs {
                config.interval_secs = interval_secs;
            }
            if !config.enabled && interval_secs.is_none() {
                anyhow::bail!("Scheduler is disabled in configuration; pass --interval-secs to run it anyway");
            }

            let scheduler = crate::trainer::RetrainScheduler::new(
                config,
                Arc::new(plane.auto_trainer()?),
                plane.registry(),
            );
            let token = plane.shutdown_token();
            let interrupt = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!(source = "cli", "Interrupt received, stopping scheduler");
                    interrupt.cancel();
                }
            });

            scheduler.run(token).await;
            print_json(&scheduler.stats())?;
        }
    }

    Ok(())
}

fn config_command(path: &Path, show: bool, reset: bool) -> Result<()> {
    if reset {
        Config::default().save_to(path)?;
        println!("Configuration reset to defaults.");
        return Ok(());
    }

    if show {
        let config = Config::load_from(path)?;
        println!("# {}", path.display());
        print!("{}", toml::to_string_pretty(&config).context("Failed to render config")?);
    } else {
        println!("Config file: {}", path.display());
        println!("Data directory: {}", config::data_dir()?.display());
    }
    Ok(())
}

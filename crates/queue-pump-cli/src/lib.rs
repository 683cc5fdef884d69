//! # Queue-Pump CLI
//!
//! Operator commands for a queue described by queue-pump settings:
//! - running a pump with the demo handlers
//! - sending demo messages
//! - showing the resolved configuration
//! - listing dead-lettered records of a file queue

pub mod demo;

use clap::{Parser, Subcommand};
use queue_pump::backends::{FileQueue, QueueRecord};
use queue_pump::{BackendKind, QueueError, QueueSettings};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// queue-pump - run, feed and inspect a message queue
#[derive(Debug, Parser)]
#[command(name = "queue-pump")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run, feed and inspect a queue-pump message queue")]
pub struct Cli {
    /// Settings file (toml, yaml or json)
    #[arg(short, long, env = "QP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Receive messages with the demo handlers until interrupted
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(short, long)]
        duration: Option<u64>,

        /// Override pump.max_simultaneous_messages
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Send demo messages
    Send {
        /// Number of messages to send
        #[arg(short = 'n', long, default_value = "1")]
        count: u64,

        /// Make the demo handler fail for these messages
        #[arg(long)]
        fail: bool,
    },

    /// Show the resolved configuration
    Config {
        /// Output format
        #[arg(short, long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// List records in the dead-letter folder of a file queue
    DeadLetters {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Queue(QueueError::ConfigurationError(_) | QueueError::ValidationError(_)) => 1,
            Self::Queue(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Parse arguments, set up logging and run the selected command
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli)?;
    execute(cli).await
}

/// Run a parsed command line
pub async fn execute(cli: Cli) -> Result<(), CliError> {
    let settings = QueueSettings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            duration,
            concurrency,
        } => execute_run_command(settings, duration, concurrency).await,
        Commands::Send { count, fail } => execute_send_command(settings, count, fail).await,
        Commands::Config { format } => {
            println!("{}", render_settings(&settings, &format)?);
            Ok(())
        }
        Commands::DeadLetters { format } => {
            let records = dead_letter_records(&settings).await?;
            println!("{}", render_records(&records, &format)?);
            Ok(())
        }
    }
}

fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "queue_pump={level},queue_pump_cli={level}",
            level = cli.log_level
        ))
    });
    let registry = tracing_subscriber::registry().with(filter);

    let result = if cli.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| CliError::CommandFailed {
        message: format!("failed to initialize logging: {}", e),
    })
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn execute_run_command(
    mut settings: QueueSettings,
    duration: Option<u64>,
    concurrency: Option<usize>,
) -> Result<(), CliError> {
    if let Some(concurrency) = concurrency {
        settings.pump.max_simultaneous_messages = concurrency;
    }
    if settings.pump.max_simultaneous_messages == 0 {
        return Err(CliError::InvalidArgument {
            arg: "concurrency".to_string(),
            message: "set --concurrency or pump.max_simultaneous_messages".to_string(),
        });
    }

    let runtime = settings
        .to_builder()?
        .with_container(demo::container())
        .with_handlers(demo::registry())
        .build_startable()?;

    runtime.start_receiving().await?;
    info!(queue = runtime.queue_name(), "Receiving; press Ctrl-C to stop");

    match duration {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => tokio::signal::ctrl_c().await?,
    }

    if !runtime.stop_receiving().await {
        return Err(CliError::CommandFailed {
            message: "messages were still in flight at shutdown".to_string(),
        });
    }
    Ok(())
}

async fn execute_send_command(
    settings: QueueSettings,
    count: u64,
    fail: bool,
) -> Result<(), CliError> {
    let runtime = settings.to_builder()?.build_send_only()?;
    let sender = runtime.create_send_queue().await?;

    for id in 1..=count {
        sender.send(&demo::DemoMessage::new(id, fail)).await?;
    }

    info!(queue = runtime.queue_name(), count, "Sent demo messages");
    Ok(())
}

async fn dead_letter_records(settings: &QueueSettings) -> Result<Vec<QueueRecord>, CliError> {
    if settings.backend != BackendKind::File {
        return Err(CliError::InvalidArgument {
            arg: "backend".to_string(),
            message: "dead-letters is only available for the file backend".to_string(),
        });
    }
    settings.validate()?;

    let path = settings.file.path.clone().unwrap_or_default();
    let queue = FileQueue::new(path, settings.pump.retry_count);
    if !queue.dead_letter_folder().is_dir() {
        return Ok(Vec::new());
    }

    let mut records = queue.dead_letter_records().await?;
    records.sort_by_key(|r| r.sent_time);
    Ok(records)
}

fn render_settings(settings: &QueueSettings, format: &ConfigFormat) -> Result<String, CliError> {
    // Never print the secret itself
    let mut shown = settings.clone();
    if shown.sqs.secret_access_key.is_some() {
        shown.sqs.secret_access_key = Some("<REDACTED>".to_string());
    }

    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&shown).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::to_string_pretty(&shown).map_err(|e| e.to_string()),
    };
    rendered.map_err(|message| CliError::CommandFailed { message })
}

fn render_records(records: &[QueueRecord], format: &OutputFormat) -> Result<String, CliError> {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(records).map_err(|e| CliError::CommandFailed {
                message: e.to_string(),
            })
        }
        OutputFormat::Text if records.is_empty() => Ok("No dead-lettered records".to_string()),
        OutputFormat::Text => Ok(records
            .iter()
            .map(|r| {
                format!(
                    "{}  attempts={}  sent={}  {}",
                    r.id,
                    r.attempts,
                    r.sent_time,
                    preview(&r.body, 60)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

fn preview(body: &str, max_chars: usize) -> String {
    let mut chars = body.chars();
    let shown: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", shown)
    } else {
        shown
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

//! Engram CLI
//!
//! Thin command-line front-end over the memory-engine kernel. Every command
//! maps to a catalogue operation and prints the structured result; exit
//! codes distinguish usage errors from storage or embedder unavailability.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use clap::{Parser, Subcommand};
use colored::Colorize;
use engram_core::{
    EngineConfig, ErrorKind, EventInput, Kernel, Operation, ResultStatus, StructuredResult,
};

/// Exit code: success
const EXIT_OK: u8 = 0;
/// Exit code: usage error
const EXIT_USAGE: u8 = 2;
/// Exit code: storage unavailable
const EXIT_STORAGE: u8 = 10;
/// Exit code: embedder unavailable
const EXIT_EMBEDDER: u8 = 11;
/// Exit code: internal error
const EXIT_INTERNAL: u8 = 20;

/// Engram - local-first cognitive memory engine
#[derive(Parser)]
#[command(name = "engram")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the engram memory engine")]
struct Cli {
    /// Database file; defaults to the platform data directory
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Project partition to operate on
    #[arg(long, global = true, default_value = "default")]
    project: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest events from a JSON array on stdin or a file
    Ingest {
        /// Path to a JSON file; stdin when omitted
        file: Option<PathBuf>,
    },

    /// Run one catalogue operation with JSON parameters
    Query {
        /// Operation name (remember, recall, recall_events, ...)
        operation: String,
        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
    },

    /// Run a consolidation pass
    Consolidate {
        /// Window in hours ending now
        #[arg(long)]
        window_hours: Option<u64>,
        /// Strategy: balanced, speed, quality, minimal
        #[arg(long)]
        strategy: Option<String>,
    },

    /// Show quality summary and alerts
    Status,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::from(classify_error(&e))
        }
    }
}

fn classify_error(e: &anyhow::Error) -> u8 {
    if let Some(engine_error) = e.downcast_ref::<engram_core::Error>() {
        return match engine_error.kind {
            ErrorKind::Validation | ErrorKind::NotFound => EXIT_USAGE,
            ErrorKind::ResourceExhausted => EXIT_STORAGE,
            ErrorKind::Degraded => EXIT_EMBEDDER,
            _ => EXIT_INTERNAL,
        };
    }
    EXIT_INTERNAL
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_toml_file(path)?,
        None => EngineConfig::default(),
    };
    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.effective_worker_threads())
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let kernel = Kernel::builder(db_path).with_config(config).build()?;
        let ctx = kernel.context_for(&cli.project).await?;

        match cli.command {
            Commands::Ingest { file } => {
                let text = match file {
                    Some(path) => std::fs::read_to_string(path)?,
                    None => {
                        let mut buffer = String::new();
                        std::io::stdin().read_to_string(&mut buffer)?;
                        buffer
                    }
                };
                let events: Vec<EventInput> = serde_json::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("event parse error: {e}"))?;
                let result = kernel
                    .dispatch(&ctx, Operation::RecordEvents { events })
                    .await;
                print_result(&result)?;
                Ok(exit_for(&result))
            }

            Commands::Query { operation, params } => {
                let params: serde_json::Value = serde_json::from_str(&params)
                    .map_err(|e| anyhow::anyhow!("params parse error: {e}"))?;
                let op = Operation::parse(&operation, params)?;
                let result = kernel.dispatch(&ctx, op).await;
                print_result(&result)?;
                Ok(exit_for(&result))
            }

            Commands::Consolidate {
                window_hours,
                strategy,
            } => {
                let result = kernel
                    .dispatch(
                        &ctx,
                        Operation::Consolidate {
                            window_hours,
                            strategy,
                        },
                    )
                    .await;
                print_result(&result)?;
                Ok(exit_for(&result))
            }

            Commands::Status => {
                kernel.meta().sample(&ctx).await?;
                let summary = kernel.dispatch(&ctx, Operation::QualitySummary {}).await;
                let alerts = kernel.dispatch(&ctx, Operation::Alerts {}).await;

                println!("{}", "=== Engram Status ===".cyan().bold());
                println!("{}", serde_json::to_string_pretty(&summary.data)?);
                if let Some(list) = alerts.data.as_array() {
                    if list.is_empty() {
                        println!("{}", "no active alerts".green());
                    } else {
                        println!("{}", "alerts:".yellow().bold());
                        for alert in list {
                            println!("  {}", serde_json::to_string(alert)?);
                        }
                    }
                }
                Ok(EXIT_OK)
            }
        }
    })
}

fn print_result(result: &StructuredResult) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

fn exit_for(result: &StructuredResult) -> u8 {
    match result.status {
        ResultStatus::Ok | ResultStatus::Warn => EXIT_OK,
        ResultStatus::Error => match result.error.as_ref().map(|e| e.kind) {
            Some(ErrorKind::Validation) | Some(ErrorKind::NotFound) => EXIT_USAGE,
            Some(ErrorKind::ResourceExhausted) => EXIT_STORAGE,
            Some(ErrorKind::Degraded) => EXIT_EMBEDDER,
            _ => EXIT_INTERNAL,
        },
    }
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "engram", "engram")
        .ok_or_else(|| anyhow::anyhow!("could not determine data directory"))?;
    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;
    Ok(data_dir.join("engram.db"))
}

// ============================================================================
// TESTS
// ============================================================================

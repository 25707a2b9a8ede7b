mod batch;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{ConfigOverrides, WorkerConfig};
use recon_core::{ProcessingIdType, ProcessingRequest, StreamEvent};
use recon_engine::Reconciler;
use recon_storage::{ReconStore, RECON_SCHEMA_VERSION};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "recon-worker")]
#[command(about = "Delivery reconciliation worker", long_about = None)]
struct Cli {
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(flatten)]
    overrides: ConfigOverrides,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply schema migrations to the store
    Migrate,
    /// Process a stream event from a file or stdin
    Process {
        #[arg(long)]
        event: Option<PathBuf>,
    },
    /// Reconcile one line item or import batch
    Reconcile {
        #[arg(long, conflicts_with = "import_id", required_unless_present = "import_id")]
        li_code: Option<String>,
        #[arg(long)]
        import_id: Option<String>,
        /// Print the deleted and inserted rows as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = WorkerConfig::load(&cli.overrides).context("failed to load configuration")?;
    let store = ReconStore::open(&config.store)
        .with_context(|| format!("failed to open store {}", config.store.path.display()))?;

    match cli.command {
        Commands::Migrate => {
            info!(
                event = "store_migrated",
                path = %config.store.path.display(),
                schema_version = RECON_SCHEMA_VERSION
            );
            println!("Schema at version {RECON_SCHEMA_VERSION}.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Process { event } => {
            let raw = read_event(event.as_ref())?;
            let event = StreamEvent::parse_json(&raw).context("failed to parse stream event")?;
            let reconciler = Reconciler::new(store, config.engine);
            let report = batch::process_event(&reconciler, &event, config.failure_policy);
            println!("{}", report.status_line());
            Ok(if report.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Reconcile {
            li_code,
            import_id,
            json,
        } => {
            let request = match (li_code, import_id) {
                (Some(li_code), _) => ProcessingRequest::new(ProcessingIdType::LiCode, li_code),
                (None, Some(import_id)) => ProcessingRequest::new(ProcessingIdType::ImportId, import_id),
                (None, None) => anyhow::bail!("either --li-code or --import-id is required"),
            };
            let reconciler = Reconciler::new(store, config.engine);
            let report = reconciler
                .reconcile_request(&request)
                .with_context(|| format!("failed to reconcile {}", request.processing_id))?;
            if json {
                let rendered = serde_json::to_string_pretty(&report.outcome)
                    .context("failed to render reconcile outcome")?;
                println!("{rendered}");
            } else {
                println!(
                    "Reconciled {}: {} deleted, {} inserted ({} attempts).",
                    report.scope,
                    report.deleted(),
                    report.inserted(),
                    report.attempts
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_event(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read event {}", path.display())),
        None => {
            let mut raw = String::new();
            io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read event from stdin")?;
            Ok(raw)
        }
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("RECON_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = if debug {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("log_init_error: subscriber already set");
    }
}

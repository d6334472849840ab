//! spendcat-worker - chunked procurement classification worker
//!
//! `run` ticks periodically until Ctrl-C / SIGTERM; `tick` runs exactly one
//! tick for host-timer invocations; `purge-expired` applies retention;
//! `classify` runs one description through the decision engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spendcat_common::events::EventBus;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spendcat_worker::classify::{DecisionEngine, ResourceRegistry};
use spendcat_worker::config::WorkerConfig;
use spendcat_worker::llm::{AzureOpenAiClassifier, DisabledClassifier, LlmClassifier, LlmContext};
use spendcat_worker::store::JobStore;
use spendcat_worker::workflow::Scheduler;

/// Command-line arguments for spendcat-worker
#[derive(Parser, Debug)]
#[command(name = "spendcat-worker")]
#[command(about = "Chunked procurement classification worker")]
#[command(version)]
struct Cli {
    /// Config file (default: discovered spendcat.toml)
    #[arg(short, long, env = "SPENDCAT_CONFIG")]
    config: Option<PathBuf>,

    /// Job store root folder
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Per-sector dictionary and model artifacts
    #[arg(short, long)]
    models_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Tick periodically until interrupted
    Run,
    /// Run a single tick and exit
    Tick,
    /// Delete terminal jobs past the retention window
    PurgeExpired,
    /// Classify one description through the full cascade and print the outcome
    Classify {
        /// Sector selecting dictionary and model
        #[arg(short, long)]
        sector: String,

        description: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = WorkerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config)?;

    info!("Starting spendcat-worker {}", env!("CARGO_PKG_VERSION"));

    let root_folder = config.resolve_root_folder(cli.root_folder.as_deref());
    let models_dir = config.resolve_models_dir(cli.models_dir.as_deref(), &root_folder);
    info!(root_folder = %root_folder.display(), models_dir = %models_dir.display(), "Folders resolved");

    let store = JobStore::open(&root_folder)
        .with_context(|| format!("Failed to open job store at {}", root_folder.display()))?;

    let llm: Arc<dyn LlmClassifier> = if config.llm.is_configured() {
        let client = AzureOpenAiClassifier::new(&config.llm).context("Failed to build LLM client")?;
        info!(deployment = %config.llm.deployment, "LLM classification enabled");
        Arc::new(client)
    } else {
        warn!("LLM endpoint or API key missing; unresolved rows stay Unmatched");
        Arc::new(DisabledClassifier)
    };

    let registry = Arc::new(ResourceRegistry::new(models_dir));
    let scheduler = Scheduler::new(
        store,
        config.scheduler.clone(),
        config.classification.clone(),
        Arc::clone(&registry),
        Arc::clone(&llm),
        EventBus::new(256),
    );

    match cli.command {
        Command::Run => {
            let cancel = CancellationToken::new();
            let stopper = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                stopper.cancel();
            });
            scheduler.run(cancel).await;
            info!("Worker shutdown complete");
        }
        Command::Tick => {
            let report = scheduler.run_tick().await.context("Tick failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::PurgeExpired => {
            let removed = scheduler.purge_expired().context("Retention sweep failed")?;
            info!(removed, "Expired jobs removed");
        }
        Command::Classify { sector, description } => {
            let engine = DecisionEngine::new(config.classification.clone(), registry.get(&sector));
            let context = LlmContext {
                sector,
                ..LlmContext::default()
            };
            let outcome = engine
                .classify(&description, llm.as_ref(), &context)
                .await
                .context("Classification failed")?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise the configured level for our crates
fn init_tracing(config: &WorkerConfig) -> Result<()> {
    let level = &config.logging.level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("spendcat_worker={level},spendcat_common={level}").into()
    });

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };
    let stderr_layer = config
        .logging
        .file
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

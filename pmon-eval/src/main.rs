//! pmon-eval - Pollen monitor sample evaluation service
//!
//! Batch/polling pipeline: discovers newly arrived samples, drives every
//! image region through the external detection and classification
//! capabilities, survives interruption via checkpoints, applies the dynamic
//! threshold pass and emits the analysis artifacts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pmon_common::config::EvalConfig;
use pmon_common::ledger::FileLedger;
use pmon_eval::capability::{ProcessClassifier, ProcessDetector};
use pmon_eval::services::unpacker::CommandArchiver;
use pmon_eval::EvalApp;

/// Command-line arguments for pmon-eval
#[derive(Parser, Debug)]
#[command(name = "pmon-eval")]
#[command(about = "Pollen monitor sample evaluation service")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config/pmon.toml", env = "PMON_CONFIG")]
    config: PathBuf,

    /// Completed-sample ledger file
    #[arg(long, default_value = "evaluated_samples.txt", env = "PMON_LEDGER")]
    ledger: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pmon_eval=debug,pmon_common=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting pmon-eval");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Configuration errors are fatal: no partial start.
    let config = EvalConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    info!("Input dir: {}", config.main.path_samples_in.display());
    info!("Output dir: {}", config.main.path_eval_out.display());

    let detector = Arc::new(
        ProcessDetector::new(&config.detector).context("failed to initialize detector")?,
    );
    let classifier = Arc::new(
        ProcessClassifier::new(&config.classifier).context("failed to initialize classifier")?,
    );

    let ledger = FileLedger::open(&args.ledger).context("failed to open ledger")?;

    let mut app = EvalApp::new(
        config,
        detector,
        classifier,
        Box::new(ledger),
        Box::new(CommandArchiver::new()),
    )
    .context("failed to initialize evaluation service")?;

    tokio::select! {
        result = app.run() => {
            result.context("evaluation loop failed")?;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown requested; open samples resume from checkpoints on restart");
        }
    }

    Ok(())
}

//! # Revloop — review-request automation for service businesses
//!
//! External events (paid invoice, completed job, new customer) trigger
//! message sequences that send email/SMS review requests on a schedule,
//! guarded by quiet hours, rate limits, and per-customer cooldowns.
//!
//! Usage:
//!   revloop serve                # gateway + in-process executor loop
//!   revloop serve --port 9000    # custom port
//!   revloop tick                 # run one executor pass and exit
//!   revloop init                 # write a default config file

use anyhow::Result;
use clap::{Parser, Subcommand};
use revloop_core::RevloopConfig;
use revloop_db::Store;
use revloop_engine::Telemetry;
use revloop_gateway::AppState;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "revloop",
    version,
    about = "📣 Revloop — review-request automation engine"
)]
struct Cli {
    /// Path to config.toml (default: ~/.revloop/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway plus the in-process executor loop
    Serve {
        /// Override the configured gateway port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one executor pass and print the summary
    Tick,
    /// Write a default config file and exit
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "revloop=debug,tower_http=debug"
    } else {
        "revloop=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            let expanded = shellexpand::tilde(path).to_string();
            RevloopConfig::load_from(std::path::Path::new(&expanded))?
        }
        None => RevloopConfig::load()?,
    };

    match cli.command {
        Command::Init => {
            RevloopConfig::default().save()?;
            println!(
                "✅ Wrote default config to {}",
                RevloopConfig::default_path().display()
            );
            Ok(())
        }
        Command::Serve { port } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            serve(config).await
        }
        Command::Tick => tick(config).await,
    }
}

fn open_store(config: &RevloopConfig) -> Result<Store> {
    let path = shellexpand::tilde(&config.database.path).to_string();
    if let Some(parent) = std::path::Path::new(&path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Store::open(std::path::Path::new(&path))?)
}

async fn serve(config: RevloopConfig) -> Result<()> {
    let store = Arc::new(tokio::sync::Mutex::new(open_store(&config)?));
    let outbound: Arc<dyn revloop_core::Outbound> =
        Arc::new(revloop_channels::Delivery::from_config(&config.channel));
    let telemetry = Telemetry::new(&config.telemetry);

    let state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        outbound: outbound.clone(),
        telemetry: telemetry.clone(),
        start_time: std::time::Instant::now(),
    });

    // In-process executor loop — the same pass the external /_cron surface
    // runs, so deployments without an outside scheduler still deliver.
    let exec_cfg = config.executor.clone();
    let exec_store = store.clone();
    let exec_outbound = outbound.clone();
    let exec_telemetry = telemetry.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(exec_cfg.interval_secs));
        loop {
            interval.tick().await;
            let result = {
                let store = exec_store.lock().await;
                revloop_engine::executor::run_pass(
                    &store,
                    exec_outbound.as_ref(),
                    &exec_cfg,
                    &exec_telemetry,
                    chrono::Utc::now(),
                )
                .await
            };
            match result {
                Ok(summary) if summary.processed > 0 => {
                    tracing::info!(
                        "Pass done: {} sent, {} failed, {} rescheduled",
                        summary.sent,
                        summary.failed,
                        summary.rescheduled
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Executor pass failed: {e}"),
            }
        }
    });
    tracing::info!(
        "⏰ Executor loop started (every {}s)",
        config.executor.interval_secs
    );

    revloop_gateway::start(state).await?;
    Ok(())
}

async fn tick(config: RevloopConfig) -> Result<()> {
    let store = open_store(&config)?;
    let outbound = revloop_channels::Delivery::from_config(&config.channel);
    let telemetry = Telemetry::new(&config.telemetry);
    let summary = revloop_engine::executor::run_pass(
        &store,
        &outbound,
        &config.executor,
        &telemetry,
        chrono::Utc::now(),
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

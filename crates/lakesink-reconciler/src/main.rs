//! lakesink reconciler entry point.
//!
//! Runs one reconcile loop per configured sink against a shared broker
//! watcher and a shared realtime cache, until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lakesink_kafka::{KafkaWatcher, Watcher};
use lakesink_reconciler::{
    FileStatusStore, LogOnlyDeployer, RealtimeCalculator, ReconcilerConfig, SinkGroupReconciler,
};

#[derive(Parser)]
#[command(
    name = "lakesink-reconciler",
    about = "Supervises lakesink sink groups and promotes reloaded topics"
)]
struct Cli {
    /// Path to the reconciler config file.
    #[arg(long)]
    config: PathBuf,

    /// Log verbosity: 0=warn, 1=info, 2=debug, 3+=trace.
    #[arg(short = 'v', long = "verbosity", default_value_t = 1)]
    verbosity: u8,
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    if let Err(e) = run(&cli).await {
        error!(error = %format!("{e:#}"), "reconciler exiting with error");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = ReconcilerConfig::load(&cli.config).context("loading config")?;
    info!("starting the lakesink reconciler");

    std::fs::create_dir_all(&config.status_dir).context("creating status directory")?;
    let watcher: Arc<dyn Watcher> = Arc::new(KafkaWatcher::new(&config.kafka.brokers));
    let cache = Arc::new(DashMap::new());
    let topic_regexes = Arc::new(DashMap::new());

    let ctx = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for spec in &config.sinks {
        let status_store = Arc::new(FileStatusStore::new(config.status_path(spec)));
        let reconciler = Arc::new(SinkGroupReconciler::new(
            spec.clone(),
            Arc::clone(&watcher),
            RealtimeCalculator::new(Arc::clone(&watcher), Arc::clone(&cache)),
            Arc::new(LogOnlyDeployer),
            status_store,
            Arc::clone(&topic_regexes),
        ));
        let run_ctx = ctx.clone();
        tasks.spawn(async move { reconciler.run(run_ctx).await });
        info!(sink = %spec.name, "reconciler loop started");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("signal received, stopping reconcilers");
    ctx.cancel();
    while tasks.join_next().await.is_some() {}

    info!("goodbye");
    Ok(())
}

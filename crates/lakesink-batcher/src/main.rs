//! lakesink batcher entry point.
//!
//! Builds the shared clients (object store, signal producer, schema
//! registry), then one topic manager + consumer group per configured
//! group, and runs them until SIGINT/SIGTERM.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lakesink_batcher::{
    AvroSchemaResolver, BatcherConfig, BatchProcessorFactory, ClaimDispatcher,
    JsonEnvelopeDecoder, MaskRules, MaskSettings, StorageSink,
};
use lakesink_kafka::{
    AvroProducer, ConsumerGroup, HttpSchemaRegistry, KafkaConsumerGroup, KafkaRecordProducer,
    KafkaWatcher, RecordProducer, SchemaRegistry, TopicManager, Watcher,
};

#[derive(Parser)]
#[command(
    name = "lakesink-batcher",
    about = "Batches CDC events, stages them in the object store, and signals the loader"
)]
struct Cli {
    /// Path to the batcher config file.
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
        error!(error = %format!("{e:#}"), "batcher exiting with error");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = BatcherConfig::load(&cli.config).context("loading config")?;
    info!("starting the lakesink batcher");

    let watcher: Arc<dyn Watcher> = Arc::new(KafkaWatcher::new(&config.kafka.brokers));
    let registry: Arc<dyn SchemaRegistry> =
        Arc::new(HttpSchemaRegistry::new(&config.schema_registry_url));
    let resolver = Arc::new(AvroSchemaResolver::new(Arc::clone(&registry)));
    let sink = Arc::new(StorageSink::new_s3(&config.store).context("building object store")?);
    let producer: Arc<dyn RecordProducer> = Arc::new(
        KafkaRecordProducer::new(&config.kafka.brokers).context("building signal producer")?,
    );
    let signaler = Arc::new(AvroProducer::new(producer));

    let mask_rules = match (config.mask.enabled, &config.mask.rules_file) {
        (true, Some(path)) => Some(
            MaskRules::load(std::path::Path::new(path)).context("loading mask rules")?,
        ),
        _ => None,
    };

    let ctx = CancellationToken::new();
    let mut consumer_groups: HashMap<String, Arc<dyn ConsumerGroup>> = HashMap::new();
    let mut ready_rxs = Vec::new();
    let mut tasks = JoinSet::new();

    for group_config in &config.consumer_groups {
        let mask = mask_rules.as_ref().map(|rules| MaskSettings {
            salt: config.mask.salt.clone(),
            file_version: config.mask.file_version.clone(),
            rules: rules.clone(),
        });
        let factory = Arc::new(BatchProcessorFactory::new(
            &group_config.group_id,
            &config.loader_topic_prefix,
            &config.store.bucket_dir,
            group_config.auto_commit,
            config.max_concurrency,
            mask,
            Arc::clone(&sink),
            Arc::clone(&signaler),
            Arc::clone(&registry),
            resolver.clone(),
        ));
        let (dispatcher, ready_rx) = ClaimDispatcher::new(
            factory,
            group_config.max_size,
            Duration::from_secs(group_config.max_wait_seconds),
        );
        let group: Arc<dyn ConsumerGroup> = Arc::new(KafkaConsumerGroup::new(
            &config.kafka.brokers,
            &group_config.group_id,
            Arc::new(dispatcher),
            Arc::new(JsonEnvelopeDecoder),
            group_config.auto_commit,
        ));
        consumer_groups.insert(group_config.group_id.clone(), Arc::clone(&group));
        ready_rxs.push((group_config.group_id.clone(), ready_rx));

        let manager = Arc::new(
            TopicManager::new(group, Arc::clone(&watcher), &group_config.topic_regexes)
                .context("compiling topic regexes")?,
        );
        manager
            .refresh_topics()
            .await
            .context("initial topic discovery")?;

        let sync_manager = Arc::clone(&manager);
        let sync_ctx = ctx.clone();
        let period = Duration::from_secs(config.topic_refresh_seconds);
        tasks.spawn(async move { sync_manager.sync_topics(sync_ctx, period).await });

        let consume_ctx = ctx.clone();
        tasks.spawn(async move { manager.consume(consume_ctx).await });
        info!(group = %group_config.group_id, "consumer group started");
    }

    tokio::spawn(async move {
        for (group_id, mut ready_rx) in ready_rxs {
            if ready_rx.wait_for(|ready| *ready).await.is_ok() {
                info!(group = %group_id, "consumer group session up");
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("signal received, cancelling context for graceful shutdown");
    ctx.cancel();
    while tasks.join_next().await.is_some() {}

    let mut close_failed = false;
    for (group_id, group) in consumer_groups {
        info!(group = %group_id, "closing consumer group");
        if let Err(e) = group.close().await {
            error!(group = %group_id, error = %e, "closing consumer group failed");
            close_failed = true;
        }
    }
    if close_failed {
        anyhow::bail!("one or more consumer groups failed to close");
    }

    info!("goodbye");
    Ok(())
}

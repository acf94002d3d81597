use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_worker::{
    config::{Config, DEFAULT_CONFIG_FILE},
    services::{
        DiscoveryLoop, FfmpegLauncher, HttpStatsClient, PipelineBuilder, StatsAggregator, StatsPusher,
        StatusReporter, ffmpeg_wrapper::probe_version, stats_aggregator::NoSubscribers,
    },
    utils::TolerantHttpClient,
};

#[derive(Parser)]
#[command(name = "relay-worker")]
#[command(version)]
#[command(about = "Watches live streams and supervises ffmpeg relay and packaging pipelines")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONFIG_FILE", default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Run a single discovery tick, then shut everything down
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("relay_worker={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting relay worker v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);
    config.validate()?;
    config.check_ffmpeg()?;
    config.ensure_directories()?;

    match probe_version(&config.ffmpeg_path).await {
        Some(version) => info!("Using {}", version),
        None => warn!("Could not determine ffmpeg version at {}", config.ffmpeg_path.display()),
    }

    let http = TolerantHttpClient::new(config.supervisor.http_timeout)?;
    let launcher = Arc::new(FfmpegLauncher::new(config.ffmpeg_path.clone()));
    let builder = Arc::new(PipelineBuilder::from_config(&config, launcher));
    let source = Arc::new(HttpStatsClient::new(http.clone()));
    let mut discovery = DiscoveryLoop::from_config(&config, source, builder);

    if cli.once {
        let summary = discovery.tick().await;
        info!("Single tick: {:?}", summary);
        discovery.shutdown_all().await;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let reader = discovery.reader();

    let reporter = StatusReporter::new(reader.clone(), config.supervisor.status_interval);
    let reporter_task = tokio::spawn(reporter.run(shutdown.clone()));

    let pusher_task = config.stats_push.clone().map(|push| {
        let aggregator = StatsAggregator::new(reader.clone(), Arc::new(NoSubscribers));
        let pusher = StatsPusher::new(aggregator, http.clone(), push);
        tokio::spawn(pusher.run(shutdown.clone()))
    });

    let discovery_task = tokio::spawn(discovery.run(shutdown.clone()));
    info!("worker_running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested, stopping channels");
    shutdown.cancel();

    if let Err(e) = discovery_task.await {
        error!("Discovery loop ended abnormally: {}", e);
    }
    let _ = reporter_task.await;
    if let Some(task) = pusher_task {
        let _ = task.await;
    }

    info!("Relay worker stopped");
    Ok(())
}

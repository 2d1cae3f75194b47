//! rivven-fanout - Route PostgreSQL change events to many subscribers
//!
//! # Usage
//!
//! ```bash
//! # Stream and route until interrupted (or until the end position)
//! rivven-fanout -c fanout.yaml
//!
//! # Validate configuration
//! rivven-fanout -c fanout.yaml validate
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rivven_fanout::{
    Bridge, BridgeHandle, ChangeRouter, FanoutConfig, LogSubscriberFactory, SubscriberDescriptor,
    SubscriberRegistry,
};
use rivven_walstream::PgConnector;

#[derive(Parser)]
#[command(name = "rivven-fanout")]
#[command(version, about = "Route PostgreSQL logical replication events to subscribers")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "fanout.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream and route changes (default)
    Run,
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = FanoutConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate_config(&config),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn validate_config(config: &FanoutConfig) -> Result<()> {
    println!("Configuration is valid");
    println!(
        "  source: {}:{}/{} slot {}",
        config.source.host, config.source.port, config.source.database, config.source.slot
    );
    println!("  subscribers: {}", config.subscribers.len());
    for subscriber in &config.subscribers {
        let public = SubscriberDescriptor {
            password: None,
            ..subscriber.clone()
        };
        println!(
            "    [{}] {}",
            subscriber.id,
            public.connection_uri(&config.router.scheme)
        );
    }
    Ok(())
}

async fn run(config: FanoutConfig) -> Result<()> {
    info!("Starting rivven-fanout");

    let registry = Arc::new(SubscriberRegistry::new());
    let factory = LogSubscriberFactory::new(config.router.scheme.clone());
    for descriptor in &config.subscribers {
        registry
            .connect(descriptor, &factory)
            .await
            .with_context(|| format!("Failed to connect subscriber {}", descriptor.id))?;
    }

    let router = Arc::new(ChangeRouter::with_locking(
        registry,
        config.router.locking,
    ));
    let stats = router.stats();

    let bridge = Bridge::start(
        PgConnector::new(config.source.clone()),
        config.source,
        router,
    )
    .await
    .context("Failed to start replication")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }
        _ = wait_finished(&bridge) => {
            info!("Replication stream ended");
        }
    }

    let report = tokio::task::spawn_blocking(move || bridge.shutdown())
        .await
        .context("Shutdown task failed")??;

    info!(
        sessions = report.sessions_started,
        failed_connects = report.failed_connects,
        events = stats.events_received(),
        dispatched = stats.mutations_dispatched(),
        skipped = stats.subscribers_skipped(),
        "rivven-fanout stopped"
    );
    Ok(())
}

async fn wait_finished(bridge: &BridgeHandle) {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    while !bridge.is_finished() {
        interval.tick().await;
    }
}

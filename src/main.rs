use clap::Parser;
use connpool::config::{Config, LoggingConfig};
use connpool::{ConnPoolError, ConnectionManager, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "connpool")]
#[command(about = "Keep pooled TCP connections to storage nodes warm and report pool health", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// How often each address is probed (milliseconds)
    #[arg(long, default_value_t = 5000)]
    probe_interval_ms: u64,

    /// Node addresses (host:port) to pool connections for
    #[arg(value_name = "ADDR")]
    addresses: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging)?;

    info!("connpool v{} starting", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Loaded configuration from: {:?}", path),
        None => info!("No configuration file specified, using defaults"),
    }

    if args.addresses.is_empty() {
        warn!("No addresses given, nothing to probe");
    }

    let manager = Arc::new(ConnectionManager::new(config.pool.clone())?);
    manager.start();

    let probe_interval = Duration::from_millis(args.probe_interval_ms.max(1));
    let probes = tokio::spawn(run_probes(
        Arc::clone(&manager),
        args.addresses,
        probe_interval,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");

    probes.abort();
    manager.stop().await;
    let drained = manager.drain().await;
    info!(drained, "Closed idle connections");

    let stats = manager.stats().await;
    let report = serde_json::to_string_pretty(&stats)
        .map_err(|e| ConnPoolError::Config(format!("Failed to encode stats: {}", e)))?;
    println!("{}", report);

    Ok(())
}

/// Acquire and release one connection per address on every tick.
async fn run_probes(manager: Arc<ConnectionManager>, addresses: Vec<String>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let rounds = addresses.iter().map(|address| {
            let manager = Arc::clone(&manager);
            async move {
                match manager.acquire(address).await {
                    Ok(conn) => {
                        info!(address = %address, id = conn.id(), reused = conn.reuse_count(), "Probe succeeded");
                        manager.release(conn, false).await;
                    }
                    Err(e) => warn!(address = %address, error = %e, "Probe failed"),
                }
            }
        });
        futures::future::join_all(rounds).await;

        let stats = manager.stats().await;
        info!(
            pools = stats.pools,
            total_idle = stats.total_idle,
            "Pool status"
        );
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&logging.level)
        .map_err(|e| ConnPoolError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Ok(())
}

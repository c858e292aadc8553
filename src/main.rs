use clap::Parser;
use meshpool::config::Config;
use meshpool::pool::{ConnectionInfo, PoolMetrics};
use meshpool::registry::{create_example_registry, load_registry, RegistryWatcher};
use meshpool::{CallContext, ConnectionManager, PoolError, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "meshpool")]
#[command(about = "Registry-driven RPC connection pool", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Static registry file (overrides config)
    #[arg(short, long, value_name = "FILE")]
    registry: Option<PathBuf>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Generate example registry file
    #[arg(long, value_name = "FILE")]
    generate_registry: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(long)]
    log_level: Option<String>,

    /// Resolve a call, e.g. `nova:com.example.order.OrderService.get` (repeatable)
    #[arg(long, value_name = "PROTO:SERVICE.METHOD")]
    lookup: Vec<String>,

    /// Domain passed along with --lookup
    #[arg(long, default_value = "")]
    domain: String,

    /// Keep pools running until Ctrl+C
    #[arg(long)]
    serve: bool,

    /// Seconds between pool stats reports while serving
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        return Ok(());
    }
    if let Some(registry_path) = args.generate_registry {
        println!("Generating example registry file: {:?}", registry_path);
        create_example_registry(&registry_path)?;
        println!("Example registry file created successfully!");
        return Ok(());
    }

    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format)?;

    info!("meshpool v{} starting", env!("CARGO_PKG_VERSION"));
    if let Some(config_path) = &args.config {
        info!("Configuration loaded from: {:?}", config_path);
    } else {
        info!("No configuration file specified, using defaults");
    }

    let watch = config.registry.watch;
    let registry_path = args
        .registry
        .clone()
        .or_else(|| config.registry.file.as_ref().map(PathBuf::from));

    let manager = ConnectionManager::builder(config).build()?;

    let mut watcher = None;
    if let Some(path) = registry_path {
        let registry = load_registry(&path)?;
        for event in registry.events() {
            let app = event.app_name().to_string();
            if let Err(e) = manager.apply(event).await {
                error!(app = %app, error = %e, "Failed to apply registry entry");
            }
        }

        if watch {
            let (tx, rx) = mpsc::unbounded_channel();
            manager.spawn_event_loop(rx);
            let mut registry_watcher = RegistryWatcher::new(path, registry, tx);
            registry_watcher.start().await?;
            watcher = Some(registry_watcher);
        }
    } else {
        warn!("No registry file configured, pools start empty");
    }

    for target in &args.lookup {
        if let Err(e) = run_lookup(&manager, target, &args.domain).await {
            error!(lookup = %target, error = %e, "Lookup failed");
            println!("null");
        }
    }

    if args.serve {
        serve(&manager, Duration::from_secs(args.stats_interval.max(1))).await;
    } else if args.lookup.is_empty() {
        print_json(&manager.stats().await)?;
    }

    if let Some(mut registry_watcher) = watcher {
        registry_watcher.stop();
    }
    manager.shutdown().await;
    Ok(())
}

/// Split `proto:service.method` at the first colon and the last dot.
fn parse_target(target: &str) -> Result<(&str, &str, &str)> {
    let invalid = || PoolError::Config(format!("Invalid lookup target: {}", target));
    let (protocol, rest) = target.split_once(':').ok_or_else(invalid)?;
    let (service, method) = rest.rsplit_once('.').ok_or_else(invalid)?;
    if protocol.is_empty() || service.is_empty() || method.is_empty() {
        return Err(invalid());
    }
    Ok((protocol, service, method))
}

async fn run_lookup(manager: &ConnectionManager, target: &str, domain: &str) -> Result<()> {
    let (protocol, service, method) = parse_target(target)?;
    let mut ctx = CallContext::new();

    match manager
        .lookup(protocol, domain, service, method, &mut ctx)
        .await?
    {
        Some(connection) => print_json(&ConnectionInfo::from(connection.as_ref())),
        None => {
            warn!(lookup = target, "No connection available");
            println!("null");
            Ok(())
        }
    }
}

async fn serve(manager: &ConnectionManager, stats_interval: Duration) {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(stats_interval);

    info!("Serving, press Ctrl+C to stop");
    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
            _ = ticker.tick() => {
                for stats in manager.stats().await {
                    info!(
                        app = %stats.app_name,
                        active = stats.active,
                        pending = stats.pending,
                        endpoints = stats.endpoints.len(),
                        "Pool stats"
                    );
                }
                let exported = PoolMetrics::gather();
                if !exported.is_empty() {
                    debug!(metrics = %exported, "Metrics snapshot");
                }
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| PoolError::Config(format!("Failed to render output: {}", e)))?;
    println!("{}", rendered);
    Ok(())
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| PoolError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    Ok(())
}

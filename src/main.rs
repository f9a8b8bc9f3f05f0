//! Pipeline relay stage - main entry point
//!
//! Relays every message from the input topic to the output topic with the
//! stage label prepended, until SIGINT or SIGTERM.

use clap::{Parser, Subcommand};
use pipeline_relay::config::RelayConfig;
use pipeline_relay::observability::{init_logging, metrics, HealthServer, LoggingConfig};
use pipeline_relay::relay;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["relay.toml", "config/relay.toml"];

/// MQTT pipeline relay stage
#[derive(Parser)]
#[command(name = "pipeline-relay")]
#[command(about = "Subscribe to an MQTT topic, label each payload and republish it")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay stage (default)
    Run,
    /// Validate configuration
    Config {
        /// Show the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    match cli.verbose {
        0 => {}
        1 => logging.level = Level::DEBUG,
        _ => logging.level = Level::TRACE,
    }
    init_logging(&logging);

    info!("Starting pipeline relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("pipeline-relay: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_relay(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<RelayConfig, pipeline_relay::config::ConfigError> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return RelayConfig::load(Some(path));
    }

    let found = DEFAULT_CONFIG_PATHS
        .iter()
        .map(Path::new)
        .find(|path| path.exists());
    match found {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            RelayConfig::load(Some(path))
        }
        None => {
            info!("No configuration file found, using defaults and environment");
            RelayConfig::load(None)
        }
    }
}

async fn run_relay(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    let collector = metrics();
    collector.set_relay_state("initializing");

    let mut stage = relay::mqtt_stage(&config, relay::default_transform(&config))?;

    info!(
        client_id = %config.broker.client_id,
        broker = %config.broker_url()?,
        input = %config.topics.input,
        output = %config.topics.output,
        "Relay stage configured"
    );

    let (health_stop_tx, health_stop_rx) = oneshot::channel::<()>();
    let health_task = match config.relay.health_port {
        Some(port) => {
            let server = Arc::new(HealthServer::new(
                config.broker.client_id.clone(),
                port,
                stage.state_receiver(),
            ));
            let (_, serve) = server.bind(async move {
                let _ = health_stop_rx.await;
            })?;
            Some(tokio::spawn(serve))
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        let _ = shutdown_tx.send(true);
        // Keep the sender alive; dropping it would also read as shutdown
        std::future::pending::<()>().await;
    });

    let result = stage.run(shutdown_rx).await;

    let _ = health_stop_tx.send(());
    if let Some(task) = health_task {
        if let Err(e) = task.await {
            warn!("Health server task failed: {}", e);
        }
    }

    match result {
        Ok(stats) => {
            info!(
                received = stats.received,
                published = stats.published,
                decode_failures = stats.decode_failures,
                publish_failures = stats.publish_failures,
                reconnects = stats.reconnects,
                "Relay stage finished"
            );
            Ok(())
        }
        Err(e) => {
            collector.set_relay_state("error");
            Err(e.into())
        }
    }
}

fn handle_config_command(
    config: &RelayConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Resolved relay configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

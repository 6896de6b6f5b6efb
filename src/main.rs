//! Support Mesh - Main Entry Point
//!
//! Runs a mesh node hosting the configured stages, or validates and prints
//! the resolved configuration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use support_mesh::config::MeshConfig;
use support_mesh::gateway::SessionRegistry;
use support_mesh::lifecycle_span;
use support_mesh::node::{Collaborators, MeshNode};
use support_mesh::observability::{health::HealthServer, init_default_logging, metrics::metrics};
use support_mesh::services::audit::SqliteAuditStore;
use support_mesh::transport::MqttTransport;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, Instrument};

/// Customer-support actor mesh over MQTT
#[derive(Parser)]
#[command(name = "support-mesh")]
#[command(about = "Actor choreography mesh for customer-support conversations")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mesh node
    Run {
        /// Also forward delivery records to sessions connected to this node
        #[arg(long)]
        gateway: bool,
    },
    /// Validate configuration
    Config {
        /// Print the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting support-mesh v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { gateway } => {
            let span = lifecycle_span!(mesh_id = %config.mesh.id);
            run_node(config, gateway).instrument(span).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<MeshConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(MeshConfig::load_from_file(path)?);
    }

    for candidate in ["mesh.toml", "config/mesh.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(MeshConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create mesh.toml".into())
}

async fn run_node(config: MeshConfig, gateway: bool) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        stages = config.mesh.stages.len(),
        concurrency = config.mesh.concurrency,
        "Node starting"
    );
    metrics().set_node_state("initializing");

    let mut node = build_node(config.clone(), gateway).await?;

    let health_port = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let health_server = Arc::new(HealthServer::new(config.mesh.id.clone(), health_port));
    let server = health_server.clone();
    tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("Health server error: {}", e);
        }
    });
    node.set_health_server(health_server.clone());

    node.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Mesh node is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = monitor_connection_health(&node) => {
            error!("Bus connection permanently lost, shutting down node...");
            health_server.set_bus_connected(false);
        }
    }

    if let Err(e) = node.shutdown().await {
        error!("Error during shutdown: {}", e);
        metrics().set_node_state("error");
        return Err(e.into());
    }
    Ok(())
}

/// Wire the node to the broker and its production collaborators
async fn build_node(
    config: MeshConfig,
    gateway: bool,
) -> Result<MeshNode<MqttTransport, SqliteAuditStore>, Box<dyn std::error::Error>> {
    let transport =
        MqttTransport::new(&config.mesh.id, config.mqtt.clone(), &config.mesh.consumer_group)
            .await?;
    let collaborators = Collaborators::from_config(&config).await?;

    let node = MeshNode::new(config, transport, collaborators);
    Ok(if gateway {
        node.with_gateway(Arc::new(SessionRegistry::new()))
    } else {
        node
    })
}

fn handle_config_command(config: &MeshConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", config.to_toml_string()?);
    }
    info!("Configuration validation complete");
    Ok(())
}

/// Resolve once the bus has given up reconnecting
async fn monitor_connection_health(node: &MeshNode<MqttTransport, SqliteAuditStore>) {
    while !node.is_permanently_disconnected() {
        sleep(Duration::from_millis(100)).await;
    }
}

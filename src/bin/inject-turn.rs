//! Support Mesh turn injection utility
//!
//! Publishes one customer turn onto the first stage subject so a running mesh
//! picks it up.
//!
//! ## Usage
//!
//! ```bash
//! # Minimal
//! inject-turn --session demo-1 --text "Where is my order #123?"
//!
//! # Known VIP customer
//! inject-turn --session demo-2 --text "I was double charged" --customer-id c-42 --vip
//!
//! # Explicit configuration file
//! inject-turn --config config/mesh.toml --session demo-3 --text "URGENT: account locked"
//!
//! # Also append the turn to the audit transcript
//! inject-turn --session demo-4 --text "Cancel my plan" --record
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use support_mesh::config::MeshConfig;
use support_mesh::gateway::{Gateway, SessionRegistry, TurnRequest};
use support_mesh::observability::init_default_logging;
use support_mesh::services::audit::SqliteAuditStore;
use support_mesh::transport::{MqttTransport, Transport};
use tokio::time::{sleep, Duration};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "inject-turn",
    about = "Inject a customer turn into a running support mesh"
)]
struct Args {
    /// Configuration file providing the broker settings
    #[arg(short, long, value_name = "FILE", default_value = "mesh.toml")]
    config: PathBuf,

    /// Session the turn belongs to (auto-generated if not provided)
    #[arg(long)]
    session: Option<String>,

    /// Customer message text
    #[arg(long, required = true)]
    text: String,

    /// Known customer identifier
    #[arg(long)]
    customer_id: Option<String>,

    /// Mark the customer as VIP
    #[arg(long)]
    vip: bool,

    /// Append the turn to the transcript in the configured audit database
    #[arg(long)]
    record: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_default_logging();

    let config = MeshConfig::load_from_file(&args.config)?;
    let session_id = args
        .session
        .unwrap_or_else(|| format!("session-{}", Uuid::new_v4()));

    let client_id = format!("{}-inject-{}", config.mesh.id, std::process::id());
    let mut transport =
        MqttTransport::new(&client_id, config.mqtt.clone(), &config.mesh.consumer_group).await?;
    transport.connect().await?;

    let transport = Arc::new(transport);
    let mut gateway = Gateway::new(transport.clone(), Arc::new(SessionRegistry::new()));
    if args.record {
        let audit = SqliteAuditStore::connect(&config.audit.database_url).await?;
        gateway = gateway.with_turn_log(Arc::new(audit));
    }

    let mut request = TurnRequest::new(session_id.clone(), args.text);
    if let Some(customer_id) = args.customer_id {
        request = request.with_customer(customer_id);
    }
    if args.vip {
        request = request.with_vip(true);
    }

    let message = gateway.submit_turn(request).await?;
    println!("Injected turn {} for session {}", message.id, session_id);

    // Give the event loop a moment to flush the QoS 1 publish
    sleep(Duration::from_millis(500)).await;

    drop(gateway);
    if let Ok(mut transport) = Arc::try_unwrap(transport) {
        transport.disconnect().await?;
    }
    Ok(())
}

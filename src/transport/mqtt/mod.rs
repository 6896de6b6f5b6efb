//! MQTT transport for the support mesh
//!
//! Pure functions are kept apart from I/O:
//!
//! - [`connection`] - connection states, backoff policy and broker options
//! - [`message_handler`] - event routing, pending acknowledgements and forwarding
//! - [`health_monitor`] - reconnection decisions and health snapshots
//! - [`client`] - the rumqttc client and its reconnection supervisor
//!
//! Every stage subject is consumed through an MQTT v5 shared subscription, so
//! several nodes subscribed with the same consumer group compete for work.
//!
//! ```rust,no_run
//! use support_mesh::config::MqttSection;
//! use support_mesh::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     keep_alive_secs: 30,
//! };
//!
//! let mut client = MqttClient::new("node-1", config, "support-mesh").await?;
//! client.connect().await?;
//! client.subscribe("domain.support.sentiment").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{AckRegistry, EventRoute, MessageHandler};

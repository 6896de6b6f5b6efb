//! Support Mesh
//!
//! An actor choreography mesh for customer-support conversations. Each turn
//! travels over an MQTT bus as a self-describing [`Message`] that carries its
//! own route. Stage actors enrich the payload; after every hop the routers
//! decide whether to continue, skip ahead, ask for clarification, retry, fall
//! back or hand off to a human. Every route ends at the response aggregator,
//! which delivers the answer and persists an audit record.
//!
//! # Overview
//!
//! - [`protocol`]: messages, routes, subjects and delivery records
//! - [`routing`]: the pure decision and escalation routers
//! - [`actor`]: the actor contract, per-hop runtime, stage actors and workers
//! - [`services`]: context lookup, action execution, generation and audit
//! - [`gateway`]: turn submission and live session delivery
//! - [`node`]: lifecycle wiring it all to a transport
//!
//! # Quick Start
//!
//! ```rust
//! use support_mesh::protocol::{Message, Stage};
//!
//! let message = Message::new("session-1", "Where is my order #123?");
//! assert_eq!(message.current_stage(), Some(Stage::Sentiment));
//!
//! // Messages cross the bus as JSON
//! let json = serde_json::to_string(&message).unwrap();
//! let back: Message = serde_json::from_str(&json).unwrap();
//! assert_eq!(back.route, message.route);
//! ```

pub mod actor;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod llm;
pub mod node;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod services;
pub mod testing;
pub mod transport;

pub use actor::{Actor, ActorRuntime, HopOutcome, ResponseAggregator};
pub use config::MeshConfig;
pub use error::{MeshError, MeshResult, StageError};
pub use gateway::{Gateway, SessionRegistry, TurnRequest};
pub use node::{Collaborators, MeshNode, NodeError};
pub use protocol::*;
pub use transport::mqtt::MqttClient;

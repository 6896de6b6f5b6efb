//! Bus transport abstraction
//!
//! Stages never talk to the broker directly; they go through [`Transport`],
//! which the MQTT client implements and the in-memory mock replaces in tests.

use crate::protocol::{DeadLetter, DeliveryRecord, Message};
use tokio::sync::mpsc;

pub mod mqtt;

/// Handle used to acknowledge an inbound delivery after its successor is published
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckToken(pub u64);

/// Raw body pulled from a subscribed subject
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub subject: String,
    pub payload: Vec<u8>,
    pub ack: AckToken,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn connect(&mut self) -> Result<(), Self::Error>;

    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Publish a message to a stage subject (QoS 1)
    async fn publish_message(&self, subject: &str, message: &Message) -> Result<(), Self::Error>;

    /// Publish a delivery record to the terminal subject
    async fn publish_delivery(&self, record: &DeliveryRecord) -> Result<(), Self::Error>;

    /// Park an unprocessable body on the dead-letter subject
    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), Self::Error>;

    /// Publish raw bytes to any subject
    async fn publish(&self, subject: &str, payload: Vec<u8>, retain: bool)
        -> Result<(), Self::Error>;

    /// Join the work queue for a subject; competing consumers share deliveries
    async fn subscribe(&mut self, subject: &str) -> Result<(), Self::Error>;

    /// Acknowledge an inbound delivery
    async fn acknowledge(&self, token: AckToken) -> Result<(), Self::Error>;

    fn is_connected(&self) -> bool;

    fn connection_state(&self) -> Option<mqtt::ConnectionState>;

    fn is_permanently_disconnected(&self) -> bool;

    /// Where inbound deliveries are forwarded
    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundDelivery>);
}

pub type MqttTransport = mqtt::MqttClient;

//! Pure event routing and inbound bookkeeping for the MQTT transport
//!
//! Turns rumqttc events into [`EventRoute`] decisions, tracks publishes that
//! are waiting for a manual acknowledgement, and forwards accepted deliveries
//! to the node's dispatcher.

use crate::transport::{AckToken, InboundDelivery};
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::Event;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        retain: publish.retain,
                        publish: Box::new(publish.clone()),
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                        reason_codes: suback
                            .return_codes
                            .iter()
                            .map(|code| format!("{code:?}"))
                            .collect(),
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Whether an inbound publish belongs to a subject this node consumes
    ///
    /// Shared subscriptions deliver on the plain subject name, so the
    /// subscribed list holds plain subjects.
    pub fn should_process_message(topic: &str, retain: bool, subscribed: &[String]) -> bool {
        if retain {
            debug!(topic = %topic, "Ignoring retained message");
            return false;
        }
        if !subscribed.iter().any(|s| s == topic) {
            debug!(topic = %topic, "Ignoring message on unsubscribed subject");
            return false;
        }
        true
    }

    /// Serialize a wire value to JSON bytes
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(value)
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        retain: bool,
        publish: Box<Publish>,
    },
    Disconnected,
    SubscriptionConfirmed {
        packet_id: u16,
        reason_codes: Vec<String>,
    },
    /// PingResp and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Publishes handed to workers and not yet acknowledged
#[derive(Debug, Default)]
pub struct AckRegistry {
    next_token: u64,
    pending: HashMap<u64, Publish>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, publish: Publish) -> AckToken {
        self.next_token += 1;
        self.pending.insert(self.next_token, publish);
        AckToken(self.next_token)
    }

    pub fn take(&mut self, token: AckToken) -> Option<Publish> {
        self.pending.remove(&token.0)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending entry; packet ids do not survive a reconnect
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

/// Forwards accepted deliveries to the dispatcher
#[derive(Clone)]
pub struct MessageForwarder {
    inbound_sender: Option<mpsc::Sender<InboundDelivery>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self {
            inbound_sender: None,
        }
    }

    pub fn set_inbound_sender(&mut self, sender: mpsc::Sender<InboundDelivery>) {
        self.inbound_sender = Some(sender);
    }

    pub async fn forward(&self, delivery: InboundDelivery) -> Result<(), String> {
        match self.inbound_sender {
            Some(ref sender) => sender
                .send(delivery)
                .await
                .map_err(|e| format!("Failed to forward delivery to dispatcher: {e}")),
            None => {
                warn!(subject = %delivery.subject, "Received delivery but no inbound sender configured");
                Err("No inbound sender configured".to_string())
            }
        }
    }
}

impl Default for MessageForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::QoS;

    fn publish(topic: &str, payload: &str) -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from(topic.to_string()),
            pkid: 7,
            payload: Bytes::from(payload.to_string()),
            properties: None,
        }
    }

    #[test]
    fn test_route_publish_event() {
        let event = Event::Incoming(rumqttc::v5::mqttbytes::v5::Packet::Publish(publish(
            "domain.support.intent",
            "{}",
        )));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived {
                topic,
                retain,
                publish,
            } => {
                assert_eq!(topic, "domain.support.intent");
                assert!(!retain);
                assert_eq!(publish.pkid, 7);
                assert_eq!(&publish.payload[..], b"{}");
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_route_connection_events() {
        use rumqttc::v5::mqttbytes::v5::{
            ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Packet,
        };

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));
    }

    #[test]
    fn test_should_process_message() {
        let subscribed = vec!["domain.support.intent".to_string()];

        assert!(MessageHandler::should_process_message(
            "domain.support.intent",
            false,
            &subscribed
        ));
        assert!(!MessageHandler::should_process_message(
            "domain.support.intent",
            true,
            &subscribed
        ));
        assert!(!MessageHandler::should_process_message(
            "domain.support.response",
            false,
            &subscribed
        ));
    }

    #[test]
    fn test_ack_registry() {
        let mut registry = AckRegistry::new();
        let first = registry.register(publish("a", "1"));
        let second = registry.register(publish("b", "2"));
        assert_ne!(first, second);
        assert_eq!(registry.len(), 2);

        let taken = registry.take(first).unwrap();
        assert_eq!(&taken.topic[..], b"a");
        assert!(registry.take(first).is_none());

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
        // Tokens keep increasing after a clear
        assert!(registry.register(publish("c", "3")).0 > second.0);
    }

    #[tokio::test]
    async fn test_message_forwarder() {
        let mut forwarder = MessageForwarder::new();
        let delivery = InboundDelivery {
            subject: "domain.support.intent".to_string(),
            payload: b"{}".to_vec(),
            ack: AckToken(1),
        };

        assert!(forwarder.forward(delivery.clone()).await.is_err());

        let (tx, mut rx) = mpsc::channel(1);
        forwarder.set_inbound_sender(tx);
        forwarder.forward(delivery).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.ack, AckToken(1));
        assert_eq!(received.subject, "domain.support.intent");
    }
}

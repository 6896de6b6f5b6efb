//! Impure I/O operations for the MQTT transport
//!
//! Owns the rumqttc client, runs the reconnection supervisor, joins shared
//! subscriptions and performs manual acknowledgements.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{AckRegistry, EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::protocol::{
    shared_subscription, DeadLetter, DeliveryRecord, Message, DEAD_LETTER_SUBJECT,
    DELIVERIES_SUBJECT,
};
use crate::transport::{AckToken, InboundDelivery, Transport};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Publish, PublishProperties};
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of rumqttc's request queue
const REQUEST_CAPACITY: usize = 64;

/// MQTT transport for one mesh node
pub struct MqttClient {
    mesh_id: String,
    config: MqttSection,
    consumer_group: String,
    client: Arc<Mutex<AsyncClient>>,
    /// Taken by `connect`; the lock keeps the client `Sync`
    event_loop: Option<std::sync::Mutex<EventLoop>>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    /// Plain subject names, re-joined after every reconnect
    subscribed_subjects: Arc<Mutex<Vec<String>>>,
    pending_acks: Arc<Mutex<AckRegistry>>,
    message_forwarder: Arc<RwLock<MessageForwarder>>,
    connect_time: Option<Instant>,
    last_inbound: Arc<Mutex<Option<Instant>>>,
    reconnect_count: Arc<AtomicU32>,
}

impl MqttClient {
    pub async fn new(
        mesh_id: &str,
        config: MqttSection,
        consumer_group: &str,
    ) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(mesh_id, &config)?;

        Ok(MqttClient {
            mesh_id: mesh_id.to_string(),
            config,
            consumer_group: consumer_group.to_string(),
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(std::sync::Mutex::new(event_loop)),
            event_loop_handle: None,
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect_config: ReconnectConfig::default(),
            subscribed_subjects: Arc::new(Mutex::new(Vec::new())),
            pending_acks: Arc::new(Mutex::new(AckRegistry::new())),
            message_forwarder: Arc::new(RwLock::new(MessageForwarder::new())),
            connect_time: None,
            last_inbound: Arc::new(Mutex::new(None)),
            reconnect_count: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn create_connection(
        mesh_id: &str,
        config: &MqttSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(mesh_id, config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CAPACITY))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for the first ConnAck, not merely the first event
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    // The supervisor keeps retrying through transient failures
                    ConnectionState::Connecting
                    | ConnectionState::Reconnecting(_)
                    | ConnectionState::Disconnected(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Start the reconnection supervisor and wait for the broker's ConnAck
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .event_loop
            .take()
            .ok_or_else(|| MqttError::ConnectionFailedStr("Event loop already started".to_string()))?
            .into_inner()
            .map_err(|_| MqttError::ConnectionFailedStr("Event loop lock poisoned".to_string()))?;

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            mesh_id: self.mesh_id.clone(),
            config: self.config.clone(),
            reconnect_config: self.reconnect_config.clone(),
            consumer_group: self.consumer_group.clone(),
            state_tx,
            shutdown_rx,
            client: self.client.clone(),
            subscribed_subjects: self.subscribed_subjects.clone(),
            pending_acks: self.pending_acks.clone(),
            message_forwarder: self.message_forwarder.clone(),
            last_inbound: self.last_inbound.clone(),
            reconnect_count: self.reconnect_count.clone(),
            attempts: 0,
        };
        self.event_loop_handle = Some(tokio::spawn(supervisor.run(event_loop)));

        let connection_timeout = HealthMonitor::connection_timeout(&self.reconnect_config);
        Self::wait_for_connection_confirmation(state_rx, connection_timeout).await?;

        self.connect_time = Some(Instant::now());
        Ok(())
    }

    /// Stop the supervisor and close the broker session
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            debug!("Sent shutdown signal to reconnection supervisor");
        }

        {
            let client = self.client.lock().await;
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        }

        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "Event loop task ended with error")
                }
                Err(_) => warn!("Event loop task didn't shut down gracefully, forcing abort"),
                _ => {}
            }
        }

        let dropped = self.pending_acks.lock().await.clear();
        if dropped > 0 {
            warn!(
                dropped,
                "Disconnected with unacknowledged deliveries; the broker will redeliver them"
            );
        }

        info!(mesh_id = %self.mesh_id, "MQTT client disconnected");
        Ok(())
    }

    /// `None` until [`connect`](Self::connect) has been called
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    pub async fn get_health_metrics(&self) -> HealthMetrics {
        let last_inbound = *self.last_inbound.lock().await;
        let pending_acks = self.pending_acks.lock().await.len();
        HealthMonitor::health_metrics(
            self.connect_time,
            last_inbound,
            self.reconnect_count.load(Ordering::Relaxed),
            pending_acks,
        )
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        // Never connected is an error, not a silent success
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !current_state.is_usable() {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    async fn publish_bytes(
        &self,
        subject: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let client = self.client.lock().await;
        client
            .publish_with_properties(
                subject,
                QoS::AtLeastOnce,
                retain,
                payload,
                PublishProperties::default(),
            )
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn publish_json<T: Serialize>(&self, subject: &str, value: &T) -> Result<(), MqttError> {
        let payload = MessageHandler::encode(value).map_err(MqttError::SerializationError)?;
        self.publish_bytes(subject, payload, false).await
    }

    pub async fn publish_message(&self, subject: &str, message: &Message) -> Result<(), MqttError> {
        self.publish_json(subject, message).await?;
        debug!(
            subject = %subject,
            message_id = %message.id,
            session_id = %message.session_id(),
            "Published message"
        );
        Ok(())
    }

    pub async fn publish_delivery(&self, record: &DeliveryRecord) -> Result<(), MqttError> {
        self.publish_json(DELIVERIES_SUBJECT, record).await?;
        debug!(
            session_id = %record.session_id,
            routed_to = record.routed_to.as_str(),
            "Published delivery record"
        );
        Ok(())
    }

    pub async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), MqttError> {
        self.publish_json(DEAD_LETTER_SUBJECT, letter).await?;
        warn!(
            code = ?letter.code,
            reason = %letter.reason,
            "Published dead letter"
        );
        Ok(())
    }

    /// Join the consumer group's shared subscription for a subject
    pub async fn subscribe(&mut self, subject: &str) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let filter = shared_subscription(&self.consumer_group, subject);
        {
            let client = self.client.lock().await;
            client
                .subscribe(&filter, QoS::AtLeastOnce)
                .await
                .map_err(|e| {
                    MqttError::SubscriptionFailed(
                        format!("Failed to subscribe to {filter}: {e}").into(),
                    )
                })?;
        }

        let mut subscribed = self.subscribed_subjects.lock().await;
        if !subscribed.iter().any(|s| s == subject) {
            subscribed.push(subject.to_string());
        }

        info!(subject = %subject, filter = %filter, "Subscribed to subject");
        Ok(())
    }

    /// Acknowledge a delivery so the broker stops redelivering it
    pub async fn acknowledge(&self, token: AckToken) -> Result<(), MqttError> {
        let publish = self
            .pending_acks
            .lock()
            .await
            .take(token)
            .ok_or(MqttError::UnknownAckToken(token.0))?;

        let client = self.client.lock().await;
        client
            .ack(&publish)
            .await
            .map_err(|e| MqttError::AckFailed(Box::new(e)))
    }

    pub fn set_inbound_sender(&self, sender: mpsc::Sender<InboundDelivery>) {
        let mut forwarder = self
            .message_forwarder
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        forwarder.set_inbound_sender(sender);
    }
}

/// State owned by the background event loop task
struct Supervisor {
    mesh_id: String,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    consumer_group: String,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    client: Arc<Mutex<AsyncClient>>,
    subscribed_subjects: Arc<Mutex<Vec<String>>>,
    pending_acks: Arc<Mutex<AckRegistry>>,
    message_forwarder: Arc<RwLock<MessageForwarder>>,
    last_inbound: Arc<Mutex<Option<Instant>>>,
    reconnect_count: Arc<AtomicU32>,
    attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!(mesh_id = %self.mesh_id, "Starting MQTT event loop with reconnection supervisor");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        break;
                    }
                }
                event_result = event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut event_loop).await
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            let _ = self.state_tx.send(HealthMonitor::next_state(
                                ConnectionEvent::NetworkError(reason),
                            ));
                            self.attempt_reconnection(&mut event_loop).await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!(mesh_id = %self.mesh_id, "MQTT event loop stopped");
    }

    /// Returns false when the supervisor should stop
    async fn process_event_route(&mut self, route: EventRoute, event_loop: &mut EventLoop) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let _ = self
                    .state_tx
                    .send(HealthMonitor::next_state(ConnectionEvent::ConnAckReceived));
                self.attempts = 0;
                self.resubscribe().await;
                true
            }
            EventRoute::MessageReceived {
                topic,
                retain,
                publish,
            } => {
                self.handle_message_received(topic, retain, *publish).await;
                true
            }
            EventRoute::Disconnected => {
                let _ = self.state_tx.send(HealthMonitor::next_state(
                    ConnectionEvent::DisconnectedByBroker,
                ));
                self.attempt_reconnection(event_loop).await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                reason_codes,
            } => {
                debug!(target: "mqtt_transport", packet_id, ?reason_codes, "Subscription confirmed");
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", event = %event_str, "MQTT event");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_message_received(&self, topic: String, retain: bool, publish: Publish) {
        debug!(target: "mqtt_transport", topic = %topic, "Received MQTT message");

        let subscribed = self.subscribed_subjects.lock().await.clone();
        if !MessageHandler::should_process_message(&topic, retain, &subscribed) {
            // Nothing will ever handle it, stop the broker from redelivering
            let client = self.client.lock().await;
            if let Err(e) = client.ack(&publish).await {
                warn!(topic = %topic, error = %e, "Failed to acknowledge ignored message");
            }
            return;
        }

        *self.last_inbound.lock().await = Some(Instant::now());

        let payload = publish.payload.to_vec();
        let ack = self.pending_acks.lock().await.register(publish);
        let delivery = InboundDelivery {
            subject: topic,
            payload,
            ack,
        };

        // Clone out so no std lock is held across the send
        let forwarder = self
            .message_forwarder
            .read()
            .map(|forwarder| forwarder.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());
        if let Err(e) = forwarder.forward(delivery).await {
            // Left unacknowledged; the broker redelivers after reconnect
            error!(error = %e, "Failed to forward delivery");
            self.pending_acks.lock().await.take(ack);
        }
    }

    async fn resubscribe(&self) {
        let subjects = self.subscribed_subjects.lock().await.clone();
        let client = self.client.lock().await;
        for subject in subjects {
            let filter = shared_subscription(&self.consumer_group, &subject);
            if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                error!(filter = %filter, error = %e, "Failed to re-subscribe");
            } else {
                debug!(target: "mqtt_transport", filter = %filter, "Re-subscribed");
            }
        }
    }

    /// Sleep that returns false when shutdown is requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Swap in a fresh client and event loop
    async fn apply_new_connection(&self, event_loop: &mut EventLoop) {
        match MqttClient::create_connection(&self.mesh_id, &self.config) {
            Ok((new_client, new_event_loop)) => {
                *event_loop = new_event_loop;
                *self.client.lock().await = new_client;

                // Packet ids from the old session cannot be acked on the new one
                let dropped = self.pending_acks.lock().await.clear();
                if dropped > 0 {
                    warn!(dropped, "Discarded pending acknowledgements from previous session");
                }
                self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                debug!("Replaced MQTT client for reconnection attempt");
            }
            Err(e) => {
                // The next poll fails again and triggers another attempt
                error!(error = %e, "Failed to create new connection");
            }
        }
    }

    async fn attempt_reconnection(&mut self, event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.attempts = attempt;
                let _ = self.state_tx.send(HealthMonitor::next_state(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));
                info!(
                    attempt,
                    max_attempts = ?self.reconnect_config.max_attempts,
                    delay_ms,
                    "Attempting reconnection"
                );

                if !Self::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }
                if *self.shutdown_rx.borrow() {
                    info!("Shutdown signal received, aborting reconnection");
                    return false;
                }

                self.apply_new_connection(event_loop).await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.attempts
                );
                let _ = self
                    .state_tx
                    .send(HealthMonitor::next_state(ConnectionEvent::PermanentFailure(
                        reason,
                    )));
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish_message(&self, subject: &str, message: &Message) -> Result<(), Self::Error> {
        MqttClient::publish_message(self, subject, message).await
    }

    async fn publish_delivery(&self, record: &DeliveryRecord) -> Result<(), Self::Error> {
        MqttClient::publish_delivery(self, record).await
    }

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), Self::Error> {
        MqttClient::publish_dead_letter(self, letter).await
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        self.publish_bytes(subject, payload, retain).await
    }

    async fn subscribe(&mut self, subject: &str) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, subject).await
    }

    async fn acknowledge(&self, token: AckToken) -> Result<(), Self::Error> {
        MqttClient::acknowledge(self, token).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundDelivery>) {
        MqttClient::set_inbound_sender(self, sender)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        // No async in Drop; callers wanting a clean broker goodbye use disconnect()
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt_section() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 30,
        }
    }

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            MqttClient::setup_connection_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!(*shutdown_rx.borrow()));

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Reconnecting(1));
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();

        let _keep_alive = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(state_tx);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(50))
                .await;
        assert!(matches!(result, Err(MqttError::ConnectionFailedStr(msg)) if msg.contains("timeout")));
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_permanent_failure() {
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::PermanentlyDisconnected(
                "gave up".to_string(),
            ));
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(matches!(result, Err(MqttError::ConnectionFailedStr(msg)) if msg.contains("gave up")));
    }

    #[tokio::test]
    async fn test_interruptible_sleep() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(Supervisor::interruptible_sleep(shutdown_rx.clone(), 5).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = shutdown_tx.send(true);
        });
        assert!(!Supervisor::interruptible_sleep(shutdown_rx, 10_000).await);
    }

    #[tokio::test]
    async fn test_publish_without_connection_fails() {
        let client = MqttClient::new("node-1", mqtt_section(), "support-mesh")
            .await
            .unwrap();

        assert!(client.connection_state().is_none());
        assert!(!Transport::is_connected(&client));

        let message = Message::new("session-1", "hello");
        let result = client
            .publish_message("domain.support.sentiment", &message)
            .await;
        assert!(matches!(result, Err(MqttError::ConnectionFailedStr(_))));
    }

    #[tokio::test]
    async fn test_subscribe_without_connection_fails() {
        let mut client = MqttClient::new("node-1", mqtt_section(), "support-mesh")
            .await
            .unwrap();

        assert!(client.subscribe("domain.support.intent").await.is_err());
        assert!(client.subscribed_subjects.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_token() {
        let client = MqttClient::new("node-1", mqtt_section(), "support-mesh")
            .await
            .unwrap();

        let result = client.acknowledge(AckToken(42)).await;
        assert!(matches!(result, Err(MqttError::UnknownAckToken(42))));
    }

    #[tokio::test]
    async fn test_health_metrics_before_connect() {
        let client = MqttClient::new("node-1", mqtt_section(), "support-mesh")
            .await
            .unwrap();

        let metrics = client.get_health_metrics().await;
        assert!(!metrics.is_healthy);
        assert_eq!(metrics.pending_acks, 0);
        assert_eq!(metrics.reconnect_count, 0);
    }

    #[test]
    fn test_client_is_shareable_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MqttClient>();
    }

    #[tokio::test]
    async fn test_inbound_sender_is_installed_before_returning() {
        let client = MqttClient::new("node-1", mqtt_section(), "support-mesh")
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        client.set_inbound_sender(tx);

        let forwarder = client.message_forwarder.read().unwrap().clone();
        forwarder
            .forward(InboundDelivery {
                subject: "domain.support.intent".to_string(),
                payload: b"{}".to_vec(),
                ack: AckToken(7),
            })
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().ack, AckToken(7));
    }
}

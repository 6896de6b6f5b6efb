//! Edge of the mesh: turns enter here and answers leave here
//!
//! [`Gateway::submit_turn`] publishes the first hop of a new turn.
//! Terminal [`DeliveryRecord`]s come back on the deliveries subject and are
//! pushed to whichever live session is registered in the [`SessionRegistry`].
//!
//! A gateway may also keep conversation state in a [`SessionStore`] and log
//! each accepted turn to an [`AuditStore`] transcript. Both are best effort:
//! once a turn is on the bus, neither can fail it.

use crate::error::MeshError;
use crate::observability::metrics::metrics;
use crate::protocol::{
    keys, subject_for, DeliveryRecord, Enrichment, Message, GATEWAY_WRITER,
};
use crate::services::audit::{AuditStore, TranscriptEntry};
use crate::services::session::SessionStore;
use crate::transport::Transport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Buffered records per live session
const SESSION_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliveryError {
    #[error("No live session: {0}")]
    SessionNotFound(String),
    #[error("Session channel closed: {0}")]
    ChannelClosed(String),
    #[error("Delivery transport failed: {0}")]
    Transport(String),
}

/// Where the aggregator sends finished turns
#[async_trait]
pub trait SessionDelivery: Send + Sync {
    async fn deliver(&self, record: &DeliveryRecord) -> Result<(), DeliveryError>;
}

/// Publishes finished turns to the deliveries subject
pub struct BusSessionDelivery<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> BusSessionDelivery<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: Transport> SessionDelivery for BusSessionDelivery<T> {
    async fn deliver(&self, record: &DeliveryRecord) -> Result<(), DeliveryError> {
        self.transport
            .publish_delivery(record)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))
    }
}

/// Live sessions keyed by session id
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, mpsc::Sender<DeliveryRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; a reconnect replaces the previous channel
    pub async fn connect<S: Into<String>>(&self, session_id: S) -> mpsc::Receiver<DeliveryRecord> {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let session_id = session_id.into();
        debug!(session_id = %session_id, "Session connected");
        self.sessions.write().await.insert(session_id, tx);
        rx
    }

    pub async fn disconnect(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    pub async fn is_connected(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionDelivery for SessionRegistry {
    async fn deliver(&self, record: &DeliveryRecord) -> Result<(), DeliveryError> {
        let sender = self
            .sessions
            .read()
            .await
            .get(&record.session_id)
            .cloned()
            .ok_or_else(|| DeliveryError::SessionNotFound(record.session_id.clone()))?;

        if sender.send(record.clone()).await.is_err() {
            self.sessions.write().await.remove(&record.session_id);
            return Err(DeliveryError::ChannelClosed(record.session_id.clone()));
        }
        Ok(())
    }
}

/// A customer turn as received from the channel in front of the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    pub text: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub vip: Option<bool>,
}

impl TurnRequest {
    pub fn new<S: Into<String>, T: Into<String>>(session_id: S, text: T) -> Self {
        Self {
            session_id: session_id.into(),
            text: text.into(),
            customer_id: None,
            vip: None,
        }
    }

    pub fn with_customer<S: Into<String>>(mut self, customer_id: S) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn with_vip(mut self, vip: bool) -> Self {
        self.vip = Some(vip);
        self
    }

    /// Initial message for this turn (pure function)
    pub fn into_message(self) -> Result<Message, MeshError> {
        if self.session_id.trim().is_empty() {
            return Err(MeshError::malformed("Turn has no session id"));
        }
        if self.text.trim().is_empty() {
            return Err(MeshError::malformed("Turn text is empty"));
        }

        let mut hints = Enrichment::new();
        if let Some(customer_id) = self.customer_id {
            hints.insert(keys::CUSTOMER_ID, customer_id);
        }
        if let Some(vip) = self.vip {
            hints.insert(keys::VIP, vip);
        }

        Message::new(self.session_id, self.text)
            .with_enrichment(GATEWAY_WRITER, hints)
            .map_err(|e| MeshError::internal(e.to_string()))
    }
}

pub struct Gateway<T: Transport> {
    transport: Arc<T>,
    sessions: Arc<SessionRegistry>,
    session_state: Option<Arc<dyn SessionStore>>,
    turn_log: Option<Arc<dyn AuditStore>>,
}

impl<T: Transport> Gateway<T> {
    pub fn new(transport: Arc<T>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            transport,
            sessions,
            session_state: None,
            turn_log: None,
        }
    }

    /// Track conversation state for every turn and answer
    pub fn with_session_state(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_state = Some(store);
        self
    }

    /// Append every accepted turn to the transcript
    pub fn with_turn_log(mut self, log: Arc<dyn AuditStore>) -> Self {
        self.turn_log = Some(log);
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    async fn note_turn(&self, message: &Message) {
        let session_id = message.session_id();
        if let Some(store) = &self.session_state {
            match store
                .record_turn(session_id, message.payload.customer_id())
                .await
            {
                Ok(state) => debug!(
                    session_id = %session_id,
                    message_count = state.message_count,
                    "Session state updated"
                ),
                Err(e) => warn!(session_id = %session_id, error = %e, "Failed to update session state"),
            }
        }
        if let Some(log) = &self.turn_log {
            if let Err(e) = log.record_turn(&TranscriptEntry::inbound(message)).await {
                warn!(session_id = %session_id, error = %e, "Failed to log inbound turn");
            }
        }
    }

    /// Start a turn by publishing it to the first stage of its route
    pub async fn submit_turn(&self, request: TurnRequest) -> Result<Message, MeshError> {
        let message = request.into_message()?;
        let first = message
            .current_stage()
            .ok_or_else(|| MeshError::internal("New message has an empty route"))?;

        self.transport
            .publish_message(subject_for(first), &message)
            .await
            .map_err(|e| {
                metrics().publish_failed();
                MeshError::transport(e.to_string())
            })?;
        metrics().message_published();
        self.note_turn(&message).await;

        info!(
            session_id = %message.session_id(),
            message_id = %message.id,
            stage = first.as_str(),
            "Turn submitted"
        );
        Ok(message)
    }

    /// Push a finished turn to its live session
    ///
    /// The record is already persisted, so an absent session only loses the
    /// live push.
    pub async fn forward_delivery(&self, record: &DeliveryRecord) -> Result<(), DeliveryError> {
        if let Some(store) = &self.session_state {
            if let Err(e) = store.record_answer(&record.session_id, record.routed_to).await {
                warn!(session_id = %record.session_id, error = %e, "Failed to update session state");
            }
        }

        match self.sessions.deliver(record).await {
            Ok(()) => {
                debug!(session_id = %record.session_id, "Delivery forwarded to session");
                Ok(())
            }
            Err(e) => {
                warn!(
                    session_id = %record.session_id,
                    message_id = %record.message_id,
                    error = %e,
                    "Delivery not forwarded"
                );
                Err(e)
            }
        }
    }

    /// Decode a body from the deliveries subject and forward it
    pub async fn forward_body(&self, body: &[u8]) -> Result<DeliveryRecord, MeshError> {
        let record: DeliveryRecord = serde_json::from_slice(body)
            .map_err(|e| MeshError::malformed(format!("Invalid delivery record: {e}")))?;
        // Absent sessions are logged by forward_delivery
        let _ = self.forward_delivery(&record).await;
        Ok(record)
    }
}

//! Mock implementations for testing
//!
//! Provides an in-memory bus, scripted actors and collaborators so stages can
//! be exercised without a broker, a database or an LLM provider.

use crate::actor::Actor;
use crate::error::{MeshError, StageError};
use crate::gateway::{DeliveryError, SessionDelivery};
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
};
use crate::protocol::{
    DeadLetter, DeliveryRecord, Enrichment, Message, Stage, DEAD_LETTER_SUBJECT,
    DELIVERIES_SUBJECT,
};
use crate::services::audit::{AuditError, AuditStore, TranscriptEntry};
use crate::services::context::{ContextLookup, ContextStore, CacheError};
use crate::transport::{mqtt::ConnectionState, AckToken, InboundDelivery, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

pub type PublishedMessage = (String, Vec<u8>);

/// In-memory bus that records every publish
#[derive(Debug, Default)]
pub struct MockTransport {
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub acknowledged: Arc<Mutex<Vec<AckToken>>>,
    pub should_fail: bool,
    /// Publishes fail while set; connection state is unaffected
    pub fail_publishes: Arc<AtomicBool>,
    pub inbound_sender: Arc<Mutex<Option<mpsc::Sender<InboundDelivery>>>>,
    /// Deliveries the "broker" pushes as soon as their subject is joined
    pending_on_subscribe: Arc<Mutex<Vec<InboundDelivery>>>,
    /// Deliveries that arrived with no inbound sender installed
    pub dropped: Arc<Mutex<Vec<InboundDelivery>>>,
    next_ack: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    /// Messages published to one stage subject
    pub async fn get_messages_on(&self, subject: &str) -> Vec<Message> {
        self.decoded_on(subject).await
    }

    pub async fn get_deliveries(&self) -> Vec<DeliveryRecord> {
        self.decoded_on(DELIVERIES_SUBJECT).await
    }

    pub async fn get_dead_letters(&self) -> Vec<DeadLetter> {
        self.decoded_on(DEAD_LETTER_SUBJECT).await
    }

    pub async fn get_acknowledged(&self) -> Vec<AckToken> {
        self.acknowledged.lock().await.clone()
    }

    pub async fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    /// Take the oldest recorded publish, if any
    pub async fn pop_published(&self) -> Option<PublishedMessage> {
        let mut published = self.published_messages.lock().await;
        if published.is_empty() {
            None
        } else {
            Some(published.remove(0))
        }
    }

    pub async fn clear_history(&self) {
        self.published_messages.lock().await.clear();
        self.acknowledged.lock().await.clear();
    }

    /// Push a body to the inbound sender as if the broker delivered it
    pub async fn inject<S: Into<String>>(&self, subject: S, payload: Vec<u8>) -> Option<AckToken> {
        let ack = AckToken(self.next_ack.fetch_add(1, Ordering::SeqCst) + 1);
        let sender = self.inbound_sender.lock().await.clone()?;
        sender
            .send(InboundDelivery {
                subject: subject.into(),
                payload,
                ack,
            })
            .await
            .ok()?;
        Some(ack)
    }

    /// Queue a body that arrives the moment `subject` is subscribed
    pub async fn deliver_on_subscribe<S: Into<String>>(
        &self,
        subject: S,
        payload: Vec<u8>,
    ) -> AckToken {
        let ack = AckToken(self.next_ack.fetch_add(1, Ordering::SeqCst) + 1);
        self.pending_on_subscribe.lock().await.push(InboundDelivery {
            subject: subject.into(),
            payload,
            ack,
        });
        ack
    }

    pub async fn get_dropped(&self) -> Vec<InboundDelivery> {
        self.dropped.lock().await.clone()
    }

    async fn decoded_on<T: serde::de::DeserializeOwned>(&self, subject: &str) -> Vec<T> {
        self.published_messages
            .lock()
            .await
            .iter()
            .filter(|(topic, _)| topic == subject)
            .filter_map(|(_, body)| serde_json::from_slice(body).ok())
            .collect()
    }

    fn check_publish(&self) -> Result<(), MeshError> {
        if self.should_fail || self.fail_publishes.load(Ordering::SeqCst) {
            Err(MeshError::transport("Mock publish failure"))
        } else {
            Ok(())
        }
    }

    async fn record<T: serde::Serialize>(&self, subject: &str, body: &T) -> Result<(), MeshError> {
        self.check_publish()?;
        let bytes = serde_json::to_vec(body).map_err(|e| MeshError::internal(e.to_string()))?;
        self.published_messages
            .lock()
            .await
            .push((subject.to_string(), bytes));
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MeshError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail {
            Err(MeshError::transport("Mock connection failure"))
        } else {
            Ok(())
        }
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn publish_message(&self, subject: &str, message: &Message) -> Result<(), Self::Error> {
        self.record(subject, message).await
    }

    async fn publish_delivery(&self, record: &DeliveryRecord) -> Result<(), Self::Error> {
        self.record(DELIVERIES_SUBJECT, record).await
    }

    async fn publish_dead_letter(&self, letter: &DeadLetter) -> Result<(), Self::Error> {
        self.record(DEAD_LETTER_SUBJECT, letter).await
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        _retain: bool,
    ) -> Result<(), Self::Error> {
        self.check_publish()?;
        self.published_messages
            .lock()
            .await
            .push((subject.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&mut self, subject: &str) -> Result<(), Self::Error> {
        self.subscriptions.lock().await.push(subject.to_string());

        let arriving: Vec<InboundDelivery> = {
            let mut pending = self.pending_on_subscribe.lock().await;
            let (matching, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|d| d.subject == subject);
            *pending = rest;
            matching
        };
        let sender = self.inbound_sender.lock().await.clone();
        for delivery in arriving {
            match &sender {
                Some(sender) => {
                    if let Err(e) = sender.try_send(delivery) {
                        self.dropped.lock().await.push(e.into_inner());
                    }
                }
                None => self.dropped.lock().await.push(delivery),
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, token: AckToken) -> Result<(), Self::Error> {
        self.acknowledged.lock().await.push(token);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.should_fail
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.should_fail {
            Some(ConnectionState::Disconnected(
                "Mock disconnection".to_string(),
            ))
        } else {
            Some(ConnectionState::Connected)
        }
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundDelivery>) {
        if let Ok(mut inbound) = self.inbound_sender.try_lock() {
            *inbound = Some(sender);
        }
    }
}

/// Actor that always returns the same enrichment
#[derive(Debug, Clone)]
pub struct StaticActor {
    stage: Stage,
    enrichment: Enrichment,
}

impl StaticActor {
    pub fn new(stage: Stage, enrichment: Enrichment) -> Self {
        Self { stage, enrichment }
    }
}

#[async_trait]
impl Actor for StaticActor {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn process(&self, _message: &Message) -> Result<Enrichment, StageError> {
        Ok(self.enrichment.clone())
    }
}

#[derive(Debug, Clone)]
enum Flake {
    Sleep(Duration),
    Fail(StageError),
}

/// Actor that misbehaves for its first N calls, then succeeds
#[derive(Debug)]
pub struct FlakyActor {
    stage: Stage,
    failures: usize,
    flake: Flake,
    enrichment: Enrichment,
    calls: AtomicUsize,
}

impl FlakyActor {
    /// Sleeps past any reasonable stage timeout for the first `failures` calls
    pub fn timing_out(stage: Stage, failures: usize, delay: Duration) -> Self {
        Self {
            stage,
            failures,
            flake: Flake::Sleep(delay),
            enrichment: Enrichment::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns `error` for the first `failures` calls
    pub fn failing(stage: Stage, failures: usize, error: StageError) -> Self {
        Self {
            stage,
            failures,
            flake: Flake::Fail(error),
            enrichment: Enrichment::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Enrichment returned once the actor recovers
    pub fn then_enrich(mut self, enrichment: Enrichment) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Actor for FlakyActor {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn process(&self, _message: &Message) -> Result<Enrichment, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            match &self.flake {
                Flake::Sleep(delay) => tokio::time::sleep(*delay).await,
                Flake::Fail(error) => return Err(error.clone()),
            }
        }
        Ok(self.enrichment.clone())
    }
}

/// Mock LLM provider with scripted replies
#[derive(Debug)]
pub struct MockLlmProvider {
    pub responses: Vec<String>,
    pub should_fail: bool,
    calls: AtomicUsize,
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            responses: Vec::new(),
            should_fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a reply; replies cycle once exhausted
    pub fn with_response<S: Into<String>>(mut self, response: S) -> Self {
        self.responses.push(response.into());
        self
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Self::new()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail {
            return Err(LlmError::NetworkError("Mock LLM failure".to_string()));
        }

        let content = if self.responses.is_empty() {
            "Mock response".to_string()
        } else {
            self.responses[call % self.responses.len()].clone()
        };

        Ok(CompletionResponse {
            content: Some(content),
            model: request.model,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
            metadata: request.metadata,
        })
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        if self.should_fail {
            Err(LlmError::NetworkError(
                "Mock health check failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

/// Audit store kept in a vector
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    pub records: Arc<Mutex<Vec<DeliveryRecord>>>,
    pub transcript: Arc<Mutex<Vec<TranscriptEntry>>>,
    pub should_fail: bool,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_records(&self) -> Vec<DeliveryRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), AuditError> {
        if self.should_fail {
            return Err(AuditError::Unavailable("Mock audit failure".to_string()));
        }
        self.records.lock().await.push(record.clone());
        self.transcript
            .lock()
            .await
            .push(TranscriptEntry::outbound(record));
        Ok(())
    }

    async fn record_turn(&self, entry: &TranscriptEntry) -> Result<(), AuditError> {
        if self.should_fail {
            return Err(AuditError::Unavailable("Mock audit failure".to_string()));
        }
        self.transcript.lock().await.push(entry.clone());
        Ok(())
    }

    async fn transcript(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, AuditError> {
        Ok(self
            .transcript
            .lock()
            .await
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn records_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<DeliveryRecord>, AuditError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|record| record.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<(), AuditError> {
        if self.should_fail {
            Err(AuditError::Unavailable("Mock audit failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Session delivery that records what it was handed
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    pub delivered: Arc<Mutex<Vec<DeliveryRecord>>>,
    pub should_fail: bool,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_delivered(&self) -> Vec<DeliveryRecord> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl SessionDelivery for RecordingDelivery {
    async fn deliver(&self, record: &DeliveryRecord) -> Result<(), DeliveryError> {
        if self.should_fail {
            return Err(DeliveryError::Transport("Mock delivery failure".to_string()));
        }
        self.delivered.lock().await.push(record.clone());
        Ok(())
    }
}

/// Context store answering from a fixed table; unknown keys use the default outcome
#[derive(Debug, Clone)]
pub struct StaticContextStore {
    lookups: HashMap<String, ContextLookup>,
    default: ContextLookup,
}

impl StaticContextStore {
    pub fn new() -> Self {
        Self {
            lookups: HashMap::new(),
            default: ContextLookup::NotFound,
        }
    }

    pub fn with_context<K: Into<String>>(mut self, customer_key: K, context: Value) -> Self {
        self.lookups
            .insert(customer_key.into(), ContextLookup::Found(context));
        self
    }

    /// Every lookup fails
    pub fn unavailable() -> Self {
        Self {
            lookups: HashMap::new(),
            default: ContextLookup::Error("Mock context store unavailable".to_string()),
        }
    }
}

impl StaticContextStore {
    fn check_available(&self) -> Result<(), CacheError> {
        match &self.default {
            ContextLookup::Error(cause) => Err(CacheError::Unavailable(cause.clone())),
            _ => Ok(()),
        }
    }
}

impl Default for StaticContextStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextStore for StaticContextStore {
    async fn lookup(&self, customer_key: &str) -> ContextLookup {
        self.lookups
            .get(customer_key)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    async fn update(&self, _customer_key: &str, _updates: Value) -> Result<(), CacheError> {
        self.check_available()
    }

    async fn invalidate(&self, _customer_key: &str) -> Result<(), CacheError> {
        self.check_available()
    }
}

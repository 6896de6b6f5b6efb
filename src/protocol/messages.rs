//! Message types carried between stages
//!
//! A [`Message`] travels the bus as one JSON document: its identity, the
//! [`Route`] it is following, the accumulated [`MessagePayload`], and the
//! [`Metadata`] trail. Terminal records ([`DeliveryRecord`], [`DeadLetter`])
//! are defined here as well so every wire shape lives in one place.

use crate::error::{ErrorKind, StageError};
use crate::protocol::route::{Route, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Well-known payload keys
pub mod keys {
    pub const TEXT: &str = "text";
    pub const CUSTOMER_ID: &str = "customer_id";
    pub const VIP: &str = "vip";
    pub const SENTIMENT: &str = "sentiment";
    pub const SENTIMENT_SCORE: &str = "sentiment_score";
    pub const URGENT: &str = "urgent";
    pub const SAFETY_FLAG: &str = "safety_flag";
    pub const ESCALATION_REQUIRED: &str = "escalation_required";
    pub const INTENT: &str = "intent";
    pub const CONFIDENCE: &str = "confidence";
    pub const ACTIONABLE: &str = "actionable";
    pub const CUSTOMER_CONTEXT: &str = "customer_context";
    pub const CONTEXT_STATUS: &str = "context_status";
    pub const PRIORITY: &str = "priority";
    pub const EXECUTION_RESULT: &str = "execution_result";
    pub const DRAFT_RESPONSE: &str = "draft_response";
    pub const RESPONSE_SOURCE: &str = "response_source";
    pub const FINAL_RESPONSE: &str = "final_response";
    pub const VALIDATION_FLAGS: &str = "validation_flags";
    pub const HANDOFF_NOTICE: &str = "handoff_notice";
    pub const HANDOFF_REASON: &str = "handoff_reason";
    pub const FALLBACK_RESPONSE: &str = "fallback_response";
    pub const FALLBACK_REASON: &str = "fallback_reason";
}

/// Writer name used for keys set when a turn enters the mesh
pub const GATEWAY_WRITER: &str = "gateway";
/// Writer name used for keys set by the escalation path
pub const ESCALATION_WRITER: &str = "escalation";

/// Maximum routing trace entries kept in metadata
pub const MAX_ROUTING_TRACE: usize = 64;

/// Payload merge failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Key '{key}' is owned by '{owner}', refusing update from '{writer}'")]
    ForeignKey {
        key: String,
        owner: String,
        writer: String,
    },
}

/// New entries produced by one stage invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Enrichment(BTreeMap<String, Value>);

impl Enrichment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl IntoIterator for Enrichment {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Append-only enrichment map with per-key provenance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    values: BTreeMap<String, Value>,
    owners: BTreeMap<String, String>,
}

impl MessagePayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `enrichment` written by `writer`
    ///
    /// New keys are added. Keys already owned by `writer` are updated. Writing
    /// a different value to a key owned by someone else is rejected and leaves
    /// the payload untouched; rewriting the identical value is a no-op.
    pub fn merge(&mut self, writer: &str, enrichment: Enrichment) -> Result<(), PayloadError> {
        for (key, value) in enrichment.iter() {
            if let Some(owner) = self.owners.get(key) {
                if owner != writer && self.values.get(key) != Some(value) {
                    return Err(PayloadError::ForeignKey {
                        key: key.clone(),
                        owner: owner.clone(),
                        writer: writer.to_string(),
                    });
                }
            }
        }

        for (key, value) in enrichment {
            if self.owners.get(&key).is_some_and(|owner| owner != writer) {
                continue;
            }
            self.owners.insert(key.clone(), writer.to_string());
            self.values.insert(key, value);
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Writer that first set `key`
    pub fn owner(&self, key: &str) -> Option<&str> {
        self.owners.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    pub fn text(&self) -> &str {
        self.get_str(keys::TEXT).unwrap_or_default()
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.get_str(keys::CUSTOMER_ID)
    }

    /// Gateway hint or a VIP flag on the customer profile
    pub fn vip(&self) -> bool {
        self.get_bool(keys::VIP)
            || self
                .values
                .get(keys::CUSTOMER_CONTEXT)
                .and_then(|ctx| ctx.get("vip"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    pub fn urgent(&self) -> bool {
        self.get_bool(keys::URGENT)
    }

    pub fn safety_flag(&self) -> bool {
        self.get_bool(keys::SAFETY_FLAG)
    }

    pub fn escalation_required(&self) -> bool {
        self.get_bool(keys::ESCALATION_REQUIRED)
    }

    pub fn intent(&self) -> Option<&str> {
        self.get_str(keys::INTENT)
    }

    pub fn confidence(&self) -> Option<f64> {
        self.get_f64(keys::CONFIDENCE)
    }

    pub fn actionable(&self) -> bool {
        self.get_bool(keys::ACTIONABLE)
    }

    pub fn sentiment(&self) -> Option<&str> {
        self.get_str(keys::SENTIMENT)
    }
}

/// Terminal escalation outcome, or the transient retry state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationState {
    Retry,
    Fallback,
    HumanHandoff,
}

impl EscalationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationState::Retry => "retry",
            EscalationState::Fallback => "fallback",
            EscalationState::HumanHandoff => "human_handoff",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EscalationState::Retry)
    }
}

/// Last failure seen by the message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub cause: String,
    pub retryable: bool,
    pub at: DateTime<Utc>,
}

impl From<&StageError> for ErrorRecord {
    fn from(error: &StageError) -> Self {
        Self {
            stage: error.stage,
            kind: error.kind,
            cause: error.cause.clone(),
            retryable: error.retryable,
            at: Utc::now(),
        }
    }
}

/// Single routing decision recorded for observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingStep {
    /// Stage that made the decision
    pub from: Stage,
    /// Next stage, `None` when the route completed
    pub to: Option<Stage>,
    /// Rule or escalation state that produced the hop
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Sequential step number, keeps counting after old entries are dropped
    pub step_number: u32,
}

/// Trail carried by every message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub hop_count: u32,
    #[serde(default)]
    pub retry_count: BTreeMap<Stage, u32>,
    #[serde(default)]
    pub clarification_count: u32,
    #[serde(default)]
    pub last_error: Option<ErrorRecord>,
    #[serde(default)]
    pub escalation: Option<EscalationState>,
    #[serde(default)]
    pub routing_trace: Vec<RoutingStep>,
}

impl Metadata {
    pub fn new<S: Into<String>>(session_id: S) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            created_at: now,
            updated_at: now,
            hop_count: 0,
            retry_count: BTreeMap::new(),
            clarification_count: 0,
            last_error: None,
            escalation: None,
            routing_trace: Vec::new(),
        }
    }

    pub fn retries_for(&self, stage: Stage) -> u32 {
        self.retry_count.get(&stage).copied().unwrap_or(0)
    }

    /// Whether the message already reached Fallback or HumanHandoff
    pub fn is_escalated(&self) -> bool {
        self.escalation.is_some_and(|state| state.is_terminal())
    }

    /// Append a trace step, keeping only the most recent entries
    pub fn record_step<S: Into<String>>(&mut self, from: Stage, to: Option<Stage>, reason: S) {
        let step_number = self
            .routing_trace
            .last()
            .map(|step| step.step_number + 1)
            .unwrap_or(1);
        let now = Utc::now();
        self.routing_trace.push(RoutingStep {
            from,
            to,
            reason: reason.into(),
            timestamp: now,
            step_number,
        });
        if self.routing_trace.len() > MAX_ROUTING_TRACE {
            let excess = self.routing_trace.len() - MAX_ROUTING_TRACE;
            self.routing_trace.drain(..excess);
        }
        self.updated_at = now;
    }
}

/// One conversation turn in flight
///
/// # Examples
/// ```
/// use support_mesh::protocol::{Message, Stage};
///
/// let message = Message::new("session-1", "Where is my order?");
/// assert_eq!(message.current_stage(), Some(Stage::Sentiment));
/// assert_eq!(message.payload.text(), "Where is my order?");
///
/// let json = serde_json::to_string(&message).unwrap();
/// let back: Message = serde_json::from_str(&json).unwrap();
/// assert_eq!(back, message);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub route: Route,
    pub payload: MessagePayload,
    pub metadata: Metadata,
}

impl Message {
    /// New turn on the full processing pipeline
    pub fn new<S: Into<String>, T: Into<String>>(session_id: S, text: T) -> Self {
        let mut payload = MessagePayload::new();
        // A fresh payload has no owners, merge cannot fail
        let _ = payload.merge(
            GATEWAY_WRITER,
            Enrichment::new().with(keys::TEXT, text.into()),
        );
        Self {
            id: Uuid::new_v4(),
            route: Route::full_pipeline(),
            payload,
            metadata: Metadata::new(session_id),
        }
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.route.current()
    }

    pub fn session_id(&self) -> &str {
        &self.metadata.session_id
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Merge enrichment, returning the next value
    pub fn with_enrichment(
        mut self,
        writer: &str,
        enrichment: Enrichment,
    ) -> Result<Self, PayloadError> {
        self.payload.merge(writer, enrichment)?;
        Ok(self)
    }
}

/// How the turn was ultimately answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutedTo {
    Pipeline,
    Fallback,
    HumanHandoff,
}

impl RoutedTo {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutedTo::Pipeline => "pipeline",
            RoutedTo::Fallback => "fallback",
            RoutedTo::HumanHandoff => "human_handoff",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Undelivered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Undelivered => "undelivered",
        }
    }
}

/// Final answer for a turn, persisted and pushed to the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub session_id: String,
    pub message_id: Uuid,
    pub response_text: String,
    pub routed_to: RoutedTo,
    pub urgency: bool,
    pub sentiment: Option<String>,
    pub intent: Option<String>,
    pub confidence: Option<f64>,
    pub stages_visited: Vec<Stage>,
    pub metadata: Metadata,
    pub delivery_status: DeliveryStatus,
    pub delivered_at: DateTime<Utc>,
}

/// Reason a body was parked on the dead-letter subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterCode {
    InvalidRoute,
    MisroutedMessage,
    MalformedMessage,
}

/// Body that could not be processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: Option<Uuid>,
    pub session_id: Option<String>,
    /// Stage that gave up on the body
    pub stage: Option<Stage>,
    pub code: DeadLetterCode,
    pub reason: String,
    pub body: Value,
    pub timestamp: DateTime<Utc>,
}

//! Terminal sink: turns a finished message into the customer's answer
//!
//! Every route ends here. The aggregator picks the response text for the path
//! the message took, pushes it toward the live session, then persists the
//! delivery record. Persistence never blocks delivery and a failed delivery is
//! still recorded.

use super::contract::HopOutcome;
use super::runtime::publish_outcome;
use crate::error::MeshError;
use crate::gateway::SessionDelivery;
use crate::observability::metrics::metrics;
use crate::protocol::{
    keys, DeadLetter, DeliveryRecord, DeliveryStatus, EscalationState, Message, RoutedTo, Stage,
};
use crate::services::audit::AuditStore;
use crate::transport::Transport;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

/// Sent when no stage produced any text
pub const DEFAULT_ACKNOWLEDGEMENT: &str =
    "Thanks for contacting us. We've received your message and will follow up shortly.";

/// Sent on the handoff path when the handoff stage wrote no notice
pub const DEFAULT_HANDOFF_NOTICE: &str =
    "A member of our support team will take it from here and reply shortly.";

#[derive(Debug, Clone, PartialEq)]
pub enum AggregationOutcome {
    Delivered(DeliveryRecord),
    DeadLettered(DeadLetter),
}

pub struct ResponseAggregator<A: AuditStore, D: SessionDelivery, T: Transport> {
    audit: Arc<A>,
    delivery: Arc<D>,
    transport: Arc<T>,
}

impl<A: AuditStore, D: SessionDelivery, T: Transport> ResponseAggregator<A, D, T> {
    pub fn new(audit: Arc<A>, delivery: Arc<D>, transport: Arc<T>) -> Self {
        Self {
            audit,
            delivery,
            transport,
        }
    }

    /// Deliver and record one finished message
    ///
    /// `Err` only when a misrouted message could not be dead-lettered.
    pub async fn process(&self, message: Message) -> Result<AggregationOutcome, MeshError> {
        let span = crate::hop_span!(
            stage = Stage::Aggregator.as_str(),
            message_id = %message.id,
            session_id = %message.session_id(),
            hop = message.metadata.hop_count,
        );

        async move {
            if message.current_stage() != Some(Stage::Aggregator) {
                let error = MeshError::misrouted(Stage::Aggregator, message.current_stage());
                warn!(error = %error, "Rejecting misrouted message");
                let letter = error.to_dead_letter(
                    Some(Stage::Aggregator),
                    Some(message.id),
                    Some(message.session_id().to_string()),
                    serde_json::to_value(&message).unwrap_or(serde_json::Value::Null),
                );
                publish_outcome(self.transport.as_ref(), &HopOutcome::DeadLetter(letter.clone()))
                    .await?;
                return Ok(AggregationOutcome::DeadLettered(letter));
            }

            let mut record = build_record(&message);

            match self.delivery.deliver(&record).await {
                Ok(()) => metrics().delivery_completed(record.routed_to),
                Err(e) => {
                    warn!(error = %e, "Session delivery failed, recording as undelivered");
                    metrics().delivery_failed();
                    record.delivery_status = DeliveryStatus::Undelivered;
                }
            }

            if let Err(e) = self.audit.record_delivery(&record).await {
                error!(error = %e, "Failed to persist delivery record");
                metrics().persistence_failed();
            }

            info!(
                routed_to = record.routed_to.as_str(),
                status = record.delivery_status.as_str(),
                stages = record.stages_visited.len(),
                "Turn completed"
            );
            Ok(AggregationOutcome::Delivered(record))
        }
        .instrument(span)
        .await
    }
}

/// Which terminal path a message took
pub fn routed_to(message: &Message) -> RoutedTo {
    match message.metadata.escalation {
        _ if message.route.has_visited(Stage::HumanHandoff) => RoutedTo::HumanHandoff,
        Some(EscalationState::HumanHandoff) => RoutedTo::HumanHandoff,
        Some(EscalationState::Fallback) => RoutedTo::Fallback,
        _ => RoutedTo::Pipeline,
    }
}

/// Text the customer receives for this path
pub fn response_text(message: &Message, routed_to: RoutedTo) -> String {
    let payload = &message.payload;
    let non_empty = |key: &str| payload.get_str(key).filter(|text| !text.trim().is_empty());

    if let Some(notice) = non_empty(keys::HANDOFF_NOTICE) {
        return notice.to_string();
    }
    if let Some(fallback) = non_empty(keys::FALLBACK_RESPONSE) {
        return fallback.to_string();
    }
    if routed_to == RoutedTo::HumanHandoff {
        return DEFAULT_HANDOFF_NOTICE.to_string();
    }
    non_empty(keys::FINAL_RESPONSE)
        .or_else(|| non_empty(keys::DRAFT_RESPONSE))
        .unwrap_or(DEFAULT_ACKNOWLEDGEMENT)
        .to_string()
}

/// Delivery record for a finished message (pure function)
pub fn build_record(message: &Message) -> DeliveryRecord {
    let routed_to = routed_to(message);
    let payload = &message.payload;

    DeliveryRecord {
        session_id: message.session_id().to_string(),
        message_id: message.id,
        response_text: response_text(message, routed_to),
        routed_to,
        urgency: payload.urgent(),
        sentiment: payload.sentiment().map(str::to_string),
        intent: payload.intent().map(str::to_string),
        confidence: payload.confidence(),
        stages_visited: message.route.visited().to_vec(),
        metadata: message.metadata.clone(),
        delivery_status: DeliveryStatus::Delivered,
        delivered_at: Utc::now(),
    }
}

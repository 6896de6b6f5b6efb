//! Prepares the turn for a human agent

use crate::actor::Actor;
use crate::error::StageError;
use crate::protocol::{keys, Enrichment, Message, Stage};
use async_trait::async_trait;

pub const HANDOFF_NOTICE: &str =
    "I'm connecting you with a member of our support team. They'll pick up right where we left off.";

pub const URGENT_HANDOFF_NOTICE: &str =
    "Your request has been marked urgent and a member of our support team is taking over now.";

#[derive(Debug, Default)]
pub struct HandoffActor;

impl HandoffActor {
    /// Why the turn left the automated path
    pub fn reason(message: &Message) -> String {
        let payload = &message.payload;
        if payload.safety_flag() {
            "safety".to_string()
        } else if payload.escalation_required() {
            "customer_request".to_string()
        } else if payload.urgent() {
            "urgent".to_string()
        } else if let Some(error) = &message.metadata.last_error {
            format!("stage_failure:{}", error.stage)
        } else {
            "escalated".to_string()
        }
    }
}

#[async_trait]
impl Actor for HandoffActor {
    fn stage(&self) -> Stage {
        Stage::HumanHandoff
    }

    async fn process(&self, message: &Message) -> Result<Enrichment, StageError> {
        let notice = if message.payload.urgent() {
            URGENT_HANDOFF_NOTICE
        } else {
            HANDOFF_NOTICE
        };
        Ok(Enrichment::new()
            .with(keys::HANDOFF_NOTICE, notice)
            .with(keys::HANDOFF_REASON, Self::reason(message)))
    }
}

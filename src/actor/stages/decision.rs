//! The decision stage: assigns a handling priority
//!
//! Routing itself happens in the runtime after every stage; this stage only
//! records how pressing the turn is.

use crate::actor::Actor;
use crate::error::StageError;
use crate::protocol::{keys, Enrichment, Message, MessagePayload, Stage};
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct DecisionActor;

impl DecisionActor {
    pub fn priority(payload: &MessagePayload) -> &'static str {
        if payload.urgent() || payload.safety_flag() {
            "high"
        } else if payload.vip() || payload.sentiment() == Some("negative") {
            "elevated"
        } else if payload.sentiment() == Some("positive") {
            "low"
        } else {
            "normal"
        }
    }
}

#[async_trait]
impl Actor for DecisionActor {
    fn stage(&self) -> Stage {
        Stage::Decision
    }

    async fn process(&self, message: &Message) -> Result<Enrichment, StageError> {
        Ok(Enrichment::new().with(keys::PRIORITY, Self::priority(&message.payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(writer: &str, enrichment: Enrichment) -> MessagePayload {
        let mut payload = MessagePayload::new();
        payload.merge(writer, enrichment).unwrap();
        payload
    }

    #[test]
    fn test_priorities() {
        assert_eq!(DecisionActor::priority(&MessagePayload::new()), "normal");
        assert_eq!(
            DecisionActor::priority(&payload("sentiment", Enrichment::new().with(keys::URGENT, true))),
            "high"
        );
        assert_eq!(
            DecisionActor::priority(&payload(
                "sentiment",
                Enrichment::new().with(keys::SENTIMENT, "negative")
            )),
            "elevated"
        );
        assert_eq!(
            DecisionActor::priority(&payload(
                "sentiment",
                Enrichment::new().with(keys::SENTIMENT, "positive")
            )),
            "low"
        );
    }
}

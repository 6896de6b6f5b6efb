//! Keyword intent classifier

use crate::actor::Actor;
use crate::config::RoutingSection;
use crate::error::StageError;
use crate::protocol::{keys, Enrichment, Message, Stage};
use async_trait::async_trait;

pub const GENERAL_INTENT: &str = "general";

/// Intents in priority order; the first intent wins a tie
const INTENT_KEYWORDS: [(&str, &[&str]); 8] = [
    ("refund", &["refund", "money back", "reimburse", "chargeback"]),
    ("cancel_order", &["cancel"]),
    (
        "order_update",
        &["change my order", "update my order", "change the address", "modify my order"],
    ),
    (
        "order_status",
        &["where is my order", "tracking", "track my", "hasn't arrived", "not arrived"],
    ),
    ("billing", &["charged", "invoice", "billing", "payment", "overcharged"]),
    ("shipping", &["shipping", "delivery", "package", "courier"]),
    (
        "technical",
        &["error", "bug", "crash", "not working", "can't log", "cannot log"],
    ),
    ("account", &["password", "account", "login", "username"]),
];

const CONFIDENCE_NONE: f64 = 0.3;
const CONFIDENCE_AMBIGUOUS: f64 = 0.6;
const CONFIDENCE_SINGLE: f64 = 0.75;
const CONFIDENCE_STRONG: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: &'static str,
    pub confidence: f64,
}

pub struct IntentActor {
    actionable_intents: Vec<String>,
}

impl IntentActor {
    pub fn new(actionable_intents: Vec<String>) -> Self {
        Self { actionable_intents }
    }

    pub fn from_config(section: &RoutingSection) -> Self {
        Self::new(section.actionable_intents.clone())
    }

    /// Classify a customer message (pure function)
    pub fn classify(text: &str) -> Classification {
        let lower = text.to_lowercase();
        let mut scores: Vec<(&'static str, usize)> = INTENT_KEYWORDS
            .iter()
            .map(|(intent, terms)| {
                (
                    *intent,
                    terms.iter().filter(|term| lower.contains(*term)).count(),
                )
            })
            .filter(|(_, hits)| *hits > 0)
            .collect();
        // Stable sort keeps table order among equal scores
        scores.sort_by(|a, b| b.1.cmp(&a.1));

        match scores.as_slice() {
            [] => Classification {
                intent: GENERAL_INTENT,
                confidence: CONFIDENCE_NONE,
            },
            [(intent, best), (_, second), ..] if best == second => Classification {
                intent: *intent,
                confidence: CONFIDENCE_AMBIGUOUS,
            },
            [(intent, best), ..] => Classification {
                intent: *intent,
                confidence: if *best > 1 {
                    CONFIDENCE_STRONG
                } else {
                    CONFIDENCE_SINGLE
                },
            },
        }
    }
}

#[async_trait]
impl Actor for IntentActor {
    fn stage(&self) -> Stage {
        Stage::Intent
    }

    async fn process(&self, message: &Message) -> Result<Enrichment, StageError> {
        let text = message.payload.text();
        if text.trim().is_empty() {
            return Err(StageError::invalid_input(Stage::Intent, "message text is empty"));
        }

        let classification = Self::classify(text);
        let actionable = self
            .actionable_intents
            .iter()
            .any(|intent| intent == classification.intent);

        Ok(Enrichment::new()
            .with(keys::INTENT, classification.intent)
            .with(keys::CONFIDENCE, classification.confidence)
            .with(keys::ACTIONABLE, actionable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_keyword() {
        let c = IntentActor::classify("URGENT refund now!!");
        assert_eq!(c.intent, "refund");
        assert_eq!(c.confidence, CONFIDENCE_SINGLE);
    }

    #[test]
    fn test_strong_match() {
        let c = IntentActor::classify("I want a refund, please give my money back");
        assert_eq!(c.intent, "refund");
        assert_eq!(c.confidence, CONFIDENCE_STRONG);
    }

    #[test]
    fn test_tie_is_ambiguous_and_keeps_table_order() {
        let c = IntentActor::classify("cancel and refund");
        assert_eq!(c.intent, "refund");
        assert_eq!(c.confidence, CONFIDENCE_AMBIGUOUS);
    }

    #[test]
    fn test_no_match_is_low_confidence() {
        let c = IntentActor::classify("hmm");
        assert_eq!(c.intent, GENERAL_INTENT);
        assert!(c.confidence < RoutingSection::default().low_confidence);
    }

    #[tokio::test]
    async fn test_actionable_flag_follows_config() {
        let actor = IntentActor::from_config(&RoutingSection::default());

        let refund = actor
            .process(&Message::new("s", "refund my order"))
            .await
            .unwrap();
        assert_eq!(refund.get(keys::ACTIONABLE), Some(&serde_json::Value::from(true)));

        let status = actor
            .process(&Message::new("s", "where is my order"))
            .await
            .unwrap();
        assert_eq!(status.get(keys::ACTIONABLE), Some(&serde_json::Value::from(false)));
    }

    #[tokio::test]
    async fn test_empty_text_is_invalid_input() {
        let actor = IntentActor::new(Vec::new());
        let err = actor.process(&Message::new("s", "   ")).await.unwrap_err();
        assert!(!err.retryable);
    }
}

//! Final checks on the draft before it reaches the customer

use crate::actor::Actor;
use crate::error::StageError;
use crate::protocol::{keys, Enrichment, Message, MessagePayload, Stage};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const MAX_RESPONSE_CHARS: usize = 1200;

static CARD_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d[ -]?){12,15}\d\b").expect("card pattern is valid")
});

static NATIONAL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("id pattern is valid"));

static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern is valid")
});

/// Commitments only allowed once the action service confirmed an action
const PROMISE_PHRASES: [&str; 5] = [
    "guarantee",
    "full refund",
    "we will refund",
    "free of charge",
    "compensation",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Review {
    pub final_response: String,
    pub flags: Vec<&'static str>,
}

#[derive(Debug, Default)]
pub struct GuardrailsActor;

impl GuardrailsActor {
    /// Check a draft against the payload it answers (pure function)
    pub fn review(draft: &str, payload: &MessagePayload) -> Result<Review, String> {
        let draft = draft.trim();
        if draft.is_empty() {
            return Err("draft response is empty".to_string());
        }

        let mut flags = Vec::new();
        let lower = draft.to_lowercase();
        if !action_confirmed(payload) && PROMISE_PHRASES.iter().any(|p| lower.contains(p)) {
            return Err("draft makes a commitment no action confirmed".to_string());
        }

        let mut text = draft.to_string();
        for pattern in [&*CARD_NUMBER, &*NATIONAL_ID, &*EMAIL] {
            if pattern.is_match(&text) {
                text = pattern.replace_all(&text, "[redacted]").into_owned();
                if !flags.contains(&"redacted") {
                    flags.push("redacted");
                }
            }
        }

        if text.chars().count() > MAX_RESPONSE_CHARS {
            text = text.chars().take(MAX_RESPONSE_CHARS).collect();
            flags.push("truncated");
        }

        Ok(Review {
            final_response: text,
            flags,
        })
    }
}

fn action_confirmed(payload: &MessagePayload) -> bool {
    payload
        .get(keys::EXECUTION_RESULT)
        .and_then(|result| result.get("status"))
        .and_then(Value::as_str)
        .is_some_and(|status| status != "skipped")
}

#[async_trait]
impl Actor for GuardrailsActor {
    fn stage(&self) -> Stage {
        Stage::Guardrails
    }

    async fn process(&self, message: &Message) -> Result<Enrichment, StageError> {
        let draft = message
            .payload
            .get_str(keys::DRAFT_RESPONSE)
            .unwrap_or_default();

        let review = Self::review(draft, &message.payload)
            .map_err(|cause| StageError::policy(Stage::Guardrails, cause))?;

        Ok(Enrichment::new()
            .with(keys::FINAL_RESPONSE, review.final_response)
            .with(keys::VALIDATION_FLAGS, review.flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn payload_with_execution(status: &str) -> MessagePayload {
        let mut payload = MessagePayload::new();
        payload
            .merge(
                "execution",
                Enrichment::new().with(keys::EXECUTION_RESULT, json!({"status": status})),
            )
            .unwrap();
        payload
    }

    #[test]
    fn test_clean_draft_passes() {
        let review = GuardrailsActor::review("  Your parcel ships tomorrow. ", &MessagePayload::new())
            .unwrap();
        assert_eq!(review.final_response, "Your parcel ships tomorrow.");
        assert!(review.flags.is_empty());
    }

    #[test]
    fn test_sensitive_data_is_redacted() {
        let review = GuardrailsActor::review(
            "We charged 4111 1111 1111 1111 and emailed jane@example.com",
            &MessagePayload::new(),
        )
        .unwrap();
        assert!(!review.final_response.contains("4111"));
        assert!(!review.final_response.contains("jane@example.com"));
        assert_eq!(review.flags, vec!["redacted"]);
    }

    #[test]
    fn test_order_numbers_survive() {
        let review =
            GuardrailsActor::review("Order 123456 is on its way", &MessagePayload::new()).unwrap();
        assert_eq!(review.final_response, "Order 123456 is on its way");
    }

    #[test]
    fn test_long_draft_is_truncated() {
        let draft = "a".repeat(MAX_RESPONSE_CHARS + 50);
        let review = GuardrailsActor::review(&draft, &MessagePayload::new()).unwrap();
        assert_eq!(review.final_response.chars().count(), MAX_RESPONSE_CHARS);
        assert_eq!(review.flags, vec!["truncated"]);
    }

    #[test]
    fn test_promise_requires_confirmed_action() {
        let draft = "You will get a full refund today.";
        assert!(GuardrailsActor::review(draft, &MessagePayload::new()).is_err());
        assert!(GuardrailsActor::review(draft, &payload_with_execution("skipped")).is_err());
        assert!(GuardrailsActor::review(draft, &payload_with_execution("accepted")).is_ok());
    }

    #[tokio::test]
    async fn test_missing_draft_is_policy_failure() {
        let err = GuardrailsActor
            .process(&Message::new("s", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Policy);
        assert!(!err.retryable);
    }
}

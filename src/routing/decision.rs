//! Decision Router
//!
//! Consulted after a stage succeeds. It reads the routing signals the stages
//! have written into the payload and returns the next [`Route`], rewriting the
//! remaining path when a rule applies. Rules are evaluated in order and the
//! first match wins:
//!
//! ```text
//! 1. SafetyHandoff        safety flag, explicit request, or urgent non-VIP
//!                         -> [human_handoff, aggregator]
//! 2. VipFastTrack         VIP with high confidence -> skip decision (and
//!                         context when already known)
//! 3. Clarify              low confidence at intent -> one more intent hop,
//!                         or escalate once clarifications run out
//! 4. ActionableExecution  actionable intent without a result -> execution
//!                         before response
//! 5. Sequential           plain advance
//! ```
//!
//! The router is a pure function of the message and its policy; the same input
//! always produces the same decision.

use crate::config::RoutingSection;
use crate::error::StageError;
use crate::protocol::messages::{keys, Message};
use crate::protocol::route::{Route, RouteError, Stage};
use serde::{Deserialize, Serialize};

/// Thresholds and lists the router consults
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPolicy {
    pub high_confidence: f64,
    pub low_confidence: f64,
    pub max_clarifications: u32,
    pub actionable_intents: Vec<String>,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::from(&RoutingSection::default())
    }
}

impl From<&RoutingSection> for DecisionPolicy {
    fn from(section: &RoutingSection) -> Self {
        Self {
            high_confidence: section.high_confidence,
            low_confidence: section.low_confidence,
            max_clarifications: section.max_clarifications,
            actionable_intents: section.actionable_intents.clone(),
        }
    }
}

/// Rule that produced a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    SafetyHandoff,
    VipFastTrack,
    Clarify,
    ActionableExecution,
    Sequential,
    /// Router not consulted: terminal stage or escalated message
    Passthrough,
}

impl DecisionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionRule::SafetyHandoff => "safety_handoff",
            DecisionRule::VipFastTrack => "vip_fast_track",
            DecisionRule::Clarify => "clarify",
            DecisionRule::ActionableExecution => "actionable_execution",
            DecisionRule::Sequential => "sequential",
            DecisionRule::Passthrough => "passthrough",
        }
    }
}

/// Outcome of consulting the router
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Proceed { route: Route, rule: DecisionRule },
    /// Continue through the escalation path instead
    Escalate(StageError),
}

#[derive(Debug, Clone, Default)]
pub struct DecisionRouter {
    policy: DecisionPolicy,
}

impl DecisionRouter {
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    /// Compute the next route for a message whose current stage just succeeded
    pub fn decide(&self, message: &Message) -> Result<Decision, RouteError> {
        let route = &message.route;
        let current = match route.current() {
            Some(stage) => stage,
            None => {
                return Ok(Decision::Proceed {
                    route: route.advance(),
                    rule: DecisionRule::Passthrough,
                })
            }
        };

        if matches!(current, Stage::HumanHandoff | Stage::Aggregator)
            || message.metadata.is_escalated()
        {
            return Ok(Decision::Proceed {
                route: route.advance(),
                rule: DecisionRule::Passthrough,
            });
        }

        if let Some(decision) = self.safety_handoff(message)? {
            return Ok(decision);
        }
        if let Some(decision) = self.vip_fast_track(message)? {
            return Ok(decision);
        }
        if let Some(decision) = self.clarify(message, current)? {
            return Ok(decision);
        }
        if let Some(decision) = self.actionable_execution(message, current)? {
            return Ok(decision);
        }

        Ok(Decision::Proceed {
            route: route.advance(),
            rule: DecisionRule::Sequential,
        })
    }

    fn is_actionable(&self, message: &Message) -> bool {
        message.payload.actionable()
            || message
                .payload
                .intent()
                .is_some_and(|intent| self.policy.actionable_intents.iter().any(|a| a == intent))
    }

    fn needs_execution(&self, message: &Message) -> bool {
        self.is_actionable(message) && !message.payload.contains(keys::EXECUTION_RESULT)
    }

    fn safety_handoff(&self, message: &Message) -> Result<Option<Decision>, RouteError> {
        let payload = &message.payload;
        let triggered = payload.safety_flag()
            || payload.escalation_required()
            || (payload.urgent() && !payload.vip());
        if !triggered {
            return Ok(None);
        }

        let route = &message.route;
        let next = if route.remaining().first() == Some(&Stage::HumanHandoff) {
            route.advance()
        } else {
            route.with_remaining(vec![Stage::HumanHandoff, Stage::Aggregator])?
        };
        Ok(Some(Decision::Proceed {
            route: next,
            rule: DecisionRule::SafetyHandoff,
        }))
    }

    fn vip_fast_track(&self, message: &Message) -> Result<Option<Decision>, RouteError> {
        let payload = &message.payload;
        let confident = payload
            .confidence()
            .is_some_and(|c| c >= self.policy.high_confidence);
        if !payload.vip() || !confident {
            return Ok(None);
        }

        let remaining = message.route.remaining();
        let context_known = payload.contains(keys::CUSTOMER_CONTEXT);
        let mut tail: Vec<Stage> = remaining
            .iter()
            .copied()
            .filter(|stage| match stage {
                Stage::Decision => false,
                Stage::Context => !context_known,
                _ => true,
            })
            .collect();
        if self.needs_execution(message) && !tail.contains(&Stage::Execution) {
            tail = insert_before_response(tail);
        }

        if tail == remaining {
            return Ok(None);
        }
        Ok(Some(Decision::Proceed {
            route: message.route.with_remaining(tail)?,
            rule: DecisionRule::VipFastTrack,
        }))
    }

    fn clarify(&self, message: &Message, current: Stage) -> Result<Option<Decision>, RouteError> {
        if current != Stage::Intent {
            return Ok(None);
        }
        let confidence = message.payload.confidence().unwrap_or(0.0);
        if confidence >= self.policy.low_confidence {
            return Ok(None);
        }

        if message.metadata.clarification_count < self.policy.max_clarifications {
            let mut tail = vec![Stage::Intent];
            tail.extend_from_slice(message.route.remaining());
            return Ok(Some(Decision::Proceed {
                route: message.route.with_remaining(tail)?,
                rule: DecisionRule::Clarify,
            }));
        }

        Ok(Some(Decision::Escalate(StageError::low_confidence(
            Stage::Intent,
            confidence,
            self.policy.low_confidence,
        ))))
    }

    fn actionable_execution(
        &self,
        message: &Message,
        current: Stage,
    ) -> Result<Option<Decision>, RouteError> {
        let remaining = message.route.remaining();
        if current == Stage::Execution
            || !self.needs_execution(message)
            || remaining.contains(&Stage::Execution)
            || !remaining.contains(&Stage::Response)
        {
            return Ok(None);
        }

        let tail = insert_before_response(remaining.to_vec());
        Ok(Some(Decision::Proceed {
            route: message.route.with_remaining(tail)?,
            rule: DecisionRule::ActionableExecution,
        }))
    }
}

/// Place an execution hop ahead of the response stage, if one is planned
fn insert_before_response(mut tail: Vec<Stage>) -> Vec<Stage> {
    if let Some(position) = tail.iter().position(|s| *s == Stage::Response) {
        tail.insert(position, Stage::Execution);
    }
    tail
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{EscalationState, Enrichment};
    use proptest::prelude::*;
    use serde_json::json;

    fn at_stage(stage: Stage) -> Message {
        let mut route = Route::full_pipeline();
        while route.current() != Some(stage) {
            route = route.advance();
        }
        Message::new("session", "text").with_route(route)
    }

    fn enrich(message: Message, writer: &str, enrichment: Enrichment) -> Message {
        message.with_enrichment(writer, enrichment).unwrap()
    }

    fn proceed(decision: Decision) -> (Route, DecisionRule) {
        match decision {
            Decision::Proceed { route, rule } => (route, rule),
            Decision::Escalate(e) => panic!("unexpected escalation: {e}"),
        }
    }

    #[test]
    fn test_plain_message_advances_sequentially() {
        let router = DecisionRouter::default();
        let message = at_stage(Stage::Sentiment);

        let (route, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::Sequential);
        assert_eq!(route.current(), Some(Stage::Intent));
    }

    #[test]
    fn test_urgent_non_vip_jumps_to_handoff() {
        let router = DecisionRouter::default();
        let message = enrich(
            at_stage(Stage::Sentiment),
            "sentiment",
            Enrichment::new().with(keys::URGENT, true),
        );

        let (route, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::SafetyHandoff);
        assert_eq!(route.current(), Some(Stage::HumanHandoff));
        assert_eq!(route.remaining(), &[Stage::Aggregator]);
        assert_eq!(route.visited(), &[Stage::Sentiment, Stage::HumanHandoff]);
    }

    #[test]
    fn test_urgent_vip_is_not_handed_off() {
        let router = DecisionRouter::default();
        let message = enrich(
            enrich(
                at_stage(Stage::Sentiment),
                "gateway",
                Enrichment::new().with(keys::VIP, true),
            ),
            "sentiment",
            Enrichment::new().with(keys::URGENT, true),
        );

        let (_, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::Sequential);
    }

    #[test]
    fn test_safety_flag_hands_off_even_for_vip() {
        let router = DecisionRouter::default();
        let message = enrich(
            enrich(
                at_stage(Stage::Intent),
                "gateway",
                Enrichment::new().with(keys::VIP, true),
            ),
            "sentiment",
            Enrichment::new().with(keys::SAFETY_FLAG, true),
        );

        let (route, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::SafetyHandoff);
        assert_eq!(route.current(), Some(Stage::HumanHandoff));
    }

    #[test]
    fn test_safety_handoff_is_idempotent_when_already_planned() {
        let router = DecisionRouter::default();
        let planned = Route::new(
            vec![Stage::Sentiment, Stage::Intent, Stage::HumanHandoff, Stage::Aggregator],
            1,
        )
        .unwrap();
        let message = enrich(
            Message::new("session", "text").with_route(planned),
            "sentiment",
            Enrichment::new().with(keys::ESCALATION_REQUIRED, true),
        );

        let (route, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::SafetyHandoff);
        assert_eq!(route, message.route.advance());
    }

    #[test]
    fn test_vip_high_confidence_skips_decision() {
        let router = DecisionRouter::default();
        let message = enrich(
            enrich(
                at_stage(Stage::Intent),
                "gateway",
                Enrichment::new().with(keys::VIP, true),
            ),
            "intent",
            Enrichment::new()
                .with(keys::INTENT, "order_status")
                .with(keys::CONFIDENCE, 0.9),
        );

        let (route, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::VipFastTrack);
        assert_eq!(
            route.stages()[route.cursor()..].to_vec(),
            vec![Stage::Context, Stage::Response, Stage::Guardrails, Stage::Aggregator]
        );
    }

    #[test]
    fn test_vip_fast_track_skips_context_when_known_and_keeps_execution() {
        let router = DecisionRouter::default();
        let message = enrich(
            enrich(
                at_stage(Stage::Intent),
                "context",
                Enrichment::new().with(keys::CUSTOMER_CONTEXT, json!({"vip": true})),
            ),
            "intent",
            Enrichment::new()
                .with(keys::INTENT, "refund")
                .with(keys::CONFIDENCE, 0.95)
                .with(keys::ACTIONABLE, true),
        );

        let (route, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::VipFastTrack);
        assert_eq!(
            route.stages()[route.cursor()..].to_vec(),
            vec![Stage::Execution, Stage::Response, Stage::Guardrails, Stage::Aggregator]
        );
    }

    #[test]
    fn test_vip_fast_track_only_matches_when_route_changes() {
        let router = DecisionRouter::default();
        let message = enrich(
            enrich(
                at_stage(Stage::Response),
                "gateway",
                Enrichment::new().with(keys::VIP, true),
            ),
            "intent",
            Enrichment::new().with(keys::CONFIDENCE, 0.99),
        );

        let (_, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::Sequential);
    }

    #[test]
    fn test_low_confidence_inserts_clarification_hop() {
        let router = DecisionRouter::default();
        let message = enrich(
            at_stage(Stage::Intent),
            "intent",
            Enrichment::new()
                .with(keys::INTENT, "general")
                .with(keys::CONFIDENCE, 0.3),
        );

        let (route, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::Clarify);
        assert_eq!(route.current(), Some(Stage::Intent));
        assert_eq!(route.cursor(), message.route.cursor() + 1);
        assert_eq!(route.remaining(), message.route.remaining());
    }

    #[test]
    fn test_clarification_exhausted_escalates_low_confidence() {
        let router = DecisionRouter::default();
        let mut message = enrich(
            at_stage(Stage::Intent),
            "intent",
            Enrichment::new().with(keys::CONFIDENCE, 0.3),
        );
        message.metadata.clarification_count = 2;

        match router.decide(&message).unwrap() {
            Decision::Escalate(error) => {
                assert_eq!(error.kind, crate::error::ErrorKind::LowConfidence);
                assert_eq!(error.stage, Stage::Intent);
                assert!(!error.retryable);
            }
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[test]
    fn test_actionable_intent_inserts_execution_before_response() {
        let router = DecisionRouter::default();
        let message = enrich(
            at_stage(Stage::Context),
            "intent",
            Enrichment::new()
                .with(keys::INTENT, "refund")
                .with(keys::CONFIDENCE, 0.7)
                .with(keys::ACTIONABLE, true),
        );

        let (route, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::ActionableExecution);
        assert_eq!(
            route.stages()[route.cursor()..].to_vec(),
            vec![
                Stage::Decision,
                Stage::Execution,
                Stage::Response,
                Stage::Guardrails,
                Stage::Aggregator
            ]
        );
    }

    #[test]
    fn test_actionable_with_result_advances() {
        let router = DecisionRouter::default();
        let message = enrich(
            enrich(
                at_stage(Stage::Context),
                "intent",
                Enrichment::new().with(keys::INTENT, "refund"),
            ),
            "execution",
            Enrichment::new().with(keys::EXECUTION_RESULT, json!({"status": "accepted"})),
        );

        let (_, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::Sequential);
    }

    #[test]
    fn test_escalated_message_passes_through() {
        let router = DecisionRouter::default();
        let mut message = enrich(
            at_stage(Stage::Intent),
            "sentiment",
            Enrichment::new().with(keys::URGENT, true),
        );
        message.metadata.escalation = Some(EscalationState::Fallback);

        let (route, rule) = proceed(router.decide(&message).unwrap());
        assert_eq!(rule, DecisionRule::Passthrough);
        assert_eq!(route, message.route.advance());
    }

    #[test]
    fn test_handoff_stage_passes_through() {
        let router = DecisionRouter::default();
        let message = enrich(
            at_stage(Stage::Sentiment),
            "sentiment",
            Enrichment::new().with(keys::URGENT, true),
        );
        let (handoff_route, _) = proceed(router.decide(&message).unwrap());
        let at_handoff = message.with_route(handoff_route);

        let (route, rule) = proceed(router.decide(&at_handoff).unwrap());
        assert_eq!(rule, DecisionRule::Passthrough);
        assert_eq!(route.current(), Some(Stage::Aggregator));
    }

    proptest! {
        #[test]
        fn decide_is_deterministic(
            urgent in any::<bool>(),
            vip in any::<bool>(),
            safety in any::<bool>(),
            actionable in any::<bool>(),
            confidence in 0.0f64..1.0,
            clarifications in 0u32..4,
            cursor in 0usize..6,
        ) {
            let router = DecisionRouter::default();
            let mut route = Route::full_pipeline();
            for _ in 0..cursor {
                route = route.advance();
            }
            let mut message = Message::new("s", "t").with_route(route);
            message.metadata.clarification_count = clarifications;
            let message = message
                .with_enrichment("gateway", Enrichment::new().with(keys::VIP, vip))
                .unwrap()
                .with_enrichment(
                    "signals",
                    Enrichment::new()
                        .with(keys::URGENT, urgent)
                        .with(keys::SAFETY_FLAG, safety)
                        .with(keys::ACTIONABLE, actionable)
                        .with(keys::CONFIDENCE, confidence),
                )
                .unwrap();

            let first = router.decide(&message).unwrap();
            let second = router.decide(&message).unwrap();
            prop_assert_eq!(&first, &second);

            if let Decision::Proceed { route, .. } = first {
                prop_assert!(route.cursor() > message.route.cursor());
                prop_assert_eq!(
                    route.stages()[..message.route.visited().len()].to_vec(),
                    message.route.visited().to_vec()
                );
            }
        }
    }
}

//! Generic execution of a stage actor for one hop
//!
//! [`ActorRuntime::handle`] turns an inbound [`Message`] into a [`HopOutcome`]:
//! it validates the route, runs the actor under the stage timeout, merges the
//! enrichment and asks the routers for the next route. It never publishes.
//! [`ActorRuntime::process`] adds exactly one publish of the outcome.

use super::contract::{Actor, HopOutcome};
use crate::config::MeshSection;
use crate::error::{MeshError, StageError};
use crate::observability::metrics::metrics;
use crate::protocol::{
    DeadLetter, EscalationState, Message, Route, Stage, ESCALATION_WRITER,
};
use crate::routing::{Decision, DecisionRouter, DecisionRule, EscalationRouter};
use crate::transport::Transport;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};

/// Per-hop limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeSettings {
    pub stage_timeout: Duration,
    pub max_hops: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(5),
            max_hops: 32,
        }
    }
}

impl From<&MeshSection> for RuntimeSettings {
    fn from(section: &MeshSection) -> Self {
        Self {
            stage_timeout: section.stage_timeout(),
            max_hops: section.max_hops,
        }
    }
}

pub struct ActorRuntime<T: Transport> {
    actor: Arc<dyn Actor>,
    transport: Arc<T>,
    decision: DecisionRouter,
    escalation: EscalationRouter,
    settings: RuntimeSettings,
}

impl<T: Transport> ActorRuntime<T> {
    pub fn new(
        actor: Arc<dyn Actor>,
        transport: Arc<T>,
        decision: DecisionRouter,
        escalation: EscalationRouter,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            actor,
            transport,
            decision,
            escalation,
            settings,
        }
    }

    pub fn stage(&self) -> Stage {
        self.actor.stage()
    }

    /// Run one hop and publish its outcome
    ///
    /// An `Err` means the publish failed; the caller must leave the inbound
    /// delivery unacknowledged so the broker redelivers it.
    pub async fn process(&self, message: Message) -> Result<HopOutcome, MeshError> {
        let outcome = self.handle(message).await;
        publish_outcome(self.transport.as_ref(), &outcome).await?;
        Ok(outcome)
    }

    /// Resolve one hop without publishing
    pub async fn handle(&self, message: Message) -> HopOutcome {
        let stage = self.stage();
        let span = crate::hop_span!(
            stage = stage.as_str(),
            message_id = %message.id,
            session_id = %message.session_id(),
            hop = message.metadata.hop_count,
        );

        async move {
            if message.current_stage() != Some(stage) {
                let error = MeshError::misrouted(stage, message.current_stage());
                warn!(error = %error, "Rejecting misrouted message");
                return dead_letter_for(stage, &message, &error);
            }

            if message.metadata.hop_count >= self.settings.max_hops {
                let error = StageError::hop_limit(
                    stage,
                    message.metadata.hop_count,
                    self.settings.max_hops,
                );
                warn!(error = %error, "Hop ceiling reached");
                return self.recover(message, error);
            }

            let started = Instant::now();
            let result =
                match tokio::time::timeout(self.settings.stage_timeout, self.actor.process(&message))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StageError::timeout(
                        stage,
                        format!(
                            "Stage did not finish within {}ms",
                            self.settings.stage_timeout.as_millis()
                        ),
                    )),
                };
            let elapsed = started.elapsed();

            match result {
                Ok(enrichment) => {
                    metrics().stage_processed(stage, elapsed);
                    let mut message = message;
                    // Merge is atomic, a rejected enrichment leaves the payload untouched
                    if let Err(e) = message.payload.merge(self.actor.writer(), enrichment) {
                        return self.recover(message, StageError::payload_conflict(stage, &e));
                    }
                    self.route_success(message)
                }
                Err(error) => {
                    metrics().stage_failed(stage, error.kind, elapsed);
                    warn!(
                        kind = error.kind.as_str(),
                        retryable = error.retryable,
                        cause = %error.cause,
                        "Stage failed"
                    );
                    self.recover(message, error)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn route_success(&self, message: Message) -> HopOutcome {
        match self.decision.decide(&message) {
            Ok(Decision::Proceed { route, rule }) => self.forward(message, route, rule),
            Ok(Decision::Escalate(error)) => self.recover(message, error),
            Err(e) => dead_letter_for(self.stage(), &message, &MeshError::from(e)),
        }
    }

    fn forward(&self, mut message: Message, route: Route, rule: DecisionRule) -> HopOutcome {
        let stage = self.stage();

        let route = match ensure_aggregator(route) {
            Ok(route) => route,
            Err(e) => return dead_letter_for(stage, &message, &e),
        };

        if rule == DecisionRule::Clarify {
            message.metadata.clarification_count += 1;
            metrics().clarification_requested();
        }
        message.metadata.hop_count += 1;
        message.metadata.record_step(stage, route.current(), rule.as_str());
        let message = message.with_route(route);

        match message.current_stage() {
            Some(next) => {
                debug!(rule = rule.as_str(), next = next.as_str(), "Forwarding message");
                HopOutcome::Forward {
                    next,
                    message,
                    rule,
                }
            }
            None => dead_letter_for(
                stage,
                &message,
                &MeshError::internal("Route completed without a next stage"),
            ),
        }
    }

    fn recover(&self, message: Message, error: StageError) -> HopOutcome {
        let stage = self.stage();

        let escalation = match self.escalation.escalate(&message, &error) {
            Ok(escalation) => escalation,
            Err(e) => return dead_letter_for(stage, &message, &MeshError::from(e)),
        };

        let state = escalation.state;
        let mut message = message
            .with_route(escalation.route)
            .with_metadata(escalation.metadata);

        if let Some(fallback) = escalation.fallback {
            if let Err(e) = message.payload.merge(ESCALATION_WRITER, fallback) {
                warn!(error = %e, "Fallback response not written");
            }
        }

        message.metadata.hop_count += 1;
        let next = message.current_stage();
        message.metadata.record_step(stage, next, state.as_str());

        match state {
            EscalationState::Retry => metrics().retry_scheduled(),
            EscalationState::Fallback => metrics().fallback_taken(),
            EscalationState::HumanHandoff => metrics().handoff_taken(),
        }

        match next {
            Some(next) => {
                info!(
                    state = state.as_str(),
                    next = next.as_str(),
                    kind = error.kind.as_str(),
                    "Escalating message"
                );
                HopOutcome::Recover {
                    next,
                    message,
                    state,
                    error,
                }
            }
            None => dead_letter_for(
                stage,
                &message,
                &MeshError::internal("Escalation produced a completed route"),
            ),
        }
    }
}

/// A completed route still ends at the Aggregator so the sink sees every turn
fn ensure_aggregator(route: Route) -> Result<Route, MeshError> {
    if !route.is_complete() {
        return Ok(route);
    }
    let cursor = route.stages().len();
    let mut stages = route.stages().to_vec();
    stages.push(Stage::Aggregator);
    Ok(Route::new(stages, cursor)?)
}

pub(crate) fn dead_letter_for(stage: Stage, message: &Message, error: &MeshError) -> HopOutcome {
    let body = serde_json::to_value(message).unwrap_or(Value::Null);
    HopOutcome::DeadLetter(error.to_dead_letter(
        Some(stage),
        Some(message.id),
        Some(message.session_id().to_string()),
        body,
    ))
}

/// Publish a hop outcome to its subject
pub async fn publish_outcome<T: Transport + ?Sized>(
    transport: &T,
    outcome: &HopOutcome,
) -> Result<(), MeshError> {
    let result = match outcome {
        HopOutcome::Forward { next, message, .. } | HopOutcome::Recover { next, message, .. } => {
            transport
                .publish_message(crate::protocol::subject_for(*next), message)
                .await
        }
        HopOutcome::DeadLetter(letter) => publish_dead_letter(transport, letter).await,
    };

    match result {
        Ok(()) => {
            metrics().message_published();
            Ok(())
        }
        Err(e) => {
            metrics().publish_failed();
            Err(MeshError::transport(e.to_string()))
        }
    }
}

async fn publish_dead_letter<T: Transport + ?Sized>(
    transport: &T,
    letter: &DeadLetter,
) -> Result<(), T::Error> {
    metrics().dead_lettered(letter.code);
    transport.publish_dead_letter(letter).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::{keys, DeadLetterCode, Enrichment, DEAD_LETTER_SUBJECT};
    use crate::routing::{DecisionPolicy, EscalationPolicy};
    use crate::testing::mocks::{FlakyActor, MockTransport, StaticActor};

    fn runtime(actor: Arc<dyn Actor>, transport: Arc<MockTransport>) -> ActorRuntime<MockTransport> {
        ActorRuntime::new(
            actor,
            transport,
            DecisionRouter::new(DecisionPolicy::default()),
            EscalationRouter::new(EscalationPolicy::default()),
            RuntimeSettings {
                stage_timeout: Duration::from_millis(200),
                max_hops: 32,
            },
        )
    }

    fn at_stage(stage: Stage) -> Message {
        let mut message = Message::new("session-1", "Where is my order?");
        while message.current_stage() != Some(stage) {
            let next = message.route.advance();
            message = message.with_route(next);
        }
        message
    }

    #[tokio::test]
    async fn test_success_forwards_to_next_stage() {
        let actor = Arc::new(StaticActor::new(
            Stage::Sentiment,
            Enrichment::new().with(keys::SENTIMENT, "neutral"),
        ));
        let runtime = runtime(actor, Arc::new(MockTransport::new()));

        match runtime.handle(Message::new("session-1", "hi")).await {
            HopOutcome::Forward {
                next,
                message,
                rule,
            } => {
                assert_eq!(next, Stage::Intent);
                assert_eq!(rule, DecisionRule::Sequential);
                assert_eq!(message.payload.sentiment(), Some("neutral"));
                assert_eq!(message.payload.owner(keys::SENTIMENT), Some("sentiment"));
                assert_eq!(message.metadata.hop_count, 1);
                let step = message.metadata.routing_trace.last().unwrap();
                assert_eq!(step.from, Stage::Sentiment);
                assert_eq!(step.to, Some(Stage::Intent));
                assert_eq!(step.reason, "sequential");
            }
            other => panic!("Expected forward, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_misrouted_message_is_dead_lettered() {
        let actor = Arc::new(StaticActor::new(Stage::Intent, Enrichment::new()));
        let runtime = runtime(actor, Arc::new(MockTransport::new()));

        match runtime.handle(Message::new("session-1", "hi")).await {
            HopOutcome::DeadLetter(letter) => {
                assert_eq!(letter.code, DeadLetterCode::MisroutedMessage);
                assert_eq!(letter.stage, Some(Stage::Intent));
                assert_eq!(letter.session_id.as_deref(), Some("session-1"));
            }
            other => panic!("Expected dead letter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completed_route_is_misrouted() {
        let actor = Arc::new(StaticActor::new(Stage::Sentiment, Enrichment::new()));
        let runtime = runtime(actor, Arc::new(MockTransport::new()));

        let message = Message::new("session-1", "hi");
        let len = message.route.stages().len();
        let complete = message.route.rewrite(message.route.stages().to_vec(), len).unwrap();
        let message = message.with_route(complete);

        assert!(matches!(
            runtime.handle(message).await,
            HopOutcome::DeadLetter(DeadLetter {
                code: DeadLetterCode::MisroutedMessage,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_timeout_schedules_retry_on_same_stage() {
        let actor = Arc::new(FlakyActor::timing_out(Stage::Intent, 1, Duration::from_secs(5)));
        let runtime = runtime(actor, Arc::new(MockTransport::new()));
        let message = at_stage(Stage::Intent);
        let cursor = message.route.cursor();

        match runtime.handle(message).await {
            HopOutcome::Recover {
                next,
                message,
                state,
                error,
            } => {
                assert_eq!(next, Stage::Intent);
                assert_eq!(state, EscalationState::Retry);
                assert_eq!(error.kind, ErrorKind::Timeout);
                assert_eq!(message.route.cursor(), cursor);
                assert_eq!(message.metadata.retries_for(Stage::Intent), 1);
                assert_eq!(message.metadata.escalation, None);
            }
            other => panic!("Expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_foreign_key_update_is_non_retryable() {
        // The intent actor tries to overwrite the gateway-owned text
        let actor = Arc::new(StaticActor::new(
            Stage::Intent,
            Enrichment::new().with(keys::TEXT, "rewritten"),
        ));
        let runtime = runtime(actor, Arc::new(MockTransport::new()));

        match runtime.handle(at_stage(Stage::Intent)).await {
            HopOutcome::Recover { message, error, .. } => {
                assert_eq!(error.kind, ErrorKind::PayloadConflict);
                assert!(!error.retryable);
                assert_eq!(message.payload.text(), "Where is my order?");
                assert_eq!(message.metadata.retries_for(Stage::Intent), 0);
            }
            other => panic!("Expected recovery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hop_ceiling_escalates() {
        let actor = Arc::new(StaticActor::new(Stage::Context, Enrichment::new()));
        let runtime = runtime(actor, Arc::new(MockTransport::new()));
        let mut message = at_stage(Stage::Context);
        message.metadata.hop_count = 32;

        match runtime.handle(message).await {
            HopOutcome::Recover { error, state, .. } => {
                assert_eq!(error.kind, ErrorKind::HopLimit);
                assert!(state.is_terminal());
            }
            other => panic!("Expected recovery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completed_route_gets_aggregator() {
        let actor = Arc::new(StaticActor::new(Stage::Guardrails, Enrichment::new()));
        let runtime = runtime(actor, Arc::new(MockTransport::new()));

        let message = Message::new("session-1", "hi");
        let route = Route::new(vec![Stage::Sentiment, Stage::Guardrails], 1).unwrap();
        let message = message.with_route(route);

        match runtime.handle(message).await {
            HopOutcome::Forward { next, message, .. } => {
                assert_eq!(next, Stage::Aggregator);
                assert_eq!(
                    message.route.stages(),
                    &[Stage::Sentiment, Stage::Guardrails, Stage::Aggregator]
                );
            }
            other => panic!("Expected forward, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_process_publishes_exactly_once() {
        let transport = Arc::new(MockTransport::new());
        let actor = Arc::new(StaticActor::new(Stage::Sentiment, Enrichment::new()));
        let runtime = runtime(actor, transport.clone());

        runtime.process(Message::new("session-1", "hi")).await.unwrap();

        let published = transport.get_published_messages().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "domain.support.intent");
    }

    #[tokio::test]
    async fn test_process_publishes_dead_letter() {
        let transport = Arc::new(MockTransport::new());
        let actor = Arc::new(StaticActor::new(Stage::Response, Enrichment::new()));
        let runtime = runtime(actor, transport.clone());

        runtime.process(Message::new("session-1", "hi")).await.unwrap();

        let published = transport.get_published_messages().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, DEAD_LETTER_SUBJECT);
    }

    #[tokio::test]
    async fn test_process_surfaces_publish_failure() {
        let transport = Arc::new(MockTransport::with_failure());
        let actor = Arc::new(StaticActor::new(Stage::Sentiment, Enrichment::new()));
        let runtime = runtime(actor, transport);

        let result = runtime.process(Message::new("session-1", "hi")).await;
        assert!(matches!(result, Err(MeshError::Transport { .. })));
    }
}

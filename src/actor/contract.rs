//! The contract every stage actor implements

use crate::error::StageError;
use crate::protocol::{subject_for, DeadLetter, EscalationState, Enrichment, Message, Stage};
use crate::routing::DecisionRule;
use async_trait::async_trait;

/// Stage logic: read the message, return what to add to the payload
///
/// Actors never publish and never touch the route. The runtime merges the
/// returned enrichment under the actor's writer name and decides where the
/// message goes next.
#[async_trait]
pub trait Actor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Provenance name for the keys this actor writes
    fn writer(&self) -> &'static str {
        self.stage().as_str()
    }

    async fn process(&self, message: &Message) -> Result<Enrichment, StageError>;
}

/// Where a single hop ended up
#[derive(Debug, Clone, PartialEq)]
pub enum HopOutcome {
    /// Stage succeeded, next hop chosen by the decision router
    Forward {
        next: Stage,
        message: Message,
        rule: DecisionRule,
    },
    /// Stage failed, next hop chosen by the escalation router
    Recover {
        next: Stage,
        message: Message,
        state: EscalationState,
        error: StageError,
    },
    DeadLetter(DeadLetter),
}

impl HopOutcome {
    /// Subject the outcome is published to, `None` for dead letters
    pub fn subject(&self) -> Option<&'static str> {
        match self {
            HopOutcome::Forward { next, .. } | HopOutcome::Recover { next, .. } => {
                Some(subject_for(*next))
            }
            HopOutcome::DeadLetter(_) => None,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            HopOutcome::Forward { message, .. } | HopOutcome::Recover { message, .. } => {
                Some(message)
            }
            HopOutcome::DeadLetter(_) => None,
        }
    }

    /// Short label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            HopOutcome::Forward { rule, .. } => rule.as_str(),
            HopOutcome::Recover { state, .. } => state.as_str(),
            HopOutcome::DeadLetter(_) => "dead_letter",
        }
    }
}

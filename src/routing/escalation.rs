//! Escalation Router
//!
//! Consulted when a stage fails, or when the Decision Router asks to escalate.
//! It picks one of three states and returns the route, metadata and optional
//! fallback payload entry the runtime must apply:
//!
//! - **Retry**: the error is retryable, the message is not escalated yet and
//!   the per-stage retry counter is below the ceiling. Same stage again.
//! - **Fallback**: a canned template exists for the error kind or the stage.
//!   Straight to the aggregator with the template as the answer.
//! - **HumanHandoff**: everything else. Through the handoff stage to the
//!   aggregator.
//!
//! Fallback and HumanHandoff are terminal: a message carrying either never
//! returns to Retry.

use crate::config::{EscalationSection, DEFAULT_CLARIFICATION_TEMPLATE};
use crate::error::{ErrorKind, StageError};
use crate::protocol::messages::{keys, Enrichment, ErrorRecord, EscalationState, Message, Metadata};
use crate::protocol::route::{Route, RouteError, Stage};
use chrono::Utc;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationPolicy {
    pub max_retries: u32,
    /// Canned responses keyed by error kind or stage name
    pub fallback_templates: BTreeMap<String, String>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::from(&EscalationSection::default())
    }
}

impl From<&EscalationSection> for EscalationPolicy {
    fn from(section: &EscalationSection) -> Self {
        Self {
            max_retries: section.max_retries,
            fallback_templates: section.fallback_templates.clone(),
        }
    }
}

/// What the runtime applies to the failed message
#[derive(Debug, Clone, PartialEq)]
pub struct Escalation {
    pub state: EscalationState,
    pub route: Route,
    pub metadata: Metadata,
    /// Written to the payload by the escalation writer
    pub fallback: Option<Enrichment>,
}

#[derive(Debug, Clone, Default)]
pub struct EscalationRouter {
    policy: EscalationPolicy,
}

impl EscalationRouter {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Template for an error, by kind first and then by stage
    ///
    /// Low confidence always resolves to a clarification answer, so an
    /// exhausted clarify loop never ends in a human handoff.
    pub fn template_for(&self, error: &StageError) -> Option<&str> {
        let templates = &self.policy.fallback_templates;
        templates
            .get(error.kind.as_str())
            .or_else(|| templates.get(error.stage.as_str()))
            .map(String::as_str)
            .or_else(|| {
                (error.kind == ErrorKind::LowConfidence).then_some(DEFAULT_CLARIFICATION_TEMPLATE)
            })
    }

    pub fn escalate(&self, message: &Message, error: &StageError) -> Result<Escalation, RouteError> {
        let mut metadata = message.metadata.clone();
        metadata.last_error = Some(ErrorRecord::from(error));
        metadata.updated_at = Utc::now();
        let route = &message.route;

        if let Some(state) = metadata.escalation.filter(|s| s.is_terminal()) {
            return Ok(Escalation {
                state,
                route: route.with_remaining(vec![Stage::Aggregator])?,
                metadata,
                fallback: None,
            });
        }

        if error.retryable && metadata.retries_for(error.stage) < self.policy.max_retries {
            *metadata.retry_count.entry(error.stage).or_insert(0) += 1;
            return Ok(Escalation {
                state: EscalationState::Retry,
                route: route.clone(),
                metadata,
                fallback: None,
            });
        }

        if error.stage == Stage::HumanHandoff {
            metadata.escalation = Some(EscalationState::HumanHandoff);
            return Ok(Escalation {
                state: EscalationState::HumanHandoff,
                route: route.with_remaining(vec![Stage::Aggregator])?,
                metadata,
                fallback: None,
            });
        }

        if let Some(template) = self.template_for(error) {
            metadata.escalation = Some(EscalationState::Fallback);
            let fallback = Enrichment::new()
                .with(keys::FALLBACK_RESPONSE, template)
                .with(
                    keys::FALLBACK_REASON,
                    format!("{}:{}", error.stage, error.kind.as_str()),
                );
            return Ok(Escalation {
                state: EscalationState::Fallback,
                route: route.with_remaining(vec![Stage::Aggregator])?,
                metadata,
                fallback: Some(fallback),
            });
        }

        metadata.escalation = Some(EscalationState::HumanHandoff);
        Ok(Escalation {
            state: EscalationState::HumanHandoff,
            route: route.with_remaining(vec![Stage::HumanHandoff, Stage::Aggregator])?,
            metadata,
            fallback: None,
        })
    }
}

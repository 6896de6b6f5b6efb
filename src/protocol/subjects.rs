//! Bus subject naming
//!
//! Every subject the mesh uses is derived from the single table below, so the
//! publish side and the subscribe side can never drift apart.

use crate::protocol::route::Stage;
use thiserror::Error;

/// Namespace shared by all support subjects
pub const SUBJECT_PREFIX: &str = "domain.support";
/// Subject carrying terminal delivery records
pub const DELIVERIES_SUBJECT: &str = "domain.support.deliveries";
/// Subject carrying bodies that could not be processed
pub const DEAD_LETTER_SUBJECT: &str = "domain.support.dead_letter";

/// Subject a stage consumes from
pub fn subject_for(stage: Stage) -> &'static str {
    match stage {
        Stage::Sentiment => "domain.support.sentiment",
        Stage::Intent => "domain.support.intent",
        Stage::Context => "domain.support.context",
        Stage::Decision => "domain.support.decision",
        Stage::Execution => "domain.support.execution",
        Stage::Response => "domain.support.response",
        Stage::Guardrails => "domain.support.guardrails",
        Stage::HumanHandoff => "domain.support.human_handoff",
        Stage::Aggregator => "domain.support.aggregator",
    }
}

/// Inverse of [`subject_for`]
pub fn stage_for_subject(subject: &str) -> Option<Stage> {
    Stage::ALL
        .iter()
        .copied()
        .find(|stage| subject_for(*stage) == subject)
}

/// MQTT v5 shared subscription filter, giving work-queue delivery per group
pub fn shared_subscription(group: &str, subject: &str) -> String {
    format!("$share/{group}/{subject}")
}

pub fn validate_mesh_id(mesh_id: &str) -> Result<(), ValidationError> {
    if mesh_id.is_empty() {
        return Err(ValidationError::EmptyId);
    }

    for ch in mesh_id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidIdChar(ch));
        }
    }

    Ok(())
}

/// Identifier validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Identifier cannot be empty")]
    EmptyId,
    #[error("Identifier contains invalid character: '{0}'")]
    InvalidIdChar(char),
}

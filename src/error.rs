//! Error types for the support mesh
//!
//! [`StageError`] is the only failure a stage actor reports; it travels into
//! the escalation path and is recorded on the message. [`MeshError`] covers
//! everything around the stages (bus, parsing, persistence) and converts to a
//! sanitized [`DeadLetter`] when a body has to be parked.

use crate::protocol::messages::{DeadLetter, DeadLetterCode, PayloadError};
use crate::protocol::route::{RouteError, Stage};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Classification of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Transient,
    Collaborator,
    InvalidInput,
    Policy,
    LowConfidence,
    PayloadConflict,
    HopLimit,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Collaborator => "collaborator",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Policy => "policy",
            ErrorKind::LowConfidence => "low_confidence",
            ErrorKind::PayloadConflict => "payload_conflict",
            ErrorKind::HopLimit => "hop_limit",
        }
    }
}

/// Failure reported by a stage, or raised on its behalf by the runtime
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Stage {stage} failed ({}): {cause}", .kind.as_str())]
pub struct StageError {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub cause: String,
    pub retryable: bool,
}

impl StageError {
    pub fn new<S: Into<String>>(stage: Stage, kind: ErrorKind, cause: S, retryable: bool) -> Self {
        Self {
            stage,
            kind,
            cause: cause.into(),
            retryable,
        }
    }

    /// Stage logic exceeded its time budget
    pub fn timeout<S: Into<String>>(stage: Stage, cause: S) -> Self {
        Self::new(stage, ErrorKind::Timeout, cause, true)
    }

    /// Temporary collaborator failure worth retrying
    pub fn transient<S: Into<String>>(stage: Stage, cause: S) -> Self {
        Self::new(stage, ErrorKind::Transient, cause, true)
    }

    /// Collaborator rejected the request
    pub fn collaborator<S: Into<String>>(stage: Stage, cause: S, retryable: bool) -> Self {
        Self::new(stage, ErrorKind::Collaborator, cause, retryable)
    }

    pub fn invalid_input<S: Into<String>>(stage: Stage, cause: S) -> Self {
        Self::new(stage, ErrorKind::InvalidInput, cause, false)
    }

    pub fn policy<S: Into<String>>(stage: Stage, cause: S) -> Self {
        Self::new(stage, ErrorKind::Policy, cause, false)
    }

    pub fn low_confidence(stage: Stage, confidence: f64, threshold: f64) -> Self {
        Self::new(
            stage,
            ErrorKind::LowConfidence,
            format!("confidence {confidence:.2} below {threshold:.2} after clarification"),
            false,
        )
    }

    pub fn payload_conflict(stage: Stage, error: &PayloadError) -> Self {
        Self::new(stage, ErrorKind::PayloadConflict, error.to_string(), false)
    }

    pub fn hop_limit(stage: Stage, hops: u32, max: u32) -> Self {
        Self::new(
            stage,
            ErrorKind::HopLimit,
            format!("hop count {hops} reached ceiling {max}"),
            false,
        )
    }
}

/// Crate-level error type
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Invalid route: {0}")]
    InvalidRoute(#[from] RouteError),

    #[error("Misrouted message: expected stage {expected}, found {}", .found.map(|s| s.as_str()).unwrap_or("<complete>"))]
    MisroutedMessage {
        expected: Stage,
        found: Option<Stage>,
    },

    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("{0}")]
    Stage(#[from] StageError),

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Delivery error: {message}")]
    Delivery { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MeshError {
    pub fn misrouted(expected: Stage, found: Option<Stage>) -> Self {
        Self::MisroutedMessage { expected, found }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn delivery<S: Into<String>>(message: S) -> Self {
        Self::Delivery {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Dead-letter code for this error
    ///
    /// Only route and parsing failures are dead-lettered by the runtime; any
    /// other error reaching this point is treated as an unreadable body.
    pub fn dead_letter_code(&self) -> DeadLetterCode {
        match self {
            MeshError::InvalidRoute(_) => DeadLetterCode::InvalidRoute,
            MeshError::MisroutedMessage { .. } => DeadLetterCode::MisroutedMessage,
            _ => DeadLetterCode::MalformedMessage,
        }
    }

    /// Convert to a dead-letter record for publishing
    pub fn to_dead_letter(
        &self,
        stage: Option<Stage>,
        message_id: Option<Uuid>,
        session_id: Option<String>,
        body: Value,
    ) -> DeadLetter {
        DeadLetter {
            message_id,
            session_id,
            stage,
            code: self.dead_letter_code(),
            reason: sanitize_error_message(&self.to_string()),
            body,
            timestamp: Utc::now(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_REASON_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

/// Redact secrets and sensitive paths, capping the result at 500 bytes
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

//! Stage identifiers and the immutable Route value
//!
//! A Route is the plan of remaining hops for a conversation turn: an ordered
//! list of stages plus a cursor naming the stage that currently owns the
//! message. Every operation returns a new Route; nothing mutates in place.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Processing stages that participate in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Sentiment,
    Intent,
    Context,
    Decision,
    Execution,
    Response,
    Guardrails,
    HumanHandoff,
    Aggregator,
}

impl Stage {
    /// Every stage, in declaration order
    pub const ALL: [Stage; 9] = [
        Stage::Sentiment,
        Stage::Intent,
        Stage::Context,
        Stage::Decision,
        Stage::Execution,
        Stage::Response,
        Stage::Guardrails,
        Stage::HumanHandoff,
        Stage::Aggregator,
    ];

    /// Wire name of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Sentiment => "sentiment",
            Stage::Intent => "intent",
            Stage::Context => "context",
            Stage::Decision => "decision",
            Stage::Execution => "execution",
            Stage::Response => "response",
            Stage::Guardrails => "guardrails",
            Stage::HumanHandoff => "human_handoff",
            Stage::Aggregator => "aggregator",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| RouteError::UnknownStage(s.to_string()))
    }
}

/// Default stage order for a new conversation turn
pub const FULL_PROCESSING_PIPELINE: [Stage; 7] = [
    Stage::Sentiment,
    Stage::Intent,
    Stage::Context,
    Stage::Decision,
    Stage::Response,
    Stage::Guardrails,
    Stage::Aggregator,
];

/// Route construction and rewrite errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid route: cursor {cursor} out of bounds for {len} stages")]
    InvalidRoute { cursor: usize, len: usize },
    #[error("Unknown stage: {0}")]
    UnknownStage(String),
}

/// Ordered plan of hops plus the current position
///
/// Invariant: `cursor <= stages.len()`. A cursor equal to the length means the
/// pipeline is complete.
///
/// # Examples
/// ```
/// use support_mesh::protocol::{Route, Stage};
///
/// let route = Route::full_pipeline();
/// assert_eq!(route.current(), Some(Stage::Sentiment));
///
/// let next = route.advance();
/// assert_eq!(next.current(), Some(Stage::Intent));
/// // The original value is untouched
/// assert_eq!(route.current(), Some(Stage::Sentiment));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRoute")]
pub struct Route {
    stages: Vec<Stage>,
    cursor: usize,
}

/// Unvalidated wire form, checked on the way in
#[derive(Deserialize)]
struct RawRoute {
    stages: Vec<Stage>,
    cursor: usize,
}

impl TryFrom<RawRoute> for Route {
    type Error = RouteError;

    fn try_from(raw: RawRoute) -> Result<Self, Self::Error> {
        Route::new(raw.stages, raw.cursor)
    }
}

impl Route {
    /// Build a route, validating the cursor
    pub fn new(stages: Vec<Stage>, cursor: usize) -> Result<Self, RouteError> {
        if cursor > stages.len() {
            return Err(RouteError::InvalidRoute {
                cursor,
                len: stages.len(),
            });
        }
        Ok(Self { stages, cursor })
    }

    /// The full processing pipeline positioned at its first stage
    pub fn full_pipeline() -> Self {
        Self {
            stages: FULL_PROCESSING_PIPELINE.to_vec(),
            cursor: 0,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Stage currently owning the message, `None` once complete
    pub fn current(&self) -> Option<Stage> {
        self.stages.get(self.cursor).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.stages.len()
    }

    /// Stages after the current one
    pub fn remaining(&self) -> &[Stage] {
        let start = (self.cursor + 1).min(self.stages.len());
        &self.stages[start..]
    }

    /// Stages up to and including the current one
    pub fn visited(&self) -> &[Stage] {
        let end = (self.cursor + 1).min(self.stages.len());
        &self.stages[..end]
    }

    /// Whether the route already passed through (or is at) `stage`
    pub fn has_visited(&self, stage: Stage) -> bool {
        self.visited().contains(&stage)
    }

    /// Move one hop forward; a complete route stays complete
    pub fn advance(&self) -> Route {
        Route {
            stages: self.stages.clone(),
            cursor: (self.cursor + 1).min(self.stages.len()),
        }
    }

    /// Explicit jump to a new plan
    pub fn rewrite(&self, stages: Vec<Stage>, cursor: usize) -> Result<Route, RouteError> {
        Route::new(stages, cursor)
    }

    /// Keep the visited prefix and replace everything after the cursor
    ///
    /// The new cursor names the first stage of `remaining`, or marks the route
    /// complete when `remaining` is empty.
    pub fn with_remaining(&self, remaining: Vec<Stage>) -> Result<Route, RouteError> {
        let mut stages = self.visited().to_vec();
        let cursor = stages.len();
        stages.extend(remaining);
        self.rewrite(stages, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_stage() -> impl Strategy<Value = Stage> {
        prop::sample::select(Stage::ALL.to_vec())
    }

    fn any_route() -> impl Strategy<Value = Route> {
        prop::collection::vec(any_stage(), 0..12).prop_flat_map(|stages| {
            let len = stages.len();
            (Just(stages), 0..=len)
                .prop_map(|(stages, cursor)| Route::new(stages, cursor).unwrap())
        })
    }

    proptest! {
        #[test]
        fn advance_strictly_increases_or_completes(route in any_route()) {
            let next = route.advance();
            if route.is_complete() {
                prop_assert!(next.is_complete());
                prop_assert_eq!(next.cursor(), route.cursor());
            } else {
                prop_assert_eq!(next.cursor(), route.cursor() + 1);
            }
            prop_assert!(next.cursor() <= next.stages().len());
        }

        #[test]
        fn with_remaining_never_moves_backwards(
            route in any_route(),
            tail in prop::collection::vec(any_stage(), 0..6),
        ) {
            prop_assume!(!route.is_complete());
            let rewritten = route.with_remaining(tail.clone()).unwrap();
            prop_assert_eq!(rewritten.cursor(), route.cursor() + 1);
            prop_assert_eq!(rewritten.visited()[..route.visited().len()].to_vec(), route.visited().to_vec());
            prop_assert_eq!(rewritten.stages()[rewritten.cursor()..].to_vec(), tail);
        }

        #[test]
        fn serde_round_trip_preserves_route(route in any_route()) {
            let json = serde_json::to_string(&route).unwrap();
            let back: Route = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, route);
        }
    }

    #[test]
    fn test_full_pipeline_order() {
        let route = Route::full_pipeline();
        assert_eq!(route.stages(), &FULL_PROCESSING_PIPELINE);
        assert_eq!(route.current(), Some(Stage::Sentiment));
        assert_eq!(route.remaining().len(), 6);
    }

    #[test]
    fn test_advance_to_completion() {
        let mut route = Route::full_pipeline();
        for _ in 0..FULL_PROCESSING_PIPELINE.len() {
            assert!(!route.is_complete());
            route = route.advance();
        }
        assert!(route.is_complete());
        assert_eq!(route.current(), None);
        assert!(route.advance().is_complete());
    }

    #[test]
    fn test_rewrite_rejects_out_of_bounds_cursor() {
        let route = Route::full_pipeline();
        let err = route
            .rewrite(vec![Stage::Response, Stage::Aggregator], 3)
            .unwrap_err();
        assert_eq!(err, RouteError::InvalidRoute { cursor: 3, len: 2 });

        // cursor == len is the completed form and is allowed
        let complete = route.rewrite(vec![Stage::Aggregator], 1).unwrap();
        assert!(complete.is_complete());
    }

    #[test]
    fn test_deserialize_rejects_corrupt_cursor() {
        let json = r#"{"stages":["sentiment","intent"],"cursor":5}"#;
        let result: Result<Route, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_visited_and_remaining() {
        let route = Route::full_pipeline().advance().advance();
        assert_eq!(route.current(), Some(Stage::Context));
        assert_eq!(
            route.visited(),
            &[Stage::Sentiment, Stage::Intent, Stage::Context]
        );
        assert_eq!(route.remaining()[0], Stage::Decision);
        assert!(route.has_visited(Stage::Intent));
        assert!(!route.has_visited(Stage::Response));
    }

    #[test]
    fn test_stage_string_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
            assert_eq!(
                serde_json::to_string(&stage).unwrap(),
                format!("\"{}\"", stage.as_str())
            );
        }
        assert!(matches!(
            "billing".parse::<Stage>(),
            Err(RouteError::UnknownStage(_))
        ));
    }
}

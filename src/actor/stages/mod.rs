//! Built-in stage actors
//!
//! Heuristic implementations of each pipeline stage. Any of them can be
//! replaced by another [`Actor`](crate::actor::Actor) for the same stage.

pub mod context;
pub mod decision;
pub mod execution;
pub mod guardrails;
pub mod handoff;
pub mod intent;
pub mod response;
pub mod sentiment;

pub use context::ContextActor;
pub use decision::DecisionActor;
pub use execution::ExecutionActor;
pub use guardrails::GuardrailsActor;
pub use handoff::HandoffActor;
pub use intent::IntentActor;
pub use response::ResponseActor;
pub use sentiment::SentimentActor;

//! Stage actors and the machinery that runs them
//!
//! - [`contract`]: the [`Actor`] trait and hop outcomes
//! - [`runtime`]: one hop of one stage, including routing and publishing
//! - [`aggregator`]: the terminal sink
//! - [`worker`]: consumer loops and subject dispatch
//! - [`stages`]: built-in actors for every pipeline stage

pub mod aggregator;
pub mod contract;
pub mod runtime;
pub mod stages;
pub mod worker;

pub use aggregator::{AggregationOutcome, ResponseAggregator};
pub use contract::{Actor, HopOutcome};
pub use runtime::{publish_outcome, ActorRuntime, RuntimeSettings};
pub use worker::{parse_message, run_worker, Dispatcher, SharedQueue, StageWorker};

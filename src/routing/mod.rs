//! Route rewriting
//!
//! Two pure routers decide where a message goes next:
//!
//! - [`DecisionRouter`] after a stage succeeds, reading the routing signals in
//!   the payload.
//! - [`EscalationRouter`] after a stage fails, choosing between retry, canned
//!   fallback and human handoff.
//!
//! Both return new [`Route`](crate::protocol::Route) values; neither performs
//! I/O.

pub mod decision;
pub mod escalation;

pub use decision::{Decision, DecisionPolicy, DecisionRouter, DecisionRule};
pub use escalation::{Escalation, EscalationPolicy, EscalationRouter};

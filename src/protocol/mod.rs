//! Message, route and subject model shared by every stage
//!
//! Everything in this module is a pure value type: routes and messages are
//! transformed by returning new values, never by I/O.

pub mod messages;
pub mod route;
pub mod subjects;

pub use messages::*;
pub use route::*;
pub use subjects::*;

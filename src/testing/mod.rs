//! Testing utilities and mock implementations
//!
//! In-memory stand-ins for the broker, the collaborators and stage actors so
//! the mesh can be exercised without external services.

pub mod mocks;

pub use mocks::*;

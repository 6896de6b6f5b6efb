//! Chat completion providers used for response generation

pub mod provider;
pub mod providers;

pub use provider::*;
pub use providers::*;

//! Concrete [`LlmProvider`](crate::llm::provider::LlmProvider) implementations

pub mod openai;

pub use openai::*;

//! Structured logging, metrics collection and the health endpoint server

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MeshMetrics, MetricsSnapshot};

pub use logging::{bus_span, hop_span, lifecycle_span};

//! Health check system for production monitoring
//!
//! Provides health check traits and implementations for the collaborators a
//! mesh node depends on: the bus, the audit database, the context cache and
//! the response generator.

use crate::error::MeshResult;
use crate::services::audit::AuditStore;
use crate::services::context::ContextStore;
use crate::services::generation::ResponseGenerator;
use crate::transport::Transport;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Key used to exercise the context cache without touching real customers
const CONTEXT_PROBE_KEY: &str = "__health_probe__";

/// Health check result
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub component: String,
    pub healthy: bool,
    pub message: Option<String>,
    pub response_time_ms: Option<u64>,
}

/// Trait for components that can be health checked
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check on this component
    async fn health_check(&self) -> HealthCheckResult;

    /// Get the component name for reporting
    fn component_name(&self) -> &str;
}

/// Time a fallible probe and turn it into a result
async fn probe<F, E>(component: &str, healthy_message: &str, check: F) -> HealthCheckResult
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let outcome = check.await;
    let response_time_ms = start.elapsed().as_millis() as u64;

    let (healthy, message) = match outcome {
        Ok(()) => (true, healthy_message.to_string()),
        Err(e) => {
            warn!(component, error = %e, response_time_ms, "Health check failed");
            (false, format!("{component} error: {e}"))
        }
    };
    debug!(component, healthy, response_time_ms, "Health check completed");

    HealthCheckResult {
        component: component.to_string(),
        healthy,
        message: Some(message),
        response_time_ms: Some(response_time_ms),
    }
}

/// Bus connection health
pub struct BusHealthCheck<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> BusHealthCheck<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: Transport> HealthCheck for BusHealthCheck<T> {
    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let component = self.component_name().to_string();

        let is_connected = self.transport.is_connected();
        let is_permanently_disconnected = self.transport.is_permanently_disconnected();
        let connection_state = self.transport.connection_state();

        let healthy = is_connected && !is_permanently_disconnected;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let message = if healthy {
            "Bus connection healthy".to_string()
        } else {
            format!(
                "Bus not connected - state: {connection_state:?}, permanently disconnected: {is_permanently_disconnected}"
            )
        };

        debug!(healthy, ?connection_state, response_time_ms, "Bus health check");

        HealthCheckResult {
            component,
            healthy,
            message: Some(message),
            response_time_ms: Some(response_time_ms),
        }
    }

    fn component_name(&self) -> &str {
        "bus_transport"
    }
}

pub struct AuditStoreHealthCheck {
    store: Arc<dyn AuditStore>,
}

impl AuditStoreHealthCheck {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for AuditStoreHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        probe(
            self.component_name(),
            "Audit store reachable",
            self.store.health_check(),
        )
        .await
    }

    fn component_name(&self) -> &str {
        "audit_store"
    }
}

/// Exercises the context cache with a probe key
pub struct ContextCacheHealthCheck {
    store: Arc<dyn ContextStore>,
}

impl ContextCacheHealthCheck {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for ContextCacheHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        probe(
            self.component_name(),
            "Context cache reachable",
            self.store.invalidate(CONTEXT_PROBE_KEY),
        )
        .await
    }

    fn component_name(&self) -> &str {
        "context_cache"
    }
}

pub struct GeneratorHealthCheck {
    generator: Arc<dyn ResponseGenerator>,
}

impl GeneratorHealthCheck {
    pub fn new(generator: Arc<dyn ResponseGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl HealthCheck for GeneratorHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let healthy_message = format!("{} generator healthy", self.generator.source());
        probe(
            self.component_name(),
            &healthy_message,
            self.generator.health_check(),
        )
        .await
    }

    fn component_name(&self) -> &str {
        "response_generator"
    }
}

/// Aggregated health check manager
pub struct HealthCheckManager {
    health_checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthCheckManager {
    pub fn new() -> Self {
        Self {
            health_checks: Vec::new(),
        }
    }

    /// Add a health check to the manager
    pub fn add_health_check(&mut self, health_check: Box<dyn HealthCheck>) {
        self.health_checks.push(health_check);
    }

    pub fn len(&self) -> usize {
        self.health_checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.health_checks.is_empty()
    }

    /// Run all health checks and return aggregated results
    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(self.health_checks.len());
        for health_check in &self.health_checks {
            results.push(health_check.health_check().await);
        }
        results
    }

    /// Calculate overall health status from all components
    pub async fn calculate_overall_health(&self) -> MeshResult<bool> {
        let results = self.run_health_checks().await;

        if results.is_empty() {
            warn!("No health checks configured - assuming healthy");
            return Ok(true);
        }

        let healthy_count = results.iter().filter(|r| r.healthy).count();
        let total_count = results.len();

        // All components must be healthy for overall health
        let overall_healthy = healthy_count == total_count;

        debug!(
            "Overall health check: {}/{} components healthy, overall={}",
            healthy_count, total_count, overall_healthy
        );

        Ok(overall_healthy)
    }
}

impl Default for HealthCheckManager {
    fn default() -> Self {
        Self::new()
    }
}

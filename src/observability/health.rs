//! Health check HTTP server for container orchestration
//!
//! Provides HTTP endpoints for monitoring node status, supporting both
//! human operators and container orchestration platforms.

use crate::health::HealthCheckResult;
use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::Filter;

/// No hop for this long while hops were flowing marks processing as stale
const HOP_STALENESS_THRESHOLD_SECONDS: u64 = 300;

/// HTTP health check server
pub struct HealthServer {
    node_id: String,
    port: u16,
    bus_connected: Arc<AtomicBool>,
    last_hop_processed: Arc<AtomicU64>,
    component_checks: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthServer {
    pub fn new<S: Into<String>>(node_id: S, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            port,
            bus_connected: Arc::new(AtomicBool::new(false)),
            last_hop_processed: Arc::new(AtomicU64::new(0)),
            component_checks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.bus_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_last_hop_processed(&self, timestamp: u64) {
        self.last_hop_processed.store(timestamp, Ordering::Relaxed);
    }

    /// Mark a hop as processed now
    pub fn touch(&self) {
        self.set_last_hop_processed(current_timestamp());
    }

    /// Replace component statuses with the latest probe results
    pub async fn record_results(&self, results: &[HealthCheckResult]) {
        let now = current_timestamp();
        let mut checks = self.component_checks.write().await;
        for result in results {
            checks.insert(
                result.component.clone(),
                ComponentStatus {
                    status: if result.healthy { "healthy" } else { "unhealthy" }.to_string(),
                    message: result.message.clone(),
                    last_check: now,
                },
            );
        }
    }

    pub async fn remove_component(&self, name: &str) {
        self.component_checks.write().await.remove(name);
    }

    /// Start the HTTP health server
    pub async fn start(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - comprehensive health status
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.bus_connected.load(Ordering::Relaxed);
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - liveness probe
        let live_route = warp::path("live").and(warp::get()).and_then(|| async {
            Ok::<_, Infallible>(warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            }))
        });

        // GET / - endpoint listing
        let root_route = warp::path::end().and(warp::get()).and_then(|| async {
            let endpoints = HashMap::from([
                ("/health", "Overall health status with component checks"),
                ("/metrics", "Bus, stage, routing and delivery statistics"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]);
            Ok::<_, Infallible>(warp::reply::json(&endpoints))
        });

        let routes = health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin());

        tracing::info!(port = self.port, "Starting health server");

        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;

        Ok(())
    }

    async fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let mut checks = HashMap::new();

        checks.insert("bus".to_string(), self.check_bus_health());
        checks.insert("hop_processing".to_string(), self.check_hop_processing_health());

        for (name, check) in self.component_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let overall_healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            node_id: self.node_id.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_bus_health(&self) -> ComponentStatus {
        let connected = self.bus_connected.load(Ordering::Relaxed);
        ComponentStatus {
            status: if connected { "healthy" } else { "unhealthy" }.to_string(),
            message: Some(
                if connected {
                    "Bus connection established"
                } else {
                    "Bus connection failed or disconnected"
                }
                .to_string(),
            ),
            last_check: current_timestamp(),
        }
    }

    fn check_hop_processing_health(&self) -> ComponentStatus {
        let now = current_timestamp();
        let last_hop = self.last_hop_processed.load(Ordering::Relaxed);

        let (status, message) = if last_hop == 0 {
            ("healthy", "No hops processed yet".to_string())
        } else if now.saturating_sub(last_hop) > HOP_STALENESS_THRESHOLD_SECONDS {
            (
                "stale",
                format!("No hop activity for {} seconds", now.saturating_sub(last_hop)),
            )
        } else {
            ("healthy", "Recent hop activity".to_string())
        };

        ComponentStatus {
            status: status.to_string(),
            message: Some(message),
            last_check: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    node_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, ComponentStatus>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(component: &str, healthy: bool) -> HealthCheckResult {
        HealthCheckResult {
            component: component.to_string(),
            healthy,
            message: None,
            response_time_ms: Some(1),
        }
    }

    #[test]
    fn test_bus_status() {
        let server = HealthServer::new("node-1", 8080);
        assert_eq!(server.check_bus_health().status, "unhealthy");

        server.set_bus_connected(true);
        assert_eq!(server.check_bus_health().status, "healthy");
    }

    #[test]
    fn test_hop_staleness() {
        let server = HealthServer::new("node-1", 8080);
        assert_eq!(server.check_hop_processing_health().status, "healthy");

        server.touch();
        assert_eq!(server.check_hop_processing_health().status, "healthy");

        server.set_last_hop_processed(current_timestamp() - 600);
        assert_eq!(server.check_hop_processing_health().status, "stale");
    }

    #[tokio::test]
    async fn test_component_results_drive_overall_status() {
        let server = HealthServer::new("node-1", 8080);
        server.set_bus_connected(true);
        server
            .record_results(&[result("audit_store", true), result("context_cache", true)])
            .await;

        let status = server.get_health_status().await;
        assert_eq!(status.status, "healthy");
        assert_eq!(status.node_id, "node-1");
        assert!(status.checks.contains_key("audit_store"));

        server.record_results(&[result("audit_store", false)]).await;
        assert_eq!(server.get_health_status().await.status, "degraded");

        server.remove_component("audit_store").await;
        assert_eq!(server.get_health_status().await.status, "healthy");
    }
}

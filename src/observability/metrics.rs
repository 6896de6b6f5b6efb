//! Thread-safe metrics collection
//!
//! Atomic counters for the hot paths (bus traffic, routing outcomes, deliveries)
//! and mutex-protected maps for per-stage statistics.

use crate::error::ErrorKind;
use crate::protocol::{DeadLetterCode, RoutedTo, Stage};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MeshMetrics> = Lazy::new(MeshMetrics::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MeshMetrics {
    &METRICS
}

/// Most recent timings kept per stage
const MAX_TIMINGS: usize = 1000;

pub struct MeshMetrics {
    // Bus
    bus_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    messages_received: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    connection_start_time: AtomicU64,

    // Routing outcomes
    retries: AtomicU64,
    clarifications: AtomicU64,
    fallbacks: AtomicU64,
    handoffs: AtomicU64,
    dead_letters: Mutex<BTreeMap<DeadLetterCode, u64>>,

    // Terminal sink
    deliveries: Mutex<BTreeMap<RoutedTo, u64>>,
    delivery_failures: AtomicU64,
    persistence_failures: AtomicU64,

    stage_stats: Mutex<BTreeMap<Stage, StageStats>>,

    // Lifecycle
    node_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

#[derive(Debug, Default)]
struct StageStats {
    processed: u64,
    failed: u64,
    timeouts: u64,
    failures_by_kind: BTreeMap<&'static str, u64>,
    times_ms: Vec<u64>,
}

impl StageStats {
    fn record_time(&mut self, duration: Duration) {
        self.times_ms.push(duration.as_millis() as u64);
        if self.times_ms.len() > MAX_TIMINGS {
            self.times_ms.remove(0);
        }
    }
}

impl MeshMetrics {
    pub fn new() -> Self {
        let now = current_timestamp();
        Self {
            bus_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            clarifications: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            handoffs: AtomicU64::new(0),
            dead_letters: Mutex::new(BTreeMap::new()),
            deliveries: Mutex::new(BTreeMap::new()),
            delivery_failures: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            stage_stats: Mutex::new(BTreeMap::new()),
            node_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            state_transitions: AtomicU64::new(0),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Bus metrics
    pub fn bus_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.bus_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn bus_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.bus_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn bus_connection_lost(&self) {
        self.bus_connected.store(false, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Stage metrics
    pub fn stage_processed(&self, stage: Stage, duration: Duration) {
        if let Ok(mut stats) = self.stage_stats.lock() {
            let entry = stats.entry(stage).or_default();
            entry.processed += 1;
            entry.record_time(duration);
        }
    }

    pub fn stage_failed(&self, stage: Stage, kind: ErrorKind, duration: Duration) {
        if let Ok(mut stats) = self.stage_stats.lock() {
            let entry = stats.entry(stage).or_default();
            entry.failed += 1;
            if kind == ErrorKind::Timeout {
                entry.timeouts += 1;
            }
            *entry.failures_by_kind.entry(kind.as_str()).or_insert(0) += 1;
            entry.record_time(duration);
        }
    }

    // Routing metrics
    pub fn retry_scheduled(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clarification_requested(&self) {
        self.clarifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fallback_taken(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handoff_taken(&self) {
        self.handoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dead_lettered(&self, code: DeadLetterCode) {
        if let Ok(mut counts) = self.dead_letters.lock() {
            *counts.entry(code).or_insert(0) += 1;
        }
    }

    // Terminal sink metrics
    pub fn delivery_completed(&self, routed_to: RoutedTo) {
        if let Ok(mut counts) = self.deliveries.lock() {
            *counts.entry(routed_to).or_insert(0) += 1;
        }
    }

    pub fn delivery_failed(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persistence_failed(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_node_state(&self, state: &str) {
        if let Ok(mut current_state) = self.node_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        let now = current_timestamp();
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.messages_received,
            &self.messages_published,
            &self.publish_failures,
            &self.connection_start_time,
            &self.retries,
            &self.clarifications,
            &self.fallbacks,
            &self.handoffs,
            &self.delivery_failures,
            &self.persistence_failures,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.bus_connected.store(false, Ordering::Relaxed);
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);

        if let Ok(mut counts) = self.dead_letters.lock() {
            counts.clear();
        }
        if let Ok(mut counts) = self.deliveries.lock() {
            counts.clear();
        }
        if let Ok(mut stats) = self.stage_stats.lock() {
            stats.clear();
        }
        if let Ok(mut state) = self.node_state.lock() {
            *state = "initializing".to_string();
        }
    }

    fn build_stage_snapshots(&self) -> BTreeMap<Stage, StageSnapshot> {
        let Ok(stats) = self.stage_stats.lock() else {
            return BTreeMap::new();
        };

        stats
            .iter()
            .map(|(stage, stats)| {
                let mut sorted = stats.times_ms.clone();
                sorted.sort_unstable();
                let avg = if sorted.is_empty() {
                    0.0
                } else {
                    sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
                };
                (
                    *stage,
                    StageSnapshot {
                        processed: stats.processed,
                        failed: stats.failed,
                        timeouts: stats.timeouts,
                        failures_by_kind: stats
                            .failures_by_kind
                            .iter()
                            .map(|(kind, count)| (kind.to_string(), *count))
                            .collect(),
                        avg_time_ms: avg,
                        time_p50_ms: percentile(&sorted, 50.0),
                        time_p95_ms: percentile(&sorted, 95.0),
                    },
                )
            })
            .collect()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connection_start = self.connection_start_time.load(Ordering::Relaxed);
        let connected = self.bus_connected.load(Ordering::Relaxed);

        MetricsSnapshot {
            bus: BusMetrics {
                connected,
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                connection_duration_seconds: if connected && connection_start > 0 {
                    now.saturating_sub(connection_start)
                } else {
                    0
                },
            },
            stages: self.build_stage_snapshots(),
            routing: RoutingMetrics {
                retries: self.retries.load(Ordering::Relaxed),
                clarifications: self.clarifications.load(Ordering::Relaxed),
                fallbacks: self.fallbacks.load(Ordering::Relaxed),
                handoffs: self.handoffs.load(Ordering::Relaxed),
                dead_letters: self
                    .dead_letters
                    .lock()
                    .map(|counts| counts.clone())
                    .unwrap_or_default(),
            },
            delivery: DeliveryMetrics {
                delivered: self
                    .deliveries
                    .lock()
                    .map(|counts| counts.clone())
                    .unwrap_or_default(),
                delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
                persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .node_state
                    .lock()
                    .map(|state| state.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MeshMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub bus: BusMetrics,
    pub stages: BTreeMap<Stage, StageSnapshot>,
    pub routing: RoutingMetrics,
    pub delivery: DeliveryMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct BusMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub messages_received: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct StageSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub avg_time_ms: f64,
    pub time_p50_ms: f64,
    pub time_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct RoutingMetrics {
    pub retries: u64,
    pub clarifications: u64,
    pub fallbacks: u64,
    pub handoffs: u64,
    pub dead_letters: BTreeMap<DeadLetterCode, u64>,
}

#[derive(Debug, Serialize)]
pub struct DeliveryMetrics {
    pub delivered: BTreeMap<RoutedTo, u64>,
    pub delivery_failures: u64,
    pub persistence_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}

//! Pure reconnection and connection health decisions
//!
//! The supervisor in [`client`](super::client) asks these functions what to do
//! next; they never perform I/O themselves.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Connection older than this without inbound traffic is reported idle
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(300);

pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether the supervisor should try another connection
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if config
            .max_attempts
            .is_some_and(|max| current_attempts >= max)
        {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.backoff_delay(attempt),
        }
    }

    /// How long `connect` waits for the first ConnAck
    pub fn connection_timeout(config: &ReconnectConfig) -> Duration {
        match config.total_backoff() {
            Some(total) => Duration::from_millis(total) + Duration::from_secs(30),
            None => Duration::from_secs(60),
        }
    }

    /// State after a connection event
    pub fn next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => {
                info!("MQTT client connected");
                ConnectionState::Connected
            }
            ConnectionEvent::DisconnectedByBroker => {
                info!("MQTT broker closed the connection");
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(reason) => {
                error!(error = %reason, "MQTT event loop error");
                ConnectionState::Disconnected(reason)
            }
            ConnectionEvent::ReconnectionStarted(attempt) => {
                info!(attempt, "Starting MQTT reconnection attempt");
                ConnectionState::Reconnecting(attempt)
            }
            ConnectionEvent::PermanentFailure(reason) => {
                error!(error = %reason, "MQTT connection permanently failed");
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Snapshot of connection health
    pub fn health_metrics(
        connect_time: Option<Instant>,
        last_inbound: Option<Instant>,
        reconnect_count: u32,
        pending_acks: usize,
    ) -> HealthMetrics {
        let now = Instant::now();
        let uptime = connect_time.map(|t| now.duration_since(t));
        let idle_for = last_inbound.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            idle_for,
            reconnect_count,
            pending_acks,
            is_healthy: uptime.is_some() && idle_for.map_or(true, |idle| idle < IDLE_THRESHOLD),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that drive state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub uptime: Option<Duration>,
    /// Time since the last inbound delivery
    pub idle_for: Option<Duration>,
    pub reconnect_count: u32,
    /// Deliveries handed to workers but not yet acknowledged
    pub pending_acks: usize,
    pub is_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnection_follows_backoff() {
        let config = ReconnectConfig::default();

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 50
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(9, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 10,
                delay_ms: 2000
            }
        );
    }

    #[test]
    fn test_reconnection_aborts() {
        let config = ReconnectConfig {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_connection_timeout() {
        assert_eq!(
            HealthMonitor::connection_timeout(&ReconnectConfig::default()),
            Duration::from_secs(60)
        );
        let limited = ReconnectConfig {
            max_attempts: Some(2),
            backoff_pattern: vec![100, 200],
            sustained_delay: 500,
        };
        assert_eq!(
            HealthMonitor::connection_timeout(&limited),
            Duration::from_millis(30_300)
        );
    }

    #[test]
    fn test_next_state() {
        assert_eq!(
            HealthMonitor::next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::next_state(ConnectionEvent::NetworkError("reset".to_string())),
            ConnectionState::Disconnected("reset".to_string())
        );
        assert_eq!(
            HealthMonitor::next_state(ConnectionEvent::ReconnectionStarted(4)),
            ConnectionState::Reconnecting(4)
        );
        assert_eq!(
            HealthMonitor::next_state(ConnectionEvent::PermanentFailure("gone".to_string())),
            ConnectionState::PermanentlyDisconnected("gone".to_string())
        );
    }

    #[test]
    fn test_health_metrics() {
        let now = Instant::now();

        let fresh = HealthMonitor::health_metrics(Some(now), None, 0, 0);
        assert!(fresh.is_healthy);

        let busy = HealthMonitor::health_metrics(
            Some(now - Duration::from_secs(600)),
            Some(now - Duration::from_secs(10)),
            1,
            3,
        );
        assert!(busy.is_healthy);
        assert_eq!(busy.pending_acks, 3);

        let idle = HealthMonitor::health_metrics(
            Some(now - Duration::from_secs(900)),
            Some(now - Duration::from_secs(600)),
            0,
            0,
        );
        assert!(!idle.is_healthy);

        let never = HealthMonitor::health_metrics(None, None, 0, 0);
        assert!(!never.is_healthy);
    }
}

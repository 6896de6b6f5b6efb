//! Pure connection state management for the MQTT transport
//!
//! Connection states, reconnection backoff, error types and broker option
//! construction. Nothing in here touches the network.

use crate::config::MqttSection;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for the MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected(String),
    /// Reconnecting, with the attempt number
    Reconnecting(u32),
    /// Reconnection attempts exhausted
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    /// Publishing and subscribing are only allowed while connected
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Reconnecting(_) => "reconnecting",
            ConnectionState::PermanentlyDisconnected(_) => "permanently_disconnected",
        }
    }
}

/// Reconnection backoff policy
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    /// Delays in milliseconds for the first attempts
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![50, 100, 250, 500, 1000],
            sustained_delay: 2000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given attempt (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    /// Sum of every delay, `None` when attempts are unlimited
    pub fn total_backoff(&self) -> Option<u64> {
        self.max_attempts
            .map(|max| (1..=max).map(|attempt| self.backoff_delay(attempt)).sum())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }
        if self.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Acknowledgement failed")]
    AckFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unknown delivery token: {0}")]
    UnknownAckToken(u64),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Build broker options for a mesh node
///
/// Acknowledgements are manual: an inbound publish is only acked once the
/// worker has published its successor.
pub fn configure_mqtt_options(
    mesh_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Unique per connection attempt so a reconnect never collides with the old session
    let client_id = format!("mesh-{mesh_id}-{}", chrono::Utc::now().timestamp_millis());
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    mqtt_options.set_manual_acks(true);
    // Messages carry the full trail, allow up to 256KB
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt_section(url: &str) -> MqttSection {
        MqttSection {
            broker_url: url.to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 30,
        }
    }

    #[test]
    fn test_backoff_pattern_then_sustained() {
        let config = ReconnectConfig::default();
        assert_eq!(config.backoff_delay(1), 50);
        assert_eq!(config.backoff_delay(5), 1000);
        assert_eq!(config.backoff_delay(6), 2000);
        assert_eq!(config.backoff_delay(60), 2000);
        // attempt 0 is treated like the first attempt
        assert_eq!(config.backoff_delay(0), 50);
    }

    #[test]
    fn test_total_backoff() {
        let unlimited = ReconnectConfig::default();
        assert_eq!(unlimited.total_backoff(), None);

        let limited = ReconnectConfig {
            max_attempts: Some(3),
            backoff_pattern: vec![10, 20],
            sustained_delay: 40,
        };
        assert_eq!(limited.total_backoff(), Some(70));
    }

    #[test]
    fn test_reconnect_config_validation() {
        assert!(ReconnectConfig::default().validate().is_ok());
        assert!(ReconnectConfig {
            max_attempts: Some(0),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ReconnectConfig {
            sustained_delay: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_only_connected_state_is_usable() {
        assert!(ConnectionState::Connected.is_usable());
        assert!(!ConnectionState::Connecting.is_usable());
        assert!(!ConnectionState::Reconnecting(2).is_usable());
        assert!(!ConnectionState::Disconnected("x".to_string()).is_usable());
        assert_eq!(
            ConnectionState::PermanentlyDisconnected("x".to_string()).label(),
            "permanently_disconnected"
        );
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options("node-1", &mqtt_section("mqtt://localhost:1883"));
        let options = options.unwrap();
        assert!(options.manual_acks());
        assert!(options.client_id().starts_with("mesh-node-1-"));
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn test_default_tls_port() {
        let options =
            configure_mqtt_options("node-1", &mqtt_section("mqtts://broker.example.com")).unwrap();
        assert_eq!(options.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let result = configure_mqtt_options("node-1", &mqtt_section("invalid-url"));
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }
}

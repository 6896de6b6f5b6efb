//! Mesh configuration loaded from TOML
//!
//! Only `[mesh] id` and `[mqtt] broker_url` are required; every other section
//! falls back to defaults. Secrets never live in the file: the file names the
//! environment variables that hold them and they are resolved at runtime.

use crate::protocol::route::Stage;
use crate::protocol::subjects::validate_mesh_id;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Complete mesh configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshConfig {
    pub mesh: MeshSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub escalation: EscalationSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub sessions: SessionSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    /// Generation falls back to templates when absent
    pub llm: Option<LlmSection>,
}

/// Node identity and worker layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshSection {
    /// Node identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Stages hosted by this node
    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,
    /// Workers per hosted stage
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Shared subscription group; nodes in one group split each stage queue
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// Hop ceiling guarding against routing loops
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

fn default_stages() -> Vec<Stage> {
    Stage::ALL.to_vec()
}

fn default_concurrency() -> usize {
    4
}

fn default_consumer_group() -> String {
    "support-mesh".to_string()
}

fn default_stage_timeout_ms() -> u64 {
    5000
}

fn default_max_hops() -> u32 {
    32
}

impl MeshSection {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}

/// Decision Router thresholds and signal lists
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingSection {
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f64,
    #[serde(default = "default_low_confidence")]
    pub low_confidence: f64,
    #[serde(default = "default_max_clarifications")]
    pub max_clarifications: u32,
    /// Intents that require the execution stage
    #[serde(default = "default_actionable_intents")]
    pub actionable_intents: Vec<String>,
    /// Phrases that force a human handoff
    #[serde(default = "default_safety_keywords")]
    pub safety_keywords: Vec<String>,
}

fn default_high_confidence() -> f64 {
    0.85
}

fn default_low_confidence() -> f64 {
    0.5
}

fn default_max_clarifications() -> u32 {
    2
}

fn default_actionable_intents() -> Vec<String> {
    ["refund", "order_update", "cancel_order"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_safety_keywords() -> Vec<String> {
    ["self harm", "suicide", "lawsuit", "lawyer", "fraud", "threat"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            high_confidence: default_high_confidence(),
            low_confidence: default_low_confidence(),
            max_clarifications: default_max_clarifications(),
            actionable_intents: default_actionable_intents(),
            safety_keywords: default_safety_keywords(),
        }
    }
}

/// Escalation Router policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Canned responses keyed by error kind or stage name
    #[serde(default = "default_fallback_templates")]
    pub fallback_templates: BTreeMap<String, String>,
}

fn default_max_retries() -> u32 {
    3
}

/// Template key for an exhausted clarification loop
pub const CLARIFICATION_TEMPLATE_KEY: &str = "low_confidence";

/// Used when a custom template table leaves out the clarification key
pub const DEFAULT_CLARIFICATION_TEMPLATE: &str = "I want to make sure I help with the right thing. Could you clarify what you need, for example an order number or what went wrong?";

fn default_fallback_templates() -> BTreeMap<String, String> {
    [
        (CLARIFICATION_TEMPLATE_KEY, DEFAULT_CLARIFICATION_TEMPLATE),
        (
            "sentiment",
            "Thanks for reaching out. We received your message and will follow up shortly.",
        ),
        (
            "intent",
            "Thanks for your message. Could you tell us a bit more about what you need help with?",
        ),
        (
            "context",
            "Thanks for reaching out. We could not load your account details right now, so a specialist will follow up by email.",
        ),
        (
            "response",
            "Thanks for your patience. We are looking into this and will get back to you shortly.",
        ),
        (
            "guardrails",
            "Thanks for your patience. A member of our team will review your request and reply shortly.",
        ),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for EscalationSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            fallback_templates: default_fallback_templates(),
        }
    }
}

/// Customer context lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextSection {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Profile service base URL; profiles are looked up in memory when absent
    pub profile_service_url: Option<String>,
}

fn default_cache_ttl() -> u64 {
    7200
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            profile_service_url: None,
        }
    }
}

/// Conversation state kept by gateway nodes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Idle time after which a session is forgotten
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,
}

fn default_session_ttl() -> u64 {
    86400
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditSection {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_database_url() -> String {
    "sqlite://support-mesh.db".to_string()
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

/// Downstream action service; actions are accepted locally when absent
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSection {
    pub service_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    /// Provider name, only "openai" compatible endpoints are supported
    pub provider: String,
    pub model: String,
    /// Environment variable containing API key
    pub api_key_env: String,
    /// Override for OpenAI-compatible endpoints
    pub base_url: Option<String>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Optional temperature (0.0 to 2.0)
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Bound on one generation call; must stay below the stage timeout
    pub timeout_ms: Option<u64>,
}

fn default_system_prompt() -> String {
    "You are a courteous customer support agent. Answer in two or three sentences and never promise refunds or credits that are not confirmed.".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid mesh ID format: {0}")]
    InvalidMeshId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MeshConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved configuration rendered back to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check identifiers, thresholds and limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_mesh_id(&self.mesh.id).map_err(|e| {
            ConfigError::InvalidMeshId(format!(
                "Mesh ID '{}' must match pattern [a-zA-Z0-9._-]+ ({e})",
                self.mesh.id
            ))
        })?;
        validate_mesh_id(&self.mesh.consumer_group).map_err(|e| {
            ConfigError::InvalidConfig(format!("consumer_group is not a valid identifier: {e}"))
        })?;

        if self.mesh.stages.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[mesh] stages must name at least one stage".to_string(),
            ));
        }
        if self.mesh.concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "[mesh] concurrency must be greater than zero".to_string(),
            ));
        }
        if self.mesh.stage_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "[mesh] stage_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.mesh.max_hops == 0 {
            return Err(ConfigError::InvalidConfig(
                "[mesh] max_hops must be greater than zero".to_string(),
            ));
        }

        let routing = &self.routing;
        for (name, value) in [
            ("high_confidence", routing.high_confidence),
            ("low_confidence", routing.low_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidConfig(format!(
                    "[routing] {name} must be between 0.0 and 1.0, got {value}"
                )));
            }
        }
        if routing.low_confidence > routing.high_confidence {
            return Err(ConfigError::InvalidConfig(format!(
                "[routing] low_confidence {} exceeds high_confidence {}",
                routing.low_confidence, routing.high_confidence
            )));
        }

        if self.sessions.ttl_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "[sessions] ttl_secs must be greater than zero".to_string(),
            ));
        }

        if self.context.cache_ttl_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "[context] cache_ttl_secs must be greater than zero".to_string(),
            ));
        }

        if let Some(llm) = &self.llm {
            if llm.provider != "openai" {
                return Err(ConfigError::InvalidConfig(format!(
                    "[llm] provider '{}' is not supported, use \"openai\"",
                    llm.provider
                )));
            }
            if let Some(timeout_ms) = llm.timeout_ms {
                if timeout_ms == 0 || timeout_ms >= self.mesh.stage_timeout_ms {
                    return Err(ConfigError::InvalidConfig(format!(
                        "[llm] timeout_ms must be between 1 and stage_timeout_ms ({}), got {timeout_ms}",
                        self.mesh.stage_timeout_ms
                    )));
                }
            }
            if let Some(temperature) = llm.temperature {
                if !(0.0..=2.0).contains(&temperature) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "[llm] temperature must be between 0.0 and 2.0, got {temperature}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// LLM API key, `None` when generation is not configured
    pub fn get_llm_api_key(&self) -> Result<Option<String>, ConfigError> {
        match &self.llm {
            Some(llm) => Self::get_env_var_required(&llm.api_key_env).map(Some),
            None => Ok(None),
        }
    }

    /// Time the response stage gives its generator before using the template
    ///
    /// Defaults to 80% of the stage timeout so the fallback always runs
    /// inside the hop.
    pub fn generation_timeout(&self) -> Duration {
        self.llm
            .as_ref()
            .and_then(|llm| llm.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.mesh.stage_timeout() * 4 / 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[mesh]
id = "support-node-1"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = MeshConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.mesh.id, "support-node-1");
        assert_eq!(config.mesh.stages, Stage::ALL.to_vec());
        assert_eq!(config.mesh.concurrency, 4);
        assert_eq!(config.mesh.stage_timeout(), Duration::from_millis(5000));
        assert_eq!(config.routing.high_confidence, 0.85);
        assert_eq!(config.routing.low_confidence, 0.5);
        assert_eq!(config.routing.max_clarifications, 2);
        assert_eq!(config.escalation.max_retries, 3);
        assert!(config
            .escalation
            .fallback_templates
            .contains_key("low_confidence"));
        assert!(!config.escalation.fallback_templates.contains_key("execution"));
        assert_eq!(config.context.cache_ttl_secs, 7200);
        assert!(config.llm.is_none());
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mesh]
id = "edge.node_2"
stages = ["intent", "aggregator"]
concurrency = 2
consumer_group = "eu-west"
stage_timeout_ms = 1500
max_hops = 20

[mqtt]
broker_url = "mqtts://broker.example.com:8883"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"

[routing]
high_confidence = 0.9
low_confidence = 0.4
actionable_intents = ["refund"]

[escalation]
max_retries = 1

[escalation.fallback_templates]
intent = "Please rephrase."

[context]
cache_ttl_secs = 60
profile_service_url = "http://profiles.internal"

[audit]
database_url = "sqlite::memory:"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
temperature = 0.2
"#;

        let config = MeshConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.mesh.stages, vec![Stage::Intent, Stage::Aggregator]);
        assert_eq!(config.mesh.consumer_group, "eu-west");
        assert_eq!(config.routing.actionable_intents, vec!["refund"]);
        assert_eq!(config.escalation.fallback_templates.len(), 1);
        assert_eq!(
            config.context.profile_service_url.as_deref(),
            Some("http://profiles.internal")
        );
        let llm = config.llm.unwrap();
        assert_eq!(llm.model, "gpt-4o-mini");
        assert!(llm.system_prompt.contains("customer support"));
    }

    #[test]
    fn test_invalid_mesh_id() {
        let toml_content = MINIMAL.replace("support-node-1", "bad@node");
        let result = MeshConfig::from_toml_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidMeshId(_))));
    }

    #[test]
    fn test_thresholds_validated() {
        let inverted = format!("{MINIMAL}\n[routing]\nhigh_confidence = 0.3\nlow_confidence = 0.6\n");
        assert!(matches!(
            MeshConfig::from_toml_str(&inverted),
            Err(ConfigError::InvalidConfig(_))
        ));

        let out_of_range = format!("{MINIMAL}\n[routing]\nhigh_confidence = 1.5\n");
        assert!(matches!(
            MeshConfig::from_toml_str(&out_of_range),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_limits_rejected() {
        for field in ["concurrency = 0", "stage_timeout_ms = 0", "max_hops = 0", "stages = []"] {
            let toml_content = MINIMAL.replace(
                "id = \"support-node-1\"",
                &format!("id = \"support-node-1\"\n{field}"),
            );
            assert!(
                MeshConfig::from_toml_str(&toml_content).is_err(),
                "{field} should be rejected"
            );
        }
    }

    #[test]
    fn test_unsupported_llm_provider() {
        let toml_content = format!(
            "{MINIMAL}\n[llm]\nprovider = \"anthropic\"\nmodel = \"x\"\napi_key_env = \"K\"\n"
        );
        assert!(matches!(
            MeshConfig::from_toml_str(&toml_content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_render_round_trip() {
        let config = MeshConfig::from_toml_str(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let back = MeshConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_missing_api_key_env() {
        let toml_content = format!(
            "{MINIMAL}\n[llm]\nprovider = \"openai\"\nmodel = \"x\"\napi_key_env = \"SUPPORT_MESH_TEST_UNSET_KEY\"\n"
        );
        let config = MeshConfig::from_toml_str(&toml_content).unwrap();
        assert!(matches!(
            config.get_llm_api_key(),
            Err(ConfigError::EnvVarNotFound(_))
        ));

        let no_llm = MeshConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(no_llm.get_llm_api_key().unwrap(), None);
    }
}

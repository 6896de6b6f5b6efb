//! Shared helpers for integration tests

use support_mesh::config::MeshConfig;

/// Minimal configuration hosting every stage with in-process fallbacks
#[allow(dead_code)]
pub fn test_config() -> MeshConfig {
    MeshConfig::from_toml_str(
        r#"
[mesh]
id = "test-mesh"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    )
    .expect("test config parses")
}

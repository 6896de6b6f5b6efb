//! Tests for logging configuration and format parsing
//!
//! Exercises the public logging surface the binaries rely on.

use support_mesh::observability::logging::{build_filter, init_logging, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_unknown_format_defaults_to_json() {
    // Production deployments expect machine-readable logs
    for input in ["", "xml", "yaml", "  pretty  "] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input:?}");
    }
}

#[test]
fn test_unknown_level_defaults_to_info() {
    assert_eq!(parse_level("loud"), Level::INFO);
    assert_eq!(parse_level("warn"), Level::WARN);
}

#[test]
fn test_filter_keeps_bus_client_quiet() {
    let filter = build_filter(Level::TRACE, None).to_string();
    assert!(filter.contains("trace"));
    assert!(filter.contains("rumqttc=warn"));
}

#[test]
fn test_init_logging_twice_is_harmless() {
    init_logging(Level::DEBUG, LogFormat::Compact, false);
    init_logging(Level::INFO, LogFormat::Json, true);
    tracing::info!(stage = "sentiment", "Logging initialized");
}

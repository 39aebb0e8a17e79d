//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use relay_mesh::config::{MeshConfig, DEFAULT_BASE_PORT, DEFAULT_INIT_ID};
use std::time::Duration;

#[test]
fn test_default_config_validates() {
    let config = MeshConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert_eq!(config.network.base_port, DEFAULT_BASE_PORT);
    assert_eq!(config.network.init_id, DEFAULT_INIT_ID);
}

#[test]
fn test_privileged_base_port() {
    let mut config = MeshConfig::default();
    config.network.base_port = 80;

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Base port too low")));
}

#[test]
fn test_direct_port_range_underflow() {
    let mut config = MeshConfig::default();
    config.network.base_port = 1100;
    config.lobby.max_members = 200;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Direct port range underflows")));
}

#[test]
fn test_mesh_port_range_overflow() {
    let mut config = MeshConfig::default();
    config.network.base_port = 65500;
    config.lobby.max_members = 100;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Mesh port range overflows")));
}

#[test]
fn test_init_id_sentinel_collision() {
    let mut config = MeshConfig::default();
    config.network.init_id = i32::MAX;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("reserved sentinel")));
}

#[test]
fn test_nonpositive_init_id() {
    let mut config = MeshConfig::default();
    config.network.init_id = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("must be positive")));
}

#[test]
fn test_countdown_too_long() {
    let mut config = MeshConfig::default();
    config.lobby.countdown_secs = 7200;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Countdown too long")));
}

#[test]
fn test_connect_timeout_bounds() {
    let mut config = MeshConfig::default();
    config.lobby.connect_timeout = Duration::from_millis(10);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connect timeout too short")));

    config.lobby.connect_timeout = Duration::from_secs(600);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connect timeout too long")));
}

#[test]
fn test_max_members_lower_bound() {
    let mut config = MeshConfig::default();
    config.lobby.max_members = 1;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("at least 2")));
}

#[test]
fn test_poll_interval_exceeding_timeout() {
    let mut config = MeshConfig::default();
    config.mesh.poll_interval = Duration::from_secs(60);
    config.mesh.establish_timeout = Duration::from_secs(10);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Poll interval cannot exceed")));
}

#[test]
fn test_empty_app_name() {
    let mut config = MeshConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_validate_strict_rejects_bad_config() {
    let mut config = MeshConfig::default();
    config.network.base_port = 80;

    let result = config.validate_strict();
    assert!(matches!(result, Err(relay_mesh::MeshError::Config(_))));
}

#[test]
fn test_example_config_parses_back() {
    let example = MeshConfig::example_config();
    let config = MeshConfig::from_toml(&example).expect("example config must parse");
    assert!(config.validate().is_empty());
}

#[test]
fn test_partial_toml_fills_defaults() {
    let config = MeshConfig::from_toml(
        r#"
        [network]
        bind_addr = "0.0.0.0"
        advertise_addr = "10.0.0.5"
        base_port = 30000
        init_id = 500

        [trust]
        accept_address_fallback = true
        "#,
    )
    .expect("partial TOML must parse");

    assert_eq!(config.network.base_port, 30000);
    assert_eq!(config.network.init_id, 500);
    assert!(config.trust.accept_address_fallback);
    assert_eq!(config.lobby.countdown_secs, 5);
    assert!(config.validate().is_empty());
}

#[test]
fn test_invalid_toml_is_a_config_error() {
    let result = MeshConfig::from_toml("network = \"not a table\"");
    assert!(matches!(result, Err(relay_mesh::MeshError::Config(_))));
}

#[test]
fn test_default_with_overrides() {
    let config = MeshConfig::default_with_overrides(|c| {
        c.lobby.countdown_secs = 10;
        c.network.base_port = 40000;
    });
    assert_eq!(config.lobby.countdown_secs, 10);
    assert_eq!(config.network.base_port, 40000);
    assert!(config.validate().is_empty());
}

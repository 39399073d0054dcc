//! Integration tests for configuration loading

use broker_node::infra::Config;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[node]
id = "edge-1"
name = "Edge broker"

[listeners]
bind_address = "127.0.0.1"
mqtt_port = 8883
ws_port = 8080

[tls]
enabled = true
cert = "/etc/broker/cert.pem"
key = "/etc/broker/key.pem"

[auth]
username = "device"
password = "secret"

[persistence]
enabled = true
user_dir = "/var/lib/broker"
snapshot_interval_secs = 15

[output]
file = "/var/log/broker/events.jsonl"
publish_events = true
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.node_id(), "edge-1");
    assert_eq!(config.node_name(), Some("Edge broker"));
    assert_eq!(config.bind_address(), "127.0.0.1");
    assert_eq!(config.mqtt_port(), 8883);
    assert_eq!(config.ws_port(), 8080);
    assert!(config.use_tls());
    assert_eq!(config.tls_cert(), Some("/etc/broker/cert.pem"));
    assert_eq!(config.tls_ca(), None);
    assert_eq!(config.credentials(), Some(("device", "secret")));
    assert!(config.persist_to_file());
    assert_eq!(config.user_dir(), Path::new("/var/lib/broker"));
    assert_eq!(config.snapshot_interval(), Duration::from_secs(15));
    assert_eq!(config.output_file(), "/var/log/broker/events.jsonl");
    assert!(config.publish_events());
}

#[test]
fn test_partial_config_uses_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[node]\nid = \"n2\"\n").unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();
    assert_eq!(config.node_id(), "n2");
    assert_eq!(config.mqtt_port(), 1883);
    assert!(!config.persist_to_file());
    assert_eq!(config.snapshot_interval(), Duration::from_secs(60));
}

#[test]
fn test_invalid_toml_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[listeners\nmqtt_port = ").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.node_id(), "broker");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.config_file(), "default");
}

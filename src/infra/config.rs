//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/broker.toml

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    /// Stable instance identifier; names the snapshot file
    #[serde(default = "default_node_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_node_id() -> String {
    "broker".to_string()
}

impl Default for NodeSection {
    fn default() -> Self {
        Self { id: default_node_id(), name: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenersSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Raw MQTT port (0 to disable)
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    /// MQTT over WebSocket port (0 to disable)
    #[serde(default)]
    pub ws_port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

impl Default for ListenersSection {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), mqtt_port: default_mqtt_port(), ws_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    /// Certificate chain path (PEM)
    #[serde(default)]
    pub cert: Option<String>,
    /// Private key path (PEM)
    #[serde(default)]
    pub key: Option<String>,
    /// CA bundle path (PEM)
    #[serde(default)]
    pub ca: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthSection {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSection {
    /// Snapshot retained messages to disk
    #[serde(default)]
    pub enabled: bool,
    /// Directory holding snapshot files
    #[serde(default = "default_user_dir")]
    pub user_dir: String,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_user_dir() -> String {
    ".".to_string()
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            enabled: false,
            user_dir: default_user_dir(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSection {
    /// File receiving node output messages (JSONL format)
    #[serde(default = "default_output_file")]
    pub file: String,
    /// Relay every publish on output port 1
    #[serde(default)]
    pub publish_events: bool,
}

fn default_output_file() -> String {
    "broker-events.jsonl".to_string()
}

impl Default for OutputSection {
    fn default() -> Self {
        Self { file: default_output_file(), publish_events: false }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub listeners: ListenersSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub output: OutputSection,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    node_id: String,
    node_name: Option<String>,
    bind_address: String,
    mqtt_port: u16,
    ws_port: u16,
    use_tls: bool,
    tls_cert: Option<String>,
    tls_key: Option<String>,
    tls_ca: Option<String>,
    username: Option<String>,
    password: Option<String>,
    persist_to_file: bool,
    user_dir: PathBuf,
    snapshot_interval_secs: u64,
    output_file: String,
    publish_events: bool,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

/// Treat blank strings as unset, trimming the rest
fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            node_id: toml_config.node.id,
            node_name: toml_config.node.name,
            bind_address: toml_config.listeners.bind_address,
            mqtt_port: toml_config.listeners.mqtt_port,
            ws_port: toml_config.listeners.ws_port,
            use_tls: toml_config.tls.enabled,
            tls_cert: non_blank(toml_config.tls.cert),
            tls_key: non_blank(toml_config.tls.key),
            tls_ca: non_blank(toml_config.tls.ca),
            username: non_blank(toml_config.auth.username),
            password: toml_config.auth.password.filter(|p| !p.is_empty()),
            persist_to_file: toml_config.persistence.enabled,
            user_dir: PathBuf::from(toml_config.persistence.user_dir),
            snapshot_interval_secs: toml_config.persistence.snapshot_interval_secs.max(1),
            output_file: toml_config.output.file,
            publish_events: toml_config.output.publish_events,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/broker.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "config_fallback_to_defaults");
                Self::default()
            }
        }
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn ws_port(&self) -> u16 {
        self.ws_port
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn tls_cert(&self) -> Option<&str> {
        self.tls_cert.as_deref()
    }

    pub fn tls_key(&self) -> Option<&str> {
        self.tls_key.as_deref()
    }

    pub fn tls_ca(&self) -> Option<&str> {
        self.tls_ca.as_deref()
    }

    /// Credentials are only enforced when both are set
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }

    pub fn persist_to_file(&self) -> bool {
        self.persist_to_file
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn output_file(&self) -> &str {
        &self.output_file
    }

    pub fn publish_events(&self) -> bool {
        self.publish_events
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder methods for tests and embedding
    pub fn with_node_id(mut self, id: &str) -> Self {
        self.node_id = id.to_string();
        self
    }

    pub fn with_persistence(mut self, user_dir: impl Into<PathBuf>) -> Self {
        self.persist_to_file = true;
        self.user_dir = user_dir.into();
        self
    }

    pub fn with_bind_address(mut self, bind_address: &str) -> Self {
        self.bind_address = bind_address.to_string();
        self
    }

    pub fn with_ports(mut self, mqtt_port: u16, ws_port: u16) -> Self {
        self.mqtt_port = mqtt_port;
        self.ws_port = ws_port;
        self
    }

    pub fn with_tls(mut self, cert: Option<&str>, key: Option<&str>, ca: Option<&str>) -> Self {
        self.use_tls = true;
        self.tls_cert = cert.map(str::to_string);
        self.tls_key = key.map(str::to_string);
        self.tls_ca = ca.map(str::to_string);
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }
}

//! Infrastructure - configuration and broker engine
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `broker` - Embedded MQTT broker (rumqttd)

pub mod broker;
pub mod config;

// Re-export commonly used types
pub use broker::BrokerSetupError;
pub use config::Config;

//! Domain models - retained messages and broker events
//!
//! This module contains the canonical data types used throughout the node:
//! - `RetainedMessage` - one topic's last retained publication
//! - `Qos` - validated MQTT quality of service
//! - `BrokerEvent` - engine lifecycle events
//! - `NodeMessage` / `NodeStatus` - what the node reports to the host

pub mod events;
pub mod types;

// Re-export commonly used types at module level
pub use events::{BrokerEvent, EventTranslator, NodeMessage, NodeStatus};
pub use types::{ClientInfo, Qos, RetainedMessage};

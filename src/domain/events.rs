//! Broker lifecycle events and their translation into host messages
//!
//! The engine reports lifecycle changes as `BrokerEvent`s on a single channel.
//! `translate` turns each event into the messages the node emits:
//! port 0 carries lifecycle events, port 1 carries publish events.

use crate::domain::types::{ClientInfo, Qos};
use serde::Serialize;
use serde_json::{json, Value};

/// Output port for client lifecycle events
pub const EVENTS_PORT: usize = 0;
/// Output port for publish events
pub const PUBLISH_PORT: usize = 1;

/// A publish observed by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishPacket {
    pub topic: String,
    /// Payload as UTF-8 when valid, otherwise lossy
    pub payload: String,
    pub qos: Qos,
    pub retain: bool,
}

/// A single subscription request from a client
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: Qos,
}

/// Every lifecycle event the engine can report
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Client(ClientInfo),
    ClientReady(ClientInfo),
    ClientDisconnect(ClientInfo),
    ClientError { client: ClientInfo, error: String },
    ConnectionError { client: ClientInfo, error: String },
    KeepaliveTimeout(ClientInfo),
    Subscribe { client: ClientInfo, subscriptions: Vec<Subscription> },
    Unsubscribe { client: ClientInfo, topics: Vec<String> },
    Publish { client: Option<ClientInfo>, packet: PublishPacket },
    Closed,
}

impl BrokerEvent {
    /// Event name as exposed to the host (message topic)
    pub fn name(&self) -> &'static str {
        match self {
            BrokerEvent::Client(_) => "client",
            BrokerEvent::ClientReady(_) => "clientReady",
            BrokerEvent::ClientDisconnect(_) => "clientDisconnect",
            BrokerEvent::ClientError { .. } => "clientError",
            BrokerEvent::ConnectionError { .. } => "connectionError",
            BrokerEvent::KeepaliveTimeout(_) => "keepaliveTimeout",
            BrokerEvent::Subscribe { .. } => "subscribe",
            BrokerEvent::Unsubscribe { .. } => "unsubscribe",
            BrokerEvent::Publish { .. } => "publish",
            BrokerEvent::Closed => "closed",
        }
    }
}

/// Message sent to one of the node's outputs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeMessage {
    pub topic: String,
    pub payload: Value,
}

impl NodeMessage {
    fn new(topic: &str, payload: Value) -> Self {
        Self { topic: topic.to_string(), payload }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFill {
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusShape {
    Dot,
    Ring,
}

/// Node status indicator shown by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub fill: StatusFill,
    pub shape: StatusShape,
    pub text: String,
}

impl NodeStatus {
    pub fn connected() -> Self {
        Self { fill: StatusFill::Green, shape: StatusShape::Dot, text: "connected".to_string() }
    }

    pub fn disconnected() -> Self {
        Self { fill: StatusFill::Red, shape: StatusShape::Ring, text: "disconnected".to_string() }
    }

    pub fn clients(count: usize) -> Self {
        Self { fill: StatusFill::Green, shape: StatusShape::Dot, text: format!("{} connected", count) }
    }

    pub fn failed(text: &str) -> Self {
        Self { fill: StatusFill::Red, shape: StatusShape::Ring, text: text.to_string() }
    }
}

/// Result of translating one event
#[derive(Debug, Default, PartialEq)]
pub struct Translation {
    /// (port, message) pairs in emission order
    pub outputs: Vec<(usize, NodeMessage)>,
    pub status: Option<NodeStatus>,
}

/// Tracks connected clients and translates events into host output
#[derive(Debug, Default)]
pub struct EventTranslator {
    connected: usize,
    publish_events: bool,
}

impl EventTranslator {
    pub fn new(publish_events: bool) -> Self {
        Self { connected: 0, publish_events }
    }

    pub fn connected_clients(&self) -> usize {
        self.connected
    }

    pub fn translate(&mut self, event: &BrokerEvent) -> Translation {
        let name = event.name();
        let mut out = Translation::default();

        match event {
            BrokerEvent::Client(client) => {
                out.outputs.push((EVENTS_PORT, NodeMessage::new(name, json!({ "client": client }))));
            }
            BrokerEvent::ClientReady(client) => {
                self.connected += 1;
                out.outputs.push((EVENTS_PORT, NodeMessage::new(name, json!({ "client": client }))));
                out.status = Some(NodeStatus::clients(self.connected));
            }
            BrokerEvent::ClientDisconnect(client) => {
                self.connected = self.connected.saturating_sub(1);
                out.outputs.push((EVENTS_PORT, NodeMessage::new(name, json!({ "client": client }))));
                out.status = Some(NodeStatus::clients(self.connected));
            }
            BrokerEvent::ClientError { client, error }
            | BrokerEvent::ConnectionError { client, error } => {
                out.outputs.push((
                    EVENTS_PORT,
                    NodeMessage::new(name, json!({ "client": client, "err": error })),
                ));
                out.status = Some(NodeStatus::clients(self.connected));
            }
            BrokerEvent::KeepaliveTimeout(client) => {
                out.outputs.push((EVENTS_PORT, NodeMessage::new(name, json!({ "client": client }))));
                out.status = Some(NodeStatus::clients(self.connected));
            }
            BrokerEvent::Subscribe { client, subscriptions } => {
                for sub in subscriptions {
                    out.outputs.push((
                        EVENTS_PORT,
                        NodeMessage::new(
                            name,
                            json!({ "topic": sub.topic, "qos": sub.qos, "client": client }),
                        ),
                    ));
                }
            }
            BrokerEvent::Unsubscribe { client, topics } => {
                for topic in topics {
                    out.outputs.push((
                        EVENTS_PORT,
                        NodeMessage::new(name, json!({ "topic": topic, "client": client })),
                    ));
                }
            }
            BrokerEvent::Publish { client, packet } => {
                if self.publish_events {
                    out.outputs.push((
                        PUBLISH_PORT,
                        NodeMessage::new(name, json!({ "packet": packet, "client": client })),
                    ));
                }
            }
            BrokerEvent::Closed => {}
        }

        out
    }
}

//! Shared types for the broker node

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// MQTT quality of service level, restricted to 0, 1 or 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(transparent)]
pub struct Qos(u8);

impl Qos {
    pub const AT_MOST_ONCE: Qos = Qos(0);
    pub const AT_LEAST_ONCE: Qos = Qos(1);
    pub const EXACTLY_ONCE: Qos = Qos(2);

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Qos {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value <= 2 {
            Ok(Qos(value))
        } else {
            Err(InvalidQos(value))
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> u8 {
        qos.0
    }
}

impl std::fmt::Display for Qos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid qos {0}, expected 0, 1 or 2")]
pub struct InvalidQos(pub u8);

/// Last-known retained publication for one topic
///
/// An empty payload is the MQTT deletion signal for the topic's retained state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
}

impl RetainedMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: Qos) -> Self {
        Self { topic: topic.into(), payload: payload.into(), qos, retain: true }
    }

    /// True when this message clears the topic instead of setting it
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Identity of a client connected to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ClientInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), user: None }
    }
}

impl std::fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_range() {
        assert_eq!(Qos::try_from(0).unwrap(), Qos::AT_MOST_ONCE);
        assert_eq!(Qos::try_from(2).unwrap(), Qos::EXACTLY_ONCE);
        assert_eq!(Qos::try_from(3), Err(InvalidQos(3)));
    }

    #[test]
    fn test_qos_serde_rejects_out_of_range() {
        let ok: Qos = serde_json::from_str("1").unwrap();
        assert_eq!(ok, Qos::AT_LEAST_ONCE);
        assert!(serde_json::from_str::<Qos>("7").is_err());
        assert_eq!(serde_json::to_string(&Qos::EXACTLY_ONCE).unwrap(), "2");
    }

    #[test]
    fn test_tombstone() {
        let cleared = RetainedMessage::new("a/b", Bytes::new(), Qos::AT_MOST_ONCE);
        assert!(cleared.is_tombstone());
        assert!(cleared.retain);

        let set = RetainedMessage::new("a/b", "on", Qos::AT_MOST_ONCE);
        assert!(!set.is_tombstone());
    }
}

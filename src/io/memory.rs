//! In-memory retained store
//!
//! Last write wins per topic. Storing an empty payload removes the topic,
//! which is how MQTT clients clear retained state. With an engine running it
//! holds the last set read back from the router (see `io::engine_retained`).

use crate::domain::types::{Qos, RetainedMessage};
use crate::io::persistence::{PersistenceError, RetainedPersistence};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryPersistence {
    retained: RwLock<FxHashMap<String, RetainedMessage>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a retained publish synchronously (used from engine threads)
    pub fn apply(&self, message: RetainedMessage) -> Result<(), PersistenceError> {
        if message.topic.is_empty() {
            return Err(PersistenceError::InvalidMessage {
                topic: message.topic,
                reason: "empty topic".to_string(),
            });
        }

        let mut retained = self.retained.write();
        if message.is_tombstone() {
            debug!(topic = %message.topic, "retained_cleared");
            retained.remove(&message.topic);
        } else {
            retained.insert(message.topic.clone(), message);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.retained.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.read().is_empty()
    }

    pub fn get(&self, topic: &str) -> Option<RetainedMessage> {
        self.retained.read().get(topic).cloned()
    }

    /// Every retained message, ordered by topic
    pub fn messages(&self) -> Vec<RetainedMessage> {
        let mut all: Vec<RetainedMessage> = self.retained.read().values().cloned().collect();
        all.sort_by(|a, b| a.topic.cmp(&b.topic));
        all
    }

    /// Replace every entry matching `filters` with the engine's retained set
    ///
    /// The engine does not report the level a message was published with. An
    /// unchanged payload keeps its stored qos, anything new is stored as QoS 0.
    /// Returns the number of topics dropped because the engine no longer has them.
    pub fn sync(&self, filters: &[&str], engine: Vec<(String, Bytes)>) -> usize {
        let mut retained = self.retained.write();

        let mut fresh = FxHashMap::default();
        for (topic, payload) in engine {
            if topic.is_empty() || payload.is_empty() {
                continue;
            }
            let qos = match retained.get(&topic) {
                Some(known) if known.payload == payload => known.qos,
                _ => Qos::AT_MOST_ONCE,
            };
            fresh.insert(topic.clone(), RetainedMessage::new(topic, payload, qos));
        }

        let mut dropped = 0;
        retained.retain(|topic, _| {
            let matched = filters.iter().any(|f| topic_matches(f, topic));
            if matched && !fresh.contains_key(topic) {
                dropped += 1;
            }
            !matched
        });
        retained.extend(fresh);
        dropped
    }

    fn matching(&self, filters: &[&str]) -> Vec<RetainedMessage> {
        let retained = self.retained.read();
        retained
            .values()
            .filter(|msg| filters.iter().any(|f| topic_matches(f, &msg.topic)))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RetainedPersistence for MemoryPersistence {
    fn create_retained_stream_combi(
        &self,
        filters: &[&str],
    ) -> BoxStream<'static, Result<RetainedMessage, PersistenceError>> {
        if let Some(bad) = filters.iter().find(|f| !is_valid_filter(f)) {
            let err = PersistenceError::InvalidFilter(bad.to_string());
            return stream::once(async move { Err(err) }).boxed();
        }

        // Copy out under the lock so the stream reflects the set at call time
        let messages = self.matching(filters);
        stream::iter(messages.into_iter().map(Ok)).boxed()
    }

    async fn store_retained(&self, message: RetainedMessage) -> Result<(), PersistenceError> {
        self.apply(message)
    }
}

/// Check an MQTT topic filter: `#` only as the whole last level, `+` only as a whole level
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| {
        if level.contains('#') {
            *level == "#" && i == last
        } else if level.contains('+') {
            *level == "+"
        } else {
            true
        }
    })
}

/// MQTT topic filter matching with `+` and `#` wildcards
///
/// Wildcards at the first level never match topics starting with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let fp: Vec<&str> = filter.split('/').collect();
    let tp: Vec<&str> = topic.split('/').collect();

    let mut fi = 0usize;
    let mut ti = 0usize;

    while fi < fp.len() {
        let f = fp[fi];
        if f == "#" {
            return true;
        }
        if ti >= tp.len() {
            return false;
        }
        if f != "+" && f != tp[ti] {
            return false;
        }
        fi += 1;
        ti += 1;
    }
    ti == tp.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(store: &MemoryPersistence, filters: &[&str]) -> Vec<RetainedMessage> {
        let mut out: Vec<RetainedMessage> = store
            .create_retained_stream_combi(filters)
            .map(|r| r.unwrap())
            .collect()
            .await;
        out.sort_by(|a, b| a.topic.cmp(&b.topic));
        out
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("#", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("#", "$SYS/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn test_is_valid_filter() {
        assert!(is_valid_filter("#"));
        assert!(is_valid_filter("a/+/b/#"));
        assert!(!is_valid_filter(""));
        assert!(!is_valid_filter("a/#/b"));
        assert!(!is_valid_filter("a/b#"));
        assert!(!is_valid_filter("a+/b"));
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let store = MemoryPersistence::new();
        store.store_retained(RetainedMessage::new("t", "one", Qos::AT_MOST_ONCE)).await.unwrap();
        store.store_retained(RetainedMessage::new("t", "two", Qos::EXACTLY_ONCE)).await.unwrap();

        let all = collect(&store, &["#"]).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, Bytes::from("two"));
        assert_eq!(all[0].qos, Qos::EXACTLY_ONCE);
    }

    #[tokio::test]
    async fn test_empty_payload_clears_topic() {
        let store = MemoryPersistence::new();
        store.store_retained(RetainedMessage::new("t", "x", Qos::AT_MOST_ONCE)).await.unwrap();
        store.store_retained(RetainedMessage::new("t", Bytes::new(), Qos::AT_MOST_ONCE)).await.unwrap();
        assert!(store.is_empty());
        assert!(collect(&store, &["#"]).await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_filters_and_restarts() {
        let store = MemoryPersistence::new();
        for topic in ["home/a", "home/b", "office/a"] {
            store.apply(RetainedMessage::new(topic, "v", Qos::AT_MOST_ONCE)).unwrap();
        }

        let home = collect(&store, &["home/+"]).await;
        assert_eq!(home.len(), 2);

        let combi = collect(&store, &["home/a", "office/#"]).await;
        let topics: Vec<_> = combi.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["home/a", "office/a"]);

        // A second pass sees the same set again
        assert_eq!(collect(&store, &["#"]).await.len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_filter_yields_error() {
        let store = MemoryPersistence::new();
        let results: Vec<_> = store.create_retained_stream_combi(&["a/#/b"]).collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(PersistenceError::InvalidFilter(_))));
    }

    #[test]
    fn test_sync_replaces_matching_entries() {
        let store = MemoryPersistence::new();
        store.apply(RetainedMessage::new("home/kept", "same", Qos::EXACTLY_ONCE)).unwrap();
        store.apply(RetainedMessage::new("home/changed", "old", Qos::AT_LEAST_ONCE)).unwrap();
        store.apply(RetainedMessage::new("home/cleared", "gone", Qos::AT_MOST_ONCE)).unwrap();
        store.apply(RetainedMessage::new("office/other", "x", Qos::AT_LEAST_ONCE)).unwrap();

        let dropped = store.sync(
            &["home/#"],
            vec![
                ("home/kept".to_string(), Bytes::from("same")),
                ("home/changed".to_string(), Bytes::from("new")),
                ("home/added".to_string(), Bytes::from("fresh")),
                ("home/empty".to_string(), Bytes::new()),
            ],
        );

        assert_eq!(dropped, 1);
        assert_eq!(store.len(), 4);
        assert_eq!(store.get("home/kept").unwrap().qos, Qos::EXACTLY_ONCE);
        let changed = store.get("home/changed").unwrap();
        assert_eq!(changed.payload, Bytes::from("new"));
        assert_eq!(changed.qos, Qos::AT_MOST_ONCE);
        assert!(store.get("home/added").is_some());
        assert!(store.get("home/cleared").is_none());
        assert!(store.get("home/empty").is_none());
        // Outside the filter
        assert_eq!(store.get("office/other").unwrap().qos, Qos::AT_LEAST_ONCE);
    }

    #[test]
    fn test_rejects_empty_topic() {
        let store = MemoryPersistence::new();
        assert!(store.apply(RetainedMessage::new("", "x", Qos::AT_MOST_ONCE)).is_err());
    }
}

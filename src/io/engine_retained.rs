//! Retained storage backed by the running engine
//!
//! Saves stream what the router holds right now: each pass dumps the engine's
//! retained set into the local cache first. Without an engine (no listener,
//! port in use) the cache is the retained store.

use crate::domain::types::RetainedMessage;
use crate::io::memory::{is_valid_filter, MemoryPersistence};
use crate::io::persistence::{PersistenceError, RetainedPersistence};
use crate::io::retained_dump::RetainedDump;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

pub struct EngineRetained {
    cache: Arc<MemoryPersistence>,
    dump: RwLock<Option<RetainedDump>>,
}

impl EngineRetained {
    pub fn new(cache: Arc<MemoryPersistence>) -> Self {
        Self { cache, dump: RwLock::new(None) }
    }

    /// Read the retained set from the engine from now on
    pub fn attach(&self, dump: RetainedDump) {
        *self.dump.write() = Some(dump);
    }

    pub fn is_attached(&self) -> bool {
        self.dump.read().is_some()
    }

    pub fn cache(&self) -> &Arc<MemoryPersistence> {
        &self.cache
    }
}

async fn refresh_cache(
    dump: &RetainedDump,
    cache: &MemoryPersistence,
    filters: &[&str],
) -> Result<(), PersistenceError> {
    let entries = dump.dump(filters).await?;
    let count = entries.len();
    let dropped = cache.sync(filters, entries);
    debug!(count = %count, dropped = %dropped, "retained_cache_refreshed");
    Ok(())
}

#[async_trait]
impl RetainedPersistence for EngineRetained {
    fn create_retained_stream_combi(
        &self,
        filters: &[&str],
    ) -> BoxStream<'static, Result<RetainedMessage, PersistenceError>> {
        let dump = self.dump.read().clone();
        let Some(dump) = dump else {
            return self.cache.create_retained_stream_combi(filters);
        };
        if let Some(bad) = filters.iter().find(|f| !is_valid_filter(f)) {
            let err = PersistenceError::InvalidFilter(bad.to_string());
            return stream::once(async move { Err(err) }).boxed();
        }

        let cache = self.cache.clone();
        let filters: Vec<String> = filters.iter().map(|f| f.to_string()).collect();
        stream::once(async move {
            let filters: Vec<&str> = filters.iter().map(String::as_str).collect();
            match refresh_cache(&dump, &cache, &filters).await {
                Ok(()) => cache.create_retained_stream_combi(&filters),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            }
        })
        .flatten()
        .boxed()
    }

    /// Restore path; reaches the engine through the tap before it serves
    async fn store_retained(&self, message: RetainedMessage) -> Result<(), PersistenceError> {
        self.cache.apply(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Qos;
    use crate::infra::broker::local_engine;
    use crate::io::retained_dump::{dump_channel, serve_dumps};
    use bytes::Bytes;
    use futures::executor::block_on;
    use rumqttd::protocol::{Packet, Publish};
    use std::thread;
    use std::time::{Duration, Instant};

    async fn collect(store: &EngineRetained) -> Vec<RetainedMessage> {
        store.create_retained_stream_combi(&["#"]).map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_detached_streams_the_cache() {
        let store = EngineRetained::new(Arc::new(MemoryPersistence::new()));
        store.store_retained(RetainedMessage::new("t", "v", Qos::AT_LEAST_ONCE)).await.unwrap();
        assert!(!store.is_attached());

        let all = collect(&store).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].qos, Qos::AT_LEAST_ONCE);
    }

    #[tokio::test]
    async fn test_closed_engine_fails_the_stream() {
        let store = EngineRetained::new(Arc::new(MemoryPersistence::new()));
        let (dump, requests) = dump_channel();
        drop(requests);
        store.attach(dump);

        let results: Vec<_> = store.create_retained_stream_combi(&["#"]).collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(PersistenceError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_follows_engine_retained_set() {
        let broker = local_engine();
        let (mut client, _client_rx) = broker.link("client").unwrap();
        let (dump_tx, dump_rx) = broker.link("dump").unwrap();
        let (dump, requests) = dump_channel();
        thread::spawn(move || serve_dumps(dump_tx, dump_rx, requests, 10_000));

        for (topic, payload) in [("sensors/temp", "21"), ("sensors/hum", "40")] {
            let publish = Publish::new(Bytes::from(topic), Bytes::from(payload), true);
            block_on(client.send(Packet::Publish(publish, None))).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while dump.dump(&["#"]).await.unwrap().len() != 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let cache = Arc::new(MemoryPersistence::new());
        cache.apply(RetainedMessage::new("sensors/stale", "old", Qos::AT_MOST_ONCE)).unwrap();
        cache.apply(RetainedMessage::new("sensors/temp", "21", Qos::EXACTLY_ONCE)).unwrap();
        let store = EngineRetained::new(cache.clone());
        store.attach(dump);

        let mut all = collect(&store).await;
        all.sort_by(|a, b| a.topic.cmp(&b.topic));

        let topics: Vec<&str> = all.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, vec!["sensors/hum", "sensors/temp"]);
        // Unchanged payload keeps the level it was restored with
        assert_eq!(all[1].qos, Qos::EXACTLY_ONCE);
        assert!(cache.get("sensors/stale").is_none());
    }
}

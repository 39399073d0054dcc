//! Periodic snapshot saves
//!
//! A tick every `period` saves on the timer task unless a save is already in
//! flight (ticks are dropped, never queued). Shutdown cancels the timer,
//! which first lets a running tick save finish, then writes one final
//! snapshot. Once the timer is joined no periodic save can start.

use crate::services::snapshot::{SaveOutcome, SnapshotStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default interval between periodic saves
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct SnapshotScheduler {
    store: Arc<SnapshotStore>,
    shutdown_tx: watch::Sender<bool>,
    timer: JoinHandle<()>,
}

impl SnapshotScheduler {
    /// Start the periodic timer; the first tick fires after one full period
    pub fn spawn(store: Arc<SnapshotStore>, period: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timer = tokio::spawn(run_timer(store.clone(), period, shutdown_rx));
        info!(file = %store.path().display(), period_secs = %period.as_secs(), "snapshot_scheduler_started");
        Self { store, shutdown_tx, timer }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Cancel the timer, wait for a running tick save, then save once more
    pub async fn shutdown(self) -> SaveOutcome {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.timer.await {
            warn!(error = %e, "snapshot_timer_join_failed");
        }
        debug!(file = %self.store.path().display(), "snapshot_timer_cancelled");

        self.store.save().await
    }
}

async fn run_timer(store: Arc<SnapshotStore>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                if store.is_saving() {
                    debug!("snapshot_tick_dropped");
                    continue;
                }
                // Outcome is logged by the store; the next tick retries on failure
                let _ = store.try_save().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Qos, RetainedMessage};
    use crate::io::memory::MemoryPersistence;
    use crate::io::persistence::{PersistenceError, RetainedPersistence};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    async fn scheduled(
        dir: &std::path::Path,
        period: Duration,
    ) -> (SnapshotScheduler, Arc<MemoryPersistence>) {
        let engine = Arc::new(MemoryPersistence::new());
        let store = Arc::new(SnapshotStore::open(dir, "n1", engine.clone()).await.unwrap());
        (SnapshotScheduler::spawn(store, period), engine)
    }

    #[tokio::test]
    async fn test_tick_saves_in_background() {
        let dir = tempdir().unwrap();
        let (scheduler, engine) = scheduled(dir.path(), Duration::from_millis(100)).await;
        engine.apply(RetainedMessage::new("t", "v", Qos::AT_MOST_ONCE)).unwrap();
        let path = scheduler.store().path().to_path_buf();

        // The first tick waits a full period
        assert!(!path.exists());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !path.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(path.exists());

        assert!(matches!(scheduler.shutdown().await, SaveOutcome::Saved(_)));
    }

    /// Counts every save pass the store starts
    struct CountingPersistence {
        inner: MemoryPersistence,
        passes: AtomicUsize,
    }

    #[async_trait]
    impl RetainedPersistence for CountingPersistence {
        fn create_retained_stream_combi(
            &self,
            filters: &[&str],
        ) -> BoxStream<'static, Result<RetainedMessage, PersistenceError>> {
            self.passes.fetch_add(1, Ordering::SeqCst);
            self.inner.create_retained_stream_combi(filters)
        }

        async fn store_retained(&self, message: RetainedMessage) -> Result<(), PersistenceError> {
            self.inner.store_retained(message).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_save_after_shutdown_returns() {
        let dir = tempdir().unwrap();
        let period = Duration::from_millis(5);

        // Shut down at varying offsets so some land while a tick is saving
        for round in 0..20u64 {
            let engine = Arc::new(CountingPersistence {
                inner: MemoryPersistence::new(),
                passes: AtomicUsize::new(0),
            });
            let store = SnapshotStore::open(dir.path(), "n1", engine.clone()).await.unwrap();
            let scheduler = SnapshotScheduler::spawn(Arc::new(store), period);

            tokio::time::sleep(period + Duration::from_micros(round * 500)).await;
            assert!(matches!(scheduler.shutdown().await, SaveOutcome::Saved(_)));
            let after_shutdown = engine.passes.load(Ordering::SeqCst);

            tokio::time::sleep(period * 4).await;
            assert_eq!(engine.passes.load(Ordering::SeqCst), after_shutdown, "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_shutdown_writes_final_snapshot() {
        let dir = tempdir().unwrap();
        let (scheduler, engine) = scheduled(dir.path(), DEFAULT_SNAPSHOT_INTERVAL).await;
        let path = scheduler.store().path().to_path_buf();
        engine.apply(RetainedMessage::new("test/close", "close-test", Qos::AT_MOST_ONCE)).unwrap();

        let outcome = scheduler.shutdown().await;
        assert!(matches!(outcome, SaveOutcome::Saved(_)));

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(doc["retained"].get("test/close").is_some());
    }
}

//! Broker node lifecycle
//!
//! Startup order for one instance:
//! 1. validate TLS files (an invalid node does not start)
//! 2. open the snapshot store and load it into the retained store
//! 3. start the periodic snapshot timer
//! 4. start the engine; restored messages reach it before any listener binds
//! 5. point the retained store at the engine so saves read the router's set
//!
//! Close runs the scheduler shutdown (final snapshot) and stops the event relay.

use crate::domain::events::{BrokerEvent, EventTranslator, NodeStatus};
use crate::infra::broker::{resolve_tls, start_embedded_broker, BrokerSetupError};
use crate::infra::config::Config;
use crate::io::engine_retained::EngineRetained;
use crate::io::host::HostSender;
use crate::io::memory::MemoryPersistence;
use crate::io::persistence::RetainedPersistence;
use crate::io::retained_dump::dump_channel;
use crate::io::retained_tap::RetainedTap;
use crate::services::scheduler::SnapshotScheduler;
use crate::services::snapshot::{LoadOutcome, SaveOutcome, SnapshotStore};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the engine event channel
const EVENT_CHANNEL_SIZE: usize = 1000;

/// Snapshot persistence for one broker instance
#[derive(Debug, Default)]
pub struct NodePersistence {
    scheduler: Option<SnapshotScheduler>,
    load_outcome: Option<LoadOutcome>,
}

impl NodePersistence {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open, load and schedule; any environment problem disables persistence
    pub async fn init(config: &Config, persistence: Arc<dyn RetainedPersistence>) -> Self {
        if !config.persist_to_file() {
            return Self::disabled();
        }

        let store = match SnapshotStore::open(config.user_dir(), config.node_id(), persistence).await {
            Ok(store) => store,
            Err(e) => {
                warn!(node = %config.node_id(), error = %e, "persistence_disabled");
                return Self::disabled();
            }
        };

        let load_outcome = store.load().await;
        let scheduler = SnapshotScheduler::spawn(Arc::new(store), config.snapshot_interval());
        Self { scheduler: Some(scheduler), load_outcome: Some(load_outcome) }
    }

    pub fn enabled(&self) -> bool {
        self.scheduler.is_some()
    }

    pub fn file(&self) -> Option<&Path> {
        self.scheduler.as_ref().map(|s| s.store().path())
    }

    /// `None` when persistence is disabled
    pub fn load_outcome(&self) -> Option<&LoadOutcome> {
        self.load_outcome.as_ref()
    }

    /// Final save; `None` when persistence is disabled or already closed
    pub async fn close(&mut self) -> Option<SaveOutcome> {
        let scheduler = self.scheduler.take()?;
        Some(scheduler.shutdown().await)
    }
}

/// Embedded broker exposed as a host node
pub struct BrokerNode {
    config: Config,
    retained: Arc<EngineRetained>,
    persistence: NodePersistence,
    events_tx: mpsc::Sender<BrokerEvent>,
    relay: JoinHandle<()>,
    engine: Option<thread::JoinHandle<()>>,
}

impl BrokerNode {
    /// Start the node
    ///
    /// Only invalid TLS configuration is returned as an error; the host
    /// then sees a failed status. Listener failures are reported through the
    /// node status and leave the node running without an engine.
    pub async fn start(config: Config, host: HostSender) -> Result<Self, BrokerSetupError> {
        let tls = match resolve_tls(&config) {
            Ok(tls) => tls,
            Err(e) => {
                error!(node = %config.node_id(), error = %e, "node_config_invalid");
                host.status(NodeStatus::failed(e.status_text()));
                return Err(e);
            }
        };

        let cache = Arc::new(MemoryPersistence::new());
        let retained = Arc::new(EngineRetained::new(cache.clone()));
        let persistence = NodePersistence::init(&config, retained.clone()).await;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let translator = EventTranslator::new(config.publish_events());
        let relay = tokio::spawn(relay_events(events_rx, translator, host.clone()));

        let (dump, dumps) = dump_channel();
        let tap = RetainedTap::new(events_tx.clone(), cache.messages());
        let engine = match start_embedded_broker(&config, tls.as_ref(), tap, dumps, &events_tx) {
            Ok(handle) => {
                retained.attach(dump);
                host.status(NodeStatus::connected());
                Some(handle)
            }
            Err(BrokerSetupError::NoListeners) => {
                warn!(node = %config.node_id(), "broker_without_listeners");
                None
            }
            Err(e) => {
                error!(node = %config.node_id(), "{}", e);
                host.status(NodeStatus::disconnected());
                None
            }
        };

        info!(
            node = %config.node_id(),
            persistence = %persistence.enabled(),
            restored = %persistence.load_outcome().map_or(0, LoadOutcome::restored),
            engine = %engine.is_some(),
            "node_started"
        );

        Ok(Self { config, retained, persistence, events_tx, relay, engine })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The retained set as of the last save, or the whole store without an engine
    pub fn retained(&self) -> &Arc<MemoryPersistence> {
        self.retained.cache()
    }

    pub fn persistence(&self) -> &NodePersistence {
        &self.persistence
    }

    pub fn persist_enabled(&self) -> bool {
        self.persistence.enabled()
    }

    pub fn persist_file(&self) -> Option<&Path> {
        self.persistence.file()
    }

    pub fn engine_running(&self) -> bool {
        self.engine.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Channel feeding the event relay
    pub fn events(&self) -> mpsc::Sender<BrokerEvent> {
        self.events_tx.clone()
    }

    /// Write the final snapshot and stop relaying events
    ///
    /// rumqttd has no shutdown call; the engine threads end with the process.
    pub async fn close(mut self) -> Option<SaveOutcome> {
        let outcome = self.persistence.close().await;

        if self.events_tx.send(BrokerEvent::Closed).await.is_err() {
            debug!(node = %self.config.node_id(), "event relay already stopped");
        }
        drop(self.events_tx);
        if let Err(e) = self.relay.await {
            warn!(error = %e, "event_relay_join_failed");
        }

        info!(node = %self.config.node_id(), "node_closed");
        outcome
    }
}

async fn relay_events(
    mut rx: mpsc::Receiver<BrokerEvent>,
    mut translator: EventTranslator,
    host: HostSender,
) {
    while let Some(event) = rx.recv().await {
        let translation = translator.translate(&event);
        for (port, msg) in translation.outputs {
            host.send(port, msg);
        }
        if let Some(status) = translation.status {
            host.status(status);
        }

        // The engine keeps its sender; closed is the stop signal
        if matches!(event, BrokerEvent::Closed) {
            debug!("broker_closed");
            return;
        }
    }
}

//! Services - snapshot persistence and node lifecycle
//!
//! - `snapshot` - Retained-message snapshot file (save, load, single-flight guard)
//! - `scheduler` - Periodic snapshot saves and the shutdown save
//! - `node` - Broker node startup, event relay and close

pub mod node;
pub mod scheduler;
pub mod snapshot;

// Re-export commonly used types
pub use node::{BrokerNode, NodePersistence};
pub use scheduler::{SnapshotScheduler, DEFAULT_SNAPSHOT_INTERVAL};
pub use snapshot::{LoadOutcome, SaveOutcome, SnapshotError, SnapshotStore};

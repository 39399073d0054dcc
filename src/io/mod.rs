//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `persistence` - Abstract retained-message storage of the broker engine
//! - `memory` - In-memory retained store
//! - `engine_retained` - Retained storage read back from the running engine
//! - `retained_dump` - Local engine link that reads the router's retained set
//! - `retained_tap` - Local engine link that restores the snapshot and reports publishes
//! - `host` - Node output and status sent to the host (JSONL file)

pub mod engine_retained;
pub mod host;
pub mod memory;
pub mod persistence;
pub mod retained_dump;
pub mod retained_tap;

// Re-export commonly used types
pub use engine_retained::EngineRetained;
pub use host::{create_host_channel, HostMessage, HostSender, HostWriter};
pub use memory::MemoryPersistence;
pub use persistence::{PersistenceError, RetainedPersistence};
pub use retained_dump::{dump_channel, RetainedDump};
pub use retained_tap::RetainedTap;

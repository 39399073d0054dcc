//! Retained-message storage interface exposed by the broker engine
//!
//! The snapshot store only talks to the engine through this trait: it streams
//! retained messages out for saving and stores them back on restore.

use crate::domain::types::RetainedMessage;
use async_trait::async_trait;
use futures::stream::BoxStream;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("invalid topic filter {0:?}")]
    InvalidFilter(String),
    #[error("invalid retained message for topic {topic:?}: {reason}")]
    InvalidMessage { topic: String, reason: String },
    #[error("retained store closed")]
    Closed,
}

/// Engine-side retained storage
///
/// `create_retained_stream_combi` yields every retained message matching any
/// of the filters. The stream is finite and each call starts a fresh pass.
#[async_trait]
pub trait RetainedPersistence: Send + Sync {
    fn create_retained_stream_combi(
        &self,
        filters: &[&str],
    ) -> BoxStream<'static, Result<RetainedMessage, PersistenceError>>;

    async fn store_retained(&self, message: RetainedMessage) -> Result<(), PersistenceError>;
}

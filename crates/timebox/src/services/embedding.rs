//! Embedding completion stage.
//!
//! Vector embedding runs out of process; this stage only decides when the
//! `embedding_completed` flag may be set. The default implementation marks
//! every item immediately, which keeps recognition-complete items from
//! cycling through the pending set forever.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::services::store::WorkItem;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding stage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EmbeddingStage: Send + Sync {
    /// Returns `Ok(())` when the item may be flagged embedding-complete. An
    /// error leaves the flag unset and the item pending.
    async fn embed(&self, item: &WorkItem) -> Result<(), EmbeddingError>;
}

/// Marks every item embedding-complete without computing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateEmbeddingStage;

#[async_trait]
impl EmbeddingStage for ImmediateEmbeddingStage {
    async fn embed(&self, item: &WorkItem) -> Result<(), EmbeddingError> {
        debug!(item_id = item.id.as_str(), "embedding marked complete");
        Ok(())
    }
}

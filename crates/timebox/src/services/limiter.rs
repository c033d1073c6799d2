//! Per-backend concurrency gates.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::services::registry::BackendRegistry;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("backend `{url}` has no concurrency gate")]
    UnknownBackend { url: String },
    #[error("concurrency gate for `{url}` was closed")]
    GateClosed { url: String },
}

/// One bounded admission gate per backend. Capacity equals the backend's
/// configured concurrency limit (minimum 1). The returned permit releases its
/// slot on drop, covering success, failure, and timeout paths alike.
#[derive(Debug, Clone)]
pub struct BackendGate {
    slots: Arc<HashMap<String, Arc<Semaphore>>>,
}

impl BackendGate {
    pub fn new(registry: &BackendRegistry) -> Self {
        let slots = registry
            .backends()
            .iter()
            .map(|backend| {
                (
                    backend.url.clone(),
                    Arc::new(Semaphore::new(backend.concurrency.max(1))),
                )
            })
            .collect();
        Self {
            slots: Arc::new(slots),
        }
    }

    /// Suspend until a slot for `url` is free. Acquisition order is not
    /// specified; only the capacity bound is guaranteed.
    pub async fn acquire(&self, url: &str) -> Result<OwnedSemaphorePermit, GateError> {
        let semaphore = self
            .slots
            .get(url)
            .ok_or_else(|| GateError::UnknownBackend {
                url: url.to_string(),
            })?;
        Arc::clone(semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateError::GateClosed {
                url: url.to_string(),
            })
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self, url: &str) -> Option<usize> {
        self.slots.get(url).map(|s| s.available_permits())
    }
}

//! Round-robin backend selection.

use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::services::registry::BackendDescriptor;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("no OCR backends configured")]
    NoBackendsConfigured,
}

/// Stateful cursor over an ordered backend list. Selection order is purely
/// call order; success or failure of prior dispatches does not influence it.
/// The cursor is atomic because the event loop interleaves in-flight
/// dispatches that all share one selector.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Return the backend at the cursor and advance it modulo the list
    /// length, wrapping to zero.
    pub fn next<'a>(
        &self,
        backends: &'a [BackendDescriptor],
    ) -> Result<&'a BackendDescriptor, SelectorError> {
        if backends.is_empty() {
            return Err(SelectorError::NoBackendsConfigured);
        }
        let previous = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cursor| {
                Some((cursor + 1) % backends.len())
            })
            .unwrap_or(0);
        Ok(&backends[previous % backends.len()])
    }
}

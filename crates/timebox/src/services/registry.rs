//! Static registry of OCR backend endpoints.

use std::time::Duration;

use thiserror::Error;

use crate::config::BackendSettings;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no OCR backends configured")]
    NoBackendsConfigured,
}

/// Immutable description of one OCR backend service.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub url: String,
    pub token: String,
    pub timeout: Duration,
    /// Configured retry budget; the dispatch path retries via re-poll and
    /// leaves this untouched.
    pub max_retries: u32,
    pub concurrency: usize,
}

impl From<&BackendSettings> for BackendDescriptor {
    fn from(settings: &BackendSettings) -> Self {
        Self {
            url: settings.url.clone(),
            token: settings.token.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            max_retries: settings.max_retries,
            concurrency: settings.concurrency.max(1),
        }
    }
}

/// Ordered, fixed list of backends loaded once at startup.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: Vec<BackendDescriptor>,
}

impl BackendRegistry {
    /// Build the registry, rejecting an empty backend list. The scheduler
    /// must not start without at least one reachable endpoint.
    pub fn new(backends: Vec<BackendDescriptor>) -> Result<Self, RegistryError> {
        if backends.is_empty() {
            return Err(RegistryError::NoBackendsConfigured);
        }
        let backends = backends
            .into_iter()
            .map(|mut backend| {
                backend.concurrency = backend.concurrency.max(1);
                backend
            })
            .collect();
        Ok(Self { backends })
    }

    pub fn from_settings(settings: &[BackendSettings]) -> Result<Self, RegistryError> {
        Self::new(settings.iter().map(BackendDescriptor::from).collect())
    }

    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

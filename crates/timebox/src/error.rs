//! Application-level error type shared by the binary entry points.

use thiserror::Error;

use crate::config;
use crate::paths::PathError;
use crate::services::{RegistryError, StoreError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

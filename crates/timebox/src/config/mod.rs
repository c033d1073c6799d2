//! Configuration loading for the scheduler and its backends.

use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_BACKEND_CONCURRENCY, DEFAULT_BACKEND_MAX_RETRIES, DEFAULT_BACKEND_TIMEOUT,
    DEFAULT_BATCH_SIZE, DEFAULT_POLL_BASE_DELAY, DEFAULT_POLL_DELAY_INCREMENT,
    DEFAULT_POLL_MAX_DELAY,
};
use crate::paths;

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error(transparent)]
    Paths(#[from] paths::PathError),
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub scheduler: SchedulerSettings,
    pub storage: StorageSettings,
    #[serde(default)]
    pub backends: Vec<BackendSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub poll_base_delay_secs: u64,
    pub poll_delay_increment_secs: u64,
    pub poll_max_delay_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Root data directory; the LMDB store and upload area live beneath it.
    pub path: PathBuf,
}

/// One OCR backend endpoint as declared in configuration. Loaded once at
/// startup; never mutated at runtime.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendSettings {
    pub url: String,
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry budget. The dispatcher currently retries via re-poll and does
    /// not consult it.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_BACKEND_TIMEOUT.as_secs()
}

fn default_max_retries() -> u32 {
    DEFAULT_BACKEND_MAX_RETRIES
}

fn default_concurrency() -> usize {
    DEFAULT_BACKEND_CONCURRENCY
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = crate::paths::AppPaths::from_project_dirs()?.data_dir();
    let builder = Config::builder()
        .set_default("scheduler.batch_size", DEFAULT_BATCH_SIZE as u64)?
        .set_default(
            "scheduler.poll_base_delay_secs",
            DEFAULT_POLL_BASE_DELAY.as_secs(),
        )?
        .set_default(
            "scheduler.poll_delay_increment_secs",
            DEFAULT_POLL_DELAY_INCREMENT.as_secs(),
        )?
        .set_default(
            "scheduler.poll_max_delay_secs",
            DEFAULT_POLL_MAX_DELAY.as_secs(),
        )?
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("TIMEBOX").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_settings_fill_in_defaults() {
        let settings: BackendSettings =
            serde_json::from_str(r#"{"url": "http://ocr-a", "token": "secret"}"#)
                .expect("settings parse");
        assert_eq!(settings.timeout_secs, DEFAULT_BACKEND_TIMEOUT.as_secs());
        assert_eq!(settings.max_retries, DEFAULT_BACKEND_MAX_RETRIES);
        assert_eq!(settings.concurrency, DEFAULT_BACKEND_CONCURRENCY);
    }

    #[test]
    fn explicit_backend_settings_win_over_defaults() {
        let settings: BackendSettings = serde_json::from_str(
            r#"{"url": "http://ocr-a", "token": "secret",
                "timeout_secs": 7, "max_retries": 1, "concurrency": 4}"#,
        )
        .expect("settings parse");
        assert_eq!(settings.timeout_secs, 7);
        assert_eq!(settings.max_retries, 1);
        assert_eq!(settings.concurrency, 4);
    }
}

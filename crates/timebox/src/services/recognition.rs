//! Recognition boundary: one image, one backend, one classified outcome.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::services::registry::BackendDescriptor;
use crate::services::store::WorkItem;

/// One recognized text span with confidence and polygon position, as returned
/// by a backend. Confidence stays in the backend-native scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub confidence: f64,
    pub position: Vec<[f64; 2]>,
}

/// Why a recognition attempt did not produce fragments. Network errors,
/// timeouts, unreadable files, and non-2xx responses all land here; the
/// poller treats every non-success uniformly, so no finer taxonomy exists at
/// this layer.
#[derive(Debug, Clone)]
pub struct RecognitionFailure {
    pub backend: String,
    pub reason: String,
}

/// Outcome of one recognition attempt for one work item. An explicit variant
/// type so callers cannot silently drop an unclassified error.
#[derive(Debug, Clone)]
pub enum DispatchResult {
    Success(Vec<Fragment>),
    Failed(RecognitionFailure),
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchResult::Success(_))
    }

    fn failed(backend: &BackendDescriptor, reason: impl Into<String>) -> Self {
        DispatchResult::Failed(RecognitionFailure {
            backend: backend.url.clone(),
            reason: reason.into(),
        })
    }
}

/// Sends one image to one backend. No retry and no fallback to a different
/// backend happens here; a failed attempt is reported and the item stays
/// eligible for the next poll cycle.
#[async_trait]
pub trait RecognitionClient: Send + Sync {
    async fn recognize(&self, item: &WorkItem, backend: &BackendDescriptor) -> DispatchResult;
}

/// HTTP implementation: multipart POST of the image bytes with a bearer
/// credential, bounded by the backend's timeout.
#[derive(Debug, Clone)]
pub struct HttpRecognitionClient {
    http: HttpClient,
    upload_dir: PathBuf,
}

impl HttpRecognitionClient {
    pub fn new(upload_dir: PathBuf) -> Self {
        Self {
            http: HttpClient::new(),
            upload_dir,
        }
    }
}

#[async_trait]
impl RecognitionClient for HttpRecognitionClient {
    async fn recognize(&self, item: &WorkItem, backend: &BackendDescriptor) -> DispatchResult {
        let image_path = self.upload_dir.join(&item.file_path);
        let bytes = match tokio::fs::read(&image_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    item_id = item.id.as_str(),
                    path = %image_path.display(),
                    error = %err,
                    "failed to read screenshot for recognition"
                );
                return DispatchResult::failed(backend, format!("read {}: {err}", item.file_path));
            }
        };

        let file_name = image_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| item.id.clone());
        let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));

        let response = self
            .http
            .post(&backend.url)
            .bearer_auth(&backend.token)
            .multipart(form)
            .timeout(backend.timeout)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    item_id = item.id.as_str(),
                    backend = backend.url.as_str(),
                    error = %err,
                    "recognition request failed"
                );
                return DispatchResult::failed(backend, err.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(
                item_id = item.id.as_str(),
                backend = backend.url.as_str(),
                status = status.as_u16(),
                "recognition backend returned error status"
            );
            return DispatchResult::failed(backend, format!("status {status}"));
        }

        match response.json::<Vec<Fragment>>().await {
            Ok(fragments) => {
                debug!(
                    item_id = item.id.as_str(),
                    backend = backend.url.as_str(),
                    fragments = fragments.len(),
                    "recognition succeeded"
                );
                DispatchResult::Success(fragments)
            }
            Err(err) => {
                warn!(
                    item_id = item.id.as_str(),
                    backend = backend.url.as_str(),
                    error = %err,
                    "recognition response was not a fragment list"
                );
                DispatchResult::failed(backend, format!("malformed response: {err}"))
            }
        }
    }
}

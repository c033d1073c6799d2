//! Fan-out of one batch of work items across the backend pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::warn;

use crate::services::limiter::BackendGate;
use crate::services::recognition::{DispatchResult, RecognitionClient, RecognitionFailure};
use crate::services::registry::BackendRegistry;
use crate::services::selector::RoundRobinSelector;
use crate::services::store::WorkItem;

/// Dispatches a batch of items to recognition backends.
///
/// Backend assignment is decided sequentially in batch order, so the
/// round-robin rotation is deterministic regardless of how the spawned
/// requests interleave. Each request then waits on its backend's concurrency
/// gate before sending.
pub struct BatchDispatcher {
    registry: Arc<BackendRegistry>,
    selector: RoundRobinSelector,
    gate: BackendGate,
    client: Arc<dyn RecognitionClient>,
}

impl BatchDispatcher {
    pub fn new(registry: Arc<BackendRegistry>, client: Arc<dyn RecognitionClient>) -> Self {
        let gate = BackendGate::new(&registry);
        Self {
            registry,
            selector: RoundRobinSelector::new(),
            gate,
            client,
        }
    }

    /// Send every item to its assigned backend concurrently and collect one
    /// [`DispatchResult`] per item id. One failing item never aborts the
    /// rest of the batch.
    pub async fn dispatch(&self, items: &[WorkItem]) -> HashMap<String, DispatchResult> {
        let mut results = HashMap::with_capacity(items.len());
        if items.is_empty() {
            return results;
        }

        let mut inflight = JoinSet::new();
        for item in items {
            let backend = match self.selector.next(self.registry.backends()) {
                Ok(backend) => backend.clone(),
                Err(err) => {
                    // The registry rejects empty pools at startup, so this is
                    // unreachable in practice; still reported per item.
                    warn!(item_id = item.id.as_str(), error = %err, "no backend available");
                    results.insert(
                        item.id.clone(),
                        DispatchResult::Failed(RecognitionFailure {
                            backend: String::new(),
                            reason: err.to_string(),
                        }),
                    );
                    continue;
                }
            };

            let item = item.clone();
            let gate = self.gate.clone();
            let client = Arc::clone(&self.client);
            inflight.spawn(async move {
                let _permit = match gate.acquire(&backend.url).await {
                    Ok(permit) => permit,
                    Err(err) => {
                        return (
                            item.id.clone(),
                            DispatchResult::Failed(RecognitionFailure {
                                backend: backend.url.clone(),
                                reason: err.to_string(),
                            }),
                        );
                    }
                };
                let result = client.recognize(&item, &backend).await;
                (item.id.clone(), result)
            });
        }

        while let Some(joined) = inflight.join_next().await {
            match joined {
                Ok((item_id, result)) => {
                    results.insert(item_id, result);
                }
                Err(err) => {
                    // A panicked or cancelled task loses its item for this
                    // cycle; the item stays pending and is re-polled.
                    warn!(error = %err, "dispatch task did not complete");
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::services::recognition::Fragment;
    use crate::services::registry::BackendDescriptor;

    fn registry(urls: &[&str], concurrency: usize) -> Arc<BackendRegistry> {
        let backends = urls
            .iter()
            .map(|url| BackendDescriptor {
                url: (*url).to_string(),
                token: "secret".to_string(),
                timeout: Duration::from_secs(5),
                max_retries: 3,
                concurrency,
            })
            .collect();
        Arc::new(BackendRegistry::new(backends).expect("registry builds"))
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| {
                WorkItem::new(
                    format!("img-{i}"),
                    format!("img-{i}.png"),
                    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                    None,
                    None,
                )
            })
            .collect()
    }

    /// Records which backend served each item and tracks per-backend
    /// concurrency high-water marks.
    struct ProbeClient {
        assignments: Mutex<Vec<(String, String)>>,
        inflight: Mutex<HashMap<String, usize>>,
        max_inflight: Mutex<HashMap<String, usize>>,
        fail_all: bool,
    }

    impl ProbeClient {
        fn new(fail_all: bool) -> Self {
            Self {
                assignments: Mutex::new(Vec::new()),
                inflight: Mutex::new(HashMap::new()),
                max_inflight: Mutex::new(HashMap::new()),
                fail_all,
            }
        }
    }

    #[async_trait]
    impl RecognitionClient for ProbeClient {
        async fn recognize(&self, item: &WorkItem, backend: &BackendDescriptor) -> DispatchResult {
            self.assignments
                .lock()
                .expect("assignments lock")
                .push((item.id.clone(), backend.url.clone()));
            {
                let mut inflight = self.inflight.lock().expect("inflight lock");
                let count = inflight.entry(backend.url.clone()).or_insert(0);
                *count += 1;
                let mut max = self.max_inflight.lock().expect("max lock");
                let peak = max.entry(backend.url.clone()).or_insert(0);
                *peak = (*peak).max(*count);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            {
                let mut inflight = self.inflight.lock().expect("inflight lock");
                if let Some(count) = inflight.get_mut(&backend.url) {
                    *count -= 1;
                }
            }
            if self.fail_all {
                DispatchResult::Failed(RecognitionFailure {
                    backend: backend.url.clone(),
                    reason: "probe failure".to_string(),
                })
            } else {
                DispatchResult::Success(vec![Fragment {
                    text: item.id.clone(),
                    confidence: 1.0,
                    position: Vec::new(),
                }])
            }
        }
    }

    #[tokio::test]
    async fn backends_rotate_in_batch_order() {
        let registry = registry(&["http://ocr-a", "http://ocr-b"], 4);
        let client = Arc::new(ProbeClient::new(false));
        let dispatcher = BatchDispatcher::new(registry, Arc::clone(&client) as Arc<dyn RecognitionClient>);

        let batch = items(3);
        let results = dispatcher.dispatch(&batch).await;
        assert_eq!(results.len(), 3);
        assert!(results.values().all(DispatchResult::is_success));

        let mut assignments = client
            .assignments
            .lock()
            .expect("assignments lock")
            .clone();
        assignments.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            assignments,
            vec![
                ("img-0".to_string(), "http://ocr-a".to_string()),
                ("img-1".to_string(), "http://ocr-b".to_string()),
                ("img-2".to_string(), "http://ocr-a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn per_backend_concurrency_is_bounded() {
        let registry = registry(&["http://ocr-a"], 1);
        let client = Arc::new(ProbeClient::new(false));
        let dispatcher = BatchDispatcher::new(registry, Arc::clone(&client) as Arc<dyn RecognitionClient>);

        let batch = items(4);
        let results = dispatcher.dispatch(&batch).await;
        assert_eq!(results.len(), 4);

        let max = client.max_inflight.lock().expect("max lock");
        assert_eq!(max.get("http://ocr-a"), Some(&1));
    }

    #[tokio::test]
    async fn failures_are_reported_per_item() {
        let registry = registry(&["http://ocr-a"], 2);
        let client = Arc::new(ProbeClient::new(true));
        let dispatcher = BatchDispatcher::new(registry, Arc::clone(&client) as Arc<dyn RecognitionClient>);

        let batch = items(2);
        let results = dispatcher.dispatch(&batch).await;
        assert_eq!(results.len(), 2);
        for result in results.values() {
            match result {
                DispatchResult::Failed(failure) => {
                    assert_eq!(failure.backend, "http://ocr-a");
                    assert_eq!(failure.reason, "probe failure");
                }
                DispatchResult::Success(_) => panic!("expected failures only"),
            }
        }
    }

    #[tokio::test]
    async fn empty_batch_yields_empty_map() {
        let registry = registry(&["http://ocr-a"], 2);
        let client: Arc<dyn RecognitionClient> = Arc::new(ProbeClient::new(false));
        let dispatcher = BatchDispatcher::new(registry, client);
        let results = dispatcher.dispatch(&[]).await;
        assert!(results.is_empty());
    }
}

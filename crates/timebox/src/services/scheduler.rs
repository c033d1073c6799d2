//! Background poll loop driving the recognition pipeline.
//!
//! Each cycle fetches a page of pending items, fans them out across the
//! backend pool, folds the results into indexed records, and commits the
//! batch in one transaction. Failed items are never retried within a cycle;
//! their flags stay unset so the next poll picks them up again.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bon::Builder;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerSettings;
use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_POLL_BASE_DELAY, DEFAULT_POLL_DELAY_INCREMENT,
    DEFAULT_POLL_MAX_DELAY,
};
use crate::services::dispatcher::BatchDispatcher;
use crate::services::embedding::EmbeddingStage;
use crate::services::indexer::SearchIndexer;
use crate::services::recognition::DispatchResult;
use crate::services::store::{BatchUpdate, WorkItem, WorkStore};

#[derive(Debug, Clone, Builder)]
pub struct SchedulerConfig {
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    #[builder(default = DEFAULT_POLL_BASE_DELAY)]
    pub base_delay: Duration,
    #[builder(default = DEFAULT_POLL_DELAY_INCREMENT)]
    pub delay_increment: Duration,
    #[builder(default = DEFAULT_POLL_MAX_DELAY)]
    pub max_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self::builder()
            .batch_size(settings.batch_size.max(1))
            .base_delay(Duration::from_secs(settings.poll_base_delay_secs))
            .delay_increment(Duration::from_secs(settings.poll_delay_increment_secs))
            .max_delay(Duration::from_secs(settings.poll_max_delay_secs))
            .build()
    }
}

/// Counters for one completed poll cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    /// Pending items fetched this cycle.
    pub fetched: usize,
    /// Items sent to a recognition backend.
    pub dispatched: usize,
    /// Recognition successes whose results were committed.
    pub succeeded: usize,
    /// Recognition failures plus items skipped at commit time.
    pub failed: usize,
    /// Items that only needed the embedding flag flipped.
    pub embedding_only: usize,
    pub elapsed: Duration,
}

impl CycleOutcome {
    fn empty(elapsed: Duration) -> Self {
        Self {
            elapsed,
            ..Self::default()
        }
    }

    /// Items that made forward progress this cycle.
    pub fn successes(&self) -> usize {
        self.succeeded + self.embedding_only
    }
}

/// Adaptive delay between poll cycles.
///
/// An empty fetch or any forward progress resets the delay to the base. A
/// cycle where every fetched item failed grows the delay by the increment,
/// capped at the maximum, so dead backends are probed less and less often.
#[derive(Debug)]
pub struct BackoffController {
    base: Duration,
    increment: Duration,
    max: Duration,
    current: Duration,
}

impl BackoffController {
    pub fn new(base: Duration, increment: Duration, max: Duration) -> Self {
        debug_assert!(base <= max);
        Self {
            base,
            increment,
            max,
            current: base,
        }
    }

    /// On a no-progress cycle the pre-increment delay is slept and the next
    /// delay grows, so the first failed cycle still waits only the base.
    pub fn next_delay(&mut self, outcome: &CycleOutcome) -> Duration {
        if outcome.fetched == 0 || outcome.successes() > 0 {
            self.current = self.base;
            return self.base;
        }
        let delay = self.current;
        self.current = self.current.saturating_add(self.increment).min(self.max);
        warn!(
            failed = outcome.failed,
            delay_secs = delay.as_secs(),
            next_delay_secs = self.current.as_secs(),
            "cycle made no progress, backing off"
        );
        delay
    }
}

struct SchedulerInner {
    store: Arc<dyn WorkStore>,
    dispatcher: BatchDispatcher,
    indexer: SearchIndexer,
    embedder: Arc<dyn EmbeddingStage>,
    config: SchedulerConfig,
    running: AtomicBool,
    wake: Notify,
}

impl SchedulerInner {
    async fn poll_once(&self) -> CycleOutcome {
        let started = Instant::now();

        let page = match self.store.list_pending(self.config.batch_size).await {
            Ok(page) => page,
            Err(err) => {
                // Treated as an empty cycle: nothing dispatched, delay resets
                // so storage recovery is noticed promptly.
                warn!(error = %err, "failed to fetch pending work items");
                return CycleOutcome::empty(started.elapsed());
            }
        };
        if page.is_empty() {
            debug!("no pending work items");
            return CycleOutcome::empty(started.elapsed());
        }

        let (to_recognize, embedding_only): (Vec<WorkItem>, Vec<WorkItem>) =
            page.iter().cloned().partition(WorkItem::needs_recognition);

        let mut outcome = CycleOutcome {
            fetched: page.len(),
            dispatched: to_recognize.len(),
            ..CycleOutcome::default()
        };

        let results = self.dispatcher.dispatch(&to_recognize).await;

        let mut updates = Vec::with_capacity(page.len());
        let mut committed_ids = Vec::new();
        for item in &to_recognize {
            match results.get(&item.id) {
                Some(DispatchResult::Success(fragments)) => {
                    let record = self.indexer.build_record(item, fragments);
                    let embedding_done = match self.embedder.embed(item).await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(item_id = item.id.as_str(), error = %err, "embedding stage failed");
                            false
                        }
                    };
                    updates.push(BatchUpdate {
                        item_id: item.id.clone(),
                        record: Some(record),
                        set_ocr_completed: true,
                        set_embedding_completed: embedding_done,
                    });
                    committed_ids.push(item.id.clone());
                }
                Some(DispatchResult::Failed(failure)) => {
                    warn!(
                        item_id = item.id.as_str(),
                        backend = failure.backend.as_str(),
                        reason = failure.reason.as_str(),
                        "recognition failed, item stays pending"
                    );
                    outcome.failed += 1;
                }
                None => {
                    // Lost to a panicked dispatch task; stays pending.
                    outcome.failed += 1;
                }
            }
        }

        let mut embedding_ids = Vec::new();
        for item in &embedding_only {
            match self.embedder.embed(item).await {
                Ok(()) => {
                    updates.push(BatchUpdate {
                        item_id: item.id.clone(),
                        record: None,
                        set_ocr_completed: false,
                        set_embedding_completed: true,
                    });
                    embedding_ids.push(item.id.clone());
                }
                Err(err) => {
                    warn!(item_id = item.id.as_str(), error = %err, "embedding stage failed");
                    outcome.failed += 1;
                }
            }
        }

        let report = match self.store.commit_batch(updates).await {
            Ok(report) => report,
            Err(err) => {
                // Every result of this cycle is lost; the items remain
                // pending and the backoff treats the cycle as failed.
                warn!(error = %err, "failed to commit batch results");
                outcome.failed = outcome.dispatched + embedding_only.len();
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        };

        let skipped: HashSet<&str> = report
            .skipped
            .iter()
            .map(|(id, _)| id.as_str())
            .collect();
        outcome.succeeded = committed_ids
            .iter()
            .filter(|id| !skipped.contains(id.as_str()))
            .count();
        outcome.embedding_only = embedding_ids
            .iter()
            .filter(|id| !skipped.contains(id.as_str()))
            .count();
        outcome.failed += skipped.len();
        outcome.elapsed = started.elapsed();

        if outcome.successes() > 0 {
            let secs = outcome.elapsed.as_secs_f64();
            let throughput = if secs > 0.0 {
                outcome.successes() as f64 / secs
            } else {
                outcome.successes() as f64
            };
            info!(
                fetched = outcome.fetched,
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                embedding_only = outcome.embedding_only,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                items_per_sec = format!("{throughput:.2}").as_str(),
                "poll cycle completed"
            );
        }
        outcome
    }
}

/// Handle over the background poll loop. Cloneable; all clones drive the
/// same loop.
#[derive(Clone)]
pub struct OcrScheduler {
    inner: Arc<SchedulerInner>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl OcrScheduler {
    pub fn new(
        store: Arc<dyn WorkStore>,
        dispatcher: BatchDispatcher,
        embedder: Arc<dyn EmbeddingStage>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                dispatcher,
                indexer: SearchIndexer::new(),
                embedder,
                config,
                running: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn the poll loop. Returns `false` when it is already running; a
    /// second call never spawns a second loop.
    pub fn start(&self) -> bool {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(run_loop(inner));
        *self.handle.lock().expect("scheduler handle lock poisoned") = Some(handle);
        true
    }

    /// Request the loop to stop after the in-flight cycle. Idempotent.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!("scheduler stop requested");
        }
        self.inner.wake.notify_waiters();
    }

    /// Stop and wait for the loop to finish its current cycle.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self
            .handle
            .lock()
            .expect("scheduler handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "scheduler loop did not shut down cleanly");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run exactly one poll cycle, independent of the background loop.
    pub async fn poll_once(&self) -> CycleOutcome {
        self.inner.poll_once().await
    }
}

async fn run_loop(inner: Arc<SchedulerInner>) {
    info!(
        batch_size = inner.config.batch_size,
        base_delay_secs = inner.config.base_delay.as_secs(),
        "scheduler loop started"
    );
    let mut backoff = BackoffController::new(
        inner.config.base_delay,
        inner.config.delay_increment,
        inner.config.max_delay,
    );
    while inner.running.load(Ordering::SeqCst) {
        let outcome = inner.poll_once().await;
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        let delay = backoff.next_delay(&outcome);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.wake.notified() => {}
        }
    }
    info!("scheduler loop stopped");
}

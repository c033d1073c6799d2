//! Work-item and indexed-record persistence.
//!
//! The scheduler only sees the [`WorkStore`] boundary: an oldest-first page of
//! pending items plus an atomic batch commit. The default implementation is
//! LMDB-backed with one write transaction per batch.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use chrono::{DateTime, Utc};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::paths::{AppPaths, PathError};
use crate::services::indexer::IndexedRecord;

const WORK_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB
const ITEMS_DB: &str = "items";
const RECORDS_DB: &str = "records";

/// One captured screenshot awaiting recognition and/or embedding completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Path relative to the upload directory.
    pub file_path: String,
    pub captured_at: DateTime<Utc>,
    pub app_name: Option<String>,
    pub window_title: Option<String>,
    pub ocr_completed: bool,
    pub embedding_completed: bool,
    pub created_at_ms: i64,
}

impl WorkItem {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        file_path: impl Into<String>,
        captured_at: DateTime<Utc>,
        app_name: Option<String>,
        window_title: Option<String>,
    ) -> Self {
        let id = id.into();
        debug_assert!(!id.is_empty());
        Self {
            id,
            file_path: file_path.into(),
            captured_at,
            app_name,
            window_title,
            ocr_completed: false,
            embedding_completed: false,
            created_at_ms: current_timestamp_ms(),
        }
    }

    /// Eligible for dispatch iff recognition is still outstanding; embedding
    /// completion is tracked independently.
    pub fn needs_recognition(&self) -> bool {
        !self.ocr_completed
    }

    pub fn is_pending(&self) -> bool {
        !self.ocr_completed || !self.embedding_completed
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

/// Per-item mutation applied by one batch commit.
#[derive(Debug, Clone)]
pub struct BatchUpdate {
    pub item_id: String,
    /// Upserted when present; a recognition success always carries one.
    pub record: Option<IndexedRecord>,
    pub set_ocr_completed: bool,
    pub set_embedding_completed: bool,
}

/// What a batch commit actually applied. Items skipped over a per-item
/// failure keep their flags unset and are retried on the next cycle.
#[derive(Debug, Default, Clone)]
pub struct CommitReport {
    pub applied: usize,
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: usize,
    pub pending_recognition: usize,
    pub pending_embedding: usize,
    pub indexed: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("work item `{0}` already exists")]
    Duplicate(String),
    #[error("work item `{0}` not found")]
    NotFound(String),
}

/// Storage boundary consumed by the poller. Reads are oldest-first pages;
/// all writes for one batch commit together.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Up to `limit` items where recognition or embedding is outstanding,
    /// ordered by creation timestamp ascending so stale items are never
    /// starved by newer uploads.
    async fn list_pending(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError>;

    async fn insert_item(&self, item: &WorkItem) -> Result<(), StoreError>;

    async fn get_item(&self, id: &str) -> Result<Option<WorkItem>, StoreError>;

    async fn get_record(&self, id: &str) -> Result<Option<IndexedRecord>, StoreError>;

    /// Apply every update in one transaction. A per-item failure skips that
    /// item (reported, not fatal); a transaction-level failure aborts the
    /// whole batch.
    async fn commit_batch(&self, updates: Vec<BatchUpdate>) -> Result<CommitReport, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// LMDB-backed persistence for work items and indexed records.
#[derive(Debug)]
pub struct LmdbWorkStore {
    env: Env,
    items: Database<Str, Bytes>,
    records: Database<Str, Bytes>,
}

impl LmdbWorkStore {
    pub fn open(paths: &AppPaths) -> Result<Self, StoreError> {
        let path = paths.work_store_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(8);
        options.map_size(WORK_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(&path)?
        };
        let items = open_or_create(&env, ITEMS_DB)?;
        let records = open_or_create(&env, RECORDS_DB)?;
        Ok(Self {
            env,
            items,
            records,
        })
    }

    fn decode_item(raw: &[u8]) -> Result<WorkItem, StoreError> {
        let (item, _) = decode_from_slice::<WorkItem, _>(raw, config::standard())?;
        Ok(item)
    }
}

fn open_or_create(env: &Env, name: &str) -> Result<Database<Str, Bytes>, StoreError> {
    let rtxn = env.read_txn()?;
    let opened = env.open_database::<Str, Bytes>(&rtxn, Some(name))?;
    drop(rtxn);
    match opened {
        Some(existing) => Ok(existing),
        None => {
            let mut wtxn = env.write_txn()?;
            let db = env.create_database::<Str, Bytes>(&mut wtxn, Some(name))?;
            wtxn.commit()?;
            Ok(db)
        }
    }
}

#[async_trait]
impl WorkStore for LmdbWorkStore {
    async fn list_pending(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        debug_assert!(limit > 0);
        let rtxn = self.env.read_txn()?;
        let iter = self.items.iter(&rtxn)?;
        let mut pending = Vec::new();
        for entry in iter {
            let (_, raw) = entry?;
            let item = Self::decode_item(raw)?;
            if item.is_pending() {
                pending.push(item);
            }
        }
        drop(rtxn);

        pending.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn insert_item(&self, item: &WorkItem) -> Result<(), StoreError> {
        debug_assert!(!item.id.is_empty());
        let mut wtxn = self.env.write_txn()?;
        if self.items.get(&wtxn, item.id.as_str())?.is_some() {
            return Err(StoreError::Duplicate(item.id.clone()));
        }
        let encoded = encode_to_vec(item, config::standard())?;
        self.items
            .put(&mut wtxn, item.id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<WorkItem>, StoreError> {
        debug_assert!(!id.is_empty());
        let rtxn = self.env.read_txn()?;
        match self.items.get(&rtxn, id)? {
            Some(raw) => Ok(Some(Self::decode_item(raw)?)),
            None => Ok(None),
        }
    }

    async fn get_record(&self, id: &str) -> Result<Option<IndexedRecord>, StoreError> {
        debug_assert!(!id.is_empty());
        let rtxn = self.env.read_txn()?;
        match self.records.get(&rtxn, id)? {
            Some(raw) => {
                let (record, _) = decode_from_slice::<IndexedRecord, _>(raw, config::standard())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn commit_batch(&self, updates: Vec<BatchUpdate>) -> Result<CommitReport, StoreError> {
        let mut report = CommitReport::default();
        if updates.is_empty() {
            return Ok(report);
        }

        let mut wtxn = self.env.write_txn()?;
        for update in updates {
            let Some(raw) = self.items.get(&wtxn, update.item_id.as_str())? else {
                warn!(item_id = update.item_id.as_str(), "batch update for unknown item");
                report
                    .skipped
                    .push((update.item_id.clone(), "item not found".to_string()));
                continue;
            };

            let mut item = match Self::decode_item(raw) {
                Ok(item) => item,
                Err(err) => {
                    warn!(item_id = update.item_id.as_str(), error = %err, "undecodable work item");
                    report.skipped.push((update.item_id.clone(), err.to_string()));
                    continue;
                }
            };
            if update.set_ocr_completed {
                item.ocr_completed = true;
            }
            if update.set_embedding_completed {
                item.embedding_completed = true;
            }

            // Encode everything for this item before writing anything, so a
            // per-item failure leaves its flags unset and the item eligible
            // on the next cycle.
            let encoded_item = match encode_to_vec(&item, config::standard()) {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!(item_id = item.id.as_str(), error = %err, "failed to encode work item");
                    report.skipped.push((item.id.clone(), err.to_string()));
                    continue;
                }
            };
            let encoded_record = match update.record.as_ref() {
                Some(record) => match encode_to_vec(record, config::standard()) {
                    Ok(encoded) => Some(encoded),
                    Err(err) => {
                        warn!(item_id = item.id.as_str(), error = %err, "failed to encode indexed record");
                        report.skipped.push((item.id.clone(), err.to_string()));
                        continue;
                    }
                },
                None => None,
            };

            if let Some(encoded_record) = encoded_record {
                self.records
                    .put(&mut wtxn, item.id.as_str(), encoded_record.as_slice())?;
            }
            self.items
                .put(&mut wtxn, item.id.as_str(), encoded_item.as_slice())?;
            report.applied = report.applied.saturating_add(1);
        }
        wtxn.commit()?;
        Ok(report)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let rtxn = self.env.read_txn()?;
        let iter = self.items.iter(&rtxn)?;
        let mut stats = StoreStats::default();
        for entry in iter {
            let (_, raw) = entry?;
            let item = Self::decode_item(raw)?;
            stats.total = stats.total.saturating_add(1);
            if !item.ocr_completed {
                stats.pending_recognition = stats.pending_recognition.saturating_add(1);
            }
            if !item.embedding_completed {
                stats.pending_embedding = stats.pending_embedding.saturating_add(1);
            }
            if item.ocr_completed && item.embedding_completed {
                stats.indexed = stats.indexed.saturating_add(1);
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;
    use crate::services::indexer::OcrMetadata;

    fn open_store(temp: &TempDir) -> LmdbWorkStore {
        let paths = AppPaths::new(temp.path()).expect("app paths");
        LmdbWorkStore::open(&paths).expect("open store")
    }

    fn item_at(id: &str, created_at_ms: i64) -> WorkItem {
        let mut item = WorkItem::new(
            id,
            format!("{id}.png"),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            None,
            None,
        );
        item.created_at_ms = created_at_ms;
        item
    }

    fn record_for(id: &str) -> IndexedRecord {
        IndexedRecord {
            item_id: id.to_string(),
            metadata: OcrMetadata {
                timestamp: "2024-03-01 12:00:00".to_string(),
                active_app: String::new(),
                window_title: String::new(),
                ocr_result: Vec::new(),
            },
            search_tokens: "timestamp 2024".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_is_rejected_for_duplicates() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);

        let item = item_at("img-1", 100);
        store.insert_item(&item).await.expect("initial insert");
        let err = store
            .insert_item(&item)
            .await
            .expect_err("duplicate insert fails");
        match err {
            StoreError::Duplicate(id) => assert_eq!(id, "img-1"),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_page_is_oldest_first_and_limited() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);

        store.insert_item(&item_at("img-new", 300)).await.expect("insert");
        store.insert_item(&item_at("img-old", 100)).await.expect("insert");
        store.insert_item(&item_at("img-mid", 200)).await.expect("insert");

        let page = store.list_pending(2).await.expect("list pending");
        let ids: Vec<&str> = page.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, vec!["img-old", "img-mid"]);
    }

    #[tokio::test]
    async fn completed_items_leave_the_pending_set() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);

        store.insert_item(&item_at("img-1", 100)).await.expect("insert");
        store.insert_item(&item_at("img-2", 200)).await.expect("insert");

        let report = store
            .commit_batch(vec![BatchUpdate {
                item_id: "img-1".to_string(),
                record: Some(record_for("img-1")),
                set_ocr_completed: true,
                set_embedding_completed: true,
            }])
            .await
            .expect("commit");
        assert_eq!(report.applied, 1);
        assert!(report.skipped.is_empty());

        let page = store.list_pending(10).await.expect("list pending");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "img-2");

        let stored = store
            .get_item("img-1")
            .await
            .expect("get item")
            .expect("item present");
        assert!(stored.ocr_completed);
        assert!(stored.embedding_completed);

        let record = store
            .get_record("img-1")
            .await
            .expect("get record")
            .expect("record present");
        assert_eq!(record.item_id, "img-1");
    }

    #[tokio::test]
    async fn unknown_items_are_skipped_without_aborting_the_batch() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);

        store.insert_item(&item_at("img-1", 100)).await.expect("insert");

        let report = store
            .commit_batch(vec![
                BatchUpdate {
                    item_id: "img-missing".to_string(),
                    record: None,
                    set_ocr_completed: true,
                    set_embedding_completed: true,
                },
                BatchUpdate {
                    item_id: "img-1".to_string(),
                    record: None,
                    set_ocr_completed: false,
                    set_embedding_completed: true,
                },
            ])
            .await
            .expect("commit");

        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "img-missing");

        let stored = store
            .get_item("img-1")
            .await
            .expect("get item")
            .expect("item present");
        assert!(!stored.ocr_completed);
        assert!(stored.embedding_completed);
    }

    #[tokio::test]
    async fn stats_reflect_flag_state() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&temp);

        store.insert_item(&item_at("img-1", 100)).await.expect("insert");
        store.insert_item(&item_at("img-2", 200)).await.expect("insert");
        store
            .commit_batch(vec![BatchUpdate {
                item_id: "img-1".to_string(),
                record: Some(record_for("img-1")),
                set_ocr_completed: true,
                set_embedding_completed: true,
            }])
            .await
            .expect("commit");

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending_recognition, 1);
        assert_eq!(stats.pending_embedding, 1);
        assert_eq!(stats.indexed, 1);
    }
}

//! Orchestration layer for the screenshot recognition pipeline.
//!
//! Modules exposed here coordinate external systems (storage, OCR backends,
//! concurrency gates). Pure transforms stay in their own modules so the
//! scheduling and resource accounting remain localized.

pub mod dispatcher;
pub mod embedding;
pub mod indexer;
pub mod limiter;
pub mod recognition;
pub mod registry;
pub mod scheduler;
pub mod selector;
pub mod store;

pub use dispatcher::BatchDispatcher;
pub use embedding::{EmbeddingError, EmbeddingStage, ImmediateEmbeddingStage};
pub use indexer::{IndexedRecord, OcrMetadata, SearchIndexer};
pub use limiter::{BackendGate, GateError};
pub use recognition::{
    DispatchResult, Fragment, HttpRecognitionClient, RecognitionClient, RecognitionFailure,
};
pub use registry::{BackendDescriptor, BackendRegistry, RegistryError};
pub use scheduler::{BackoffController, CycleOutcome, OcrScheduler, SchedulerConfig};
pub use selector::{RoundRobinSelector, SelectorError};
pub use store::{
    BatchUpdate, CommitReport, LmdbWorkStore, StoreError, StoreStats, WorkItem, WorkStore,
};

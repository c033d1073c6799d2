//! Shared constants for the OCR scheduling pipeline.

use std::time::Duration;

/// Body text substituted when a screenshot yields no recognized fragments.
///
/// Bilingual so that blank captures stay distinctly searchable from either
/// script instead of indexing as an empty string.
pub const BLANK_IMAGE_SENTINEL: &str = "空白图片 blank image";

/// Timestamp layout embedded in OCR metadata and search text.
pub const METADATA_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default number of work items fetched per poll cycle.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Initial delay between poll cycles.
pub const DEFAULT_POLL_BASE_DELAY: Duration = Duration::from_secs(10);

/// Step added to the poll delay after an all-failure cycle.
pub const DEFAULT_POLL_DELAY_INCREMENT: Duration = Duration::from_secs(10);

/// Upper bound on the poll delay under sustained failure.
pub const DEFAULT_POLL_MAX_DELAY: Duration = Duration::from_secs(600);

/// Default per-backend recognition timeout.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-backend concurrency limit.
pub const DEFAULT_BACKEND_CONCURRENCY: usize = 2;

/// Default per-backend retry budget. Configured for forward compatibility;
/// the dispatcher retries via re-poll rather than within a cycle.
pub const DEFAULT_BACKEND_MAX_RETRIES: u32 = 3;

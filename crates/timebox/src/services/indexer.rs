//! Converts recognition output into a structured record and a tokenized
//! search representation.

use jieba_rs::Jieba;
use serde::{Deserialize, Serialize};

use crate::constants::{BLANK_IMAGE_SENTINEL, METADATA_TIMESTAMP_FORMAT};
use crate::services::recognition::Fragment;
use crate::services::store::WorkItem;

/// Structured metadata persisted alongside every indexed screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrMetadata {
    pub timestamp: String,
    pub active_app: String,
    pub window_title: String,
    pub ocr_result: Vec<Fragment>,
}

/// Persisted output for one work item: metadata plus the space-joined token
/// stream fed to the text-search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub item_id: String,
    pub metadata: OcrMetadata,
    pub search_tokens: String,
}

/// Builds indexed records. Holds the segmenter dictionary, which is expensive
/// to load, so one indexer is shared for the process lifetime.
pub struct SearchIndexer {
    jieba: Jieba,
}

impl Default for SearchIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchIndexer {
    pub fn new() -> Self {
        Self {
            jieba: Jieba::new(),
        }
    }

    /// Pure function of the item and its fragments: identical inputs yield an
    /// identical record and token sequence.
    pub fn build_record(&self, item: &WorkItem, fragments: &[Fragment]) -> IndexedRecord {
        let body = if fragments.is_empty() {
            BLANK_IMAGE_SENTINEL.to_string()
        } else {
            fragments
                .iter()
                .map(|fragment| fragment.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        };

        let metadata = OcrMetadata {
            timestamp: item.captured_at.format(METADATA_TIMESTAMP_FORMAT).to_string(),
            active_app: item.app_name.clone().unwrap_or_default(),
            window_title: item.window_title.clone().unwrap_or_default(),
            // The sentinel never leaks into metadata; blank captures keep an
            // empty fragment list.
            ocr_result: fragments.to_vec(),
        };

        let search_text = [
            format!("timestamp: {}", metadata.timestamp),
            format!("active_app: {}", metadata.active_app),
            format!("window_title: {}", metadata.window_title),
            format!("ocr_result: {body}"),
        ]
        .join("\n");
        let search_tokens = self.segment(&search_text);

        IndexedRecord {
            item_id: item.id.clone(),
            metadata,
            search_tokens,
        }
    }

    /// Search-mode segmentation tuned for mixed-script short-form text,
    /// producing space-joined tokens.
    fn segment(&self, text: &str) -> String {
        self.jieba
            .cut_for_search(text, true)
            .into_iter()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn item() -> WorkItem {
        let mut item = WorkItem::new(
            "img-1",
            "2024/01/shot.png",
            Utc.with_ymd_and_hms(2024, 1, 15, 9, 30, 5).unwrap(),
            Some("Safari".to_string()),
            Some("Release notes".to_string()),
        );
        item.created_at_ms = 1_700_000_000_000;
        item
    }

    fn fragment(text: &str) -> Fragment {
        Fragment {
            text: text.to_string(),
            confidence: 0.9,
            position: vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]],
        }
    }

    #[test]
    fn metadata_embeds_formatted_timestamp_and_titles() {
        let indexer = SearchIndexer::new();
        let record = indexer.build_record(&item(), &[fragment("hello")]);

        assert_eq!(record.item_id, "img-1");
        assert_eq!(record.metadata.timestamp, "2024-01-15 09:30:05");
        assert_eq!(record.metadata.active_app, "Safari");
        assert_eq!(record.metadata.window_title, "Release notes");
        assert_eq!(record.metadata.ocr_result.len(), 1);
    }

    #[test]
    fn missing_app_and_title_become_empty_strings() {
        let mut item = item();
        item.app_name = None;
        item.window_title = None;

        let indexer = SearchIndexer::new();
        let record = indexer.build_record(&item, &[fragment("hello")]);
        assert_eq!(record.metadata.active_app, "");
        assert_eq!(record.metadata.window_title, "");
    }

    #[test]
    fn empty_fragment_list_indexes_the_sentinel() {
        let indexer = SearchIndexer::new();
        let record = indexer.build_record(&item(), &[]);

        assert!(record.metadata.ocr_result.is_empty());
        assert!(!record.search_tokens.is_empty());
        assert!(record.search_tokens.contains("blank"));
        assert!(record.search_tokens.contains("空白"));
    }

    #[test]
    fn fragment_texts_are_space_joined_in_order() {
        let indexer = SearchIndexer::new();
        let record = indexer.build_record(&item(), &[fragment("alpha"), fragment("beta")]);
        assert!(record.search_tokens.contains("alpha"));
        assert!(record.search_tokens.contains("beta"));
        let alpha = record.search_tokens.find("alpha").expect("alpha indexed");
        let beta = record.search_tokens.find("beta").expect("beta indexed");
        assert!(alpha < beta, "fragment order must be preserved");
    }

    #[test]
    fn mixed_script_text_is_segmented_into_tokens() {
        let indexer = SearchIndexer::new();
        let record = indexer.build_record(&item(), &[fragment("今天天气 weather report")]);
        let tokens: Vec<&str> = record.search_tokens.split(' ').collect();
        assert!(tokens.contains(&"weather"));
        assert!(tokens.contains(&"天气"));
    }

    #[test]
    fn building_twice_yields_identical_records() {
        let indexer = SearchIndexer::new();
        let fragments = vec![fragment("重复 repeatable"), fragment("tokens")];
        let first = indexer.build_record(&item(), &fragments);
        let second = indexer.build_record(&item(), &fragments);
        assert_eq!(first, second);
    }
}

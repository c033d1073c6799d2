//! Timebox: background OCR scheduling and search indexing for screenshot
//! captures.
//!
//! The crate polls a work store for screenshots that still need recognition,
//! fans each batch out across a pool of OCR backends with per-backend
//! concurrency limits, folds the recognized text into tokenized search
//! records, and adapts its poll cadence to backend health.

pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod paths;
pub mod services;

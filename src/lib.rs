//! Blur and near-duplicate triage for large photo folders.
//!
//! A scan fingerprints every image once (blur scores plus pHash/dHash),
//! caching the result next to the photos. Blur verdicts come from batch
//! thresholds over those scores; duplicates come from a hybrid hash radius
//! search narrowed by mutual nearest neighbours, SSIM and an HSV
//! histogram check.

pub mod config;
pub mod core;
pub mod database;

pub use crate::config::{Config, ConfigError, KeepPolicy, Reducer, SignalThreshold, ThresholdPolicy};
pub use crate::core::pipeline::{PipelineError, TriageOutcome, TriagePipeline, TriageReport};
pub use crate::core::scanner::{ScanPhase, ScanProgress, ScanStats};
pub use crate::database::{FingerprintStore, ImageFingerprint, SqliteStore, StoreError};

pub mod cache;
pub mod models;

pub use cache::SqliteStore;
pub use models::{ImageFingerprint, MutationSignature, SignatureMode};

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Cache file written next to the scanned photos.
pub const CACHE_FILE_NAME: &str = ".cullscan_cache.sqlite";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache at {path} is unreadable: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Persistent map from image path to its previously computed features.
///
/// Writes take `&mut self`: whoever owns the store is its single writer.
/// A row is written in one statement, so a reader sees either the whole
/// fingerprint or nothing.
pub trait FingerprintStore {
    fn get(&self, path: &Path) -> Result<Option<ImageFingerprint>, StoreError>;

    fn put(&mut self, fingerprint: &ImageFingerprint) -> Result<(), StoreError>;

    /// Drops the row for `path` when its stored signature differs from
    /// `current`. Returns whether a row was dropped.
    fn invalidate_if_stale(
        &mut self,
        path: &Path,
        current: &MutationSignature,
    ) -> Result<bool, StoreError>;

    /// Removes rows whose path is not in `seen`. Returns the number removed.
    fn purge_missing(&mut self, seen: &HashSet<PathBuf>) -> Result<usize, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

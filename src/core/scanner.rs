use crate::config::ScanConfig;
use crate::core::features::{ExtractError, FeatureExtractor, Features};
use crate::core::hash::HashService;
use crate::database::models::{ImageFingerprint, MutationSignature, SignatureMode};
use crate::database::{FingerprintStore, StoreError};
use crossbeam_channel::Sender;
use glob::Pattern;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fingerprint cache error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid exclude pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("An extraction worker panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub files_processed: usize,
    pub total_files: usize,
    pub current_file: String,
    pub phase: ScanPhase,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScanPhase {
    Discovery,
    Fingerprinting,
    Classification,
    Candidates,
    Refinement,
    Complete,
}

/// Per-scan counters. Per-item failures end up here instead of aborting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub discovered: usize,
    /// Reused from the fingerprint cache.
    pub cached: usize,
    pub extracted: usize,
    /// Unreadable or undecodable images.
    pub failed: usize,
    /// Cache reads or writes that failed; the scan carried on without them.
    pub store_errors: usize,
    pub purged: usize,
}

#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Sorted by path.
    pub fingerprints: Vec<ImageFingerprint>,
    pub stats: ScanStats,
    pub failed_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Completed(ScanResult),
    /// Rows written before the cancellation stay in the store.
    Cancelled(ScanStats),
}

type Extracted = (PathBuf, MutationSignature, Result<Features, ExtractError>);

pub struct ScannerService {
    progress_sender: Option<Sender<ScanProgress>>,
    cancellation_token: Arc<AtomicBool>,
    supported_formats: HashSet<String>,
    exclude_patterns: Vec<String>,
    workers: usize,
    signature_mode: SignatureMode,
    purge_missing: bool,
    hash_service: HashService,
}

impl ScannerService {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            supported_formats: config
                .extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect(),
            exclude_patterns: config.exclude_patterns.clone(),
            workers: config.worker_count(),
            signature_mode: config.signature,
            purge_missing: config.purge_missing,
            hash_service: HashService::new(),
        }
    }

    pub fn with_progress_sender(mut self, sender: Sender<ScanProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    /// Shares an existing token, so one flag can stop a whole pipeline.
    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel_scan(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    /// Fingerprints every eligible image under `root`, reusing fresh cache
    /// rows and extracting the rest on a bounded worker pool. All store
    /// writes happen on the calling thread.
    pub fn scan(
        &self,
        root: &Path,
        extractor: &FeatureExtractor,
        store: &mut dyn FingerprintStore,
    ) -> Result<ScanOutcome, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::InvalidPath {
                path: root.to_string_lossy().to_string(),
            });
        }
        let root = root.canonicalize()?;

        let exclude_patterns = self
            .exclude_patterns
            .iter()
            .map(|pattern| Pattern::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = ScanStats::default();

        // Phase 1: Discovery
        self.send_progress(ScanProgress {
            files_processed: 0,
            total_files: 0,
            current_file: "Discovering files...".to_string(),
            phase: ScanPhase::Discovery,
        });

        let files = self.discover_files(&root, &exclude_patterns);
        stats.discovered = files.len();
        log::info!("Discovered {} images under {}", files.len(), root.display());

        if self.is_cancelled() {
            return Ok(ScanOutcome::Cancelled(stats));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()?;

        // Phase 2: Fingerprinting
        let signatures: Vec<(PathBuf, Option<MutationSignature>)> = pool.install(|| {
            files
                .par_iter()
                .map(|path| {
                    if self.is_cancelled() {
                        return (path.clone(), None);
                    }
                    match self.hash_service.compute_signature(path, self.signature_mode) {
                        Ok(signature) => (path.clone(), Some(signature)),
                        Err(e) => {
                            log::warn!("Failed to read {}: {}", path.display(), e);
                            (path.clone(), None)
                        }
                    }
                })
                .collect()
        });

        if self.is_cancelled() {
            return Ok(ScanOutcome::Cancelled(stats));
        }

        let mut fingerprints = Vec::with_capacity(files.len());
        let mut failed_paths = Vec::new();
        let mut pending = Vec::new();

        for (path, signature) in signatures {
            let Some(signature) = signature else {
                stats.failed += 1;
                failed_paths.push(path);
                continue;
            };

            match self.lookup_fresh(store, extractor, &path, &signature) {
                Ok(Some(fingerprint)) => {
                    stats.cached += 1;
                    fingerprints.push(fingerprint);
                }
                Ok(None) => pending.push((path, signature)),
                Err(e) => {
                    log::warn!("Cache lookup failed for {}: {}", path.display(), e);
                    stats.store_errors += 1;
                    pending.push((path, signature));
                }
            }
        }

        log::debug!(
            "{} cached, {} to extract, {} unreadable",
            stats.cached,
            pending.len(),
            stats.failed
        );

        let total_files = files.len();
        let mut processed = stats.cached + stats.failed;
        self.send_progress(ScanProgress {
            files_processed: processed,
            total_files,
            current_file: "Extracting features...".to_string(),
            phase: ScanPhase::Fingerprinting,
        });

        let (tx, rx) = crossbeam_channel::bounded::<Extracted>(self.workers * 4);
        let cancel = self.cancellation_token.clone();
        let pool = &pool;

        thread::scope(|scope| {
            let producer = scope.spawn(move || {
                pool.install(|| {
                    pending
                        .into_par_iter()
                        .for_each_with(tx, |tx, (path, signature)| {
                            if cancel.load(Ordering::Relaxed) {
                                return;
                            }
                            let result = extractor.extract_path(&path);
                            let _ = tx.send((path, signature, result));
                        });
                });
            });

            // Single writer: every result funnels through here.
            for (path, signature, result) in rx.iter() {
                processed += 1;
                match result {
                    Ok(features) => {
                        let fingerprint = ImageFingerprint::from_features(
                            path,
                            signature,
                            extractor.profile(),
                            features,
                        );
                        if let Err(e) = store.put(&fingerprint) {
                            log::warn!(
                                "Failed to cache {}: {}",
                                fingerprint.path.display(),
                                e
                            );
                            stats.store_errors += 1;
                        }
                        stats.extracted += 1;
                        self.send_progress(ScanProgress {
                            files_processed: processed,
                            total_files,
                            current_file: fingerprint.path.to_string_lossy().to_string(),
                            phase: ScanPhase::Fingerprinting,
                        });
                        fingerprints.push(fingerprint);
                    }
                    Err(e) => {
                        log::warn!("Skipping {}: {}", path.display(), e);
                        stats.failed += 1;
                        failed_paths.push(path);
                    }
                }
            }

            producer.join().map_err(|_| ScanError::WorkerPanicked)
        })?;

        if self.is_cancelled() {
            log::info!(
                "Scan cancelled after {} extractions; cached rows are kept",
                stats.extracted
            );
            return Ok(ScanOutcome::Cancelled(stats));
        }

        if self.purge_missing {
            let seen: HashSet<PathBuf> = files.into_iter().collect();
            match store.purge_missing(&seen) {
                Ok(purged) => stats.purged = purged,
                Err(e) => {
                    log::warn!("Failed to purge stale cache rows: {}", e);
                    stats.store_errors += 1;
                }
            }
        }

        fingerprints.sort_by(|a, b| a.path.cmp(&b.path));
        failed_paths.sort();

        Ok(ScanOutcome::Completed(ScanResult {
            fingerprints,
            stats,
            failed_paths,
        }))
    }

    /// A cached row is fresh when its signature matches and it was computed
    /// with the current blur parameters.
    fn lookup_fresh(
        &self,
        store: &mut dyn FingerprintStore,
        extractor: &FeatureExtractor,
        path: &Path,
        signature: &MutationSignature,
    ) -> Result<Option<ImageFingerprint>, StoreError> {
        if store.invalidate_if_stale(path, signature)? {
            log::debug!("{} changed since last scan", path.display());
            return Ok(None);
        }

        Ok(store.get(path)?.filter(|fingerprint| {
            fingerprint.profile == extractor.profile()
                && (!extractor.computes_tenengrad() || fingerprint.tenengrad.is_some())
        }))
    }

    fn discover_files(&self, root: &Path, exclude_patterns: &[Pattern]) -> Vec<PathBuf> {
        let mut discovered_files = Vec::new();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if self.is_cancelled() {
                break;
            }

            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }

            let path_str = path.to_string_lossy();
            if exclude_patterns
                .iter()
                .any(|pattern| pattern.matches(&path_str))
            {
                continue;
            }

            if self.is_supported_format(path) {
                discovered_files.push(path.to_path_buf());
            }
        }

        // Lexicographic by full path, independent of walk order.
        discovered_files.sort();
        discovered_files
    }

    fn send_progress(&self, progress: ScanProgress) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(progress);
        }
    }

    pub fn is_supported_format(&self, file_path: &Path) -> bool {
        if let Some(extension) = file_path.extension() {
            let ext = extension.to_string_lossy().to_lowercase();
            self.supported_formats.contains(&ext)
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlurConfig;
    use crate::database::SqliteStore;
    use image::{ImageBuffer, Rgb};
    use std::fs;
    use tempfile::TempDir;

    fn write_image(path: &Path, seed: u32, size: u32) {
        let image = ImageBuffer::from_fn(size, size, |x, y| {
            Rgb([
                ((x * 7 + seed * 31) % 256) as u8,
                ((y * 5 + seed * 17) % 256) as u8,
                (((x + y) * 3 + seed) % 256) as u8,
            ])
        });
        image.save(path).unwrap();
    }

    fn completed(outcome: ScanOutcome) -> ScanResult {
        match outcome {
            ScanOutcome::Completed(result) => result,
            ScanOutcome::Cancelled(stats) => panic!("scan cancelled: {:?}", stats),
        }
    }

    #[test]
    fn test_discovery_filters_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("nested")).unwrap();
        fs::create_dir(root.join("skip")).unwrap();
        write_image(&root.join("b.png"), 1, 16);
        write_image(&root.join("A.PNG"), 2, 16);
        write_image(&root.join("nested/c.png"), 3, 16);
        write_image(&root.join("skip/d.png"), 4, 16);
        fs::write(root.join("notes.txt"), b"not an image").unwrap();

        let scanner = ScannerService::new(&ScanConfig {
            exclude_patterns: vec!["*/skip/*".to_string()],
            ..ScanConfig::default()
        });
        let root = root.canonicalize().unwrap();
        let files = scanner.discover_files(&root, &[Pattern::new("*/skip/*").unwrap()]);

        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(&root).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["A.PNG", "b.png", "nested/c.png"]);
    }

    #[test]
    fn test_is_supported_format() {
        let scanner = ScannerService::new(&ScanConfig::default());
        assert!(scanner.is_supported_format(Path::new("x.JPG")));
        assert!(scanner.is_supported_format(Path::new("x.webp")));
        assert!(!scanner.is_supported_format(Path::new("x.cr3")));
        assert!(!scanner.is_supported_format(Path::new("README")));
    }

    #[test]
    fn test_second_scan_reuses_cache() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..5 {
            write_image(&temp_dir.path().join(format!("img{}.png", i)), i, 24);
        }

        let scanner = ScannerService::new(&ScanConfig::default());
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let mut store = SqliteStore::open_in_memory().unwrap();

        let first = completed(scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap());
        assert_eq!(first.stats.extracted, 5);
        assert_eq!(first.stats.cached, 0);
        assert_eq!(store.len().unwrap(), 5);

        let second = completed(scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap());
        assert_eq!(second.stats.cached, 5);
        assert_eq!(second.stats.extracted, 0);
        assert_eq!(second.fingerprints, first.fingerprints);
    }

    #[test]
    fn test_changed_file_is_reextracted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("photo.png");
        write_image(&path, 1, 24);

        let scanner = ScannerService::new(&ScanConfig::default());
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let mut store = SqliteStore::open_in_memory().unwrap();
        completed(scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap());

        write_image(&path, 9, 40);
        let result = completed(scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap());

        assert_eq!(result.stats.extracted, 1);
        assert_eq!(result.fingerprints[0].width, 40);
    }

    #[test]
    fn test_profile_change_forces_reextraction() {
        let temp_dir = TempDir::new().unwrap();
        write_image(&temp_dir.path().join("photo.png"), 1, 24);

        let scanner = ScannerService::new(&ScanConfig::default());
        let mut store = SqliteStore::open_in_memory().unwrap();

        let without_tenengrad = FeatureExtractor::new(&BlurConfig {
            tenengrad: None,
            ..BlurConfig::default()
        });
        completed(scanner.scan(temp_dir.path(), &without_tenengrad, &mut store).unwrap());

        // Same profile, but the row lacks the now-required Tenengrad score.
        let with_tenengrad = FeatureExtractor::new(&BlurConfig::default());
        let result =
            completed(scanner.scan(temp_dir.path(), &with_tenengrad, &mut store).unwrap());
        assert_eq!(result.stats.extracted, 1);
        assert!(result.fingerprints[0].tenengrad.is_some());

        let mean = FeatureExtractor::new(&BlurConfig {
            reducer: crate::config::Reducer::Mean,
            ..BlurConfig::default()
        });
        let result = completed(scanner.scan(temp_dir.path(), &mean, &mut store).unwrap());
        assert_eq!(result.stats.extracted, 1);
        assert_eq!(result.fingerprints[0].profile, mean.profile());
    }

    #[test]
    fn test_corrupt_image_is_counted_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        write_image(&temp_dir.path().join("good.png"), 1, 24);
        fs::write(temp_dir.path().join("bad.jpg"), b"garbage bytes").unwrap();

        let scanner = ScannerService::new(&ScanConfig::default());
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let mut store = SqliteStore::open_in_memory().unwrap();
        let result = completed(scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap());

        assert_eq!(result.stats.discovered, 2);
        assert_eq!(result.stats.failed, 1);
        assert_eq!(result.fingerprints.len(), 1);
        assert!(result.failed_paths[0].ends_with("bad.jpg"));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_deleted_files_are_purged() {
        let temp_dir = TempDir::new().unwrap();
        write_image(&temp_dir.path().join("keep.png"), 1, 24);
        write_image(&temp_dir.path().join("gone.png"), 2, 24);

        let scanner = ScannerService::new(&ScanConfig::default());
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let mut store = SqliteStore::open_in_memory().unwrap();
        completed(scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap());

        fs::remove_file(temp_dir.path().join("gone.png")).unwrap();
        let result = completed(scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap());

        assert_eq!(result.stats.purged, 1);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_cancelled_scan_keeps_store_untouched() {
        let temp_dir = TempDir::new().unwrap();
        write_image(&temp_dir.path().join("a.png"), 1, 24);

        let scanner = ScannerService::new(&ScanConfig::default());
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let mut store = SqliteStore::open_in_memory().unwrap();
        let stale = ImageFingerprint {
            path: PathBuf::from("/elsewhere/old.png"),
            signature: MutationSignature::Stat {
                modified_ns: 0,
                size: 1,
            },
            profile: extractor.profile().to_string(),
            blur_score: 1.0,
            tenengrad: Some(1.0),
            phash: Default::default(),
            dhash: Default::default(),
            width: 1,
            height: 1,
        };
        store.put(&stale).unwrap();

        scanner.cancel_scan();
        let outcome = scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap();

        assert!(matches!(outcome, ScanOutcome::Cancelled(_)));
        // No purge on a cancelled scan.
        assert!(store.get(&stale.path).unwrap().is_some());
    }

    #[test]
    fn test_cancel_during_extraction_keeps_written_rows() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..24 {
            write_image(&temp_dir.path().join(format!("img{:02}.png", i)), i, 48);
        }
        let config = ScanConfig {
            workers: Some(1),
            ..ScanConfig::default()
        };
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let mut store = SqliteStore::open_in_memory().unwrap();

        // Rendezvous channel: the writer waits until each update is seen, so
        // the token is set before the worker can run far ahead.
        let (tx, rx) = crossbeam_channel::bounded::<ScanProgress>(0);
        let scanner = ScannerService::new(&config).with_progress_sender(tx);
        let token = scanner.get_cancellation_token();
        let listener = thread::spawn(move || {
            for update in rx.iter() {
                if update.phase == ScanPhase::Fingerprinting && update.files_processed > 0 {
                    token.store(true, Ordering::Relaxed);
                }
            }
        });

        let outcome = scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap();
        drop(scanner);
        listener.join().unwrap();

        let ScanOutcome::Cancelled(stats) = outcome else {
            panic!("scan was not cancelled");
        };
        let written = store.len().unwrap();
        assert!(written > 0);
        assert!(written < 24, "{} rows written", written);
        assert_eq!(stats.extracted, written);

        let rescan = ScannerService::new(&config);
        let result = completed(rescan.scan(temp_dir.path(), &extractor, &mut store).unwrap());
        assert_eq!(result.stats.cached, written);
        assert_eq!(result.stats.extracted, 24 - written);
        assert_eq!(store.len().unwrap(), 24);
    }

    #[test]
    fn test_progress_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        for i in 0..3 {
            write_image(&temp_dir.path().join(format!("img{}.png", i)), i, 16);
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let scanner = ScannerService::new(&ScanConfig::default()).with_progress_sender(tx);
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let mut store = SqliteStore::open_in_memory().unwrap();
        completed(scanner.scan(temp_dir.path(), &extractor, &mut store).unwrap());
        drop(scanner);

        let updates: Vec<ScanProgress> = rx.iter().collect();
        assert_eq!(updates[0].phase, ScanPhase::Discovery);
        let last = updates.last().unwrap();
        assert_eq!(last.phase, ScanPhase::Fingerprinting);
        assert_eq!(last.files_processed, 3);
        assert_eq!(last.total_files, 3);
    }

    #[test]
    fn test_invalid_root() {
        let scanner = ScannerService::new(&ScanConfig::default());
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let mut store = SqliteStore::open_in_memory().unwrap();
        let result = scanner.scan(Path::new("/no/such/folder"), &extractor, &mut store);
        assert!(matches!(result, Err(ScanError::InvalidPath { .. })));
    }
}

use crate::config::{Config, ConfigError};
use crate::core::blur::{BlurClassifier, BlurReport};
use crate::core::candidates::{CandidateGenerator, DistanceMetric, Stage};
use crate::core::color::HsvCrossChecker;
use crate::core::duplicate::{DuplicateGroup, LabeledPair, PairAssembler};
use crate::core::features::FeatureExtractor;
use crate::core::mnn::MnnFilter;
use crate::core::report::{ReportError, StageCounts, write_pairs_csv};
use crate::core::scanner::{
    ScanError, ScanOutcome, ScanPhase, ScanProgress, ScanStats, ScannerService,
};
use crate::core::ssim::SsimRefiner;
use crate::database::models::ImageFingerprint;
use crate::database::{FingerprintStore, SqliteStore};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Report(#[from] ReportError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarityReport {
    pub pairs: Vec<LabeledPair>,
    pub groups: Vec<DuplicateGroup>,
    pub counts: StageCounts,
    /// MNN survivors ranked past the SSIM budget.
    pub ssim_skipped: usize,
    /// Pairs dropped because an image failed to decode during refinement.
    pub unreadable: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriageReport {
    pub root: PathBuf,
    pub scan: ScanStats,
    pub failed: Vec<PathBuf>,
    pub blur: BlurReport,
    pub similarity: SimilarityReport,
}

#[derive(Debug, Clone)]
pub enum TriageOutcome {
    Completed(Box<TriageReport>),
    /// Batch statistics were discarded; cached fingerprints were kept.
    Cancelled(ScanStats),
}

/// Blur classification and duplicate search over one folder.
pub struct TriagePipeline {
    config: Config,
    progress_sender: Option<Sender<ScanProgress>>,
    cancellation_token: Arc<AtomicBool>,
}

impl TriagePipeline {
    /// Fails on out-of-range settings before any file is touched.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_progress_sender(mut self, sender: Sender<ScanProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    /// Runs against the cache colocated with `root`. An unreadable cache is
    /// discarded and the folder rescanned from scratch.
    pub fn run(&self, root: &Path) -> Result<TriageOutcome, PipelineError> {
        if !root.is_dir() {
            return Err(ScanError::InvalidPath {
                path: root.to_string_lossy().to_string(),
            }
            .into());
        }
        let mut store = SqliteStore::open_or_reset(root).map_err(ScanError::from)?;
        self.run_with_store(root, &mut store)
    }

    pub fn run_with_store(
        &self,
        root: &Path,
        store: &mut dyn FingerprintStore,
    ) -> Result<TriageOutcome, PipelineError> {
        let config = &self.config;
        let similarity = &config.similarity;

        let extractor = FeatureExtractor::new(&config.blur);
        let mut scanner = ScannerService::new(&config.scan)
            .with_cancellation_token(self.cancellation_token.clone());
        if let Some(sender) = &self.progress_sender {
            scanner = scanner.with_progress_sender(sender.clone());
        }

        let scan = match scanner.scan(root, &extractor, store)? {
            ScanOutcome::Completed(result) => result,
            ScanOutcome::Cancelled(stats) => return Ok(TriageOutcome::Cancelled(stats)),
        };
        let images = scan.fingerprints.len();
        log::info!(
            "Fingerprinted {} images ({} cached, {} extracted, {} failed)",
            images,
            scan.stats.cached,
            scan.stats.extracted,
            scan.stats.failed
        );

        // Blur path
        self.send_phase(ScanPhase::Classification, images, "Classifying blur...");
        let blur = BlurClassifier::new(&config.blur).classify(&scan.fingerprints);
        log::info!(
            "{} of {} images flagged blurry (threshold {:.2})",
            blur.blurry_count(),
            images,
            blur.threshold.value
        );
        if self.is_cancelled() {
            return Ok(TriageOutcome::Cancelled(scan.stats));
        }

        // Similarity path
        self.send_phase(ScanPhase::Candidates, images, "Searching for near-duplicates...");
        let pool = if similarity.exclude_blurry {
            Cow::Owned(select_sharp(&scan.fingerprints, &blur))
        } else {
            Cow::Borrowed(scan.fingerprints.as_slice())
        };
        let candidates = CandidateGenerator::new(similarity).generate(&pool);
        if self.is_cancelled() {
            return Ok(TriageOutcome::Cancelled(scan.stats));
        }

        let metric = DistanceMetric::from_config(similarity);
        let mnn = MnnFilter::new(similarity.mnn_k, metric).filter(&candidates.pairs);
        if self.is_cancelled() {
            return Ok(TriageOutcome::Cancelled(scan.stats));
        }

        self.send_phase(ScanPhase::Refinement, mnn.len(), "Refining candidate pairs...");
        let ssim = SsimRefiner::new(similarity.ssim_threshold, similarity.ssim_top_n, metric)
            .with_cancellation_token(self.cancellation_token.clone())
            .refine(&mnn);
        if self.is_cancelled() {
            return Ok(TriageOutcome::Cancelled(scan.stats));
        }

        let hsv = HsvCrossChecker::new(similarity.hsv_min_correlation)
            .with_cancellation_token(self.cancellation_token.clone())
            .check(&ssim.survivors);
        if self.is_cancelled() {
            return Ok(TriageOutcome::Cancelled(scan.stats));
        }

        let final_pairs: Vec<_> = hsv
            .survivors
            .iter()
            .cloned()
            .map(|pair| pair.advance(Stage::Final))
            .collect();
        let assembly =
            PairAssembler::new(similarity.keep_policy).assemble(&final_pairs, &scan.fingerprints);

        let counts = StageCounts {
            phash: candidates.phash_images,
            dhash: candidates.dhash_images,
            p_only: candidates.phash_pairs,
            d_only: candidates.dhash_pairs,
            both: candidates.both,
            hybrid: candidates.hybrid(),
            post_mnn: mnn.len(),
            post_ssim: ssim.survivors.len(),
            post_hsv: hsv.survivors.len(),
        };
        if config.debug.stage_counts {
            log::info!("{}", counts);
        } else {
            log::debug!("{}", counts);
        }

        if let Some(csv_path) = &config.debug.pairs_csv {
            let rows = write_pairs_csv(
                csv_path,
                &[
                    (Stage::Hybrid, &candidates.pairs[..]),
                    (Stage::Mnn, &mnn[..]),
                    (Stage::Ssim, &ssim.survivors[..]),
                    (Stage::Hsv, &hsv.survivors[..]),
                    (Stage::Final, &final_pairs[..]),
                ],
            )?;
            log::info!("Wrote {} pair records to {}", rows, csv_path.display());
        }

        self.send_phase(ScanPhase::Complete, images, "Triage complete");

        Ok(TriageOutcome::Completed(Box::new(TriageReport {
            root: root.to_path_buf(),
            scan: scan.stats,
            failed: scan.failed_paths,
            blur,
            similarity: SimilarityReport {
                pairs: assembly.pairs,
                groups: assembly.groups,
                counts,
                ssim_skipped: ssim.skipped,
                unreadable: ssim.unreadable + hsv.unreadable,
            },
        })))
    }

    fn send_phase(&self, phase: ScanPhase, total: usize, message: &str) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(ScanProgress {
                files_processed: if phase == ScanPhase::Complete { total } else { 0 },
                total_files: total,
                current_file: message.to_string(),
                phase,
            });
        }
    }
}

/// Sharp images only, topped up with the least blurry of the rest so at
/// least two images remain to compare. Keeps path order.
fn select_sharp(fingerprints: &[ImageFingerprint], blur: &BlurReport) -> Vec<ImageFingerprint> {
    let (mut selected, mut blurry): (Vec<_>, Vec<_>) = fingerprints
        .iter()
        .zip(&blur.verdicts)
        .partition(|(_, verdict)| !verdict.is_blurry);

    if selected.len() < 2 {
        blurry.sort_by(|x, y| {
            y.0.blur_score
                .total_cmp(&x.0.blur_score)
                .then_with(|| x.0.path.cmp(&y.0.path))
        });
        let needed = 2 - selected.len();
        selected.extend(blurry.into_iter().take(needed));
    }

    let mut selected: Vec<ImageFingerprint> =
        selected.into_iter().map(|(f, _)| f.clone()).collect();
    selected.sort_by(|x, y| x.path.cmp(&y.path));
    log::debug!(
        "{} of {} images enter duplicate search",
        selected.len(),
        fingerprints.len()
    );
    selected
}

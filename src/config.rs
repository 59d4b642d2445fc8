use crate::database::models::SignatureMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {message}")]
    OutOfRange {
        field: &'static str,
        message: String,
    },
}

fn out_of_range(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        message: message.into(),
    }
}

/// How a batch threshold is derived from the batch's scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "lowercase")]
pub enum ThresholdPolicy {
    /// A literal threshold.
    Fixed(f64),
    /// The given percentile (0..=100) of the batch scores.
    Percentile(f64),
    /// `mean + k * stddev` over the batch.
    ZScore(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalThreshold {
    pub policy: ThresholdPolicy,
    /// Used when the batch is too small or flat for a statistical policy.
    pub fallback: f64,
}

impl SignalThreshold {
    pub fn fixed(value: f64) -> Self {
        Self {
            policy: ThresholdPolicy::Fixed(value),
            fallback: value,
        }
    }

    pub fn percentile(p: f64, fallback: f64) -> Self {
        Self {
            policy: ThresholdPolicy::Percentile(p),
            fallback,
        }
    }

    pub fn zscore(k: f64, fallback: f64) -> Self {
        Self {
            policy: ThresholdPolicy::ZScore(k),
            fallback,
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if !self.fallback.is_finite() {
            return Err(out_of_range(field, "fallback must be finite"));
        }
        match self.policy {
            ThresholdPolicy::Fixed(v) | ThresholdPolicy::ZScore(v) if !v.is_finite() => {
                Err(out_of_range(field, "parameter must be finite"))
            }
            ThresholdPolicy::Percentile(p) if !(0.0..=100.0).contains(&p) => Err(out_of_range(
                field,
                format!("percentile {} outside 0..=100", p),
            )),
            _ => Ok(()),
        }
    }
}

/// Aggregation of per-scale blur scores into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    #[default]
    Median,
    Mean,
    Max,
    Min,
}

impl Reducer {
    /// Reduces `values`; 0.0 for an empty slice.
    pub fn reduce(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Reducer::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reducer::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reducer::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Reducer::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Reducer::Median => "median",
            Reducer::Mean => "mean",
            Reducer::Max => "max",
            Reducer::Min => "min",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    /// Threshold for the multi-scale Laplacian variance.
    pub threshold: SignalThreshold,
    /// Secondary Tenengrad signal; `None` disables it.
    pub tenengrad: Option<SignalThreshold>,
    pub reducer: Reducer,
    /// Gaussian pre-blur kernel size. 0 or 1 disables the pre-blur.
    pub gaussian_kernel: u32,
    /// Laplacian aperture: 1 is the 4-neighbour stencil, 3 the Sobel-derived
    /// 3x3 kernel the default thresholds are calibrated for.
    pub laplacian_ksize: u32,
    /// Scale factors relative to the (possibly downscaled) image.
    pub scales: Vec<f64>,
    /// Longest side before blur scoring; larger images are downscaled.
    pub max_side: Option<u32>,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            threshold: SignalThreshold::fixed(800.0),
            tenengrad: Some(SignalThreshold::fixed(800.0)),
            reducer: Reducer::Median,
            gaussian_kernel: 3,
            laplacian_ksize: 3,
            scales: vec![1.0, 0.5, 0.25],
            max_side: Some(2000),
        }
    }
}

/// Which image of a duplicate cluster is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeepPolicy {
    /// Highest multi-scale blur score.
    #[default]
    Sharpest,
    /// Largest width * height.
    HighestResolution,
    /// Lexicographically smallest path.
    FirstPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceWeights {
    pub phash: f64,
    pub dhash: f64,
}

impl Default for DistanceWeights {
    fn default() -> Self {
        Self {
            phash: 0.7,
            dhash: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub phash_radius: u32,
    pub dhash_radius: u32,
    pub mnn_k: usize,
    pub ssim_threshold: f64,
    /// Pairs beyond the best N are dropped without SSIM evaluation.
    pub ssim_top_n: usize,
    pub hsv_min_correlation: f64,
    pub weights: DistanceWeights,
    /// Leave blurry images out of duplicate search.
    pub exclude_blurry: bool,
    pub keep_policy: KeepPolicy,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            phash_radius: 8,
            dhash_radius: 12,
            mnn_k: 3,
            ssim_threshold: 0.88,
            ssim_top_n: 300,
            hsv_min_correlation: 0.90,
            weights: DistanceWeights::default(),
            exclude_blurry: false,
            keep_policy: KeepPolicy::Sharpest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Lowercase extensions without the dot.
    pub extensions: Vec<String>,
    /// Glob patterns matched against the full path.
    pub exclude_patterns: Vec<String>,
    /// Extraction threads; `None` uses every CPU.
    pub workers: Option<usize>,
    pub signature: SignatureMode,
    /// Drop cache rows for files that disappeared, after a completed scan.
    pub purge_missing: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: ["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "webp"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            exclude_patterns: Vec::new(),
            workers: None,
            signature: SignatureMode::Stat,
            purge_missing: true,
        }
    }
}

impl ScanConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Log the stage-count summary line.
    pub stage_counts: bool,
    /// Write per-stage pair records to this CSV file.
    pub pairs_csv: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub blur: BlurConfig,
    pub similarity: SimilarityConfig,
    pub scan: ScanConfig,
    pub debug: DebugConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Rejects out-of-range settings before any scan work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let blur = &self.blur;
        blur.threshold.validate("blur.threshold")?;
        if let Some(tenengrad) = &blur.tenengrad {
            tenengrad.validate("blur.tenengrad")?;
        }
        if blur.gaussian_kernel > 31 {
            return Err(out_of_range("blur.gaussian_kernel", "must be at most 31"));
        }
        if !matches!(blur.laplacian_ksize, 1 | 3) {
            return Err(out_of_range("blur.laplacian_ksize", "must be 1 or 3"));
        }
        if blur.scales.is_empty() {
            return Err(out_of_range("blur.scales", "at least one scale is required"));
        }
        if let Some(scale) = blur
            .scales
            .iter()
            .find(|s| !(s.is_finite() && **s > 0.0 && **s <= 1.0))
        {
            return Err(out_of_range(
                "blur.scales",
                format!("scale {} outside (0, 1]", scale),
            ));
        }
        if blur.max_side == Some(0) {
            return Err(out_of_range("blur.max_side", "must be positive"));
        }

        let sim = &self.similarity;
        if sim.phash_radius > 64 {
            return Err(out_of_range("similarity.phash_radius", "must be at most 64"));
        }
        if sim.dhash_radius > 64 {
            return Err(out_of_range("similarity.dhash_radius", "must be at most 64"));
        }
        if sim.mnn_k < 1 {
            return Err(out_of_range("similarity.mnn_k", "must be at least 1"));
        }
        if sim.ssim_top_n < 1 {
            return Err(out_of_range("similarity.ssim_top_n", "must be at least 1"));
        }
        if !(sim.ssim_threshold.is_finite() && (-1.0..=1.0).contains(&sim.ssim_threshold)) {
            return Err(out_of_range("similarity.ssim_threshold", "outside [-1, 1]"));
        }
        if !(sim.hsv_min_correlation.is_finite()
            && (-1.0..=1.0).contains(&sim.hsv_min_correlation))
        {
            return Err(out_of_range("similarity.hsv_min_correlation", "outside [-1, 1]"));
        }
        let weights = sim.weights;
        if !(weights.phash.is_finite() && weights.dhash.is_finite())
            || weights.phash < 0.0
            || weights.dhash < 0.0
            || weights.phash + weights.dhash == 0.0
        {
            return Err(out_of_range(
                "similarity.weights",
                "must be non-negative and not both zero",
            ));
        }

        let scan = &self.scan;
        if scan.workers == Some(0) {
            return Err(out_of_range("scan.workers", "must be at least 1"));
        }
        if scan.extensions.is_empty() {
            return Err(out_of_range("scan.extensions", "at least one extension is required"));
        }
        for pattern in &scan.exclude_patterns {
            glob::Pattern::new(pattern)
                .map_err(|e| out_of_range("scan.exclude_patterns", format!("{}: {}", pattern, e)))?;
        }

        Ok(())
    }
}

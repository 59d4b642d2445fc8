use crate::config::{BlurConfig, SignalThreshold, ThresholdPolicy};
use crate::database::models::ImageFingerprint;
use serde::Serialize;
use std::path::PathBuf;

/// Below this standard deviation a batch is treated as flat.
const MIN_STD_DEV: f64 = 1e-9;

/// The threshold a signal was actually judged against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AppliedThreshold {
    pub value: f64,
    pub policy: ThresholdPolicy,
    /// The batch was too small or flat, so the fixed fallback was used.
    pub fell_back: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlurVerdict {
    pub path: PathBuf,
    pub score: f64,
    pub tenengrad: Option<f64>,
    pub is_blurry: bool,
    pub threshold: f64,
    /// Set when the secondary signal took part in this verdict.
    pub tenengrad_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlurReport {
    /// In input order.
    pub verdicts: Vec<BlurVerdict>,
    pub threshold: AppliedThreshold,
    pub tenengrad_threshold: Option<AppliedThreshold>,
}

impl BlurReport {
    pub fn blurry(&self) -> impl Iterator<Item = &BlurVerdict> {
        self.verdicts.iter().filter(|v| v.is_blurry)
    }

    pub fn blurry_count(&self) -> usize {
        self.blurry().count()
    }
}

/// Turns batch blur scores into per-image verdicts.
///
/// Lower scores are blurrier. With the secondary signal enabled an image
/// is blurry only when both signals fall below their thresholds.
pub struct BlurClassifier {
    threshold: SignalThreshold,
    tenengrad: Option<SignalThreshold>,
}

impl BlurClassifier {
    pub fn new(config: &BlurConfig) -> Self {
        Self {
            threshold: config.threshold,
            tenengrad: config.tenengrad,
        }
    }

    pub fn classify(&self, fingerprints: &[ImageFingerprint]) -> BlurReport {
        let scores: Vec<f64> = fingerprints.iter().map(|f| f.blur_score).collect();
        let threshold = derive_threshold(&self.threshold, &scores);

        let tenengrad_threshold = self.tenengrad.as_ref().map(|signal| {
            let scores: Vec<f64> = fingerprints.iter().filter_map(|f| f.tenengrad).collect();
            derive_threshold(signal, &scores)
        });

        for applied in std::iter::once(&threshold).chain(tenengrad_threshold.iter()) {
            if applied.fell_back {
                log::info!(
                    "Blur threshold {:?} fell back to fixed {} for a degenerate batch",
                    applied.policy,
                    applied.value
                );
            }
        }

        let verdicts = fingerprints
            .iter()
            .map(|fingerprint| {
                let primary = fingerprint.blur_score < threshold.value;
                // Rows without a Tenengrad score are judged on the primary alone.
                let secondary = tenengrad_threshold
                    .zip(fingerprint.tenengrad)
                    .map(|(applied, score)| (applied.value, score < applied.value));

                BlurVerdict {
                    path: fingerprint.path.clone(),
                    score: fingerprint.blur_score,
                    tenengrad: fingerprint.tenengrad,
                    is_blurry: primary && secondary.is_none_or(|(_, blurry)| blurry),
                    threshold: threshold.value,
                    tenengrad_threshold: secondary.map(|(value, _)| value),
                }
            })
            .collect();

        BlurReport {
            verdicts,
            threshold,
            tenengrad_threshold,
        }
    }
}

/// Resolves a threshold policy against a batch of scores. Non-finite
/// scores are ignored.
pub fn derive_threshold(signal: &SignalThreshold, scores: &[f64]) -> AppliedThreshold {
    let applied = |value, fell_back| AppliedThreshold {
        value,
        policy: signal.policy,
        fell_back,
    };

    if let ThresholdPolicy::Fixed(value) = signal.policy {
        return applied(value, false);
    }

    let finite: Vec<f64> = scores.iter().copied().filter(|s| s.is_finite()).collect();
    if finite.len() < 2 {
        return applied(signal.fallback, true);
    }

    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let std_dev = (finite.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();
    if std_dev < MIN_STD_DEV {
        return applied(signal.fallback, true);
    }

    match signal.policy {
        ThresholdPolicy::Percentile(p) => applied(percentile(&finite, p), false),
        ThresholdPolicy::ZScore(k) => applied(mean + k * std_dev, false),
        ThresholdPolicy::Fixed(value) => applied(value, false),
    }
}

/// Linear-interpolated percentile, `p` in 0..=100.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

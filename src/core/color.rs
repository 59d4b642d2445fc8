use crate::core::candidates::{CandidatePair, Stage};
use crate::core::features::load_image;
use image::DynamicImage;
use image::imageops::FilterType;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const HUE_BINS: usize = 50;
const SATURATION_BINS: usize = 60;
const HISTOGRAM_SIDE: u32 = 256;

/// 2-D hue/saturation histogram. Hue spans 0..180 and saturation 0..256.
#[derive(Debug, Clone, PartialEq)]
pub struct HsvHistogram {
    bins: Vec<f64>,
}

impl HsvHistogram {
    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = image
            .resize_exact(HISTOGRAM_SIDE, HISTOGRAM_SIDE, FilterType::Triangle)
            .to_rgb8();

        let mut bins = vec![0.0; HUE_BINS * SATURATION_BINS];
        for pixel in rgb.pixels() {
            let (hue, saturation) = hue_saturation(pixel.0);
            let h = ((hue * HUE_BINS as f64 / 180.0) as usize).min(HUE_BINS - 1);
            let s = ((saturation * SATURATION_BINS as f64 / 256.0) as usize)
                .min(SATURATION_BINS - 1);
            bins[h * SATURATION_BINS + s] += 1.0;
        }

        Self { bins }
    }

    /// Pearson correlation between the two histograms. Two flat histograms
    /// correlate perfectly.
    pub fn correlation(&self, other: &HsvHistogram) -> f64 {
        let n = self.bins.len() as f64;
        let mean_a = self.bins.iter().sum::<f64>() / n;
        let mean_b = other.bins.iter().sum::<f64>() / n;

        let (mut num, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
        for (a, b) in self.bins.iter().zip(&other.bins) {
            let (da, db) = (a - mean_a, b - mean_b);
            num += da * db;
            var_a += da * da;
            var_b += db * db;
        }

        let denom = var_a * var_b;
        if denom.abs() > f64::EPSILON {
            num / denom.sqrt()
        } else {
            1.0
        }
    }
}

/// Hue in degrees halved to 0..180, saturation scaled to 0..=255.
fn hue_saturation([r, g, b]: [u8; 3]) -> (f64, f64) {
    let (r, g, b) = (f64::from(r), f64::from(g), f64::from(b));
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { 255.0 * delta / max } else { 0.0 };
    if delta == 0.0 {
        return (0.0, saturation);
    }

    let mut hue = if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }

    (hue / 2.0, saturation)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HsvOutcome {
    pub survivors: Vec<CandidatePair>,
    pub evaluated: usize,
    pub unreadable: usize,
}

/// Drops structurally similar pairs whose colours disagree.
pub struct HsvCrossChecker {
    min_correlation: f64,
    cancellation_token: Option<Arc<AtomicBool>>,
}

impl HsvCrossChecker {
    pub fn new(min_correlation: f64) -> Self {
        Self {
            min_correlation,
            cancellation_token: None,
        }
    }

    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .is_some_and(|token| token.load(Ordering::Relaxed))
    }

    pub fn check(&self, pairs: &[CandidatePair]) -> HsvOutcome {
        let paths: BTreeSet<&Path> = pairs
            .iter()
            .flat_map(|pair| [pair.a.as_path(), pair.b.as_path()])
            .collect();
        let histograms: HashMap<&Path, Option<HsvHistogram>> = paths
            .into_par_iter()
            .map(|path| {
                if self.is_cancelled() {
                    return (path, None);
                }
                let histogram = match load_image(path) {
                    Ok(image) => Some(HsvHistogram::from_image(&image)),
                    Err(e) => {
                        log::warn!("HSV check skipped {}: {}", path.display(), e);
                        None
                    }
                };
                (path, histogram)
            })
            .collect();
        if self.is_cancelled() {
            log::info!("HSV cross-check cancelled");
            return HsvOutcome::default();
        }

        let mut outcome = HsvOutcome {
            evaluated: pairs.len(),
            ..HsvOutcome::default()
        };
        for pair in pairs {
            let a = histograms.get(pair.a.as_path()).and_then(Option::as_ref);
            let b = histograms.get(pair.b.as_path()).and_then(Option::as_ref);
            let (Some(a), Some(b)) = (a, b) else {
                outcome.unreadable += 1;
                continue;
            };

            let correlation = a.correlation(b);
            if correlation >= self.min_correlation {
                let mut survivor = pair.clone().advance(Stage::Hsv);
                survivor.hsv_correlation = Some(correlation);
                outcome.survivors.push(survivor);
            } else {
                log::debug!(
                    "HSV correlation {:.3} too low for {} / {}",
                    correlation,
                    pair.a.display(),
                    pair.b.display()
                );
            }
        }

        outcome
    }
}

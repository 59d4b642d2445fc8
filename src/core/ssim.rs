use crate::core::candidates::{CandidatePair, DistanceMetric, Stage};
use crate::core::features::load_image;
use image::imageops::{self, FilterType};
use image::GrayImage;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Side of the square both images are resampled to before comparison.
pub const SSIM_SIDE: u32 = 256;
const WINDOW: usize = 11;
const WINDOW_SIGMA: f64 = 1.5;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct SsimOutcome {
    /// Best combined hash distance first.
    pub survivors: Vec<CandidatePair>,
    pub evaluated: usize,
    /// Ranked beyond the top N and dropped unevaluated.
    pub skipped: usize,
    /// Dropped because one of the images would not decode.
    pub unreadable: usize,
}

/// Recomputes structural similarity for the best-ranked pairs only.
pub struct SsimRefiner {
    threshold: f64,
    top_n: usize,
    metric: DistanceMetric,
    cancellation_token: Option<Arc<AtomicBool>>,
}

impl SsimRefiner {
    pub fn new(threshold: f64, top_n: usize, metric: DistanceMetric) -> Self {
        Self {
            threshold,
            top_n,
            metric,
            cancellation_token: None,
        }
    }

    /// Once the token is set, no further images are decoded and no pair
    /// survives.
    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .is_some_and(|token| token.load(Ordering::Relaxed))
    }

    pub fn refine(&self, pairs: &[CandidatePair]) -> SsimOutcome {
        let mut ranked: Vec<&CandidatePair> = pairs.iter().collect();
        ranked.sort_by(|x, y| self.metric.compare(x, y));

        let skipped = ranked.len().saturating_sub(self.top_n);
        ranked.truncate(self.top_n);
        if skipped > 0 {
            log::info!(
                "SSIM evaluates the best {} pairs; {} lower-ranked pairs dropped",
                self.top_n,
                skipped
            );
        }

        let paths: BTreeSet<&Path> = ranked
            .iter()
            .flat_map(|pair| [pair.a.as_path(), pair.b.as_path()])
            .collect();
        let images: HashMap<&Path, Option<GrayImage>> = paths
            .into_par_iter()
            .map(|path| {
                if self.is_cancelled() {
                    return (path, None);
                }
                (path, load_normalized(path))
            })
            .collect();
        if self.is_cancelled() {
            log::info!("SSIM refinement cancelled");
            return SsimOutcome {
                skipped,
                ..SsimOutcome::default()
            };
        }

        let scores: Vec<Option<f64>> = ranked
            .par_iter()
            .map(|pair| {
                let a = images.get(pair.a.as_path())?.as_ref()?;
                let b = images.get(pair.b.as_path())?.as_ref()?;
                Some(ssim(a, b))
            })
            .collect();

        let mut outcome = SsimOutcome {
            evaluated: ranked.len(),
            skipped,
            ..SsimOutcome::default()
        };
        for (pair, score) in ranked.into_iter().zip(scores) {
            match score {
                Some(score) if score >= self.threshold => {
                    let mut survivor = pair.clone().advance(Stage::Ssim);
                    survivor.ssim = Some(score);
                    outcome.survivors.push(survivor);
                }
                Some(score) => {
                    log::debug!(
                        "SSIM {:.3} below threshold for {} / {}",
                        score,
                        pair.a.display(),
                        pair.b.display()
                    );
                }
                None => outcome.unreadable += 1,
            }
        }

        outcome
    }
}

fn load_normalized(path: &Path) -> Option<GrayImage> {
    match load_image(path) {
        Ok(image) => Some(imageops::resize(
            &image.to_luma8(),
            SSIM_SIDE,
            SSIM_SIDE,
            FilterType::Triangle,
        )),
        Err(e) => {
            log::warn!("SSIM skipped {}: {}", path.display(), e);
            None
        }
    }
}

fn gaussian_window() -> [f64; WINDOW] {
    let radius = (WINDOW / 2) as f64;
    let mut window = [0.0; WINDOW];
    for (i, w) in window.iter_mut().enumerate() {
        let x = i as f64 - radius;
        *w = (-(x * x) / (2.0 * WINDOW_SIGMA * WINDOW_SIGMA)).exp();
    }
    let sum: f64 = window.iter().sum();
    window.iter_mut().for_each(|w| *w /= sum);
    window
}

/// Separable "valid" convolution: the output shrinks by the window size.
fn filter_valid(plane: &[f64], width: usize, height: usize, window: &[f64]) -> Vec<f64> {
    let out_w = width + 1 - window.len();
    let out_h = height + 1 - window.len();

    let mut rows = vec![0.0; out_w * height];
    for y in 0..height {
        for x in 0..out_w {
            rows[y * out_w + x] = window
                .iter()
                .enumerate()
                .map(|(i, w)| w * plane[y * width + x + i])
                .sum();
        }
    }

    let mut out = vec![0.0; out_w * out_h];
    for y in 0..out_h {
        for x in 0..out_w {
            out[y * out_w + x] = window
                .iter()
                .enumerate()
                .map(|(i, w)| w * rows[(y + i) * out_w + x])
                .sum();
        }
    }
    out
}

/// Mean structural similarity of two equally sized 8-bit images, in
/// [-1, 1]. Images smaller than the 11x11 window are compared globally.
pub fn ssim(a: &GrayImage, b: &GrayImage) -> f64 {
    let (width, height) = (a.width() as usize, a.height() as usize);
    debug_assert_eq!(a.dimensions(), b.dimensions());

    let x: Vec<f64> = a.as_raw().iter().map(|&v| f64::from(v)).collect();
    let y: Vec<f64> = b.as_raw().iter().map(|&v| f64::from(v)).collect();
    let xx: Vec<f64> = x.iter().map(|v| v * v).collect();
    let yy: Vec<f64> = y.iter().map(|v| v * v).collect();
    let xy: Vec<f64> = x.iter().zip(&y).map(|(p, q)| p * q).collect();

    let (mu_x, mu_y, e_xx, e_yy, e_xy) = if width >= WINDOW && height >= WINDOW {
        let window = gaussian_window();
        (
            filter_valid(&x, width, height, &window),
            filter_valid(&y, width, height, &window),
            filter_valid(&xx, width, height, &window),
            filter_valid(&yy, width, height, &window),
            filter_valid(&xy, width, height, &window),
        )
    } else {
        let mean = |plane: &[f64]| vec![plane.iter().sum::<f64>() / plane.len().max(1) as f64];
        (mean(&x), mean(&y), mean(&xx), mean(&yy), mean(&xy))
    };

    let n = mu_x.len();
    if n == 0 {
        return 1.0;
    }

    let total: f64 = (0..n)
        .map(|i| {
            let (mx, my) = (mu_x[i], mu_y[i]);
            let var_x = e_xx[i] - mx * mx;
            let var_y = e_yy[i] - my * my;
            let cov = e_xy[i] - mx * my;
            ((2.0 * mx * my + C1) * (2.0 * cov + C2))
                / ((mx * mx + my * my + C1) * (var_x + var_y + C2))
        })
        .sum();

    total / n as f64
}

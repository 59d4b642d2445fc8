use crate::config::{BlurConfig, Reducer};
use crate::core::hash::{Hash64, HashService};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, ImageError, ImageReader, Luma};
use std::path::Path;
use thiserror::Error;

/// Single-channel image with intensities in 0.0..=1.0.
pub type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Intensities are kept in 0..1 so the resize filters don't clamp them;
/// variances are rescaled to the familiar 8-bit range.
const INTENSITY_SCALE: f64 = 255.0 * 255.0;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: ImageError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlurScores {
    /// Reduced multi-scale Laplacian variance. Lower is blurrier.
    pub multiscale: f64,
    /// Mean squared Sobel gradient magnitude, when enabled.
    pub tenengrad: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Features {
    pub blur: BlurScores,
    pub phash: Hash64,
    pub dhash: Hash64,
    pub width: u32,
    pub height: u32,
}

/// Computes blur scores and perceptual hashes for a decoded image.
///
/// Extraction is a pure function of the pixels and the blur settings it
/// was built with, so one extractor is shared across all workers.
pub struct FeatureExtractor {
    hash_service: HashService,
    reducer: Reducer,
    gaussian_kernel: u32,
    laplacian_ksize: u32,
    scales: Vec<f64>,
    max_side: Option<u32>,
    tenengrad: bool,
    profile: String,
}

impl FeatureExtractor {
    pub fn new(config: &BlurConfig) -> Self {
        let scales = config
            .scales
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let max_side = config
            .max_side
            .map(|m| m.to_string())
            .unwrap_or_else(|| "none".to_string());
        let profile = format!(
            "k{};l{};{};s{};m{}",
            config.gaussian_kernel,
            config.laplacian_ksize,
            config.reducer.as_str(),
            scales,
            max_side
        );

        Self {
            hash_service: HashService::new(),
            reducer: config.reducer,
            gaussian_kernel: config.gaussian_kernel,
            laplacian_ksize: config.laplacian_ksize,
            scales: config.scales.clone(),
            max_side: config.max_side,
            tenengrad: config.tenengrad.is_some(),
            profile,
        }
    }

    /// Identifies the blur parameters; cached scores from another profile
    /// are not comparable.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn computes_tenengrad(&self) -> bool {
        self.tenengrad
    }

    pub fn extract(&self, image: &DynamicImage) -> Features {
        Features {
            blur: self.blur_scores(image),
            phash: self.hash_service.phash(image),
            dhash: self.hash_service.dhash(image),
            width: image.width(),
            height: image.height(),
        }
    }

    pub fn extract_path(&self, path: &Path) -> Result<Features, ExtractError> {
        let image = load_image(path)?;
        Ok(self.extract(&image))
    }

    pub fn blur_scores(&self, image: &DynamicImage) -> BlurScores {
        let mut gray = image.to_luma32f();

        if let Some(max_side) = self.max_side {
            let longest = gray.width().max(gray.height());
            if longest > max_side {
                let factor = f64::from(max_side) / f64::from(longest);
                gray = scale_image(&gray, factor, FilterType::Triangle);
            }
        }

        if self.gaussian_kernel > 1 {
            let ksize = self.gaussian_kernel | 1;
            gray = gaussian_blur(&gray, ksize, opencv_sigma(ksize));
        }

        // Both signals see the pre-blurred image.
        let tenengrad = self.tenengrad.then(|| tenengrad(&gray));

        let per_scale: Vec<f64> = self
            .scales
            .iter()
            .filter_map(|&scale| {
                let scaled = if scale >= 1.0 {
                    gray.clone()
                } else {
                    scale_image(&gray, scale, FilterType::Triangle)
                };
                laplacian_variance(&scaled, self.laplacian_ksize)
            })
            .collect();

        BlurScores {
            multiscale: self.reducer.reduce(&per_scale),
            tenengrad,
        }
    }
}

pub fn load_image(path: &Path) -> Result<DynamicImage, ExtractError> {
    ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|source| ExtractError::Decode {
            path: path.to_string_lossy().to_string(),
            source,
        })
}

fn scale_image(gray: &GrayF32, factor: f64, filter: FilterType) -> GrayF32 {
    let width = ((f64::from(gray.width()) * factor).round() as u32).max(1);
    let height = ((f64::from(gray.height()) * factor).round() as u32).max(1);
    imageops::resize(gray, width, height, filter)
}

/// Sigma the usual way for a kernel size given without one.
fn opencv_sigma(ksize: u32) -> f32 {
    0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

fn pixel(img: &GrayF32, x: i64, y: i64) -> f32 {
    let x = x.clamp(0, i64::from(img.width()) - 1) as u32;
    let y = y.clamp(0, i64::from(img.height()) - 1) as u32;
    img.get_pixel(x, y)[0]
}

/// Separable Gaussian blur with replicated borders.
pub(crate) fn gaussian_blur(img: &GrayF32, ksize: u32, sigma: f32) -> GrayF32 {
    let radius = (ksize / 2) as i64;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);

    let (width, height) = img.dimensions();
    let horizontal = ImageBuffer::from_fn(width, height, |x, y| {
        let v: f32 = kernel
            .iter()
            .enumerate()
            .map(|(i, k)| k * pixel(img, i64::from(x) + i as i64 - radius, i64::from(y)))
            .sum();
        Luma([v])
    });
    ImageBuffer::from_fn(width, height, |x, y| {
        let v: f32 = kernel
            .iter()
            .enumerate()
            .map(|(i, k)| k * pixel(&horizontal, i64::from(x), i64::from(y) + i as i64 - radius))
            .sum();
        Luma([v])
    })
}

/// Variance of the Laplacian. `ksize` 1 is the 4-neighbour stencil; any
/// other value uses the 3x3 aperture built from second-order Sobel terms,
/// `[[2, 0, 2], [0, -8, 0], [2, 0, 2]]`. `None` when the image is too small
/// for a 3x3 stencil.
pub fn laplacian_variance(img: &GrayF32, ksize: u32) -> Option<f64> {
    let (width, height) = img.dimensions();
    if width < 3 || height < 3 {
        return None;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..i64::from(height) {
        for x in 0..i64::from(width) {
            let lap = f64::from(if ksize == 1 {
                pixel(img, x - 1, y) + pixel(img, x + 1, y) + pixel(img, x, y - 1)
                    + pixel(img, x, y + 1)
                    - 4.0 * pixel(img, x, y)
            } else {
                2.0 * (pixel(img, x - 1, y - 1)
                    + pixel(img, x + 1, y - 1)
                    + pixel(img, x - 1, y + 1)
                    + pixel(img, x + 1, y + 1))
                    - 8.0 * pixel(img, x, y)
            });
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let n = f64::from(width) * f64::from(height);
    let mean = sum / n;
    Some(((sum_sq / n) - mean * mean).max(0.0) * INTENSITY_SCALE)
}

/// Mean of `gx^2 + gy^2` under 3x3 Sobel kernels.
pub fn tenengrad(img: &GrayF32) -> f64 {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }

    let mut total = 0.0f64;
    for y in 0..i64::from(height) {
        for x in 0..i64::from(width) {
            let p = |dx: i64, dy: i64| f64::from(pixel(img, x + dx, y + dy));
            let gx = (p(1, -1) + 2.0 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2.0 * p(-1, 0) + p(-1, 1));
            let gy = (p(-1, 1) + 2.0 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2.0 * p(0, -1) + p(1, -1));
            total += gx * gx + gy * gy;
        }
    }

    total / (f64::from(width) * f64::from(height)) * INTENSITY_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::fs;
    use tempfile::TempDir;

    fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([value; 3])))
    }

    fn checkerboard(width: u32, height: u32, cell: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        }))
    }

    #[test]
    fn test_solid_image_has_zero_blur_score() {
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let scores = extractor.blur_scores(&solid(64, 64, 128));

        assert!(scores.multiscale.abs() < 1e-6);
        assert!(scores.tenengrad.unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_sharp_edges_score_high() {
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let scores = extractor.blur_scores(&checkerboard(128, 128, 16));

        assert!(scores.multiscale > 100.0, "{:?}", scores);
        assert!(scores.tenengrad.unwrap() > 100.0, "{:?}", scores);
    }

    #[test]
    fn test_pre_blur_lowers_score() {
        let image = checkerboard(96, 96, 4);
        let raw = FeatureExtractor::new(&BlurConfig {
            gaussian_kernel: 0,
            scales: vec![1.0],
            ..BlurConfig::default()
        });
        let blurred = FeatureExtractor::new(&BlurConfig {
            gaussian_kernel: 7,
            scales: vec![1.0],
            ..BlurConfig::default()
        });

        let (raw, blurred) = (raw.blur_scores(&image), blurred.blur_scores(&image));
        assert!(blurred.multiscale < raw.multiscale);
        assert!(blurred.tenengrad.unwrap() < raw.tenengrad.unwrap());
    }

    #[test]
    fn test_laplacian_apertures() {
        // A single bright pixel well inside a dark 5x5 image.
        let mut img = GrayF32::new(5, 5);
        img.put_pixel(2, 2, Luma([1.0]));

        // 4-neighbour: -4 once and 1 four times over 25 pixels.
        let cross = laplacian_variance(&img, 1).unwrap();
        assert!((cross - 20.0 / 25.0 * INTENSITY_SCALE).abs() < 1e-6);

        // 3x3 aperture: -8 once and 2 on the four diagonals.
        let aperture = laplacian_variance(&img, 3).unwrap();
        assert!((aperture - 80.0 / 25.0 * INTENSITY_SCALE).abs() < 1e-6);

        assert!(laplacian_variance(&GrayF32::new(2, 8), 3).is_none());
    }

    #[test]
    fn test_tenengrad_disabled() {
        let extractor = FeatureExtractor::new(&BlurConfig {
            tenengrad: None,
            ..BlurConfig::default()
        });
        assert!(!extractor.computes_tenengrad());
        assert!(extractor.blur_scores(&checkerboard(32, 32, 4)).tenengrad.is_none());
    }

    #[test]
    fn test_large_image_is_downscaled_but_keeps_dimensions() {
        let extractor = FeatureExtractor::new(&BlurConfig {
            max_side: Some(100),
            ..BlurConfig::default()
        });
        let features = extractor.extract(&checkerboard(400, 200, 20));

        assert_eq!((features.width, features.height), (400, 200));
        assert!(features.blur.multiscale > 0.0);
    }

    #[test]
    fn test_tiny_image_does_not_panic() {
        let extractor = FeatureExtractor::new(&BlurConfig::default());
        let features = extractor.extract(&solid(2, 1, 10));
        assert_eq!(features.blur.multiscale, 0.0);
    }

    #[test]
    fn test_profile_reflects_blur_settings() {
        let default = FeatureExtractor::new(&BlurConfig::default());
        assert_eq!(default.profile(), "k3;l3;median;s1,0.5,0.25;m2000");

        let other = FeatureExtractor::new(&BlurConfig {
            reducer: Reducer::Mean,
            max_side: None,
            ..BlurConfig::default()
        });
        assert_eq!(other.profile(), "k3;l3;mean;s1,0.5,0.25;mnone");

        let cross = FeatureExtractor::new(&BlurConfig {
            laplacian_ksize: 1,
            ..BlurConfig::default()
        });
        assert_ne!(cross.profile(), default.profile());
    }

    #[test]
    fn test_extract_path_reports_decode_failure() {
        let temp_dir = TempDir::new().unwrap();
        let bogus = temp_dir.path().join("broken.jpg");
        fs::write(&bogus, b"definitely not a jpeg").unwrap();

        let extractor = FeatureExtractor::new(&BlurConfig::default());
        assert!(matches!(
            extractor.extract_path(&bogus),
            Err(ExtractError::Decode { .. })
        ));
        assert!(matches!(
            extractor.extract_path(&temp_dir.path().join("missing.png")),
            Err(ExtractError::Io(_))
        ));
    }

    #[test]
    fn test_extract_path_matches_in_memory_extraction() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("board.png");
        let image = checkerboard(64, 48, 8);
        image.save(&path).unwrap();

        let extractor = FeatureExtractor::new(&BlurConfig::default());
        assert_eq!(extractor.extract_path(&path).unwrap(), extractor.extract(&image));
    }
}

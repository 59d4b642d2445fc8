use crate::core::candidates::{CandidatePair, Stage};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Pair counts after each similarity stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    /// Images carrying a pHash.
    pub phash: usize,
    /// Images carrying a dHash.
    pub dhash: usize,
    /// Pairs within the pHash radius, including those also within the
    /// dHash radius.
    pub p_only: usize,
    /// Pairs within the dHash radius, including those also within the
    /// pHash radius.
    pub d_only: usize,
    /// Pairs within both radii; `hybrid = p_only + d_only - both`.
    pub both: usize,
    pub hybrid: usize,
    pub post_mnn: usize,
    pub post_ssim: usize,
    pub post_hsv: usize,
}

impl StageCounts {
    /// No stage ever adds pairs.
    pub fn is_monotonic(&self) -> bool {
        self.post_mnn <= self.hybrid
            && self.post_ssim <= self.post_mnn
            && self.post_hsv <= self.post_ssim
    }
}

impl fmt::Display for StageCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "phash={} dhash={} p_only={} d_only={} hybrid={} postMNN={} postSSIM={} postHSV={}",
            self.phash,
            self.dhash,
            self.p_only,
            self.d_only,
            self.hybrid,
            self.post_mnn,
            self.post_ssim,
            self.post_hsv
        )
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| format!("{:.6}", v)).unwrap_or_default()
}

/// Writes one row per pair per stage it reached.
pub fn write_pairs_csv(
    path: &Path,
    stages: &[(Stage, &[CandidatePair])],
) -> Result<usize, ReportError> {
    let io_error = |source| ReportError::Io {
        path: path.to_string_lossy().to_string(),
        source,
    };

    let file = File::create(path).map_err(io_error)?;
    let mut out = BufWriter::new(file);
    writeln!(
        out,
        "stage,path_a,path_b,phash_distance,dhash_distance,ssim_score,hsv_correlation"
    )
    .map_err(io_error)?;

    let mut rows = 0;
    for (stage, pairs) in stages {
        for pair in pairs.iter() {
            writeln!(
                out,
                "{},{},{},{},{},{},{}",
                stage,
                csv_field(&pair.a.to_string_lossy()),
                csv_field(&pair.b.to_string_lossy()),
                pair.phash_distance,
                pair.dhash_distance,
                optional(pair.ssim),
                optional(pair.hsv_correlation)
            )
            .map_err(io_error)?;
            rows += 1;
        }
    }

    out.flush().map_err(io_error)?;
    Ok(rows)
}

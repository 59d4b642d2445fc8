use crate::core::features::Features;
use crate::core::hash::Hash64;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Malformed mutation signature: {0}")]
pub struct SignatureParseError(pub String);

/// How a file's "has it changed since last scan" signature is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureMode {
    /// Modification time plus byte size. Cheap, but a touched file rescans.
    #[default]
    Stat,
    /// BLAKE3 digest of the file bytes.
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationSignature {
    Stat { modified_ns: i64, size: u64 },
    Content { blake3: String },
}

impl fmt::Display for MutationSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stat { modified_ns, size } => write!(f, "stat:{}:{}", modified_ns, size),
            Self::Content { blake3 } => write!(f, "blake3:{}", blake3),
        }
    }
}

impl FromStr for MutationSignature {
    type Err = SignatureParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SignatureParseError(s.to_string());

        if let Some(rest) = s.strip_prefix("stat:") {
            let (modified, size) = rest.split_once(':').ok_or_else(malformed)?;
            return Ok(Self::Stat {
                modified_ns: modified.parse().map_err(|_| malformed())?,
                size: size.parse().map_err(|_| malformed())?,
            });
        }

        if let Some(digest) = s.strip_prefix("blake3:") {
            if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Ok(Self::Content {
                    blake3: digest.to_string(),
                });
            }
        }

        Err(malformed())
    }
}

/// Everything the pipeline needs to know about one image, as persisted in
/// the fingerprint cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFingerprint {
    pub path: PathBuf,
    pub signature: MutationSignature,
    /// Extraction parameters the blur score was computed under.
    pub profile: String,
    pub blur_score: f64,
    pub tenengrad: Option<f64>,
    pub phash: Hash64,
    pub dhash: Hash64,
    pub width: u32,
    pub height: u32,
}

impl ImageFingerprint {
    pub fn from_features(
        path: PathBuf,
        signature: MutationSignature,
        profile: &str,
        features: Features,
    ) -> Self {
        Self {
            path,
            signature,
            profile: profile.to_string(),
            blur_score: features.blur.multiscale,
            tenengrad: features.blur.tenengrad,
            phash: features.phash,
            dhash: features.dhash,
            width: features.width,
            height: features.height,
        }
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

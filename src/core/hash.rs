use crate::database::models::{MutationSignature, SignatureMode};
use image::DynamicImage;
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A 64-bit perceptual hash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Hash64(pub u64);

impl Hash64 {
    /// Packs the hasher's bytes big-endian. Hashes wider than 64 bits are
    /// truncated to their first eight bytes.
    pub fn from_image_hash(hash: &ImageHash) -> Self {
        let value = hash
            .as_bytes()
            .iter()
            .take(8)
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        Self(value)
    }

    /// Hamming distance.
    pub fn distance(self, other: Hash64) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

impl fmt::Display for Hash64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Perceptual hashing plus the file-level signatures used to detect edits.
pub struct HashService {
    phasher: Hasher,
    dhasher: Hasher,
}

impl HashService {
    pub fn new() -> Self {
        let phasher = HasherConfig::new()
            .hash_size(8, 8)
            .hash_alg(HashAlg::Median)
            .preproc_dct()
            .to_hasher();
        let dhasher = HasherConfig::new()
            .hash_size(8, 8)
            .hash_alg(HashAlg::Gradient)
            .to_hasher();

        Self { phasher, dhasher }
    }

    /// DCT-median hash over an 8x8 low-frequency block.
    pub fn phash(&self, image: &DynamicImage) -> Hash64 {
        Hash64::from_image_hash(&self.phasher.hash_image(image))
    }

    /// Row-gradient difference hash on a 9x8 grid.
    pub fn dhash(&self, image: &DynamicImage) -> Hash64 {
        Hash64::from_image_hash(&self.dhasher.hash_image(image))
    }

    /// BLAKE3 digest of the file bytes, hex encoded.
    pub fn compute_content_hash(&self, file_path: &Path) -> Result<String, HashError> {
        let file = File::open(file_path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = blake3::Hasher::new();
        let mut buffer = [0; 65536];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize().to_hex().to_string())
    }

    pub fn compute_signature(
        &self,
        file_path: &Path,
        mode: SignatureMode,
    ) -> Result<MutationSignature, HashError> {
        match mode {
            SignatureMode::Stat => {
                let metadata = fs::metadata(file_path)?;
                let modified_ns = match metadata.modified()?.duration_since(UNIX_EPOCH) {
                    Ok(since) => since.as_nanos() as i64,
                    Err(before) => -(before.duration().as_nanos() as i64),
                };
                Ok(MutationSignature::Stat {
                    modified_ns,
                    size: metadata.len(),
                })
            }
            SignatureMode::Content => Ok(MutationSignature::Content {
                blake3: self.compute_content_hash(file_path)?,
            }),
        }
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn gradient(width: u32, height: u32, flip: bool) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            let v = if flip { width - 1 - x } else { x };
            Rgb([(v * 255 / width) as u8, (y * 255 / height) as u8, 128])
        }))
    }

    #[test]
    fn test_hamming_distance_is_symmetric() {
        let samples = [0u64, 1, 0xFFFF, 0xDEAD_BEEF_0000_0001, u64::MAX];
        for a in samples {
            for b in samples {
                assert_eq!(Hash64(a).distance(Hash64(b)), Hash64(b).distance(Hash64(a)));
            }
            assert_eq!(Hash64(a).distance(Hash64(a)), 0);
        }
        assert_eq!(Hash64(0).distance(Hash64(u64::MAX)), 64);
    }

    #[test]
    fn test_from_image_hash_packs_big_endian() {
        let hash = ImageHash::from_bytes(&[0x01, 0, 0, 0, 0, 0, 0, 0xFF]).unwrap();
        assert_eq!(Hash64::from_image_hash(&hash), Hash64(0x0100_0000_0000_00FF));
        assert_eq!(Hash64(0xAB).to_string(), "00000000000000ab");
    }

    #[test]
    fn test_perceptual_hashes_are_deterministic() {
        let service = HashService::new();
        let image = gradient(120, 90, false);

        assert_eq!(service.phash(&image), service.phash(&image.clone()));
        assert_eq!(service.dhash(&image), service.dhash(&image.clone()));

        // Resizing keeps the hash close.
        let resized = image.resize_exact(240, 180, image::imageops::FilterType::Triangle);
        assert!(service.dhash(&image).distance(service.dhash(&resized)) <= 8);

        // A mirrored gradient reverses every row comparison.
        let mirrored = gradient(120, 90, true);
        assert!(service.dhash(&image).distance(service.dhash(&mirrored)) > 32);
    }

    #[test]
    fn test_identical_files_same_content_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file1 = temp_dir.path().join("file1.bin");
        let file2 = temp_dir.path().join("file2.bin");
        fs::write(&file1, b"Identical content").unwrap();
        fs::write(&file2, b"Identical content").unwrap();

        let service = HashService::new();
        let hash1 = service.compute_content_hash(&file1).unwrap();
        let hash2 = service.compute_content_hash(&file2).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert!(hash1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_tracks_content_changes() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("photo.bin");
        fs::write(&file, b"first").unwrap();

        let service = HashService::new();
        let stat_before = service.compute_signature(&file, SignatureMode::Stat).unwrap();
        let content_before = service
            .compute_signature(&file, SignatureMode::Content)
            .unwrap();

        fs::write(&file, b"second version").unwrap();

        let stat_after = service.compute_signature(&file, SignatureMode::Stat).unwrap();
        let content_after = service
            .compute_signature(&file, SignatureMode::Content)
            .unwrap();

        // Size changed, so the stat signature differs regardless of mtime granularity.
        assert_ne!(stat_before, stat_after);
        assert_ne!(content_before, content_after);
        assert!(matches!(content_after, MutationSignature::Content { .. }));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let service = HashService::new();
        let result = service.compute_signature(Path::new("/does/not/exist.jpg"), SignatureMode::Stat);
        assert!(matches!(result, Err(HashError::Io(_))));
    }
}

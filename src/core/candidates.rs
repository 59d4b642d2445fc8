use crate::config::{DistanceWeights, SimilarityConfig};
use crate::core::hash::Hash64;
use crate::database::models::ImageFingerprint;
use bk_tree::{BKTree, Metric};
use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

/// Furthest stage a candidate pair has survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Hybrid,
    Mnn,
    Ssim,
    Hsv,
    Final,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Hybrid => "hybrid",
            Stage::Mnn => "mnn",
            Stage::Ssim => "ssim",
            Stage::Hsv => "hsv",
            Stage::Final => "final",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which radius query found a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Phash,
    Dhash,
    Both,
}

impl MatchSource {
    fn merge(self, other: MatchSource) -> MatchSource {
        if self == other { self } else { MatchSource::Both }
    }
}

/// An unordered pair of images, stored with the smaller path first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidatePair {
    pub a: PathBuf,
    pub b: PathBuf,
    pub phash_distance: u32,
    pub dhash_distance: u32,
    pub via: MatchSource,
    pub stage: Stage,
    pub ssim: Option<f64>,
    pub hsv_correlation: Option<f64>,
}

impl CandidatePair {
    pub fn new(first: &ImageFingerprint, second: &ImageFingerprint, via: MatchSource) -> Self {
        let (a, b) = if first.path <= second.path {
            (first, second)
        } else {
            (second, first)
        };
        Self {
            a: a.path.clone(),
            b: b.path.clone(),
            phash_distance: a.phash.distance(b.phash),
            dhash_distance: a.dhash.distance(b.dhash),
            via,
            stage: Stage::Hybrid,
            ssim: None,
            hsv_correlation: None,
        }
    }

    /// Same pair relabelled with a later stage.
    pub fn advance(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn key(&self) -> (&PathBuf, &PathBuf) {
        (&self.a, &self.b)
    }
}

/// Radius-normalised, weighted blend of the two hash distances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceMetric {
    pub phash_radius: u32,
    pub dhash_radius: u32,
    pub weights: DistanceWeights,
}

impl DistanceMetric {
    pub fn from_config(config: &SimilarityConfig) -> Self {
        Self {
            phash_radius: config.phash_radius,
            dhash_radius: config.dhash_radius,
            weights: config.weights,
        }
    }

    pub fn combined(&self, pair: &CandidatePair) -> f64 {
        let p = f64::from(pair.phash_distance) / f64::from(self.phash_radius.max(1));
        let d = f64::from(pair.dhash_distance) / f64::from(self.dhash_radius.max(1));
        self.weights.phash * p + self.weights.dhash * d
    }

    /// Best match first; ties break on path order.
    pub fn compare(&self, x: &CandidatePair, y: &CandidatePair) -> Ordering {
        self.combined(x)
            .total_cmp(&self.combined(y))
            .then_with(|| x.key().cmp(&y.key()))
    }
}

struct HammingMetric;

impl Metric<u64> for HammingMetric {
    fn distance(&self, a: &u64, b: &u64) -> u32 {
        (a ^ b).count_ones()
    }

    fn threshold_distance(&self, a: &u64, b: &u64, threshold: u32) -> Option<u32> {
        let d = self.distance(a, b);
        if d <= threshold { Some(d) } else { None }
    }
}

/// BK-tree over the distinct hash values, with the images that share each
/// value kept on the side. Identical images collapse into one tree node.
pub struct HashIndex {
    tree: BKTree<u64, HammingMetric>,
    members: HashMap<u64, Vec<usize>>,
}

impl HashIndex {
    pub fn build(hashes: impl IntoIterator<Item = Hash64>) -> Self {
        let mut tree = BKTree::new(HammingMetric);
        let mut members: HashMap<u64, Vec<usize>> = HashMap::new();

        for (index, hash) in hashes.into_iter().enumerate() {
            let entry = members.entry(hash.0).or_default();
            if entry.is_empty() {
                tree.add(hash.0);
            }
            entry.push(index);
        }

        Self { tree, members }
    }

    /// Indices of every image whose hash is within `radius` of `hash`,
    /// including images with the same hash.
    pub fn within(&self, hash: Hash64, radius: u32) -> Vec<usize> {
        self.tree
            .find(&hash.0, radius)
            .flat_map(|(_, value)| self.members.get(value).into_iter().flatten().copied())
            .collect()
    }

    pub fn distinct_hashes(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CandidateSet {
    /// Sorted by (a, b).
    pub pairs: Vec<CandidatePair>,
    pub phash_images: usize,
    pub dhash_images: usize,
    /// Pairs within the pHash radius, whatever their dHash distance.
    pub phash_pairs: usize,
    /// Pairs within the dHash radius, whatever their pHash distance.
    pub dhash_pairs: usize,
    /// Pairs within both radii.
    pub both: usize,
}

impl CandidateSet {
    pub fn hybrid(&self) -> usize {
        self.pairs.len()
    }
}

/// Hybrid pHash/dHash radius search.
pub struct CandidateGenerator {
    phash_radius: u32,
    dhash_radius: u32,
}

impl CandidateGenerator {
    pub fn new(config: &SimilarityConfig) -> Self {
        Self {
            phash_radius: config.phash_radius,
            dhash_radius: config.dhash_radius,
        }
    }

    /// Every pair within the pHash radius or the dHash radius, each pair
    /// reported once.
    pub fn generate(&self, fingerprints: &[ImageFingerprint]) -> CandidateSet {
        let mut images: Vec<&ImageFingerprint> = fingerprints.iter().collect();
        images.sort_by(|x, y| x.path.cmp(&y.path));

        let phash_index = HashIndex::build(images.iter().map(|f| f.phash));
        let dhash_index = HashIndex::build(images.iter().map(|f| f.dhash));
        log::debug!(
            "Indexed {} distinct pHashes and {} distinct dHashes",
            phash_index.distinct_hashes(),
            dhash_index.distinct_hashes()
        );

        // Each image only claims partners that sort after it, so every
        // unordered pair is produced by exactly one query.
        let hits: Vec<(usize, usize, MatchSource)> = (0..images.len())
            .into_par_iter()
            .flat_map_iter(|i| {
                let p_hits = phash_index
                    .within(images[i].phash, self.phash_radius)
                    .into_iter()
                    .map(|j| (j, MatchSource::Phash));
                let d_hits = dhash_index
                    .within(images[i].dhash, self.dhash_radius)
                    .into_iter()
                    .map(|j| (j, MatchSource::Dhash));
                p_hits
                    .chain(d_hits)
                    .filter(move |(j, _)| *j > i)
                    .map(move |(j, source)| (i, j, source))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut merged: BTreeMap<(usize, usize), MatchSource> = BTreeMap::new();
        for (i, j, source) in hits {
            merged
                .entry((i, j))
                .and_modify(|existing| *existing = existing.merge(source))
                .or_insert(source);
        }

        let mut set = CandidateSet {
            phash_images: images.len(),
            dhash_images: images.len(),
            ..CandidateSet::default()
        };
        for ((i, j), via) in merged {
            match via {
                MatchSource::Phash => set.phash_pairs += 1,
                MatchSource::Dhash => set.dhash_pairs += 1,
                MatchSource::Both => {
                    set.phash_pairs += 1;
                    set.dhash_pairs += 1;
                    set.both += 1;
                }
            }
            set.pairs.push(CandidatePair::new(images[i], images[j], via));
        }

        set
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::models::MutationSignature;

    pub(crate) fn fingerprint(name: &str, phash: u64, dhash: u64) -> ImageFingerprint {
        ImageFingerprint {
            path: PathBuf::from(name),
            signature: MutationSignature::Stat {
                modified_ns: 0,
                size: 0,
            },
            profile: String::new(),
            blur_score: 100.0,
            tenengrad: None,
            phash: Hash64(phash),
            dhash: Hash64(dhash),
            width: 100,
            height: 100,
        }
    }

    fn generator(phash_radius: u32, dhash_radius: u32) -> CandidateGenerator {
        CandidateGenerator::new(&SimilarityConfig {
            phash_radius,
            dhash_radius,
            ..SimilarityConfig::default()
        })
    }

    /// Reference all-pairs search.
    fn brute_force(
        fingerprints: &[ImageFingerprint],
        rp: u32,
        rd: u32,
    ) -> Vec<(PathBuf, PathBuf)> {
        let mut pairs = Vec::new();
        for (i, x) in fingerprints.iter().enumerate() {
            for y in &fingerprints[i + 1..] {
                if x.phash.distance(y.phash) <= rp || x.dhash.distance(y.dhash) <= rd {
                    let (a, b) = if x.path < y.path { (x, y) } else { (y, x) };
                    pairs.push((a.path.clone(), b.path.clone()));
                }
            }
        }
        pairs.sort();
        pairs
    }

    #[test]
    fn test_index_finds_identical_hashes() {
        let index = HashIndex::build([Hash64(7), Hash64(7), Hash64(8), Hash64(u64::MAX)]);
        let mut hits = index.within(Hash64(7), 0);
        hits.sort();
        assert_eq!(hits, vec![0, 1]);
        assert_eq!(index.distinct_hashes(), 3);
    }

    #[test]
    fn test_pair_is_canonical() {
        let x = fingerprint("b.jpg", 0b1010, 0);
        let y = fingerprint("a.jpg", 0b0110, 1);
        let pair = CandidatePair::new(&x, &y, MatchSource::Both);
        assert_eq!(pair, CandidatePair::new(&y, &x, MatchSource::Both));
        assert_eq!(pair.a, PathBuf::from("a.jpg"));
        assert_eq!(pair.phash_distance, 2);
        assert_eq!(pair.dhash_distance, 1);
    }

    #[test]
    fn test_hybrid_union_and_breakdown() {
        let fingerprints = vec![
            // a-b close on both hashes
            fingerprint("a", 0x0, 0x0),
            fingerprint("b", 0x1, 0x3),
            // c close to a on pHash only
            fingerprint("c", 0x7, 0xFFFF_0000),
            // d close to a on dHash only
            fingerprint("d", 0xFFFF_FFFF, 0xF),
            // e far from everything
            fingerprint("e", u64::MAX, u64::MAX << 8),
        ];
        let set = generator(3, 4).generate(&fingerprints);

        let keys: Vec<_> = set
            .pairs
            .iter()
            .map(|p| (p.a.to_string_lossy().to_string(), p.b.to_string_lossy().to_string(), p.via))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".into(), "b".into(), MatchSource::Both),
                ("a".into(), "c".into(), MatchSource::Phash),
                ("a".into(), "d".into(), MatchSource::Dhash),
                ("b".into(), "c".into(), MatchSource::Phash),
                ("b".into(), "d".into(), MatchSource::Dhash),
            ]
        );
        // a-b is counted under each hash and once in the union.
        assert_eq!((set.phash_pairs, set.dhash_pairs, set.both), (3, 3, 1));
        assert_eq!(set.hybrid(), set.phash_pairs + set.dhash_pairs - set.both);
        assert_eq!(set.phash_images, 5);
    }

    #[test]
    fn test_never_pairs_image_with_itself() {
        let fingerprints = vec![fingerprint("solo", 42, 42)];
        assert!(generator(64, 64).generate(&fingerprints).pairs.is_empty());
    }

    #[test]
    fn test_matches_brute_force() {
        // Deterministic pseudo-random hashes clustered around a few seeds.
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        let seeds: Vec<u64> = (0..4).map(|_| next()).collect();
        let fingerprints: Vec<_> = (0..120)
            .map(|i| {
                let seed = seeds[i % seeds.len()];
                let p = seed ^ (next() & next() & next() & next());
                let d = seed.rotate_left(7) ^ (next() & next() & next());
                fingerprint(&format!("img{:03}", (i * 37) % 120), p, d)
            })
            .collect();

        for (rp, rd) in [(0, 0), (4, 6), (8, 12), (16, 3)] {
            let set = generator(rp, rd).generate(&fingerprints);
            let got: Vec<_> = set.pairs.iter().map(|p| (p.a.clone(), p.b.clone())).collect();
            assert_eq!(got, brute_force(&fingerprints, rp, rd), "radii {rp}/{rd}");
        }
    }

    #[test]
    fn test_combined_distance() {
        let metric = DistanceMetric::from_config(&SimilarityConfig::default());
        let mut pair = CandidatePair::new(
            &fingerprint("a", 0, 0),
            &fingerprint("b", 0xFF, 0xFFF),
            MatchSource::Both,
        );
        // 0.7 * 8/8 + 0.3 * 12/12
        assert!((metric.combined(&pair) - 1.0).abs() < 1e-12);

        pair.phash_distance = 0;
        pair.dhash_distance = 0;
        assert_eq!(metric.combined(&pair), 0.0);
    }
}

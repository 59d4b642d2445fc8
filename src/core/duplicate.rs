use crate::config::KeepPolicy;
use crate::core::candidates::CandidatePair;
use crate::database::models::ImageFingerprint;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// A connected cluster of near-duplicates with one image nominated to keep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub id: usize,
    pub keep: PathBuf,
    /// Everything else in the cluster, by path.
    pub candidates: Vec<PathBuf>,
}

impl DuplicateGroup {
    pub fn size(&self) -> usize {
        self.candidates.len() + 1
    }

    pub fn members(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.keep).chain(self.candidates.iter())
    }
}

/// A final pair labelled with which side to keep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledPair {
    pub pair: CandidatePair,
    pub keep: PathBuf,
    pub candidate: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Assembly {
    pub pairs: Vec<LabeledPair>,
    pub groups: Vec<DuplicateGroup>,
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Labels final pairs and clusters them, nominating a keeper per cluster.
pub struct PairAssembler {
    policy: KeepPolicy,
}

impl PairAssembler {
    pub fn new(policy: KeepPolicy) -> Self {
        Self { policy }
    }

    /// `Less` when `x` is the better image to keep. Every policy falls back
    /// to the smaller path, so the order is total.
    fn prefer(
        &self,
        by_path: &HashMap<&Path, &ImageFingerprint>,
        x: &Path,
        y: &Path,
    ) -> Ordering {
        let by_policy = match (self.policy, by_path.get(x), by_path.get(y)) {
            (KeepPolicy::Sharpest, Some(fx), Some(fy)) => fy.blur_score.total_cmp(&fx.blur_score),
            (KeepPolicy::HighestResolution, Some(fx), Some(fy)) => {
                fy.pixel_count().cmp(&fx.pixel_count())
            }
            _ => Ordering::Equal,
        };
        by_policy.then_with(|| x.cmp(y))
    }

    pub fn assemble(
        &self,
        pairs: &[CandidatePair],
        fingerprints: &[ImageFingerprint],
    ) -> Assembly {
        let by_path: HashMap<&Path, &ImageFingerprint> = fingerprints
            .iter()
            .map(|f| (f.path.as_path(), f))
            .collect();
        let labeled = pairs
            .iter()
            .map(|pair| {
                let (keep, candidate) =
                    if self.prefer(&by_path, &pair.a, &pair.b) == Ordering::Greater {
                        (&pair.b, &pair.a)
                    } else {
                        (&pair.a, &pair.b)
                    };
                LabeledPair {
                    pair: pair.clone(),
                    keep: keep.clone(),
                    candidate: candidate.clone(),
                }
            })
            .collect();

        // Stable node ids in path order.
        let nodes: BTreeMap<&Path, usize> = {
            let mut paths: Vec<&Path> = pairs
                .iter()
                .flat_map(|pair| [pair.a.as_path(), pair.b.as_path()])
                .collect();
            paths.sort();
            paths.dedup();
            paths.into_iter().enumerate().map(|(i, p)| (p, i)).collect()
        };

        let mut union_find = UnionFind::new(nodes.len());
        for pair in pairs {
            union_find.union(nodes[pair.a.as_path()], nodes[pair.b.as_path()]);
        }

        let mut clusters: BTreeMap<usize, Vec<&Path>> = BTreeMap::new();
        for (&path, &index) in &nodes {
            clusters.entry(union_find.find(index)).or_default().push(path);
        }

        let mut groups: Vec<DuplicateGroup> = clusters
            .into_values()
            .map(|mut members| {
                members.sort_by(|x, y| self.prefer(&by_path, x, y));
                let keep = members[0].to_path_buf();
                let mut candidates: Vec<PathBuf> =
                    members[1..].iter().map(|p| p.to_path_buf()).collect();
                candidates.sort();
                DuplicateGroup {
                    id: 0,
                    keep,
                    candidates,
                }
            })
            .collect();

        groups.sort_by(|x, y| x.keep.cmp(&y.keep));
        for (i, group) in groups.iter_mut().enumerate() {
            group.id = i + 1;
        }

        Assembly {
            pairs: labeled,
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::candidates::{MatchSource, Stage};
    use crate::core::hash::Hash64;
    use crate::database::models::MutationSignature;

    fn fingerprint(name: &str, blur: f64, width: u32) -> ImageFingerprint {
        ImageFingerprint {
            path: PathBuf::from(name),
            signature: MutationSignature::Stat {
                modified_ns: 0,
                size: 0,
            },
            profile: String::new(),
            blur_score: blur,
            tenengrad: None,
            phash: Hash64(0),
            dhash: Hash64(0),
            width,
            height: 100,
        }
    }

    fn pair(a: &str, b: &str) -> CandidatePair {
        CandidatePair {
            a: PathBuf::from(a),
            b: PathBuf::from(b),
            phash_distance: 0,
            dhash_distance: 0,
            via: MatchSource::Both,
            stage: Stage::Final,
            ssim: Some(1.0),
            hsv_correlation: Some(1.0),
        }
    }

    fn library() -> Vec<ImageFingerprint> {
        vec![
            fingerprint("a", 10.0, 300),
            fingerprint("b", 90.0, 100),
            fingerprint("c", 50.0, 200),
            fingerprint("x", 5.0, 100),
            fingerprint("y", 5.0, 100),
        ]
    }

    #[test]
    fn test_transitive_clusters() {
        let pairs = vec![pair("a", "b"), pair("b", "c"), pair("x", "y")];
        let assembly = PairAssembler::new(KeepPolicy::Sharpest).assemble(&pairs, &library());

        assert_eq!(assembly.groups.len(), 2);
        let first = &assembly.groups[0];
        assert_eq!(first.keep, PathBuf::from("b"));
        assert_eq!(first.candidates, vec![PathBuf::from("a"), PathBuf::from("c")]);
        assert_eq!(first.size(), 3);

        // Equal blur scores: the smaller path wins.
        let second = &assembly.groups[1];
        assert_eq!(second.keep, PathBuf::from("x"));
        assert_eq!(second.candidates, vec![PathBuf::from("y")]);
        assert_eq!(
            assembly.groups.iter().map(|g| g.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_pair_labels_follow_policy() {
        let pairs = vec![pair("a", "b")];

        let sharpest = PairAssembler::new(KeepPolicy::Sharpest).assemble(&pairs, &library());
        assert_eq!(sharpest.pairs[0].keep, PathBuf::from("b"));
        assert_eq!(sharpest.pairs[0].candidate, PathBuf::from("a"));

        let resolution =
            PairAssembler::new(KeepPolicy::HighestResolution).assemble(&pairs, &library());
        assert_eq!(resolution.pairs[0].keep, PathBuf::from("a"));

        let first = PairAssembler::new(KeepPolicy::FirstPath).assemble(&pairs, &library());
        assert_eq!(first.pairs[0].keep, PathBuf::from("a"));
    }

    #[test]
    fn test_group_keeper_is_best_in_cluster() {
        let pairs = vec![pair("a", "c"), pair("b", "c")];
        let assembly =
            PairAssembler::new(KeepPolicy::HighestResolution).assemble(&pairs, &library());
        assert_eq!(assembly.groups[0].keep, PathBuf::from("a"));
        let members: Vec<_> = assembly.groups[0].members().cloned().collect();
        assert_eq!(
            members,
            vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]
        );
    }

    #[test]
    fn test_no_pairs_no_groups() {
        let assembly = PairAssembler::new(KeepPolicy::Sharpest).assemble(&[], &library());
        assert_eq!(assembly, Assembly::default());
    }

    #[test]
    fn test_deterministic_across_input_order() {
        let pairs = vec![pair("x", "y"), pair("b", "c"), pair("a", "b")];
        let mut reversed = pairs.clone();
        reversed.reverse();

        let assembler = PairAssembler::new(KeepPolicy::Sharpest);
        assert_eq!(
            assembler.assemble(&pairs, &library()).groups,
            assembler.assemble(&reversed, &library()).groups
        );
    }
}

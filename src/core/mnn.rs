use crate::core::candidates::{CandidatePair, DistanceMetric, Stage};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Mutual nearest-neighbour filter over the hybrid candidate graph.
pub struct MnnFilter {
    k: usize,
    metric: DistanceMetric,
}

impl MnnFilter {
    pub fn new(k: usize, metric: DistanceMetric) -> Self {
        Self { k, metric }
    }

    /// Each image's candidates ranked best first under the combined
    /// distance, ties broken by the partner's path.
    pub fn rankings<'a>(&self, pairs: &'a [CandidatePair]) -> HashMap<&'a Path, Vec<&'a Path>> {
        let mut neighbours: HashMap<&Path, Vec<(f64, &Path)>> = HashMap::new();
        for pair in pairs {
            let distance = self.metric.combined(pair);
            neighbours
                .entry(pair.a.as_path())
                .or_default()
                .push((distance, pair.b.as_path()));
            neighbours
                .entry(pair.b.as_path())
                .or_default()
                .push((distance, pair.a.as_path()));
        }

        neighbours
            .into_iter()
            .map(|(image, mut list)| {
                list.sort_by(|x, y| x.0.total_cmp(&y.0).then_with(|| x.1.cmp(y.1)));
                (image, list.into_iter().map(|(_, other)| other).collect())
            })
            .collect()
    }

    /// Keeps a pair only when each image is in the other's top K. All
    /// top-K lists are built before any pair is dropped.
    pub fn filter(&self, pairs: &[CandidatePair]) -> Vec<CandidatePair> {
        let top_k: HashMap<&Path, HashSet<&Path>> = self
            .rankings(pairs)
            .into_iter()
            .map(|(image, ranked)| (image, ranked.into_iter().take(self.k).collect()))
            .collect();

        let in_top_k = |image: &Path, other: &Path| {
            top_k
                .get(image)
                .is_some_and(|neighbours| neighbours.contains(other))
        };

        pairs
            .iter()
            .filter(|pair| in_top_k(&pair.a, &pair.b) && in_top_k(&pair.b, &pair.a))
            .map(|pair| pair.clone().advance(Stage::Mnn))
            .collect()
    }
}

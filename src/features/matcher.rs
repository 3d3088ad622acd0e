//! Brute-force Hamming k-NN matcher for binary descriptors
//!
//! Descriptors are 256-bit strings, so the matcher compares raw
//! Hamming distances; with a few thousand train rows a parallel
//! brute-force scan is faster than any tree for this bit width.

use rayon::prelude::*;

use crate::features::base::{hamming, Descriptors, Match};

/// k-nearest-neighbour Hamming matcher
pub struct HammingMatcher {
    train: Descriptors,
    k: usize,
}

impl HammingMatcher {
    /// Create a matcher that returns the `k` best candidates per query
    pub fn new(k: usize) -> Self {
        Self {
            train: Descriptors::new(),
            k,
        }
    }

    /// Replace the train descriptor set
    pub fn set_train(&mut self, train: Descriptors) {
        self.train = train;
    }

    pub fn train_size(&self) -> usize {
        self.train.len()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// k-NN match for a single query row, best first
    pub fn knn_match(&self, query: &[u8], query_idx: u32) -> Vec<Match> {
        let n = self.train.len();
        if n == 0 {
            return Vec::new();
        }
        let mut best: Vec<(u32, usize)> = Vec::with_capacity(self.k + 1);
        for t in 0..n {
            let d = hamming(query, self.train.row(t));
            let pos = best.partition_point(|&(bd, _)| bd <= d);
            if pos < self.k {
                best.insert(pos, (d, t));
                best.truncate(self.k);
            }
        }
        best.into_iter()
            .map(|(d, t)| Match {
                query_idx,
                train_idx: t as u32,
                distance: d as f32,
            })
            .collect()
    }

    /// k-NN match for every row of `queries`
    pub fn knn_match_batch(&self, queries: &Descriptors) -> Vec<Vec<Match>> {
        (0..queries.len())
            .into_par_iter()
            .map(|q| self.knn_match(queries.row(q), q as u32))
            .collect()
    }

    /// Batch matching with Lowe's ratio test: a query survives only if
    /// its best distance is below `ratio` times its second best.
    pub fn match_batch_with_ratio(&self, queries: &Descriptors, ratio: f32) -> Vec<Match> {
        self.knn_match_batch(queries)
            .into_iter()
            .filter_map(|candidates| match candidates.as_slice() {
                [first, second, ..] if first.distance < ratio * second.distance => Some(*first),
                [only] => Some(*only),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::base::DESCRIPTOR_SIZE;

    fn desc_with_byte(b: u8) -> [u8; DESCRIPTOR_SIZE] {
        [b; DESCRIPTOR_SIZE]
    }

    fn build_matcher(rows: &[[u8; DESCRIPTOR_SIZE]], k: usize) -> HammingMatcher {
        let mut m = HammingMatcher::new(k);
        m.set_train(Descriptors::from_rows(rows));
        m
    }

    #[test]
    fn test_knn_finds_self() {
        let rows = [desc_with_byte(0x00), desc_with_byte(0xFF), desc_with_byte(0x0F)];
        let matcher = build_matcher(&rows, 2);
        let matches = matcher.knn_match(&rows[1], 0);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].train_idx, 1);
        assert_eq!(matches[0].distance, 0.0);
        // 0x0F is 4 bits from 0xFF per byte, 0x00 is 8
        assert_eq!(matches[1].train_idx, 2);
    }

    #[test]
    fn test_ratio_test_rejects_ambiguous() {
        // two identical train rows: best == second best, ratio fails
        let rows = [desc_with_byte(0xAA), desc_with_byte(0xAA), desc_with_byte(0x00)];
        let matcher = build_matcher(&rows, 2);
        let queries = Descriptors::from_rows(&[desc_with_byte(0xAA)]);
        let kept = matcher.match_batch_with_ratio(&queries, 0.85);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_ratio_test_keeps_distinct() {
        let rows = [desc_with_byte(0xAA), desc_with_byte(0x55)];
        let matcher = build_matcher(&rows, 2);
        let queries = Descriptors::from_rows(&[desc_with_byte(0xAA)]);
        let kept = matcher.match_batch_with_ratio(&queries, 0.85);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].train_idx, 0);
    }

    #[test]
    fn test_empty_train() {
        let matcher = HammingMatcher::new(2);
        assert!(matcher.knn_match(&desc_with_byte(0), 0).is_empty());
    }
}

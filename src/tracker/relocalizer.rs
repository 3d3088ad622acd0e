//! Sparse relocalization against the key-map
//!
//! Runs when dense tracking is lost: 2-NN Hamming matching of the
//! current frame's descriptors against the key store, an optional
//! geometric-consistency pruning over the tentative matches, and an
//! absolute-orientation RANSAC for the recovered pose. A lighter
//! frame-to-frame variant with a motion sanity gate serves as a
//! sparse initial pose estimator.

use glam::Vec3;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::frame::FrameFeatures;
use crate::core::SE3;
use crate::features::{HammingMatcher, Match};
use crate::fusion::key_map::KeyMap;
use crate::tracker::solver::solve_absolute_orientation;

/// Relocalizer tunables
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RelocConfig {
    /// Lowe ratio threshold
    pub ratio: f32,
    /// Minimum tentative matches before attempting a solve
    pub min_matches: usize,
    /// Enable the pairwise-consistency graph pruning
    pub graph_matching: bool,
    /// RANSAC iterations against the key-map
    pub ransac_iterations: usize,
    /// RANSAC iterations in the frame-to-frame variant
    pub frame_ransac_iterations: usize,
    /// Pairwise distance agreement tolerance in metres
    pub consistency_tolerance: f32,
    /// Sanity gate: maximum Euler-angle sine magnitude
    pub rot_threshold: f32,
    /// Sanity gate: maximum translation component in metres
    pub trans_threshold: f32,
}

impl Default for RelocConfig {
    fn default() -> Self {
        Self {
            ratio: 0.85,
            min_matches: 50,
            graph_matching: true,
            ransac_iterations: 200,
            frame_ransac_iterations: 100,
            consistency_tolerance: 0.03,
            rot_threshold: 0.2,
            trans_threshold: 0.5,
        }
    }
}

/// Descriptor-based pose recovery
#[derive(Debug, Clone, Default)]
pub struct Relocalizer {
    config: RelocConfig,
}

/// A tentative 3D-3D correspondence surviving the descriptor match
#[derive(Debug, Clone, Copy)]
struct Candidate {
    /// Keypoint index in the query frame
    query_idx: u32,
    /// Point in the query camera frame
    p: Vec3,
    /// Matched map point in world space
    q: Vec3,
}

impl Relocalizer {
    pub fn new(config: RelocConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelocConfig {
        &self.config
    }

    /// Attempt to recover the camera pose of a lost frame from the
    /// key-map. Returns the camera-to-world pose on success and fills
    /// the frame's outlier mask.
    pub fn relocalize(&self, features: &mut FrameFeatures, key_map: &KeyMap) -> Option<SE3> {
        let (map_points, _, map_descriptors, _) = key_map.collect();
        if map_points.is_empty() || features.descriptors.is_empty() {
            return None;
        }

        let mut matcher = HammingMatcher::new(2);
        matcher.set_train(map_descriptors);
        let tentative = self.ratio_filter(matcher.knn_match_batch(&features.descriptors));
        if tentative.len() < self.config.min_matches {
            debug!(
                "relocalization under-matched: {} < {}",
                tentative.len(),
                self.config.min_matches
            );
            return None;
        }

        let candidates = self.make_candidates(&tentative, features, &map_points);
        let selected = if self.config.graph_matching {
            self.consistent_subset(&candidates)
        } else {
            (0..candidates.len()).collect()
        };

        let src: Vec<Vec3> = selected.iter().map(|&i| candidates[i].p).collect();
        let dst: Vec<Vec3> = selected.iter().map(|&i| candidates[i].q).collect();

        let result = solve_absolute_orientation(
            &src,
            &dst,
            &mut features.outliers,
            self.config.ransac_iterations,
        );
        if !result.ok {
            debug!("relocalization solve failed with {} inliers", result.inliers);
            return None;
        }
        Some(result.pose)
    }

    /// Frame-to-frame sparse pose estimation with a motion sanity
    /// gate. Returns the transform taking points of `next` into the
    /// camera frame of `last`.
    pub fn track_frame(&self, next: &mut FrameFeatures, last: &FrameFeatures) -> Option<SE3> {
        if next.descriptors.is_empty() || last.descriptors.is_empty() {
            return None;
        }

        let mut matcher = HammingMatcher::new(2);
        matcher.set_train(last.descriptors.clone());
        let matches = matcher.match_batch_with_ratio(&next.descriptors, self.config.ratio);

        let mut src = Vec::new();
        let mut dst = Vec::new();
        for m in &matches {
            let (Some(p), Some(q)) = (
                next.points.get(m.query_idx as usize).copied().flatten(),
                last.points.get(m.train_idx as usize).copied().flatten(),
            ) else {
                continue;
            };
            src.push(p);
            dst.push(q);
        }
        if src.len() < 3 {
            return None;
        }

        let result = solve_absolute_orientation(
            &src,
            &dst,
            &mut next.outliers,
            self.config.frame_ransac_iterations,
        );
        if !result.ok {
            // a weak consensus still passes if the motion is small
            let sines = result.pose.euler_sines().abs();
            let t = result.pose.translation().abs();
            if sines.max_element() > self.config.rot_threshold
                || t.max_element() > self.config.trans_threshold
            {
                debug!("sparse pose estimation rejected by sanity gate");
                return None;
            }
        }
        Some(result.pose)
    }

    /// Lowe ratio filter over 2-NN candidates. With graph matching
    /// enabled, an ambiguous query contributes both neighbours and
    /// the consistency pruning decides between them.
    fn ratio_filter(&self, knn: Vec<Vec<Match>>) -> Vec<Match> {
        let mut kept = Vec::new();
        for candidates in knn {
            match candidates.as_slice() {
                [first, second, ..] => {
                    if first.distance < self.config.ratio * second.distance {
                        kept.push(*first);
                    } else if self.config.graph_matching {
                        kept.push(*first);
                        kept.push(*second);
                    }
                }
                [only] => kept.push(*only),
                _ => {}
            }
        }
        kept
    }

    fn make_candidates(
        &self,
        matches: &[Match],
        features: &FrameFeatures,
        map_points: &[Vec3],
    ) -> Vec<Candidate> {
        matches
            .iter()
            .filter_map(|m| {
                let p = features.points.get(m.query_idx as usize).copied().flatten()?;
                Some(Candidate {
                    query_idx: m.query_idx,
                    p,
                    q: map_points[m.train_idx as usize],
                })
            })
            .collect()
    }

    /// Greedy extraction of a maximal pairwise-consistent subset.
    ///
    /// The adjacency matrix scores each pair of matches by agreement
    /// of their source and target pairwise distances; the seed is the
    /// row with the highest total score and compatible matches join in
    /// score order. The returned indices are de-duplicated per query
    /// keypoint: an ambiguous query can enter the candidate list with
    /// both neighbours, only the first survivor counts.
    fn consistent_subset(&self, candidates: &[Candidate]) -> Vec<usize> {
        let m = candidates.len();
        if m < 3 {
            return (0..m).collect();
        }
        let tol = self.config.consistency_tolerance;

        let mut adjacency = vec![0.0f32; m * m];
        for i in 0..m {
            for j in (i + 1)..m {
                let dp = candidates[i].p.distance(candidates[j].p);
                let dq = candidates[i].q.distance(candidates[j].q);
                let gap = (dp - dq).abs();
                if gap < tol {
                    let score = 1.0 - gap / tol;
                    adjacency[i * m + j] = score;
                    adjacency[j * m + i] = score;
                }
            }
        }

        let row_sum = |i: usize| -> f32 { adjacency[i * m..(i + 1) * m].iter().sum() };
        let mut order: Vec<usize> = (0..m).collect();
        order.sort_by(|&a, &b| {
            row_sum(b)
                .partial_cmp(&row_sum(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let seed = order[0];
        let mut selected = vec![seed];
        for &j in &order[1..] {
            if selected.iter().all(|&s| adjacency[s * m + j] > 0.0) {
                selected.push(j);
            }
        }

        // de-duplicate by query keypoint
        let mut seen = std::collections::HashSet::new();
        selected.retain(|&i| seen.insert(candidates[i].query_idx));
        selected
    }
}

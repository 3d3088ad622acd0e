//! Geometric solvers consumed by the trackers
//!
//! The 6x6 normal-equation solve for Gauss-Newton ICP and the
//! closed-form absolute orientation (Horn's method via 3x3 SVD) inside
//! a RANSAC loop. Poses cross the module boundary as glam-backed
//! [`SE3`]; nalgebra is used for the decompositions.

use glam::Vec3;
use nalgebra::{Matrix3, Matrix6, Vector6};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::core::SE3;

/// RANSAC inlier distance in metres
const INLIER_THRESHOLD: f32 = 0.05;
/// Fixed seed keeps the estimator deterministic per input
const RANSAC_SEED: u64 = 0x5EED_CAFE;

/// Solve the damped normal equations `(JtJ + λI) δ = Jtr`.
///
/// The damping keeps rank-deficient scenes (a single plane leaves the
/// in-plane motions unconstrained) solvable; null directions come out
/// as zero because the gradient has no component there.
pub fn solve_normal_equations(jtj: &Matrix6<f64>, jtr: &Vector6<f64>) -> Option<Vector6<f64>> {
    let damping = 1e-6 * jtj.trace().max(1e-12);
    let damped = jtj + Matrix6::identity() * damping;
    damped.cholesky().map(|ch| ch.solve(jtr))
}

/// Result of the absolute-orientation estimator. `ok` reflects the
/// RANSAC consensus; `pose` is the best rigid fit found either way.
#[derive(Debug, Clone, Copy)]
pub struct OrientationResult {
    /// Rigid transform with `pose * src[i] ≈ dst[i]`
    pub pose: SE3,
    pub inliers: usize,
    pub ok: bool,
}

/// Closed-form rigid alignment of two corresponded point sets inside
/// a RANSAC loop. Fills `outliers` with the rejection mask of the
/// best consensus set.
pub fn solve_absolute_orientation(
    src: &[Vec3],
    dst: &[Vec3],
    outliers: &mut Vec<bool>,
    max_iterations: usize,
) -> OrientationResult {
    let n = src.len().min(dst.len());
    outliers.clear();
    outliers.resize(n, true);

    let failed = OrientationResult {
        pose: SE3::identity(),
        inliers: 0,
        ok: false,
    };
    if n < 3 {
        return failed;
    }

    let mut rng = StdRng::seed_from_u64(RANSAC_SEED);
    let mut best_pose: Option<SE3> = None;
    let mut best_inliers = 0usize;
    let mut best_mask = vec![true; n];

    for _ in 0..max_iterations {
        let sample = [
            rng.gen_range(0..n),
            rng.gen_range(0..n),
            rng.gen_range(0..n),
        ];
        if sample[0] == sample[1] || sample[1] == sample[2] || sample[0] == sample[2] {
            continue;
        }
        let Some(pose) = rigid_fit(src, dst, &sample) else {
            continue;
        };

        let mut mask = vec![true; n];
        let mut inliers = 0;
        for i in 0..n {
            if pose.transform(src[i]).distance(dst[i]) < INLIER_THRESHOLD {
                mask[i] = false;
                inliers += 1;
            }
        }
        // keep a best-effort pose even with an empty consensus; the
        // frame-to-frame caller gates it by motion magnitude
        if inliers > best_inliers || best_pose.is_none() {
            best_inliers = inliers;
            best_mask = mask;
            best_pose = Some(pose);
        }
    }

    let Some(mut pose) = best_pose else {
        return failed;
    };

    // refine on the consensus set
    if best_inliers >= 3 {
        let indices: Vec<usize> = (0..n).filter(|&i| !best_mask[i]).collect();
        if let Some(refined) = rigid_fit(src, dst, &indices) {
            pose = refined;
        }
    }

    *outliers = best_mask;
    OrientationResult {
        pose,
        inliers: best_inliers,
        ok: best_inliers >= 3 && 2 * best_inliers >= n,
    }
}

/// Horn's closed-form rigid fit over the indexed correspondences
fn rigid_fit(src: &[Vec3], dst: &[Vec3], indices: &[usize]) -> Option<SE3> {
    if indices.len() < 3 {
        return None;
    }
    let inv_n = 1.0 / indices.len() as f32;
    let c_src = indices.iter().fold(Vec3::ZERO, |a, &i| a + src[i]) * inv_n;
    let c_dst = indices.iter().fold(Vec3::ZERO, |a, &i| a + dst[i]) * inv_n;

    let mut w = Matrix3::<f64>::zeros();
    for &i in indices {
        let p = src[i] - c_src;
        let q = dst[i] - c_dst;
        for r in 0..3 {
            for c in 0..3 {
                w[(r, c)] += q[r] as f64 * p[c] as f64;
            }
        }
    }

    let svd = w.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut d = Matrix3::<f64>::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let r = u * d * v_t;

    let rotation = glam::Mat3::from_cols(
        Vec3::new(r[(0, 0)] as f32, r[(1, 0)] as f32, r[(2, 0)] as f32),
        Vec3::new(r[(0, 1)] as f32, r[(1, 1)] as f32, r[(2, 1)] as f32),
        Vec3::new(r[(0, 2)] as f32, r[(1, 2)] as f32, r[(2, 2)] as f32),
    );
    let pose = SE3::from_rotation_translation(rotation, Vec3::ZERO);
    let translation = c_dst - pose.rotate(c_src);
    Some(SE3::from_rotation_translation(rotation, translation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    fn cloud() -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.5, 0.0, 1.2),
            Vec3::new(0.0, 0.4, 0.8),
            Vec3::new(-0.3, 0.2, 1.5),
            Vec3::new(0.2, -0.3, 1.1),
            Vec3::new(-0.1, -0.2, 0.9),
        ]
    }

    #[test]
    fn test_normal_equations_identity() {
        let jtj = Matrix6::<f64>::identity() * 4.0;
        let jtr = Vector6::<f64>::from_element(2.0);
        let x = solve_normal_equations(&jtj, &jtr).unwrap();
        for i in 0..6 {
            assert!((x[i] - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn test_recovers_known_transform() {
        let src = cloud();
        let truth = SE3::new(
            Quat::from_axis_angle(Vec3::Y, 0.2),
            Vec3::new(0.1, -0.05, 0.3),
        );
        let dst: Vec<Vec3> = src.iter().map(|&p| truth.transform(p)).collect();

        let mut outliers = Vec::new();
        let result = solve_absolute_orientation(&src, &dst, &mut outliers, 100);
        assert!(result.ok);
        assert_eq!(result.inliers, src.len());
        assert!(outliers.iter().all(|&o| !o));
        for (&p, &q) in src.iter().zip(dst.iter()) {
            assert!(result.pose.transform(p).distance(q) < 1e-4);
        }
    }

    #[test]
    fn test_rejects_outliers() {
        let src = cloud();
        let truth = SE3::from_translation(Vec3::new(0.0, 0.1, 0.0));
        let mut dst: Vec<Vec3> = src.iter().map(|&p| truth.transform(p)).collect();
        // corrupt one correspondence
        dst[2] += Vec3::new(1.0, 1.0, 0.0);

        let mut outliers = Vec::new();
        let result = solve_absolute_orientation(&src, &dst, &mut outliers, 200);
        assert!(result.ok);
        assert_eq!(result.inliers, src.len() - 1);
        assert!(outliers[2]);
        assert!((result.pose.translation() - Vec3::new(0.0, 0.1, 0.0)).length() < 1e-3);
    }

    #[test]
    fn test_underdetermined_fails() {
        let src = vec![Vec3::ZERO, Vec3::X];
        let dst = src.clone();
        let mut outliers = Vec::new();
        let result = solve_absolute_orientation(&src, &dst, &mut outliers, 50);
        assert!(!result.ok);
    }
}

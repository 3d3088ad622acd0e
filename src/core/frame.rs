//! Frame representation
//!
//! A frame carries the dense pyramids consumed by the ICP tracker and
//! the sparse keypoints consumed by the relocalizer. The dense side is
//! double-buffered by the driver: `next` holds the incoming frame,
//! `last` the reference synthesized by the raycaster.

use glam::{Vec3, Vec4};

use crate::core::{ImageBuffer, Intrinsics, SE3};
use crate::features::{Descriptors, KeyPoint};

/// Number of pyramid levels used by preprocessing and the tracker
pub const NUM_PYRS: usize = 3;

/// Marks a vertex/normal map texel as valid. Texels carry their flag in
/// the `w` component; anything `<= 0` is a hole.
#[inline]
pub fn texel_valid(t: Vec4) -> bool {
    t.w > 0.0
}

/// Depth, vertex and normal maps at every pyramid level
#[derive(Debug, Clone)]
pub struct FramePyramid {
    pub depth: Vec<ImageBuffer<f32>>,
    pub vertex: Vec<ImageBuffer<Vec4>>,
    pub normal: Vec<ImageBuffer<Vec4>>,
}

impl FramePyramid {
    pub fn new(intr: &Intrinsics) -> Self {
        let mut depth = Vec::with_capacity(NUM_PYRS);
        let mut vertex = Vec::with_capacity(NUM_PYRS);
        let mut normal = Vec::with_capacity(NUM_PYRS);
        for i in 0..NUM_PYRS {
            let k = intr.level(i);
            depth.push(ImageBuffer::new(k.width, k.height));
            vertex.push(ImageBuffer::new(k.width, k.height));
            normal.push(ImageBuffer::new(k.width, k.height));
        }
        Self {
            depth,
            vertex,
            normal,
        }
    }

    /// Swap all levels with another pyramid
    pub fn swap(&mut self, other: &mut FramePyramid) {
        for i in 0..NUM_PYRS {
            self.depth[i].swap(&mut other.depth[i]);
            self.vertex[i].swap(&mut other.vertex[i]);
            self.normal[i].swap(&mut other.normal[i]);
        }
    }
}

/// Sparse features of a frame: 2D keypoints with binary descriptors,
/// back-projected to 3D where depth is available
#[derive(Debug, Clone, Default)]
pub struct FrameFeatures {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Descriptors,
    /// Camera-space back-projections, `None` where depth was invalid
    pub points: Vec<Option<Vec3>>,
    /// Surface normals sampled from the normal map at each keypoint
    pub normals: Vec<Option<Vec3>>,
    /// Outlier mask filled by the pose solvers
    pub outliers: Vec<bool>,
}

impl FrameFeatures {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Reset the outlier mask to all-inlier
    pub fn clear_outliers(&mut self) {
        self.outliers.clear();
        self.outliers.resize(self.keypoints.len(), false);
    }
}

/// A frame in the SLAM system
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub timestamp: f64,
    /// Camera pose in the world frame (`T_world_camera`)
    pub pose: SE3,
    pub features: FrameFeatures,
}

impl Frame {
    pub fn new(id: u64, timestamp: f64) -> Self {
        Self {
            id,
            timestamp,
            pose: SE3::identity(),
            features: FrameFeatures::default(),
        }
    }

    pub fn set_pose(&mut self, pose: SE3) {
        self.pose = pose;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyramid_levels() {
        let intr = Intrinsics::new(525.0, 525.0, 319.5, 239.5, 640, 480);
        let pyr = FramePyramid::new(&intr);
        assert_eq!(pyr.depth.len(), NUM_PYRS);
        assert_eq!(pyr.depth[0].width(), 640);
        assert_eq!(pyr.depth[1].width(), 320);
        assert_eq!(pyr.depth[2].width(), 160);
    }

    #[test]
    fn test_pyramid_swap() {
        let intr = Intrinsics::new(100.0, 100.0, 8.0, 8.0, 16, 16);
        let mut a = FramePyramid::new(&intr);
        let mut b = FramePyramid::new(&intr);
        a.depth[0].set(3, 3, 2.5);
        a.swap(&mut b);
        assert_eq!(b.depth[0].at(3, 3), 2.5);
        assert_eq!(a.depth[0].at(3, 3), 0.0);
    }

    #[test]
    fn test_texel_validity() {
        assert!(texel_valid(Vec4::new(0.0, 0.0, 1.0, 1.0)));
        assert!(!texel_valid(Vec4::new(0.0, 0.0, 1.0, -1.0)));
    }
}

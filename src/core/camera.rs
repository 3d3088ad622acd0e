//! Pinhole camera model with pyramid-level scaling

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Camera intrinsic parameters for one pyramid level
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub width: usize,
    pub height: usize,
}

impl Intrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: usize, height: usize) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Intrinsics of pyramid level `i` (level 0 is full resolution,
    /// each level halves both image dimensions).
    pub fn level(&self, i: usize) -> Intrinsics {
        let s = (1 << i) as f32;
        Intrinsics {
            fx: self.fx / s,
            fy: self.fy / s,
            cx: self.cx / s,
            cy: self.cy / s,
            width: self.width >> i,
            height: self.height >> i,
        }
    }

    /// Project a camera-space point to pixel coordinates.
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, p: Vec3) -> Option<Vec2> {
        if p.z <= 0.0 {
            return None;
        }
        Some(Vec2::new(
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// Back-project a pixel at the given depth into camera space
    pub fn unproject(&self, u: f32, v: f32, depth: f32) -> Vec3 {
        Vec3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }

    /// Check that a pixel lies inside the image with the given margin
    pub fn contains(&self, px: Vec2, margin: i32) -> bool {
        px.x >= margin as f32
            && px.x < (self.width as i32 - margin) as f32
            && px.y >= margin as f32
            && px.y < (self.height as i32 - margin) as f32
    }
}

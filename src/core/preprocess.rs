//! Per-frame preprocessing pipeline
//!
//! Raw depth → bilateral filter → Gaussian pyramid → vertex maps →
//! normal maps. Each stage is a data-parallel kernel over image rows;
//! the driver runs them in order before handing the pyramid to the
//! tracker.

use glam::Vec4;
use rayon::prelude::*;

use crate::core::frame::{texel_valid, FramePyramid, NUM_PYRS};
use crate::core::{ImageBuffer, Intrinsics};

const INVALID_TEXEL: Vec4 = Vec4::new(0.0, 0.0, 0.0, -1.0);

/// Convert a raw 16-bit depth image to metres. Zero stays zero
/// (invalid); everything else is divided by `depth_scale`.
pub fn upload_depth(raw: &[u16], width: usize, height: usize, depth_scale: f32) -> ImageBuffer<f32> {
    let data = raw
        .par_iter()
        .map(|&d| {
            if d == 0 {
                0.0
            } else {
                d as f32 / depth_scale
            }
        })
        .collect();
    ImageBuffer::from_vec(width, height, data)
}

/// Edge-preserving bilateral filter on a metric depth image.
///
/// `sigma_space` is in pixels, `sigma_depth` in metres. Invalid (zero)
/// pixels stay invalid and do not contribute to their neighbours.
pub fn bilateral_filter(src: &ImageBuffer<f32>, sigma_space: f32, sigma_depth: f32) -> ImageBuffer<f32> {
    let width = src.width();
    let height = src.height();
    let radius = (2.0 * sigma_space).ceil() as i32;
    let inv_ss = -0.5 / (sigma_space * sigma_space);
    let inv_sd = -0.5 / (sigma_depth * sigma_depth);

    let mut out = ImageBuffer::new(width, height);
    out.data_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                let center = src.at(x, y);
                if center <= 0.0 {
                    *px = 0.0;
                    continue;
                }
                let mut sum = 0.0f32;
                let mut weight = 0.0f32;
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        let Some(d) = src.sample(x as i32 + dx, y as i32 + dy) else {
                            continue;
                        };
                        if d <= 0.0 {
                            continue;
                        }
                        let ds = (dx * dx + dy * dy) as f32;
                        let dd = d - center;
                        let w = (ds * inv_ss + dd * dd * inv_sd).exp();
                        sum += d * w;
                        weight += w;
                    }
                }
                *px = if weight > 0.0 { sum / weight } else { 0.0 };
            }
        });
    out
}

/// Half-resolution downsample of a depth image. Averages the 2x2
/// source block but rejects samples more than `depth_gap` away from
/// the block's first valid pixel so depth edges survive.
pub fn pyr_down(src: &ImageBuffer<f32>, depth_gap: f32) -> ImageBuffer<f32> {
    let width = src.width() / 2;
    let height = src.height() / 2;
    let mut out = ImageBuffer::new(width, height);
    out.data_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                let mut reference = 0.0f32;
                let mut sum = 0.0f32;
                let mut count = 0;
                for dy in 0..2 {
                    for dx in 0..2 {
                        let d = src.at(2 * x + dx, 2 * y + dy);
                        if d <= 0.0 {
                            continue;
                        }
                        if reference <= 0.0 {
                            reference = d;
                        }
                        if (d - reference).abs() <= depth_gap {
                            sum += d;
                            count += 1;
                        }
                    }
                }
                *px = if count > 0 { sum / count as f32 } else { 0.0 };
            }
        });
    out
}

/// Back-project a depth image into a camera-space vertex map.
/// Depths outside `[depth_min, depth_max]` produce invalid texels.
pub fn back_project(
    depth: &ImageBuffer<f32>,
    intr: &Intrinsics,
    depth_min: f32,
    depth_max: f32,
) -> ImageBuffer<Vec4> {
    let width = depth.width();
    let mut out = ImageBuffer::new(width, depth.height());
    out.data_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                let d = depth.at(x, y);
                *px = if d >= depth_min && d <= depth_max {
                    intr.unproject(x as f32, y as f32, d).extend(1.0)
                } else {
                    INVALID_TEXEL
                };
            }
        });
    out
}

/// Compute a normal map from a vertex map by crossing forward
/// differences. Normals are oriented towards the camera.
pub fn compute_normals(vmap: &ImageBuffer<Vec4>) -> ImageBuffer<Vec4> {
    let width = vmap.width();
    let height = vmap.height();
    let mut out = ImageBuffer::new(width, height);
    out.data_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                *px = INVALID_TEXEL;
                if x + 1 >= width || y + 1 >= height {
                    continue;
                }
                let v00 = vmap.at(x, y);
                let v10 = vmap.at(x + 1, y);
                let v01 = vmap.at(x, y + 1);
                if !texel_valid(v00) || !texel_valid(v10) || !texel_valid(v01) {
                    continue;
                }
                let dx = v10.truncate() - v00.truncate();
                let dy = v01.truncate() - v00.truncate();
                let n = dx.cross(dy);
                if n.length_squared() < 1e-12 {
                    continue;
                }
                let mut n = n.normalize();
                // orient towards the camera
                if n.dot(v00.truncate()) > 0.0 {
                    n = -n;
                }
                *px = n.extend(1.0);
            }
        });
    out
}

/// Run the full preprocessing graph for an incoming depth frame,
/// filling every level of `pyramid`.
pub fn build_pyramid(
    raw_depth: &ImageBuffer<f32>,
    intr: &Intrinsics,
    depth_min: f32,
    depth_max: f32,
    pyramid: &mut FramePyramid,
) {
    pyramid.depth[0] = bilateral_filter(raw_depth, 2.0, 0.05);
    for i in 1..NUM_PYRS {
        pyramid.depth[i] = pyr_down(&pyramid.depth[i - 1], 0.05);
    }
    for i in 0..NUM_PYRS {
        let k = intr.level(i);
        pyramid.vertex[i] = back_project(&pyramid.depth[i], &k, depth_min, depth_max);
        pyramid.normal[i] = compute_normals(&pyramid.vertex[i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_depth(width: usize, height: usize, d: f32) -> ImageBuffer<f32> {
        ImageBuffer::from_vec(width, height, vec![d; width * height])
    }

    #[test]
    fn test_upload_depth_scale() {
        let raw = vec![0u16, 1000, 5000];
        let img = upload_depth(&raw, 3, 1, 1000.0);
        assert_eq!(img.at(0, 0), 0.0);
        assert!((img.at(1, 0) - 1.0).abs() < 1e-6);
        assert!((img.at(2, 0) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_bilateral_preserves_flat() {
        let img = flat_depth(16, 16, 1.5);
        let out = bilateral_filter(&img, 2.0, 0.05);
        for y in 0..16 {
            for x in 0..16 {
                assert!((out.at(x, y) - 1.5).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_pyr_down_rejects_edges() {
        let mut img = flat_depth(4, 4, 1.0);
        // one far outlier in the 2x2 block
        img.set(1, 1, 3.0);
        let out = pyr_down(&img, 0.05);
        assert!((out.at(0, 0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_back_project_cutoffs() {
        let mut img = flat_depth(4, 4, 1.0);
        img.set(0, 0, 10.0);
        let k = Intrinsics::new(100.0, 100.0, 2.0, 2.0, 4, 4);
        let vmap = back_project(&img, &k, 0.1, 3.0);
        assert!(!texel_valid(vmap.at(0, 0)));
        assert!(texel_valid(vmap.at(1, 1)));
        assert!((vmap.at(2, 2).z - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normals_of_plane_face_camera() {
        let img = flat_depth(8, 8, 1.0);
        let k = Intrinsics::new(100.0, 100.0, 4.0, 4.0, 8, 8);
        let vmap = back_project(&img, &k, 0.1, 3.0);
        let nmap = compute_normals(&vmap);
        let n = nmap.at(3, 3);
        assert!(texel_valid(n));
        assert!((n.z + 1.0).abs() < 1e-4, "normal should face the camera");
    }
}

//! Two-pass raycaster
//!
//! Pass one projects every visible block into screen-space rendering
//! blocks and rasterizes their depth interval onto a subsampled
//! z-range grid. Pass two marches each pixel between its tile bounds,
//! finds the TSDF zero-crossing, and synthesizes vertex, normal and
//! colour maps that become the next tracking reference.

use std::sync::atomic::{AtomicU32, Ordering};

use glam::{IVec2, Vec3, Vec4};
use rayon::prelude::*;

use crate::core::{ImageBuffer, Intrinsics, SE3};
use crate::fusion::voxel_hash::{HashEntry, VoxelHash};

/// A screen-space tile with a known depth interval
#[derive(Debug, Clone, Copy)]
pub struct RenderingBlock {
    pub upper_left: IVec2,
    pub lower_right: IVec2,
    pub z_range: (f32, f32),
}

/// Synthesized model view. Vertex and normal maps are in the camera
/// frame of the raycast pose, matching the preprocessed frame maps.
#[derive(Debug, Clone)]
pub struct RaycastOutput {
    pub vertex: ImageBuffer<Vec4>,
    pub normal: ImageBuffer<Vec4>,
    pub color: ImageBuffer<[u8; 3]>,
}

impl RaycastOutput {
    pub fn new(width: usize, height: usize) -> Self {
        let mut vertex = ImageBuffer::new(width, height);
        let mut normal = ImageBuffer::new(width, height);
        vertex.fill(Vec4::new(0.0, 0.0, 0.0, -1.0));
        normal.fill(Vec4::new(0.0, 0.0, 0.0, -1.0));
        Self {
            vertex,
            normal,
            color: ImageBuffer::new(width, height),
        }
    }
}

/// Project the visible blocks into clipped screen-space rendering
/// blocks of at most `rendering_block_size` pixels per side.
pub fn create_rendering_blocks(
    map: &VoxelHash,
    visible: &[HashEntry],
    intr: &Intrinsics,
    world_to_cam: &SE3,
) -> Vec<RenderingBlock> {
    let state = *map.state();
    let block_width = state.block_width();
    let tile = state.rendering_block_size as i32;

    let mut blocks: Vec<RenderingBlock> = visible
        .par_iter()
        .flat_map_iter(|entry| {
            let base = entry.pos.as_vec3() * block_width;
            let mut min_px = IVec2::new(i32::MAX, i32::MAX);
            let mut max_px = IVec2::new(i32::MIN, i32::MIN);
            let mut z_min = f32::INFINITY;
            let mut z_max = 0.0f32;
            for corner in 0..8 {
                let offset = Vec3::new(
                    (corner & 1) as f32,
                    ((corner >> 1) & 1) as f32,
                    ((corner >> 2) & 1) as f32,
                ) * block_width;
                let pc = world_to_cam.transform(base + offset);
                if pc.z <= 0.0 {
                    continue;
                }
                if let Some(px) = intr.project(pc) {
                    min_px = min_px.min(IVec2::new(px.x.floor() as i32, px.y.floor() as i32));
                    max_px = max_px.max(IVec2::new(px.x.ceil() as i32, px.y.ceil() as i32));
                    z_min = z_min.min(pc.z);
                    z_max = z_max.max(pc.z);
                }
            }

            let mut tiles = Vec::new();
            if z_max <= 0.0 {
                return tiles.into_iter();
            }
            let min_px = min_px.max(IVec2::ZERO);
            let max_px = max_px.min(IVec2::new(intr.width as i32 - 1, intr.height as i32 - 1));
            if min_px.x > max_px.x || min_px.y > max_px.y {
                return tiles.into_iter();
            }
            let z_min = z_min.max(state.depth_min_raycast);
            let z_max = z_max.min(state.depth_max_raycast);

            let mut y = min_px.y;
            while y <= max_px.y {
                let mut x = min_px.x;
                while x <= max_px.x {
                    tiles.push(RenderingBlock {
                        upper_left: IVec2::new(x, y),
                        lower_right: IVec2::new((x + tile - 1).min(max_px.x), (y + tile - 1).min(max_px.y)),
                        z_range: (z_min, z_max),
                    });
                    x += tile;
                }
                y += tile;
            }
            tiles.into_iter()
        })
        .collect();

    blocks.truncate(state.max_num_rendering_blocks);
    blocks
}

/// Per-tile z-range grid built by atomic min/max over the rendering
/// blocks. Depths are positive, so their bit patterns order correctly
/// as unsigned integers.
struct ZRangeGrid {
    width: usize,
    height: usize,
    subsample: usize,
    z_min: Vec<AtomicU32>,
    z_max: Vec<AtomicU32>,
}

impl ZRangeGrid {
    fn new(image_width: usize, image_height: usize, subsample: usize) -> Self {
        let width = image_width.div_ceil(subsample);
        let height = image_height.div_ceil(subsample);
        Self {
            width,
            height,
            subsample,
            z_min: (0..width * height)
                .map(|_| AtomicU32::new(f32::INFINITY.to_bits()))
                .collect(),
            z_max: (0..width * height).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    fn rasterize(&self, block: &RenderingBlock) {
        let tx0 = block.upper_left.x as usize / self.subsample;
        let ty0 = block.upper_left.y as usize / self.subsample;
        let tx1 = block.lower_right.x as usize / self.subsample;
        let ty1 = block.lower_right.y as usize / self.subsample;
        for ty in ty0..=ty1.min(self.height - 1) {
            for tx in tx0..=tx1.min(self.width - 1) {
                let i = ty * self.width + tx;
                self.z_min[i].fetch_min(block.z_range.0.to_bits(), Ordering::Relaxed);
                self.z_max[i].fetch_max(block.z_range.1.to_bits(), Ordering::Relaxed);
            }
        }
    }

    fn range_at(&self, x: usize, y: usize) -> Option<(f32, f32)> {
        let i = (y / self.subsample) * self.width + (x / self.subsample);
        let lo = f32::from_bits(self.z_min[i].load(Ordering::Relaxed));
        let hi = f32::from_bits(self.z_max[i].load(Ordering::Relaxed));
        (hi > 0.0 && lo.is_finite() && lo <= hi).then_some((lo, hi))
    }
}

/// Raycast the map from `cam_pose` (camera-to-world), synthesizing the
/// model's vertex/normal/colour maps at the given resolution.
pub fn raycast(
    map: &VoxelHash,
    visible: &[HashEntry],
    intr: &Intrinsics,
    cam_pose: &SE3,
) -> RaycastOutput {
    let state = *map.state();
    let world_to_cam = cam_pose.inverse();
    let blocks = create_rendering_blocks(map, visible, intr, &world_to_cam);

    let grid = ZRangeGrid::new(intr.width, intr.height, state.min_max_subsample);
    blocks.par_iter().for_each(|b| grid.rasterize(b));

    let tau = state.truncate_distance();
    let coarse_step = tau * state.step_scale_raycast();
    let fine_step = state.voxel_size;
    let width = intr.width;

    let mut out = RaycastOutput::new(intr.width, intr.height);
    let RaycastOutput {
        vertex,
        normal,
        color,
    } = &mut out;

    vertex
        .data_mut()
        .par_chunks_mut(width)
        .zip(normal.data_mut().par_chunks_mut(width))
        .zip(color.data_mut().par_chunks_mut(width))
        .enumerate()
        .for_each(|(y, ((vrow, nrow), crow))| {
            for x in 0..width {
                let Some((z_start, z_end)) = grid.range_at(x, y) else {
                    continue;
                };
                let ray = Vec3::new(
                    (x as f32 - intr.cx) / intr.fx,
                    (y as f32 - intr.cy) / intr.fy,
                    1.0,
                );

                let mut z = z_start;
                let mut prev: Option<(f32, f32)> = None;
                let mut hit: Option<f32> = None;
                while z <= z_end {
                    let pw = cam_pose.transform(ray * z);
                    match map.sdf_trilinear(pw) {
                        None => {
                            prev = None;
                            z += coarse_step;
                        }
                        Some(sdf) => {
                            if sdf <= 0.0 {
                                if let Some((pz, ps)) = prev {
                                    // refine the crossing with one
                                    // linear interpolation
                                    let t = ps / (ps - sdf);
                                    hit = Some(pz + (z - pz) * t);
                                }
                                break;
                            }
                            prev = Some((z, sdf));
                            z += sdf.max(fine_step);
                        }
                    }
                }

                let Some(zc) = hit else {
                    continue;
                };
                let pw = cam_pose.transform(ray * zc);
                let Some(n_world) = sdf_gradient(map, pw, state.voxel_size) else {
                    continue;
                };
                let v_cam = ray * zc;
                let mut n_cam = world_to_cam.rotate(n_world);
                if n_cam.dot(v_cam) > 0.0 {
                    n_cam = -n_cam;
                }
                vrow[x] = v_cam.extend(1.0);
                nrow[x] = n_cam.extend(1.0);
                crow[x] = map.color_nearest(pw).unwrap_or([0, 0, 0]);
            }
        });

    out
}

/// Central-difference gradient of the interpolated TSDF
fn sdf_gradient(map: &VoxelHash, p: Vec3, h: f32) -> Option<Vec3> {
    let dx = map.sdf_trilinear(p + Vec3::X * h)? - map.sdf_trilinear(p - Vec3::X * h)?;
    let dy = map.sdf_trilinear(p + Vec3::Y * h)? - map.sdf_trilinear(p - Vec3::Y * h)?;
    let dz = map.sdf_trilinear(p + Vec3::Z * h)? - map.sdf_trilinear(p - Vec3::Z * h)?;
    let g = Vec3::new(dx, dy, dz);
    (g.length_squared() > 1e-12).then(|| g.normalize())
}

/// Halve the resolution of a vertex or normal map by dropping every
/// other row and column (used to build the reference pyramid from a
/// full-resolution raycast).
pub fn half_sample(src: &ImageBuffer<Vec4>) -> ImageBuffer<Vec4> {
    let width = src.width() / 2;
    let height = src.height() / 2;
    let mut out = ImageBuffer::new(width, height);
    out.data_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.iter_mut().enumerate() {
                *px = src.at(2 * x, 2 * y);
            }
        });
    out
}

/// Shade the raycast output into an RGB byte image: simple headlight
/// shading on the synthesized normals.
pub fn shade_scene(output: &RaycastOutput, image: &mut [u8]) {
    let width = output.vertex.width();
    let height = output.vertex.height();
    image
        .par_chunks_mut(width * 3)
        .take(height)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width {
                let n = output.normal.at(x, y);
                let v = output.vertex.at(x, y);
                let rgb = if n.w > 0.0 && v.w > 0.0 {
                    let dir = v.truncate().normalize_or_zero();
                    let shade = (-n.truncate().dot(dir)).clamp(0.0, 1.0);
                    let lum = 0.2 + 0.8 * shade;
                    let c = output.color.at(x, y);
                    [
                        (c[0] as f32 * lum) as u8,
                        (c[1] as f32 * lum) as u8,
                        (c[2] as f32 * lum) as u8,
                    ]
                } else {
                    [0, 0, 0]
                };
                row[x * 3] = rgb[0];
                row[x * 3 + 1] = rgb[1];
                row[x * 3 + 2] = rgb[2];
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::integrator::{allocate_blocks, integrate_frame, select_visible_blocks};
    use crate::fusion::map_state::MapState;

    fn test_state() -> MapState {
        MapState {
            num_buckets: 4096,
            max_num_hash_entries: 6144,
            max_num_voxel_blocks: 4096,
            voxel_size: 0.01,
            ..Default::default()
        }
    }

    fn test_intr() -> Intrinsics {
        Intrinsics::new(80.0, 80.0, 40.0, 30.0, 80, 60)
    }

    fn fused_plane_map(intr: &Intrinsics, d: f32, frames: usize) -> (VoxelHash, Vec<HashEntry>) {
        let mut map = VoxelHash::new(test_state());
        let depth = ImageBuffer::from_vec(intr.width, intr.height, vec![d; intr.width * intr.height]);
        let pose = SE3::identity();
        let mut visible = Vec::new();
        for _ in 0..frames {
            allocate_blocks(&map, &depth, intr, &pose);
            visible = select_visible_blocks(&map, intr, &pose.inverse());
            integrate_frame(&mut map, &visible, &depth, None, intr, &pose.inverse());
        }
        (map, visible)
    }

    #[test]
    fn test_rendering_blocks_cover_plane() {
        let intr = test_intr();
        let (map, visible) = fused_plane_map(&intr, 1.0, 1);
        let blocks = create_rendering_blocks(&map, &visible, &intr, &SE3::identity().inverse());
        assert!(!blocks.is_empty());
        for b in &blocks {
            assert!(b.z_range.0 <= b.z_range.1);
            assert!(b.upper_left.x <= b.lower_right.x);
            let w = b.lower_right.x - b.upper_left.x + 1;
            assert!(w <= map.state().rendering_block_size as i32);
        }
    }

    #[test]
    fn test_raycast_reproduces_plane_depth() {
        let intr = test_intr();
        let (map, visible) = fused_plane_map(&intr, 1.0, 3);
        let out = raycast(&map, &visible, &intr, &SE3::identity());
        let tau = map.state().truncate_distance();

        let mut hits = 0;
        for y in 10..50 {
            for x in 10..70 {
                let v = out.vertex.at(x, y);
                if v.w > 0.0 {
                    hits += 1;
                    assert!(
                        (v.z - 1.0).abs() <= tau,
                        "depth {} deviates beyond tau at ({}, {})",
                        v.z,
                        x,
                        y
                    );
                }
            }
        }
        assert!(hits > 1000, "raycast should hit most of the plane, got {hits}");
    }

    #[test]
    fn test_raycast_normals_face_camera() {
        let intr = test_intr();
        let (map, visible) = fused_plane_map(&intr, 1.0, 3);
        let out = raycast(&map, &visible, &intr, &SE3::identity());
        let n = out.normal.at(40, 30);
        if n.w > 0.0 {
            assert!(n.z < -0.9, "plane normal should point back at the camera");
        }
    }

    #[test]
    fn test_empty_map_raycasts_invalid() {
        let intr = test_intr();
        let map = VoxelHash::new(test_state());
        let out = raycast(&map, &[], &intr, &SE3::identity());
        for y in 0..intr.height {
            for x in 0..intr.width {
                assert!(out.vertex.at(x, y).w <= 0.0);
            }
        }
    }

    #[test]
    fn test_half_sample() {
        let mut src = ImageBuffer::<Vec4>::new(8, 8);
        src.set(2, 2, Vec4::new(1.0, 2.0, 3.0, 1.0));
        let half = half_sample(&src);
        assert_eq!(half.width(), 4);
        assert_eq!(half.at(1, 1), Vec4::new(1.0, 2.0, 3.0, 1.0));
    }
}

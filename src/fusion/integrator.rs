//! TSDF integration kernels
//!
//! Three strictly ordered passes fold a depth frame into the map:
//! visible-block selection, an allocation sweep along the viewing
//! rays, and the weighted TSDF update over every visible block.

use glam::{IVec3, Vec3};
use rayon::prelude::*;

use crate::core::{ImageBuffer, Intrinsics, SE3};
use crate::fusion::map_state::{BLOCK_SIZE, BLOCK_SIZE3};
use crate::fusion::voxel_hash::{HashEntry, VoxelHash};

/// Per-frame fusion statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct FusionStats {
    pub visible_blocks: usize,
    pub updated_voxels: usize,
}

/// Compact the entries whose blocks intersect the current frustum.
/// `world_to_cam` is the inverse camera pose.
pub fn select_visible_blocks(
    map: &VoxelHash,
    intr: &Intrinsics,
    world_to_cam: &SE3,
) -> Vec<HashEntry> {
    let state = *map.state();
    let block_width = state.block_width();
    map.allocated_entries()
        .into_par_iter()
        .filter(|entry| {
            let base = entry.pos.as_vec3() * block_width;
            let mut nearest = f32::INFINITY;
            let mut any_in_frustum = false;
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
                nearest = nearest.min(pc.z);
                if let Some(px) = intr.project(pc) {
                    if intr.contains(px, 0) {
                        any_in_frustum = true;
                    }
                }
            }
            any_in_frustum && nearest <= state.depth_max_fusion
        })
        .collect()
}

/// Allocation sweep: walk each valid depth ray through the truncation
/// band and create every block it touches. Exhaustion drops voxels,
/// never the frame.
pub fn allocate_blocks(
    map: &VoxelHash,
    depth: &ImageBuffer<f32>,
    intr: &Intrinsics,
    cam_to_world: &SE3,
) {
    let state = *map.state();
    let tau = state.truncate_distance();
    let width = depth.width();

    depth
        .data()
        .par_chunks(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, &d) in row.iter().enumerate() {
                if d < state.depth_min_fusion || d > state.depth_max_fusion {
                    continue;
                }
                let near = cam_to_world.transform(intr.unproject(x as f32, y as f32, d - tau));
                let far = cam_to_world.transform(intr.unproject(x as f32, y as f32, d + tau));
                let span = far - near;
                let steps = (span.length() / state.block_width()).ceil().max(1.0) as usize;
                let step = span / steps as f32;
                let mut p = near;
                for _ in 0..=steps {
                    map.create_block(map.block_of_world(p));
                    p += step;
                }
            }
        });
}

/// Fuse a depth (and optional colour) frame into every visible block.
pub fn integrate_frame(
    map: &mut VoxelHash,
    visible: &[HashEntry],
    depth: &ImageBuffer<f32>,
    color: Option<&ImageBuffer<[u8; 3]>>,
    intr: &Intrinsics,
    world_to_cam: &SE3,
) -> FusionStats {
    let state = *map.state();
    let tau = state.truncate_distance();
    let tcw = *world_to_cam;

    // block pointer -> block position, so the parallel sweep over the
    // pool only touches visible blocks
    let mut owner: Vec<Option<IVec3>> = vec![None; state.max_num_voxel_blocks];
    for entry in visible {
        owner[entry.ptr as usize] = Some(entry.pos);
    }

    let updated_voxels = map
        .voxels_mut()
        .par_chunks_mut(BLOCK_SIZE3)
        .enumerate()
        .map(|(block, chunk)| {
            let Some(bpos) = owner[block] else {
                return 0usize;
            };
            let base = bpos * BLOCK_SIZE as i32;
            let mut updated = 0;
            for (i, voxel) in chunk.iter_mut().enumerate() {
                let vpos = base + VoxelHash::local_pos(i);
                let pw = vpos.as_vec3() * state.voxel_size;
                let pc = tcw.transform(pw);
                if pc.z <= 0.0 {
                    continue;
                }
                let Some(px) = intr.project(pc) else {
                    continue;
                };
                let (u, v) = (px.x.round() as i32, px.y.round() as i32);
                let Some(d) = depth.sample(u, v) else {
                    continue;
                };
                if d < state.depth_min_fusion || d > state.depth_max_fusion {
                    continue;
                }

                let eta = d - pc.z;
                if eta < -tau {
                    // behind the surface as seen from the camera
                    continue;
                }

                let w = voxel.weight as f32;
                let w_new = (voxel.weight as u16 + 1).min(u8::MAX as u16) as u8;
                voxel.sdf = (voxel.sdf * w + eta.clamp(-tau, tau)) / w_new as f32;

                if let Some(rgb) = color {
                    if let Some(c) = rgb.sample(u, v) {
                        for ch in 0..3 {
                            let blended =
                                (voxel.color[ch] as f32 * w + c[ch] as f32) / w_new as f32;
                            voxel.color[ch] = blended.round().clamp(0.0, 255.0) as u8;
                        }
                    }
                }

                voxel.weight = w_new;
                updated += 1;
            }
            updated
        })
        .sum();

    FusionStats {
        visible_blocks: visible.len(),
        updated_voxels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn flat_depth(intr: &Intrinsics, d: f32) -> ImageBuffer<f32> {
        ImageBuffer::from_vec(intr.width, intr.height, vec![d; intr.width * intr.height])
    }

    fn fuse_plane(map: &mut VoxelHash, intr: &Intrinsics, d: f32) -> FusionStats {
        let depth = flat_depth(intr, d);
        let pose = SE3::identity();
        allocate_blocks(map, &depth, intr, &pose);
        let visible = select_visible_blocks(map, intr, &pose.inverse());
        integrate_frame(map, &visible, &depth, None, intr, &pose.inverse())
    }

    #[test]
    fn test_fusion_populates_band() {
        let mut map = VoxelHash::new(test_state());
        let intr = test_intr();
        let stats = fuse_plane(&mut map, &intr, 1.0);
        assert!(stats.visible_blocks > 0);
        assert!(stats.updated_voxels > 0);

        // a voxel on the surface should carry sdf near zero
        let v = map.voxel_of_world(Vec3::new(0.0, 0.0, 1.0));
        let vox = map.find_voxel(v).expect("surface voxel allocated");
        assert!(vox.observed());
        assert!(vox.sdf.abs() <= map.state().truncate_distance());
    }

    #[test]
    fn test_sdf_stays_truncated() {
        let mut map = VoxelHash::new(test_state());
        let intr = test_intr();
        fuse_plane(&mut map, &intr, 1.0);
        let tau = map.state().truncate_distance();
        for vox in map.voxels() {
            if vox.observed() {
                assert!(vox.sdf.abs() <= tau + 1e-6);
            }
        }
    }

    #[test]
    fn test_weight_monotone_and_capped() {
        let mut map = VoxelHash::new(test_state());
        let intr = test_intr();
        fuse_plane(&mut map, &intr, 1.0);
        let v = map.voxel_of_world(Vec3::new(0.0, 0.0, 1.0));
        let w1 = map.find_voxel(v).unwrap().weight;
        fuse_plane(&mut map, &intr, 1.0);
        let w2 = map.find_voxel(v).unwrap().weight;
        assert!(w2 >= w1);
        assert_eq!(w2, w1 + 1);
    }

    #[test]
    fn test_out_of_range_depth_ignored() {
        let mut map = VoxelHash::new(test_state());
        let intr = test_intr();
        let stats = fuse_plane(&mut map, &intr, 50.0);
        assert_eq!(stats.updated_voxels, 0);
        assert_eq!(map.num_allocated_blocks(), 0);
    }

    #[test]
    fn test_exhaustion_tolerated() {
        let state = MapState {
            num_buckets: 4096,
            max_num_hash_entries: 6144,
            max_num_voxel_blocks: 16,
            voxel_size: 0.01,
            ..Default::default()
        };
        let mut map = VoxelHash::new(state);
        let intr = test_intr();
        let stats = fuse_plane(&mut map, &intr, 1.0);
        assert_eq!(map.num_allocated_blocks(), 16);
        assert!(map.dropped_allocations() > 0);
        assert!(stats.updated_voxels > 0);
    }
}

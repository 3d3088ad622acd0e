//! Global map constants and tunables
//!
//! `MapState` is built once at start-up, validated, and then passed by
//! copy to every kernel; nothing mutates it after construction. A
//! changed parameter means building a new state and resetting the map.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Voxel block edge length in voxels
pub const BLOCK_SIZE: usize = 8;
/// Voxels per block
pub const BLOCK_SIZE3: usize = BLOCK_SIZE * BLOCK_SIZE * BLOCK_SIZE;

#[derive(Error, Debug)]
pub enum MapStateError {
    #[error("num_buckets ({0}) must be strictly below max_num_hash_entries ({1})")]
    ExcessRegionEmpty(usize, usize),

    #[error("num_buckets ({0}) must not be below max_num_voxel_blocks ({1})")]
    BucketsBelowBlocks(usize, usize),

    #[error("depth range [{0}, {1}] is empty")]
    EmptyDepthRange(f32, f32),
}

/// Tunables governing voxel size, table capacities and raycast range
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MapState {
    /// Primary hash region size
    pub num_buckets: usize,
    /// Total hash entries (primary + excess)
    pub max_num_hash_entries: usize,
    /// Voxel block pool capacity
    pub max_num_voxel_blocks: usize,
    /// Rendering block budget for the raycast bounds pass
    pub max_num_rendering_blocks: usize,
    /// Triangle budget for mesh extraction
    pub max_num_mesh_triangles: usize,

    /// Voxel edge length in metres
    pub voxel_size: f32,

    /// Depth band accepted during preprocessing and fusion
    pub depth_min_fusion: f32,
    pub depth_max_fusion: f32,
    /// Depth band marched by the raycaster
    pub depth_min_raycast: f32,
    pub depth_max_raycast: f32,

    /// Rendering block tile edge in pixels
    pub rendering_block_size: usize,
    /// Subsampling factor of the per-tile z-range grid
    pub min_max_subsample: usize,
}

impl Default for MapState {
    fn default() -> Self {
        Self {
            num_buckets: 0x20000,
            max_num_hash_entries: 0x28000,
            max_num_voxel_blocks: 0x10000,
            max_num_rendering_blocks: 0x10000,
            max_num_mesh_triangles: 0x200000,
            voxel_size: 0.005,
            depth_min_fusion: 0.1,
            depth_max_fusion: 3.0,
            depth_min_raycast: 0.1,
            depth_max_raycast: 3.5,
            rendering_block_size: 16,
            min_max_subsample: 8,
        }
    }
}

impl MapState {
    /// Check the structural invariants that the hash table relies on.
    /// Violations here are fatal at start-up.
    pub fn validate(&self) -> Result<(), MapStateError> {
        if self.num_buckets >= self.max_num_hash_entries {
            return Err(MapStateError::ExcessRegionEmpty(
                self.num_buckets,
                self.max_num_hash_entries,
            ));
        }
        if self.num_buckets < self.max_num_voxel_blocks {
            return Err(MapStateError::BucketsBelowBlocks(
                self.num_buckets,
                self.max_num_voxel_blocks,
            ));
        }
        if self.depth_min_fusion >= self.depth_max_fusion {
            return Err(MapStateError::EmptyDepthRange(
                self.depth_min_fusion,
                self.depth_max_fusion,
            ));
        }
        Ok(())
    }

    /// Excess (collision chain) region size
    pub fn num_excess_entries(&self) -> usize {
        self.max_num_hash_entries - self.num_buckets
    }

    /// Truncation distance τ of the signed distance field
    pub fn truncate_distance(&self) -> f32 {
        self.voxel_size * 8.0
    }

    /// World-space edge length of a voxel block
    pub fn block_width(&self) -> f32 {
        self.voxel_size * BLOCK_SIZE as f32
    }

    pub fn inv_voxel_size(&self) -> f32 {
        1.0 / self.voxel_size
    }

    /// Fraction of τ the raycaster advances per step while outside the
    /// truncation band
    pub fn step_scale_raycast(&self) -> f32 {
        0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MapState::default().validate().is_ok());
    }

    #[test]
    fn test_no_excess_region_is_fatal() {
        let state = MapState {
            num_buckets: 100,
            max_num_hash_entries: 100,
            max_num_voxel_blocks: 50,
            ..Default::default()
        };
        assert!(matches!(
            state.validate(),
            Err(MapStateError::ExcessRegionEmpty(..))
        ));
    }

    #[test]
    fn test_buckets_below_blocks_is_fatal() {
        let state = MapState {
            num_buckets: 32,
            max_num_hash_entries: 64,
            max_num_voxel_blocks: 48,
            ..Default::default()
        };
        assert!(matches!(
            state.validate(),
            Err(MapStateError::BucketsBelowBlocks(..))
        ));
    }

    #[test]
    fn test_derived_quantities() {
        let state = MapState::default();
        assert!((state.block_width() - 0.04).abs() < 1e-6);
        assert!((state.truncate_distance() - 0.04).abs() < 1e-6);
        assert_eq!(state.num_excess_entries(), 0x8000);
    }
}

//! Dense volumetric map
//!
//! Voxel-hashed TSDF storage with the kernels that operate on it:
//! - map_state.rs: global map constants and tunables
//! - voxel_hash.rs: concurrent block hash table with free lists
//! - integrator.rs: depth-frame fusion (visibility, allocation, TSDF update)
//! - raycaster.rs: two-pass model synthesis for tracking and rendering
//! - mesher.rs: marching-cubes surface extraction
//! - key_map.rs: hashed spatial grid of relocalization keypoints

pub mod integrator;
pub mod key_map;
pub mod map_state;
pub mod mesher;
pub mod raycaster;
pub mod voxel_hash;

pub use integrator::{allocate_blocks, integrate_frame, select_visible_blocks, FusionStats};
pub use key_map::{KeyMap, MapKey};
pub use map_state::{MapState, MapStateError, BLOCK_SIZE, BLOCK_SIZE3};
pub use mesher::{extract_mesh, Mesh};
pub use raycaster::{raycast, shade_scene, RaycastOutput, RenderingBlock};
pub use voxel_hash::{HashEntry, Voxel, VoxelHash, ENTRY_AVAILABLE, ENTRY_OCCUPIED};

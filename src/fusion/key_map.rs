//! Hashed spatial grid of relocalization keypoints
//!
//! World-space keypoints with binary descriptors live in a grid of
//! 1 cm cells, five slots per cell, addressed by the same three-prime
//! hash as the voxel table. Re-observations average the stored
//! position and saturate an observation counter; a periodic sweep
//! decays keys that should have been seen but were not, and evicts
//! them once the counter falls below the threshold.

use glam::{IVec3, Vec3};

use crate::features::base::{hamming, Descriptors, DESCRIPTOR_SIZE};

/// Cell edge length in metres
pub const GRID_SIZE: f32 = 0.01;
/// Slots per cell
pub const N_BUCKETS: usize = 5;
/// Number of grid cells
pub const MAX_CELLS: usize = 100_000;
/// Observation counter saturation
pub const MAX_OBS: i32 = 10;
/// Eviction threshold
pub const MIN_OBS_THRESH: i32 = -5;

/// Descriptors closer than this many bits can merge into one key
const MERGE_HAMMING: u32 = 48;
/// Positions further apart than this never merge
const MERGE_RADIUS: f32 = 2.5 * GRID_SIZE;

const P1: i32 = 73856093;
const P2: i32 = 19349669;
const P3: i32 = 83492791;

/// A stored map keypoint
#[derive(Debug, Clone)]
pub struct MapKey {
    pub valid: bool,
    pub pos: Vec3,
    pub normal: Vec3,
    pub obs: i32,
    pub descriptor: [u8; DESCRIPTOR_SIZE],
}

impl Default for MapKey {
    fn default() -> Self {
        Self {
            valid: false,
            pos: Vec3::ZERO,
            normal: Vec3::ZERO,
            obs: 0,
            descriptor: [0; DESCRIPTOR_SIZE],
        }
    }
}

/// The relocalization key store
pub struct KeyMap {
    keys: Vec<MapKey>,
    /// Frame stamp of the last successful match per slot
    touched: Vec<u64>,
    epoch: u64,
    dropped: u64,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyMap {
    pub fn new() -> Self {
        Self {
            keys: vec![MapKey::default(); MAX_CELLS * N_BUCKETS],
            touched: vec![0; MAX_CELLS * N_BUCKETS],
            epoch: 0,
            dropped: 0,
        }
    }

    fn cell_of(pos: Vec3) -> IVec3 {
        (pos / GRID_SIZE).floor().as_ivec3()
    }

    fn hash_cell(cell: IVec3) -> usize {
        let h = (cell.x.wrapping_mul(P1)) ^ (cell.y.wrapping_mul(P2)) ^ (cell.z.wrapping_mul(P3));
        (h as u32 % MAX_CELLS as u32) as usize * N_BUCKETS
    }

    /// Advance the observation epoch; call once per tracked frame
    /// before inserting that frame's keys.
    pub fn begin_frame(&mut self) {
        self.epoch += 1;
    }

    /// Insert or re-observe a keypoint. Returns the slot index, or
    /// `None` when the target cell is full (the key is dropped).
    pub fn insert(
        &mut self,
        pos: Vec3,
        normal: Vec3,
        descriptor: &[u8; DESCRIPTOR_SIZE],
    ) -> Option<usize> {
        let base = Self::hash_cell(Self::cell_of(pos));

        // re-observation of an existing key
        for slot in base..base + N_BUCKETS {
            let key = &mut self.keys[slot];
            if !key.valid {
                continue;
            }
            if hamming(&key.descriptor, descriptor) <= MERGE_HAMMING
                && key.pos.distance(pos) <= MERGE_RADIUS
            {
                let w = key.obs.max(1) as f32;
                key.pos = (key.pos * w + pos) / (w + 1.0);
                key.obs = (key.obs + 1).min(MAX_OBS);
                self.touched[slot] = self.epoch;
                return Some(slot);
            }
        }

        // first free slot in the cell
        for slot in base..base + N_BUCKETS {
            let key = &mut self.keys[slot];
            if key.valid {
                continue;
            }
            *key = MapKey {
                valid: true,
                pos,
                normal,
                obs: 1,
                descriptor: *descriptor,
            };
            self.touched[slot] = self.epoch;
            return Some(slot);
        }

        self.dropped += 1;
        None
    }

    /// Decay keys that were inside the view but not re-observed this
    /// epoch, evicting any whose counter falls below the threshold.
    pub fn sweep<F: Fn(Vec3) -> bool>(&mut self, in_view: F) -> usize {
        let mut evicted = 0;
        for slot in 0..self.keys.len() {
            let key = &mut self.keys[slot];
            if !key.valid || self.touched[slot] == self.epoch {
                continue;
            }
            if !in_view(key.pos) {
                continue;
            }
            key.obs -= 1;
            if key.obs < MIN_OBS_THRESH {
                key.valid = false;
                evicted += 1;
            }
        }
        evicted
    }

    /// Snapshot all valid keys for descriptor matching:
    /// positions, normals, descriptor block and originating slots.
    pub fn collect(&self) -> (Vec<Vec3>, Vec<Vec3>, Descriptors, Vec<usize>) {
        let mut positions = Vec::new();
        let mut normals = Vec::new();
        let mut descriptors = Descriptors::new();
        let mut slots = Vec::new();
        for (slot, key) in self.keys.iter().enumerate() {
            if key.valid {
                positions.push(key.pos);
                normals.push(key.normal);
                descriptors.push(&key.descriptor);
                slots.push(slot);
            }
        }
        (positions, normals, descriptors, slots)
    }

    pub fn num_valid(&self) -> usize {
        self.keys.iter().filter(|k| k.valid).count()
    }

    /// Keys dropped because their cell was full
    pub fn dropped_keys(&self) -> u64 {
        self.dropped
    }

    /// Valid keys inside one cell (diagnostics and tests)
    pub fn cell_occupancy(&self, pos: Vec3) -> usize {
        let base = Self::hash_cell(Self::cell_of(pos));
        self.keys[base..base + N_BUCKETS]
            .iter()
            .filter(|k| k.valid)
            .count()
    }

    pub fn clear(&mut self) {
        self.keys.fill(MapKey::default());
        self.touched.fill(0);
        self.epoch = 0;
        self.dropped = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(byte: u8) -> [u8; DESCRIPTOR_SIZE] {
        [byte; DESCRIPTOR_SIZE]
    }

    #[test]
    fn test_insert_and_reobserve() {
        let mut map = KeyMap::new();
        map.begin_frame();
        let p = Vec3::new(0.1, 0.2, 1.0);
        let slot = map.insert(p, Vec3::Z, &desc(0xAB)).unwrap();
        assert_eq!(map.num_valid(), 1);

        map.begin_frame();
        let again = map
            .insert(p + Vec3::splat(0.001), Vec3::Z, &desc(0xAB))
            .unwrap();
        assert_eq!(slot, again);
        assert_eq!(map.num_valid(), 1);
        assert_eq!(map.keys[slot].obs, 2);
    }

    #[test]
    fn test_obs_saturates() {
        let mut map = KeyMap::new();
        let p = Vec3::new(0.0, 0.0, 0.5);
        for _ in 0..20 {
            map.begin_frame();
            map.insert(p, Vec3::Z, &desc(0x11));
        }
        let (_, _, _, slots) = map.collect();
        assert_eq!(map.keys[slots[0]].obs, MAX_OBS);
    }

    #[test]
    fn test_cell_never_overflows() {
        let mut map = KeyMap::new();
        map.begin_frame();
        let p = Vec3::new(0.05, 0.05, 0.05);
        // distinct descriptors so nothing merges
        for i in 0..10u8 {
            map.insert(p, Vec3::Z, &desc(i * 0x11));
        }
        assert_eq!(map.cell_occupancy(p), N_BUCKETS);
        assert!(map.dropped_keys() > 0);
    }

    #[test]
    fn test_sweep_evicts_stale_keys() {
        let mut map = KeyMap::new();
        map.begin_frame();
        let p = Vec3::new(0.3, 0.0, 1.0);
        let slot = map.insert(p, Vec3::Z, &desc(0x7F)).unwrap();

        // key starts at obs = 1; it takes 7 missed frames to cross
        // the eviction threshold of -5
        for i in 0..7 {
            map.begin_frame();
            map.sweep(|_| true);
            let key = &map.keys[slot];
            assert!(key.obs >= MIN_OBS_THRESH - 1, "obs bounded below");
            if i < 6 {
                assert!(key.valid, "evicted too early at sweep {i}");
            }
        }
        assert!(!map.keys[slot].valid);
        assert_eq!(map.num_valid(), 0);
    }

    #[test]
    fn test_sweep_spares_out_of_view_keys() {
        let mut map = KeyMap::new();
        map.begin_frame();
        map.insert(Vec3::new(0.3, 0.0, 1.0), Vec3::Z, &desc(0x7F));
        for _ in 0..10 {
            map.begin_frame();
            map.sweep(|_| false);
        }
        assert_eq!(map.num_valid(), 1);
    }

    #[test]
    fn test_collect_roundtrip() {
        let mut map = KeyMap::new();
        map.begin_frame();
        map.insert(Vec3::new(0.0, 0.0, 1.0), Vec3::Z, &desc(0x01));
        map.insert(Vec3::new(1.0, 0.0, 1.0), Vec3::Z, &desc(0x02));
        let (positions, normals, descriptors, slots) = map.collect();
        assert_eq!(positions.len(), 2);
        assert_eq!(normals.len(), 2);
        assert_eq!(descriptors.len(), 2);
        assert_eq!(slots.len(), 2);
    }
}

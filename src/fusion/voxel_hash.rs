//! Concurrent voxel block hash table
//!
//! Spatially-indexed allocation of fixed-size voxel blocks, designed
//! for many workers inserting at once. The table has a primary region
//! addressed by the three-prime hash and an excess region chaining
//! collisions through `next`. Lookups are lock-free; writers serialize
//! only on a per-bucket mutex word held across the chain splice.
//!
//! Block storage comes from a preallocated pool handed out through an
//! atomic free-list counter. Blocks are never freed while a session
//! runs; `reset` is the only bulk delete.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;

use glam::{IVec3, Vec3};

use crate::fusion::map_state::{MapState, BLOCK_SIZE, BLOCK_SIZE3};

/// Slot holds no entry
pub const ENTRY_AVAILABLE: i32 = -1;
/// Slot reserved by a writer but not yet committed
pub const ENTRY_OCCUPIED: i32 = -2;

const P1: i32 = 73856093;
const P2: i32 = 19349669;
const P3: i32 = 83492791;

/// A single TSDF voxel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voxel {
    /// Signed distance in metres, clamped to ±τ
    pub sdf: f32,
    /// Observation weight; zero iff never observed
    pub weight: u8,
    pub color: [u8; 3],
}

impl Default for Voxel {
    fn default() -> Self {
        Self {
            sdf: 0.0,
            weight: 0,
            color: [0, 0, 0],
        }
    }
}

impl Voxel {
    pub fn observed(&self) -> bool {
        self.weight > 0
    }
}

/// Snapshot of one hash table entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashEntry {
    /// Block position on the integer lattice
    pub pos: IVec3,
    /// Index into the voxel block pool, or a sentinel
    pub ptr: i32,
    /// Offset of the successor in the excess region, -1 terminates
    pub next: i32,
}

struct Slot {
    x: AtomicI32,
    y: AtomicI32,
    z: AtomicI32,
    ptr: AtomicI32,
    next: AtomicI32,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            x: AtomicI32::new(0),
            y: AtomicI32::new(0),
            z: AtomicI32::new(0),
            ptr: AtomicI32::new(ENTRY_AVAILABLE),
            next: AtomicI32::new(-1),
        }
    }
}

/// The voxel-hashed TSDF store
pub struct VoxelHash {
    state: MapState,
    slots: Vec<Slot>,
    bucket_mutex: Vec<AtomicI32>,
    /// Free block indices; only `heap[0..heap_top]` are live
    heap: Vec<i32>,
    heap_top: AtomicI32,
    /// Free excess-region offsets
    excess: Vec<i32>,
    excess_top: AtomicI32,
    /// Blocks popped for an append that lost its excess slot
    spare_blocks: Mutex<Vec<i32>>,
    voxels: Vec<Voxel>,
    dropped: AtomicU32,
}

impl VoxelHash {
    pub fn new(state: MapState) -> Self {
        let slots = (0..state.max_num_hash_entries)
            .map(|_| Slot::vacant())
            .collect();
        let bucket_mutex = (0..state.num_buckets).map(|_| AtomicI32::new(0)).collect();
        let heap: Vec<i32> = (0..state.max_num_voxel_blocks as i32).collect();
        let excess: Vec<i32> = (0..state.num_excess_entries() as i32).collect();
        let heap_top = AtomicI32::new(state.max_num_voxel_blocks as i32);
        let excess_top = AtomicI32::new(state.num_excess_entries() as i32);
        Self {
            voxels: vec![Voxel::default(); state.max_num_voxel_blocks * BLOCK_SIZE3],
            state,
            slots,
            bucket_mutex,
            heap,
            heap_top,
            excess,
            excess_top,
            spare_blocks: Mutex::new(Vec::new()),
            dropped: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> &MapState {
        &self.state
    }

    /// Three-prime spatial hash of a block position. Negative
    /// coordinates hash through their two's-complement bits.
    pub fn hash(&self, pos: IVec3) -> usize {
        let h = (pos.x.wrapping_mul(P1)) ^ (pos.y.wrapping_mul(P2)) ^ (pos.z.wrapping_mul(P3));
        (h as u32 % self.state.num_buckets as u32) as usize
    }

    fn load_entry(&self, slot: usize) -> HashEntry {
        let s = &self.slots[slot];
        // Acquire on ptr orders the position loads after the commit
        let ptr = s.ptr.load(Ordering::Acquire);
        HashEntry {
            pos: IVec3::new(
                s.x.load(Ordering::Relaxed),
                s.y.load(Ordering::Relaxed),
                s.z.load(Ordering::Relaxed),
            ),
            ptr,
            next: s.next.load(Ordering::Acquire),
        }
    }

    /// Snapshot of the entry in `slot`
    pub fn entry_at(&self, slot: usize) -> HashEntry {
        self.load_entry(slot)
    }

    /// Lock-free lookup of a block position
    pub fn find_entry(&self, pos: IVec3) -> Option<HashEntry> {
        let mut idx = self.hash(pos);
        loop {
            let e = self.load_entry(idx);
            if e.ptr >= 0 && e.pos == pos {
                return Some(e);
            }
            if e.next < 0 {
                return None;
            }
            idx = self.state.num_buckets + e.next as usize;
        }
    }

    fn try_lock(&self, bucket: usize) -> bool {
        self.bucket_mutex[bucket]
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self, bucket: usize) {
        self.bucket_mutex[bucket].store(0, Ordering::Release);
    }

    fn pop_block(&self) -> Option<i32> {
        if let Some(spare) = self.spare_blocks.lock().unwrap().pop() {
            return Some(spare);
        }
        let top = self.heap_top.fetch_sub(1, Ordering::AcqRel);
        if top <= 0 {
            self.heap_top.fetch_add(1, Ordering::AcqRel);
            return None;
        }
        Some(self.heap[top as usize - 1])
    }

    fn pop_excess(&self) -> Option<i32> {
        let top = self.excess_top.fetch_sub(1, Ordering::AcqRel);
        if top <= 0 {
            self.excess_top.fetch_add(1, Ordering::AcqRel);
            return None;
        }
        Some(self.excess[top as usize - 1])
    }

    /// Write an entry into `slot` and commit it by publishing `ptr`
    fn commit_entry(&self, slot: usize, pos: IVec3, block: i32) {
        let s = &self.slots[slot];
        s.ptr.store(ENTRY_OCCUPIED, Ordering::Relaxed);
        s.x.store(pos.x, Ordering::Relaxed);
        s.y.store(pos.y, Ordering::Relaxed);
        s.z.store(pos.z, Ordering::Relaxed);
        s.ptr.store(block, Ordering::Release);
    }

    /// Ensure a block exists for `pos`, allocating it if necessary.
    ///
    /// Safe to call from many workers at once. Returns `false` only
    /// when the block pool or the excess region is exhausted; the
    /// caller drops the voxel, never the frame.
    pub fn create_block(&self, pos: IVec3) -> bool {
        let bucket = self.hash(pos);
        loop {
            // fast path: already present
            let mut idx = bucket;
            loop {
                let e = self.load_entry(idx);
                if e.ptr >= 0 && e.pos == pos {
                    return true;
                }
                if e.next < 0 {
                    break;
                }
                idx = self.state.num_buckets + e.next as usize;
            }

            if !self.try_lock(bucket) {
                std::hint::spin_loop();
                continue;
            }

            // re-walk under the lock; a racing writer may have
            // inserted the position or grown the chain
            let mut tail = bucket;
            let mut found = false;
            loop {
                let e = self.load_entry(tail);
                if e.ptr >= 0 && e.pos == pos {
                    found = true;
                    break;
                }
                if e.next < 0 {
                    break;
                }
                tail = self.state.num_buckets + e.next as usize;
            }
            if found {
                self.unlock(bucket);
                return true;
            }

            let created = if tail == bucket
                && self.slots[bucket].ptr.load(Ordering::Acquire) == ENTRY_AVAILABLE
            {
                // primary slot is free
                match self.pop_block() {
                    Some(block) => {
                        self.commit_entry(bucket, pos, block);
                        true
                    }
                    None => false,
                }
            } else {
                // append to the excess chain
                match self.pop_block() {
                    Some(block) => match self.pop_excess() {
                        Some(offset) => {
                            let slot = self.state.num_buckets + offset as usize;
                            self.commit_entry(slot, pos, block);
                            self.slots[tail].next.store(offset, Ordering::Release);
                            true
                        }
                        None => {
                            // chain slot lost; return the block
                            self.spare_blocks.lock().unwrap().push(block);
                            false
                        }
                    },
                    None => false,
                }
            };

            self.unlock(bucket);
            if !created {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            return created;
        }
    }

    /// Snapshot every committed entry
    pub fn allocated_entries(&self) -> Vec<HashEntry> {
        (0..self.slots.len())
            .filter_map(|i| {
                let e = self.load_entry(i);
                (e.ptr >= 0).then_some(e)
            })
            .collect()
    }

    pub fn num_allocated_blocks(&self) -> usize {
        self.state.max_num_voxel_blocks - self.free_heap_len()
    }

    pub fn free_heap_len(&self) -> usize {
        self.heap_top.load(Ordering::Acquire).max(0) as usize
            + self.spare_blocks.lock().unwrap().len()
    }

    /// Free block indices currently on the heap (for diagnostics)
    pub fn free_heap(&self) -> Vec<i32> {
        let top = self.heap_top.load(Ordering::Acquire).max(0) as usize;
        let mut free: Vec<i32> = self.heap[..top].to_vec();
        free.extend(self.spare_blocks.lock().unwrap().iter().copied());
        free
    }

    /// Voxels silently dropped due to pool exhaustion
    pub fn dropped_allocations(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Bulk reset: all blocks back on the heap, all entries cleared,
    /// the excess free list restored to identity.
    pub fn reset(&mut self) {
        for s in &mut self.slots {
            *s = Slot::vacant();
        }
        for m in &mut self.bucket_mutex {
            *m = AtomicI32::new(0);
        }
        self.heap_top = AtomicI32::new(self.state.max_num_voxel_blocks as i32);
        self.excess_top = AtomicI32::new(self.state.num_excess_entries() as i32);
        self.spare_blocks.lock().unwrap().clear();
        self.voxels.fill(Voxel::default());
        self.dropped = AtomicU32::new(0);
    }

    // ---- voxel addressing -------------------------------------------------

    /// Voxel lattice coordinate containing a world point
    pub fn voxel_of_world(&self, p: Vec3) -> IVec3 {
        (p * self.state.inv_voxel_size()).floor().as_ivec3()
    }

    pub fn world_of_voxel(&self, v: IVec3) -> Vec3 {
        v.as_vec3() * self.state.voxel_size
    }

    /// Block position owning a voxel coordinate
    pub fn block_of_voxel(v: IVec3) -> IVec3 {
        IVec3::new(
            v.x.div_euclid(BLOCK_SIZE as i32),
            v.y.div_euclid(BLOCK_SIZE as i32),
            v.z.div_euclid(BLOCK_SIZE as i32),
        )
    }

    /// Block position containing a world point
    pub fn block_of_world(&self, p: Vec3) -> IVec3 {
        Self::block_of_voxel(self.voxel_of_world(p))
    }

    /// Linear index of a voxel within its block
    pub fn local_idx(v: IVec3) -> usize {
        let b = BLOCK_SIZE as i32;
        let l = IVec3::new(v.x.rem_euclid(b), v.y.rem_euclid(b), v.z.rem_euclid(b));
        ((l.z * b + l.y) * b + l.x) as usize
    }

    /// Voxel lattice coordinate of a block-local linear index
    pub fn local_pos(idx: usize) -> IVec3 {
        let b = BLOCK_SIZE;
        IVec3::new(
            (idx % b) as i32,
            ((idx / b) % b) as i32,
            (idx / (b * b)) as i32,
        )
    }

    /// Read a voxel by lattice coordinate
    pub fn find_voxel(&self, v: IVec3) -> Option<Voxel> {
        let entry = self.find_entry(Self::block_of_voxel(v))?;
        Some(self.voxels[entry.ptr as usize * BLOCK_SIZE3 + Self::local_idx(v)])
    }

    /// Signed distance at a voxel coordinate, `None` if unobserved
    pub fn sdf_at(&self, v: IVec3) -> Option<f32> {
        let vox = self.find_voxel(v)?;
        vox.observed().then_some(vox.sdf)
    }

    /// Trilinearly interpolated signed distance at a world point.
    /// `None` when any of the eight surrounding voxels is unobserved.
    pub fn sdf_trilinear(&self, p: Vec3) -> Option<f32> {
        let g = p * self.state.inv_voxel_size();
        let base = g.floor().as_ivec3();
        let f = g - g.floor();
        let mut sdf = 0.0;
        for dz in 0..2 {
            for dy in 0..2 {
                for dx in 0..2 {
                    let s = self.sdf_at(base + IVec3::new(dx, dy, dz))?;
                    let w = (if dx == 1 { f.x } else { 1.0 - f.x })
                        * (if dy == 1 { f.y } else { 1.0 - f.y })
                        * (if dz == 1 { f.z } else { 1.0 - f.z });
                    sdf += w * s;
                }
            }
        }
        Some(sdf)
    }

    /// Colour of the voxel nearest to a world point
    pub fn color_nearest(&self, p: Vec3) -> Option<[u8; 3]> {
        let v = (p * self.state.inv_voxel_size()).round().as_ivec3();
        let vox = self.find_voxel(v)?;
        vox.observed().then_some(vox.color)
    }

    pub fn voxels(&self) -> &[Voxel] {
        &self.voxels
    }

    pub fn voxels_mut(&mut self) -> &mut [Voxel] {
        &mut self.voxels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::collections::HashSet;

    fn small_state() -> MapState {
        MapState {
            num_buckets: 64,
            max_num_hash_entries: 96,
            max_num_voxel_blocks: 64,
            ..Default::default()
        }
    }

    /// Find `count` distinct positions all hashing to `bucket`
    fn colliding_positions(map: &VoxelHash, bucket: usize, count: usize) -> Vec<IVec3> {
        let mut found = Vec::new();
        'outer: for x in 0..100 {
            for y in 0..100 {
                let pos = IVec3::new(x, y, 0);
                if map.hash(pos) == bucket {
                    found.push(pos);
                    if found.len() == count {
                        break 'outer;
                    }
                }
            }
        }
        assert_eq!(found.len(), count, "not enough colliding positions");
        found
    }

    #[test]
    fn test_insert_and_lookup() {
        let map = VoxelHash::new(small_state());
        let pos = IVec3::new(3, -2, 7);
        assert!(map.create_block(pos));
        let entry = map.find_entry(pos).unwrap();
        assert!(entry.ptr >= 0);
        assert!(map.find_entry(IVec3::new(9, 9, 9)).is_none());
    }

    #[test]
    fn test_insert_idempotent() {
        let map = VoxelHash::new(small_state());
        let pos = IVec3::new(1, 2, 3);
        assert!(map.create_block(pos));
        let first = map.find_entry(pos).unwrap();
        assert!(map.create_block(pos));
        let second = map.find_entry(pos).unwrap();
        assert_eq!(first.ptr, second.ptr);
        assert_eq!(map.num_allocated_blocks(), 1);
    }

    #[test]
    fn test_collision_chain() {
        let map = VoxelHash::new(small_state());
        let positions = colliding_positions(&map, 0, 3);
        for &pos in &positions {
            assert!(map.create_block(pos));
        }

        // one occupies the primary slot, two chain through the excess region
        let primary = map.entry_at(0);
        assert!(primary.ptr >= 0);
        assert!(primary.next >= 0);
        let second = map.entry_at(map.state().num_buckets + primary.next as usize);
        assert!(second.ptr >= 0);
        assert!(second.next >= 0);
        let third = map.entry_at(map.state().num_buckets + second.next as usize);
        assert!(third.ptr >= 0);
        assert_eq!(third.next, -1);

        let chained: HashSet<IVec3> = [primary.pos, second.pos, third.pos].into();
        assert_eq!(chained, positions.into_iter().collect());
    }

    #[test]
    fn test_unique_positions_invariant() {
        let map = VoxelHash::new(small_state());
        for x in -3..3 {
            for y in -3..3 {
                map.create_block(IVec3::new(x, y, 1));
                map.create_block(IVec3::new(x, y, 1));
            }
        }
        let entries = map.allocated_entries();
        let positions: HashSet<IVec3> = entries.iter().map(|e| e.pos).collect();
        assert_eq!(positions.len(), entries.len());
    }

    #[test]
    fn test_heap_partition_invariant() {
        let map = VoxelHash::new(small_state());
        for x in 0..5 {
            map.create_block(IVec3::new(x, 0, 0));
        }
        let mut indices: Vec<i32> = map.free_heap();
        indices.extend(map.allocated_entries().iter().map(|e| e.ptr));
        indices.sort_unstable();
        let expected: Vec<i32> = (0..map.state().max_num_voxel_blocks as i32).collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn test_exhaustion_is_silent() {
        let state = MapState {
            num_buckets: 64,
            max_num_hash_entries: 96,
            max_num_voxel_blocks: 4,
            ..Default::default()
        };
        let map = VoxelHash::new(state);
        for x in 0..10 {
            map.create_block(IVec3::new(x, 5, 5));
        }
        assert_eq!(map.num_allocated_blocks(), 4);
        assert_eq!(map.dropped_allocations(), 6);
        // a dropped position stays a miss
        assert!(map.find_entry(IVec3::new(9, 5, 5)).is_none());
    }

    #[test]
    fn test_concurrent_insert_unique() {
        let map = VoxelHash::new(MapState {
            num_buckets: 512,
            max_num_hash_entries: 768,
            max_num_voxel_blocks: 512,
            ..Default::default()
        });
        // many workers hammer an overlapping set of positions
        (0..8).into_par_iter().for_each(|_| {
            for x in 0..8 {
                for y in 0..8 {
                    for z in 0..4 {
                        map.create_block(IVec3::new(x, y, z));
                    }
                }
            }
        });
        let entries = map.allocated_entries();
        assert_eq!(entries.len(), 8 * 8 * 4);
        let ptrs: HashSet<i32> = entries.iter().map(|e| e.ptr).collect();
        assert_eq!(ptrs.len(), entries.len(), "block pointers must be unique");
        assert_eq!(map.num_allocated_blocks(), entries.len());
    }

    #[test]
    fn test_reset_restores_capacity() {
        let mut map = VoxelHash::new(small_state());
        for x in 0..10 {
            map.create_block(IVec3::new(x, 1, 1));
        }
        map.reset();
        assert_eq!(map.num_allocated_blocks(), 0);
        assert_eq!(map.free_heap_len(), map.state().max_num_voxel_blocks);
        assert!(map.find_entry(IVec3::new(1, 1, 1)).is_none());
        assert!(map.create_block(IVec3::new(1, 1, 1)));
    }

    #[test]
    fn test_local_indexing_roundtrip() {
        for idx in 0..BLOCK_SIZE3 {
            let pos = VoxelHash::local_pos(idx);
            assert_eq!(VoxelHash::local_idx(pos), idx);
        }
    }

    #[test]
    fn test_negative_block_coordinates() {
        assert_eq!(
            VoxelHash::block_of_voxel(IVec3::new(-1, -8, -9)),
            IVec3::new(-1, -1, -2)
        );
        assert_eq!(VoxelHash::local_idx(IVec3::new(-1, 0, 0)), 7);
    }
}

//! Mip-map bitmask allocator for power-of-two blocks of 64 KiB .. 2 MiB.
//!
//! One reservation is split into fixed-size *mips* of [`TOP_MIP_SIZE`] bytes,
//! committed lazily front to back. Each mip is described by two words over a
//! perfect binary tree of 63 nodes (6 levels, 32 leaves), stored in heap order:
//! node 0 is the whole mip, nodes 1-2 its halves, ... nodes 31-62 the leaves.
//!
//! ```text
//!   mip_mask  bit n set  <=>  subtree n is entirely free
//!   size_mask bit n set  <=>  node n is a live allocation
//! ```
//!
//! Claiming node `n` clears `n`, all its ancestors and all its descendants in
//! one CAS. Freeing sets the subtree back and merges upward while the sibling
//! is free, also in one CAS. Because every transition rewrites the whole word
//! atomically and a node's bits are only ever set again by the thread that
//! holds the lease on that subtree, a stale read can only make a CAS fail,
//! never hand out overlapping ranges.

use super::stats;
use super::vm::{ALLOCATION_GRANULARITY, PlatformVmOps, VmError, VmOps};
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::cell::Cell;
use std::ptr::NonNull;

pub(crate) const NUM_BOTTOM_MIPS: usize = 32;
pub(crate) const MIP_LEVELS: usize = 6;
const NUM_NODES: usize = 2 * NUM_BOTTOM_MIPS - 1;

/// Size of one leaf: the smallest block the mip-map hands out.
pub(crate) const MIP_LEAF_SIZE: usize = ALLOCATION_GRANULARITY;
/// Size of one mip: the largest block the mip-map hands out.
pub const TOP_MIP_SIZE: usize = MIP_LEAF_SIZE * NUM_BOTTOM_MIPS;

const FULL_MASK: u64 = (1u64 << NUM_NODES) - 1;

#[inline]
const fn bit(node: usize) -> u64 {
    1u64 << node
}

#[inline]
const fn level_of(node: usize) -> usize {
    (node + 1).ilog2() as usize
}

#[inline]
const fn first_node(level: usize) -> usize {
    (1 << level) - 1
}

#[inline]
const fn parent(node: usize) -> usize {
    (node - 1) / 2
}

#[inline]
const fn sibling(node: usize) -> usize {
    if node % 2 == 1 { node + 1 } else { node - 1 }
}

#[inline]
const fn node_size(level: usize) -> usize {
    TOP_MIP_SIZE >> level
}

#[inline]
const fn node_offset(node: usize) -> usize {
    let level = level_of(node);
    (node - first_node(level)) * node_size(level)
}

#[inline]
const fn node_at(level: usize, offset: usize) -> usize {
    first_node(level) + offset / node_size(level)
}

/// Bits of every node on one tree level.
const LEVEL_MASKS: [u64; MIP_LEVELS] = {
    let mut masks = [0u64; MIP_LEVELS];
    let mut level = 0;
    while level < MIP_LEVELS {
        let count = 1u32 << level;
        masks[level] = ((1u64 << count) - 1) << first_node(level);
        level += 1;
    }
    masks
};

/// Bits of a node and all its descendants.
const SUBTREE_MASKS: [u64; NUM_NODES] = {
    let mut masks = [0u64; NUM_NODES];
    let mut n = NUM_NODES;
    while n > 0 {
        n -= 1;
        let mut m = bit(n);
        if 2 * n + 2 < NUM_NODES {
            m |= masks[2 * n + 1] | masks[2 * n + 2];
        }
        masks[n] = m;
    }
    masks
};

/// Bits cleared when a node is leased: its subtree plus all its ancestors.
const CLAIM_MASKS: [u64; NUM_NODES] = {
    let mut ancestors = [0u64; NUM_NODES];
    let mut masks = [0u64; NUM_NODES];
    let mut n = 0;
    while n < NUM_NODES {
        if n > 0 {
            ancestors[n] = ancestors[parent(n)] | bit(parent(n));
        }
        masks[n] = ancestors[n] | SUBTREE_MASKS[n];
        n += 1;
    }
    masks
};

thread_local! {
    // Allocation hint only; sharing it between allocator instances is harmless.
    static LAST_MIP: Cell<usize> = const { Cell::new(0) };
}

struct Mip {
    mip_mask: AtomicU64,
    size_mask: AtomicU64,
}

pub(crate) struct MipMapAllocator {
    base: NonNull<u8>,
    reservation: NonNull<u8>,
    reservation_size: usize,
    mips: Box<[Mip]>,
    /// Mips `[0, committed)` are backed and visible to allocation scans.
    committed: AtomicUsize,
    next_free_hint: AtomicUsize,
    /// Serialises growth and garbage collection (the only paths that syscall).
    grow_lock: Mutex<()>,
}

// Safety: the reservation is owned; all shared state is atomics or the mutex.
unsafe impl Send for MipMapAllocator {}
// Safety: see above.
unsafe impl Sync for MipMapAllocator {}

impl MipMapAllocator {
    /// Reserve address space for `reserved_size / TOP_MIP_SIZE` mips.
    /// Nothing is committed until the first allocation.
    pub fn new(reserved_size: usize) -> Result<Self, VmError> {
        let num_mips = reserved_size / TOP_MIP_SIZE;
        if num_mips == 0 {
            return Err(VmError::InitializationFailed(format!(
                "mip-map reserve of {reserved_size} bytes is smaller than one mip ({TOP_MIP_SIZE})"
            )));
        }
        let reservation_size = num_mips
            .checked_mul(TOP_MIP_SIZE)
            .and_then(|s| s.checked_add(ALLOCATION_GRANULARITY))
            .ok_or_else(|| {
                VmError::InitializationFailed("mip-map reservation size overflow".to_string())
            })?;

        // Safety: FFI call to reserve memory.
        let reservation = unsafe { PlatformVmOps::reserve(reservation_size)? };
        let aligned = (reservation.as_ptr() as usize).next_multiple_of(ALLOCATION_GRANULARITY);
        // Safety: aligned address lies inside the reservation.
        let base = unsafe { NonNull::new_unchecked(aligned as *mut u8) };
        stats::TOTAL_RESERVED.add(reservation_size);

        let mips = (0..num_mips)
            .map(|_| Mip {
                mip_mask: AtomicU64::new(0),
                size_mask: AtomicU64::new(0),
            })
            .collect();

        Ok(Self {
            base,
            reservation,
            reservation_size,
            mips,
            committed: AtomicUsize::new(0),
            next_free_hint: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
        })
    }

    /// Largest block size, rounded the way [`allocate`](Self::allocate) rounds.
    #[inline]
    pub fn snap_size(size: usize) -> usize {
        debug_assert!(size <= TOP_MIP_SIZE);
        size.next_power_of_two().max(MIP_LEAF_SIZE)
    }

    #[inline]
    fn level_for(size: usize) -> usize {
        (TOP_MIP_SIZE / Self::snap_size(size)).trailing_zeros() as usize
    }

    #[inline]
    fn mip_base(&self, idx: usize) -> NonNull<u8> {
        // Safety: idx < mips.len(), so the offset stays inside the reservation.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(idx * TOP_MIP_SIZE)) }
    }

    /// True when `ptr` falls inside this allocator's address range.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.mips.len() * TOP_MIP_SIZE
    }

    pub fn committed_mips(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    pub fn capacity_mips(&self) -> usize {
        self.mips.len()
    }

    /// Allocate a block of `snap_size(size)` bytes aligned to its size
    /// (relative to the granularity-aligned base).
    ///
    /// Returns `None` only when every mip in the reservation is committed and
    /// none has a free node at the requested level.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size > 0 && size <= TOP_MIP_SIZE, "mip-map allocate of {size} bytes");
        let level = Self::level_for(size);
        loop {
            let committed = self.committed.load(Ordering::Acquire);
            if let Some(ptr) = self.find_and_claim(level, committed) {
                return Some(ptr);
            }
            if !self.grow(committed) {
                return None;
            }
        }
    }

    fn find_and_claim(&self, level: usize, committed: usize) -> Option<NonNull<u8>> {
        let local = LAST_MIP.with(Cell::get);
        let shared = self.next_free_hint.load(Ordering::Relaxed);
        let hinted = [local, shared].into_iter().filter(|&idx| idx < committed);

        for idx in hinted.chain(0..committed) {
            if let Some(node) = self.claim_in(idx, level) {
                LAST_MIP.with(|hint| hint.set(idx));
                // Safety: node offset stays inside mip `idx`.
                return Some(unsafe {
                    NonNull::new_unchecked(self.mip_base(idx).as_ptr().add(node_offset(node)))
                });
            }
        }
        None
    }

    /// Try to lease a free node at `level` in mip `idx`.
    fn claim_in(&self, idx: usize, level: usize) -> Option<usize> {
        let mip = &self.mips[idx];
        let level_mask = LEVEL_MASKS[level];
        let mut current = mip.mip_mask.load(Ordering::Relaxed);
        loop {
            let available = current & level_mask;
            if available == 0 {
                return None;
            }
            let node = available.trailing_zeros() as usize;
            let next = current & !CLAIM_MASKS[node];
            match mip.mip_mask.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let prev = mip.size_mask.fetch_or(bit(node), Ordering::AcqRel);
                    debug_assert!(prev & bit(node) == 0, "mip {idx} node {node} leased twice");
                    return Some(node);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Commit the next mip. Returns `false` when the reservation is exhausted
    /// or the OS refuses the commit.
    fn grow(&self, seen: usize) -> bool {
        let _guard = self
            .grow_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = self.committed.load(Ordering::Acquire);
        if current != seen {
            // Someone else grew (or trimmed) while we were scanning.
            return true;
        }
        if current >= self.mips.len() {
            return false;
        }

        let ptr = self.mip_base(current);
        // Safety: the mip lies inside our reservation and is not in use.
        if let Err(e) = unsafe { PlatformVmOps::commit(ptr, TOP_MIP_SIZE) } {
            log::warn!("mip-map: committing mip {current} failed: {e}");
            return false;
        }

        let mip = &self.mips[current];
        mip.size_mask.store(0, Ordering::Relaxed);
        mip.mip_mask.store(FULL_MASK, Ordering::Release);
        self.committed.store(current + 1, Ordering::Release);
        self.next_free_hint.store(current, Ordering::Relaxed);

        stats::MIP_MAP_COMMITTED.add(TOP_MIP_SIZE);
        stats::TOTAL_COMMITTED.add(TOP_MIP_SIZE);
        log::debug!("mip-map: committed mip {current} at {ptr:p}");
        true
    }

    /// Split an address into `(mip index, offset inside the mip)`.
    #[inline]
    fn locate(&self, ptr: NonNull<u8>) -> (usize, usize) {
        debug_assert!(self.contains(ptr), "pointer {ptr:p} outside the mip-map");
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        let idx = offset / TOP_MIP_SIZE;
        let in_mip = offset % TOP_MIP_SIZE;
        debug_assert!(
            in_mip.is_multiple_of(MIP_LEAF_SIZE),
            "pointer {ptr:p} is not leaf-aligned"
        );
        (idx, in_mip)
    }

    /// The leased node starting at `offset`, if any. At most one node sharing
    /// a start offset can be leased at a time.
    fn live_node(size_mask: u64, offset: usize) -> Option<usize> {
        (0..MIP_LEVELS)
            .filter(|&level| offset.is_multiple_of(node_size(level)))
            .map(|level| node_at(level, offset))
            .find(|&node| size_mask & bit(node) != 0)
    }

    /// New `mip_mask` after releasing `node`: its subtree becomes free and
    /// parents are marked free while both children are.
    fn merge_free(mask: u64, node: usize) -> u64 {
        let mut merged = mask | SUBTREE_MASKS[node];
        let mut n = node;
        while n != 0 && merged & bit(sibling(n)) != 0 {
            n = parent(n);
            merged |= bit(n);
        }
        merged
    }

    /// Release a block returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this mip-map.
    ///
    /// # Panics
    /// Panics if no live allocation starts at `ptr`.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let (idx, offset) = self.locate(ptr);
        let mip = &self.mips[idx];
        let Some(node) = Self::live_node(mip.size_mask.load(Ordering::Acquire), offset) else {
            panic!("mip-map: free of {ptr:p}, which is not a live allocation");
        };

        // Size bit first: once the tree bits are set the range can be
        // re-leased, and the new lease must not see our stale size bit.
        mip.size_mask.fetch_and(!bit(node), Ordering::AcqRel);

        let mut current = mip.mip_mask.load(Ordering::Relaxed);
        loop {
            let next = Self::merge_free(current, node);
            match mip.mip_mask.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.next_free_hint.store(idx, Ordering::Relaxed);
    }

    /// Size of the live allocation starting at `ptr`.
    ///
    /// # Panics
    /// Panics if no live allocation starts at `ptr`.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> usize {
        let (idx, offset) = self.locate(ptr);
        let mask = self.mips[idx].size_mask.load(Ordering::Acquire);
        match Self::live_node(mask, offset) {
            Some(node) => node_size(level_of(node)),
            None => panic!("mip-map: {ptr:p} is not a live allocation"),
        }
    }

    /// Resize a live allocation without moving it. Shrinking always succeeds;
    /// growing succeeds when the buddies along the way are free and the
    /// block's offset is aligned to the new size.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this mip-map owned by the caller.
    pub unsafe fn try_resize(&self, ptr: NonNull<u8>, new_size: usize) -> bool {
        if new_size == 0 || new_size > TOP_MIP_SIZE {
            return false;
        }
        let (idx, offset) = self.locate(ptr);
        let mip = &self.mips[idx];
        let Some(node) = Self::live_node(mip.size_mask.load(Ordering::Acquire), offset) else {
            return false;
        };
        let level = level_of(node);
        let new_level = Self::level_for(new_size);

        if new_level == level {
            return true;
        }

        if new_level > level {
            // Shrink: keep the first-child descendant at the same offset and
            // hand back the buddies hanging off the path down to it.
            let target = node_at(new_level, offset);
            let mut released = 0;
            let mut n = target;
            while n != node {
                released |= SUBTREE_MASKS[sibling(n)];
                n = parent(n);
            }
            mip.size_mask.fetch_or(bit(target), Ordering::AcqRel);
            mip.size_mask.fetch_and(!bit(node), Ordering::AcqRel);
            mip.mip_mask.fetch_or(released, Ordering::AcqRel);
            return true;
        }

        // Grow: the enclosing node must start at the same offset and every
        // buddy on the path up to it must be free.
        if !offset.is_multiple_of(node_size(new_level)) {
            return false;
        }
        let target = node_at(new_level, offset);
        let mut current = mip.mip_mask.load(Ordering::Relaxed);
        loop {
            let mut n = node;
            while n != target {
                if current & bit(sibling(n)) == 0 {
                    return false;
                }
                n = parent(n);
            }
            let next = current & !CLAIM_MASKS[target];
            match mip.mip_mask.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        mip.size_mask.fetch_or(bit(target), Ordering::AcqRel);
        mip.size_mask.fetch_and(!bit(node), Ordering::AcqRel);
        true
    }

    /// Decommit fully free mips from the tail inward. A free mip below a
    /// live one stays committed. Returns the number of mips decommitted.
    pub fn garbage_collect(&self) -> usize {
        let _guard = self
            .grow_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut released = 0;
        loop {
            let committed = self.committed.load(Ordering::Acquire);
            if committed == 0 {
                break;
            }
            let idx = committed - 1;
            let mip = &self.mips[idx];
            // Taking every bit at once fences off concurrent scanners.
            if mip
                .mip_mask
                .compare_exchange(FULL_MASK, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                break;
            }
            // Safety: the mip is fully free and no longer claimable.
            if let Err(e) = unsafe { PlatformVmOps::decommit(self.mip_base(idx), TOP_MIP_SIZE) } {
                log::warn!("mip-map: decommitting mip {idx} failed: {e}");
                mip.mip_mask.store(FULL_MASK, Ordering::Release);
                break;
            }
            self.committed.store(idx, Ordering::Release);
            stats::sub_saturating(&stats::MIP_MAP_COMMITTED, TOP_MIP_SIZE);
            stats::sub_saturating(&stats::TOTAL_COMMITTED, TOP_MIP_SIZE);
            released += 1;
        }
        if released > 0 {
            log::debug!("mip-map: decommitted {released} trailing mips");
        }
        released
    }
}

impl Drop for MipMapAllocator {
    fn drop(&mut self) {
        let committed = self.committed.load(Ordering::Acquire) * TOP_MIP_SIZE;
        // Safety: we own the reservation; nothing can reference it any more.
        unsafe {
            drop(PlatformVmOps::release(self.reservation, self.reservation_size));
        }
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.reservation_size);
        stats::sub_saturating(&stats::MIP_MAP_COMMITTED, committed);
        stats::sub_saturating(&stats::TOTAL_COMMITTED, committed);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn mips(n: usize) -> MipMapAllocator {
        MipMapAllocator::new(n * TOP_MIP_SIZE).unwrap()
    }

    #[test]
    fn test_mask_tables() {
        let all_levels = LEVEL_MASKS.iter().fold(0, |acc, m| acc | m);
        assert_eq!(all_levels, FULL_MASK);
        assert_eq!(LEVEL_MASKS[MIP_LEVELS - 1].count_ones() as usize, NUM_BOTTOM_MIPS);
        assert_eq!(SUBTREE_MASKS[0], FULL_MASK);
        // A leaf claims itself plus its 5 ancestors.
        assert_eq!(CLAIM_MASKS[NUM_NODES - 1].count_ones(), 6);
        // Claiming the root takes everything.
        assert_eq!(CLAIM_MASKS[0], FULL_MASK);
        assert_eq!(sibling(1), 2);
        assert_eq!(sibling(2), 1);
        assert_eq!(node_offset(NUM_NODES - 1), TOP_MIP_SIZE - MIP_LEAF_SIZE);
        assert_eq!(node_at(5, 3 * MIP_LEAF_SIZE), 34);
    }

    #[test]
    fn test_new_rejects_tiny_reservation() {
        assert!(MipMapAllocator::new(TOP_MIP_SIZE - 1).is_err());
    }

    #[test]
    fn test_allocate_free_leaf() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mm = mips(1);
        assert_eq!(mm.committed_mips(), 0);
        let p = mm.allocate(1).unwrap();
        assert_eq!(mm.committed_mips(), 1);
        assert!((p.as_ptr() as usize).is_multiple_of(MIP_LEAF_SIZE));
        assert_eq!(mm.allocation_size(p), MIP_LEAF_SIZE);
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0x5A, MIP_LEAF_SIZE);
            mm.free(p);
        }
        // Whole mip is free again: a top-size block fits.
        let top = mm.allocate(TOP_MIP_SIZE).unwrap();
        assert_eq!(mm.allocation_size(top), TOP_MIP_SIZE);
        // Safety: Test code.
        unsafe { mm.free(top) };
    }

    #[test]
    fn test_siblings_merge_back() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mm = mips(1);
        let a = mm.allocate(MIP_LEAF_SIZE).unwrap();
        let b = mm.allocate(MIP_LEAF_SIZE).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, MIP_LEAF_SIZE);
        // Root is partially leased.
        assert!(mm.mips[0].mip_mask.load(Ordering::Relaxed) & bit(0) == 0);
        // Safety: Test code.
        unsafe {
            mm.free(a);
            mm.free(b);
        }
        assert_eq!(mm.mips[0].mip_mask.load(Ordering::Relaxed), FULL_MASK);
        assert_eq!(mm.mips[0].size_mask.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mm = mips(2);
        let mut held = Vec::new();
        while let Some(p) = mm.allocate(4 * MIP_LEAF_SIZE) {
            held.push(p);
        }
        assert_eq!(held.len(), 2 * NUM_BOTTOM_MIPS / 4);
        assert_eq!(mm.committed_mips(), 2);
        assert!(mm.allocate(MIP_LEAF_SIZE).is_none());

        for p in held.drain(..) {
            // Safety: Test code.
            unsafe { mm.free(p) };
        }
        while let Some(p) = mm.allocate(4 * MIP_LEAF_SIZE) {
            held.push(p);
        }
        assert_eq!(held.len(), 2 * NUM_BOTTOM_MIPS / 4);
        for p in held {
            // Safety: Test code.
            unsafe { mm.free(p) };
        }
    }

    #[test]
    fn test_random_sequence_never_overlaps() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mm = mips(4);
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut live: Vec<(usize, usize, usize)> = Vec::new(); // (addr, len, requested)

        for _ in 0..4000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let requested = rng.gen_range(1..=TOP_MIP_SIZE / 2);
                if let Some(p) = mm.allocate(requested) {
                    let addr = p.as_ptr() as usize;
                    let len = mm.allocation_size(p);
                    assert_eq!(len, MipMapAllocator::snap_size(requested));
                    assert!(addr.is_multiple_of(MIP_LEAF_SIZE));
                    for &(other, other_len, _) in &live {
                        assert!(
                            addr + len <= other || other + other_len <= addr,
                            "overlap: {addr:#x}+{len:#x} vs {other:#x}+{other_len:#x}"
                        );
                    }
                    live.push((addr, len, requested));
                }
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                let p = NonNull::new(victim.0 as *mut u8).unwrap();
                assert_eq!(mm.allocation_size(p), MipMapAllocator::snap_size(victim.2));
                // Safety: Test code.
                unsafe { mm.free(p) };
            }
        }

        for (addr, _, _) in live {
            // Safety: Test code.
            unsafe { mm.free(NonNull::new(addr as *mut u8).unwrap()) };
        }
        for idx in 0..mm.committed_mips() {
            assert_eq!(mm.mips[idx].mip_mask.load(Ordering::Relaxed), FULL_MASK);
        }
    }

    #[test]
    fn test_try_resize_shrink_and_grow() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mm = mips(1);
        let p = mm.allocate(8 * MIP_LEAF_SIZE).unwrap();
        // Safety: Test code.
        unsafe {
            assert!(mm.try_resize(p, MIP_LEAF_SIZE));
            assert_eq!(mm.allocation_size(p), MIP_LEAF_SIZE);

            // Released buddies are reusable.
            let q = mm.allocate(4 * MIP_LEAF_SIZE).unwrap();
            assert_eq!(q.as_ptr() as usize - p.as_ptr() as usize, 4 * MIP_LEAF_SIZE);

            // Growing into a leased buddy fails, growing into free ones works.
            assert!(!mm.try_resize(p, 8 * MIP_LEAF_SIZE));
            assert!(mm.try_resize(p, 4 * MIP_LEAF_SIZE));
            assert_eq!(mm.allocation_size(p), 4 * MIP_LEAF_SIZE);

            mm.free(q);
            assert!(mm.try_resize(p, TOP_MIP_SIZE));
            assert_eq!(mm.allocation_size(p), TOP_MIP_SIZE);
            mm.free(p);
        }
        assert_eq!(mm.mips[0].mip_mask.load(Ordering::Relaxed), FULL_MASK);
    }

    #[test]
    fn test_try_resize_misaligned_grow_fails() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mm = mips(1);
        let a = mm.allocate(MIP_LEAF_SIZE).unwrap();
        let b = mm.allocate(MIP_LEAF_SIZE).unwrap();
        // Safety: Test code.
        unsafe {
            mm.free(a);
            // `b` is the second leaf: no 2-leaf node starts at its offset.
            assert!(!mm.try_resize(b, 2 * MIP_LEAF_SIZE));
            mm.free(b);
        }
    }

    #[test]
    fn test_garbage_collect_trims_tail_only() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mm = mips(3);
        let a = mm.allocate(TOP_MIP_SIZE).unwrap();
        let b = mm.allocate(TOP_MIP_SIZE).unwrap();
        let c = mm.allocate(TOP_MIP_SIZE).unwrap();
        assert_eq!(mm.committed_mips(), 3);
        // Safety: Test code.
        unsafe {
            mm.free(a);
            mm.free(c);
        }
        // `a` is a hole below the live `b`: only `c` goes.
        assert_eq!(mm.garbage_collect(), 1);
        assert_eq!(mm.committed_mips(), 2);
        // Safety: Test code.
        unsafe { mm.free(b) };
        assert_eq!(mm.garbage_collect(), 2);
        assert_eq!(mm.committed_mips(), 0);

        // Recommits on demand.
        let again = mm.allocate(MIP_LEAF_SIZE).unwrap();
        // Safety: Test code.
        unsafe {
            again.as_ptr().write(1);
            mm.free(again);
        }
    }

    #[test]
    fn test_concurrent_allocate_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mm = Arc::new(mips(4));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mm = mm.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    let mut held = Vec::new();
                    for _ in 0..2000 {
                        if held.len() < 8 && rng.gen_bool(0.6) {
                            let size = MIP_LEAF_SIZE << rng.gen_range(0..3);
                            if let Some(p) = mm.allocate(size) {
                                let tag = (t as u8).wrapping_add(1);
                                // Safety: Test code.
                                unsafe { p.as_ptr().write_bytes(tag, size) };
                                held.push((p.as_ptr() as usize, size, tag));
                            }
                        } else if let Some((addr, size, tag)) = held.pop() {
                            let p = addr as *mut u8;
                            // Safety: Test code.
                            unsafe {
                                assert_eq!(*p, tag);
                                assert_eq!(*p.add(size - 1), tag);
                                mm.free(NonNull::new(p).unwrap());
                            }
                        }
                    }
                    for (addr, _, _) in held {
                        // Safety: Test code.
                        unsafe { mm.free(NonNull::new(addr as *mut u8).unwrap()) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for idx in 0..mm.committed_mips() {
            assert_eq!(mm.mips[idx].mip_mask.load(Ordering::Relaxed), FULL_MASK);
        }
    }
}

//! Debug-build checking wrapper around a [`ThreadCache`].
//!
//! [`CheckedCache`] records every block it hands out in a per-chunk live
//! bitmap (large blocks in a map) and verifies each free against it. Freed
//! memory is filled with [`FREED_POISON`] so stale reads show up as a
//! recognisable pattern. Only allocations made through the same wrapper are
//! known to it; anything else is reported as foreign.

use super::chunk::{CHUNK_SIZE, ChunkHeader};
use super::size_class::block_size;
use super::thread_cache::ThreadCache;
use super::vm::VmError;
use fixedbitset::FixedBitSet;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Byte written over freed blocks.
pub const FREED_POISON: u8 = 0xDD;

struct ChunkBlocks {
    size_class: usize,
    live: FixedBitSet,
}

pub struct CheckedCache<'a> {
    cache: ThreadCache<'a>,
    small: HashMap<usize, ChunkBlocks>,
    large: HashMap<usize, usize>,
}

impl<'a> CheckedCache<'a> {
    pub fn new(cache: ThreadCache<'a>) -> Self {
        Self {
            cache,
            small: HashMap::new(),
            large: HashMap::new(),
        }
    }

    pub fn into_inner(self) -> ThreadCache<'a> {
        self.cache
    }

    /// Number of allocations currently live through this wrapper.
    pub fn live_count(&self) -> usize {
        self.large.len()
            + self
                .small
                .values()
                .map(|chunk| chunk.live.count_ones(..))
                .sum::<usize>()
    }

    /// Chunk base and 1-based block index of a small pointer.
    fn locate_small(ptr: NonNull<u8>) -> (usize, usize, usize) {
        let chunk = ChunkHeader::from_block(ptr);
        // Safety: small blocks always lie inside a mapped chunk.
        let size_class = unsafe {
            ChunkHeader::check_canary(chunk);
            ChunkHeader::size_class(chunk)
        };
        let base = chunk as usize;
        let from_end = base + CHUNK_SIZE - ptr.as_ptr() as usize;
        let bs = block_size(size_class);
        assert!(
            from_end.is_multiple_of(bs) && from_end / bs <= ChunkHeader::blocks_for(size_class),
            "{ptr:p} is not the start of a block (foreign pointer)"
        );
        (base, size_class, from_end / bs)
    }

    fn track(&mut self, ptr: NonNull<u8>) {
        if ChunkHeader::is_chunk_aligned(ptr) {
            let size = self.cache.region_size(ptr);
            let prev = self.large.insert(ptr.as_ptr() as usize, size);
            assert!(prev.is_none(), "large block {ptr:p} handed out twice");
            return;
        }
        let (base, size_class, index) = Self::locate_small(ptr);
        let entry = self.small.entry(base).or_insert_with(|| ChunkBlocks {
            size_class,
            live: FixedBitSet::with_capacity(ChunkHeader::blocks_for(size_class) + 1),
        });
        if entry.size_class != size_class {
            // A chunk only changes class after it emptied.
            assert!(
                entry.live.is_clear(),
                "chunk {base:#x} changed class with live blocks"
            );
            *entry = ChunkBlocks {
                size_class,
                live: FixedBitSet::with_capacity(ChunkHeader::blocks_for(size_class) + 1),
            };
        }
        assert!(!entry.live.contains(index), "block {ptr:p} handed out twice");
        entry.live.insert(index);
    }

    fn untrack(&mut self, ptr: NonNull<u8>) -> usize {
        if ChunkHeader::is_chunk_aligned(ptr) {
            return match self.large.remove(&(ptr.as_ptr() as usize)) {
                Some(size) => size,
                None => panic!("double free or foreign pointer {ptr:p}"),
            };
        }
        let (base, size_class, index) = Self::locate_small(ptr);
        let Some(entry) = self.small.get_mut(&base) else {
            panic!("foreign pointer {ptr:p}: chunk {base:#x} never served this cache");
        };
        assert!(entry.live.contains(index), "double free of {ptr:p}");
        entry.live.set(index, false);
        if entry.live.is_clear() {
            self.small.remove(&base);
        }
        block_size(size_class)
    }

    /// # Errors
    /// As [`ThreadCache::malloc`].
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        let ptr = self.cache.malloc(size)?;
        self.track(ptr);
        Ok(ptr)
    }

    /// Free with checks, poisoning the block first.
    ///
    /// # Safety
    /// As [`ThreadCache::free`]; violations this wrapper can see panic.
    ///
    /// # Panics
    /// On double free, foreign pointers and corrupted chunk headers.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let size = self.untrack(ptr);
        // Safety: the block is live and ours until the free below.
        unsafe {
            ptr.as_ptr().write_bytes(FREED_POISON, size);
            self.cache.free(ptr);
        }
    }

    /// # Errors
    /// As [`ThreadCache::realloc`]; on error tracking is unchanged.
    ///
    /// # Safety
    /// As [`ThreadCache::realloc`].
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, VmError> {
        let Some(old) = ptr else {
            return if size == 0 { Ok(None) } else { self.malloc(size).map(Some) };
        };
        if size == 0 {
            // Safety: forwarded caller contract.
            unsafe { self.free(old) };
            return Ok(None);
        }
        self.untrack(old);
        // Safety: forwarded caller contract.
        match unsafe { self.cache.realloc(Some(old), size) } {
            Ok(Some(new)) => {
                self.track(new);
                Ok(Some(new))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.track(old);
                Err(e)
            }
        }
    }

    pub fn region_size(&self, ptr: NonNull<u8>) -> usize {
        self.cache.region_size(ptr)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::binned::{BinnedAllocator, BinnedAllocatorConfig};
    use crate::memory::mip_map::TOP_MIP_SIZE;
    use crate::memory::size_class::MAX_SMALL_BLOCK_SIZE;

    fn allocator() -> BinnedAllocator {
        BinnedAllocator::with_config(BinnedAllocatorConfig {
            mip_reserved_size: 8 * TOP_MIP_SIZE,
            ..BinnedAllocatorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_tracks_small_and_large() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator();
        let mut checked = CheckedCache::new(allocator.thread_cache());
        let small: Vec<_> = (0..100).map(|_| checked.malloc(48).unwrap()).collect();
        let large = checked.malloc(MAX_SMALL_BLOCK_SIZE + 1).unwrap();
        assert_eq!(checked.live_count(), 101);

        // Safety: Test code.
        unsafe {
            for p in small {
                checked.free(p);
            }
            checked.free(large);
        }
        assert_eq!(checked.live_count(), 0);
    }

    #[test]
    fn test_freed_blocks_are_poisoned() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator();
        let mut checked = CheckedCache::new(allocator.thread_cache());
        let keep = checked.malloc(64).unwrap();
        let p = checked.malloc(64).unwrap();
        // Safety: Test code. The chunk stays mapped while `keep` is live.
        unsafe {
            p.as_ptr().write_bytes(0x42, 64);
            checked.free(p);
            // The first word now links the free list.
            for i in size_of::<usize>()..64 {
                assert_eq!(*p.as_ptr().add(i), FREED_POISON);
            }
            checked.free(keep);
        }
    }

    #[test]
    fn test_realloc_moves_tracking() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator();
        let mut checked = CheckedCache::new(allocator.thread_cache());
        let p = checked.malloc(24).unwrap();
        // Safety: Test code.
        unsafe {
            let q = checked.realloc(Some(p), 5000).unwrap().unwrap();
            assert_eq!(checked.live_count(), 1);
            assert_eq!(checked.realloc(Some(q), 0).unwrap(), None);
        }
        assert_eq!(checked.live_count(), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_is_caught() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator();
        let mut checked = CheckedCache::new(allocator.thread_cache());
        // Keeps the chunk's live bitmap around.
        let _keep = checked.malloc(32).unwrap();
        let p = checked.malloc(32).unwrap();
        // Safety: Test code.
        unsafe {
            checked.free(p);
            checked.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "double free or foreign pointer")]
    fn test_large_double_free_is_caught() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator();
        let mut checked = CheckedCache::new(allocator.thread_cache());
        let p = checked.malloc(200_000).unwrap();
        // Safety: Test code.
        unsafe {
            checked.free(p);
            checked.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "foreign pointer")]
    fn test_foreign_pointer_is_caught() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator();
        let mut other = allocator.thread_cache();
        let mut checked = CheckedCache::new(allocator.thread_cache());
        let stranger = other.malloc(32).unwrap();
        // Safety: Test code.
        unsafe { checked.free(stranger) };
    }

    #[test]
    #[should_panic(expected = "not the start of a block")]
    fn test_interior_pointer_is_caught() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator();
        let mut checked = CheckedCache::new(allocator.thread_cache());
        let p = checked.malloc(64).unwrap();
        // Safety: Test code.
        unsafe { checked.free(p.add(8)) };
    }
}

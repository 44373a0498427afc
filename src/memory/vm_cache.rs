use super::stats;
use super::vm::{ALLOCATION_GRANULARITY, PlatformVmOps, VmError, VmOps};
use crate::sync::Mutex;
use std::ptr::NonNull;

/// A recently freed large region kept for exact-size reuse.
struct CachedRegion {
    ptr: NonNull<u8>,
    size: usize,
    /// Decommitted while cached; must be recommitted before reuse.
    protected: bool,
}

struct VmCacheState {
    /// Oldest first. Eviction removes from the front.
    regions: Vec<CachedRegion>,
    cached_bytes: usize,
}

// Safety: the state owns the cached regions; access is serialised by the mutex.
unsafe impl Send for VmCacheState {}

/// FIFO pool of large OS regions, matched by exact size.
///
/// Bounded both by entry count and by total cached bytes. The lock covers
/// only the vector; every provider call happens outside it.
pub(crate) struct VmCache {
    state: Mutex<VmCacheState>,
    max_blocks: usize,
    max_bytes: usize,
    protect: bool,
}

impl VmCache {
    pub fn new(max_blocks: usize, max_bytes: usize, protect: bool) -> Self {
        Self {
            state: Mutex::new(VmCacheState {
                regions: Vec::with_capacity(max_blocks),
                cached_bytes: 0,
            }),
            max_blocks,
            max_bytes,
            protect,
        }
    }

    fn lock(&self) -> crate::sync::MutexGuard<'_, VmCacheState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn take_exact(&self, size: usize) -> Option<CachedRegion> {
        let mut state = self.lock();
        let idx = state.regions.iter().position(|r| r.size == size)?;
        let region = state.regions.remove(idx);
        state.cached_bytes -= region.size;
        stats::sub_saturating(&stats::VM_CACHE_CACHED, region.size);
        Some(region)
    }

    /// Get a committed region of exactly `size` bytes (a multiple of the
    /// allocation granularity), aligned to the granularity.
    ///
    /// A provider failure empties the cache and retries once.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(size.is_multiple_of(ALLOCATION_GRANULARITY));
        if let Some(region) = self.take_exact(size) {
            if !region.protected {
                return Ok(region.ptr);
            }
            // Safety: the region is ours and was decommitted on insertion.
            match unsafe { PlatformVmOps::commit(region.ptr, region.size) } {
                Ok(()) => return Ok(region.ptr),
                Err(e) => {
                    log::warn!("vm cache: recommitting {} bytes failed: {e}", region.size);
                    Self::release_region(region.ptr, region.size);
                }
            }
        }

        // Safety: fresh mapping from the provider.
        let first = unsafe { PlatformVmOps::alloc_aligned(size, ALLOCATION_GRANULARITY) };
        let ptr = match first {
            Ok(ptr) => ptr,
            Err(e) => {
                let released = self.release_all();
                log::warn!(
                    "vm cache: mapping {size} bytes failed ({e}); released {released} cached bytes and retrying"
                );
                // Safety: fresh mapping from the provider.
                unsafe { PlatformVmOps::alloc_aligned(size, ALLOCATION_GRANULARITY)? }
            }
        };
        stats::TOTAL_COMMITTED.add(size);
        Ok(ptr)
    }

    /// Return a region obtained from [`allocate`](Self::allocate).
    ///
    /// Regions larger than the byte budget go straight back to the provider;
    /// otherwise the oldest entries are evicted until the new one fits.
    ///
    /// # Safety
    /// `ptr` must be a live region of exactly `size` bytes from this cache.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        if self.max_blocks == 0 || size > self.max_bytes {
            Self::release_region(ptr, size);
            return;
        }

        let mut protected = false;
        if self.protect {
            // Safety: caller hands us the region.
            match unsafe { PlatformVmOps::decommit(ptr, size) } {
                Ok(()) => protected = true,
                Err(e) => log::warn!("vm cache: decommitting {size} bytes failed: {e}"),
            }
        }

        let mut evicted = Vec::new();
        {
            let mut state = self.lock();
            while !state.regions.is_empty()
                && (state.regions.len() >= self.max_blocks
                    || state.cached_bytes + size > self.max_bytes)
            {
                let oldest = state.regions.remove(0);
                state.cached_bytes -= oldest.size;
                evicted.push(oldest);
            }
            state.cached_bytes += size;
            state.regions.push(CachedRegion {
                ptr,
                size,
                protected,
            });
        }
        stats::VM_CACHE_CACHED.add(size);

        for region in evicted {
            log::trace!("vm cache: evicting {} bytes at {:p}", region.size, region.ptr);
            stats::sub_saturating(&stats::VM_CACHE_CACHED, region.size);
            Self::release_region(region.ptr, region.size);
        }
    }

    /// Release every cached region to the provider. Returns the bytes released.
    pub fn release_all(&self) -> usize {
        let regions = {
            let mut state = self.lock();
            state.cached_bytes = 0;
            std::mem::take(&mut state.regions)
        };
        let mut released = 0;
        for region in regions {
            stats::sub_saturating(&stats::VM_CACHE_CACHED, region.size);
            Self::release_region(region.ptr, region.size);
            released += region.size;
        }
        released
    }

    pub fn cached_bytes(&self) -> usize {
        self.lock().cached_bytes
    }

    pub fn cached_regions(&self) -> usize {
        self.lock().regions.len()
    }

    pub fn release_region(ptr: NonNull<u8>, size: usize) {
        // Safety: the region came from alloc_aligned and nothing references it.
        if let Err(e) = unsafe { PlatformVmOps::free_aligned(ptr, size) } {
            log::warn!("vm cache: releasing {size} bytes at {ptr:p} failed: {e}");
        }
        stats::sub_saturating(&stats::TOTAL_COMMITTED, size);
    }
}

impl Drop for VmCache {
    fn drop(&mut self) {
        self.release_all();
    }
}

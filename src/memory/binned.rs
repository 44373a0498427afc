use super::chunk::{CHUNK_SIZE, ChunkHeader, ChunkState};
use super::global_cache::GlobalCache;
use super::mip_map::{MipMapAllocator, TOP_MIP_SIZE};
use super::size_class::{MAX_SMALL_BLOCK_SIZE, MIN_ALIGN, block_size, snap_size};
use super::stats;
use super::thread_cache::ThreadCache;
use super::vm::VmError;
use super::vm_cache::VmCache;
use crate::sync::cell::{Cell, UnsafeCell};
use crate::sync::{Mutex, MutexGuard, OnceLock, RwLock};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::PoisonError;

pub(crate) const MIP_RESERVED_SIZE: usize = 1024 * 1024 * 1024;

/// Configuration for `BinnedAllocator`. All fields have sensible defaults.
/// Set at init time via `BinnedAllocator::with_config()`.
#[derive(Clone, Debug)]
pub struct BinnedAllocatorConfig {
    /// Address space reserved for the mip-map, which backs every chunk and
    /// every block up to 2 MiB. Rounded down to whole mips. Default: 1 GiB.
    pub mip_reserved_size: usize,

    /// Empty chunks a thread keeps for instant reuse. One more ships the
    /// whole stash to the global cache as a batch. Default: 16.
    pub max_free_chunks: usize,

    /// Batches the global cache holds. Further batches are released to the
    /// mip-map. Default: 16.
    pub max_free_batches: usize,

    /// Entries in the large-region VM cache. Default: 32.
    pub vm_cache_blocks: usize,

    /// Byte budget of the large-region VM cache. Default: 64 MiB.
    pub vm_cache_max_bytes: usize,

    /// Decommit regions while they sit in the VM cache so that stray
    /// accesses fault. Default: on in debug builds.
    pub protect_cached_regions: bool,
}

impl Default for BinnedAllocatorConfig {
    fn default() -> Self {
        Self {
            mip_reserved_size: MIP_RESERVED_SIZE,
            max_free_chunks: 16,
            max_free_batches: 16,
            vm_cache_blocks: 32,
            vm_cache_max_bytes: 64 * 1024 * 1024,
            protect_cached_regions: cfg!(debug_assertions),
        }
    }
}

/// Called with the request size whenever an allocation fails for lack of
/// memory, before the error is returned.
pub type OomHandler = fn(usize);

crate::sync::static_rwlock! {
    static OOM_HANDLER: RwLock<Option<OomHandler>> = RwLock::new(None);
}

/// Install (or clear) the process-wide out-of-memory hook.
pub fn set_oom_handler(handler: Option<OomHandler>) {
    *OOM_HANDLER.write().unwrap_or_else(PoisonError::into_inner) = handler;
}

/// What a [`BinnedAllocator::trim`] gave back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrimStats {
    pub chunks_unmapped: usize,
    pub vm_cache_bytes_released: usize,
    pub mips_decommitted: usize,
}

/// Size-class allocator shared by all threads.
///
/// Small requests go through a per-thread [`ThreadCache`]; blocks up to
/// 2 MiB come straight from the mip-map; anything larger from the VM cache.
pub struct BinnedAllocator {
    config: BinnedAllocatorConfig,
    mip: MipMapAllocator,
    global: GlobalCache,
    vm_cache: VmCache,
    /// Live regions above `TOP_MIP_SIZE`: address to size.
    huge: Mutex<HashMap<usize, usize>>,
}

impl BinnedAllocator {
    /// Create a new `BinnedAllocator` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the address space reservation fails.
    pub fn new() -> Result<Self, VmError> {
        Self::with_config(BinnedAllocatorConfig::default())
    }

    /// Create a `BinnedAllocator` with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if `mip_reserved_size` holds
    /// less than one mip, or the reservation error from the OS.
    pub fn with_config(config: BinnedAllocatorConfig) -> Result<Self, VmError> {
        let mip = MipMapAllocator::new(config.mip_reserved_size)?;
        log::debug!(
            "binned allocator: reserved {} mips of {} bytes",
            mip.capacity_mips(),
            TOP_MIP_SIZE
        );
        Ok(Self {
            global: GlobalCache::new(config.max_free_batches),
            vm_cache: VmCache::new(
                config.vm_cache_blocks,
                config.vm_cache_max_bytes,
                config.protect_cached_regions,
            ),
            huge: Mutex::new(HashMap::new()),
            mip,
            config,
        })
    }

    pub fn config(&self) -> &BinnedAllocatorConfig {
        &self.config
    }

    /// A cache for the calling thread. Keep one per thread and drop it when
    /// the thread is done allocating.
    pub fn thread_cache(&self) -> ThreadCache<'_> {
        ThreadCache::new(self)
    }

    pub(crate) fn global_cache(&self) -> &GlobalCache {
        &self.global
    }

    fn huge_regions(&self) -> MutexGuard<'_, HashMap<usize, usize>> {
        self.huge.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report exhaustion to the hook and build the error to return.
    pub(crate) fn out_of_memory(&self, size: usize) -> VmError {
        log::warn!(
            "binned allocator: out of memory for {size} bytes ({} of {} mips committed)",
            self.mip.committed_mips(),
            self.mip.capacity_mips()
        );
        let handler = *OOM_HANDLER.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = handler {
            handler(size);
        }
        VmError::OutOfMemory { size }
    }

    /// Carve a fresh chunk out of the mip-map.
    pub(crate) fn map_chunk(&self) -> Result<NonNull<u8>, VmError> {
        let Some(base) = self.mip.allocate(CHUNK_SIZE) else {
            return Err(self.out_of_memory(CHUNK_SIZE));
        };
        stats::CHUNKS_MAPPED.add(1);
        log::debug!("binned allocator: mapped chunk {base:p}");
        Ok(base)
    }

    unsafe fn unmap_chunk(&self, chunk: *mut ChunkHeader) {
        // Safety: caller hands over an empty chunk nobody references.
        unsafe {
            debug_assert_eq!(ChunkHeader::state(chunk), ChunkState::Free);
            self.mip.free(ChunkHeader::base(chunk));
        }
        stats::sub_saturating(&stats::CHUNKS_MAPPED, 1);
    }

    /// Release every chunk of a batch. Returns how many there were.
    unsafe fn unmap_batch(&self, batch: *mut ChunkHeader) -> usize {
        let mut count = 0;
        let mut chunk = batch;
        while !chunk.is_null() {
            // Safety: batch chunks are linked through `next` and owned by us.
            unsafe {
                let next = (*chunk).next;
                self.unmap_chunk(chunk);
                chunk = next;
            }
            count += 1;
        }
        count
    }

    /// Offer a batch of empty chunks to the global cache, releasing it to the
    /// mip-map when the cache is full.
    pub(crate) unsafe fn recycle_batch(&self, batch: *mut ChunkHeader) {
        // Safety: caller hands over a well-formed batch.
        unsafe {
            if let Some(rejected) = self.global.push_batch(batch) {
                let count = self.unmap_batch(rejected);
                log::debug!("binned allocator: global cache full, released {count} chunks");
            }
        }
    }

    /// Allocate a block above the small-object range.
    pub(crate) fn malloc_large(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        let snapped = snap_size(size);
        if snapped <= TOP_MIP_SIZE {
            return self.mip.allocate(snapped).ok_or_else(|| self.out_of_memory(size));
        }
        if snapped == usize::MAX {
            return Err(self.out_of_memory(size));
        }
        let ptr = self.vm_cache.allocate(snapped).map_err(|e| {
            log::warn!("binned allocator: large region of {snapped} bytes failed: {e}");
            self.out_of_memory(size)
        })?;
        self.huge_regions().insert(ptr.as_ptr() as usize, snapped);
        stats::LARGE_REGIONS_COMMITTED.add(snapped);
        Ok(ptr)
    }

    /// Free a chunk-aligned pointer from [`malloc_large`](Self::malloc_large).
    ///
    /// # Safety
    /// `ptr` must be live.
    ///
    /// # Panics
    /// Panics if `ptr` was not allocated by this allocator.
    pub(crate) unsafe fn free_large(&self, ptr: NonNull<u8>) {
        if self.mip.contains(ptr) {
            // Safety: forwarded caller contract.
            unsafe { self.mip.free(ptr) };
            return;
        }
        let Some(size) = self.huge_regions().remove(&(ptr.as_ptr() as usize)) else {
            panic!("free of {ptr:p}, which this allocator did not allocate");
        };
        stats::sub_saturating(&stats::LARGE_REGIONS_COMMITTED, size);
        // Safety: the region was ours and is now unreferenced.
        unsafe { self.vm_cache.free(ptr, size) };
    }

    pub(crate) fn large_region_size(&self, ptr: NonNull<u8>) -> usize {
        if self.mip.contains(ptr) {
            return self.mip.allocation_size(ptr);
        }
        match self.huge_regions().get(&(ptr.as_ptr() as usize)) {
            Some(&size) => size,
            None => panic!("{ptr:p} was not allocated by this allocator"),
        }
    }

    /// Resize a large block in place when both sizes fit a mip.
    pub(crate) unsafe fn try_resize_large(&self, ptr: NonNull<u8>, old_size: usize, new_size: usize) -> bool {
        old_size <= TOP_MIP_SIZE
            && new_size <= TOP_MIP_SIZE
            && self.mip.contains(ptr)
            // Safety: forwarded caller contract.
            && unsafe { self.mip.try_resize(ptr, new_size) }
    }

    /// Usable size of a live allocation; equals `snap_size` of the request.
    pub fn region_size(&self, ptr: NonNull<u8>) -> usize {
        if ChunkHeader::is_chunk_aligned(ptr) {
            self.large_region_size(ptr)
        } else {
            // Safety: a small block always lies in a mapped chunk.
            block_size(unsafe { ChunkHeader::size_class(ChunkHeader::from_block(ptr)) })
        }
    }

    /// Give cached memory back: global chunk batches to the mip-map, the VM
    /// cache to the OS, then trailing free mips to the OS.
    ///
    /// Thread-local stashes are not touched; see [`ThreadCache::trim`].
    pub fn trim(&self) -> TrimStats {
        let mut trimmed = TrimStats {
            chunks_unmapped: self.release_global_batches(),
            ..TrimStats::default()
        };
        trimmed.vm_cache_bytes_released = self.vm_cache.release_all();
        trimmed.mips_decommitted = self.mip.garbage_collect();
        log::debug!("binned allocator: trim {trimmed:?}");
        trimmed
    }

    fn release_global_batches(&self) -> usize {
        let mut released = 0;
        let mut batch = self.global.take_batches();
        while !batch.is_null() {
            // Safety: detached batches are ours.
            unsafe {
                let next = (*batch).next_batch;
                released += self.unmap_batch(batch);
                batch = next;
            }
        }
        released
    }

    /// Chunks whose owning thread exited while they still had live blocks.
    pub fn dangling_chunk_count(&self) -> usize {
        self.global.dangling_count()
    }

    pub fn free_batch_count(&self) -> usize {
        self.global.free_batch_count()
    }

    pub fn committed_mips(&self) -> usize {
        self.mip.committed_mips()
    }
}

impl Drop for BinnedAllocator {
    fn drop(&mut self) {
        // Chunks and mip blocks die with the reservation; huge regions are
        // separate mappings.
        self.release_global_batches();
        stats::sub_saturating(&stats::CHUNKS_MAPPED, self.global.dangling_count());
        let leaked = std::mem::take(&mut *self.huge_regions());
        if !leaked.is_empty() {
            log::debug!("binned allocator: releasing {} leaked large regions", leaked.len());
        }
        for (addr, size) in leaked {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                stats::sub_saturating(&stats::LARGE_REGIONS_COMMITTED, size);
                VmCache::release_region(ptr, size);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide instance
// ---------------------------------------------------------------------------

static GLOBAL_BINNED_INSTANCE: OnceLock<BinnedAllocator> = OnceLock::new();

thread_local! {
    static GLOBAL_THREAD_CACHE: ThreadCacheHandle = ThreadCacheHandle::new();
}

/// Per-thread slot for the global allocator's cache.
///
/// # Safety
///
/// `cache` is only reached from the owning thread, and `busy` rejects
/// re-entry, so at most one `&mut` to it exists at a time.
struct ThreadCacheHandle {
    cache: UnsafeCell<Option<ThreadCache<'static>>>,
    busy: Cell<bool>,
}

impl ThreadCacheHandle {
    fn new() -> Self {
        Self {
            cache: UnsafeCell::new(None),
            busy: Cell::new(false),
        }
    }

    fn run<R>(
        &self,
        allocator: &'static BinnedAllocator,
        f: &mut impl FnMut(&mut ThreadCache<'static>) -> R,
    ) -> R {
        assert!(!self.busy.get(), "re-entrant call into the global binned allocator");
        self.busy.set(true);
        let _busy = BusyGuard(&self.busy);
        // Safety: single-threaded TLS access, exclusive thanks to `busy`.
        let slot = crate::sync::unsafe_cell_get_mut!(self.cache);
        f(slot.get_or_insert_with(|| allocator.thread_cache()))
    }
}

struct BusyGuard<'a>(&'a Cell<bool>);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// The process-wide [`BinnedAllocator`], with a thread cache bound to each
/// calling thread.
pub struct GlobalBinned;

impl GlobalBinned {
    /// Initialize the global allocator.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the allocator is already initialized
    /// or if the underlying reservation fails.
    pub fn init() -> Result<(), VmError> {
        Self::init_with_config(BinnedAllocatorConfig::default())
    }

    /// Initialize the global allocator with an explicit configuration.
    ///
    /// # Errors
    ///
    /// See [`init`](Self::init).
    pub fn init_with_config(config: BinnedAllocatorConfig) -> Result<(), VmError> {
        GLOBAL_BINNED_INSTANCE
            .set(BinnedAllocator::with_config(config)?)
            .map_err(|_| VmError::InitializationFailed("Already initialized".to_string()))
    }

    /// Returns a reference to the initialized global allocator.
    ///
    /// # Panics
    ///
    /// Panics if the global allocator has not been initialized via [`init`](Self::init).
    pub fn get() -> &'static BinnedAllocator {
        GLOBAL_BINNED_INSTANCE
            .get()
            .expect("GlobalBinned not initialized")
    }

    pub fn is_initialized() -> bool {
        GLOBAL_BINNED_INSTANCE.get().is_some()
    }

    /// Run `f` on the calling thread's cache. Once the thread-local has been
    /// destroyed (calls from other TLS destructors) a temporary cache is used.
    fn with_cache<R>(mut f: impl FnMut(&mut ThreadCache<'static>) -> R) -> R {
        let allocator = Self::get();
        GLOBAL_THREAD_CACHE
            .try_with(|handle| handle.run(allocator, &mut f))
            .unwrap_or_else(|_| {
                let mut cache = allocator.thread_cache();
                f(&mut cache)
            })
    }

    /// # Errors
    ///
    /// Returns `VmError::OutOfMemory` on exhaustion.
    pub fn malloc(size: usize) -> Result<NonNull<u8>, VmError> {
        Self::with_cache(|cache| cache.malloc(size))
    }

    /// # Safety
    /// `ptr` must come from this global allocator and not be freed twice.
    pub unsafe fn free(ptr: NonNull<u8>) {
        // Safety: forwarded caller contract.
        Self::with_cache(|cache| unsafe { cache.free(ptr) });
    }

    /// # Errors
    ///
    /// Returns `VmError::OutOfMemory` when the block must move and no memory
    /// is left; the original stays valid.
    ///
    /// # Safety
    /// `ptr`, when given, must be a live allocation of this global allocator.
    pub unsafe fn realloc(ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>, VmError> {
        // Safety: forwarded caller contract.
        Self::with_cache(|cache| unsafe { cache.realloc(ptr, size) })
    }

    pub fn region_size(ptr: NonNull<u8>) -> usize {
        Self::get().region_size(ptr)
    }

    /// Trim the calling thread's cache and the global caches.
    ///
    /// Other threads' stashes are flushed when those threads trim or exit.
    pub fn trim() -> TrimStats {
        Self::with_cache(ThreadCache::trim);
        Self::get().trim()
    }
}

/// Raw `Layout` interface over the global instance.
///
/// Alignments up to 16 take the normal path. Larger ones, up to the chunk
/// size, are served from the chunk-aligned large path; anything stricter
/// fails. The allocator's own bookkeeping allocates through the system
/// heap, so this cannot serve as the `#[global_allocator]`.
// Safety: Implementation follows GlobalAlloc contract.
unsafe impl std::alloc::GlobalAlloc for GlobalBinned {
    unsafe fn alloc(&self, layout: std::alloc::Layout) -> *mut u8 {
        if !Self::is_initialized() || layout.align() > CHUNK_SIZE {
            return std::ptr::null_mut();
        }
        let size = if layout.align() <= MIN_ALIGN {
            layout.size().max(1)
        } else {
            layout.size().max(MAX_SMALL_BLOCK_SIZE + 1)
        };
        match Self::malloc(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: std::alloc::Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Safety: ptr came from `alloc` above.
            unsafe { Self::free(ptr) };
        }
    }
}

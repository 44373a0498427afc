//! Per-thread small-object cache.
//!
//! A [`ThreadCache`] holds one [`Bucket`] per size class, a stash of empty
//! chunks, and a shared part that other threads free into. Chunks in a
//! bucket are owned by this thread and mutated without locks; a block freed
//! by another thread is parked on the owner's dangling list and reclaimed the
//! next time the owner calls into the cache.
//!
//! Lock order: chunk lock, then dangling list (try-lock only), and chunk
//! lock, then global cache.

use super::binned::BinnedAllocator;
use super::chunk::{ChunkHeader, ChunkState, FreeBlock};
use super::size_class::{MAX_SMALL_BLOCK_SIZE, NUM_SMALL_CLASSES, block_size, small_class, snap_size};
use super::vm::VmError;
use crate::sync::SpinMutex;
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::sync::hint;
use std::ptr::{self, NonNull};

struct DanglingBlocks {
    head: *mut FreeBlock,
}

// Safety: the list is only walked by the owning thread after detaching it.
unsafe impl Send for DanglingBlocks {}

impl DanglingBlocks {
    unsafe fn push(&mut self, ptr: NonNull<u8>) {
        let block = ptr.as_ptr().cast::<FreeBlock>();
        // Safety: the block is free; its first word is ours to link.
        unsafe { (*block).next = self.head };
        self.head = block;
    }
}

/// The part of a thread cache other threads may touch.
///
/// Reachable through `ChunkState::Owned` only while the chunk lock is held;
/// the owner orphans every chunk under its lock before dropping this.
pub(crate) struct ThreadShared {
    dangling: SpinMutex<DanglingBlocks>,
    /// Blocks pushed since the last drain. Polled without the lock.
    pending: AtomicUsize,
}

/// Per-size-class list of chunks owned by one thread.
///
/// The head chunk's free list, high-water mark and in-use count are mirrored
/// here; the header copies are stale until written back.
struct Bucket {
    used_chunks: *mut ChunkHeader,
    free_blocks: *mut FreeBlock,
    highest_index: u32,
    num_blocks_total: u32,
    num_blocks_in_use: u32,
    /// Free blocks across every chunk in the list.
    num_blocks_available: usize,
    num_chunks: usize,
    block_size: usize,
}

impl Bucket {
    fn new(size_class: usize) -> Self {
        Self {
            used_chunks: ptr::null_mut(),
            free_blocks: ptr::null_mut(),
            highest_index: 0,
            num_blocks_total: 0,
            num_blocks_in_use: 0,
            num_blocks_available: 0,
            num_chunks: 0,
            block_size: block_size(size_class),
        }
    }

    #[inline]
    fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = if !self.free_blocks.is_null() {
            let block = self.free_blocks;
            // Safety: entries of the mirrored list are free blocks of the head.
            self.free_blocks = unsafe { (*block).next };
            block
        } else if self.highest_index < self.num_blocks_total {
            self.highest_index += 1;
            // Safety: index is within the head chunk's capacity.
            unsafe { ChunkHeader::block_at(self.used_chunks, self.highest_index, self.block_size) }
        } else {
            return None;
        };
        self.num_blocks_in_use += 1;
        self.num_blocks_available -= 1;
        NonNull::new(block.cast())
    }

    /// Push a block of the head chunk. Returns true when the head is now empty.
    #[inline]
    unsafe fn push(&mut self, ptr: NonNull<u8>) -> bool {
        let block = ptr.as_ptr().cast::<FreeBlock>();
        // Safety: the block belongs to the head and is no longer in use.
        unsafe { (*block).next = self.free_blocks };
        self.free_blocks = block;
        self.num_blocks_in_use -= 1;
        self.num_blocks_available += 1;
        self.num_blocks_in_use == 0
    }

    #[inline]
    fn head_available(&self) -> usize {
        (self.num_blocks_total - self.num_blocks_in_use) as usize
    }

    unsafe fn load_mirror(&mut self, chunk: *mut ChunkHeader) {
        // Safety: caller owns the chunk.
        unsafe {
            self.num_blocks_total = ChunkHeader::num_blocks_total(chunk);
            (self.free_blocks, self.highest_index, self.num_blocks_in_use) =
                ChunkHeader::take_mirror(chunk);
        }
    }

    unsafe fn write_back(&mut self) {
        if self.used_chunks.is_null() {
            return;
        }
        // Safety: the head is owned by this thread.
        unsafe {
            ChunkHeader::restore_mirror(
                self.used_chunks,
                self.free_blocks,
                self.highest_index,
                self.num_blocks_in_use,
            );
        }
        self.free_blocks = ptr::null_mut();
        self.highest_index = 0;
        self.num_blocks_total = 0;
        self.num_blocks_in_use = 0;
    }

    unsafe fn detach(&mut self, chunk: *mut ChunkHeader) {
        // Safety: chunk is in this list; neighbours are owned by this thread.
        unsafe {
            let prev = (*chunk).prev;
            let next = (*chunk).next;
            if prev.is_null() {
                self.used_chunks = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*chunk).prev = ptr::null_mut();
            (*chunk).next = ptr::null_mut();
        }
        self.num_chunks -= 1;
    }

    unsafe fn attach_front(&mut self, chunk: *mut ChunkHeader) {
        debug_assert!(self.free_blocks.is_null() && self.num_blocks_total == 0, "mirror not written back");
        // Safety: chunk is owned by this thread and in no other list.
        unsafe {
            (*chunk).prev = ptr::null_mut();
            (*chunk).next = self.used_chunks;
            if !self.used_chunks.is_null() {
                (*self.used_chunks).prev = chunk;
            }
            self.used_chunks = chunk;
            self.load_mirror(chunk);
        }
        self.num_chunks += 1;
    }

    /// Add an owned, unlisted chunk. It becomes head when the bucket is
    /// empty or `as_head` is set.
    unsafe fn add_chunk(&mut self, chunk: *mut ChunkHeader, as_head: bool) {
        // Safety: caller owns the chunk.
        unsafe {
            self.num_blocks_available += ChunkHeader::available(chunk);
            if self.used_chunks.is_null() || as_head {
                self.write_back();
                self.attach_front(chunk);
            } else {
                let head = self.used_chunks;
                (*chunk).prev = head;
                (*chunk).next = (*head).next;
                if !(*head).next.is_null() {
                    (*(*head).next).prev = chunk;
                }
                (*head).next = chunk;
                self.num_chunks += 1;
            }
        }
    }

    /// Make a non-head chunk the head.
    unsafe fn promote(&mut self, chunk: *mut ChunkHeader) {
        debug_assert_ne!(chunk, self.used_chunks);
        // Safety: chunk is in this list.
        unsafe {
            self.write_back();
            self.detach(chunk);
            self.attach_front(chunk);
        }
    }

    /// Unlink the (empty) head and mirror the remaining chunk with the most
    /// free blocks.
    unsafe fn retire_head(&mut self) -> *mut ChunkHeader {
        let chunk = self.used_chunks;
        debug_assert_eq!(self.num_blocks_in_use, 0);
        // Safety: head is owned by this thread; the rest of the list is
        // unmirrored, so header counts are current.
        unsafe {
            self.write_back();
            self.num_blocks_available -= ChunkHeader::available(chunk);
            self.detach(chunk);
            let best = Self::most_available(self.used_chunks);
            if best == self.used_chunks {
                if !best.is_null() {
                    self.load_mirror(best);
                }
            } else {
                self.detach(best);
                self.attach_front(best);
            }
        }
        chunk
    }

    unsafe fn most_available(mut chunk: *mut ChunkHeader) -> *mut ChunkHeader {
        let mut best = chunk;
        let mut best_available = 0;
        while !chunk.is_null() {
            // Safety: caller passes an unmirrored list owned by this thread.
            unsafe {
                let available = ChunkHeader::available(chunk);
                if available > best_available {
                    best = chunk;
                    best_available = available;
                }
                chunk = (*chunk).next;
            }
        }
        best
    }

    /// Unlink an empty non-head chunk.
    unsafe fn remove(&mut self, chunk: *mut ChunkHeader) {
        // Safety: chunk is in this list and unmirrored.
        unsafe {
            self.num_blocks_available -= ChunkHeader::available(chunk);
            self.detach(chunk);
        }
    }
}

/// Occupancy of one bucket, for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub chunks: usize,
    pub blocks_in_use: usize,
    pub blocks_available: usize,
    pub blocks_total: usize,
    /// The bucket's running count of available blocks; equals
    /// `blocks_available` whenever the bucket is consistent.
    pub tracked_available: usize,
}

/// A thread's view of a [`BinnedAllocator`].
///
/// Not `Send`: it owns chunks on behalf of the thread that created it.
/// Dropping it hands partially used chunks to the global cache.
pub struct ThreadCache<'a> {
    allocator: &'a BinnedAllocator,
    shared: Box<ThreadShared>,
    buckets: Box<[Bucket]>,
    free_chunks: *mut ChunkHeader,
    num_free_chunks: usize,
}

impl<'a> ThreadCache<'a> {
    pub(crate) fn new(allocator: &'a BinnedAllocator) -> Self {
        Self {
            allocator,
            shared: Box::new(ThreadShared {
                dangling: SpinMutex::new(DanglingBlocks {
                    head: ptr::null_mut(),
                }),
                pending: AtomicUsize::new(0),
            }),
            buckets: (0..NUM_SMALL_CLASSES).map(Bucket::new).collect(),
            free_chunks: ptr::null_mut(),
            num_free_chunks: 0,
        }
    }

    pub fn allocator(&self) -> &'a BinnedAllocator {
        self.allocator
    }

    #[inline]
    fn me(&self) -> *const ThreadShared {
        ptr::from_ref(&*self.shared)
    }

    /// Allocate at least `size` bytes, 16-byte aligned.
    ///
    /// # Errors
    /// `VmError::OutOfMemory` when no chunk or large region can be obtained.
    ///
    /// # Panics
    /// Panics if `size` is zero.
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        assert!(size > 0, "malloc of zero bytes");
        self.poll_dangling();
        match small_class(size) {
            Some(class) => self.malloc_small(class),
            None => self.allocator.malloc_large(size),
        }
    }

    #[inline]
    fn malloc_small(&mut self, class: usize) -> Result<NonNull<u8>, VmError> {
        if let Some(ptr) = self.buckets[class].pop() {
            return Ok(ptr);
        }
        self.malloc_small_slow(class)
    }

    #[cold]
    fn malloc_small_slow(&mut self, class: usize) -> Result<NonNull<u8>, VmError> {
        if let Some(ptr) = self.pop_from_used_chunks(class) {
            return Ok(ptr);
        }
        if self.shared.pending.load(Ordering::Relaxed) > 0 {
            self.drain_dangling(true);
            if let Some(ptr) = self.buckets[class].pop().or_else(|| self.pop_from_used_chunks(class)) {
                return Ok(ptr);
            }
        }
        self.install_chunk(class)?;
        self.buckets[class]
            .pop()
            .ok_or_else(|| self.allocator.out_of_memory(block_size(class)))
    }

    /// Allocate from the first non-head chunk with room and promote it.
    fn pop_from_used_chunks(&mut self, class: usize) -> Option<NonNull<u8>> {
        let bucket = &mut self.buckets[class];
        if bucket.used_chunks.is_null() || bucket.num_blocks_available == bucket.head_available() {
            return None;
        }
        // Safety: every chunk in the list is owned by this thread; only the
        // head is mirrored and we start past it.
        unsafe {
            let mut chunk = (*bucket.used_chunks).next;
            while !chunk.is_null() {
                if let Some(ptr) = ChunkHeader::pop_block(chunk) {
                    bucket.num_blocks_available -= 1;
                    bucket.promote(chunk);
                    return Some(ptr);
                }
                chunk = (*chunk).next;
            }
        }
        debug_assert!(false, "bucket {class} tracks free blocks it does not have");
        None
    }

    fn install_chunk(&mut self, class: usize) -> Result<(), VmError> {
        let chunk = self.acquire_chunk(class)?;
        // Safety: the chunk was just formatted and is owned by us.
        unsafe { self.buckets[class].add_chunk(chunk, true) };
        Ok(())
    }

    /// Get an empty chunk: local stash, then a global batch, then the mip-map.
    fn acquire_chunk(&mut self, class: usize) -> Result<*mut ChunkHeader, VmError> {
        let base = match self.pop_free_chunk() {
            // Safety: stashed chunks are mapped and ours.
            Some(chunk) => unsafe { ChunkHeader::base(chunk) },
            None => match self.allocator.global_cache().pop_batch() {
                // Safety: a popped batch is ours.
                Some(batch) => unsafe { ChunkHeader::base(self.adopt_batch(batch)) },
                None => self.allocator.map_chunk()?,
            },
        };
        // Safety: the region is a mapped chunk nobody else can reach.
        unsafe {
            let chunk = ChunkHeader::init(base, class);
            ChunkHeader::set_state(chunk, ChunkState::Owned(self.me()));
            Ok(chunk)
        }
    }

    fn pop_free_chunk(&mut self) -> Option<*mut ChunkHeader> {
        let chunk = self.free_chunks;
        if chunk.is_null() {
            return None;
        }
        // Safety: stashed chunks are ours.
        self.free_chunks = unsafe { (*chunk).next };
        self.num_free_chunks -= 1;
        Some(chunk)
    }

    /// Keep the head of a global batch and stash the rest.
    unsafe fn adopt_batch(&mut self, batch: *mut ChunkHeader) -> *mut ChunkHeader {
        debug_assert!(self.free_chunks.is_null());
        // Safety: the batch was detached from the global cache.
        unsafe {
            let count = (*batch).num_chunks_in_batch as usize;
            debug_assert!(count >= 1);
            self.free_chunks = (*batch).next;
            self.num_free_chunks = count - 1;
            (*batch).next = ptr::null_mut();
        }
        batch
    }

    /// Stash an empty chunk; overflowing the stash ships it all as one batch.
    unsafe fn release_chunk(&mut self, chunk: *mut ChunkHeader) {
        // Safety: caller hands over an empty chunk that is out of every list.
        unsafe {
            if matches!(ChunkHeader::state(chunk), ChunkState::Owned(_)) {
                ChunkHeader::set_state(chunk, ChunkState::Free);
            }
            (*chunk).next = self.free_chunks;
        }
        self.free_chunks = chunk;
        self.num_free_chunks += 1;
        if self.num_free_chunks > self.allocator.config().max_free_chunks {
            self.flush_free_chunks();
        }
    }

    fn flush_free_chunks(&mut self) {
        let batch = std::mem::replace(&mut self.free_chunks, ptr::null_mut());
        if batch.is_null() {
            return;
        }
        // Safety: the stash is ours; its chunks are linked through `next`.
        unsafe {
            (*batch).num_chunks_in_batch = self.num_free_chunks as u32;
            (*batch).next_batch = ptr::null_mut();
            self.num_free_chunks = 0;
            self.allocator.recycle_batch(batch);
        }
    }

    /// Free a pointer returned by [`malloc`](Self::malloc) or
    /// [`realloc`](Self::realloc) of the same allocator, from any thread.
    ///
    /// # Safety
    /// `ptr` must be live and not freed twice.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        self.poll_dangling();
        if ChunkHeader::is_chunk_aligned(ptr) {
            // Safety: forwarded caller contract.
            unsafe { self.allocator.free_large(ptr) };
            return;
        }
        let chunk = ChunkHeader::from_block(ptr);
        // Safety: a small block always lies in a mapped chunk.
        unsafe {
            if cfg!(debug_assertions) {
                ChunkHeader::check_canary(chunk);
            }
            // Only this thread ever stores `Owned(me)`, so an unlocked read
            // that sees it is stable.
            if ChunkHeader::state(chunk) == ChunkState::Owned(self.me()) {
                self.free_owned(chunk, ptr);
            } else {
                self.free_foreign(chunk, ptr, true);
            }
        }
    }

    unsafe fn free_owned(&mut self, chunk: *mut ChunkHeader, ptr: NonNull<u8>) {
        // Safety: the chunk is owned by this thread.
        unsafe {
            let class = ChunkHeader::size_class(chunk);
            let bucket = &mut self.buckets[class];
            let emptied = if chunk == bucket.used_chunks {
                bucket.push(ptr).then(|| bucket.retire_head())
            } else {
                bucket.num_blocks_available += 1;
                if ChunkHeader::push_block(chunk, ptr) == 0 {
                    bucket.remove(chunk);
                    Some(chunk)
                } else {
                    if ChunkHeader::available(chunk) > bucket.head_available() {
                        bucket.promote(chunk);
                    }
                    None
                }
            };
            if let Some(empty) = emptied {
                self.release_chunk(empty);
            }
        }
    }

    /// Free into a chunk this thread does not own.
    ///
    /// With `adopt` unset a dangling chunk is never stolen; the block stays on
    /// the chunk's own list (used while this cache is being torn down).
    unsafe fn free_foreign(&mut self, chunk: *mut ChunkHeader, ptr: NonNull<u8>, adopt: bool) {
        let me = self.me();
        loop {
            // Safety: the chunk stays mapped while it has a live block (ours).
            let guard = unsafe { ChunkHeader::lock(chunk) };
            // Safety: chunk lock held.
            match unsafe { ChunkHeader::state(chunk) } {
                ChunkState::Owned(owner) if owner == me => {
                    drop(guard);
                    // Safety: owned by us.
                    unsafe { self.free_owned(chunk, ptr) };
                    return;
                }
                ChunkState::Owned(owner) => {
                    // Safety: the owner cannot drop its shared part while it
                    // still owns a chunk whose lock we hold.
                    let shared = unsafe { &*owner };
                    if let Some(mut dangling) = shared.dangling.try_lock() {
                        // Safety: the block is free from here on.
                        unsafe { dangling.push(ptr) };
                        shared.pending.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    // Owner is draining or tearing down; back off and retry.
                    drop(guard);
                    hint::spin_loop();
                }
                ChunkState::Dangling => {
                    // Safety: a dangling chunk is only mutated under its lock.
                    unsafe {
                        let global = self.allocator.global_cache();
                        if ChunkHeader::push_block(chunk, ptr) == 0 {
                            global.unlink_dangling(chunk);
                            ChunkHeader::set_state(chunk, ChunkState::Free);
                            drop(guard);
                            self.release_chunk(chunk);
                        } else if adopt {
                            global.unlink_dangling(chunk);
                            ChunkHeader::set_state(chunk, ChunkState::Owned(me));
                            drop(guard);
                            self.adopt_chunk(chunk);
                        }
                    }
                    return;
                }
                ChunkState::Free => panic!("free of {ptr:p} into empty chunk {chunk:p}"),
            }
        }
    }

    unsafe fn adopt_chunk(&mut self, chunk: *mut ChunkHeader) {
        // Safety: the chunk was just stolen by this thread.
        unsafe {
            let bucket = &mut self.buckets[ChunkHeader::size_class(chunk)];
            bucket.add_chunk(chunk, false);
            if chunk != bucket.used_chunks && ChunkHeader::available(chunk) > bucket.head_available() {
                bucket.promote(chunk);
            }
        }
    }

    #[inline]
    fn poll_dangling(&mut self) {
        if self.shared.pending.load(Ordering::Relaxed) != 0 {
            self.drain_dangling(true);
        }
    }

    /// Reclaim blocks other threads freed into this thread's chunks.
    /// Returns the number of blocks reclaimed.
    pub fn release_dangling_blocks(&mut self) -> usize {
        self.drain_dangling(true)
    }

    fn drain_dangling(&mut self, adopt: bool) -> usize {
        let mut block = {
            let mut dangling = self.shared.dangling.lock();
            self.shared.pending.store(0, Ordering::Relaxed);
            std::mem::replace(&mut dangling.head, ptr::null_mut())
        };
        let mut count = 0;
        while !block.is_null() {
            // Safety: detached list of free blocks from chunks this thread
            // owned when they were pushed.
            unsafe {
                let next = (*block).next;
                let ptr = NonNull::new_unchecked(block.cast::<u8>());
                let chunk = ChunkHeader::from_block(ptr);
                if ChunkHeader::state(chunk) == ChunkState::Owned(self.me()) {
                    self.free_owned(chunk, ptr);
                } else {
                    self.free_foreign(chunk, ptr, adopt);
                }
                block = next;
            }
            count += 1;
        }
        count
    }

    /// Resize an allocation, moving it when it cannot stay in place.
    ///
    /// `None` allocates, a zero `size` frees and returns `Ok(None)`. On error
    /// the original allocation is untouched.
    ///
    /// # Errors
    /// `VmError::OutOfMemory` when a new region is needed and none is left.
    ///
    /// # Safety
    /// `ptr`, when given, must be a live allocation of this allocator.
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, VmError> {
        let Some(ptr) = ptr else {
            return if size == 0 { Ok(None) } else { self.malloc(size).map(Some) };
        };
        if size == 0 {
            // Safety: forwarded caller contract.
            unsafe { self.free(ptr) };
            return Ok(None);
        }

        let old_size = self.region_size(ptr);
        let new_size = snap_size(size);
        if old_size == new_size {
            return Ok(Some(ptr));
        }
        if ChunkHeader::is_chunk_aligned(ptr)
            && size > MAX_SMALL_BLOCK_SIZE
            // Safety: forwarded caller contract.
            && unsafe { self.allocator.try_resize_large(ptr, old_size, new_size) }
        {
            return Ok(Some(ptr));
        }

        let new_ptr = self.malloc(size)?;
        // Safety: both regions are live and distinct.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
            self.free(ptr);
        }
        Ok(Some(new_ptr))
    }

    /// Usable size of a live allocation; equals `snap_size` of the request.
    pub fn region_size(&self, ptr: NonNull<u8>) -> usize {
        self.allocator.region_size(ptr)
    }

    /// Reclaim dangling blocks and hand stashed empty chunks to the global
    /// cache.
    pub fn trim(&mut self) {
        self.drain_dangling(true);
        self.flush_free_chunks();
    }

    pub fn free_chunk_count(&self) -> usize {
        self.num_free_chunks
    }

    /// Occupancy of the bucket serving `size`, or `None` for large sizes.
    pub fn bucket_stats(&self, size: usize) -> Option<BucketStats> {
        let bucket = &self.buckets[small_class(size)?];
        let mut stats = BucketStats {
            tracked_available: bucket.num_blocks_available,
            ..BucketStats::default()
        };
        let mut chunk = bucket.used_chunks;
        while !chunk.is_null() {
            // Safety: every chunk in the list is owned by this thread.
            let (in_use, total) = unsafe {
                if chunk == bucket.used_chunks {
                    (bucket.num_blocks_in_use, bucket.num_blocks_total)
                } else {
                    (ChunkHeader::in_use(chunk), ChunkHeader::num_blocks_total(chunk))
                }
            };
            stats.chunks += 1;
            stats.blocks_in_use += in_use as usize;
            stats.blocks_total += total as usize;
            stats.blocks_available += (total - in_use) as usize;
            // Safety: see above.
            chunk = unsafe { (*chunk).next };
        }
        debug_assert_eq!(stats.chunks, bucket.num_chunks);
        Some(stats)
    }
}

impl Drop for ThreadCache<'_> {
    fn drop(&mut self) {
        self.drain_dangling(true);

        let mut orphaned = 0;
        for class in 0..NUM_SMALL_CLASSES {
            let bucket = &mut self.buckets[class];
            // Safety: the head is ours.
            unsafe { bucket.write_back() };
            let mut chunk = bucket.used_chunks;
            *bucket = Bucket::new(class);

            while !chunk.is_null() {
                // Safety: every chunk of the old list is ours until orphaned.
                unsafe {
                    let next = (*chunk).next;
                    (*chunk).prev = ptr::null_mut();
                    (*chunk).next = ptr::null_mut();
                    if ChunkHeader::in_use(chunk) == 0 {
                        self.release_chunk(chunk);
                    } else {
                        // The chunk has live blocks and cannot empty while
                        // we hold its lock.
                        let _guard = ChunkHeader::lock(chunk);
                        ChunkHeader::set_state(chunk, ChunkState::Dangling);
                        self.allocator.global_cache().push_dangling(chunk);
                        orphaned += 1;
                    }
                    chunk = next;
                }
            }
        }

        // Frees that raced with orphaning landed on our list; no chunk is
        // `Owned(me)` any more, so this drain is final.
        let late = self.drain_dangling(false);
        self.flush_free_chunks();
        if orphaned > 0 || late > 0 {
            log::debug!("thread cache teardown: {orphaned} chunks left dangling, {late} late frees");
        }
    }
}

//! Process-wide cache of empty chunk batches and dangling chunks.
//!
//! One spin lock guards the two intrusive lists. Critical sections only
//! relink pointers; mapping and unmapping happen outside.

use super::chunk::ChunkHeader;
use crate::sync::SpinMutex;
use std::ptr;

struct GlobalLists {
    /// Batches linked through `next_batch`; chunks in a batch through `next`.
    batches: *mut ChunkHeader,
    num_batches: usize,
    /// Doubly linked through `prev` / `next`.
    dangling: *mut ChunkHeader,
    num_dangling: usize,
}

// Safety: the raw pointers are only followed under the spin lock.
unsafe impl Send for GlobalLists {}

pub(crate) struct GlobalCache {
    lists: SpinMutex<GlobalLists>,
    max_free_batches: usize,
}

impl GlobalCache {
    pub fn new(max_free_batches: usize) -> Self {
        Self {
            lists: SpinMutex::new(GlobalLists {
                batches: ptr::null_mut(),
                num_batches: 0,
                dangling: ptr::null_mut(),
                num_dangling: 0,
            }),
            max_free_batches,
        }
    }

    /// Park a batch of empty chunks headed by `batch`. When the cache is full
    /// the batch is handed back for the caller to release.
    ///
    /// # Safety
    /// `batch` must head a well-formed batch of `Free` chunks that the caller
    /// owns exclusively.
    pub unsafe fn push_batch(&self, batch: *mut ChunkHeader) -> Option<*mut ChunkHeader> {
        debug_assert!(!batch.is_null());
        let mut lists = self.lists.lock();
        if lists.num_batches >= self.max_free_batches {
            return Some(batch);
        }
        // Safety: caller owns the batch head.
        unsafe { (*batch).next_batch = lists.batches };
        lists.batches = batch;
        lists.num_batches += 1;
        None
    }

    /// Take one batch. The returned head links its chunks through `next`
    /// and records their count in `num_chunks_in_batch`.
    pub fn pop_batch(&self) -> Option<*mut ChunkHeader> {
        let mut lists = self.lists.lock();
        let batch = lists.batches;
        if batch.is_null() {
            return None;
        }
        // Safety: batches in the list are owned by the cache.
        unsafe {
            lists.batches = (*batch).next_batch;
            (*batch).next_batch = ptr::null_mut();
        }
        lists.num_batches -= 1;
        Some(batch)
    }

    /// Detach every batch, returning the chain (linked through `next_batch`).
    pub fn take_batches(&self) -> *mut ChunkHeader {
        let mut lists = self.lists.lock();
        lists.num_batches = 0;
        std::mem::replace(&mut lists.batches, ptr::null_mut())
    }

    /// Publish a chunk whose owner is exiting.
    ///
    /// # Safety
    /// Caller holds the chunk lock and has moved the chunk to `Dangling`.
    pub unsafe fn push_dangling(&self, chunk: *mut ChunkHeader) {
        let mut lists = self.lists.lock();
        // Safety: chunk lock held; list nodes are guarded by our lock.
        unsafe {
            (*chunk).prev = ptr::null_mut();
            (*chunk).next = lists.dangling;
            if !lists.dangling.is_null() {
                (*lists.dangling).prev = chunk;
            }
        }
        lists.dangling = chunk;
        lists.num_dangling += 1;
    }

    /// Remove a dangling chunk that is being stolen or freed.
    ///
    /// # Safety
    /// Caller holds the chunk lock and the chunk is in the dangling list.
    pub unsafe fn unlink_dangling(&self, chunk: *mut ChunkHeader) {
        let mut lists = self.lists.lock();
        // Safety: chunk lock held; neighbours are guarded by our lock.
        unsafe {
            let prev = (*chunk).prev;
            let next = (*chunk).next;
            if prev.is_null() {
                debug_assert_eq!(lists.dangling, chunk, "chunk {chunk:p} not in the dangling list");
                lists.dangling = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*chunk).prev = ptr::null_mut();
            (*chunk).next = ptr::null_mut();
        }
        lists.num_dangling -= 1;
    }

    pub fn dangling_count(&self) -> usize {
        self.lists.lock().num_dangling
    }

    pub fn free_batch_count(&self) -> usize {
        self.lists.lock().num_batches
    }
}

//! Chunks: 64 KiB, 64 KiB-aligned regions carved into blocks of one size class.
//!
//! The header lives in-band at the chunk base. Blocks are carved from the end
//! of the chunk downward, lazily: block `i` (1-based) sits at
//! `base + CHUNK_SIZE - i * block_size`, and `highest_index` marks how many
//! have ever been handed out. Because the header occupies the base, no small
//! block is ever chunk-aligned; alignment alone tells small pointers from
//! large ones.
//!
//! Every field is reached through raw-pointer associated functions. While a
//! chunk is `Owned` only the owning thread touches it; while `Dangling` or
//! being transferred, only the holder of the chunk lock does.

use super::size_class::{NUM_SMALL_CLASSES, block_size};
use super::thread_cache::ThreadShared;
use super::vm::ALLOCATION_GRANULARITY;
use crate::sync::atomic::{AtomicPtr, Ordering};
use crate::sync::{RawSpinLock, SpinGuard};
use std::ptr::{self, NonNull};

pub(crate) const CHUNK_SIZE: usize = ALLOCATION_GRANULARITY;

const CHUNK_CANARY: u32 = 0xC4_0C_2A_11;

/// Marker stored in `owner` for chunks that sit in a free list or batch.
const FREE_OWNER: *mut ThreadShared = ptr::without_provenance_mut(1);

/// Overlay on a free block: the first word links the intra-chunk free list.
#[repr(C)]
pub(crate) struct FreeBlock {
    pub next: *mut FreeBlock,
}

#[cfg(debug_assertions)]
const POISON_FREE_BLOCKS: *mut FreeBlock = ptr::without_provenance_mut(0xDEAD_BEEF_DEAD_B000);
#[cfg(debug_assertions)]
const POISON_COUNT: u32 = u32::MAX;

/// Ownership of a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChunkState {
    /// Held in the bucket of the thread whose shared part is pointed to.
    Owned(*const ThreadShared),
    /// Owner exited with blocks still live; parked in the global dangling list.
    Dangling,
    /// Empty, in a thread free list, a global batch, or about to be unmapped.
    Free,
}

#[repr(C, align(64))]
pub(crate) struct ChunkHeader {
    canary: u32,
    size_class: u32,
    num_blocks_total: u32,
    num_blocks_in_use: u32,
    highest_index: u32,
    /// Number of chunks in the batch this chunk heads.
    pub(crate) num_chunks_in_batch: u32,
    free_blocks: *mut FreeBlock,
    /// Bucket list links, or global dangling list links while dangling.
    pub(crate) prev: *mut ChunkHeader,
    /// Also links free chunks inside a batch or thread free list.
    pub(crate) next: *mut ChunkHeader,
    pub(crate) next_batch: *mut ChunkHeader,
    owner: AtomicPtr<ThreadShared>,
    lock: RawSpinLock,
}

#[cfg(not(loom))]
const _: () = assert!(std::mem::size_of::<ChunkHeader>() <= 128);

const HEADER_SIZE: usize = std::mem::size_of::<ChunkHeader>();

impl ChunkHeader {
    pub(crate) fn new(size_class: usize) -> Self {
        debug_assert!(size_class < NUM_SMALL_CLASSES);
        Self {
            canary: CHUNK_CANARY,
            size_class: size_class as u32,
            num_blocks_total: Self::blocks_for(size_class) as u32,
            num_blocks_in_use: 0,
            highest_index: 0,
            num_chunks_in_batch: 0,
            free_blocks: ptr::null_mut(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            next_batch: ptr::null_mut(),
            owner: AtomicPtr::new(FREE_OWNER),
            lock: RawSpinLock::new(),
        }
    }

    /// Number of blocks of `size_class` that fit below the header.
    #[inline]
    pub(crate) fn blocks_for(size_class: usize) -> usize {
        (CHUNK_SIZE - HEADER_SIZE) / block_size(size_class)
    }

    /// Format a freshly mapped or recycled chunk for `size_class`.
    ///
    /// # Safety
    /// `base` must be a committed, chunk-aligned region of `CHUNK_SIZE` bytes
    /// that no other thread can reach.
    pub(crate) unsafe fn init(base: NonNull<u8>, size_class: usize) -> *mut ChunkHeader {
        debug_assert!((base.as_ptr() as usize).is_multiple_of(CHUNK_SIZE));
        let chunk = base.as_ptr().cast::<ChunkHeader>();
        // Safety: caller guarantees exclusive access to the region.
        unsafe { chunk.write(Self::new(size_class)) };
        chunk
    }

    /// The chunk containing a small block.
    #[inline]
    pub(crate) fn from_block(ptr: NonNull<u8>) -> *mut ChunkHeader {
        ptr.as_ptr().map_addr(|addr| addr & !(CHUNK_SIZE - 1)).cast()
    }

    /// True for pointers that can only come from the large path.
    #[inline]
    pub(crate) fn is_chunk_aligned(ptr: NonNull<u8>) -> bool {
        (ptr.as_ptr() as usize).is_multiple_of(CHUNK_SIZE)
    }

    #[inline]
    pub(crate) unsafe fn base(chunk: *mut ChunkHeader) -> NonNull<u8> {
        // Safety: chunk pointers are never null.
        unsafe { NonNull::new_unchecked(chunk.cast()) }
    }

    #[inline]
    pub(crate) unsafe fn check_canary(chunk: *mut ChunkHeader) {
        // Safety: caller passes a mapped chunk.
        let canary = unsafe { (*chunk).canary };
        assert!(
            canary == CHUNK_CANARY,
            "chunk {chunk:p} header corrupted (canary {canary:#x})"
        );
    }

    #[inline]
    pub(crate) unsafe fn size_class(chunk: *mut ChunkHeader) -> usize {
        // Safety: caller passes a mapped chunk.
        unsafe { (*chunk).size_class as usize }
    }

    #[inline]
    pub(crate) unsafe fn num_blocks_total(chunk: *mut ChunkHeader) -> u32 {
        // Safety: caller passes a mapped chunk.
        unsafe { (*chunk).num_blocks_total }
    }

    #[inline]
    pub(crate) unsafe fn in_use(chunk: *mut ChunkHeader) -> u32 {
        // Safety: caller owns the chunk and it is not mirrored by a bucket.
        unsafe {
            Self::debug_check_unmirrored(chunk);
            (*chunk).num_blocks_in_use
        }
    }

    /// Blocks not in use, including never-carved ones.
    #[inline]
    pub(crate) unsafe fn available(chunk: *mut ChunkHeader) -> usize {
        // Safety: caller owns the chunk and it is not mirrored by a bucket.
        unsafe {
            Self::debug_check_unmirrored(chunk);
            ((*chunk).num_blocks_total - (*chunk).num_blocks_in_use) as usize
        }
    }

    /// Address of block `index` (1-based).
    #[inline]
    pub(crate) unsafe fn block_at(chunk: *mut ChunkHeader, index: u32, block_size: usize) -> *mut FreeBlock {
        debug_assert!(index >= 1);
        // Safety: index <= num_blocks_total keeps the address above the header.
        unsafe { chunk.cast::<u8>().add(CHUNK_SIZE - index as usize * block_size).cast() }
    }

    /// Take the chunk lock.
    ///
    /// # Safety
    /// `chunk` must stay mapped for `'a`. A chunk is unmapped only once it is
    /// empty, so holding a live block of it (or owning it) is enough.
    #[inline]
    pub(crate) unsafe fn lock<'a>(chunk: *mut ChunkHeader) -> SpinGuard<'a> {
        // Safety: upheld by caller.
        unsafe { (*chunk).lock.lock() }
    }

    #[inline]
    pub(crate) unsafe fn state(chunk: *mut ChunkHeader) -> ChunkState {
        // Safety: caller passes a mapped chunk.
        let owner = unsafe { (*chunk).owner.load(Ordering::Acquire) };
        if owner.is_null() {
            ChunkState::Dangling
        } else if owner == FREE_OWNER {
            ChunkState::Free
        } else {
            ChunkState::Owned(owner.cast_const())
        }
    }

    /// Move the chunk to `next`, asserting the transition is legal.
    ///
    /// Transitions out of or into `Dangling` must happen under the chunk lock.
    pub(crate) unsafe fn set_state(chunk: *mut ChunkHeader, next: ChunkState) {
        // Safety: caller passes a mapped chunk.
        let current = unsafe { Self::state(chunk) };
        debug_assert!(
            matches!(
                (current, next),
                (ChunkState::Free, ChunkState::Owned(_))
                    | (ChunkState::Owned(_), ChunkState::Free)
                    | (ChunkState::Owned(_), ChunkState::Dangling)
                    | (ChunkState::Dangling, ChunkState::Owned(_))
                    | (ChunkState::Dangling, ChunkState::Free)
            ),
            "chunk {chunk:p}: illegal transition {current:?} -> {next:?}"
        );
        debug_assert!(
            !matches!(current, ChunkState::Dangling) && !matches!(next, ChunkState::Dangling)
                // Safety: caller passes a mapped chunk.
                || unsafe { (*chunk).lock.is_locked() },
            "chunk {chunk:p}: {current:?} -> {next:?} without the chunk lock"
        );
        let raw = match next {
            ChunkState::Owned(owner) => owner.cast_mut(),
            ChunkState::Dangling => ptr::null_mut(),
            ChunkState::Free => FREE_OWNER,
        };
        // Safety: caller passes a mapped chunk.
        unsafe { (*chunk).owner.store(raw, Ordering::Release) };
    }

    /// Pop a block from the chunk's own free list or carve a fresh one.
    pub(crate) unsafe fn pop_block(chunk: *mut ChunkHeader) -> Option<NonNull<u8>> {
        // Safety: caller owns the chunk (or holds its lock) and it is unmirrored.
        unsafe {
            Self::debug_check_unmirrored(chunk);
            let header = &mut *chunk;
            let block = if !header.free_blocks.is_null() {
                let block = header.free_blocks;
                header.free_blocks = (*block).next;
                block
            } else if header.highest_index < header.num_blocks_total {
                header.highest_index += 1;
                Self::block_at(chunk, header.highest_index, block_size(header.size_class as usize))
            } else {
                return None;
            };
            header.num_blocks_in_use += 1;
            Some(NonNull::new_unchecked(block.cast()))
        }
    }

    /// Push a block onto the chunk's own free list. Returns the number of
    /// blocks still in use.
    pub(crate) unsafe fn push_block(chunk: *mut ChunkHeader, ptr: NonNull<u8>) -> u32 {
        // Safety: caller owns the chunk (or holds its lock) and it is unmirrored.
        unsafe {
            Self::debug_check_unmirrored(chunk);
            let header = &mut *chunk;
            debug_assert!(header.num_blocks_in_use > 0, "chunk {chunk:p}: free into empty chunk");
            let block = ptr.as_ptr().cast::<FreeBlock>();
            (*block).next = header.free_blocks;
            header.free_blocks = block;
            header.num_blocks_in_use -= 1;
            header.num_blocks_in_use
        }
    }

    /// Copy the mirrored fields out for a bucket, poisoning them in debug builds.
    pub(crate) unsafe fn take_mirror(chunk: *mut ChunkHeader) -> (*mut FreeBlock, u32, u32) {
        // Safety: caller owns the chunk.
        unsafe {
            Self::debug_check_unmirrored(chunk);
            let header = &mut *chunk;
            let fields = (header.free_blocks, header.highest_index, header.num_blocks_in_use);
            #[cfg(debug_assertions)]
            {
                header.free_blocks = POISON_FREE_BLOCKS;
                header.highest_index = POISON_COUNT;
                header.num_blocks_in_use = POISON_COUNT;
            }
            fields
        }
    }

    /// Write a bucket's mirrored fields back into the header.
    pub(crate) unsafe fn restore_mirror(
        chunk: *mut ChunkHeader,
        free_blocks: *mut FreeBlock,
        highest_index: u32,
        num_blocks_in_use: u32,
    ) {
        // Safety: caller owns the chunk.
        unsafe {
            let header = &mut *chunk;
            #[cfg(debug_assertions)]
            debug_assert!(
                header.free_blocks == POISON_FREE_BLOCKS,
                "chunk {chunk:p}: restoring a mirror that was never taken"
            );
            header.free_blocks = free_blocks;
            header.highest_index = highest_index;
            header.num_blocks_in_use = num_blocks_in_use;
        }
    }

    #[inline]
    unsafe fn debug_check_unmirrored(chunk: *mut ChunkHeader) {
        #[cfg(debug_assertions)]
        {
            // Safety: caller passes a mapped chunk.
            let header = unsafe { &*chunk };
            debug_assert!(
                header.free_blocks != POISON_FREE_BLOCKS && header.num_blocks_in_use != POISON_COUNT,
                "chunk {chunk:p}: header read while mirrored by a bucket"
            );
        }
        #[cfg(not(debug_assertions))]
        let _ = chunk;
    }
}

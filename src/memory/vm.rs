use std::fmt;
use std::ptr::NonNull;

/// Granularity of every region the allocator maps: chunks, mip leaves and
/// large blocks are all multiples of (and aligned to) this size.
pub const ALLOCATION_GRANULARITY: usize = 64 * 1024;

#[allow(dead_code)]
const PAGE_SIZE_2MB: usize = 2 * 1024 * 1024;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    DecommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
    /// No address space or backing memory left for a request of `size` bytes.
    OutOfMemory { size: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::DecommitFailed(e) => write!(f, "VM decommit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
            VmError::OutOfMemory { size } => write!(f, "out of memory allocating {size} bytes"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::DecommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::InitializationFailed(_) | VmError::OutOfMemory { .. } => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Reserve and commit `size` bytes whose base is aligned to `align`.
    ///
    /// `align` must be a power of two no larger than
    /// [`ALLOCATION_GRANULARITY`]; `size` a multiple of the page size.
    /// Free with [`free_aligned`](VmOps::free_aligned).
    unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    /// Release a region obtained from [`alloc_aligned`](VmOps::alloc_aligned).
    unsafe fn free_aligned(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Whole mips are committed at once; let THP back them.
                if size >= super::PAGE_SIZE_2MB {
                    // Safety: FFI call to madvise.
                    unsafe {
                        libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_HUGEPAGE)
                    };
                }
            }

            // NOTE: Zeroing is NOT done here. Freshly mapped pages are zero,
            // recommitted ones may hold stale data; callers must not rely on
            // either.
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE marks pages for lazy reclamation; mprotect(PROT_NONE)
            // turns any later touch into a fault until the range is
            // recommitted.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(align.is_power_of_two(), "alloc_aligned: align {align} not a power of two");
            let total = size
                .checked_add(align)
                .ok_or(VmError::OutOfMemory { size })?;
            // Over-reserve, then unmap the misaligned head and the tail.
            // Safety: FFI reserve of a fresh range.
            let raw = unsafe { Self::reserve(total)? };
            let addr = raw.as_ptr() as usize;
            let aligned = addr.next_multiple_of(align);
            let head = aligned - addr;
            let tail = total - head - size;

            // Safety: head/tail lie inside the reservation just made.
            unsafe {
                if head > 0 {
                    Self::release(raw, head)?;
                }
                if tail > 0 {
                    Self::release(NonNull::new_unchecked((aligned + size) as *mut u8), tail)?;
                }
            }

            // Safety: `aligned` is inside the reservation and non-null.
            let ptr = unsafe { NonNull::new_unchecked(aligned as *mut u8) };
            // Safety: committing the range we own.
            if let Err(e) = unsafe { Self::commit(ptr, size) } {
                // Safety: releasing the range we own.
                drop(unsafe { Self::release(ptr, size) });
                return Err(e);
            }
            Ok(ptr)
        }

        unsafe fn free_aligned(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: caller passes a region from alloc_aligned.
            unsafe { Self::release(ptr, size) }
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps (no real mmap)
//
// Used under `cfg(loom)` / `cfg(miri)` and on targets without an mmap backend.
// Every "reservation" is a plain heap allocation aligned to the allocation
// granularity. `commit` / `decommit` are no-ops: the memory is always
// accessible once reserved. `release` frees the heap block, so it must be
// called with the exact base and size that `reserve` returned.
//
// This is sufficient for testing the *synchronization* logic of the allocators
// (loom) and detecting undefined behaviour in unsafe pointer code (Miri).
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(any(target_os = "macos", target_os = "linux"))))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, ALLOCATION_GRANULARITY)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // no-op; memory remains accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, ALLOCATION_GRANULARITY)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(
            align.is_power_of_two() && align <= ALLOCATION_GRANULARITY,
            "alloc_aligned: unsupported alignment {align}"
        );
        // Safety: reservations are granularity-aligned, which covers `align`.
        unsafe { Self::reserve(size) }
    }

    unsafe fn free_aligned(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: caller passes a region from alloc_aligned.
        unsafe { Self::release(ptr, size) }
    }

    fn page_size() -> usize {
        4096
    }
}

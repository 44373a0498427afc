#[cfg(not(target_pointer_width = "64"))]
compile_error!("qen-alloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator
pub use memory::binned::{
    BinnedAllocator, BinnedAllocatorConfig, GlobalBinned, OomHandler, TrimStats, set_oom_handler,
};
pub use memory::thread_cache::{BucketStats, ThreadCache};

// size classes
pub use memory::mip_map::TOP_MIP_SIZE;
pub use memory::size_class::{MAX_SMALL_BLOCK_SIZE, snap_size};
pub use memory::vm::ALLOCATION_GRANULARITY;

// debug checking
#[cfg(debug_assertions)]
pub use memory::validate::{CheckedCache, FREED_POISON};

// mgmt/stats
pub use memory::manager::{MemoryManager, MemoryStats};

// errors
pub use memory::vm::VmError;

//! Size classing: maps request sizes to block sizes.
//!
//! Small requests (up to [`MAX_SMALL_BLOCK_SIZE`]) round up to one of 40
//! classes: 16..128 in steps of 16, then four sub-buckets per power of two.
//! Medium requests round up to a power of two served by the mip-map, huge
//! ones to the allocation granularity.

use super::mip_map::TOP_MIP_SIZE;
use super::vm::ALLOCATION_GRANULARITY;

/// Largest request served from chunks; anything bigger takes the large path.
pub const MAX_SMALL_BLOCK_SIZE: usize = 32 * 1024;

pub const NUM_SMALL_CLASSES: usize = 40;

/// Alignment of every block.
pub(crate) const MIN_ALIGN: usize = 16;

pub(crate) const SIZE_CLASSES: [usize; NUM_SMALL_CLASSES] = [
    16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896, 1024,
    1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192, 10240, 12288, 14336,
    16384, 20480, 24576, 28672, 32768,
];

const LUT_LEN: usize = MAX_SMALL_BLOCK_SIZE / 16 + 1;

/// O(1) size-to-class lookup table. Index by `ceil(size / 16)`.
static SIZE_CLASS_LUT: [u8; LUT_LEN] = build_size_class_lut();

const fn build_size_class_lut() -> [u8; LUT_LEN] {
    let mut table = [0u8; LUT_LEN];
    // table[0] maps to class 0; size 0 never reaches the lookup
    let mut q: usize = 1;
    let mut sc: usize = 0;
    while sc < NUM_SMALL_CLASSES {
        let class_quanta = SIZE_CLASSES[sc] / 16;
        while q <= class_quanta {
            table[q] = sc as u8;
            q += 1;
        }
        sc += 1;
    }
    table
}

/// Class index for a small request, or `None` when `size` takes the large path.
#[inline]
pub(crate) fn small_class(size: usize) -> Option<usize> {
    if size > MAX_SMALL_BLOCK_SIZE {
        return None;
    }
    Some(SIZE_CLASS_LUT[(size + 15) >> 4] as usize)
}

#[inline]
pub(crate) fn block_size(class: usize) -> usize {
    SIZE_CLASSES[class]
}

/// Size of the region that a request of `size` bytes actually receives.
///
/// Monotonic and idempotent: `snap_size(snap_size(x)) == snap_size(x)`.
/// Sizes too large to round saturate at `usize::MAX`, which no allocation
/// path can satisfy.
#[must_use]
pub fn snap_size(size: usize) -> usize {
    debug_assert!(size > 0, "snap_size of a zero-sized request");
    if let Some(class) = small_class(size) {
        SIZE_CLASSES[class]
    } else if size <= TOP_MIP_SIZE {
        size.next_power_of_two().max(ALLOCATION_GRANULARITY)
    } else {
        size.checked_next_multiple_of(ALLOCATION_GRANULARITY)
            .unwrap_or(usize::MAX)
    }
}

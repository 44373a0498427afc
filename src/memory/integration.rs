#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::binned::{BinnedAllocator, BinnedAllocatorConfig, GlobalBinned};
    use crate::memory::chunk::CHUNK_SIZE;
    use crate::memory::manager::MemoryManager;
    use crate::memory::mip_map::TOP_MIP_SIZE;
    use crate::memory::size_class::{MAX_SMALL_BLOCK_SIZE, snap_size};
    use crate::memory::thread_cache::ThreadCache;
    use crate::memory::vm::VmError;
    use crate::sync::Arc;
    use crate::sync::thread;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::ptr::NonNull;
    use std::sync::{Barrier, mpsc};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn allocator_with_mips(mips: usize) -> BinnedAllocator {
        BinnedAllocator::with_config(BinnedAllocatorConfig {
            mip_reserved_size: mips * TOP_MIP_SIZE,
            ..BinnedAllocatorConfig::default()
        })
        .unwrap()
    }

    fn fill(ptr: NonNull<u8>, len: usize, tag: u8) {
        // Safety: Test code.
        unsafe { ptr.as_ptr().write_bytes(tag, len) };
    }

    fn check(ptr: NonNull<u8>, len: usize, tag: u8) {
        // Safety: Test code.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) };
        if let Some(offset) = bytes.iter().position(|&b| b != tag) {
            panic!("{ptr:p}+{offset} overwritten (len {len})");
        }
    }

    #[test]
    fn test_integration_random_workload_keeps_contents() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        init_logging();
        let allocator = allocator_with_mips(32);
        let mut cache = allocator.thread_cache();
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

        for step in 0..20_000u32 {
            let roll = rng.gen_range(0..100);
            if roll < 55 || live.is_empty() {
                let size = if rng.gen_ratio(1, 50) {
                    rng.gen_range(MAX_SMALL_BLOCK_SIZE..400_000)
                } else {
                    rng.gen_range(1..=4096)
                };
                let p = cache.malloc(size).unwrap();
                assert!(cache.region_size(p) >= size);
                assert!((p.as_ptr() as usize).is_multiple_of(16));
                let tag = step as u8;
                fill(p, size, tag);
                live.push((p, size, tag));
            } else if roll < 90 {
                let (p, size, tag) = live.swap_remove(rng.gen_range(0..live.len()));
                check(p, size, tag);
                // Safety: Test code.
                unsafe { cache.free(p) };
            } else {
                let idx = rng.gen_range(0..live.len());
                let (p, size, tag) = live[idx];
                let new_size = rng.gen_range(1..=8192);
                // Safety: Test code.
                let q = unsafe { cache.realloc(Some(p), new_size) }.unwrap().unwrap();
                check(q, size.min(new_size), tag);
                fill(q, new_size, tag);
                live[idx] = (q, new_size, tag);
            }
        }

        for (p, size, tag) in live {
            check(p, size, tag);
            // Safety: Test code.
            unsafe { cache.free(p) };
        }
        for size in [16, 48, 256, 4096] {
            assert_eq!(cache.bucket_stats(size).unwrap().blocks_in_use, 0);
        }
    }

    #[test]
    fn test_integration_cross_thread_frees_are_accounted() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator_with_mips(16);
        let producers = 4;
        let per_producer = 300;
        let freed = Barrier::new(producers + 1);
        let (tx, rx) = mpsc::channel::<usize>();

        std::thread::scope(|s| {
            for t in 0..producers {
                let tx = tx.clone();
                let allocator = &allocator;
                let freed = &freed;
                s.spawn(move || {
                    let mut cache = allocator.thread_cache();
                    // Allocate everything before the first send so no poll
                    // can run while frees are arriving.
                    let ptrs: Vec<_> = (0..per_producer)
                        .map(|i| {
                            let p = cache.malloc(64).unwrap();
                            fill(p, 64, (t * 31 + i) as u8);
                            p.as_ptr() as usize
                        })
                        .collect();
                    for addr in ptrs {
                        tx.send(addr).unwrap();
                    }
                    drop(tx);
                    freed.wait();

                    assert_eq!(cache.release_dangling_blocks(), per_producer);
                    let stats = cache.bucket_stats(64).unwrap();
                    assert_eq!(stats.blocks_in_use, 0);
                    assert_eq!(stats.blocks_available, stats.tracked_available);
                });
            }
            drop(tx);

            let allocator = &allocator;
            let freed = &freed;
            s.spawn(move || {
                let mut cache = allocator.thread_cache();
                let mut count = 0;
                for addr in rx {
                    // Safety: Test code.
                    unsafe { cache.free(NonNull::new(addr as *mut u8).unwrap()) };
                    count += 1;
                }
                assert_eq!(count, producers * per_producer);
                freed.wait();
            });
        });

        assert_eq!(allocator.dangling_chunk_count(), 0);
    }

    #[test]
    fn test_integration_dangling_chunk_is_adopted() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator_with_mips(4);

        // Owner exits with ten live blocks.
        let blocks: Vec<usize> = std::thread::scope(|s| {
            s.spawn(|| {
                let mut cache = allocator.thread_cache();
                (0..10)
                    .map(|_| cache.malloc(128).unwrap().as_ptr() as usize)
                    .collect()
            })
            .join()
            .unwrap()
        });
        assert_eq!(allocator.dangling_chunk_count(), 1);

        let mut cache = allocator.thread_cache();
        let mut blocks = blocks.into_iter().map(|a| NonNull::new(a as *mut u8).unwrap());
        // Safety: Test code.
        unsafe { cache.free(blocks.next().unwrap()) };
        assert_eq!(allocator.dangling_chunk_count(), 0, "free adopts the chunk");
        assert_eq!(cache.bucket_stats(128).unwrap().blocks_in_use, 9);

        for p in blocks {
            // Safety: Test code.
            unsafe { cache.free(p) };
        }
        assert_eq!(cache.bucket_stats(128).unwrap().blocks_in_use, 0);
    }

    #[test]
    fn test_integration_last_free_of_dangling_chunk_recycles_it() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator_with_mips(4);
        let addr = std::thread::scope(|s| {
            s.spawn(|| allocator.thread_cache().malloc(512).unwrap().as_ptr() as usize)
                .join()
                .unwrap()
        });
        assert_eq!(allocator.dangling_chunk_count(), 1);

        let mut cache = allocator.thread_cache();
        // Safety: Test code.
        unsafe { cache.free(NonNull::new(addr as *mut u8).unwrap()) };
        assert_eq!(allocator.dangling_chunk_count(), 0);
        assert_eq!(cache.free_chunk_count(), 1);
    }

    fn fill_until_exhausted(cache: &mut ThreadCache<'_>) -> Vec<NonNull<u8>> {
        let mut ptrs = Vec::new();
        loop {
            match cache.malloc(4096) {
                Ok(p) => ptrs.push(p),
                Err(VmError::OutOfMemory { size }) => {
                    assert_eq!(size, CHUNK_SIZE);
                    return ptrs;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
    }

    #[test]
    fn test_integration_exhaustion_and_recovery() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator_with_mips(2);
        let mut cache = allocator.thread_cache();

        let first = fill_until_exhausted(&mut cache);
        assert!(!first.is_empty());
        assert!(first.len() <= 2 * TOP_MIP_SIZE / 4096);
        for &p in &first {
            // Safety: Test code.
            unsafe { cache.free(p) };
        }

        let second = fill_until_exhausted(&mut cache);
        assert_eq!(second.len(), first.len());
        for p in second {
            // Safety: Test code.
            unsafe { cache.free(p) };
        }
    }

    #[test]
    fn test_integration_size_boundary_routing() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator_with_mips(4);
        let mut cache = allocator.thread_cache();

        let small = cache.malloc(MAX_SMALL_BLOCK_SIZE).unwrap();
        let large = cache.malloc(MAX_SMALL_BLOCK_SIZE + 1).unwrap();
        assert!(!(small.as_ptr() as usize).is_multiple_of(CHUNK_SIZE));
        assert!((large.as_ptr() as usize).is_multiple_of(CHUNK_SIZE));
        assert_eq!(cache.region_size(small), MAX_SMALL_BLOCK_SIZE);
        assert_eq!(cache.region_size(large), snap_size(MAX_SMALL_BLOCK_SIZE + 1));

        for size in [1, 17, 100, 1000, 5000, 20_000, 70_000, 1 << 20] {
            let p = cache.malloc(size).unwrap();
            assert_eq!(cache.region_size(p), snap_size(size));
            // Safety: Test code.
            unsafe { cache.free(p) };
        }
        // Safety: Test code.
        unsafe {
            cache.free(small);
            cache.free(large);
        }
    }

    #[test]
    fn test_integration_sixteen_byte_reuse() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let allocator = allocator_with_mips(4);
        let mut cache = allocator.thread_cache();

        let a = cache.malloc(16).unwrap();
        let b = cache.malloc(16).unwrap();
        let (lo, hi) = (a.as_ptr() as usize, b.as_ptr() as usize);
        assert!(lo.abs_diff(hi) >= 16, "regions overlap");

        fill(b, 16, 0xB0);
        // Safety: Test code.
        unsafe { cache.free(a) };
        let c = cache.malloc(16).unwrap();
        assert!((c.as_ptr() as usize).abs_diff(hi) >= 16);
        fill(c, 16, 0xC0);
        check(b, 16, 0xB0);
        // Safety: Test code.
        unsafe {
            cache.free(b);
            cache.free(c);
        }
    }

    #[test]
    fn test_integration_global_thread_contention() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        drop(GlobalBinned::init());
        let num_threads = 8u8;
        let iters = 200u8;
        let barrier = Arc::new(Barrier::new(num_threads as usize));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let b = barrier.clone();
                thread::spawn(move || {
                    let mut ptrs = Vec::with_capacity(iters as usize);
                    b.wait();

                    for i in 0..iters {
                        let size = 16usize << (i % 4);
                        let ptr = GlobalBinned::malloc(size).unwrap();
                        // Safety: Test code.
                        unsafe { ptr.as_ptr().write(t.wrapping_mul(232).wrapping_add(i)) };
                        ptrs.push(ptr.as_ptr() as usize);
                    }

                    for (i, &addr) in (0u8..).zip(ptrs.iter()) {
                        // Safety: Test code.
                        let found = unsafe { (addr as *const u8).read() };
                        assert_eq!(
                            found,
                            t.wrapping_mul(232).wrapping_add(i),
                            "contention caused corruption in thread {t}"
                        );
                    }
                    ptrs
                })
            })
            .collect();

        // Free everything from the main thread: every block is foreign here.
        for h in handles {
            for addr in h.join().unwrap() {
                // Safety: Test code.
                unsafe { GlobalBinned::free(NonNull::new(addr as *mut u8).unwrap()) };
            }
        }
    }

    #[test]
    fn test_integration_leak_check() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        init_logging();
        let manager = MemoryManager::new();
        drop(GlobalBinned::init());
        MemoryManager::trim();
        let baseline = manager.stats();

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t);
                    let mut ptrs = Vec::new();
                    for _ in 0..500 {
                        let size = if rng.gen_ratio(1, 100) {
                            3 * TOP_MIP_SIZE
                        } else {
                            rng.gen_range(1..=2048)
                        };
                        ptrs.push(GlobalBinned::malloc(size).unwrap());
                    }
                    for p in ptrs {
                        // Safety: Test code.
                        unsafe { GlobalBinned::free(p) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        MemoryManager::trim();
        let after = manager.stats();
        assert!(
            after.total_committed <= baseline.total_committed,
            "physical memory leak: baseline {}, final {}",
            baseline.total_committed,
            after.total_committed
        );
        assert_eq!(after.vm_cache_cached, 0);
        assert_eq!(after.large_regions_committed, baseline.large_regions_committed);
    }
}

//! Allocator integrity: alignment, non-overlap of live buffers, pool reuse
//! and cross-thread release.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tensorvm::pool::{self, Buffer, BUFFER_ALIGN};
use tensorvm::EngineError;

fn ranges_overlap(a: &Buffer, b: &Buffer) -> bool {
    let (a0, a1) = (a.as_ptr() as usize, a.as_ptr() as usize + a.len());
    let (b0, b1) = (b.as_ptr() as usize, b.as_ptr() as usize + b.len());
    a0 < b1 && b0 < a1
}

#[test]
fn live_buffers_never_overlap_and_stay_aligned() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<Buffer> = Vec::new();

    for _ in 0..600 {
        if live.len() > 40 || (!live.is_empty() && rng.gen_bool(0.4)) {
            let victim = rng.gen_range(0..live.len());
            live.swap_remove(victim);
            continue;
        }
        let bytes = rng.gen_range(1..16 * 1024usize);
        let buffer = pool::allocate(bytes).unwrap();
        assert_eq!(buffer.as_ptr() as usize % BUFFER_ALIGN, 0);
        assert!(buffer.len() >= bytes);
        for other in &live {
            assert!(
                !ranges_overlap(&buffer, other),
                "allocator handed out overlapping blocks"
            );
        }
        live.push(buffer);
    }
}

#[test]
fn released_blocks_are_reused_by_the_pool() {
    let pool = pool::current();
    let before = pool.stats();

    let round: Vec<Buffer> = (0..16).map(|_| pool.allocate(512).unwrap()).collect();
    drop(round);
    let _round_two: Vec<Buffer> = (0..16).map(|_| pool.allocate(512).unwrap()).collect();

    let after = pool.stats();
    assert!(after.pool_hits > before.pool_hits, "free list was not consulted");
    // Carve-and-retain: the second round must not have grown the slab set.
    assert!(after.slab_allocations <= before.slab_allocations + 1);
}

#[test]
fn cross_thread_release_returns_blocks_to_the_owner() {
    let pool = pool::current();
    let baseline = pool.stats().live_blocks;

    let buffers: Vec<Buffer> = (0..32).map(|_| pool.allocate(256).unwrap()).collect();
    assert_eq!(pool.stats().live_blocks, baseline + 32);

    std::thread::spawn(move || drop(buffers)).join().unwrap();
    assert_eq!(pool.stats().live_blocks, baseline);

    // The remotely released blocks are immediately allocatable again.
    let hits = pool.stats().pool_hits;
    let _again = pool.allocate(256).unwrap();
    assert!(pool.stats().pool_hits > hits);
}

#[test]
fn oversized_requests_surface_out_of_memory() {
    let err = pool::allocate((1usize << 30) + 1).unwrap_err();
    assert!(matches!(err, EngineError::OutOfMemory { .. }));
}

//! Thread-scoped pooled allocator producing 64-byte-aligned buffers.
//!
//! Each thread lazily owns a private pool. Allocation pops a free block of
//! the matching size class; on a miss the pool carves a fresh slab from the
//! system allocator and retains every carved block (carve-and-retain, never
//! return-to-system while the pool lives). Release pushes the block back to
//! the *originating* pool's lock-free per-class free list, so a buffer
//! allocated on thread A and dropped on thread B never takes a lock on
//! anyone's allocate hot path.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, Result};
use crate::profiling;
use crate::sync::Stack;

/// Every buffer start address is a multiple of this.
pub const BUFFER_ALIGN: usize = 64;

const MIN_CLASS_SHIFT: u32 = 6; // 64 B
const MAX_CLASS_SHIFT: u32 = 30; // 1 GiB
const NUM_CLASSES: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Default slab granularity. Classes larger than this get a dedicated slab.
const SLAB_BYTES: usize = 1 << 20;

/// Upper bound on slabs per pool; the base-pointer table is lock-free and
/// fixed-size so the allocate path never takes the growth lock.
const MAX_SLABS: usize = 1024;

#[inline]
fn class_for(bytes: usize) -> Option<usize> {
    let wanted = bytes.max(1).next_power_of_two().max(1 << MIN_CLASS_SHIFT);
    let shift = wanted.trailing_zeros();
    if shift > MAX_CLASS_SHIFT {
        return None;
    }
    Some((shift - MIN_CLASS_SHIFT) as usize)
}

#[inline]
fn class_bytes(class: usize) -> usize {
    1 << (class as u32 + MIN_CLASS_SHIFT)
}

/// Location of a block inside its pool: slab index plus byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Block {
    slab: u32,
    offset: u32,
}

struct Slab {
    base: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for Slab {}

/// Counters exposed for tests and the profiler.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub allocations: u64,
    pub pool_hits: u64,
    pub slab_allocations: u64,
    pub merges: u64,
    pub splits: u64,
    pub bytes_reserved: u64,
    pub live_blocks: u64,
}

#[derive(Default)]
struct StatCells {
    allocations: AtomicU64,
    pool_hits: AtomicU64,
    slab_allocations: AtomicU64,
    merges: AtomicU64,
    splits: AtomicU64,
    bytes_reserved: AtomicU64,
    live_blocks: AtomicU64,
}

/// Shared pool state. Kept alive by the owning thread's handle *and* by
/// every outstanding [`Buffer`], so teardown releases the slabs back to the
/// system allocator only once the last buffer is gone.
pub struct PoolShared {
    classes: Box<[Stack<Block>]>,
    slab_bases: Box<[AtomicPtr<u8>]>,
    slab_count: AtomicUsize,
    growth: Mutex<Vec<Slab>>,
    stats: StatCells,
}

unsafe impl Send for PoolShared {}
unsafe impl Sync for PoolShared {}

impl PoolShared {
    fn create() -> Arc<Self> {
        Arc::new(PoolShared {
            classes: (0..NUM_CLASSES).map(|_| Stack::new()).collect(),
            slab_bases: (0..MAX_SLABS).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            slab_count: AtomicUsize::new(0),
            growth: Mutex::new(Vec::new()),
            stats: StatCells::default(),
        })
    }

    /// Returns a 64-byte-aligned buffer of at least `bytes`, drawn from the
    /// free list when possible and from a freshly carved slab otherwise.
    pub fn allocate(self: &Arc<Self>, bytes: usize) -> Result<Buffer> {
        let _scope = profiling::scope(profiling::ScopeKind::Allocation, "pool_allocate");
        let class = class_for(bytes).ok_or(EngineError::OutOfMemory { requested: bytes })?;
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);

        let block = if let Some(block) = self.classes[class].pop() {
            self.stats.pool_hits.fetch_add(1, Ordering::Relaxed);
            block
        } else if let Some(block) = self.split_from_above(class) {
            block
        } else {
            self.carve_slab(class, bytes)?
        };

        self.stats.live_blocks.fetch_add(1, Ordering::Relaxed);
        profiling::alloc_event(class_bytes(class));
        let ptr = self.block_ptr(block);
        Ok(Buffer {
            ptr,
            len: class_bytes(class),
            block,
            class,
            pool: Arc::clone(self),
        })
    }

    /// Takes one block from the next class up and halves it. A single-step
    /// split, mirroring the single-step merge on release.
    fn split_from_above(self: &Arc<Self>, class: usize) -> Option<Block> {
        if class + 1 >= NUM_CLASSES {
            return None;
        }
        let big = self.classes[class + 1].pop()?;
        let half = class_bytes(class) as u32;
        self.classes[class].push(Block {
            slab: big.slab,
            offset: big.offset + half,
        });
        self.stats.splits.fetch_add(1, Ordering::Relaxed);
        Some(big)
    }

    fn carve_slab(self: &Arc<Self>, class: usize, requested: usize) -> Result<Block> {
        let block_len = class_bytes(class);
        let slab_len = block_len.max(SLAB_BYTES);
        let layout = Layout::from_size_align(slab_len, BUFFER_ALIGN)
            .map_err(|_| EngineError::OutOfMemory { requested })?;

        let mut growth = self.growth.lock().expect("pool growth lock poisoned");
        let slab_index = self.slab_count.load(Ordering::Acquire);
        if slab_index >= MAX_SLABS {
            return Err(EngineError::OutOfMemory { requested });
        }
        let raw = unsafe { alloc(layout) };
        let base =
            NonNull::new(raw).ok_or(EngineError::OutOfMemory { requested })?;
        growth.push(Slab { base, layout });
        self.slab_bases[slab_index].store(base.as_ptr(), Ordering::Release);
        self.slab_count.store(slab_index + 1, Ordering::Release);
        drop(growth);

        self.stats.slab_allocations.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_reserved
            .fetch_add(slab_len as u64, Ordering::Relaxed);

        // Carve the whole slab into blocks of the requested class and retain
        // everything except the block handed back to the caller.
        let slab = slab_index as u32;
        let count = slab_len / block_len;
        for i in 1..count {
            self.classes[class].push(Block {
                slab,
                offset: (i * block_len) as u32,
            });
        }
        Ok(Block { slab, offset: 0 })
    }

    /// Returns a block to its class free list and attempts a single-step
    /// merge: if the current head of the list happens to be the buddy, the
    /// pair is promoted to the next class instead.
    fn release(&self, block: Block, class: usize) {
        self.stats.live_blocks.fetch_sub(1, Ordering::Relaxed);
        let size = class_bytes(class) as u32;
        if class + 1 < NUM_CLASSES {
            if let Some(candidate) = self.classes[class].pop() {
                let buddy_offset = block.offset ^ size;
                if candidate.slab == block.slab && candidate.offset == buddy_offset {
                    self.stats.merges.fetch_add(1, Ordering::Relaxed);
                    self.classes[class + 1].push(Block {
                        slab: block.slab,
                        offset: block.offset.min(candidate.offset),
                    });
                    return;
                }
                self.classes[class].push(candidate);
            }
        }
        self.classes[class].push(block);
    }

    fn block_ptr(&self, block: Block) -> NonNull<u8> {
        let base = self.slab_bases[block.slab as usize].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "block references an unpublished slab");
        unsafe { NonNull::new_unchecked(base.add(block.offset as usize)) }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.stats.allocations.load(Ordering::Relaxed),
            pool_hits: self.stats.pool_hits.load(Ordering::Relaxed),
            slab_allocations: self.stats.slab_allocations.load(Ordering::Relaxed),
            merges: self.stats.merges.load(Ordering::Relaxed),
            splits: self.stats.splits.load(Ordering::Relaxed),
            bytes_reserved: self.stats.bytes_reserved.load(Ordering::Relaxed),
            live_blocks: self.stats.live_blocks.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let growth = self.growth.get_mut().expect("pool growth lock poisoned");
        for slab in growth.drain(..) {
            unsafe { dealloc(slab.base.as_ptr(), slab.layout) };
        }
    }
}

thread_local! {
    static CURRENT_POOL: Arc<PoolShared> = PoolShared::create();
}

/// The calling thread's pool, created lazily on first use and torn down at
/// thread exit (outstanding buffers keep the slabs alive until released).
pub fn current() -> Arc<PoolShared> {
    CURRENT_POOL.with(Arc::clone)
}

/// Allocates from the calling thread's pool.
pub fn allocate(bytes: usize) -> Result<Buffer> {
    current().allocate(bytes)
}

/// A contiguous, 64-byte-aligned memory region owned by a pool.
///
/// Dropping the buffer returns its block to the originating pool's
/// lock-free free list, from whichever thread the drop happens on.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
    block: Block,
    class: usize,
    pool: Arc<PoolShared>,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Usable length in bytes (the full size-class block).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Zeroes the whole block.
    pub fn zero(&mut self) {
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), 0, self.len) };
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.release(self.block, self.class);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_round_up_to_64() {
        assert_eq!(class_for(1), Some(0));
        assert_eq!(class_for(64), Some(0));
        assert_eq!(class_for(65), Some(1));
        assert_eq!(class_for(4096), Some(6));
        assert_eq!(class_for(1 << 30), Some(NUM_CLASSES - 1));
        assert_eq!(class_for((1 << 30) + 1), None);
    }

    #[test]
    fn allocate_is_aligned_and_reused() {
        let pool = current();
        let first = pool.allocate(100).unwrap();
        assert_eq!(first.as_ptr() as usize % BUFFER_ALIGN, 0);
        assert!(first.len() >= 100);
        let addr = first.as_ptr() as usize;
        drop(first);
        // Same class comes back off the free list (head or its buddy peer).
        let second = pool.allocate(100).unwrap();
        assert_eq!(second.as_ptr() as usize % BUFFER_ALIGN, 0);
        let hits = pool.stats().pool_hits;
        assert!(hits >= 1 || second.as_ptr() as usize != addr);
    }
}

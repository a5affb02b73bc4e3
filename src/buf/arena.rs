//! Size-bucketed slab allocator with heap fallback, backing every
//! [`crate::buf::DynBuf`] in the runtime. Mirrors the pool-selection and
//! realloc contract of a fixed sequence of (slot-size, slot-count) pools,
//! falling through to the process heap once every pool is exhausted.
//!
//! The original used a hand-rolled intrusive free list per pool (a lazily
//! carved run of slots). Here each pool is a [`slab::Slab`], which gives the
//! same "reuse freed slots, grow lazily" behavior without unsafe pointer
//! arithmetic; pointer-range classification becomes a `(pool_index, key)`
//! tag instead of a raw address comparison.

use bytes::BytesMut;
use slab::Slab;

/// Default pool ladder, carried over from the prior implementation's dynstr
/// arena configuration: (slot size, slot count).
pub const DEFAULT_POOLS: &[(usize, usize)] = &[
    (32, 512),
    (128, 512),
    (256, 256),
    (1024, 256),
    (2048, 128),
    (8192, 32),
    (32768, 16),
];

struct Pool {
    slot_size: usize,
    capacity: usize,
    slots: Slab<Box<[u8]>>,
}

impl Pool {
    fn new(slot_size: usize, capacity: usize) -> Self {
        Pool {
            slot_size,
            capacity,
            slots: Slab::with_capacity(capacity),
        }
    }

    fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    fn insert(&mut self) -> usize {
        self.slots.insert(vec![0u8; self.slot_size].into_boxed_slice())
    }
}

/// An allocation handle. Opaque to callers; classified by which pool (if
/// any) produced it rather than by address, since real pointers would not
/// be safe to hand out from a `Slab`-backed pool.
pub enum Block {
    Pooled {
        pool: usize,
        key: usize,
        capacity: usize,
    },
    Heap(BytesMut),
}

impl Block {
    pub fn capacity(&self) -> usize {
        match self {
            Block::Pooled { capacity, .. } => *capacity,
            Block::Heap(b) => b.capacity(),
        }
    }
}

pub struct SlabArena {
    pools: Vec<Pool>,
    allow_heap: bool,
}

impl SlabArena {
    pub fn new(pools: &[(usize, usize)], allow_heap: bool) -> Self {
        let mut sorted: Vec<(usize, usize)> = pools.to_vec();
        sorted.sort_by_key(|(sz, _)| *sz);
        SlabArena {
            pools: sorted
                .into_iter()
                .map(|(sz, cap)| Pool::new(sz, cap))
                .collect(),
            allow_heap,
        }
    }

    pub fn with_default_pools(allow_heap: bool) -> Self {
        Self::new(DEFAULT_POOLS, allow_heap)
    }

    /// Smallest pool whose slot size fits `size`, walking to larger pools
    /// when the first candidate is full.
    fn pool_for_size(&self, size: usize) -> Option<usize> {
        self.pools
            .iter()
            .enumerate()
            .filter(|(_, p)| p.slot_size >= size && !p.is_full())
            .map(|(i, _)| i)
            .next()
    }

    pub fn alloc(&mut self, size: usize) -> Block {
        if let Some(idx) = self.pool_for_size(size) {
            let pool = &mut self.pools[idx];
            let key = pool.insert();
            return Block::Pooled {
                pool: idx,
                key,
                capacity: pool.slot_size,
            };
        }
        Block::Heap(BytesMut::zeroed(size.max(1)))
    }

    pub fn free(&mut self, block: Block) {
        if let Block::Pooled { pool, key, .. } = block {
            self.pools[pool].slots.remove(key);
        }
    }

    /// Realloc, preserving `min(old_capacity, new_size)` bytes. A request
    /// that still fits the current pool's slot size is a no-op.
    pub fn realloc(&mut self, block: Block, new_size: usize) -> Block {
        match &block {
            Block::Pooled { capacity, .. } if new_size <= *capacity => return block,
            Block::Heap(b) if new_size <= b.capacity() => return block,
            _ => {}
        }

        let old_capacity = block.capacity();
        let mut new_block = self.alloc(new_size);
        let copy_len = old_capacity.min(new_size);
        {
            let (src, dst) = (self.storage(&block), self.storage_mut(&mut new_block));
            dst[..copy_len].copy_from_slice(&src[..copy_len]);
        }
        self.free(block);
        new_block
    }

    pub fn storage(&self, block: &Block) -> &[u8] {
        match block {
            Block::Pooled { pool, key, .. } => &self.pools[*pool].slots[*key],
            Block::Heap(b) => b,
        }
    }

    pub fn storage_mut(&mut self, block: &mut Block) -> &mut [u8] {
        match block {
            Block::Pooled { pool, key, .. } => &mut self.pools[*pool].slots[*key],
            Block::Heap(b) => b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_fitting_pool_is_chosen() {
        let mut arena = SlabArena::new(&[(32, 4), (128, 4)], false);
        let b = arena.alloc(10);
        assert_eq!(b.capacity(), 32);
    }

    #[test]
    fn pool_exhaustion_walks_to_larger_pool() {
        let mut arena = SlabArena::new(&[(32, 1), (128, 4)], false);
        let _first = arena.alloc(10);
        let second = arena.alloc(10);
        assert_eq!(second.capacity(), 128);
    }

    #[test]
    fn heap_fallback_when_every_pool_full() {
        let mut arena = SlabArena::new(&[(32, 1)], true);
        let _first = arena.alloc(10);
        let second = arena.alloc(10);
        assert!(matches!(second, Block::Heap(_)));
    }

    #[test]
    fn realloc_within_same_pool_is_noop_on_capacity() {
        let mut arena = SlabArena::new(&[(32, 4), (128, 4)], false);
        let b = arena.alloc(10);
        let b = arena.realloc(b, 20);
        assert_eq!(b.capacity(), 32);
    }

    #[test]
    fn realloc_preserves_bytes_across_pool_migration() {
        let mut arena = SlabArena::new(&[(8, 4), (64, 4)], false);
        let mut b = arena.alloc(4);
        arena.storage_mut(&mut b)[..4].copy_from_slice(b"abcd");
        let b = arena.realloc(b, 40);
        assert_eq!(b.capacity(), 64);
        assert_eq!(&arena.storage(&b)[..4], b"abcd");
    }
}

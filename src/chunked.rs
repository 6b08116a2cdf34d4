//! Chunked pools.
//!
//! Instead of asking the heap for every object, a chunked pool maps chunks of
//! page memory that fit at least [`MEM_MIN_FREE`] objects and threads every
//! slot of a chunk into that chunk's own free list. The only overhead left per
//! object is nothing at all: free bookkeeping lives inside the free slots.
//!
//! Chunks are created on demand and linked in ascending address order. Freed
//! objects first land in a pool wide pending cache, which is what the next
//! allocations are served from. A clean hands every pending object back to the
//! chunk it was carved from (the chunk index, a [`SplayTree`], finds it), then
//! releases chunks that have been idle for long enough and rebuilds the chain
//! of chunks with free slots so that the fullest chunks are used first. That
//! slowly drains the emptier chunks until they become idle and can go.
//!
//! ```text
//!  first                                  next_free
//!    |                                        |
//!    v                                        v
//! +-------+ next  +-------+ next  +-------+      +-------+ next_free +-------+
//! | 0x1000| ----> | 0x5000| ----> | 0x9000|      | 0x9000| --------> | 0x5000|
//! | 3 used|       | 1 used|       | 6 used|      | 6 used|           | 1 used|
//! +-------+       +-------+       +-------+      +-------+           +-------+
//!          all chunks, by address                  chunks with free slots
//! ```

use std::{
    mem,
    ptr::{self, NonNull},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    chunk::{Chunk, ChunkArena, ChunkId, ChunkKey},
    freelist::FreeList,
    kernel,
    meter::{CallCounters, PoolMeter},
    pool::PoolStrategy,
    splay::SplayTree,
    stats::ChunkCensus,
    utils::align,
};

/// Chunk size a pool starts with.
pub const MEM_CHUNK_SIZE: usize = 4096 * 4;
/// No chunk gets bigger than this, whatever was requested.
pub const MEM_CHUNK_MAX_SIZE: usize = 256 * 1024;
/// Fewest objects a chunk is sized for.
pub const MEM_MIN_FREE: usize = 32;
/// Most objects a chunk is sized for.
pub const MEM_MAX_FREE: usize = 65535;

/// Age used when cleaning for statistics. Nothing is ever that old.
const STATS_MAX_AGE: Duration = Duration::MAX;

pub(crate) struct ChunkedPool {
    object_size: usize,
    zero_on_free: bool,
    chunk_size: usize,
    chunk_capacity: usize,
    /// Objects freed since the last clean, not yet back in their chunk.
    pending: FreeList,
    /// Head of the chain of all chunks, lowest address first.
    first: Option<ChunkId>,
    /// Head of the chain of chunks with at least one free slot.
    next_free: Option<ChunkId>,
    chunks: ChunkArena,
    index: SplayTree<ChunkKey>,
}

// SAFETY: the pool exclusively owns its chunks and every slot in them that is
// not handed out.
unsafe impl Send for ChunkedPool {}

impl ChunkedPool {
    pub fn new(object_size: usize) -> Self {
        let mut pool = Self {
            object_size,
            zero_on_free: true,
            chunk_size: 0,
            chunk_capacity: 0,
            pending: FreeList::new(),
            first: None,
            next_free: None,
            chunks: ChunkArena::new(),
            index: SplayTree::new(),
        };

        pool.resize_chunks(MEM_CHUNK_SIZE);
        pool
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Picks the chunk size closest to `requested` that is a whole number of
    /// pages and fits between [`MEM_MIN_FREE`] and [`MEM_MAX_FREE`] objects
    /// without going over [`MEM_CHUNK_MAX_SIZE`]. Ignored once a chunk exists.
    fn resize_chunks(&mut self, requested: usize) {
        if self.first.is_some() {
            return;
        }

        let page = kernel::page_size();
        let size = align(requested, page);

        let mut capacity = (size / self.object_size).max(MEM_MIN_FREE);
        let too_big = capacity
            .checked_mul(self.object_size)
            .is_none_or(|bytes| bytes > MEM_CHUNK_MAX_SIZE);
        if too_big {
            capacity = MEM_CHUNK_MAX_SIZE / self.object_size;
        }
        let capacity = capacity.min(MEM_MAX_FREE).max(1);

        // Clamping may have left a partial page behind, round again and fill it.
        let size = align(capacity * self.object_size, page);

        self.chunk_size = size;
        self.chunk_capacity = size / self.object_size;

        debug!(
            object_size = self.object_size,
            requested,
            chunk_size = self.chunk_size,
            chunk_capacity = self.chunk_capacity,
            "chunk size selected"
        );
    }

    /// Ids of every chunk, lowest address first.
    fn chain(&self) -> impl Iterator<Item = ChunkId> + '_ {
        std::iter::successors(self.first, |id| self.chunks[*id].next)
    }

    /// Ids of the chunks with free slots, in the order they are used.
    #[cfg(test)]
    fn free_chain(&self) -> impl Iterator<Item = ChunkId> + '_ {
        std::iter::successors(self.next_free, |id| self.chunks[*id].next_free)
    }

    /// Chunk whose memory contains `addr`.
    fn owner_of(&mut self, addr: usize) -> Option<ChunkId> {
        let size = self.chunk_size;

        self.index
            .find(&addr, |addr, key| ChunkKey::locate(*addr, key, size))
            .found()
            .map(|key| key.id)
    }

    /// Maps a new chunk, makes it the first choice for allocations and links
    /// it into the address ordered chain.
    fn create_chunk(&mut self, meter: &mut PoolMeter) -> ChunkId {
        let chunk = Chunk::new(self.chunk_size, self.chunk_capacity, self.object_size);
        let base = chunk.addr();
        let id = self.chunks.insert(chunk);

        self.chunks[id].next_free = self.next_free;
        self.next_free = Some(id);

        meter.alloc.add(self.chunk_capacity as i64);
        meter.idle.add(self.chunk_capacity as i64);

        self.index.insert(self.chunks[id].key(id), ChunkKey::by_base);

        // Lower addresses sit closer to the head. Cleans start there, so the
        // chunks in highest memory are the ones that tend to become idle.
        match self.first {
            None => self.first = Some(id),
            Some(head) if base < self.chunks[head].addr() => {
                self.chunks[id].next = Some(head);
                self.first = Some(id);
            }
            Some(head) => {
                let mut prev = head;
                loop {
                    let next = self.chunks[prev].next;
                    match next {
                        Some(next) if self.chunks[next].addr() < base => prev = next,
                        _ => {
                            self.chunks[id].next = next;
                            self.chunks[prev].next = Some(id);
                            break;
                        }
                    }
                }
            }
        }

        debug!(
            chunk = ?self.chunks[id].base,
            chunk_size = self.chunk_size,
            chunks = self.chunks.len(),
            "created chunk"
        );

        id
    }

    /// Releases an idle chunk. The caller has already unlinked it from the chain.
    fn destroy_chunk(&mut self, id: ChunkId, meter: &mut PoolMeter) {
        let chunk = self.chunks.remove(id);
        debug_assert!(chunk.is_idle(), "destroying a chunk with objects in use");

        meter.alloc.subtract(self.chunk_capacity as i64);
        meter.idle.subtract(self.chunk_capacity as i64);

        self.index.remove(&chunk.key(id), ChunkKey::by_base);

        debug!(
            chunk = ?chunk.base,
            chunks = self.chunks.len(),
            "released chunk"
        );
    }

    /// Hands out a slot: a pending free if there is one, otherwise the next
    /// slot of the preferred chunk, mapping a new chunk when none has room.
    /// Only the call that maps a chunk is not a saved call.
    fn get(&mut self, meter: &mut PoolMeter, calls: &mut CallCounters) -> NonNull<u8> {
        if let Some(obj) = self.pending.pop() {
            calls.saved += 1;
            return obj;
        }

        let id = match self.next_free {
            Some(id) => {
                calls.saved += 1;
                id
            }
            None => self.create_chunk(meter),
        };

        let chunk = &mut self.chunks[id];
        let obj = chunk
            .free_list
            .pop()
            .expect("chunk on the free chain has no free slot");
        chunk.in_use += 1;
        chunk.last_referenced = Instant::now();

        if chunk.free_list.is_empty() {
            // Last free slot, take the chunk off the chain.
            self.next_free = chunk.next_free;
        }

        obj
    }

    /// Parks a freed object in the pending cache.
    unsafe fn push(&mut self, obj: NonNull<u8>) {
        if self.zero_on_free {
            unsafe { ptr::write_bytes(obj.as_ptr(), 0, self.object_size) };
        }

        unsafe { self.pending.push(obj) };
    }

    /// Moves every pending object back onto the free list of its own chunk.
    ///
    /// # Panics
    ///
    /// Panics if a pending object is not inside any chunk of this pool.
    fn drain_pending(&mut self) {
        self.return_pending(|obj, reason| panic!("freed object {obj:p} {reason}"));
    }

    /// Same as [`ChunkedPool::drain_pending`] but drops objects that have no
    /// chunk to go back to instead of panicking. Returns how many were dropped.
    fn settle_pending(&mut self) -> usize {
        let mut strays = 0;
        self.return_pending(|_, _| strays += 1);
        strays
    }

    /// Returns pending objects to their chunks, handing the ones that can't be
    /// placed to `stray` together with what is wrong with them.
    fn return_pending<F>(&mut self, mut stray: F)
    where
        F: FnMut(NonNull<u8>, &'static str),
    {
        let now = Instant::now();

        while let Some(obj) = self.pending.pop() {
            let Some(id) = self.owner_of(obj.as_ptr() as usize) else {
                stray(obj, "does not belong to any chunk of this pool");
                continue;
            };

            let chunk = &mut self.chunks[id];
            if chunk.is_idle() {
                stray(obj, "belongs to an idle chunk");
                continue;
            }

            chunk.in_use -= 1;
            unsafe { chunk.free_list.push(obj) };
            chunk.last_referenced = now;
        }
    }

    /// Whether chunk `a` should be used before chunk `b`: fuller first, lower
    /// address first among equally full chunks.
    fn preferred(&self, a: ChunkId, b: ChunkId) -> bool {
        let (a, b) = (&self.chunks[a], &self.chunks[b]);
        a.in_use > b.in_use || (a.in_use == b.in_use && a.addr() < b.addr())
    }

    /// Releases idle chunks past `max_age`, except the first chunk of the chain.
    fn release_idle(&mut self, head: ChunkId, max_age: Duration, meter: &mut PoolMeter) {
        let now = Instant::now();
        let mut prev = head;

        while let Some(id) = self.chunks[prev].next {
            let chunk = &mut self.chunks[id];
            chunk.next_free = None;

            let age = now.saturating_duration_since(chunk.last_referenced);
            if chunk.is_idle() && age >= max_age {
                self.chunks[prev].next = self.chunks[id].next;
                self.destroy_chunk(id, meter);
            } else {
                prev = id;
            }
        }
    }

    /// Rebuilds the chain of chunks with free slots from scratch. The first
    /// chunk stays on top no matter how full, the rest are sorted with
    /// [`ChunkedPool::preferred`].
    fn rebuild_free_chain(&mut self, head: ChunkId) {
        self.next_free = Some(head);
        self.chunks[head].next_free = None;

        let mut cursor = self.chunks[head].next;
        while let Some(id) = cursor {
            cursor = self.chunks[id].next;
            self.chunks[id].next_free = None;

            if self.chunks[id].in_use == self.chunk_capacity {
                continue;
            }

            let mut tail = head;
            while let Some(candidate) = self.chunks[tail].next_free {
                if self.preferred(id, candidate) {
                    break;
                }
                tail = candidate;
            }

            self.chunks[id].next_free = self.chunks[tail].next_free;
            self.chunks[tail].next_free = Some(id);
        }

        if self.chunks[head].in_use == self.chunk_capacity {
            self.next_free = self.chunks[head].next_free;
        }
    }
}

impl PoolStrategy for ChunkedPool {
    fn allocate(&mut self, meter: &mut PoolMeter, calls: &mut CallCounters) -> NonNull<u8> {
        let obj = self.get(meter, calls);

        debug_assert!(meter.idle.level() > 0);
        meter.idle.decrement();
        meter.inuse.increment();
        obj
    }

    unsafe fn deallocate(&mut self, obj: NonNull<u8>, _aggressive: bool, meter: &mut PoolMeter) {
        unsafe { self.push(obj) };

        debug_assert!(meter.inuse.level() > 0);
        meter.inuse.decrement();
        meter.idle.increment();
    }

    fn idle_trigger(&self, shift: u32, meter: &PoolMeter) -> bool {
        meter.idle.level() > (self.chunk_capacity << shift) as i64
    }

    fn clean(&mut self, max_age: Duration, meter: &mut PoolMeter) {
        let Some(head) = self.first else {
            return;
        };

        self.drain_pending();
        self.release_idle(head, max_age, meter);
        self.rebuild_free_chain(head);
    }

    fn census(&mut self, meter: &mut PoolMeter) -> ChunkCensus {
        self.clean(STATS_MAX_AGE, meter);

        let mut census = ChunkCensus {
            chunk_capacity: self.chunk_capacity(),
            chunk_size: self.chunk_size(),
            chunks_alloc: self.chunk_count(),
            ..ChunkCensus::default()
        };

        for id in self.chain() {
            match self.chunks[id].in_use {
                0 => census.chunks_free += 1,
                n if n < self.chunk_capacity => census.chunks_partial += 1,
                _ => {}
            }
        }

        census
    }

    fn set_chunk_size(&mut self, size: usize) {
        self.resize_chunks(size);
    }

    fn set_zero_on_free(&mut self, enabled: bool) {
        self.zero_on_free = enabled;
    }

    fn overhead(&self) -> usize {
        // Every chunk costs its header plus a node in the index.
        let per_chunk = mem::size_of::<Chunk>() + mem::size_of::<ChunkKey>() + 2 * mem::size_of::<usize>();
        mem::size_of::<ChunkedPool>() + self.chunk_count() * per_chunk
    }
}

impl Drop for ChunkedPool {
    fn drop(&mut self) {
        let strays = self.settle_pending();
        if strays > 0 {
            warn!(
                object_size = self.object_size,
                strays,
                "pool dropped with freed objects outside its chunks, ignoring them"
            );
        }
        self.index.destroy(drop);

        let mut leaked = 0;
        for chunk in self.chunks.drain() {
            if chunk.is_idle() {
                drop(chunk);
            } else {
                // Somebody still points into this chunk.
                mem::forget(chunk);
                leaked += 1;
            }
        }

        if leaked > 0 {
            warn!(
                object_size = self.object_size,
                leaked_chunks = leaked,
                "pool dropped with objects in use, leaking their chunks"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Harness {
        pool: ChunkedPool,
        meter: PoolMeter,
        calls: CallCounters,
    }

    impl Harness {
        fn new(object_size: usize) -> Self {
            Self {
                pool: ChunkedPool::new(object_size),
                meter: PoolMeter::new(),
                calls: CallCounters::default(),
            }
        }

        fn alloc(&mut self) -> NonNull<u8> {
            self.pool.allocate(&mut self.meter, &mut self.calls)
        }

        fn free(&mut self, obj: NonNull<u8>) {
            unsafe { self.pool.deallocate(obj, false, &mut self.meter) }
        }

        fn clean(&mut self, max_age: Duration) {
            self.pool.clean(max_age, &mut self.meter);
        }

        /// Allocates until `chunks` chunks are completely full.
        fn fill(&mut self, chunks: usize) -> Vec<NonNull<u8>> {
            let count = chunks * self.pool.chunk_capacity();
            (0..count).map(|_| self.alloc()).collect()
        }

        fn in_use_by_address(&self) -> Vec<usize> {
            self.pool.chain().map(|id| self.pool.chunks[id].in_use).collect()
        }

        /// Conservation holds once pending frees are settled.
        fn assert_conserved(&self) {
            assert!(self.pool.pending.is_empty());

            let in_chunks: usize = self.in_use_by_address().iter().sum();
            assert_eq!(
                in_chunks as i64 + self.meter.idle.level(),
                self.meter.alloc.level()
            );
            assert_eq!(
                self.meter.alloc.level(),
                (self.pool.chunk_count() * self.pool.chunk_capacity()) as i64
            );
            assert_eq!(in_chunks as i64, self.meter.inuse.level());
        }
    }

    #[test]
    fn capacity_for_small_objects() {
        let pool = ChunkedPool::new(8);
        let capacity = pool.chunk_capacity();

        assert!((MEM_MIN_FREE..=MEM_MAX_FREE).contains(&capacity));
        assert!(capacity * 8 <= MEM_CHUNK_MAX_SIZE);
        assert_eq!(pool.chunk_size() % kernel::page_size(), 0);
        assert_eq!(pool.chunk_size(), capacity * 8);
    }

    #[test]
    fn capacity_clamps() {
        // Large objects still get the minimum count per chunk.
        let pool = ChunkedPool::new(1024);
        assert!(pool.chunk_capacity() >= MEM_MIN_FREE);
        assert_eq!(pool.chunk_size() % kernel::page_size(), 0);

        // And huge requests are capped.
        let mut pool = ChunkedPool::new(8);
        pool.set_chunk_size(64 * 1024 * 1024);
        assert!(pool.chunk_size() <= MEM_CHUNK_MAX_SIZE);
        assert!(pool.chunk_capacity() <= MEM_MAX_FREE);

        // Objects bigger than a maximum chunk get one per chunk.
        let pool = ChunkedPool::new(MEM_CHUNK_MAX_SIZE * 2);
        assert_eq!(pool.chunk_capacity(), 1);

        // Even when the minimum count of them would not fit in a usize.
        let pool = ChunkedPool::new(crate::pool::MAX_OBJECT_SIZE);
        assert_eq!(pool.chunk_capacity(), 1);
        assert!(pool.chunk_size() >= crate::pool::MAX_OBJECT_SIZE);
    }

    #[test]
    fn chunk_size_is_fixed_once_chunks_exist() {
        let mut h = Harness::new(64);
        let before = h.pool.chunk_size();
        h.alloc();

        h.pool.set_chunk_size(before * 4);
        assert_eq!(h.pool.chunk_size(), before);
    }

    #[test]
    fn first_chunk_is_created_on_demand() {
        let mut h = Harness::new(32);
        assert_eq!(h.pool.chunk_count(), 0);

        let obj = h.alloc();
        assert_eq!(h.pool.chunk_count(), 1);
        assert_eq!(h.meter.alloc.level(), h.pool.chunk_capacity() as i64);
        assert_eq!(h.meter.inuse.level(), 1);
        assert_eq!(h.calls.saved, 0);

        let first = h.pool.first.unwrap();
        assert_eq!(obj, h.pool.chunks[first].base);
    }

    #[test]
    fn pending_frees_are_served_first() {
        let mut h = Harness::new(32);
        let a = h.alloc();
        let _b = h.alloc();

        h.free(a);
        assert_eq!(h.alloc(), a);
        assert_eq!(h.calls.saved, 2);
    }

    #[test]
    fn only_mapping_a_chunk_is_not_saved() {
        let mut h = Harness::new(512);
        let capacity = h.pool.chunk_capacity();

        for _ in 0..10 {
            h.alloc();
        }
        assert_eq!(h.calls.saved, 9);

        // Filling the first chunk and spilling into a second maps one more.
        for _ in 10..capacity + 1 {
            h.alloc();
        }
        assert_eq!(h.pool.chunk_count(), 2);
        assert_eq!(h.calls.saved, capacity - 1);
    }

    #[test]
    fn new_chunk_when_all_full() {
        let mut h = Harness::new(256);
        let objects = h.fill(2);

        assert_eq!(h.pool.chunk_count(), 2);
        assert!(h.pool.next_free.is_none());
        assert_eq!(h.meter.idle.level(), 0);

        h.alloc();
        assert_eq!(h.pool.chunk_count(), 3);
        assert_eq!(objects.len(), 2 * h.pool.chunk_capacity());
    }

    #[test]
    fn chain_is_ordered_by_address() {
        let mut h = Harness::new(512);
        h.fill(6);

        let addrs: Vec<usize> = h.pool.chain().map(|id| h.pool.chunks[id].addr()).collect();
        let mut sorted = addrs.clone();
        sorted.sort_unstable();

        assert_eq!(addrs.len(), 6);
        assert_eq!(addrs, sorted);
    }

    #[test]
    fn index_resolves_every_address_of_every_chunk() {
        let mut h = Harness::new(128);
        h.fill(3);

        let size = h.pool.chunk_size();
        let chunks: Vec<(ChunkId, usize)> = h
            .pool
            .chain()
            .map(|id| (id, h.pool.chunks[id].addr()))
            .collect();

        for (id, base) in &chunks {
            for addr in [*base, base + 1, base + size / 2, base + size - 1] {
                assert_eq!(h.pool.owner_of(addr), Some(*id));
            }
        }

        let lowest = chunks.iter().map(|(_, base)| *base).min().unwrap();
        assert_eq!(h.pool.owner_of(lowest - 1), None);
        for (_, base) in &chunks {
            if !chunks.iter().any(|(_, other)| *other == base + size) {
                assert_eq!(h.pool.owner_of(base + size), None);
            }
        }
    }

    #[test]
    fn clean_returns_pending_to_their_chunks() {
        let mut h = Harness::new(64);
        let objects = h.fill(2);

        for obj in objects.iter().step_by(2) {
            h.free(*obj);
        }
        assert_eq!(h.pool.pending.len(), objects.len() / 2);

        h.clean(Duration::MAX);

        assert!(h.pool.pending.is_empty());
        assert_eq!(h.in_use_by_address().iter().sum::<usize>(), objects.len() / 2);
        h.assert_conserved();
    }

    #[test]
    fn reclamation_keeps_first_chunk_and_sorts_by_fill() {
        let mut h = Harness::new(512);
        let capacity = h.pool.chunk_capacity();
        let objects = h.fill(3);

        // Chunk order by address, and which objects live in which chunk.
        let chain: Vec<ChunkId> = h.pool.chain().collect();
        let size = h.pool.chunk_size();
        let owner = |obj: &NonNull<u8>, h: &Harness| {
            let addr = obj.as_ptr() as usize;
            chain
                .iter()
                .position(|id| {
                    let base = h.pool.chunks[*id].addr();
                    addr >= base && addr < base + size
                })
                .unwrap()
        };

        // Leave [0, 5, 0] objects in use, by address.
        let mut kept = 0;
        for obj in &objects {
            if owner(obj, &h) == 1 && kept < 5 {
                kept += 1;
                continue;
            }
            h.free(*obj);
        }

        h.clean(Duration::ZERO);

        // The first chunk survives although idle, the last one is gone.
        assert_eq!(h.pool.chunk_count(), 2);
        assert_eq!(h.in_use_by_address(), vec![0, 5]);
        assert_eq!(h.pool.chain().next(), Some(chain[0]));

        // The first chunk leads the free chain, the rest follow fullest first.
        let free_chain: Vec<usize> = h
            .pool
            .free_chain()
            .map(|id| h.pool.chunks[id].in_use)
            .collect();
        assert_eq!(free_chain, vec![0, 5]);
        assert!(capacity > 5);
        h.assert_conserved();
    }

    #[test]
    fn free_chain_prefers_fuller_chunks() {
        let mut h = Harness::new(512);
        let capacity = h.pool.chunk_capacity();
        let objects = h.fill(4);
        let chain: Vec<ChunkId> = h.pool.chain().collect();
        let size = h.pool.chunk_size();

        // In use per chunk by address: full, 1, capacity - 1, 1.
        let wanted = [capacity, 1, capacity - 1, 1];
        let mut kept = [0usize; 4];
        for obj in &objects {
            let addr = obj.as_ptr() as usize;
            let slot = chain
                .iter()
                .position(|id| {
                    let base = h.pool.chunks[*id].addr();
                    addr >= base && addr < base + size
                })
                .unwrap();

            if kept[slot] < wanted[slot] {
                kept[slot] += 1;
            } else {
                h.free(*obj);
            }
        }

        h.clean(Duration::MAX);

        // The full first chunk is dropped from the chain, equal fills go by address.
        let order: Vec<ChunkId> = h.pool.free_chain().collect();
        assert_eq!(order, vec![chain[2], chain[1], chain[3]]);
        assert_eq!(h.pool.next_free, Some(chain[2]));
        h.assert_conserved();
    }

    #[test]
    fn young_idle_chunks_survive() {
        let mut h = Harness::new(512);
        let objects = h.fill(2);
        for obj in objects {
            h.free(obj);
        }

        h.clean(Duration::from_secs(3600));
        assert_eq!(h.pool.chunk_count(), 2);

        h.clean(Duration::ZERO);
        assert_eq!(h.pool.chunk_count(), 1);
        assert_eq!(h.meter.alloc.level(), h.pool.chunk_capacity() as i64);
        h.assert_conserved();
    }

    #[test]
    fn repeated_clean_is_idempotent() {
        let mut h = Harness::new(96);
        let objects = h.fill(3);
        for obj in objects.iter().skip(7).step_by(3) {
            h.free(*obj);
        }

        let max_age = Duration::from_secs(60);
        h.clean(max_age);
        let census = h.pool.census(&mut h.meter);
        let meter = h.meter.clone();

        h.clean(max_age);
        assert_eq!(h.pool.census(&mut h.meter), census);
        assert_eq!(h.meter, meter);
    }

    #[test]
    fn idle_trigger_needs_more_than_a_chunk_of_slack() {
        let mut h = Harness::new(512);
        let capacity = h.pool.chunk_capacity() as i64;
        let objects = h.fill(3);

        assert!(!h.pool.idle_trigger(0, &h.meter));
        for obj in &objects[..(capacity as usize + 1)] {
            h.free(*obj);
        }
        assert!(h.pool.idle_trigger(0, &h.meter));
        assert!(!h.pool.idle_trigger(1, &h.meter));
    }

    #[test]
    fn census_counts_chunk_states() {
        let mut h = Harness::new(512);
        let capacity = h.pool.chunk_capacity();
        let objects = h.fill(3);

        // Free the whole of the last allocated chunk's objects and one more.
        for obj in &objects[capacity * 2 - 1..] {
            h.free(*obj);
        }

        let census = h.pool.census(&mut h.meter);
        assert_eq!(census.chunks_alloc, 3);
        assert_eq!(census.chunks_free, 1);
        assert_eq!(census.chunks_partial, 1);
        assert_eq!(census.chunk_capacity, capacity);
        h.assert_conserved();
    }

    #[test]
    #[should_panic(expected = "does not belong to any chunk")]
    fn foreign_object_is_fatal_on_clean() {
        let mut h = Harness::new(16);
        h.alloc();

        let mut foreign = [0u64; 2];
        h.free(NonNull::from(&mut foreign).cast());
        h.clean(Duration::MAX);
    }

    #[test]
    fn drop_ignores_foreign_pending_objects() {
        let mut h = Harness::new(16);
        let obj = h.alloc();
        h.free(obj);

        let mut foreign = [0u64; 2];
        h.free(NonNull::from(&mut foreign).cast());

        assert_eq!(h.pool.settle_pending(), 1);
        assert!(h.pool.pending.is_empty());
        assert_eq!(h.in_use_by_address(), vec![0]);

        h.free(NonNull::from(&mut foreign).cast());
        drop(h);
    }

    proptest! {
        #[test]
        fn meters_and_index_stay_consistent(ops in proptest::collection::vec(any::<(bool, u16)>(), 1..600)) {
            let mut h = Harness::new(512);
            let mut live: Vec<NonNull<u8>> = Vec::new();

            for (allocate, pick) in ops {
                if allocate || live.is_empty() {
                    live.push(h.alloc());
                } else {
                    let obj = live.swap_remove(pick as usize % live.len());
                    h.free(obj);
                }

                let meter = &h.meter;
                prop_assert_eq!(meter.alloc.level(), meter.inuse.level() + meter.idle.level());
                prop_assert_eq!(meter.inuse.level(), live.len() as i64);
            }

            h.clean(Duration::ZERO);
            h.assert_conserved();

            // Every surviving chunk is in the index, released ones are gone.
            let size = h.pool.chunk_size();
            let chunks: Vec<(ChunkId, usize)> =
                h.pool.chain().map(|id| (id, h.pool.chunks[id].addr())).collect();
            prop_assert_eq!(h.pool.index.len(), chunks.len());
            for (id, base) in chunks {
                prop_assert_eq!(h.pool.owner_of(base), Some(id));
                prop_assert_eq!(h.pool.owner_of(base + size - 1), Some(id));
            }

            for obj in live.drain(..) {
                h.free(obj);
            }
            h.clean(Duration::ZERO);
            prop_assert_eq!(h.pool.chunk_count(), 1);
            prop_assert_eq!(h.meter.inuse.level(), 0);
        }
    }
}

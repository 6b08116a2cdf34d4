use std::{
    cmp::Ordering,
    ops::{Index, IndexMut},
    ptr::NonNull,
    time::Instant,
};

use crate::{freelist::FreeList, kernel};

/// Stable handle of a [`Chunk`] inside a [`ChunkArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChunkId(usize);

/// One contiguous region of page memory divided into `capacity` slots of the
/// pool's object size. Unused slots are threaded into the chunk's own free
/// list, so apart from this header there is no bookkeeping per object:
///
/// ```text
///  base
///   |
///   v
/// +--------+--------+--------+--------+-----+--------+
/// |  used  |  free ----------> free  ------>  | free --> null
/// +--------+--------+--------+--------+-----+--------+
///   slot 0   slot 1   slot 2   slot 3         slot n
/// ```
///
/// Chunks are linked in two chains by handle: `next` orders every chunk of
/// the pool by ascending address, `next_free` links the chunks that still
/// have a free slot in the order allocations should prefer them.
pub(crate) struct Chunk {
    /// Start of the region returned by [`kernel::request_region`].
    pub base: NonNull<u8>,
    /// Size of the region in bytes.
    pub size: usize,
    pub free_list: FreeList,
    /// Slots handed out, including the ones sitting in the pool's pending cache.
    pub in_use: usize,
    pub last_referenced: Instant,
    pub next: Option<ChunkId>,
    pub next_free: Option<ChunkId>,
}

impl Chunk {
    /// Maps a zeroed region of `size` bytes and threads `capacity` slots of
    /// `object_size` bytes into the chunk's free list.
    pub fn new(size: usize, capacity: usize, object_size: usize) -> Self {
        debug_assert!(capacity * object_size <= size);

        let base = kernel::request_region(size);
        let mut free_list = FreeList::new();

        unsafe { free_list.thread(base, capacity, object_size) };

        Self {
            base,
            size,
            free_list,
            in_use: 0,
            last_referenced: Instant::now(),
            next: None,
            next_free: None,
        }
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.in_use == 0
    }

    #[inline]
    pub fn key(&self, id: ChunkId) -> ChunkKey {
        ChunkKey {
            base: self.addr(),
            id,
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { kernel::release_region(self.base, self.size) }
    }
}

/// Entry of the chunk index: where a chunk starts and which chunk it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkKey {
    pub base: usize,
    pub id: ChunkId,
}

impl ChunkKey {
    /// Orders index entries by base address.
    #[inline]
    pub fn by_base(a: &ChunkKey, b: &ChunkKey) -> Ordering {
        a.base.cmp(&b.base)
    }

    /// Places `addr` before, inside or after the `size` bytes the chunk spans.
    #[inline]
    pub fn locate(addr: usize, key: &ChunkKey, size: usize) -> Ordering {
        if addr < key.base {
            Ordering::Less
        } else if addr < key.base + size {
            Ordering::Equal
        } else {
            Ordering::Greater
        }
    }
}

/// Slab of chunks addressed by [`ChunkId`]. Vacated handles are reused.
pub(crate) struct ChunkArena {
    slots: Vec<Option<Chunk>>,
    vacant: Vec<usize>,
    live: usize,
}

impl ChunkArena {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            live: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn insert(&mut self, chunk: Chunk) -> ChunkId {
        self.live += 1;

        match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(chunk);
                ChunkId(index)
            }
            None => {
                self.slots.push(Some(chunk));
                ChunkId(self.slots.len() - 1)
            }
        }
    }

    pub fn remove(&mut self, id: ChunkId) -> Chunk {
        let chunk = self.slots[id.0].take().expect("stale chunk handle");
        self.vacant.push(id.0);
        self.live -= 1;
        chunk
    }

    /// Takes every chunk out of the arena.
    pub fn drain(&mut self) -> impl Iterator<Item = Chunk> + '_ {
        self.vacant.clear();
        self.live = 0;
        self.slots.drain(..).flatten()
    }
}

impl Index<ChunkId> for ChunkArena {
    type Output = Chunk;

    fn index(&self, id: ChunkId) -> &Chunk {
        self.slots[id.0].as_ref().expect("stale chunk handle")
    }
}

impl IndexMut<ChunkId> for ChunkArena {
    fn index_mut(&mut self, id: ChunkId) -> &mut Chunk {
        self.slots[id.0].as_mut().expect("stale chunk handle")
    }
}

use std::{fmt, mem, ptr::NonNull, time::Duration};

use tracing::debug;

use crate::{
    chunked::ChunkedPool,
    flat::FlatPool,
    meter::{CallCounters, Meter, PoolMeter},
    stats::{ChunkCensus, PoolStats},
    utils::rounded_size,
};

/// Call counters are promoted into the pool meter after this many allocations,
/// so they never drift too far from what the meter reports.
pub const FLUSH_LIMIT: usize = 1000;

/// Largest object a pool accepts. Rounded to the pointer width it still fits
/// an `isize`, which is as far as any allocation can go.
pub const MAX_OBJECT_SIZE: usize = isize::MAX as usize - (mem::size_of::<usize>() - 1);

/// What a pool needs from the code that actually hands out memory.
///
/// Both strategies keep the [`PoolMeter`] levels consistent:
/// `alloc == inuse + idle` after every call.
pub(crate) trait PoolStrategy {
    /// Hands out one zeroed (when zero on free is on) object.
    fn allocate(&mut self, meter: &mut PoolMeter, calls: &mut CallCounters) -> NonNull<u8>;

    /// Takes an object back. `aggressive` asks to release its memory right away
    /// instead of keeping it for reuse, strategies are free to ignore it.
    ///
    /// **SAFETY**: `obj` must come from [`PoolStrategy::allocate`] on this same
    /// strategy and must not be used afterwards.
    unsafe fn deallocate(&mut self, obj: NonNull<u8>, aggressive: bool, meter: &mut PoolMeter);

    /// Whether there is enough idle memory to make a [`PoolStrategy::clean`]
    /// worth it. A non zero `shift` raises the bar.
    fn idle_trigger(&self, shift: u32, meter: &PoolMeter) -> bool;

    /// Releases idle memory that has not been referenced for `max_age`.
    fn clean(&mut self, max_age: Duration, meter: &mut PoolMeter);

    /// Settles internal state and reports chunk figures.
    fn census(&mut self, meter: &mut PoolMeter) -> ChunkCensus;

    fn set_chunk_size(&mut self, _size: usize) {}

    fn set_zero_on_free(&mut self, enabled: bool);

    /// Bookkeeping bytes owned by the strategy.
    fn overhead(&self) -> usize;
}

/// How a pool gets its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Every object is its own heap allocation, freed ones are kept for reuse.
    Flat,
    /// Objects are slots inside page sized chunks.
    Chunked,
}

pub(crate) enum Strategy {
    Flat(FlatPool),
    Chunked(ChunkedPool),
}

macro_rules! dispatch {
    ($strategy:expr, $inner:ident => $call:expr) => {
        match $strategy {
            Strategy::Flat($inner) => $call,
            Strategy::Chunked($inner) => $call,
        }
    };
}

/// Process wide pool identifier, handed out in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(pub(crate) u32);

impl PoolId {
    #[inline]
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A pool of same sized objects.
///
/// Pools are created through [`crate::Registry::create`] and live inside the
/// registry until [`crate::Registry::destroy`]. Objects come out as raw,
/// pointer aligned memory of [`Pool::object_size`] bytes.
pub struct Pool {
    id: PoolId,
    label: String,
    object_size: usize,
    calls: CallCounters,
    meter: PoolMeter,
    aggressive_free: bool,
    strategy: Strategy,
}

impl Pool {
    /// # Panics
    ///
    /// Panics if `object_size` is zero or above [`MAX_OBJECT_SIZE`].
    pub(crate) fn new(id: PoolId, label: String, object_size: usize, kind: PoolKind) -> Self {
        assert!(object_size > 0, "pool {label:?} created with a zero object size");
        assert!(
            object_size <= MAX_OBJECT_SIZE,
            "pool {label:?} created with object size {object_size}, too large for any allocation"
        );

        let object_size = rounded_size(object_size);
        let strategy = match kind {
            PoolKind::Flat => Strategy::Flat(FlatPool::new(object_size)),
            PoolKind::Chunked => Strategy::Chunked(ChunkedPool::new(object_size)),
        };

        debug!(pool = %id, label = %label, object_size, ?kind, "created pool");

        Self {
            id,
            label,
            object_size,
            calls: CallCounters::default(),
            meter: PoolMeter::new(),
            aggressive_free: false,
            strategy,
        }
    }

    #[inline]
    pub fn id(&self) -> PoolId {
        self.id
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Size of every object, rounded up to the pointer width.
    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn kind(&self) -> PoolKind {
        match self.strategy {
            Strategy::Flat(_) => PoolKind::Flat,
            Strategy::Chunked(_) => PoolKind::Chunked,
        }
    }

    #[inline]
    pub fn meter(&self) -> &PoolMeter {
        &self.meter
    }

    /// Objects handed out and not freed yet.
    #[inline]
    pub fn in_use_count(&self) -> usize {
        level(&self.meter.inuse)
    }

    /// Takes one object out of the pool. Its memory is zeroed unless zero on
    /// free was turned off, in which case only a fresh object is guaranteed to be.
    pub fn alloc(&mut self) -> NonNull<u8> {
        self.calls.alloc += 1;
        if self.calls.alloc == FLUSH_LIMIT {
            self.flush_meters();
        }

        dispatch!(&mut self.strategy, s => s.allocate(&mut self.meter, &mut self.calls))
    }

    /// Gives an object back to the pool.
    ///
    /// # Safety
    ///
    /// `obj` must have been returned by [`Pool::alloc`] on this same pool and
    /// not freed since. It must not be used after this call.
    pub unsafe fn free(&mut self, obj: NonNull<u8>) {
        let aggressive = self.aggressive_free;
        dispatch!(&mut self.strategy, s => unsafe { s.deallocate(obj, aggressive, &mut self.meter) });

        self.calls.free += 1;
    }

    /// Whether freed objects are zeroed before they are kept for reuse. On by default.
    pub fn set_zero_on_free(&mut self, enabled: bool) {
        dispatch!(&mut self.strategy, s => s.set_zero_on_free(enabled))
    }

    /// Sets the size of the chunks objects are carved out of. Only chunked pools
    /// care, and only until their first chunk exists.
    pub fn set_chunk_size(&mut self, bytes: usize) {
        dispatch!(&mut self.strategy, s => s.set_chunk_size(bytes))
    }

    pub(crate) fn set_aggressive_free(&mut self, enabled: bool) {
        self.aggressive_free = enabled;
    }

    /// Moves the call counters into the meter's histories.
    pub fn flush_meters(&mut self) {
        self.calls.promote(&mut self.meter);
    }

    /// [`Pool::flush_meters`] plus the byte totals of every history.
    pub fn flush_meters_full(&mut self) {
        self.flush_meters();

        let size = self.object_size as f64;
        let meter = &mut self.meter;
        meter.gb_allocated.bytes = meter.gb_allocated.count * size;
        meter.gb_saved.bytes = meter.gb_saved.count * size;
        meter.gb_freed.bytes = meter.gb_freed.count * size;
    }

    pub fn idle_trigger(&self, shift: u32) -> bool {
        dispatch!(&self.strategy, s => s.idle_trigger(shift, &self.meter))
    }

    /// Returns cached frees to where they belong and releases idle memory that
    /// has not been referenced for `max_age`.
    pub fn clean(&mut self, max_age: Duration) {
        self.flush_meters_full();
        dispatch!(&mut self.strategy, s => s.clean(max_age, &mut self.meter))
    }

    /// Snapshot of the pool. Settles pending frees first, but never releases memory.
    pub fn stats(&mut self) -> PoolStats {
        self.flush_meters_full();
        let census = dispatch!(&mut self.strategy, s => s.census(&mut self.meter));
        let strategy_overhead = dispatch!(&self.strategy, s => s.overhead());

        PoolStats {
            label: self.label.clone(),
            meter: self.meter.clone(),
            object_size: self.object_size,
            chunk_capacity: census.chunk_capacity,
            chunk_size: census.chunk_size,
            chunks_alloc: census.chunks_alloc,
            chunks_inuse: census.chunks_alloc - census.chunks_free,
            chunks_partial: census.chunks_partial,
            chunks_free: census.chunks_free,
            items_alloc: level(&self.meter.alloc),
            items_inuse: level(&self.meter.inuse),
            items_idle: level(&self.meter.idle),
            overhead: mem::size_of::<Pool>() + strategy_overhead + self.label.len() + 1,
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("object_size", &self.object_size)
            .field("kind", &self.kind())
            .field("in_use", &self.in_use_count())
            .finish()
    }
}

#[inline]
fn level(meter: &Meter) -> usize {
    meter.level().max(0) as usize
}

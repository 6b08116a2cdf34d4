//! Usage meters. A [`Meter`] follows one quantity (allocated, in use or idle
//! objects) together with the highest level it ever reached.

use std::time::SystemTime;

/// Current level of one quantity plus its high-water mark.
///
/// `high_water_level >= level` holds as long as the level is only moved through
/// the methods below. The timestamp changes only when the mark is raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Meter {
    level: i64,
    high_water_level: i64,
    high_water_stamp: Option<SystemTime>,
}

impl Meter {
    pub const fn new() -> Self {
        Self {
            level: 0,
            high_water_level: 0,
            high_water_stamp: None,
        }
    }

    #[inline]
    pub fn level(&self) -> i64 {
        self.level
    }

    #[inline]
    pub fn high_water_level(&self) -> i64 {
        self.high_water_level
    }

    /// When the high-water mark was last raised, if ever.
    #[inline]
    pub fn high_water_stamp(&self) -> Option<SystemTime> {
        self.high_water_stamp
    }

    #[inline]
    pub fn increment(&mut self) {
        self.add(1);
    }

    #[inline]
    pub fn decrement(&mut self) {
        self.subtract(1);
    }

    #[inline]
    pub fn add(&mut self, n: i64) {
        self.level += n;
        self.check_high_water();
    }

    #[inline]
    pub fn subtract(&mut self, n: i64) {
        self.level -= n;
    }

    /// Resets the level. The high-water mark survives.
    pub fn flush(&mut self) {
        self.level = 0;
    }

    #[inline]
    fn check_high_water(&mut self) {
        if self.high_water_level < self.level {
            self.high_water_level = self.level;
            self.high_water_stamp = Some(SystemTime::now());
        }
    }
}

/// Running history of one kind of call: how many and how many bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cumulative {
    pub count: f64,
    pub bytes: f64,
}

impl Cumulative {
    fn flush(&mut self) {
        *self = Self::default();
    }

    fn absorb(&mut self, other: &Cumulative) {
        self.count += other.count;
        self.bytes += other.bytes;
    }
}

/// Everything a pool (or the registry, summed over all pools) reports about
/// itself. `alloc == inuse + idle` for every pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolMeter {
    /// Objects backed by memory the pool owns.
    pub alloc: Meter,
    /// Objects handed out and not freed yet.
    pub inuse: Meter,
    /// Objects the pool holds on to for reuse.
    pub idle: Meter,
    /// Allocation calls.
    pub gb_allocated: Cumulative,
    /// Allocation calls served without touching a fresh slot.
    pub gb_saved: Cumulative,
    /// Free calls.
    pub gb_freed: Cumulative,
}

impl PoolMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets all levels and histories, keeping the high-water marks.
    pub fn flush(&mut self) {
        self.alloc.flush();
        self.inuse.flush();
        self.idle.flush();
        self.gb_allocated.flush();
        self.gb_saved.flush();
        self.gb_freed.flush();
    }

    /// Folds one pool's meter into an aggregate, converting object levels to
    /// bytes with `object_size`.
    pub(crate) fn absorb(&mut self, pool: &PoolMeter, object_size: usize) {
        let size = object_size as i64;

        self.alloc.add(pool.alloc.level() * size);
        self.inuse.add(pool.inuse.level() * size);
        self.idle.add(pool.idle.level() * size);

        self.gb_allocated.absorb(&pool.gb_allocated);
        self.gb_saved.absorb(&pool.gb_saved);
        self.gb_freed.absorb(&pool.gb_freed);
    }
}

/// Calls since the last time they were promoted into a [`PoolMeter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounters {
    pub alloc: usize,
    pub free: usize,
    pub saved: usize,
}

impl CallCounters {
    /// Moves every pending count into the meter's histories.
    pub(crate) fn promote(&mut self, meter: &mut PoolMeter) {
        meter.gb_freed.count += std::mem::take(&mut self.free) as f64;
        meter.gb_allocated.count += std::mem::take(&mut self.alloc) as f64;
        meter.gb_saved.count += std::mem::take(&mut self.saved) as f64;
    }
}

//! Statistics snapshots for monitoring.

use std::fmt;

use crate::{config::IdleLimit, meter::PoolMeter};

/// Chunk level figures a strategy reports about itself. All zero for pools that
/// don't use chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCensus {
    pub chunk_capacity: usize,
    pub chunk_size: usize,
    pub chunks_alloc: usize,
    pub chunks_partial: usize,
    pub chunks_free: usize,
}

/// Snapshot of one pool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub label: String,
    pub meter: PoolMeter,
    pub object_size: usize,
    pub chunk_capacity: usize,
    pub chunk_size: usize,

    pub chunks_alloc: usize,
    pub chunks_inuse: usize,
    pub chunks_partial: usize,
    pub chunks_free: usize,

    pub items_alloc: usize,
    pub items_inuse: usize,
    pub items_idle: usize,

    /// Estimated bytes spent on bookkeeping rather than objects.
    pub overhead: usize,
}

impl PoolStats {
    /// How many more chunks are in use than the in-use items strictly need, in
    /// percent. 100 means twice the needed amount. `None` for pools without chunks
    /// or without items in use.
    pub fn fragmentation(&self) -> Option<f64> {
        if self.chunk_capacity == 0 || self.items_inuse == 0 {
            return None;
        }

        let needed = self.items_inuse.div_ceil(self.chunk_capacity);
        let excess = self.chunks_inuse.saturating_sub(needed);

        Some(excess as f64 * 100.0 / needed as f64)
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<24} {:>6} B  items {:>8} alloc {:>8} inuse {:>8} idle",
            self.label, self.object_size, self.items_alloc, self.items_inuse, self.items_idle,
        )?;

        if self.chunk_capacity > 0 {
            write!(
                f,
                "  chunks {:>5} x {:>6} ({} inuse, {} partial, {} free)",
                self.chunks_alloc,
                self.chunk_capacity,
                self.chunks_inuse,
                self.chunks_partial,
                self.chunks_free,
            )?;

            if let Some(frag) = self.fragmentation() {
                write!(f, "  frag {frag:.0}%")?;
            }
        }

        Ok(())
    }
}

/// Totals over every pool of a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalStats {
    /// Aggregate meter; levels are in bytes.
    pub meter: PoolMeter,

    pub pools_alloc: usize,
    /// Pools with at least one object in use.
    pub pools_inuse: usize,
    /// Highest pool id handed out so far.
    pub pools_mempid: u32,

    pub chunks_alloc: usize,
    pub chunks_inuse: usize,
    pub chunks_partial: usize,
    pub chunks_free: usize,

    pub items_alloc: usize,
    pub items_inuse: usize,
    pub items_idle: usize,

    pub overhead: usize,
    pub idle_limit: IdleLimit,
}

impl GlobalStats {
    pub(crate) fn new(meter: PoolMeter, idle_limit: IdleLimit) -> Self {
        Self {
            meter,
            pools_alloc: 0,
            pools_inuse: 0,
            pools_mempid: 0,
            chunks_alloc: 0,
            chunks_inuse: 0,
            chunks_partial: 0,
            chunks_free: 0,
            items_alloc: 0,
            items_inuse: 0,
            items_idle: 0,
            overhead: 0,
            idle_limit,
        }
    }

    pub(crate) fn accumulate(&mut self, pool: &PoolStats) {
        if pool.items_inuse > 0 {
            self.pools_inuse += 1;
        }

        self.chunks_alloc += pool.chunks_alloc;
        self.chunks_inuse += pool.chunks_inuse;
        self.chunks_partial += pool.chunks_partial;
        self.chunks_free += pool.chunks_free;

        self.items_alloc += pool.items_alloc;
        self.items_inuse += pool.items_inuse;
        self.items_idle += pool.items_idle;

        self.overhead += pool.overhead;
    }
}

impl fmt::Display for GlobalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "pools: {} allocated, {} in use, last id {}",
            self.pools_alloc, self.pools_inuse, self.pools_mempid
        )?;
        writeln!(
            f,
            "chunks: {} allocated, {} in use, {} partial, {} free",
            self.chunks_alloc, self.chunks_inuse, self.chunks_partial, self.chunks_free
        )?;
        writeln!(
            f,
            "items: {} allocated, {} in use, {} idle",
            self.items_alloc, self.items_inuse, self.items_idle
        )?;
        writeln!(
            f,
            "bytes: {} allocated (high {}), {} in use (high {}), {} idle (high {})",
            self.meter.alloc.level(),
            self.meter.alloc.high_water_level(),
            self.meter.inuse.level(),
            self.meter.inuse.high_water_level(),
            self.meter.idle.level(),
            self.meter.idle.high_water_level(),
        )?;
        write!(f, "overhead: {} bytes, idle limit: {}", self.overhead, self.idle_limit)
    }
}

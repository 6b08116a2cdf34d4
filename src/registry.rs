use std::{mem, time::Duration};

use tracing::{debug, info, trace, warn};

use crate::{
    config::{IdleLimit, RegistryConfig},
    meter::PoolMeter,
    pool::{Pool, PoolId, PoolKind},
    stats::GlobalStats,
};

/// Owner of every pool in the process.
///
/// The registry hands out pool ids, keeps pools in creation order, applies the
/// process wide settings to them and runs the periodic sweep that gives idle
/// memory back:
///
/// ```no_run
/// use std::time::Duration;
/// use mempools::Registry;
///
/// let mut registry = Registry::from_env();
/// let id = registry.create("request", 128);
///
/// let pool = registry.pool_mut(id).unwrap();
/// let obj = pool.alloc();
/// unsafe { pool.free(obj) };
///
/// registry.clean(Duration::from_secs(15));
/// ```
pub struct Registry {
    config: RegistryConfig,
    pools: Vec<Pool>,
    next_id: u32,
    /// Sum over all pools, in bytes.
    meter: PoolMeter,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        debug!(
            chunked_by_default = config.chunked_by_default,
            idle_limit = %config.idle_limit,
            "created pool registry"
        );

        Self {
            config,
            pools: Vec::new(),
            next_id: 0,
            meter: PoolMeter::new(),
        }
    }

    /// Registry configured from the environment. Settings that don't parse are
    /// reported and replaced by their defaults.
    pub fn from_env() -> Self {
        let config = RegistryConfig::from_env().unwrap_or_else(|err| {
            warn!(%err, "ignoring pool configuration from the environment");
            RegistryConfig::default()
        });

        Self::new(config)
    }

    /// Creates a pool of `object_size` byte objects using the default strategy.
    ///
    /// # Panics
    ///
    /// Panics if `object_size` is zero or above [`crate::MAX_OBJECT_SIZE`].
    pub fn create(&mut self, label: impl Into<String>, object_size: usize) -> PoolId {
        let kind = if self.config.chunked_by_default {
            PoolKind::Chunked
        } else {
            PoolKind::Flat
        };

        self.create_with_kind(label, object_size, kind)
    }

    /// Same as [`Registry::create`] with an explicit strategy.
    pub fn create_with_kind(
        &mut self,
        label: impl Into<String>,
        object_size: usize,
        kind: PoolKind,
    ) -> PoolId {
        self.next_id += 1;
        let id = PoolId(self.next_id);

        let mut pool = Pool::new(id, label.into(), object_size, kind);
        pool.set_aggressive_free(self.config.idle_limit.frees_aggressively());
        self.pools.push(pool);

        id
    }

    /// Removes a pool and releases all of its memory.
    ///
    /// # Panics
    ///
    /// Panics if `id` is unknown or the pool still has objects in use.
    pub fn destroy(&mut self, id: PoolId) {
        let index = self
            .position(id)
            .unwrap_or_else(|| panic!("destroying unknown pool {id}"));

        let pool = &self.pools[index];
        assert!(
            pool.in_use_count() == 0,
            "destroying pool {:?} with {} objects still in use",
            pool.label(),
            pool.in_use_count()
        );

        let pool = self.pools.remove(index);
        debug!(pool = %id, label = pool.label(), "destroyed pool");
    }

    pub fn pool(&self, id: PoolId) -> Option<&Pool> {
        self.position(id).map(|index| &self.pools[index])
    }

    pub fn pool_mut(&mut self, id: PoolId) -> Option<&mut Pool> {
        self.position(id).map(|index| &mut self.pools[index])
    }

    /// Pools in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Pool> {
        self.pools.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pool> {
        self.pools.iter_mut()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Changes the idle limit. A limit of zero bytes turns aggressive freeing on
    /// for every pool, any other limit turns it off.
    pub fn set_idle_limit(&mut self, limit: IdleLimit) {
        self.config.idle_limit = limit;

        let aggressive = limit.frees_aggressively();
        for pool in &mut self.pools {
            pool.set_aggressive_free(aggressive);
        }

        debug!(idle_limit = %limit, aggressive, "idle limit changed");
    }

    #[inline]
    pub fn idle_limit(&self) -> IdleLimit {
        self.config.idle_limit
    }

    /// Strategy for pools created from now on. Existing pools keep theirs.
    pub fn set_default_pool_chunking(&mut self, chunked: bool) {
        self.config.chunked_by_default = chunked;
    }

    #[inline]
    pub fn chunked_by_default(&self) -> bool {
        self.config.chunked_by_default
    }

    /// Rebuilds the aggregate meter from every pool.
    pub fn flush_meters(&mut self) {
        self.meter.flush();

        for pool in &mut self.pools {
            pool.flush_meters_full();
            self.meter.absorb(pool.meter(), pool.object_size());
        }
    }

    /// Aggregate meter as of the last [`Registry::flush_meters`].
    #[inline]
    pub fn meter(&self) -> &PoolMeter {
        &self.meter
    }

    /// Sweeps every pool with enough idle memory to bother, releasing what has
    /// not been referenced for `max_age`. When the idle bytes of all pools go
    /// over the idle limit the sweep ignores the age and lowers the bar, so
    /// everything idle that can go, goes.
    pub fn clean(&mut self, max_age: Duration) {
        self.flush_meters();

        let idle_bytes = self.meter.idle.level();
        let over_limit = self.config.idle_limit.is_exceeded_by(idle_bytes);
        let (max_age, shift) = if over_limit {
            (Duration::ZERO, 0)
        } else {
            (max_age, 1)
        };

        let mut cleaned = 0;
        for pool in &mut self.pools {
            if !pool.idle_trigger(shift) {
                continue;
            }

            trace!(pool = %pool.id(), label = pool.label(), "cleaning pool");
            pool.clean(max_age);
            cleaned += 1;
        }

        self.flush_meters();

        info!(
            pools = self.pools.len(),
            cleaned,
            over_limit,
            idle_before = idle_bytes,
            idle_after = self.meter.idle.level(),
            allocated = self.meter.alloc.level(),
            "pools cleaned"
        );
    }

    /// Totals over every pool. Pending frees are settled, nothing is released.
    pub fn global_stats(&mut self) -> GlobalStats {
        let pool_stats: Vec<_> = self.pools.iter_mut().map(Pool::stats).collect();
        self.flush_meters();

        let mut stats = GlobalStats::new(self.meter.clone(), self.config.idle_limit);
        for pool in &pool_stats {
            stats.accumulate(pool);
        }

        stats.pools_alloc = self.pools.len();
        stats.pools_mempid = self.next_id;
        stats.overhead += self.pools.len() * mem::size_of::<*const Pool>();
        stats
    }

    /// Bytes currently backed by memory the pools own.
    pub fn total_allocated(&mut self) -> usize {
        self.flush_meters();
        self.meter.alloc.level().max(0) as usize
    }

    /// Pool ids grow with creation order, so the vector stays sorted by id.
    fn position(&self, id: PoolId) -> Option<usize> {
        self.pools.binary_search_by_key(&id, Pool::id).ok()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

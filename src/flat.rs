use std::{
    alloc::{self, Layout},
    mem,
    ptr::{self, NonNull},
    time::Duration,
};

use crate::{
    freelist::FreeList,
    meter::{CallCounters, PoolMeter},
    pool::PoolStrategy,
    stats::ChunkCensus,
};

/// Pool that asks the general heap for every object on its own.
///
/// Freed objects are not returned to the heap but kept on a [`FreeList`] and
/// handed out again, which is what saves the allocator round trip. Nothing
/// remembers where an object came from, so a clean can only release the whole
/// free list at once.
pub(crate) struct FlatPool {
    layout: Layout,
    zero_on_free: bool,
    free_list: FreeList,
}

// SAFETY: the pool exclusively owns the objects on its free list.
unsafe impl Send for FlatPool {}

impl FlatPool {
    pub fn new(object_size: usize) -> Self {
        let layout = Layout::from_size_align(object_size, mem::align_of::<usize>())
            .unwrap_or_else(|_| panic!("object size {object_size} is too large for a pool"));

        Self {
            layout,
            zero_on_free: true,
            free_list: FreeList::new(),
        }
    }

    /// Returns every object on the free list to the heap.
    fn release_free_list(&mut self, meter: Option<&mut PoolMeter>) {
        let mut released = 0;

        while let Some(obj) = self.free_list.pop() {
            unsafe { alloc::dealloc(obj.as_ptr(), self.layout) };
            released += 1;
        }

        if let Some(meter) = meter {
            meter.idle.subtract(released as i64);
            meter.alloc.subtract(released as i64);
        }
    }
}

impl PoolStrategy for FlatPool {
    fn allocate(&mut self, meter: &mut PoolMeter, calls: &mut CallCounters) -> NonNull<u8> {
        let obj = match self.free_list.pop() {
            Some(obj) => {
                meter.idle.decrement();
                calls.saved += 1;
                obj
            }
            None => {
                let obj = unsafe { alloc::alloc_zeroed(self.layout) };
                let obj = NonNull::new(obj).unwrap_or_else(|| alloc::handle_alloc_error(self.layout));
                meter.alloc.increment();
                obj
            }
        };

        meter.inuse.increment();
        obj
    }

    unsafe fn deallocate(&mut self, obj: NonNull<u8>, aggressive: bool, meter: &mut PoolMeter) {
        meter.inuse.decrement();

        if aggressive {
            unsafe { alloc::dealloc(obj.as_ptr(), self.layout) };
            meter.alloc.decrement();
            return;
        }

        if self.zero_on_free {
            unsafe { ptr::write_bytes(obj.as_ptr(), 0, self.layout.size()) };
        }

        unsafe { self.free_list.push(obj) };
        meter.idle.increment();
    }

    fn idle_trigger(&self, shift: u32, _meter: &PoolMeter) -> bool {
        let shift = if shift > 0 { 8 } else { 0 };
        (self.free_list.len() >> shift) != 0
    }

    /// Objects carry no timestamp, so `max_age` is ignored and everything goes.
    fn clean(&mut self, _max_age: Duration, meter: &mut PoolMeter) {
        self.release_free_list(Some(meter));
    }

    fn census(&mut self, _meter: &mut PoolMeter) -> ChunkCensus {
        ChunkCensus::default()
    }

    fn set_zero_on_free(&mut self, enabled: bool) {
        self.zero_on_free = enabled;
    }

    fn overhead(&self) -> usize {
        mem::size_of::<FlatPool>()
    }
}

impl Drop for FlatPool {
    fn drop(&mut self) {
        self.release_free_list(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_objects_are_kept_for_reuse() {
        let mut pool = FlatPool::new(24);
        let mut meter = PoolMeter::new();
        let mut calls = CallCounters::default();

        let a = pool.allocate(&mut meter, &mut calls);
        let b = pool.allocate(&mut meter, &mut calls);
        assert_eq!(meter.alloc.level(), 2);
        assert_eq!(calls.saved, 0);

        unsafe { pool.deallocate(a, false, &mut meter) };
        assert_eq!(meter.idle.level(), 1);
        assert_eq!(meter.inuse.level(), 1);

        let c = pool.allocate(&mut meter, &mut calls);
        assert_eq!(c, a);
        assert_eq!(calls.saved, 1);
        assert_eq!(meter.alloc.level(), 2);

        unsafe {
            pool.deallocate(b, false, &mut meter);
            pool.deallocate(c, false, &mut meter);
        }
    }

    #[test]
    fn idle_trigger_scales_with_shift() {
        let mut pool = FlatPool::new(8);
        let mut meter = PoolMeter::new();
        let mut calls = CallCounters::default();
        assert!(!pool.idle_trigger(0, &meter));

        let objects: Vec<_> = (0..300).map(|_| pool.allocate(&mut meter, &mut calls)).collect();
        for obj in &objects[..10] {
            unsafe { pool.deallocate(*obj, false, &mut meter) };
        }
        assert!(pool.idle_trigger(0, &meter));
        assert!(!pool.idle_trigger(1, &meter));

        for obj in &objects[10..] {
            unsafe { pool.deallocate(*obj, false, &mut meter) };
        }
        assert!(pool.idle_trigger(1, &meter));
    }

    #[test]
    fn clean_releases_everything_regardless_of_age() {
        let mut pool = FlatPool::new(16);
        let mut meter = PoolMeter::new();
        let mut calls = CallCounters::default();

        let objects: Vec<_> = (0..5).map(|_| pool.allocate(&mut meter, &mut calls)).collect();
        for obj in objects {
            unsafe { pool.deallocate(obj, false, &mut meter) };
        }

        pool.clean(Duration::MAX, &mut meter);

        assert_eq!(meter.alloc.level(), 0);
        assert_eq!(meter.idle.level(), 0);
        assert_eq!(meter.alloc.high_water_level(), 5);
        assert!(!pool.idle_trigger(0, &meter));
    }
}

use std::ptr::{self, NonNull};

/// Singly linked list of free object slots.
///
/// We don't keep any metadata outside the slots themselves. A slot that is on the
/// list is not used by anyone, so its first pointer-width bytes are used as
/// storage for the link to the next free slot:
///
/// ```text
///    head
///      |
/// +----|-----+-------------+     +----------+-------------+
/// |   next --------------------> |   next   |             | ---> null
/// +----------+   (unused)  |     +----------+   (unused)  |
/// |          slot          |     |          slot          |
/// +------------------------+     +------------------------+
/// ```
///
/// This is why every pool rounds its object size up to a multiple of the pointer
/// size (see [`crate::utils::rounded_size`]).
///
/// The list never owns the memory, it only threads through it. Whoever pushes a
/// slot must guarantee it stays valid until it is popped again.
pub(crate) struct FreeList {
    head: Option<NonNull<u8>>,
    len: usize,
}

impl FreeList {
    /// Creates a new empty list.
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Pushes `slot` as the new head of the list, writing the old head into it.
    ///
    /// **SAFETY**: `slot` must be valid for writes of a pointer, aligned to the
    /// pointer size and not already on any list.
    #[inline]
    pub unsafe fn push(&mut self, slot: NonNull<u8>) {
        unsafe {
            slot.cast::<*mut u8>()
                .as_ptr()
                .write(self.head.map_or(ptr::null_mut(), NonNull::as_ptr));
        }

        self.head = Some(slot);
        self.len += 1;
    }

    /// Pops the head of the list. The link stored in the slot is cleared, so a
    /// slot that was zeroed before being pushed comes back fully zeroed.
    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let slot = self.head?;

        unsafe {
            let link = slot.cast::<*mut u8>().as_ptr();
            self.head = NonNull::new(link.read());
            link.write(ptr::null_mut());
        }

        self.len -= 1;
        Some(slot)
    }

    /// Threads `count` consecutive slots of `stride` bytes starting at `base` into
    /// an empty list, so that popping hands them out in ascending address order.
    ///
    /// **SAFETY**: the whole `[base, base + count * stride)` range must be writable
    /// and `stride` must be a multiple of the pointer size.
    pub unsafe fn thread(&mut self, base: NonNull<u8>, count: usize, stride: usize) {
        debug_assert!(self.is_empty(), "threading slots into a non empty free list");

        // Walk backwards so the lowest slot ends up at the head.
        for i in (0..count).rev() {
            unsafe { self.push(base.add(i * stride)) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    fn slots(count: usize) -> Vec<usize> {
        vec![0usize; count]
    }

    #[test]
    fn new_list_is_empty() {
        let mut list = FreeList::new();

        assert_eq!(list.len(), 0);
        assert!(list.is_empty());
        assert!(list.pop().is_none());
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut backing = slots(3);
        let mut list = FreeList::new();

        let ptrs: Vec<NonNull<u8>> = backing
            .iter_mut()
            .map(|slot| NonNull::from(slot).cast::<u8>())
            .collect();

        unsafe {
            for slot in &ptrs {
                list.push(*slot);
            }
        }

        assert_eq!(list.len(), 3);
        assert_eq!(list.pop(), Some(ptrs[2]));
        assert_eq!(list.pop(), Some(ptrs[1]));
        assert_eq!(list.pop(), Some(ptrs[0]));
        assert!(list.is_empty());
    }

    #[test]
    fn popped_slots_have_their_link_cleared() {
        let mut backing = slots(2);
        let mut list = FreeList::new();
        let base = NonNull::new(backing.as_mut_ptr()).unwrap().cast::<u8>();

        unsafe { list.thread(base, 2, mem::size_of::<usize>()) };

        assert_eq!(list.pop(), Some(base));
        assert_eq!(backing[0], 0);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn threaded_slots_come_out_in_address_order() {
        let mut backing = slots(8);
        let mut list = FreeList::new();
        let stride = mem::size_of::<usize>() * 2;
        let base = NonNull::new(backing.as_mut_ptr()).unwrap().cast::<u8>();

        unsafe { list.thread(base, 4, stride) };

        let popped: Vec<usize> = std::iter::from_fn(|| list.pop())
            .map(|p| p.as_ptr() as usize - base.as_ptr() as usize)
            .collect();

        assert_eq!(popped, vec![0, stride, stride * 2, stride * 3]);
    }
}

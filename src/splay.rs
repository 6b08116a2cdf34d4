//! Self-adjusting binary search tree.
//!
//! Every lookup splays the node it ends on up to the root, so entries that
//! were touched recently stay cheap to find. The chunked pools use this to
//! map an object address back to the chunk it was carved from, and those
//! lookups cluster around whatever chunks are currently handing out slots.
//!
//! The tree stores plain values and leaves ordering to the caller: every
//! operation takes a comparison closure. Lookups may use a key type that is
//! different from the stored value (an address against a chunk range, for
//! example), as long as the comparison is consistent with the value order.

use std::{cmp::Ordering, fmt, marker::PhantomData, ptr::NonNull};

/// Non-null pointer to a tree node.
type Link<T> = Option<NonNull<Node<T>>>;

struct Node<T> {
    left: Link<T>,
    right: Link<T>,
    data: T,
}

/// Outcome of [`SplayTree::find`].
///
/// The node the search ended on becomes the root either way. When nothing
/// matched, `nearest` is that node and `side` tells on which side of it the key
/// would have to be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a, T> {
    Found(&'a T),
    NotFound {
        nearest: Option<&'a T>,
        side: Ordering,
    },
}

impl<'a, T> Lookup<'a, T> {
    #[inline]
    pub fn found(self) -> Option<&'a T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound { .. } => None,
        }
    }

    #[inline]
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

pub struct SplayTree<T> {
    root: Link<T>,
    len: usize,
    marker: PhantomData<Box<Node<T>>>,
}

// SAFETY: the tree exclusively owns its nodes, moving it moves them all.
unsafe impl<T: Send> Send for SplayTree<T> {}

impl<T> SplayTree<T> {
    pub const fn new() -> Self {
        Self {
            root: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current root, i.e. the last element inserted or looked up.
    pub fn root(&self) -> Option<&T> {
        self.root.map(|node| unsafe { &(*node.as_ptr()).data })
    }

    /// Searches for `key`, splaying the last node visited up to the root.
    pub fn find<K, F>(&mut self, key: &K, mut compare: F) -> Lookup<'_, T>
    where
        K: ?Sized,
        F: FnMut(&K, &T) -> Ordering,
    {
        let Some(root) = self.root else {
            return Lookup::NotFound {
                nearest: None,
                side: Ordering::Less,
            };
        };

        let (top, side) = unsafe { splay(root, key, &mut compare) };
        self.root = Some(top);

        let data = unsafe { &(*top.as_ptr()).data };
        match side {
            Ordering::Equal => Lookup::Found(data),
            side => Lookup::NotFound {
                nearest: Some(data),
                side,
            },
        }
    }

    /// Inserts `value`, which becomes the new root.
    ///
    /// # Panics
    ///
    /// Panics if an equal element is already in the tree.
    pub fn insert<F>(&mut self, value: T, mut compare: F)
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        let mut node = NonNull::from(Box::leak(Box::new(Node {
            left: None,
            right: None,
            data: value,
        })));

        if let Some(root) = self.root {
            unsafe {
                let (mut top, side) = splay(root, &(*node.as_ptr()).data, &mut compare);

                match side {
                    Ordering::Less => {
                        node.as_mut().left = top.as_ref().left;
                        node.as_mut().right = Some(top);
                        top.as_mut().left = None;
                    }
                    Ordering::Greater => {
                        node.as_mut().right = top.as_ref().right;
                        node.as_mut().left = Some(top);
                        top.as_mut().right = None;
                    }
                    Ordering::Equal => {
                        self.root = Some(top);
                        drop(Box::from_raw(node.as_ptr()));
                        panic!("duplicate entry inserted into splay tree");
                    }
                }
            }
        }

        self.root = Some(node);
        self.len += 1;
    }

    /// Removes and returns the element equal to `key`.
    ///
    /// # Panics
    ///
    /// Panics if no such element is in the tree.
    pub fn remove<K, F>(&mut self, key: &K, mut compare: F) -> T
    where
        K: ?Sized,
        F: FnMut(&K, &T) -> Ordering,
    {
        let Some(root) = self.root else {
            panic!("removing an entry from an empty splay tree");
        };

        unsafe {
            let (top, side) = splay(root, key, &mut compare);
            self.root = Some(top);

            assert!(side == Ordering::Equal, "removing an entry missing from the splay tree");

            // Every element on the left is smaller than the key, so splaying the
            // key there brings the maximum up and leaves its right side empty.
            self.root = match top.as_ref().left {
                None => top.as_ref().right,
                Some(left) => {
                    let (mut new_top, _) = splay(left, key, &mut compare);
                    new_top.as_mut().right = top.as_ref().right;
                    Some(new_top)
                }
            };

            self.len -= 1;
            Box::from_raw(top.as_ptr()).data
        }
    }

    /// Smallest element, without restructuring the tree.
    pub fn first(&self) -> Option<&T> {
        let mut node = self.root?;

        unsafe {
            while let Some(left) = node.as_ref().left {
                node = left;
            }
            Some(&(*node.as_ptr()).data)
        }
    }

    /// Largest element, without restructuring the tree.
    pub fn last(&self) -> Option<&T> {
        let mut node = self.root?;

        unsafe {
            while let Some(right) = node.as_ref().right {
                node = right;
            }
            Some(&(*node.as_ptr()).data)
        }
    }

    /// In-order iterator, ascending.
    pub fn iter(&self) -> Iter<'_, T> {
        let mut iter = Iter {
            to_visit: Vec::new(),
            remaining: self.len,
            marker: PhantomData,
        };
        iter.push_left_path(self.root);
        iter
    }

    /// Calls `visit` on every element in ascending order.
    pub fn walk<F: FnMut(&T)>(&self, visit: F) {
        self.iter().for_each(visit);
    }

    /// Empties the tree, handing every element to `free` in post-order
    /// (children before their parent).
    pub fn destroy<F: FnMut(T)>(&mut self, mut free: F) {
        let mut pending: Vec<NonNull<Node<T>>> = self.root.take().into_iter().collect();
        let mut order = Vec::with_capacity(self.len);

        while let Some(node) = pending.pop() {
            order.push(node);

            unsafe {
                pending.extend(node.as_ref().left);
                pending.extend(node.as_ref().right);
            }
        }

        // `order` is root, right, left; reversed it is left, right, root.
        for node in order.into_iter().rev() {
            let node = unsafe { Box::from_raw(node.as_ptr()) };
            free(node.data);
        }

        self.len = 0;
    }
}

impl<T> Default for SplayTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SplayTree<T> {
    fn drop(&mut self) {
        self.destroy(drop);
    }
}

impl<T: fmt::Debug> fmt::Debug for SplayTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Top-down splay. Walks from `root` towards `key`, rotating on zig-zig steps
/// and peeling the nodes passed over into a left tree (smaller than the key)
/// and a right tree (larger), then reassembles them around the last node
/// reached. Returns the new root and how `key` compares to it.
///
/// **SAFETY**: `root` must be the root of a well formed tree owned by the caller.
unsafe fn splay<T, K, F>(root: NonNull<Node<T>>, key: &K, compare: &mut F) -> (NonNull<Node<T>>, Ordering)
where
    K: ?Sized,
    F: FnMut(&K, &T) -> Ordering,
{
    // Root and rightmost node of the left tree, root and leftmost of the right one.
    let mut left_root: Link<T> = None;
    let mut left_max: Link<T> = None;
    let mut right_root: Link<T> = None;
    let mut right_min: Link<T> = None;

    let mut top = root;
    let mut side;

    unsafe {
        loop {
            side = compare(key, &top.as_ref().data);

            match side {
                Ordering::Less => {
                    let Some(mut child) = top.as_ref().left else {
                        break;
                    };

                    side = compare(key, &child.as_ref().data);
                    let next = if side == Ordering::Less {
                        // Rotate right.
                        top.as_mut().left = child.as_ref().right;
                        child.as_mut().right = Some(top);
                        top = child;

                        match top.as_ref().left {
                            Some(next) => next,
                            None => break,
                        }
                    } else {
                        child
                    };

                    // Link right.
                    match right_min {
                        Some(mut min) => min.as_mut().left = Some(top),
                        None => right_root = Some(top),
                    }
                    right_min = Some(top);
                    top = next;
                }
                Ordering::Greater => {
                    let Some(mut child) = top.as_ref().right else {
                        break;
                    };

                    side = compare(key, &child.as_ref().data);
                    let next = if side == Ordering::Greater {
                        // Rotate left.
                        top.as_mut().right = child.as_ref().left;
                        child.as_mut().left = Some(top);
                        top = child;

                        match top.as_ref().right {
                            Some(next) => next,
                            None => break,
                        }
                    } else {
                        child
                    };

                    // Link left.
                    match left_max {
                        Some(mut max) => max.as_mut().right = Some(top),
                        None => left_root = Some(top),
                    }
                    left_max = Some(top);
                    top = next;
                }
                Ordering::Equal => break,
            }
        }

        // Assemble.
        if let Some(mut max) = left_max {
            max.as_mut().right = top.as_ref().left;
            top.as_mut().left = left_root;
        }
        if let Some(mut min) = right_min {
            min.as_mut().left = top.as_ref().right;
            top.as_mut().right = right_root;
        }
    }

    (top, side)
}

pub struct Iter<'a, T> {
    to_visit: Vec<NonNull<Node<T>>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> Iter<'_, T> {
    fn push_left_path(&mut self, mut link: Link<T>) {
        while let Some(node) = link {
            self.to_visit.push(node);
            link = unsafe { node.as_ref().left };
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.to_visit.pop()?;

        unsafe {
            self.push_left_path(node.as_ref().right);
            self.remaining -= 1;

            Some(&(*node.as_ptr()).data)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a SplayTree<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

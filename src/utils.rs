//! Helper functions shared by the pool strategies.
//! These don't particularly belong to any concrete module of the crate.

use std::mem;

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This is used to round chunk sizes up to a multiple of [`crate::kernel::page_size`]
/// and object sizes up to a multiple of the pointer size, since every free slot has
/// to be able to hold the free list link.
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Rounds an object size up to the pointer width.
#[inline]
pub fn rounded_size(size: usize) -> usize {
    align(size, mem::size_of::<usize>())
}

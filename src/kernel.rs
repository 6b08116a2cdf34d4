//! Low level page memory. Chunks are carved out of regions requested
//! directly from the kernel, so they are always page aligned, zero filled
//! and can be handed back to the OS as soon as a sweep releases them.

use std::{alloc::Layout, ptr::NonNull, sync::OnceLock};

/// Virtual memory page size of the computer. This is usually 4096.
/// We can't make it a constant since we don't know the value at compile time.
static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Marker type the platform specific implementations hang off.
pub(crate) struct Kernel;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. The pools have nothing to do with the concrete APIs offered
/// by each kernel.
trait PlatformMemory {
    /// Request a zero filled memory region of size `len`. It returns a pointer
    /// to the given location or None if the underlying syscall fails.
    unsafe fn request_memory(len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(addr: *mut u8, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    unsafe fn page_size() -> usize;
}

/// Wrapper to calculate the computer's page size. The value is queried once.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { Kernel::page_size() })
}

/// Maps a fresh region of `len` bytes. `len` has to be a multiple of [`page_size`].
///
/// Running out of address space is not something a pool can recover from, so a
/// failed request goes straight to [`std::alloc::handle_alloc_error`].
pub(crate) fn request_region(len: usize) -> NonNull<u8> {
    debug_assert_eq!(len % page_size(), 0, "region length must be page aligned");

    match unsafe { Kernel::request_memory(len) } {
        Some(addr) => addr,
        None => {
            let layout = Layout::from_size_align(len, page_size())
                .unwrap_or_else(|_| Layout::new::<u8>());
            std::alloc::handle_alloc_error(layout)
        }
    }
}

/// Gives a region obtained from [`request_region`] back to the kernel.
///
/// **SAFETY**: `addr` must come from [`request_region`] called with the same `len`
/// and nothing may reference the region afterwards.
#[inline]
pub(crate) unsafe fn release_region(addr: NonNull<u8>, len: usize) {
    unsafe { Kernel::return_memory(addr.as_ptr(), len) }
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => None,
                    addr => NonNull::new(addr.cast::<u8>()),
                }
            }
        }

        unsafe fn return_memory(addr: *mut u8, len: usize) {
            unsafe {
                munmap(addr as *mut c_void, len as size_t);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl PlatformMemory for Kernel {
        unsafe fn request_memory(len: usize) -> Option<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast())
            }
        }

        unsafe fn return_memory(addr: *mut u8, _len: usize) {
            unsafe {
                let _ = Memory::VirtualFree(addr as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        unsafe fn page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

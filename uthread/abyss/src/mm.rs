//! Anonymous memory mappings.
//!
//! Mapping and unmapping are plain system calls, so a [`Mapping`] can be
//! released from the interrupt handler, unlike memory from the global
//! allocator.

use core::ptr::{self, NonNull};

/// Size of a page.
pub const PAGE_SIZE: usize = 0x1000;

/// A private read-write mapping preceded by an inaccessible guard page.
///
/// Touching the guard page faults, which turns a downward overflow of a
/// stack placed in the mapping into a crash rather than silent corruption.
#[derive(Debug)]
pub struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Maps at least `size` usable bytes, rounded up to whole pages, below
    /// which a guard page sits.
    ///
    /// # Returns
    /// - `Ok(mapping)` on success.
    /// - `Err(errno)` if the address space could not be reserved.
    pub fn with_guard_page(size: usize) -> Result<Self, i32> {
        let len = size.next_multiple_of(PAGE_SIZE) + PAGE_SIZE;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(crate::errno());
        }
        if unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) } != 0 {
            let errno = crate::errno();
            unsafe { libc::munmap(base, len) };
            return Err(errno);
        }
        let base = NonNull::new(base.cast::<u8>()).ok_or(libc::ENOMEM)?;
        Ok(Self { base, len })
    }

    /// Address of the lowest usable byte.
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize + PAGE_SIZE
    }

    /// Address one past the highest usable byte.
    pub fn end(&self) -> usize {
        self.base.as_ptr() as usize + self.len
    }

    /// Number of usable bytes.
    pub fn size(&self) -> usize {
        self.len - PAGE_SIZE
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    }
}

// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Memory-mapped per-fiber stacks with an unmapped guard page.
//!
//! Grounded in `libs/fiber/src/stack/unix.rs` of the teacher crate: a single
//! anonymous `mmap` reservation, the low page left `PROT_NONE` as a guard,
//! the remainder made `PROT_READ | PROT_WRITE`. Touching the guard page
//! raises `SIGSEGV`, which the fault handler (see [`crate::signal`])
//! recognises by address range and reports as a stack overflow rather than a
//! generic segfault.

use std::io;
use std::ptr;

/// Minimum usable stack size, matching the teacher's floor for `DefaultFiberStack`.
pub const MIN_STACK_SIZE: usize = 4096;

/// A single fiber's stack: one guard page followed by the usable region.
///
/// `top()` is the highest address (stacks grow down on every architecture this
/// crate supports); `guard_page()` is the unmapped region at the bottom that
/// catches overflow.
#[derive(Debug)]
pub struct Stack {
    mmap_base: *mut libc::c_void,
    mmap_len: usize,
    guard_len: usize,
}

// Safety: the stack is exclusively owned by the fiber it belongs to (see
// `4.2 Shared-resource policy`); it is moved, not shared, between threads.
unsafe impl Send for Stack {}

impl Stack {
    /// Reserves a new stack of at least `size` usable bytes, plus one guard page.
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(MIN_STACK_SIZE);
        let page_size = page_size();
        let usable_len = round_up(size, page_size);
        let mmap_len = usable_len + page_size;

        // OpenBSD requires MAP_STACK on anything used as a stack; harmless elsewhere.
        #[cfg(target_os = "openbsd")]
        let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
        #[cfg(not(target_os = "openbsd"))]
        let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;

        // Safety: arguments are constructed above; errors are checked.
        unsafe {
            let base = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if base == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            // Make everything but the guard page (the lowest page) writable.
            let usable = base.cast::<u8>().add(page_size).cast();
            if libc::mprotect(usable, usable_len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(base, mmap_len);
                return Err(err);
            }

            Ok(Self {
                mmap_base: base,
                mmap_len,
                guard_len: page_size,
            })
        }
    }

    /// Highest address of the stack (the initial stack pointer value).
    #[must_use]
    pub fn top(&self) -> usize {
        self.mmap_base as usize + self.mmap_len
    }

    /// Lowest address of the usable region (one past the guard page).
    #[must_use]
    pub fn bottom(&self) -> usize {
        self.mmap_base as usize + self.guard_len
    }

    /// `true` if `addr` falls within this stack's unmapped guard page.
    #[must_use]
    pub fn contains_guard_page(&self, addr: usize) -> bool {
        let base = self.mmap_base as usize;
        addr >= base && addr < base + self.guard_len
    }

    /// Base address of the guard page, for signal handlers that only have
    /// raw address bounds to work with (see [`crate::signal`]).
    #[must_use]
    pub fn guard_base(&self) -> usize {
        self.mmap_base as usize
    }

    /// Length in bytes of the guard page.
    #[must_use]
    pub fn guard_len(&self) -> usize {
        self.guard_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: `mmap_base`/`mmap_len` came from our own successful `mmap` call.
        unsafe {
            let ret = libc::munmap(self.mmap_base, self.mmap_len);
            debug_assert_eq!(ret, 0, "munmap of fiber stack failed");
        }
    }
}

fn page_size() -> usize {
    // Safety: sysconf with _SC_PAGESIZE never fails on supported platforms.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    debug_assert!(size.is_power_of_two());
    size
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_and_frees() {
        let stack = Stack::new(32 * 1024).unwrap();
        assert!(stack.top() > stack.bottom());
        assert_eq!(stack.top() - stack.bottom(), round_up(32 * 1024, page_size()));
    }

    #[test]
    fn guard_page_precedes_usable_region() {
        let stack = Stack::new(32 * 1024).unwrap();
        assert!(stack.contains_guard_page(stack.bottom() - 1));
        assert!(!stack.contains_guard_page(stack.bottom()));
    }
}

// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber-local storage (FLS).
//!
//! Every fiber's on-stack control block reserves a fixed-size byte area
//! (see [`FLS_AREA_BYTES`]). Declaring an FLS slot with [`fiber_local!`]
//! reserves an offset into that area at program startup via a bump
//! allocator; reading the slot dereferences `current_area_ptr + offset`.
//! Switching fibers updates the reactor's "current FLS area" pointer so that
//! unqualified reads always see the newly-resumed fiber's copy.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Total bytes reserved for FLS in every fiber's control block.
pub const FLS_AREA_BYTES: usize = 512;

/// Global bump allocator assigning byte offsets to [`fiber_local!`] slots.
///
/// All registrations happen before the first [`Reactor::setup`] call in
/// practice (slots are normally declared as top-level statics), so no
/// synchronization beyond the atomic bump itself is required.
static NEXT_OFFSET: AtomicUsize = AtomicUsize::new(0);

/// Reserves `size` bytes aligned to `align` in the FLS area, returning the offset.
///
/// # Panics
/// Panics if the reservation would overflow [`FLS_AREA_BYTES`] -- this is a
/// startup-time configuration error, not a runtime condition.
pub fn reserve(size: usize, align: usize) -> usize {
    loop {
        let current = NEXT_OFFSET.load(Ordering::Relaxed);
        let aligned = (current + align - 1) & !(align - 1);
        let next = aligned + size;
        assert!(
            next <= FLS_AREA_BYTES,
            "fiber-local storage exhausted: {next} bytes requested, area is {FLS_AREA_BYTES}"
        );
        if NEXT_OFFSET
            .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return aligned;
        }
    }
}

thread_local! {
    /// Pointer to the currently-running fiber's FLS area. Updated by the
    /// scheduler immediately after every context switch, before any
    /// suspension-point error is raised.
    static CURRENT_AREA: Cell<*mut u8> = const { Cell::new(std::ptr::null_mut()) };
}

/// Installs `area` as the current fiber's FLS area. Called by the scheduler
/// on every context switch; not for use by collaborators.
pub(crate) fn set_current_area(area: *mut u8) {
    CURRENT_AREA.with(|c| c.set(area));
}

/// A single fiber-local slot of type `T`, addressed by a fixed byte offset.
///
/// Constructed once (normally as a `static`) via [`fiber_local!`].
pub struct FiberLocalKey<T: 'static> {
    offset: Cell<usize>,
    init: fn() -> T,
    _marker: std::marker::PhantomData<T>,
}

// Safety: a `FiberLocalKey` only ever touches the FLS area of whichever
// fiber is current on this one reactor thread; it is never accessed
// concurrently.
unsafe impl<T> Sync for FiberLocalKey<T> {}

impl<T: 'static> FiberLocalKey<T> {
    #[doc(hidden)]
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            offset: Cell::new(usize::MAX),
            init,
            _marker: std::marker::PhantomData,
        }
    }

    fn offset(&self) -> usize {
        let o = self.offset.get();
        if o != usize::MAX {
            return o;
        }
        // The slot is stored as `Option<T>`, not `T` (see `with` below), so the
        // reservation must match that wrapped layout -- for a `T` with no
        // spare niche for `Option` to exploit (e.g. `Cell<u32>`), `Option<T>`
        // is strictly larger than `T` itself.
        let assigned = reserve(std::mem::size_of::<Option<T>>(), std::mem::align_of::<Option<T>>());
        self.offset.set(assigned);
        assigned
    }

    /// Runs `f` with a reference to this slot's value in the *current* fiber.
    ///
    /// The slot is lazily initialized (via the closure passed to
    /// [`fiber_local!`]) the first time it is observed uninitialized in a
    /// freshly-reset FLS area -- in this implementation that means every
    /// fiber start, since [`crate::fiber::Fiber::reset_fls`] zeroes the area.
    ///
    /// # Panics
    /// Panics if called outside of a running fiber (no current FLS area installed).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let area = CURRENT_AREA.with(|c| c.get());
        assert!(!area.is_null(), "fiber-local accessed outside of a running fiber");
        let offset = self.offset();
        // Safety: `area` points to `FLS_AREA_BYTES` of storage owned by the
        // current fiber; `offset + size_of::<T>()` was bounds-checked by
        // `reserve`. The slot's `Option<T>` tag byte is maintained below.
        unsafe {
            let slot = area.add(offset).cast::<Option<T>>();
            if (*slot).is_none() {
                *slot = Some((self.init)());
            }
            f((*slot).as_ref().unwrap())
        }
    }
}

/// Declares a fiber-local slot.
///
/// ```ignore
/// fiber_local! {
///     static DEPTH: std::cell::Cell<u32> = std::cell::Cell::new(0);
/// }
/// DEPTH.with(|d| d.set(d.get() + 1));
/// ```
#[macro_export]
macro_rules! fiber_local {
    (static $name:ident: $ty:ty = $init:expr;) => {
        static $name: $crate::fls::FiberLocalKey<$ty> =
            $crate::fls::FiberLocalKey::new(|| $init);
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;

    fiber_local! {
        static COUNTER: StdCell<u32> = StdCell::new(0);
    }

    #[test]
    fn reads_and_writes_within_installed_area() {
        let mut area = vec![0u8; FLS_AREA_BYTES];
        set_current_area(area.as_mut_ptr());
        COUNTER.with(|c| c.set(c.get() + 1));
        COUNTER.with(|c| assert_eq!(c.get(), 1));
        set_current_area(std::ptr::null_mut());
    }

    #[test]
    #[should_panic(expected = "outside of a running fiber")]
    fn panics_without_current_area() {
        set_current_area(std::ptr::null_mut());
        COUNTER.with(|c| c.get());
    }
}

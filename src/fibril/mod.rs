// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Context switch primitive.
//!
//! Grounded in `libs/fiber/src/arch/x86_64.rs` of the teacher crate, which
//! implements the same save-callee-saved/swap-stack-pointer trick for an
//! asymmetric generator (`Fiber::resume`/`Suspend::suspend`, always switching
//! back to whichever stack called `resume`). The scheduler described by this
//! crate needs *symmetric* N:M switching -- any fiber can be resumed by any
//! other slot in the fiber table, not just its original resumer -- so
//! [`Fibril`] drops the teacher's "parent link stored in the callee's own
//! stack" bookkeeping and instead takes two plain stack-pointer cells,
//! exactly the two-function contract from the design: [`Fibril::set`]
//! prepares a fresh stack, [`Fibril::switch_to`] is the only operation that
//! moves the stack pointer, and [`Fibril::reset`] returns to the unset state.
//!
//! `switch_to` is equivalent to a two-sided `setjmp`/`longjmp`: it saves the
//! caller's callee-saved registers on the caller's own stack, swaps `rsp`,
//! and resumes wherever the target last left off (or, the first time, starts
//! executing the entry function installed by `set`).

mod x86_64;

use std::cell::Cell;
use std::num::NonZeroUsize;

pub use x86_64::STACK_ALIGNMENT;

/// The raw value of a stack pointer. `None` (represented as `0`) means the
/// fibril has never been `set`, or has returned/been `reset`.
type RawSp = usize;

/// A two-sided context: one saved stack pointer, swapped by [`switch_to`](Fibril::switch_to).
///
/// A `Fibril` does not own the stack it runs on; callers pair it with a
/// [`crate::stack::Stack`] and must keep the stack alive for as long as the
/// fibril might still be switched into.
#[derive(Debug)]
pub struct Fibril {
    sp: Cell<RawSp>,
}

/// Function a freshly-`set` fibril starts executing on its first `switch_to`.
///
/// Receives the `arg` passed to that first `switch_to` call. Must never
/// return -- the fiber body wrapper always ends in a final `switch_to` back
/// to the scheduler's fibril instead (see `crate::fiber::fiber_trampoline`).
pub type EntryFn = unsafe extern "C" fn(arg: usize) -> !;

impl Fibril {
    /// Creates an unset fibril. Call [`set`](Self::set) before the first `switch_to`.
    #[must_use]
    pub const fn new() -> Self {
        Self { sp: Cell::new(0) }
    }

    /// `true` if this fibril has been `set` (or switched into) and not since `reset`.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.sp.get() != 0
    }

    /// Prepares `stack_top` so that the next `switch_to` into this fibril starts
    /// executing `entry` with a clean frame, receiving that switch's `arg`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the top (highest address, on a stack-grows-down
    /// architecture) of a writable region at least
    /// [`STACK_ALIGNMENT`]-aligned and large enough for `entry`'s frame plus
    /// whatever it calls. The region must remain valid and exclusively owned
    /// by this fibril until it is `reset` or dropped.
    pub unsafe fn set(&self, stack_top: NonZeroUsize, entry: EntryFn) {
        // Safety: forwarded to the caller's contract above.
        let sp = unsafe { x86_64::init_stack(stack_top.get(), entry) };
        self.sp.set(sp);
    }

    /// Returns this fibril to the un-set state without running any more of its stack.
    ///
    /// Only safe to call when nothing of value remains live on the fibril's
    /// stack (e.g. after the fiber body has already unwound to completion).
    pub fn reset(&self) {
        self.sp.set(0);
    }

    /// Switches from the calling context into `self`, passing `arg`.
    ///
    /// Saves the caller's callee-saved registers and stack pointer, installs
    /// `self`'s saved stack pointer into `rsp`, and resumes there. Returns
    /// once some other `switch_to` targets the caller's own fibril again,
    /// yielding whatever `arg` that switch was called with.
    ///
    /// # Safety
    ///
    /// `self` must currently hold a valid suspended context: either produced
    /// by [`set`](Self::set) and not yet resumed-to-completion, or the
    /// target of a previous `switch_to` that itself called back out via
    /// `switch_to` (not returned). `caller` must be the fibril the calling
    /// context will be resumed through next -- whoever later wants to
    /// resume this call site must `switch_to(caller, ...)`.
    pub unsafe fn switch_to(&self, caller: &Fibril, arg: usize) -> usize {
        let target_sp = NonZeroUsize::new(self.sp.get())
            .expect("switch_to target fibril is unset (reset or never `set`)");

        // Safety: `target_sp` is valid per the contract above; `caller.sp` is a
        // valid write target for the resulting stack pointer. `self.sp` is
        // updated as a side effect, directly by address, once `target`
        // suspends itself again through some later `switch_to(&self, ...)`
        // call -- see the note on `x86_64::switch`.
        unsafe { x86_64::switch(arg, &caller.sp, target_sp.get()) }
    }
}

impl Default for Fibril {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;
    use std::cell::Cell as StdCell;

    thread_local! {
        static SCRATCH: StdCell<usize> = const { StdCell::new(0) };
    }

    unsafe extern "C" fn echo_once(arg: usize) -> ! {
        SCRATCH.with(|c| c.set(arg));
        // Switch back to whoever resumed us. The test below wires this up by
        // stashing its own fibril in a thread-local before switching in.
        CALLER.with(|c| {
            let caller_ptr = c.get();
            debug_assert!(!caller_ptr.is_null());
            let caller: &Fibril = unsafe { &*caller_ptr.cast::<Fibril>() };
            let me: &Fibril = ME.with(|m| unsafe { &*m.get().cast::<Fibril>() });
            // Safety: test harness guarantees `caller`/`me` outlive this switch.
            unsafe {
                me.switch_to(caller, arg + 1);
            }
        });
        unreachable!("fiber under test never resumes past the echo");
    }

    thread_local! {
        static CALLER: StdCell<*mut ()> = const { StdCell::new(std::ptr::null_mut()) };
        static ME: StdCell<*mut ()> = const { StdCell::new(std::ptr::null_mut()) };
    }

    #[test]
    fn switch_to_runs_entry_and_returns() {
        let stack = Stack::new(64 * 1024).unwrap();
        let callee = Fibril::new();
        let caller = Fibril::new();

        // Safety: stack is freshly allocated and large enough.
        unsafe { callee.set(NonZeroUsize::new(stack.top()).unwrap(), echo_once) };

        CALLER.with(|c| c.set((&caller as *const Fibril).cast_mut().cast()));
        ME.with(|m| m.set((&callee as *const Fibril).cast_mut().cast()));

        // Safety: callee was just `set`; caller is a valid resume target.
        let result = unsafe { callee.switch_to(&caller, 41) };
        assert_eq!(result, 42);
        assert_eq!(SCRATCH.with(|c| c.get()), 41);
    }
}

// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives for fibers sharing the same reactor.
//!
//! These are built entirely on top of [`Reactor::suspend`]/[`Reactor::resume`]/
//! [`Reactor::throw_in`] -- no atomics, no [`Waker`](std::task::Waker), no
//! lock-free lists. A reactor pins its fibers to a single OS thread and
//! switches between them cooperatively, so a waiter list is just a
//! `RefCell<Vec<FiberHandle>>`: there is never a concurrent writer to race
//! against. This is a deliberate simplification of the teacher's `WaitCell`/
//! `WaitQueue` (`libs/async-exec/src/sync/wait_cell.rs`,
//! `libs/kasync/src/sync/wait_queue.rs`), which need atomics and intrusive
//! lists because their tasks may be polled from any executor thread.

use crate::fiber::FiberHandle;
use crate::reactor::{FiberResult, Reactor};
use std::cell::{Cell, RefCell};

/// A manual-reset event: once [`set`](Event::set), every waiter is woken and
/// every subsequent [`wait`](Event::wait) returns immediately, until the
/// event is [`reset`](Event::reset).
#[derive(Default)]
pub struct Event {
    is_set: Cell<bool>,
    waiters: RefCell<Vec<FiberHandle>>,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if the event is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.is_set.get()
    }

    /// Sets the event, waking every fiber currently blocked in [`wait`](Self::wait).
    /// A no-op if already set.
    pub fn set(&self, reactor: &Reactor) {
        if self.is_set.replace(true) {
            return;
        }
        for handle in self.waiters.borrow_mut().drain(..) {
            reactor.resume(handle);
        }
    }

    /// Clears the event. Does not affect fibers already resumed by a prior `set`.
    pub fn reset(&self) {
        self.is_set.set(false);
    }

    /// Blocks the current fiber until the event is set.
    ///
    /// Returns immediately if already set. If the calling fiber is woken by
    /// something other than [`set`](Self::set) -- an injected [`throw_in`],
    /// the reactor stopping -- its entry is removed from the waiter list
    /// before the error propagates.
    pub fn wait(&self, reactor: &Reactor) -> FiberResult<()> {
        if self.is_set.get() {
            return Ok(());
        }
        let handle = reactor.current_handle();
        self.waiters.borrow_mut().push(handle);
        let result = reactor.suspend(None);
        self.waiters.borrow_mut().retain(|h| *h != handle);
        result
    }
}

/// A single-use rendezvous point for a fixed number of fibers.
///
/// The `n`th fiber to call [`wait`](Self::wait) releases every waiting fiber,
/// itself included, and resets the barrier for reuse.
pub struct Barrier {
    arity: usize,
    waiting: RefCell<Vec<FiberHandle>>,
}

impl Barrier {
    /// Creates a barrier for `arity` parties.
    ///
    /// # Panics
    /// Panics if `arity` is zero.
    #[must_use]
    pub fn new(arity: usize) -> Self {
        assert!(arity > 0, "a barrier needs at least one party");
        Self {
            arity,
            waiting: RefCell::new(Vec::with_capacity(arity)),
        }
    }

    /// Blocks until `arity` fibers have called `wait`, then releases them all.
    ///
    /// Returns `true` to the fiber that completed the arrival and triggered
    /// the release, `false` to every other party -- mirroring
    /// `std::sync::Barrier::wait`'s `is_leader` signal.
    pub fn wait(&self, reactor: &Reactor) -> FiberResult<bool> {
        let handle = reactor.current_handle();
        let is_leader = {
            let mut waiting = self.waiting.borrow_mut();
            waiting.push(handle);
            waiting.len() == self.arity
        };

        if is_leader {
            let arrived = self.waiting.borrow_mut().split_off(0);
            for other in arrived.iter().copied().filter(|h| *h != handle) {
                reactor.resume(other);
            }
            return Ok(true);
        }

        let result = reactor.suspend(None);
        self.waiting.borrow_mut().retain(|h| *h != handle);
        result.map(|()| false)
    }
}

/// Tracks a set of spawned fibers so they can be torn down and waited on as
/// a unit.
///
/// Membership is by [`FiberHandle`]; a member that has already retired is
/// simply skipped by [`kill_all`](Self::kill_all) and [`join`](Self::join).
#[derive(Default)]
pub struct FiberGroup {
    members: RefCell<Vec<FiberHandle>>,
}

impl FiberGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handle` to the group.
    pub fn add(&self, handle: FiberHandle) {
        self.members.borrow_mut().push(handle);
    }

    /// Spawns a fiber via `reactor.spawn` and adds it to the group in one step.
    pub fn spawn<F>(&self, reactor: &Reactor, immediate: bool, body: F) -> crate::error::Result<FiberHandle>
    where
        F: FnOnce(&Reactor) -> FiberResult<()> + 'static,
    {
        let handle = reactor.spawn(immediate, body)?;
        self.add(handle);
        Ok(handle)
    }

    /// Number of members that have not yet retired.
    #[must_use]
    pub fn live_count(&self, reactor: &Reactor) -> usize {
        self.members.borrow().iter().filter(|h| reactor.is_valid(**h)).count()
    }

    /// Injects [`Error::FiberGroupExtinction`](crate::error::Error::FiberGroupExtinction)
    /// into every live member, waking sleepers so they can unwind.
    pub fn kill_all(&self, reactor: &Reactor) {
        for handle in self.members.borrow().iter().copied() {
            reactor.kill(handle);
        }
    }

    /// Blocks the current fiber until every member has retired.
    ///
    /// Polls by yielding rather than subscribing to a per-member wakeup list,
    /// since membership can still change in practice (a member spawning a new
    /// group participant) while this is outstanding.
    pub fn join(&self, reactor: &Reactor) -> FiberResult<()> {
        while self.live_count(reactor) > 0 {
            reactor.yield_now()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_starts_unset() {
        let event = Event::new();
        assert!(!event.is_set());
    }

    #[test]
    fn event_set_then_reset() {
        let event = Event::new();
        event.is_set.set(true);
        assert!(event.is_set());
        event.reset();
        assert!(!event.is_set());
    }

    #[test]
    fn barrier_rejects_zero_arity() {
        let result = std::panic::catch_unwind(|| Barrier::new(0));
        assert!(result.is_err());
    }

    #[test]
    fn fiber_group_starts_empty() {
        let group = FiberGroup::new();
        assert!(group.members.borrow().is_empty());
    }
}

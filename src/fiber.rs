// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber identity, state machine, and the slot table.
//!
//! A [`FiberTable`] is a contiguous, pre-allocated array of [`Slot`]s. Two
//! intrusive doubly-linked lists -- the free list and the ready queue --
//! share node storage inside the slots themselves (`prev`/`next` fields); a
//! fiber is on at most one of them at any time, tracked by [`Slot::membership`].

use crate::exception::ExceptionBuffer;
use crate::fibril::Fibril;
use crate::fls::FLS_AREA_BYTES;
use crate::stack::Stack;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::num::NonZeroUsize;

bitflags::bitflags! {
    /// Per-fiber flag bits, see `3. DATA MODEL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FiberFlags: u32 {
        const CALLBACK_SET  = 1 << 0;
        const SPECIAL       = 1 << 1;
        const SCHEDULED     = 1 << 2;
        const SLEEPING      = 1 << 3;
        const HAS_EXCEPTION = 1 << 4;
        const EXCEPTION_BT  = 1 << 5;
        const GC_ENABLED    = 1 << 6;
    }
}

/// A fiber's position in its lifecycle: `Starting -> Running <-> Sleeping <-> Scheduled -> Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Slot holds a body that has never been switched into.
    Starting,
    /// Currently executing (there is exactly one such fiber reactor-wide).
    Running,
    /// Suspended, not on the ready queue; woken by `resume`, a timer, or an fd event.
    Sleeping,
    /// Suspended and sitting on the ready queue awaiting its turn.
    Scheduled,
    /// Body has returned or unwound to completion; slot awaits recycling.
    Done,
}

/// Which intrusive list (if any) currently owns a slot's `prev`/`next` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Membership {
    /// Not linked into either list (e.g. the running fiber, or blocked on a
    /// sync primitive that keeps its own waiter queue).
    None,
    Free,
    Ready,
}

/// A 16-bit slot index into the [`FiberTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub(crate) u16);

/// Slot 0: the fiber the reactor was `start()`-ed on.
pub const MAIN_FIBER: FiberId = FiberId(0);
/// Slot 1: drains the timer queue and parks when there is nothing else to run.
pub const IDLE_FIBER: FiberId = FiberId(1);

/// A small POD uniquely identifying a fiber at a specific incarnation.
///
/// `is_valid` is true iff the stored incarnation matches the slot's current
/// one; once a fiber's body returns, its slot's incarnation is bumped and
/// every handle minted for that fiber becomes permanently invalid.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberHandle {
    pub(crate) id: FiberId,
    pub(crate) incarnation: u16,
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberHandle(#{}, gen {})", self.id.0, self.incarnation)
    }
}

impl FiberHandle {
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.id
    }
}

pub(crate) type Body = Box<dyn FnOnce(&crate::reactor::Reactor) -> crate::reactor::FiberResult<()> + 'static>;

/// One entry of the fiber table.
pub(crate) struct Slot {
    pub state: Cell<FiberState>,
    pub flags: Cell<FiberFlags>,
    pub incarnation: Cell<u16>,
    pub membership: Cell<Membership>,
    pub prev: Cell<Option<FiberId>>,
    pub next: Cell<Option<FiberId>>,
    pub fibril: Fibril,
    pub stack: RefCell<Option<Stack>>,
    pub fls_area: RefCell<Box<[u8; FLS_AREA_BYTES]>>,
    pub exception: RefCell<ExceptionBuffer>,
    pub body: RefCell<Option<Body>>,
    /// Time (reactor clock cycles) the fiber started its current run, used by
    /// the hogger-warning check and the hang detector.
    pub run_start: Cell<u64>,
}

impl Slot {
    fn new_special() -> Self {
        Self {
            state: Cell::new(FiberState::Running),
            flags: Cell::new(FiberFlags::SPECIAL),
            incarnation: Cell::new(0),
            membership: Cell::new(Membership::None),
            prev: Cell::new(None),
            next: Cell::new(None),
            fibril: Fibril::new(),
            stack: RefCell::new(None),
            fls_area: RefCell::new(Box::new([0u8; FLS_AREA_BYTES])),
            exception: RefCell::new(ExceptionBuffer::new()),
            body: RefCell::new(None),
            run_start: Cell::new(0),
        }
    }

    fn new_free() -> Self {
        Self {
            state: Cell::new(FiberState::Done),
            flags: Cell::new(FiberFlags::empty()),
            incarnation: Cell::new(0),
            membership: Cell::new(Membership::Free),
            prev: Cell::new(None),
            next: Cell::new(None),
            fibril: Fibril::new(),
            stack: RefCell::new(None),
            fls_area: RefCell::new(Box::new([0u8; FLS_AREA_BYTES])),
            exception: RefCell::new(ExceptionBuffer::new()),
            body: RefCell::new(None),
            run_start: Cell::new(0),
        }
    }

    pub fn handle(&self, id: FiberId) -> FiberHandle {
        FiberHandle {
            id,
            incarnation: self.incarnation.get(),
        }
    }

    pub fn is_special(&self) -> bool {
        self.flags.get().contains(FiberFlags::SPECIAL)
    }
}

/// Pre-allocated array of fiber slots plus the free list and ready queue that
/// thread through it.
///
/// Slot 0 ([`MAIN_FIBER`]) and slot 1 ([`IDLE_FIBER`]) are `SPECIAL`: never
/// freed, never on the free list.
pub(crate) struct FiberTable {
    slots: Vec<Slot>,
    free_head: Cell<Option<FiberId>>,
    ready_head: Cell<Option<FiberId>>,
    ready_tail: Cell<Option<FiberId>>,
    ready_len: Cell<usize>,
    current: Cell<FiberId>,
    stack_size: usize,
}

impl FiberTable {
    pub fn new(num_fibers: usize, stack_size: usize) -> Self {
        assert!(num_fibers >= 2, "num_fibers must cover at least main + idle");
        let mut slots = Vec::with_capacity(num_fibers);
        slots.push(Slot::new_special()); // MAIN_FIBER
        slots.push(Slot::new_special()); // IDLE_FIBER
        for _ in 2..num_fibers {
            slots.push(Slot::new_free());
        }

        // Thread the free list through slots [2, num_fibers).
        let mut free_head = None;
        for i in (2..num_fibers).rev() {
            let id = FiberId(i as u16);
            slots[i].next.set(free_head);
            if let Some(head) = free_head {
                slots[head.0 as usize].prev.set(Some(id));
            }
            free_head = Some(id);
        }

        Self {
            slots,
            free_head: Cell::new(free_head),
            ready_head: Cell::new(None),
            ready_tail: Cell::new(None),
            ready_len: Cell::new(0),
            current: Cell::new(MAIN_FIBER),
            stack_size,
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, id: FiberId) -> &Slot {
        &self.slots[id.0 as usize]
    }

    pub fn current_id(&self) -> FiberId {
        self.current.get()
    }

    pub fn set_current(&self, id: FiberId) {
        self.current.set(id);
    }

    pub fn current_handle(&self) -> FiberHandle {
        self.slot(self.current.get()).handle(self.current.get())
    }

    pub fn is_valid(&self, handle: FiberHandle) -> bool {
        handle.id.0 < self.slots.len() as u16
            && self.slot(handle.id).incarnation.get() == handle.incarnation
            && self.slot(handle.id).state.get() != FiberState::Done
    }

    pub fn ready_len(&self) -> usize {
        self.ready_len.get()
    }

    /// Pulls a slot from the free list, or `None` if exhausted.
    pub fn allocate(&self) -> Option<FiberId> {
        let id = self.free_head.get()?;
        let slot = self.slot(id);
        let next = slot.next.get();
        self.free_head.set(next);
        if let Some(next_id) = next {
            self.slot(next_id).prev.set(None);
        }
        slot.prev.set(None);
        slot.next.set(None);
        slot.membership.set(Membership::None);
        Some(id)
    }

    /// Prepares an allocated slot to run `body`, reusing its previous stack
    /// mapping if one is already resident (spawns recycle slots) and mmapping
    /// a fresh one otherwise.
    pub fn install(
        &self,
        id: FiberId,
        entry: crate::fibril::EntryFn,
        body: Body,
    ) -> crate::error::Result<()> {
        let slot = self.slot(id);
        if slot.stack.borrow().is_none() {
            *slot.stack.borrow_mut() = Some(Stack::new(self.stack_size)?);
        }
        let top = NonZeroUsize::new(slot.stack.borrow().as_ref().unwrap().top())
            .expect("mmap never returns a null stack top");
        // Safety: `top` was just produced by a freshly (re)owned `Stack`,
        // exclusively held by this slot until its next `release`.
        unsafe { slot.fibril.set(top, entry) };
        *slot.body.borrow_mut() = Some(body);
        Ok(())
    }

    /// Returns a completed fiber's slot to the free list, bumping its incarnation.
    pub fn release(&self, id: FiberId) {
        let slot = self.slot(id);
        debug_assert!(!slot.is_special(), "special fibers are never freed");
        slot.incarnation.set(slot.incarnation.get().wrapping_add(1));
        slot.state.set(FiberState::Done);
        slot.flags.set(FiberFlags::empty());
        slot.fibril.reset();
        slot.body.borrow_mut().take();
        slot.exception.borrow_mut().reset();
        for byte in slot.fls_area.borrow_mut().iter_mut() {
            *byte = 0;
        }

        let head = self.free_head.get();
        slot.next.set(head);
        slot.prev.set(None);
        if let Some(head_id) = head {
            self.slot(head_id).prev.set(Some(id));
        }
        self.free_head.set(Some(id));
        slot.membership.set(Membership::Free);
    }

    /// Appends (`immediate = false`) or prepends (`immediate = true`) `id` to the ready queue.
    pub fn push_ready(&self, id: FiberId, immediate: bool) {
        let slot = self.slot(id);
        debug_assert!(
            matches!(slot.membership.get(), Membership::None),
            "fiber already linked into a list"
        );

        if slot.state.get() != FiberState::Starting {
            slot.state.set(FiberState::Scheduled);
        }
        let mut flags = slot.flags.get();
        flags.insert(FiberFlags::SCHEDULED);
        flags.remove(FiberFlags::SLEEPING);
        slot.flags.set(flags);
        slot.membership.set(Membership::Ready);
        self.ready_len.set(self.ready_len.get() + 1);

        if immediate {
            let old_head = self.ready_head.get();
            slot.prev.set(None);
            slot.next.set(old_head);
            if let Some(old_head_id) = old_head {
                self.slot(old_head_id).prev.set(Some(id));
            } else {
                self.ready_tail.set(Some(id));
            }
            self.ready_head.set(Some(id));
        } else {
            let old_tail = self.ready_tail.get();
            slot.next.set(None);
            slot.prev.set(old_tail);
            if let Some(old_tail_id) = old_tail {
                self.slot(old_tail_id).next.set(Some(id));
            } else {
                self.ready_head.set(Some(id));
            }
            self.ready_tail.set(Some(id));
        }
    }

    /// Removes `id` from the ready queue if it is on it. Used when a
    /// `resume`d fiber turns out to already be scheduled (no-op) is handled
    /// by the caller; this is for suspend paths that need to pull themselves off.
    pub fn remove_ready(&self, id: FiberId) {
        let slot = self.slot(id);
        if slot.membership.get() != Membership::Ready {
            return;
        }
        let prev = slot.prev.get();
        let next = slot.next.get();
        match prev {
            Some(p) => self.slot(p).next.set(next),
            None => self.ready_head.set(next),
        }
        match next {
            Some(n) => self.slot(n).prev.set(prev),
            None => self.ready_tail.set(prev),
        }
        slot.prev.set(None);
        slot.next.set(None);
        slot.membership.set(Membership::None);
        self.ready_len.set(self.ready_len.get() - 1);
    }

    /// Pops the head of the ready queue (FIFO order, `immediate` pushes sit at the head).
    pub fn pop_ready(&self) -> Option<FiberId> {
        let id = self.ready_head.get()?;
        self.remove_ready(id);
        Some(id)
    }

    pub fn is_scheduled(&self, id: FiberId) -> bool {
        self.slot(id).membership.get() == Membership::Ready
    }

    /// Iterator over every live (non-`Done`) slot's handle, in slot order.
    ///
    /// Lazy and non-restartable: safe only while no fiber is spawned during
    /// iteration, per `4.2`.
    pub fn iter_live(&self) -> impl Iterator<Item = (FiberId, FiberHandle, FiberState)> + '_ {
        (0..self.slots.len()).filter_map(move |i| {
            let id = FiberId(i as u16);
            let slot = self.slot(id);
            if slot.state.get() == FiberState::Done && !slot.is_special() {
                None
            } else {
                Some((id, slot.handle(id), slot.state.get()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release_cycles_incarnation() {
        let table = FiberTable::new(8, 32 * 1024);
        let a = table.allocate().unwrap();
        let handle_a = table.slot(a).handle(a);
        assert!(table.is_valid(handle_a));
        table.release(a);
        assert!(!table.is_valid(handle_a));

        let b = table.allocate().unwrap();
        assert_eq!(a, b, "slot should be reused");
        let handle_b = table.slot(b).handle(b);
        assert_ne!(handle_a, handle_b, "incarnation must differ after reuse");
    }

    #[test]
    fn allocate_fails_when_exhausted() {
        let table = FiberTable::new(4, 32 * 1024);
        assert!(table.allocate().is_some());
        assert!(table.allocate().is_some());
        assert!(table.allocate().is_none());
    }

    #[test]
    fn ready_queue_is_fifo_except_immediate() {
        let table = FiberTable::new(8, 32 * 1024);
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        let c = table.allocate().unwrap();

        table.push_ready(a, false);
        table.push_ready(b, false);
        table.push_ready(c, true); // immediate: jumps to the head

        assert_eq!(table.pop_ready(), Some(c));
        assert_eq!(table.pop_ready(), Some(a));
        assert_eq!(table.pop_ready(), Some(b));
        assert_eq!(table.pop_ready(), None);
    }

    #[test]
    fn remove_ready_unlinks_from_middle() {
        let table = FiberTable::new(8, 32 * 1024);
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        let c = table.allocate().unwrap();
        table.push_ready(a, false);
        table.push_ready(b, false);
        table.push_ready(c, false);

        table.remove_ready(b);
        assert_eq!(table.ready_len(), 2);
        assert_eq!(table.pop_ready(), Some(a));
        assert_eq!(table.pop_ready(), Some(c));
    }
}

// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The reactor: fiber scheduler, timer queue, and poller wiring.
//!
//! Mirrors the teacher's `libs/async-exec/src/scheduler.rs` shape (a single
//! `Schedule`-like core loop, a tick-scoped hogger check, `tracing` spans at
//! switch boundaries) but swaps the underlying execution model: instead of
//! polling `Future`s, [`Reactor::switch_to_next`] performs a stackful context
//! switch between entries of a [`FiberTable`]. Global state lives behind a
//! single `Rc<Reactor>` (`Rc::new_cyclic`, see [`Reactor::setup`]) rather than
//! thread-local globals, since embedders may run more than one reactor in the
//! same process as long as each stays on its own OS thread.

use crate::ctq::{Ctq, CtqConfig, TimerHandle as CtqTimerHandle};
use crate::error::{reactor_assert, Error, Result};
use crate::exception::{PendingError, Throwable};
use crate::fiber::{Body, FiberFlags, FiberHandle, FiberId, FiberState, FiberTable, IDLE_FIBER, MAIN_FIBER};
use crate::fls;
use crate::poller::{Direction, FdContext, Poller};
use crate::time::Clock;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Outcome type for every fiber-body-visible suspension point: either the
/// call completed normally, or a [`PendingError`] (reactor-originated or
/// application-thrown) was staged for this fiber and is being raised now.
pub type FiberResult<T> = std::result::Result<T, PendingError>;

/// A registered timer, valid until it fires (one-shot) or is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(CtqTimerHandle);

/// Construction-time tuning knobs. See each field's doc for its default,
/// applied by [`Options::default`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Fiber table capacity, including the main and idle fibers. Default `256`.
    pub num_fibers: usize,
    /// Usable bytes per spawned fiber's stack (a guard page is added on top). Default `32 KiB`.
    pub fiber_stack_size: usize,
    /// Width of one cascading-timer-queue level-0 bin. Default `1 ms`.
    pub timer_granularity: Duration,
    /// A fiber running longer than this without suspending logs a warning. Default `200 ms`.
    pub hogger_warning_threshold: Duration,
    /// Hang detector period; `None` disables it. Default `None` (also gated by the `hang_detector` feature).
    pub hang_detector_timeout: Option<Duration>,
    /// Cascading timer queue level width in bins. Default `10_000` capacity hint for preallocation.
    pub num_timers: usize,
    /// Interval between automatic GC-hook invocations. Default `30 s`.
    pub gc_interval: Duration,
    /// Whether [`Reactor::setup`] installs the default OS-thread-parking idler. Default `true`.
    pub register_default_idler: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_fibers: 256,
            fiber_stack_size: 32 * 1024,
            timer_granularity: Duration::from_millis(1),
            hogger_warning_threshold: Duration::from_millis(200),
            hang_detector_timeout: None,
            num_timers: 10_000,
            gc_interval: Duration::from_secs(30),
            register_default_idler: true,
        }
    }
}

type IdleCallback = Box<dyn FnMut(Duration)>;
type GcHook = Box<dyn FnMut()>;

/// Single-threaded cooperative fiber scheduler.
///
/// Never `Send`/`Sync`: every operation assumes it runs on the one OS thread
/// that called [`Reactor::setup`] and [`Reactor::start`].
pub struct Reactor {
    self_weak: Weak<Reactor>,
    table: FiberTable,
    ctq: RefCell<Ctq>,
    poller: RefCell<Poller>,
    clock: Clock,
    options: Options,
    critical_depth: Cell<u32>,
    stopping: Cell<bool>,
    idle_callbacks: RefCell<Vec<IdleCallback>>,
    gc_hooks: RefCell<Vec<GcHook>>,
    gc_timer: RefCell<Option<CtqTimerHandle>>,
    #[cfg(feature = "hang_detector")]
    hang_detector: RefCell<Option<crate::signal::HangDetector>>,
}

impl Reactor {
    /// Builds a reactor: allocates the fiber table, the cascading timer
    /// queue, and the I/O poller, and (unless disabled) registers the
    /// default OS-thread-parking idle fiber body.
    pub fn setup(options: Options) -> Result<Rc<Self>> {
        let clock = Clock::new(options.timer_granularity);
        let ctq_config = CtqConfig {
            resolution: 1,
            levels: 4,
            bins_per_level: 64,
        };
        let table = FiberTable::new(options.num_fibers, options.fiber_stack_size);
        let mut ctq = Ctq::new(ctq_config, clock.now_cycles());
        ctq.reserve(options.num_timers);
        let poller = Poller::open()?;

        let reactor = Rc::new_cyclic(|weak| Reactor {
            self_weak: weak.clone(),
            table,
            ctq: RefCell::new(ctq),
            poller: RefCell::new(poller),
            clock,
            options,
            critical_depth: Cell::new(0),
            stopping: Cell::new(false),
            idle_callbacks: RefCell::new(Vec::new()),
            gc_hooks: RefCell::new(Vec::new()),
            gc_timer: RefCell::new(None),
            #[cfg(feature = "hang_detector")]
            hang_detector: RefCell::new(None),
        });

        CURRENT_REACTOR.with(|c| c.set(Rc::as_ptr(&reactor)));
        reactor.install_idle_fiber()?;
        if reactor.options.register_default_idler {
            reactor.register_idle_callback(Box::new(park_thread));
        }
        reactor.schedule_gc_timer();

        #[cfg(feature = "hang_detector")]
        if let Some(timeout) = reactor.options.hang_detector_timeout {
            crate::signal::install_fault_handlers()?;
            let detector = crate::signal::HangDetector::install(timeout, &reactor.clock)?;
            *reactor.hang_detector.borrow_mut() = Some(detector);
        }

        Ok(reactor)
    }

    fn install_idle_fiber(&self) -> Result<()> {
        let weak = self.self_weak.clone();
        let body: Body = Box::new(move |_reactor| {
            let reactor = weak.upgrade().expect("reactor outlives its own idle fiber");
            reactor.idle_loop()
        });
        self.table.install(IDLE_FIBER, fiber_trampoline, body)
    }

    fn idle_loop(self: Rc<Self>) -> FiberResult<()> {
        loop {
            let now = self.clock.now_cycles();
            self.enter_critical_section();
            self.drain_timers(now);
            self.leave_critical_section();

            if self.table.ready_len() == 0 {
                let wait = self.time_until_next_timer();
                let mut callbacks = self.idle_callbacks.borrow_mut();
                match callbacks.len() {
                    0 => {}
                    1 => callbacks[0](wait),
                    _ => {
                        for cb in callbacks.iter_mut() {
                            cb(Duration::ZERO);
                        }
                    }
                }
                drop(callbacks);
                let woken = self.poller.borrow_mut().poll(Some(wait)).map_err(PendingError::Reactor)?;
                for handle in woken {
                    self.resume(handle);
                }
            }
            self.yield_now()?;
        }
    }

    /// Default ceiling on how long the idle fiber blocks with no timer
    /// pending, so a reactor with no timers and no fd activity still wakes
    /// periodically (e.g. to notice `stop()`).
    const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

    fn time_until_next_timer(&self) -> Duration {
        match self.ctq.borrow_mut().peek_hint() {
            Some(hint_cycles) => self.clock.cycles_to_duration(hint_cycles).min(Self::MAX_IDLE_WAIT),
            None => Self::MAX_IDLE_WAIT,
        }
    }

    fn schedule_gc_timer(&self) {
        let interval_cycles = self.clock.duration_to_cycles(self.options.gc_interval).max(1);
        let weak = self.self_weak.clone();
        let deadline = self.clock.now_cycles() + interval_cycles;
        let handle = self.ctq.borrow_mut().insert(
            deadline,
            Some(interval_cycles),
            Box::new(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.run_gc_hooks();
                }
            }),
        );
        *self.gc_timer.borrow_mut() = Some(handle);
    }

    fn run_gc_hooks(&self) {
        for hook in self.gc_hooks.borrow_mut().iter_mut() {
            hook();
        }
    }

    /// Registers a callback invoked automatically every `gc_interval`, and on
    /// every explicit [`Reactor::request_gc_collection`] call.
    pub fn register_gc_hook(&self, hook: impl FnMut() + 'static) {
        self.gc_hooks.borrow_mut().push(Box::new(hook));
    }

    /// Runs every registered GC hook immediately, outside its normal interval.
    pub fn request_gc_collection(&self) {
        self.run_gc_hooks();
    }

    /// Registers a callback run by the idle fiber whenever the ready queue is
    /// empty. With exactly one registered callback it receives the computed
    /// duration until the next timer fires (or one granularity step if none
    /// is pending); with more than one, each receives `Duration::ZERO` since
    /// no single callback should claim the whole idle budget.
    pub fn register_idle_callback(&self, callback: IdleCallback) {
        self.idle_callbacks.borrow_mut().push(callback);
    }

    /// Runs the scheduler loop on the calling OS thread until [`Reactor::stop`]
    /// unwinds every sleeping fiber, or a fiber body's error propagates
    /// unhandled to the main fiber.
    ///
    /// # Panics
    /// Panics if the calling context is not the main fiber (i.e. this is a
    /// re-entrant `start()` call).
    pub fn start(&self) -> FiberResult<()> {
        reactor_assert!(
            self.table.current_id() == MAIN_FIBER,
            "start() must be called from the main fiber"
        );
        loop {
            if self.stopping.get() && !self.has_non_special_fibers() {
                break;
            }
            match self.yield_now() {
                Ok(()) => {}
                Err(PendingError::Reactor(e)) if e.is_cooperative_unwind() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// `true` if any spawned (non-main, non-idle) fiber is still live. Used
    /// by `start()` to keep yielding after `stop()` until every sleeping
    /// fiber has had a turn to observe its injected `ReactorExit` and unwind.
    fn has_non_special_fibers(&self) -> bool {
        self.table.iter_live().any(|(id, _, _)| !self.table.slot(id).is_special())
    }

    /// Throws [`Error::ReactorExit`] into every non-special sleeping or
    /// scheduled fiber, then yields once so they can unwind to completion,
    /// after which [`Reactor::start`] returns.
    pub fn stop(&self) {
        if self.stopping.replace(true) {
            return;
        }
        for (id, handle, state) in self.table.iter_live() {
            if self.table.slot(id).is_special() || matches!(state, FiberState::Done) {
                continue;
            }
            self.stage_error(handle, PendingError::Reactor(Error::ReactorExit));
            if !self.table.is_scheduled(id) {
                self.table.push_ready(id, false);
            }
        }
    }

    /// Drops the poller's epoll instance and the timer queue's callbacks.
    /// Call only after [`Reactor::start`] has returned.
    pub fn teardown(&self) {
        self.gc_hooks.borrow_mut().clear();
        self.idle_callbacks.borrow_mut().clear();
    }

    /// Spawns a new fiber running `body`, appending it to the ready queue
    /// (or prepending, if `immediate`).
    ///
    /// # Errors
    /// Returns [`Error::OutOfFibers`] if the fiber table's free list is empty.
    pub fn spawn<F>(&self, immediate: bool, body: F) -> Result<FiberHandle>
    where
        F: FnOnce(&Reactor) -> FiberResult<()> + 'static,
    {
        let id = self.table.allocate().ok_or(Error::OutOfFibers)?;
        self.table
            .install(id, fiber_trampoline, Box::new(body))
            .inspect_err(|_| self.table.release(id))?;
        self.table.slot(id).state.set(FiberState::Starting);
        self.table.push_ready(id, immediate);
        Ok(self.table.slot(id).handle(id))
    }

    /// Appends the current fiber to the ready queue and switches away.
    pub fn yield_now(&self) -> FiberResult<()> {
        reactor_assert!(self.critical_depth.get() == 0, "yield_now called inside a critical section");
        let id = self.table.current_id();
        self.table.push_ready(id, false);
        self.switch_to_next()
    }

    /// Suspends the current fiber until [`Reactor::resume`]d, an optional
    /// `timeout` elapses (raising [`Error::ReactorTimeout`]), or an error is
    /// thrown into it.
    pub fn suspend(&self, timeout: Option<Duration>) -> FiberResult<()> {
        reactor_assert!(self.critical_depth.get() == 0, "suspend called inside a critical section");
        let id = self.table.current_id();
        let handle = self.table.slot(id).handle(id);
        let timer = timeout.map(|d| self.register_wake_timer(handle, self.clock.deadline_in(d)));
        let result = self.switch_to_next();
        if let Some(t) = timer {
            self.ctq.borrow_mut().cancel(t);
        }
        result
    }

    /// Suspends the current fiber for `duration`, or until woken early by
    /// [`Reactor::resume`]/[`Reactor::throw_in`].
    pub fn sleep(&self, duration: Duration) -> FiberResult<()> {
        self.suspend(Some(duration))
    }

    fn register_wake_timer(&self, handle: FiberHandle, deadline: u64) -> CtqTimerHandle {
        let weak = self.self_weak.clone();
        self.ctq.borrow_mut().insert(
            deadline,
            None,
            Box::new(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.fire_suspend_timeout(handle);
                }
            }),
        )
    }

    fn fire_suspend_timeout(&self, handle: FiberHandle) {
        if !self.table.is_valid(handle) || self.table.is_scheduled(handle.id()) {
            return;
        }
        self.stage_error(handle, PendingError::Reactor(Error::ReactorTimeout));
        self.table.push_ready(handle.id(), false);
    }

    /// Moves a suspended (not-already-scheduled) fiber onto the ready queue.
    /// A no-op if `handle` is stale or the fiber is already scheduled/running.
    pub fn resume(&self, handle: FiberHandle) {
        if !self.table.is_valid(handle) || self.table.is_scheduled(handle.id()) {
            return;
        }
        if self.table.current_id() == handle.id() {
            return;
        }
        self.table.push_ready(handle.id(), false);
    }

    /// Stages `error` in `handle`'s fiber to be raised the next time it is
    /// resumed, waking it if it is currently suspended. Returns `false` if
    /// `handle` is stale.
    pub fn throw_in(&self, handle: FiberHandle, error: Throwable) -> bool {
        if !self.table.is_valid(handle) {
            return false;
        }
        self.stage_error(handle, PendingError::Application(error));
        if !self.table.is_scheduled(handle.id()) && self.table.current_id() != handle.id() {
            self.table.push_ready(handle.id(), false);
        }
        true
    }

    /// Stages [`Error::FiberGroupExtinction`] in `handle`'s fiber, waking it
    /// if suspended. Returns `false` if `handle` is stale.
    pub(crate) fn kill(&self, handle: FiberHandle) -> bool {
        if !self.table.is_valid(handle) {
            return false;
        }
        self.stage_error(handle, PendingError::Reactor(Error::FiberGroupExtinction));
        if !self.table.is_scheduled(handle.id()) && self.table.current_id() != handle.id() {
            self.table.push_ready(handle.id(), false);
        }
        true
    }

    fn stage_error(&self, handle: FiberHandle, error: PendingError) {
        let slot = self.table.slot(handle.id());
        slot.exception.borrow_mut().stage(error);
        let mut flags = slot.flags.get();
        flags.insert(FiberFlags::HAS_EXCEPTION);
        slot.flags.set(flags);
    }

    /// Registers a one-shot timer firing `callback` at `deadline` (reactor
    /// clock cycles; see [`Reactor::clock`]).
    pub fn register_timer(&self, deadline: u64, callback: impl FnMut() + 'static) -> TimerHandle {
        TimerHandle(self.ctq.borrow_mut().insert(deadline, None, Box::new(callback)))
    }

    /// Registers a timer firing `callback` every `interval`, starting one
    /// `interval` from now.
    pub fn register_recurring_timer(&self, interval: Duration, mut callback: impl FnMut() + 'static) -> TimerHandle {
        let interval_cycles = self.clock.duration_to_cycles(interval).max(1);
        let deadline = self.clock.now_cycles() + interval_cycles;
        TimerHandle(self.ctq.borrow_mut().insert(
            deadline,
            Some(interval_cycles),
            Box::new(move || callback()),
        ))
    }

    /// Cancels a previously registered timer. Returns `false` if it already
    /// fired (and was one-shot) or was already cancelled.
    pub fn cancel_timer(&self, handle: TimerHandle) -> bool {
        self.ctq.borrow_mut().cancel(handle.0)
    }

    /// Registers `fd` with the poller and suspends the current fiber until it
    /// becomes ready for `dir`, or `timeout` elapses.
    pub fn wait_fd(&self, ctx: &FdContext, dir: Direction, timeout: Option<Duration>) -> FiberResult<()> {
        reactor_assert!(self.critical_depth.get() == 0, "wait_fd called inside a critical section");
        let id = self.table.current_id();
        let handle = self.table.slot(id).handle(id);
        self.poller.borrow().set_waiter(ctx, dir, handle);
        let timer = timeout.map(|d| self.register_wake_timer(handle, self.clock.deadline_in(d)));
        let result = self.switch_to_next();
        if let Some(t) = timer {
            self.ctq.borrow_mut().cancel(t);
        }
        if result.is_err() {
            self.poller.borrow().clear_waiter(ctx, dir);
        }
        result
    }

    /// Fills `buf` completely from `ctx`'s fd, waiting for readability as
    /// needed. Raises [`Error::ShortRead`] if the peer closes (EOF) before
    /// `buf` is full -- a single short-of-`buf` read is not itself an error,
    /// only reaching EOF while bytes are still wanted is.
    pub fn read_exact(&self, ctx: &FdContext, mut buf: &mut [u8], timeout: Option<Duration>) -> FiberResult<()> {
        while !buf.is_empty() {
            self.wait_fd(ctx, Direction::Read, timeout)?;
            // Safety: `ctx.fd()` is a valid, registered descriptor; `buf` is
            // a live, correctly-sized slice for the duration of the call.
            let n = unsafe { libc::read(ctx.fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted) {
                    continue;
                }
                return Err(PendingError::Reactor(Error::Os(err)));
            }
            if n == 0 {
                return Err(PendingError::Reactor(Error::ShortRead));
            }
            buf = &mut buf[n as usize..];
        }
        Ok(())
    }

    /// Borrows the poller for direct registration (`register_fd`, callback
    /// registration) outside the suspend-oriented [`Reactor::wait_fd`] path.
    #[must_use]
    pub fn poller(&self) -> &RefCell<Poller> {
        &self.poller
    }

    /// Increments the critical-section depth. While non-zero, `yield_now`,
    /// `suspend`, `sleep`, and `wait_fd` panic if called (the design's
    /// cooperative-scheduling invariant: code inside a critical section must
    /// not suspend).
    pub fn enter_critical_section(&self) {
        self.critical_depth.set(self.critical_depth.get() + 1);
    }

    /// Decrements the critical-section depth.
    ///
    /// # Panics
    /// Panics if called without a matching `enter_critical_section`.
    pub fn leave_critical_section(&self) {
        let depth = self.critical_depth.get();
        reactor_assert!(depth > 0, "leave_critical_section without a matching enter");
        self.critical_depth.set(depth - 1);
    }

    /// The currently running fiber's handle.
    #[must_use]
    pub fn current_handle(&self) -> FiberHandle {
        self.table.current_handle()
    }

    /// The currently running fiber's id.
    #[must_use]
    pub fn current_id(&self) -> FiberId {
        self.table.current_id()
    }

    /// `true` if `handle` still refers to the fiber incarnation it was minted
    /// for. Once a fiber's body returns this is permanently `false`, even if
    /// its slot is later reused by a new fiber.
    #[must_use]
    pub fn is_valid(&self, handle: FiberHandle) -> bool {
        self.table.is_valid(handle)
    }

    /// `true` if the currently running fiber is the main fiber.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.table.current_id() == MAIN_FIBER
    }

    /// `true` if the currently running fiber is the idle fiber.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.table.current_id() == IDLE_FIBER
    }

    /// Iterates every live, user-visible fiber's handle and state, in slot
    /// order -- the main fiber and every still-live spawned fiber, but not
    /// the idle fiber, which is scheduler-internal bookkeeping rather than a
    /// fiber collaborators spawned or are waiting on.
    ///
    /// Lazy and non-restartable: do not spawn fibers while iterating.
    pub fn iterate_fibers(&self) -> impl Iterator<Item = (FiberHandle, FiberState)> + '_ {
        self.table
            .iter_live()
            .filter(|(id, _, _)| *id != IDLE_FIBER)
            .map(|(_, handle, state)| (handle, state))
    }

    /// The clock backing this reactor's cycle counts.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn drain_timers(&self, now: u64) {
        loop {
            let popped = self.ctq.borrow_mut().pop(now);
            match popped {
                Some(mut timer) => {
                    (timer.callback)();
                    if let Some(interval) = timer.interval {
                        let next = timer.expiry.saturating_add(interval);
                        self.ctq.borrow_mut().insert(next, Some(interval), timer.callback);
                    }
                }
                None => break,
            }
        }
    }

    /// The scheduler core: checks the outgoing fiber's run time against the
    /// hogger-warning threshold, schedules the idle fiber if the ready queue
    /// is empty, then performs the actual stackful switch and raises any
    /// error staged for the newly resumed (i.e. the caller's own) fiber.
    fn switch_to_next(&self) -> FiberResult<()> {
        let now = self.clock.now_cycles();
        let outgoing = self.table.current_id();

        if !self.table.slot(outgoing).is_special() {
            let ran_for = self
                .clock
                .cycles_to_duration(now.saturating_sub(self.table.slot(outgoing).run_start.get()));
            if ran_for > self.options.hogger_warning_threshold {
                tracing::warn!(fiber = outgoing.0, ?ran_for, "fiber exceeded the hogger warning threshold");
            }
        }

        if self.table.slot(outgoing).state.get() == FiberState::Running {
            self.table.slot(outgoing).state.set(FiberState::Sleeping);
        }

        if self.table.ready_len() == 0 {
            self.table.push_ready(IDLE_FIBER, false);
        }

        let incoming = self
            .table
            .pop_ready()
            .expect("idle fiber guarantees the ready queue is never empty here");
        let prior_state = self.table.slot(incoming).state.get();
        self.table.slot(incoming).state.set(FiberState::Running);
        self.table.set_current(incoming);
        self.table.slot(incoming).run_start.set(now);

        if incoming != outgoing {
            tracing::trace!(from = outgoing.0, to = incoming.0, "switching fiber");
            let arg = if prior_state == FiberState::Starting {
                incoming.0 as usize
            } else {
                0
            };
            fls::set_current_area(self.table.slot(incoming).fls_area.borrow_mut().as_mut_ptr());
            // Safety: both fibrils belong to this reactor's table; `incoming`
            // was either just `install`ed (Starting) or is the suspended
            // target of a previous `switch_to_next` call from this same
            // function, which always pairs a switch-away with a later
            // switch-back through this identical call site.
            unsafe {
                self.table
                    .slot(incoming)
                    .fibril
                    .switch_to(&self.table.slot(outgoing).fibril, arg);
            }
        }

        let id = self.table.current_id();

        #[cfg(feature = "hang_detector")]
        {
            let slot = self.table.slot(id);
            let (base, guard_len) = slot
                .stack
                .borrow()
                .as_ref()
                .map_or((0, 0), |s| (s.guard_base(), s.guard_len()));
            crate::signal::note_running_fiber(id, id == IDLE_FIBER, base, guard_len, slot.run_start.get());
        }

        let mut flags = self.table.slot(id).flags.get();
        if flags.contains(FiberFlags::HAS_EXCEPTION) {
            flags.remove(FiberFlags::HAS_EXCEPTION);
            self.table.slot(id).flags.set(flags);
            if let Some(err) = self.table.slot(id).exception.borrow_mut().take() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Runs a freshly started fiber's body, forwarding any unhandled error to
    /// the main fiber, then retires the slot. Called once, from
    /// [`fiber_trampoline`], at the bottom of every spawned fiber's stack.
    fn run_fiber_body(&self, id: FiberId) -> ! {
        let pre_staged = {
            let mut flags = self.table.slot(id).flags.get();
            if flags.contains(FiberFlags::HAS_EXCEPTION) {
                flags.remove(FiberFlags::HAS_EXCEPTION);
                self.table.slot(id).flags.set(flags);
                self.table.slot(id).exception.borrow_mut().take()
            } else {
                None
            }
        };

        let result = match pre_staged {
            Some(err) => Err(err),
            None => {
                let body = self.table.slot(id).body.borrow_mut().take().expect("fiber body already taken");
                body(self)
            }
        };

        if let Err(err) = result {
            let swallow = matches!(&err, PendingError::Reactor(e) if e.is_cooperative_unwind());
            if !swallow {
                let main_handle = self.table.slot(MAIN_FIBER).handle(MAIN_FIBER);
                self.stage_error(main_handle, err);
                if !self.table.is_scheduled(MAIN_FIBER) {
                    self.table.push_ready(MAIN_FIBER, false);
                }
            }
        }

        self.table.release(id);
        loop {
            let _ = self.switch_to_next();
        }
    }
}

thread_local! {
    /// The one reactor driving this OS thread, installed by `setup` so
    /// [`fiber_trampoline`] can recover `&Reactor` from the `FiberId` alone.
    static CURRENT_REACTOR: Cell<*const Reactor> = const { Cell::new(std::ptr::null()) };
}

impl Drop for Reactor {
    fn drop(&mut self) {
        CURRENT_REACTOR.with(|c| {
            if c.get() == (self as *const Reactor) {
                c.set(std::ptr::null());
            }
        });
    }
}

/// Entry point installed on every spawned (and the idle) fiber's fresh stack.
///
/// `arg` is the fiber's `FiberId` on its first switch-in only (see
/// `Reactor::switch_to_next`); later resumes of an already-running fiber
/// resume inside its own call stack, never back at this function.
unsafe extern "C" fn fiber_trampoline(arg: usize) -> ! {
    let reactor_ptr = CURRENT_REACTOR.with(std::cell::Cell::get);
    debug_assert!(!reactor_ptr.is_null(), "fiber_trampoline run without an installed reactor");
    // Safety: `CURRENT_REACTOR` is installed by `Reactor::setup` and cleared
    // by `Reactor::drop`; every fiber's stack is torn down (via `release`'s
    // incarnation bump, or the process exiting) before the reactor itself can.
    let reactor = unsafe { &*reactor_ptr };
    reactor.run_fiber_body(FiberId(arg as u16))
}

fn park_thread(duration: Duration) {
    if duration.is_zero() {
        std::thread::yield_now();
    } else {
        std::thread::sleep(duration);
    }
}

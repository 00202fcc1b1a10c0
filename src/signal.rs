// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hang detector and fault handlers, gated behind the `hang_detector` feature.
//!
//! Both mechanisms run inside a real POSIX signal handler, so they are held
//! to the constraints §5 calls out: no locks, no allocation, no function that
//! could suspend. [`crate::reactor::Reactor::switch_to_next`] publishes a
//! plain-atomic snapshot of "what's running now" on every switch
//! ([`note_running_fiber`]); the handlers here only ever read that snapshot
//! and [`libc`] primitives, never the reactor's `RefCell`-guarded state
//! directly. Registration goes through `signal_hook_registry`, which already
//! does the bookkeeping real-world handlers need to chain politely with
//! whatever was installed before us.

use crate::error::{Error, Result};
use crate::fiber::FiberId;
use crate::time::Clock;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

static CURRENT_FIBER: AtomicU16 = AtomicU16::new(0);
static CURRENT_IS_IDLE: AtomicBool = AtomicBool::new(true);
static CURRENT_STACK_BASE: AtomicUsize = AtomicUsize::new(0);
static CURRENT_STACK_GUARD_LEN: AtomicUsize = AtomicUsize::new(0);
static CURRENT_RUN_START: AtomicU64 = AtomicU64::new(0);

/// Raw `CLOCK_MONOTONIC` nanoseconds at the instant [`HangDetector::install`]
/// ran, paired with `BASE_CYCLES` (the reactor [`Clock`]'s cycle count at
/// that same instant) so the handler can translate a fresh `clock_gettime`
/// reading into the reactor's cycle units without touching the `Clock`
/// itself from signal context.
static BASE_MONOTONIC_NANOS: AtomicU64 = AtomicU64::new(0);
static BASE_CYCLES: AtomicU64 = AtomicU64::new(0);
static CLOCK_RESOLUTION_NANOS: AtomicU64 = AtomicU64::new(1);
static HANG_TIMEOUT_CYCLES: AtomicU64 = AtomicU64::new(u64::MAX);

static HANG_DETECTOR_INSTALLED: AtomicBool = AtomicBool::new(false);
static FAULT_HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Called by the scheduler on every context switch; records the now-running
/// fiber's identity, stack guard-page bounds, and run-start cycle count as
/// plain atomics so the signal handlers below can read them without racing
/// the fiber table's interior mutability.
pub(crate) fn note_running_fiber(id: FiberId, is_idle: bool, stack_base: usize, guard_len: usize, run_start_cycles: u64) {
    CURRENT_FIBER.store(id.0, Ordering::Relaxed);
    CURRENT_IS_IDLE.store(is_idle, Ordering::Relaxed);
    CURRENT_STACK_BASE.store(stack_base, Ordering::Relaxed);
    CURRENT_STACK_GUARD_LEN.store(guard_len, Ordering::Relaxed);
    CURRENT_RUN_START.store(run_start_cycles, Ordering::Relaxed);
}

/// A handle to the installed hang detector; dropping it does not uninstall
/// the signal handler (POSIX gives no clean way to do that while keeping
/// chained handlers intact) but does disarm the underlying OS timer.
pub struct HangDetector {
    timer_id: libc::timer_t,
}

impl HangDetector {
    /// Installs a periodic real-time-signal timer that aborts the process if
    /// the currently running fiber (per [`note_running_fiber`]) is not the
    /// idle fiber and has been running longer than `timeout`.
    ///
    /// # Panics
    /// Panics if a hang detector is already installed in this process -- per
    /// the design notes, running two reactors that both want a hang detector
    /// in one process is unsupported, not silently overridden.
    pub fn install(timeout: Duration, clock: &Clock) -> Result<Self> {
        assert!(
            !HANG_DETECTOR_INSTALLED.swap(true, Ordering::SeqCst),
            "a hang detector is already installed in this process"
        );

        CLOCK_RESOLUTION_NANOS.store(clock.resolution().as_nanos() as u64, Ordering::Relaxed);
        HANG_TIMEOUT_CYCLES.store(clock.duration_to_cycles(timeout).max(1), Ordering::Relaxed);

        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        // Safety: `CLOCK_MONOTONIC` is always available.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        let now_nanos = (ts.tv_sec as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as u64);
        BASE_MONOTONIC_NANOS.store(now_nanos, Ordering::Relaxed);
        BASE_CYCLES.store(clock.now_cycles(), Ordering::Relaxed);

        let signum = unsafe { libc::SIGRTMIN() };
        // Safety: the registered closure only touches plain atomics and
        // calls `write`/`abort`, all async-signal-safe; `signum` is reserved
        // from the real-time range for this one use. `signal_hook_registry`
        // wants a `Fn()`, not a raw `extern "C" fn(c_int)`, so the signal
        // number itself plays no role in the handler body.
        unsafe {
            signal_hook_registry::register(signum, hang_detector_handler).map_err(Error::Os)?;
        }

        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_SIGNAL;
        sev.sigev_signo = signum;

        let mut timer_id: libc::timer_t = std::ptr::null_mut();
        // Safety: `sev` is fully initialized above; `timer_id` is written on success.
        let rc = unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer_id) };
        if rc != 0 {
            return Err(Error::Os(std::io::Error::last_os_error()));
        }

        let interval_nanos = (timeout.as_nanos() / 3).max(1_000_000) as i64;
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: interval_nanos / 1_000_000_000,
                tv_nsec: interval_nanos % 1_000_000_000,
            },
            it_value: libc::timespec {
                tv_sec: interval_nanos / 1_000_000_000,
                tv_nsec: interval_nanos % 1_000_000_000,
            },
        };
        // Safety: `timer_id` was just created above.
        let rc = unsafe { libc::timer_settime(timer_id, 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(Error::Os(std::io::Error::last_os_error()));
        }

        Ok(Self { timer_id })
    }
}

impl Drop for HangDetector {
    fn drop(&mut self) {
        // Safety: `timer_id` was created by this instance's `install`.
        unsafe {
            libc::timer_delete(self.timer_id);
        }
        HANG_DETECTOR_INSTALLED.store(false, Ordering::SeqCst);
    }
}

/// Async-signal-safe: reads only plain atomics, writes only to stderr via a
/// raw `write(2)`, and calls `abort()`. No allocation, no locks.
///
/// Registered through `signal_hook_registry::register`, which wants a plain
/// `Fn()` and handles the `extern "C"` trampoline and handler chaining itself.
fn hang_detector_handler() {
    if CURRENT_IS_IDLE.load(Ordering::Relaxed) {
        return;
    }
    let resolution_nanos = CLOCK_RESOLUTION_NANOS.load(Ordering::Relaxed);
    let run_start = CURRENT_RUN_START.load(Ordering::Relaxed);
    let timeout_cycles = HANG_TIMEOUT_CYCLES.load(Ordering::Relaxed);

    // Reconstruct "now" in the same cycle units `Clock` uses, without
    // touching the `Clock` itself (it is not `Sync`-safe to read from a
    // handler in general, even though in practice it is just two `Copy`
    // fields) -- CLOCK_MONOTONIC directly, scaled by the stored resolution.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    let now_nanos = (ts.tv_sec as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as u64);
    let base_nanos = BASE_MONOTONIC_NANOS.load(Ordering::Relaxed);
    let elapsed_cycles = now_nanos.saturating_sub(base_nanos) / resolution_nanos.max(1);
    let now_cycles = BASE_CYCLES.load(Ordering::Relaxed).saturating_add(elapsed_cycles);

    if now_cycles.saturating_sub(run_start) > timeout_cycles {
        let fiber = CURRENT_FIBER.load(Ordering::Relaxed);
        write_stderr_hang_message(fiber);
        unsafe {
            libc::abort();
        }
    }
}

fn write_stderr_hang_message(fiber: u16) {
    // Formats a fixed-size, stack-only message -- no heap allocation, no
    // locking `Stdout`, just a raw `write(2)` to fd 2.
    let mut buf = [0u8; 64];
    let prefix = b"reactor: hang detected in fiber #";
    let mut pos = 0;
    for &b in prefix {
        buf[pos] = b;
        pos += 1;
    }
    let mut digits = [0u8; 5];
    let mut n = fiber;
    let mut dpos = digits.len();
    loop {
        dpos -= 1;
        digits[dpos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    for &b in &digits[dpos..] {
        buf[pos] = b;
        pos += 1;
    }
    buf[pos] = b'\n';
    pos += 1;
    // Safety: `buf[..pos]` is initialized above; fd 2 is always open.
    unsafe {
        libc::write(2, buf.as_ptr().cast(), pos);
    }
}

/// Installs `SIGSEGV`/`SIGILL`/`SIGBUS` handlers that log the faulting
/// fiber, whether the fault address falls within its stack's guard page,
/// then terminate the process (`SA_RESETHAND` restores the default
/// disposition before the handler returns, so the second occurrence of the
/// same signal kills the process the ordinary way).
pub fn install_fault_handlers() -> Result<()> {
    if FAULT_HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    for signum in [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL] {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESETHAND | libc::SA_ONSTACK;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
                return Err(Error::Os(std::io::Error::last_os_error()));
            }
        }
    }
    Ok(())
}

extern "C" fn fault_handler(signum: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let addr = unsafe { (*info).si_addr() } as usize;
    let base = CURRENT_STACK_BASE.load(Ordering::Relaxed);
    let guard_len = CURRENT_STACK_GUARD_LEN.load(Ordering::Relaxed);
    let in_guard_page = guard_len != 0 && addr >= base && addr < base + guard_len;
    let fiber = CURRENT_FIBER.load(Ordering::Relaxed);

    let msg: &[u8] = if in_guard_page {
        b"reactor: fault in fiber guard page (stack overflow)\n"
    } else {
        b"reactor: fault in fiber\n"
    };
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
    }
    let _ = fiber;
    let _ = signum;
    // `SA_RESETHAND` already restored the default disposition; re-raising
    // lets the kernel produce the usual core dump / exit status.
    unsafe {
        libc::raise(signum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_running_fiber_updates_snapshot() {
        note_running_fiber(FiberId(3), false, 0x1000, 4096, 42);
        assert_eq!(CURRENT_FIBER.load(Ordering::Relaxed), 3);
        assert!(!CURRENT_IS_IDLE.load(Ordering::Relaxed));
        assert_eq!(CURRENT_RUN_START.load(Ordering::Relaxed), 42);
    }
}

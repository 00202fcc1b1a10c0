// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness I/O poller: an edge-triggered event queue keyed by file descriptor.
//!
//! Linux-only for now (`epoll`), following the same raw-`libc` style as
//! [`crate::stack`]'s `mmap`/`mprotect` use rather than pulling in a
//! portability crate the rest of this core doesn't otherwise need. A second
//! backend (kqueue, IOCP) would slot in behind the same [`Poller`] surface.
//!
//! The poller never suspends or resumes a fiber itself -- it only tracks,
//! per registered fd and direction, what should happen when that direction
//! becomes ready (`DirectionState`), and hands the reactor back a list of
//! fibers to resume and already-invoked callbacks from [`Poller::poll`]. This
//! keeps the dependency one-way (reactor owns poller), per the design notes'
//! "cyclic references" guidance.

use crate::error::{Error, Result};
use crate::fiber::FiberHandle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Which half of a full-duplex fd a registration concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

enum DirectionState {
    None,
    Fiber(FiberHandle),
    Callback { callback: Box<dyn FnMut()>, one_shot: bool },
}

impl DirectionState {
    fn is_none(&self) -> bool {
        matches!(self, DirectionState::None)
    }
}

/// Per-registered-fd bookkeeping, one per direction.
pub struct FdContext {
    fd: RawFd,
    read: RefCell<DirectionState>,
    write: RefCell<DirectionState>,
}

impl FdContext {
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn state(&self, dir: Direction) -> &RefCell<DirectionState> {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }
}

/// Edge-triggered epoll-backed readiness poller.
pub struct Poller {
    epoll_fd: RawFd,
    contexts: HashMap<RawFd, Rc<FdContext>>,
}

const EPOLL_FLAGS: u32 = (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLET) as u32;

impl Poller {
    /// Creates the underlying epoll instance.
    pub fn open() -> Result<Self> {
        // Safety: no preconditions; `epoll_create1` either returns a valid fd or -1.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(Error::Os(std::io::Error::last_os_error()));
        }
        Ok(Self {
            epoll_fd,
            contexts: HashMap::new(),
        })
    }

    /// Registers `fd` for edge-triggered notification on both directions.
    ///
    /// `non_blocking_already` documents whether the caller has already set
    /// `O_NONBLOCK`; edge-triggered mode requires it, so this sets the flag
    /// itself when the caller hasn't.
    pub fn register_fd(&mut self, fd: RawFd, non_blocking_already: bool) -> Result<Rc<FdContext>> {
        if !non_blocking_already {
            set_nonblocking(fd)?;
        }
        let ctx = Rc::new(FdContext {
            fd,
            read: RefCell::new(DirectionState::None),
            write: RefCell::new(DirectionState::None),
        });

        let mut event = libc::epoll_event {
            events: EPOLL_FLAGS,
            u64: fd as u64,
        };
        // Safety: `epoll_fd` is open, `event` is a valid `epoll_event`.
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rc < 0 {
            return Err(Error::Os(std::io::Error::last_os_error()));
        }
        self.contexts.insert(fd, ctx.clone());
        Ok(ctx)
    }

    /// Deregisters `fd`. If `fd_is_closing` is true and the platform
    /// auto-removes closed descriptors from the epoll set (Linux does), the
    /// `epoll_ctl` call is skipped as a pure optimization.
    pub fn deregister_fd(&mut self, ctx: &Rc<FdContext>, fd_is_closing: bool) {
        self.contexts.remove(&ctx.fd);
        if fd_is_closing {
            return;
        }
        // Safety: removing a previously-added fd; a failure here (e.g. fd
        // already closed out from under us) is not actionable.
        unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, ctx.fd, std::ptr::null_mut());
        }
    }

    /// Marks `handle` as the (sole) waiter for `dir` on `ctx`.
    ///
    /// # Panics
    /// Panics if another waiter (fiber or callback) is already registered for
    /// the same direction -- at most one may be outstanding at a time.
    pub fn set_waiter(&self, ctx: &FdContext, dir: Direction, handle: FiberHandle) {
        let cell = ctx.state(dir);
        crate::error::reactor_assert!(
            cell.borrow().is_none(),
            "concurrent waiters on the same fd direction"
        );
        *cell.borrow_mut() = DirectionState::Fiber(handle);
    }

    /// Clears a previously set waiter (timeout/cancel path), returning it if present.
    pub fn clear_waiter(&self, ctx: &FdContext, dir: Direction) -> Option<FiberHandle> {
        let cell = ctx.state(dir);
        let prior = std::mem::replace(&mut *cell.borrow_mut(), DirectionState::None);
        match prior {
            DirectionState::Fiber(h) => Some(h),
            other => {
                *cell.borrow_mut() = other;
                None
            }
        }
    }

    /// Installs a non-suspending callback for `dir`, replacing any prior state.
    pub fn register_callback(&self, ctx: &FdContext, dir: Direction, callback: Box<dyn FnMut()>, one_shot: bool) {
        *ctx.state(dir).borrow_mut() = DirectionState::Callback { callback, one_shot };
    }

    /// Drains ready events, running callbacks inline and collecting the
    /// fibers the reactor should resume.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<FiberHandle>> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 256];
        let timeout_ms = match timeout {
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };

        // Safety: `events` buffer outlives the call and is sized as passed.
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(Error::Os(err));
        }

        let mut to_resume = Vec::new();
        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            let Some(ctx) = self.contexts.get(&fd).cloned() else {
                tracing::debug!(fd, "readiness event for an fd no longer registered");
                continue;
            };
            let bits = event.events;
            if bits & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                Self::dispatch(&ctx, Direction::Read, &mut to_resume);
            }
            if bits & (libc::EPOLLOUT | libc::EPOLLERR) as u32 != 0 {
                Self::dispatch(&ctx, Direction::Write, &mut to_resume);
            }
            if bits & libc::EPOLLRDHUP as u32 != 0 {
                Self::dispatch(&ctx, Direction::Read, &mut to_resume);
            }
        }
        Ok(to_resume)
    }

    fn dispatch(ctx: &FdContext, dir: Direction, to_resume: &mut Vec<FiberHandle>) {
        let cell = ctx.state(dir);
        let current = std::mem::replace(&mut *cell.borrow_mut(), DirectionState::None);
        match current {
            DirectionState::None => {
                // Readiness on a direction nobody asked about; expected noise
                // around EPOLLERR/EPOLLHUP fanning out to both directions.
            }
            DirectionState::Fiber(handle) => to_resume.push(handle),
            DirectionState::Callback { mut callback, one_shot } => {
                callback();
                if !one_shot {
                    *cell.borrow_mut() = DirectionState::Callback { callback, one_shot };
                }
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Safety: `epoll_fd` was returned by `epoll_create1` in `open`.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // Safety: `fd` is a valid, caller-owned descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(Error::Os(std::io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Os(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_deregister_pipe() {
        let mut fds = [0 as RawFd; 2];
        // Safety: standard `pipe2` usage, output array is valid.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        let [read_fd, write_fd] = fds;

        let mut poller = Poller::open().unwrap();
        let ctx = poller.register_fd(read_fd, false).unwrap();
        assert_eq!(ctx.fd(), read_fd);
        poller.deregister_fd(&ctx, false);

        // Safety: fds are owned locally and not used again.
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn callback_fires_on_writable_pipe() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        let [read_fd, write_fd] = fds;

        let mut poller = Poller::open().unwrap();
        let ctx = poller.register_fd(write_fd, false).unwrap();
        let fired = Rc::new(RefCell::new(false));
        let moved = fired.clone();
        poller.register_callback(&ctx, Direction::Write, Box::new(move || *moved.borrow_mut() = true), true);

        let resumed = poller.poll(Some(Duration::from_millis(200))).unwrap();
        assert!(resumed.is_empty());
        assert!(*fired.borrow(), "a fresh pipe write end should be immediately writable");

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}

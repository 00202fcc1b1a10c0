// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error kinds raised by the reactor, its fibers, and its collaborators.
//!
//! All error paths here are designed to avoid allocation: [`Error`] is a plain
//! enum of fixed-size variants so it fits inside a fiber's inline [exception
//! buffer](crate::exception).

use std::fmt;
use std::io;

/// A specialized [`Result`] for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every error kind the reactor itself can raise.
///
/// This does not include application-defined errors thrown via
/// [`Reactor::throw_in`](crate::reactor::Reactor::throw_in) -- those are carried
/// separately as [`crate::exception::Throwable`] payloads.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `spawn` was called while the fiber table's free list was empty.
    #[error("out of fibers: table has no free slots (num_fibers exceeded)")]
    OutOfFibers,

    /// A `suspend`/`sleep` timeout elapsed before the fiber was explicitly resumed.
    #[error("fiber suspension timed out before it was resumed")]
    ReactorTimeout,

    /// `stop()` is unwinding every sleeping fiber. Swallowed at a fiber body's top frame.
    #[error("reactor is shutting down")]
    ReactorExit,

    /// A fiber group was killed and this error was injected into every member.
    #[error("fiber group was terminated")]
    FiberGroupExtinction,

    /// A fd-reading utility hit EOF before a terminator/requested length was reached.
    #[error("short read: stream ended before the requested terminator")]
    ShortRead,

    /// A raw syscall failed; `errno` is preserved via [`io::Error`].
    #[error("os error: {0}")]
    Os(#[from] io::Error),
}

impl Error {
    /// `true` for errors that are expected to propagate silently out of a fiber
    /// body's top frame rather than being reported as a reactor failure.
    #[must_use]
    pub fn is_cooperative_unwind(&self) -> bool {
        matches!(self, Error::ReactorExit | Error::FiberGroupExtinction)
    }
}

/// Fires an [`AssertionFailure`](Error) style invariant violation.
///
/// Mirrors the reactor's failure semantics: in test builds this panics (so the
/// harness can catch it), in release builds it prints to stderr and aborts the
/// process immediately -- invariant violations in the core are never safe to
/// recover from since the fiber table or timer wheel may be in an inconsistent
/// state.
#[track_caller]
pub fn assertion_failure(msg: fmt::Arguments<'_>) -> ! {
    #[cfg(any(test, debug_assertions))]
    {
        panic!("assertion failure: {msg}");
    }
    #[cfg(not(any(test, debug_assertions)))]
    {
        eprintln!("assertion failure: {msg}");
        std::process::abort();
    }
}

macro_rules! reactor_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::error::assertion_failure(format_args!($($arg)*));
        }
    };
}
pub(crate) use reactor_assert;

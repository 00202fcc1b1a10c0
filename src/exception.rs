// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Exception storage for cross-fiber throws.
//!
//! Each fiber owns one [`ExceptionBuffer`] inline in its control block.
//! `throw_in` stages an application error into the target's buffer and sets
//! `HAS_EXCEPTION`; the error itself is an arbitrary, type-erased `Box<dyn
//! Any>`, so staging it is a pointer move, not a payload copy -- the one
//! allocation is in [`Throwable::new`], at the call site that first boxes the
//! error, not on the cross-fiber delivery path itself.

use std::any::Any;
use std::fmt;

/// A boxed application error thrown into a fiber with
/// [`Reactor::throw_in`](crate::reactor::Reactor::throw_in).
///
/// `Throwable` is intentionally type-erased (mirroring how host languages
/// without built-in unwinding cooperate at every suspension point, per the
/// design notes): the reactor core never inspects the payload, it only
/// stages it and raises it back at the fiber's next suspension point.
pub struct Throwable {
    inner: Box<dyn Any + Send + 'static>,
    message: Box<str>,
}

impl Throwable {
    /// Boxes `error` for injection via `throw_in`.
    pub fn new<E: Any + Send + fmt::Display + 'static>(error: E) -> Self {
        let message = error.to_string().into_boxed_str();
        Self {
            inner: Box::new(error),
            message,
        }
    }

    /// The error's `Display` rendering, captured at construction time so it
    /// remains readable even if the caller later downcasts and consumes `self`.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Attempts to recover the concrete error type.
    #[must_use]
    pub fn downcast<E: Any>(self) -> Result<Box<E>, Self> {
        match self.inner.downcast::<E>() {
            Ok(boxed) => Ok(boxed),
            Err(inner) => Err(Self {
                inner,
                message: self.message,
            }),
        }
    }
}

impl fmt::Debug for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throwable").field("message", &self.message).finish()
    }
}

/// Either a reactor-originated error (`ReactorTimeout`, `ReactorExit`, ...) or
/// an application-supplied [`Throwable`] staged for a fiber.
#[derive(Debug)]
pub enum PendingError {
    Reactor(crate::error::Error),
    Application(Throwable),
}

impl fmt::Display for PendingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingError::Reactor(e) => write!(f, "{e}"),
            PendingError::Application(t) => write!(f, "{}", t.message()),
        }
    }
}

/// One fiber's reusable exception slot.
///
/// `pending` is reused in place by `stage`/`take`/`reset` rather than the
/// buffer itself being reallocated per throw.
#[derive(Debug, Default)]
pub struct ExceptionBuffer {
    pending: Option<PendingError>,
}

impl ExceptionBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self { pending: None }
    }

    /// Stages an error to be raised the next time the owning fiber is resumed.
    pub fn stage(&mut self, error: PendingError) {
        self.pending = Some(error);
    }

    /// `true` if an error is staged (mirrors the fiber's `HAS_EXCEPTION` flag).
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Takes the staged error, clearing the slot for reuse.
    pub fn take(&mut self) -> Option<PendingError> {
        self.pending.take()
    }

    /// Clears the slot, e.g. when a fiber returns to the free list.
    pub fn reset(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct MyError(&'static str);
    impl fmt::Display for MyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[test]
    fn stage_and_take_round_trips_message() {
        let mut buf = ExceptionBuffer::new();
        assert!(!buf.has_pending());
        buf.stage(PendingError::Application(Throwable::new(MyError("x"))));
        assert!(buf.has_pending());
        let taken = buf.take().unwrap();
        assert_eq!(taken.to_string(), "x");
        assert!(!buf.has_pending());
    }

    #[test]
    fn downcast_recovers_concrete_type() {
        let t = Throwable::new(MyError("boom"));
        let recovered = t.downcast::<MyError>().unwrap();
        assert_eq!(recovered.0, "boom");
    }
}

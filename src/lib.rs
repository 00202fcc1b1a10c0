//! `cascade-reactor`: a single-threaded cooperative fiber runtime.
//!
//! A [`Reactor`] multiplexes stackful fibers on one OS thread. Fibers
//! suspend at well-defined points -- `Reactor::suspend`, I/O waits,
//! timers, [`sync`] primitives -- and are resumed by the reactor's core
//! loop, which drives a readiness-based `epoll` poller and a cascading
//! timer wheel to decide who runs next. Context switches themselves are a
//! handful of inline-asm instructions; everything above that is plain,
//! single-threaded Rust.

pub mod ctq;
mod error;
mod exception;
mod fiber;
mod fibril;
pub mod fls;
mod poller;
mod reactor;
#[cfg(feature = "hang_detector")]
mod signal;
mod stack;
pub mod sync;
mod time;

pub use error::{Error, Result};
pub use exception::{PendingError, Throwable};
pub use fiber::{FiberHandle, FiberId, FiberState, IDLE_FIBER, MAIN_FIBER};
pub use fls::FiberLocalKey;
pub use poller::{Direction, FdContext};
pub use reactor::{FiberResult, Options, Reactor, TimerHandle};
#[cfg(feature = "hang_detector")]
pub use signal::{install_fault_handlers, HangDetector};
pub use stack::Stack;
pub use time::{Clock, Cycles};

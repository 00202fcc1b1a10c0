// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use cascade_reactor::sync::Event;
use cascade_reactor::{FiberState, Options, Reactor};

fn small_reactor() -> Rc<Reactor> {
    Reactor::setup(Options {
        num_fibers: 16,
        timer_granularity: Duration::from_millis(1),
        ..Options::default()
    })
    .expect("reactor setup")
}

/// Six fibers sleep for distinct durations; a seventh sleeps longest and
/// then stops the reactor. Every sleeper should observe elapsed time at
/// least as long as it asked for, and `start()` should return once the
/// longest sleeper has run.
#[test]
fn sleepers_overshoot_but_all_wake() {
    let reactor = small_reactor();
    let durations_ms = [10u64, 20, 30, 100, 150, 200];
    let woke = Rc::new(RefCell::new(Vec::new()));

    for (i, ms) in durations_ms.into_iter().enumerate() {
        let woke = woke.clone();
        reactor
            .spawn(false, move |r| {
                let before = r.clock().now_cycles();
                r.sleep(Duration::from_millis(ms))?;
                let elapsed = r.clock().cycles_to_duration(r.clock().now_cycles() - before);
                woke.borrow_mut().push((i, elapsed));
                Ok(())
            })
            .expect("spawn sleeper");
    }

    reactor
        .spawn(false, |r| {
            r.sleep(Duration::from_millis(250))?;
            r.stop();
            Ok(())
        })
        .expect("spawn stopper");

    reactor.start().expect("start");
    reactor.teardown();

    let woke = woke.borrow();
    assert_eq!(woke.len(), durations_ms.len(), "every sleeper must wake");
    for &(i, elapsed) in woke.iter() {
        let requested = Duration::from_millis(durations_ms[i]);
        assert!(
            elapsed >= requested,
            "fiber {i} woke before its requested {requested:?} (elapsed {elapsed:?})"
        );
        assert!(
            elapsed < requested + Duration::from_millis(100),
            "fiber {i} overshot its requested {requested:?} by too much (elapsed {elapsed:?})"
        );
    }
}

#[derive(Debug)]
struct MyError(&'static str);

impl fmt::Display for MyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fiber A sets event E, then waits on event F (never set). Fiber B waits on
/// E, then throws into A instead of ever setting F. A must observe the
/// thrown error at its wait on F, not hang forever.
#[test]
fn thrown_error_crosses_fibers_at_a_suspension_point() {
    let reactor = small_reactor();
    let e = Rc::new(Event::new());
    let f = Rc::new(Event::new());
    let observed = Rc::new(RefCell::new(None));

    let e_a = e.clone();
    let f_a = f.clone();
    let observed_a = observed.clone();
    let a_handle = reactor
        .spawn(false, move |r| {
            e_a.set(r);
            let result = f_a.wait(r);
            *observed_a.borrow_mut() = Some(result);
            Ok(())
        })
        .expect("spawn A");

    let e_b = e.clone();
    reactor
        .spawn(false, move |r| {
            e_b.wait(r)?;
            r.throw_in(a_handle, cascade_reactor::Throwable::new(MyError("x")));
            Ok(())
        })
        .expect("spawn B");

    reactor.start().expect("start");
    reactor.teardown();

    let result = observed.borrow_mut().take().expect("A must have recorded an outcome");
    match result {
        Err(cascade_reactor::PendingError::Application(thrown)) => {
            assert_eq!(thrown.message(), "x");
        }
        other => panic!("expected A to observe a thrown application error, got {other:?}"),
    }
}

/// Writes 1024 bytes into a pipe and closes the write end; a reader fiber
/// reads all of it, then reads again and must see a clean EOF (0 bytes), not
/// a `ShortRead` error -- EOF with an empty request is not a short read.
#[test]
fn pipe_hangup_after_full_read_is_a_clean_eof() {
    use std::os::fd::AsRawFd;

    let reactor = small_reactor();
    let (read_end, mut write_end) = pipe();

    {
        use std::io::Write as _;
        let payload = vec![7u8; 1024];
        write_end.write_all(&payload).expect("write pipe payload");
    }
    drop(write_end);

    let read_fd = read_end.as_raw_fd();
    let ctx = reactor
        .poller()
        .borrow_mut()
        .register_fd(read_fd, false)
        .expect("register read fd");

    let result = Rc::new(RefCell::new(None));
    let result_clone = result.clone();
    reactor
        .spawn(true, move |r| {
            let mut buf = [0u8; 1024];
            r.read_exact(&ctx, &mut buf, Some(Duration::from_millis(50)))?;
            assert!(buf.iter().all(|&b| b == 7));

            r.wait_fd(&ctx, cascade_reactor::Direction::Read, Some(Duration::from_millis(50)))?;
            // Safety: `read_fd` is a valid, registered descriptor owned by this test.
            let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            *result_clone.borrow_mut() = Some(n);
            Ok(())
        })
        .expect("spawn reader");

    reactor.start().expect("start");
    reactor.teardown();

    assert_eq!(*result.borrow(), Some(0), "second read past EOF must return 0");
    drop(read_end);
}

fn pipe() -> (std::fs::File, std::fs::File) {
    use std::os::fd::FromRawFd;

    let mut fds = [0i32; 2];
    // Safety: `fds` is a valid two-element buffer for `pipe(2)`.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe(2) failed");
    // Safety: both fds were just returned by a successful `pipe(2)` call and
    // are not otherwise owned.
    unsafe { (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1])) }
}

/// Spawns X (yields once, then finishes), Y (waits on an unset event, never
/// finishes), and Z (spawned but never run before the assertion). Exactly
/// four fibers should be visible: X, Y, Z, and the caller (main).
#[test]
fn iterate_fibers_reports_every_live_state() {
    let reactor = small_reactor();

    let x_handle = reactor
        .spawn(false, |r| {
            r.yield_now()?;
            Ok(())
        })
        .expect("spawn X");

    let never_set = Rc::new(Event::new());
    let never_set_y = never_set.clone();
    let y_handle = reactor
        .spawn(false, move |r| {
            never_set_y.wait(r)?;
            Ok(())
        })
        .expect("spawn Y");

    reactor.yield_now().expect("main yields once so X and Y make progress");

    let z_handle = reactor.spawn(false, |_r| Ok(())).expect("spawn Z");

    let states: Vec<_> = reactor.iterate_fibers().collect();
    assert_eq!(states.len(), 4, "expected X, Y, Z, and main -- not the idle fiber");

    let state_of = |handle: cascade_reactor::FiberHandle| {
        states
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, s)| *s)
            .unwrap_or_else(|| panic!("missing handle in iterate_fibers output"))
    };

    assert_eq!(state_of(x_handle), FiberState::Scheduled);
    assert_eq!(state_of(y_handle), FiberState::Sleeping);
    assert_eq!(state_of(z_handle), FiberState::Starting);
    assert_eq!(state_of(reactor.current_handle()), FiberState::Running);

    reactor.stop();
    reactor.start().expect("drain remaining fibers");
    reactor.teardown();
}

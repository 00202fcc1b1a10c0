// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::hint::black_box;
use std::rc::Rc;
use std::time::Duration;

use cascade_reactor::{Options, Reactor};
use criterion::{criterion_group, criterion_main, Criterion};

fn new_reactor() -> Rc<Reactor> {
    Reactor::setup(Options {
        register_default_idler: false,
        ..Options::default()
    })
    .unwrap()
}

fn single_spawn(c: &mut Criterion) {
    c.bench_function("single_spawn", |b| {
        b.iter(|| {
            let reactor = new_reactor();
            reactor
                .spawn(false, |r| {
                    black_box(1 + 1);
                    r.stop();
                    Ok(())
                })
                .unwrap();
            reactor.start().unwrap();
            reactor.teardown();
        })
    });
}

fn spawn_ten(c: &mut Criterion) {
    c.bench_function("spawn_ten", |b| {
        b.iter(|| {
            let reactor = new_reactor();
            for _ in 0..10 {
                reactor.spawn(false, |r| r.yield_now()).unwrap();
            }
            reactor.stop();
            reactor.start().unwrap();
            reactor.teardown();
        })
    });
}

fn spawn_with_sleep(c: &mut Criterion) {
    c.bench_function("spawn_with_sleep", |b| {
        b.iter(|| {
            let reactor = new_reactor();
            reactor
                .spawn(false, |r| {
                    r.sleep(Duration::from_nanos(1))?;
                    r.stop();
                    Ok(())
                })
                .unwrap();
            reactor.start().unwrap();
            reactor.teardown();
        })
    });
}

criterion_group!(spawn, single_spawn, spawn_ten, spawn_with_sleep);
criterion_main!(spawn);

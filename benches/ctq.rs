// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::hint::black_box;

use cascade_reactor::ctq::{Ctq, CtqConfig};
use criterion::{criterion_group, criterion_main, Criterion};

fn config() -> CtqConfig {
    CtqConfig {
        resolution: 1,
        levels: 4,
        bins_per_level: 64,
    }
}

/// Small xorshift PRNG so the bench doesn't need to pull in a `rand` crate
/// this crate otherwise has no use for.
struct Xorshift(u64);
impl Xorshift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

fn insert_sequential(c: &mut Criterion) {
    c.bench_function("ctq_insert_sequential", |b| {
        b.iter(|| {
            let mut ctq = Ctq::new(config(), 0);
            ctq.reserve(1000);
            for i in 0..1000u64 {
                black_box(ctq.insert(i, None, Box::new(|| {})));
            }
        })
    });
}

fn insert_scattered(c: &mut Criterion) {
    c.bench_function("ctq_insert_scattered", |b| {
        b.iter(|| {
            let mut ctq = Ctq::new(config(), 0);
            ctq.reserve(1000);
            let mut rng = Xorshift(0x2545_F491_4F6C_DD1D);
            for _ in 0..1000 {
                let expiry = rng.next() % 1_000_000;
                black_box(ctq.insert(expiry, None, Box::new(|| {})));
            }
        })
    });
}

fn insert_then_drain(c: &mut Criterion) {
    c.bench_function("ctq_insert_then_drain", |b| {
        b.iter(|| {
            let mut ctq = Ctq::new(config(), 0);
            ctq.reserve(1000);
            let mut rng = Xorshift(0xDEAD_BEEF_1234_5678);
            for _ in 0..1000 {
                let expiry = rng.next() % 1_000_000;
                ctq.insert(expiry, None, Box::new(|| {}));
            }
            let mut now = 0u64;
            while !ctq.is_empty() {
                now += 64;
                while ctq.pop(now).is_some() {}
            }
        })
    });
}

criterion_group!(ctq, insert_sequential, insert_scattered, insert_then_drain);
criterion_main!(ctq);

// Copyright 2026 cascade-reactor contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cascading Timer Queue: a hierarchical hashed timer wheel.
//!
//! `levels` rings of `bins_per_level` bins each; level `l`'s bins are
//! `resolution * bins_per_level^l` cycles wide and together span
//! `resolution * bins_per_level^(l+1)` cycles. Entries beyond the deepest
//! level's horizon sit in a double-buffered overflow list. See
//! `libs/async-exec/src/time/wheel.rs` in the teacher crate for the general
//! shape of a single-level hashed wheel that this generalizes to multiple
//! cascading levels.

use crate::time::Cycles;
use std::collections::VecDeque;

/// Configuration fixed for the lifetime of a [`Ctq`].
#[derive(Debug, Clone, Copy)]
pub struct CtqConfig {
    pub resolution: Cycles,
    pub levels: usize,
    pub bins_per_level: usize,
}

impl CtqConfig {
    fn validate(&self) {
        assert!(self.resolution > 0, "resolution must be positive");
        assert!(self.levels >= 2, "levels must be >= 2");
        assert!(
            self.bins_per_level.is_power_of_two(),
            "bins_per_level must be a power of two"
        );
    }
}

/// Opaque identity of a queued timer, returned by [`Ctq::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    index: u32,
    generation: u32,
}

pub type Callback = Box<dyn FnMut()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Bin { level: usize, idx: usize },
    Overflow { buf: usize },
}

struct Entry {
    expiry: Cycles,
    interval: Option<Cycles>,
    callback: Callback,
    generation: u32,
    location: Location,
}

enum Slot {
    Free { next: Option<u32>, generation: u32 },
    Occupied(Entry),
}

/// A fired timer handed back to the caller by [`Ctq::pop`].
///
/// The caller (the reactor's main fiber) is responsible for invoking
/// `callback` and, if `interval` is `Some`, re-inserting it with the next
/// expiry; the queue itself never calls application code.
pub struct PoppedTimer {
    pub handle: TimerHandle,
    pub callback: Callback,
    pub interval: Option<Cycles>,
    pub expiry: Cycles,
}

/// The queue itself.
pub struct Ctq {
    config: CtqConfig,
    epoch: Cycles,
    /// Count of level-0 bins consumed since `epoch`.
    phase: u64,
    /// Absolute cycle value of the start of the current level-0 bin.
    popped_time: Cycles,
    /// `base_time[l]` / `end_time[l]`: absolute bounds of level `l`'s current
    /// N-bin window. Recomputed in closed form from `phase` on every advance
    /// rather than nudged incrementally, so they never drift.
    base_time: Vec<Cycles>,
    end_time: Vec<Cycles>,
    bins: Vec<Vec<VecDeque<u32>>>,
    overflow: [VecDeque<u32>; 2],
    overflow_active: usize,
    slots: Vec<Slot>,
    free_head: Option<u32>,
    len: usize,
    next_entry_hint: Option<u64>,
}

impl Ctq {
    #[must_use]
    pub fn new(config: CtqConfig, now: Cycles) -> Self {
        config.validate();
        let levels = config.levels;
        let bins = (0..levels)
            .map(|_| (0..config.bins_per_level).map(|_| VecDeque::new()).collect())
            .collect();
        let mut ctq = Self {
            config,
            epoch: now,
            phase: 0,
            popped_time: now,
            base_time: vec![0; levels],
            end_time: vec![0; levels],
            bins,
            overflow: [VecDeque::new(), VecDeque::new()],
            overflow_active: 0,
            slots: Vec::new(),
            free_head: None,
            len: 0,
            next_entry_hint: Some(0),
        };
        for level in 0..levels {
            ctq.refresh_window(level);
        }
        ctq
    }

    /// Pre-reserves slab capacity for `additional` timers, avoiding
    /// reallocation during steady-state `insert` calls.
    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bin_pow(&self, level: usize) -> u64 {
        (self.config.bins_per_level as u64).pow(level as u32)
    }

    fn ticks_since_epoch(&self, t: Cycles) -> u64 {
        t.saturating_sub(self.epoch) / self.config.resolution
    }

    /// Recomputes `base_time[level]`/`end_time[level]` from `phase` alone.
    fn refresh_window(&mut self, level: usize) {
        let span = self.bin_pow(level) * self.config.bins_per_level as u64;
        let window_start_ticks = (self.phase / span) * span;
        let base = self.epoch + window_start_ticks * self.config.resolution;
        self.base_time[level] = base;
        self.end_time[level] = base + span * self.config.resolution;
    }

    /// Pulls a free slot (inheriting its bumped generation) or grows the slab, stamps
    /// `entry.generation` to match, and returns the resulting handle.
    fn allocate_slot(&mut self, mut entry: Entry) -> TimerHandle {
        match self.free_head {
            Some(idx) => {
                let i = idx as usize;
                let Slot::Free { next, generation } = &self.slots[i] else {
                    unreachable!("free list corrupt")
                };
                let (next, generation) = (*next, *generation);
                self.free_head = next;
                entry.generation = generation;
                self.slots[i] = Slot::Occupied(entry);
                TimerHandle { index: idx, generation }
            }
            None => {
                let idx = self.slots.len() as u32;
                entry.generation = 0;
                let generation = entry.generation;
                self.slots.push(Slot::Occupied(entry));
                TimerHandle { index: idx, generation }
            }
        }
    }

    /// Removes slot `index`'s entry, leaving behind a `Free` node carrying the
    /// bumped generation the next occupant will be stamped with.
    fn free_slot(&mut self, index: u32) -> Entry {
        let i = index as usize;
        let generation = match &self.slots[i] {
            Slot::Occupied(e) => e.generation.wrapping_add(1),
            Slot::Free { .. } => unreachable!("double free of timer slot"),
        };
        let slot = std::mem::replace(
            &mut self.slots[i],
            Slot::Free { next: self.free_head, generation },
        );
        self.free_head = Some(index);
        match slot {
            Slot::Occupied(entry) => entry,
            Slot::Free { .. } => unreachable!("double free of timer slot"),
        }
    }

    /// Inserts a new timer, routing it to the current bin, a wheel bin, or overflow.
    pub fn insert(&mut self, expiry: Cycles, interval: Option<Cycles>, callback: Callback) -> TimerHandle {
        let generation = 0;
        let entry = Entry {
            expiry,
            interval,
            callback,
            generation,
            location: Location::Overflow { buf: self.overflow_active },
        };
        let handle = self.allocate_slot(entry);
        self.route(handle.index);
        self.tighten_hint(self.distance_to(expiry));
        self.len += 1;
        handle
    }

    /// Places slot `index`'s entry (already allocated) into the correct bin/overflow.
    fn route(&mut self, index: u32) {
        let expiry = match &self.slots[index as usize] {
            Slot::Occupied(e) => e.expiry,
            Slot::Free { .. } => unreachable!(),
        };
        let deepest = self.config.levels - 1;

        let location = if expiry <= self.popped_time {
            Location::Bin {
                level: 0,
                idx: (self.phase % self.config.bins_per_level as u64) as usize,
            }
        } else if expiry >= self.end_time[deepest] {
            Location::Overflow { buf: self.overflow_active }
        } else {
            let level = (0..self.config.levels)
                .find(|&l| expiry < self.end_time[l])
                .unwrap_or(deepest);
            let ticks = self.ticks_since_epoch(expiry);
            let idx = ((ticks / self.bin_pow(level)) % self.config.bins_per_level as u64) as usize;
            Location::Bin { level, idx }
        };

        if let Slot::Occupied(e) = &mut self.slots[index as usize] {
            e.location = location;
        }
        match location {
            Location::Bin { level, idx } => self.bins[level][idx].push_back(index),
            Location::Overflow { buf } => self.overflow[buf].push_back(index),
        }
    }

    fn distance_to(&self, expiry: Cycles) -> u64 {
        if expiry <= self.popped_time {
            0
        } else {
            (expiry - self.popped_time) / self.config.resolution
        }
    }

    fn tighten_hint(&mut self, distance: u64) {
        self.next_entry_hint = Some(match self.next_entry_hint {
            Some(h) => h.min(distance),
            None => distance,
        });
    }

    /// Cancels a previously inserted timer. Returns `false` if already fired or cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let i = handle.index as usize;
        if i >= self.slots.len() {
            return false;
        }
        let matches = match &self.slots[i] {
            Slot::Occupied(e) => e.generation == handle.generation,
            Slot::Free { .. } => false,
        };
        if !matches {
            return false;
        }
        let location = match &self.slots[i] {
            Slot::Occupied(e) => e.location,
            Slot::Free { .. } => unreachable!(),
        };
        let bin = match location {
            Location::Bin { level, idx } => &mut self.bins[level][idx],
            Location::Overflow { buf } => &mut self.overflow[buf],
        };
        if let Some(pos) = bin.iter().position(|&idx| idx == handle.index) {
            bin.remove(pos);
        }
        // `free_slot` leaves behind a `Free` node already carrying the bumped
        // generation; nothing further to stamp.
        let _entry = self.free_slot(handle.index);
        self.len -= 1;
        // The cancelled entry may have been the one the cached hint was based
        // on; invalidate rather than try to prove it wasn't.
        self.next_entry_hint = None;
        true
    }

    /// Returns the cached lower bound on bins-until-next-entry, recomputing it
    /// via a full scan (`4.4.4`) if invalidated.
    fn entry_hint(&mut self) -> Option<u64> {
        if let Some(h) = self.next_entry_hint {
            return Some(h);
        }
        let hint = self.recompute_hint();
        self.next_entry_hint = Some(hint.unwrap_or(u64::MAX));
        if hint.is_none() { None } else { self.next_entry_hint }
    }

    /// Public view of the cached/recomputed entry hint, in level-0 bins, for
    /// callers (the idle fiber) deciding how long to block.
    pub fn peek_hint(&mut self) -> Option<u64> {
        self.entry_hint()
    }

    fn recompute_hint(&self) -> Option<u64> {
        let bins_per_level = self.config.bins_per_level as u64;
        let level0_start = (self.phase % bins_per_level) as usize;
        // Bins before `level0_start` in the ring belong to a later wrap of
        // this same ring (one full `level 1` bin away, at least), not to the
        // time window we're about to scan -- so the level-0 scan only ever
        // covers the bins still ahead of us in the current ring, capping its
        // contribution at that remaining count rather than the whole ring.
        let remaining = self.config.bins_per_level - level0_start;
        for step in 0..remaining {
            let idx = (level0_start + step) % self.config.bins_per_level;
            if !self.bins[0][idx].is_empty() {
                return Some(step as u64);
            }
        }

        // `acc` is a safe lower bound on ticks until the start of whichever
        // deeper level's current window we're scanning next; it does not
        // grow per deeper-level bin scanned; since any entry hashed here
        // could sit anywhere inside that (coarser) bin, the earliest
        // possible moment it's safe to assume is the window's own start.
        let acc = remaining as u64;
        for level in 1..self.config.levels {
            let ticks = self.phase;
            let start = ((ticks / self.bin_pow(level)) % self.config.bins_per_level as u64) as usize;
            for step in 0..self.config.bins_per_level {
                let idx = (start + step) % self.config.bins_per_level;
                if !self.bins[level][idx].is_empty() {
                    return Some(acc);
                }
            }
        }
        if !self.overflow[self.overflow_active].is_empty() {
            return Some(acc.max(self.distance_to_deepest_horizon()));
        }
        None
    }

    fn distance_to_deepest_horizon(&self) -> u64 {
        let deepest = self.config.levels - 1;
        self.distance_to(self.end_time[deepest])
    }

    /// Advances the wheel by `k` level-0 bins. `k` must not exceed the
    /// current entry hint (callers should call [`Self::pop`], which enforces this).
    fn advance(&mut self, k: u64) {
        assert!(k > 0, "advance(0) is a no-op the caller should skip");
        for _ in 0..k {
            self.tick();
        }
        self.next_entry_hint = self.next_entry_hint.map(|h| h.saturating_sub(k));
    }

    fn tick(&mut self) {
        self.phase += 1;
        self.popped_time += self.config.resolution;

        for level in 1..self.config.levels {
            let pow = self.bin_pow(level);
            if self.phase % pow == 0 {
                self.refresh_window(level - 1);
                let idx = ((self.phase / pow) % self.config.bins_per_level as u64) as usize;
                let drained: Vec<u32> = self.bins[level][idx].drain(..).collect();
                for idx in drained {
                    self.route(idx);
                }
            }
        }

        let wheel_span = self.bin_pow(self.config.levels);
        if self.phase % wheel_span == 0 {
            let deepest = self.config.levels - 1;
            self.refresh_window(deepest);
            self.overflow_active = 1 - self.overflow_active;
            let candidates: Vec<u32> = self.overflow[self.overflow_active].drain(..).collect();
            for idx in candidates {
                self.route(idx);
            }
        }
    }

    /// `true` if a timer is due at `now` without committing to popping it.
    ///
    /// Cheap common case (current level-0 bin non-empty); otherwise consults
    /// the entry hint, which may trigger a hint recomputation scan but never
    /// advances the wheel itself.
    pub fn peek_due(&mut self, now: Cycles) -> bool {
        let idx0 = (self.phase % self.config.bins_per_level as u64) as usize;
        if !self.bins[0][idx0].is_empty() {
            return true;
        }
        let bins_in_past = now.saturating_sub(self.popped_time) / self.config.resolution;
        if bins_in_past == 0 {
            return false;
        }
        matches!(self.entry_hint(), Some(h) if h <= bins_in_past)
    }

    /// Dequeues the next fired timer with `expiry <= now`, advancing the
    /// wheel as needed. Returns `None` without advancing past `now` once
    /// nothing more is due.
    pub fn pop(&mut self, now: Cycles) -> Option<PoppedTimer> {
        loop {
            let idx0 = (self.phase % self.config.bins_per_level as u64) as usize;
            if let Some(slot_index) = self.bins[0][idx0].pop_front() {
                let entry = self.free_slot(slot_index);
                self.len -= 1;
                return Some(PoppedTimer {
                    handle: TimerHandle {
                        index: slot_index,
                        generation: entry.generation,
                    },
                    callback: entry.callback,
                    interval: entry.interval,
                    expiry: entry.expiry,
                });
            }

            let bins_in_past = now.saturating_sub(self.popped_time) / self.config.resolution;
            if bins_in_past == 0 {
                return None;
            }
            let hint = match self.entry_hint() {
                Some(h) => h,
                None => return None,
            };
            let step = bins_in_past.min(hint.max(1));
            if step == 0 {
                return None;
            }
            self.advance(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cfg() -> CtqConfig {
        CtqConfig {
            resolution: 4,
            levels: 3,
            bins_per_level: 4,
        }
    }

    #[test]
    fn fires_in_deadline_order_with_distinct_deadlines() {
        let mut ctq = Ctq::new(cfg(), 0);
        let fired = Rc::new(RefCell::new(Vec::new()));
        for (i, delay) in [40, 4, 16, 8].into_iter().enumerate() {
            let fired = fired.clone();
            ctq.insert(delay, None, Box::new(move || fired.borrow_mut().push(i)));
        }
        let mut now = 0;
        while fired.borrow().len() < 4 {
            now += 4;
            while let Some(mut popped) = ctq.pop(now) {
                (popped.callback)();
            }
        }
        assert_eq!(*fired.borrow(), vec![1, 3, 2, 0]);
    }

    #[test]
    fn cancel_prevents_firing_and_updates_length() {
        let mut ctq = Ctq::new(cfg(), 0);
        let h = ctq.insert(100, None, Box::new(|| {}));
        assert_eq!(ctq.len(), 1);
        assert!(ctq.cancel(h));
        assert_eq!(ctq.len(), 0);
        assert!(!ctq.cancel(h), "cancelling twice must fail");

        let mut fired = false;
        let mut now = 0;
        while now < 200 {
            now += 4;
            if ctq.pop(now).is_some() {
                fired = true;
            }
        }
        assert!(!fired);
    }

    #[test]
    fn entries_beyond_deepest_level_land_in_overflow_and_still_fire() {
        let mut ctq = Ctq::new(cfg(), 0);
        // Deepest level horizon is resolution * bins^levels = 4*4^3 = 256.
        let fired = Rc::new(RefCell::new(false));
        let moved = fired.clone();
        ctq.insert(1000, None, Box::new(move || *moved.borrow_mut() = true));
        assert_eq!(ctq.len(), 1);

        let mut now = 0;
        while now < 1100 && !*fired.borrow() {
            now += 4;
            if let Some(mut p) = ctq.pop(now) {
                (p.callback)();
            }
        }
        assert!(*fired.borrow(), "overflowed timer must eventually cascade in and fire");
    }

    #[test]
    fn length_tracks_every_mutation() {
        let mut ctq = Ctq::new(cfg(), 0);
        let handles: Vec<_> = (0..20).map(|i| ctq.insert(4 * (i + 1), None, Box::new(|| {}))).collect();
        assert_eq!(ctq.len(), 20);
        for h in handles.iter().step_by(2) {
            ctq.cancel(*h);
        }
        assert_eq!(ctq.len(), 10);
    }

    /// Tiny xorshift PRNG so this stays free of a `rand` dependency the rest
    /// of the crate has no other use for.
    struct Xorshift(u64);
    impl Xorshift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
        fn below(&mut self, bound: u64) -> u64 {
            self.next() % bound
        }
    }

    #[test]
    fn random_stress_with_interleaved_cancellation_tracks_length_and_order() {
        let mut ctq = Ctq::new(cfg(), 0);
        let mut rng = Xorshift(0x9E37_79B9_7F4A_7C15);
        let horizon = 256u64; // resolution * bins^levels, the deepest level's span
        let mut live: Vec<TimerHandle> = Vec::new();
        let mut fired = 0usize;
        let mut cancelled = 0usize;
        let mut fire_times: Vec<(Cycles, Cycles)> = Vec::new(); // (expiry, observed fire time)

        let mut now: Cycles = 0;
        let num_inserted = 10_000u64;
        for i in 0..num_inserted {
            let expiry = now + rng.below(horizon * 2);
            let idx_before = i;
            let handle = ctq.insert(expiry, None, Box::new(|| {}));
            live.push(handle);
            let _ = idx_before;

            // 10% of insertions are immediately cancelled again.
            if rng.below(10) == 0 {
                let pos = live.len() - 1;
                let h = live.remove(pos);
                if ctq.cancel(h) {
                    cancelled += 1;
                }
            }

            // Interleave a random 0-50-bin advance, draining whatever's due.
            let advance = rng.below(51);
            if advance > 0 {
                now += advance * cfg().resolution;
                while let Some(popped) = ctq.pop(now) {
                    fire_times.push((popped.expiry, now));
                    fired += 1;
                }
            }
        }

        // Drain everything left.
        now += horizon * 4;
        while let Some(popped) = ctq.pop(now) {
            fire_times.push((popped.expiry, now));
            fired += 1;
        }

        assert_eq!(
            ctq.len(),
            0,
            "every inserted timer must end up either fired or cancelled"
        );
        assert_eq!((fired + cancelled) as u64, num_inserted);
        for (expiry, observed) in fire_times {
            assert!(
                observed >= expiry,
                "a timer must never be observed firing before its expiry ({observed} < {expiry})"
            );
            assert!(
                observed < expiry + cfg().resolution * 64,
                "a timer must fire within a bounded number of resolutions of its expiry"
            );
        }
    }
}

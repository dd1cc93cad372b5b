// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::vec::Vec;
use core::pin::Pin;
use core::ptr::NonNull;

use cordyceps::List;
use static_assertions::const_assert_eq;

use crate::error::ContractViolation;
use crate::level::Level;
use crate::node::EventNode;
use crate::tick::Tick;

const_assert_eq!(Level::WIDTH, 256);
// `NUM_LEVELS * BITS == 64` means every `u64` tick is representable on some
// level; unlike a narrower wheel (e.g. 6 levels of 64 slots, 36 bits total)
// there is no deadline long enough to need clamping into the top level.
const_assert_eq!(Level::BITS as usize * Wheel::NUM_LEVELS, 64);

/// A hierarchical timer wheel.
///
/// Schedules [`EventNode`]s (always reached through an [`Event
/// Variant`](crate::event)) against a caller-driven logical clock. Not
/// thread-safe: every operation assumes exclusive access by one caller, and
/// `advance` may not be called reentrantly from within a callback it is
/// already driving.
///
/// A `Wheel` must not be moved while any event is scheduled against it: its
/// [`Level`]s are addressed by raw pointer from each active [`EventNode`].
pub struct Wheel {
    now: Tick,
    levels: [Level; Self::NUM_LEVELS],
    ticks_pending: u64,
    advancing: bool,
    /// Set while the level-0 slot for the current `now` has been drained but
    /// not fully dispatched (a prior `advance` returned short mid-slot).
    ///
    /// While this is set, `tick` must finish that slot before rotating
    /// `index_0`/`now` again — otherwise the undispatched remainder, re-armed
    /// into the slot at the *current* index, gets skipped the moment the
    /// clock moves past it.
    mid_tick: bool,
}

impl Wheel {
    /// `WIDTH.pow(NUM_LEVELS) == 2^64`: exactly spans the tick domain.
    pub const NUM_LEVELS: usize = 8;
    /// `now` starts away from zero so that `scheduled_at == 0` unambiguously
    /// means "inactive" on every [`EventNode`], without a separate flag.
    const INITIAL_NOW: u64 = 1 << 32;

    /// Creates an empty wheel with its logical clock at its initial sentinel.
    #[must_use]
    pub fn new() -> Self {
        tracing::debug!(now = Self::INITIAL_NOW, "new wheel");
        Self {
            now: Tick(Self::INITIAL_NOW),
            levels: core::array::from_fn(|i| Level::new(i as u32)),
            ticks_pending: 0,
            advancing: false,
            mid_tick: false,
        }
    }

    /// The wheel's current logical tick.
    ///
    /// While a callback is running, this is the tick the callback's own event
    /// was scheduled for, not the final tick of the in-progress `advance`.
    #[inline]
    #[must_use]
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Schedules `event` to fire `delta` ticks from now.
    ///
    /// If `event` is already scheduled, it is rescheduled (equivalent to
    /// `cancel` followed by `schedule`).
    ///
    /// # Panics
    ///
    /// Panics if `delta == 0`. Use [`Self::try_schedule`] to handle this as a
    /// `Result` instead.
    pub fn schedule(&mut self, event: Pin<&mut EventNode>, delta: u64) {
        self.try_schedule(event, delta)
            .expect("Wheel::schedule: contract violation");
    }

    /// Fallible form of [`Self::schedule`].
    pub fn try_schedule(
        &mut self,
        event: Pin<&mut EventNode>,
        delta: u64,
    ) -> Result<(), ContractViolation> {
        if delta == 0 {
            return Err(ContractViolation::ZeroDelta);
        }
        // Safety: we only use this to splice/place the node, never to move it.
        let event = unsafe { event.get_unchecked_mut() };
        self.cancel_node(event);
        let target = self
            .now
            .checked_add(delta)
            .expect("Wheel::schedule: tick overflow");
        self.place(event, target);
        Ok(())
    }

    /// Schedules `event` to fire at some tick in `[now+start, now+end]`,
    /// chosen to minimize future rescheduling work.
    ///
    /// If `event` is already active with a `scheduled_at` inside the window,
    /// it is left untouched — this is the "free reschedule" optimization.
    ///
    /// # Panics
    ///
    /// Panics if `start >= end`. Use [`Self::try_schedule_in_range`] to
    /// handle this as a `Result` instead.
    pub fn schedule_in_range(&mut self, event: Pin<&mut EventNode>, start: u64, end: u64) {
        self.try_schedule_in_range(event, start, end)
            .expect("Wheel::schedule_in_range: contract violation");
    }

    /// Fallible form of [`Self::schedule_in_range`].
    pub fn try_schedule_in_range(
        &mut self,
        event: Pin<&mut EventNode>,
        start: u64,
        end: u64,
    ) -> Result<(), ContractViolation> {
        if start >= end {
            return Err(ContractViolation::EmptyRange { start, end });
        }
        // Safety: see `try_schedule`.
        let event = unsafe { event.get_unchecked_mut() };

        let lo = self
            .now
            .checked_add(start)
            .expect("Wheel::schedule_in_range: tick overflow");
        let hi = self
            .now
            .checked_add(end)
            .expect("Wheel::schedule_in_range: tick overflow");

        if event.active() && event.scheduled_at() >= lo && event.scheduled_at() <= hi {
            tracing::trace!(scheduled_at = ?event.scheduled_at(), "schedule_in_range: already in window");
            return Ok(());
        }

        self.cancel_node(event);
        let target = self.range_target(lo, hi);
        self.place(event, target);
        Ok(())
    }

    /// Advances the wheel's clock by `delta` ticks, firing every event whose
    /// `scheduled_at` is reached along the way, in tick order.
    ///
    /// Returns `true` if all due work was processed, or `false` if
    /// `max_execute` was reached with work still pending — in which case the
    /// caller should call `advance(0, ...)` again to continue draining it.
    ///
    /// # Panics
    ///
    /// Panics if `delta == 0` and there is no pending work from a prior short
    /// return, or if called reentrantly from within a callback this wheel is
    /// currently dispatching. Use [`Self::try_advance`] to handle these as a
    /// `Result` instead.
    pub fn advance(&mut self, delta: u64, max_execute: Option<usize>) -> bool {
        match self.try_advance(delta, max_execute) {
            Ok(done) => done,
            Err(err) => panic!("Wheel::advance: {err}"),
        }
    }

    /// Fallible form of [`Self::advance`].
    pub fn try_advance(
        &mut self,
        delta: u64,
        max_execute: Option<usize>,
    ) -> Result<bool, ContractViolation> {
        if self.advancing {
            return Err(ContractViolation::ReentrantAdvance);
        }
        if delta == 0 && self.ticks_pending == 0 {
            return Err(ContractViolation::ZeroDelta);
        }

        self.advancing = true;
        let done = self.advance_inner(delta, max_execute);
        self.advancing = false;
        Ok(done)
    }

    /// Returns the number of ticks until the nearest scheduled event, capped
    /// at `max`.
    ///
    /// If level 0 has nothing within `max`, the answer from a higher level is
    /// an upper-bound approximation (it does not simulate intervening
    /// cascades) — this never causes `advance` to miss a due event, it only
    /// affects how eagerly a caller chooses to call `advance` again.
    #[must_use]
    pub fn ticks_to_next_event(&self, max: u64) -> u64 {
        if self.ticks_pending > 0 {
            return 0;
        }

        let l0 = &self.levels[0];
        if let Some(slot) = l0.next_occupied_slot(l0.current_index()) {
            let dist = ring_distance(l0.current_index(), slot);
            return u64::from(dist).min(max);
        }

        for level in 1..Self::NUM_LEVELS {
            let l = &self.levels[level];
            if let Some(slot) = l.next_occupied_slot(l.current_index()) {
                let dist = u64::from(ring_distance(l.current_index(), slot));
                let ticks = dist.saturating_mul(Level::ticks_per_slot(level as u32));
                return ticks.min(max);
            }
        }

        max
    }

    fn cancel_node(&mut self, event: &mut EventNode) {
        if event.owner.is_none() {
            return;
        }
        // Safety: cancelling never moves the node.
        unsafe { Pin::new_unchecked(event) }.cancel();
    }

    /// Picks the coarsest level-aligned tick within `[lo, hi]`. Level 0's
    /// granularity is 1, so this always finds a candidate.
    fn range_target(&self, lo: Tick, hi: Tick) -> Tick {
        for level in (0..Self::NUM_LEVELS as u32).rev() {
            let granularity = Level::ticks_per_slot(level);
            let candidate = (hi.0 / granularity) * granularity;
            if candidate >= lo.0 {
                return Tick(candidate);
            }
        }
        hi
    }

    /// Places `event` (already cancelled if it was active) onto the level
    /// appropriate for `target`.
    fn place(&mut self, event: &mut EventNode, target: Tick) {
        let level = level_for(self.now, target);
        tracing::trace!(target = ?target, level, "place");
        let ptr = NonNull::from(&*event);
        event.scheduled_at = target;
        event.owner = Some(NonNull::from(&self.levels[level]));
        self.levels[level].insert(target, ptr);
    }

    fn advance_inner(&mut self, delta: u64, max_execute: Option<usize>) -> bool {
        let mut remaining = delta + self.ticks_pending;
        self.ticks_pending = 0;
        let mut budget = max_execute;

        while remaining > 0 {
            if matches!(budget, Some(0)) {
                self.ticks_pending = remaining;
                tracing::debug!(remaining, "advance: no budget left, deferring");
                return false;
            }

            if self.tick(&mut budget) {
                self.ticks_pending = remaining;
                tracing::debug!(remaining, "advance: budget exhausted mid-tick");
                return false;
            }

            remaining -= 1;
        }

        true
    }

    /// Advances the clock by exactly one tick, unless resuming a slot a prior
    /// call couldn't finish draining, in which case the clock does not move
    /// until that slot is empty. Returns `true` if the due slot could not be
    /// fully drained because `budget` ran out.
    fn tick(&mut self, budget: &mut Option<usize>) -> bool {
        if !self.mid_tick {
            if self.levels[0].advance_index() {
                self.cascade(1);
            }
            self.now = Tick(self.now.0 + 1);
        }

        let slot = self.levels[0].current_index();
        if !self.levels[0].is_occupied(slot) {
            self.mid_tick = false;
            return false;
        }

        let due = self.levels[0].take(slot);
        let exhausted = self.dispatch(due, budget);
        self.mid_tick = exhausted;
        exhausted
    }

    /// Cascades level `level` (recursing upward first if its own rotation
    /// just wrapped), re-placing every event that falls out of its current
    /// slot relative to `now`.
    fn cascade(&mut self, level: usize) {
        if level >= Self::NUM_LEVELS {
            return;
        }
        if self.levels[level].advance_index() {
            self.cascade(level + 1);
        }

        let slot = self.levels[level].current_index();
        if !self.levels[level].is_occupied(slot) {
            return;
        }

        let drained = self.levels[level].take(slot);
        for ptr in drained {
            // Safety: `ptr` came from this level's own slot list, which only
            // ever holds live, correctly-linked nodes.
            let event = unsafe { &mut *ptr.as_ptr() };
            let target = event.scheduled_at;
            debug_assert!(target.0 >= self.now.0, "cascaded event is already overdue");
            self.place(event, target);
        }
    }

    /// Dispatches a level-0 slot's due events, up to `budget`. Returns `true`
    /// if the slot could not be fully drained (budget ran out), in which
    /// case the undispatched remainder is re-armed on level 0 for `now`.
    fn dispatch(&mut self, mut due: List<EventNode>, budget: &mut Option<usize>) -> bool {
        // Mark every drained node inactive up front: a callback that cancels
        // a sibling event still waiting in `due` must observe it as already
        // gone, not attempt to unlink it from a slot it no longer belongs to.
        let mut handles = Vec::with_capacity(due.len());
        while let Some(ptr) = due.pop_front() {
            // Safety: `ptr` just came from this slot's own list.
            let event = unsafe { &mut *ptr.as_ptr() };
            event.owner = None;
            event.scheduled_at = Tick::INACTIVE;
            handles.push(ptr);
        }

        let mut idx = 0;
        while idx < handles.len() {
            if matches!(*budget, Some(0)) {
                for &ptr in &handles[idx..] {
                    // Safety: `ptr` is still a valid, detached node.
                    let event = unsafe { &mut *ptr.as_ptr() };
                    event.owner = Some(NonNull::from(&self.levels[0]));
                    event.scheduled_at = self.now;
                    self.levels[0].insert(self.now, ptr);
                }
                return true;
            }

            let ptr = handles[idx];
            idx += 1;
            tracing::trace!(now = ?self.now, "dispatch");
            // Safety: `ptr` is valid; `execute` was bound to this exact node
            // type when its owning Event Variant was constructed.
            let execute = unsafe { ptr.as_ref().execute };
            unsafe { execute(ptr) };

            if let Some(n) = budget {
                *n -= 1;
            }
        }

        false
    }
}

impl Default for Wheel {
    fn default() -> Self {
        Self::new()
    }
}

/// Chooses which level a tick targeting `target` (relative to `now`) belongs
/// on: the highest differing byte between `now` and `target` selects the
/// level, since each level's granularity is one more byte than the last.
fn level_for(now: Tick, target: Tick) -> usize {
    const WIDTH_MASK: u64 = (Level::WIDTH as u64) - 1;

    let masked = (now.0 ^ target.0) | WIDTH_MASK;
    let zeros = masked.leading_zeros();
    let rest = u64::BITS - 1 - zeros;
    (rest / Level::BITS) as usize
}

/// Forward distance from `current` to `target` around a 256-slot ring.
fn ring_distance(current: u8, target: u8) -> u8 {
    target.wrapping_sub(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CallbackEvent;
    use core::cell::Cell;
    use core::pin::pin;

    #[test]
    fn basic_fire() {
        let mut wheel = Wheel::new();
        let fired = Cell::new(0);
        let mut event = pin!(CallbackEvent::new(|| fired.set(fired.get() + 1)));

        wheel.schedule(event.as_mut().node(), 5);
        assert!(wheel.advance(4, None));
        assert_eq!(fired.get(), 0);
        assert!(wheel.advance(1, None));
        assert_eq!(fired.get(), 1);
        assert!(!event.active());
    }

    #[test]
    fn cancel_before_fire() {
        let mut wheel = Wheel::new();
        let fired = Cell::new(0);
        let mut event = pin!(CallbackEvent::new(|| fired.set(fired.get() + 1)));

        wheel.schedule(event.as_mut().node(), 5);
        event.as_mut().cancel();
        assert!(wheel.advance(10, None));
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn level_for_small_delta_is_level_zero() {
        let now = Tick(Wheel::INITIAL_NOW);
        let target = now.checked_add(5).unwrap();
        assert_eq!(level_for(now, target), 0);
    }

    #[test]
    fn schedule_zero_delta_is_contract_violation() {
        let mut wheel = Wheel::new();
        let mut event = pin!(CallbackEvent::new(|| {}));
        assert_eq!(
            wheel.try_schedule(event.as_mut().node(), 0),
            Err(ContractViolation::ZeroDelta)
        );
    }

    #[test]
    fn resumed_advance_does_not_skip_the_slot_it_paused_on() {
        let mut wheel = Wheel::new();
        let fired = Cell::new(0u32);
        let mut events: Vec<_> = (0..10)
            .map(|_| Box::pin(CallbackEvent::new(|| fired.set(fired.get() + 1))))
            .collect();
        for event in &mut events {
            wheel.schedule(event.as_mut().node(), 1);
        }

        assert!(!wheel.advance(1, Some(3)));
        assert_eq!(fired.get(), 3, "first chunk should fire exactly 3");

        assert!(!wheel.advance(0, Some(3)));
        assert_eq!(
            fired.get(),
            6,
            "resuming must keep draining the same due slot, not skip past it"
        );

        assert!(wheel.advance(0, Some(4)));
        assert_eq!(fired.get(), 10, "final chunk should finish the slot");
    }
}

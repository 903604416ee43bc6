// Copyright 2018-2025 the Spindle authors. MIT license.

//! Timer heap and the timer handle.
//!
//! Pending timers are ordered by `(deadline, seq)` in a `BTreeSet`, where
//! `seq` is a monotonically increasing insertion counter. Equal deadlines
//! therefore fire in scheduling order, which makes iteration order
//! deterministic and testable. Insert and pop are O(log n); the minimum
//! deadline is cached so the poll-timeout computation reads it in O(1).
//!
//! The heap does not reschedule repeating timers itself; the loop's timer
//! phase re-inserts them (with a fresh sequence number) *before* running the
//! callback, bounded by a sequence watermark captured at the start of the
//! pass so a zero-interval repeat cannot starve the rest of the iteration.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::AnyError;
use crate::error::Error;
use crate::handle::Handle;
use crate::handle::HandleCore;
use crate::handle::HandleKind;
use crate::handle::HandleOps;
use crate::reactor::EventLoop;
use crate::reactor::LoopInner;

/// Position of a scheduled timer: absolute deadline in loop time plus the
/// insertion sequence number used as a FIFO tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
  pub deadline: u64,
  pub seq: u64,
}

pub(crate) struct TimerHeap<T> {
  keys: BTreeSet<TimerKey>,
  entries: HashMap<u64, T>,
  next_seq: u64,
  min_deadline: Option<u64>,
}

impl<T> Default for TimerHeap<T> {
  fn default() -> Self {
    Self {
      keys: BTreeSet::new(),
      entries: HashMap::new(),
      next_seq: 0,
      min_deadline: None,
    }
  }
}

impl<T> TimerHeap<T> {
  /// Insert by deadline; ties broken by insertion order.
  pub fn schedule(&mut self, deadline: u64, data: T) -> TimerKey {
    let key = TimerKey {
      deadline,
      seq: self.next_seq,
    };
    self.next_seq += 1;
    self.keys.insert(key);
    self.entries.insert(key.seq, data);
    match self.min_deadline {
      Some(min) if min <= deadline => {}
      _ => self.min_deadline = Some(deadline),
    }
    key
  }

  /// Remove a scheduled timer, returning its payload.
  pub fn cancel(&mut self, key: TimerKey) -> Option<T> {
    if !self.keys.remove(&key) {
      return None;
    }
    let data = self.entries.remove(&key.seq);
    debug_assert!(data.is_some());
    if self.min_deadline == Some(key.deadline) {
      self.refresh_min();
    }
    data
  }

  /// Sequence numbers below this value existed when the watermark was
  /// taken; `pop_due` never yields entries scheduled at or after it.
  pub fn watermark(&self) -> u64 {
    self.next_seq
  }

  /// Remove and return the next timer with `deadline <= now`, in
  /// `(deadline, seq)` order. Calling this repeatedly with the same `now`
  /// and `watermark` yields the finite due sequence for one timer pass.
  pub fn pop_due(&mut self, now: u64, watermark: u64) -> Option<(TimerKey, T)> {
    let key = *self.keys.first()?;
    if key.deadline > now || key.seq >= watermark {
      return None;
    }
    self.keys.remove(&key);
    let data = self.entries.remove(&key.seq)?;
    if self.min_deadline == Some(key.deadline) {
      self.refresh_min();
    }
    Some((key, data))
  }

  /// Earliest pending deadline, O(1).
  pub fn peek_min_deadline(&self) -> Option<u64> {
    self.min_deadline
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn refresh_min(&mut self) {
    self.min_deadline = self.keys.first().map(|k| k.deadline);
  }

  #[cfg(test)]
  fn assert_consistent(&self) {
    assert_eq!(self.keys.len(), self.entries.len());
    assert_eq!(self.min_deadline, self.keys.first().map(|k| k.deadline));
  }
}

/// Callback fired when a timer's deadline elapses.
pub type TimerCallback = Box<dyn FnMut(&Timer) -> Result<(), AnyError>>;

pub(crate) struct TimerInner {
  pub(crate) core: HandleCore,
  pub(crate) cb: RefCell<Option<TimerCallback>>,
  pub(crate) repeat: Cell<u64>,
  pub(crate) key: Cell<Option<TimerKey>>,
}

/// A timer handle. One-shot when `repeat == 0`, otherwise rescheduled to
/// `now + repeat` before each callback runs.
#[derive(Clone)]
pub struct Timer {
  pub(crate) inner: Rc<TimerInner>,
}

impl Timer {
  pub fn new(lp: &EventLoop) -> Result<Timer, Error> {
    let inner = lp.inner().register(|id, owner| {
      Rc::new(TimerInner {
        core: HandleCore::new(HandleKind::Timer, id, owner),
        cb: RefCell::new(None),
        repeat: Cell::new(0),
        key: Cell::new(None),
      })
    })?;
    Ok(Timer { inner })
  }

  /// Arm the timer: fire `cb` after `timeout_ms` milliseconds of loop time,
  /// then every `repeat_ms` milliseconds if nonzero. Starting an active
  /// timer re-arms it from now.
  pub fn start(
    &self,
    cb: impl FnMut(&Timer) -> Result<(), AnyError> + 'static,
    timeout_ms: u64,
    repeat_ms: u64,
  ) -> Result<(), Error> {
    let core = &self.inner.core;
    core.check_open()?;
    let lp = core.loop_inner()?;
    if core.is_active() {
      if let Some(key) = self.inner.key.take() {
        lp.timers.borrow_mut().cancel(key);
      }
    } else {
      core.set_active(true);
      core.op_begin();
    }
    self.inner.repeat.set(repeat_ms);
    *self.inner.cb.borrow_mut() = Some(Box::new(cb));
    let deadline = lp.now().saturating_add(timeout_ms);
    let key = lp.timers.borrow_mut().schedule(deadline, self.inner.clone());
    self.inner.key.set(Some(key));
    Ok(())
  }

  /// Disarm the timer. Stopping an inactive timer is a no-op.
  pub fn stop(&self) -> Result<(), Error> {
    let core = &self.inner.core;
    core.check_open()?;
    let lp = core.loop_inner()?;
    self.inner.disarm(&lp);
    Ok(())
  }

  /// Re-arm from the repeat interval, as if the timer had just fired.
  /// Fails with [`Error::NoRepeat`] for one-shot timers and with
  /// [`Error::NotActive`] if the timer was never started.
  pub fn again(&self) -> Result<(), Error> {
    let core = &self.inner.core;
    core.check_open()?;
    let repeat = self.inner.repeat.get();
    if repeat == 0 {
      return Err(Error::NoRepeat);
    }
    if self.inner.cb.borrow().is_none() {
      return Err(Error::NotActive);
    }
    let lp = core.loop_inner()?;
    if core.is_active() {
      if let Some(key) = self.inner.key.take() {
        lp.timers.borrow_mut().cancel(key);
      }
    } else {
      core.set_active(true);
      core.op_begin();
    }
    let deadline = lp.now().saturating_add(repeat);
    let key = lp.timers.borrow_mut().schedule(deadline, self.inner.clone());
    self.inner.key.set(Some(key));
    Ok(())
  }

  /// The repeat interval in milliseconds; 0 means one-shot.
  pub fn repeat(&self) -> u64 {
    self.inner.repeat.get()
  }

  /// Change the repeat interval. Takes effect at the next (re)schedule, not
  /// retroactively for the currently armed deadline.
  pub fn set_repeat(&self, repeat_ms: u64) -> Result<(), Error> {
    self.inner.core.check_open()?;
    self.inner.repeat.set(repeat_ms);
    Ok(())
  }
}

impl Handle for Timer {
  fn core(&self) -> &HandleCore {
    &self.inner.core
  }
}

impl TimerInner {
  fn disarm(&self, lp: &Rc<LoopInner>) {
    if !self.core.is_active() {
      return;
    }
    if let Some(key) = self.key.take() {
      lp.timers.borrow_mut().cancel(key);
    }
    self.core.set_active(false);
    self.core.op_end();
  }
}

impl HandleOps for TimerInner {
  fn core(&self) -> &HandleCore {
    &self.core
  }

  fn teardown(&self, lp: &Rc<LoopInner>) {
    self.disarm(lp);
    // Drop the callback now: it may capture the handle itself, and the
    // closing pass only releases the table's reference.
    self.cb.borrow_mut().take();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn drain(heap: &mut TimerHeap<u32>, now: u64) -> Vec<u32> {
    let watermark = heap.watermark();
    let mut out = vec![];
    while let Some((_, data)) = heap.pop_due(now, watermark) {
      out.push(data);
    }
    out
  }

  #[test]
  fn fires_in_deadline_order() {
    let mut heap = TimerHeap::default();
    heap.schedule(30, 3u32);
    heap.schedule(10, 1);
    heap.schedule(20, 2);
    heap.assert_consistent();
    assert_eq!(drain(&mut heap, 100), vec![1, 2, 3]);
    assert!(heap.is_empty());
  }

  #[test]
  fn equal_deadlines_fire_in_scheduling_order() {
    let mut heap = TimerHeap::default();
    for i in 0..10u32 {
      heap.schedule(5, i);
    }
    assert_eq!(drain(&mut heap, 5), (0..10).collect::<Vec<_>>());
  }

  #[test]
  fn due_is_bounded_by_now() {
    let mut heap = TimerHeap::default();
    heap.schedule(10, 1u32);
    heap.schedule(20, 2);
    assert_eq!(drain(&mut heap, 15), vec![1]);
    assert_eq!(heap.peek_min_deadline(), Some(20));
  }

  #[test]
  fn watermark_excludes_entries_scheduled_during_the_pass() {
    let mut heap = TimerHeap::default();
    heap.schedule(0, 1u32);
    let watermark = heap.watermark();
    let (_, first) = heap.pop_due(0, watermark).unwrap();
    assert_eq!(first, 1);
    // A zero-delay re-insert, as the loop does for repeating timers.
    heap.schedule(0, 1);
    assert!(heap.pop_due(0, watermark).is_none());
    assert_eq!(heap.len(), 1);
  }

  #[test]
  fn cancel_removes_and_returns_payload() {
    let mut heap = TimerHeap::default();
    let a = heap.schedule(10, 1u32);
    heap.schedule(10, 2);
    assert_eq!(heap.cancel(a), Some(1));
    assert_eq!(heap.cancel(a), None);
    heap.assert_consistent();
    assert_eq!(drain(&mut heap, 10), vec![2]);
  }

  #[test]
  fn min_deadline_tracks_mutations() {
    let mut heap = TimerHeap::default();
    assert_eq!(heap.peek_min_deadline(), None);
    let a = heap.schedule(50, 1u32);
    heap.schedule(70, 2);
    assert_eq!(heap.peek_min_deadline(), Some(50));
    heap.cancel(a);
    assert_eq!(heap.peek_min_deadline(), Some(70));
  }

  #[rstest]
  #[case(42)]
  #[case(99)]
  #[case(1000)]
  fn chaos(#[case] seed: u64) {
    fastrand::seed(seed);
    let mut heap = TimerHeap::default();
    let mut kept: Vec<(TimerKey, u32)> = vec![];
    for i in 0..10_000u32 {
      let key = heap.schedule(fastrand::u64(0..100), i);
      if fastrand::u8(0..10) == 0 {
        assert!(heap.cancel(key).is_some());
      } else {
        kept.push((key, i));
      }
      heap.assert_consistent();
    }
    assert_eq!(heap.len(), kept.len());
    let fired = drain(&mut heap, 100);
    // Non-decreasing deadlines, FIFO within equal deadlines: firing order
    // is exactly key order (deadline, then insertion sequence).
    kept.sort_by_key(|(key, _)| *key);
    let expected: Vec<u32> = kept.iter().map(|&(_, i)| i).collect();
    assert_eq!(fired, expected);
    assert!(heap.is_empty());
    heap.assert_consistent();
  }
}

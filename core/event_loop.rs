// Copyright 2018-2025 the Spindle authors. MIT license.

//! Phase model for one loop iteration.
//!
//! Each iteration of the event loop runs these phases **in order**:
//!
//! ```text
//! ┌───────────────────────────────┐
//! │         timers                │  ← expired timer callbacks, deadline order
//! ├───────────────────────────────┤
//! │     pending callbacks         │  ← work deferred from a previous phase
//! ├───────────────────────────────┤
//! │       idle / prepare          │  ← per-iteration hooks, before polling
//! ├───────────────────────────────┤
//! │          poll                 │  ← block for readiness, dispatch I/O,
//! │                               │    worker completions, async wakeups,
//! │                               │    pending signals
//! ├───────────────────────────────┤
//! │         check                 │  ← per-iteration hooks, after polling
//! ├───────────────────────────────┤
//! │      close callbacks          │  ← finalize handles marked closing
//! └───────────────────────────────┘
//! ```
//!
//! The closing pass runs exactly once per iteration, after every other
//! phase, so a handle closed from any callback is never finalized while the
//! same iteration is still dispatching.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::handle::HandleId;
use crate::reactor::LoopInner;

/// Run mode for [`crate::EventLoop::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
  /// Iterate until no active referenced handles (or queued work) remain, or
  /// until [`crate::EventLoop::stop`] is requested.
  Default,
  /// Run a single iteration, blocking for I/O readiness if nothing is
  /// immediately ready.
  Once,
  /// Run a single iteration with a zero poll timeout.
  NoWait,
}

/// Phase identifiers, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
  Timers,
  PendingCallbacks,
  Idle,
  Prepare,
  Poll,
  Check,
  CloseCallbacks,
}

impl LoopPhase {
  /// All phases in execution order.
  pub const fn all() -> &'static [LoopPhase] {
    &[
      LoopPhase::Timers,
      LoopPhase::PendingCallbacks,
      LoopPhase::Idle,
      LoopPhase::Prepare,
      LoopPhase::Poll,
      LoopPhase::Check,
      LoopPhase::CloseCallbacks,
    ]
  }
}

/// A unit of work deferred to the pending phase: write completions scheduled
/// while their submitting call was still on the stack, re-armed reads on an
/// edge-triggered poller, canceled-operation callbacks for closing handles.
pub(crate) type PendingTask = Box<dyn FnOnce(&Rc<LoopInner>)>;

/// Per-iteration bookkeeping shared by the phase runners.
#[derive(Default)]
pub(crate) struct PhaseQueues {
  /// Deferred one-shot work, drained at the pending phase.
  pub pending: RefCell<VecDeque<PendingTask>>,
  /// Handles that requested closure and await the closing pass.
  pub closing: RefCell<VecDeque<HandleId>>,
  /// Idle hook handles (an active one forces a zero poll timeout).
  pub idle: RefCell<Vec<HandleId>>,
  /// Prepare hook handles.
  pub prepare: RefCell<Vec<HandleId>>,
  /// Check hook handles.
  pub check: RefCell<Vec<HandleId>>,
  /// Async handles, scanned for cross-thread wakeups after the poll step.
  pub asyncs: RefCell<Vec<HandleId>>,
}

impl PhaseQueues {
  /// Snapshot of a hook list. Dispatch iterates the snapshot so callbacks
  /// may start or stop hooks without invalidating the pass.
  pub fn snapshot(list: &RefCell<Vec<HandleId>>) -> SmallVec<[HandleId; 8]> {
    list.borrow().iter().copied().collect()
  }

  /// Remove a handle from one of the hook lists.
  pub fn remove_from(list: &RefCell<Vec<HandleId>>, id: HandleId) {
    list.borrow_mut().retain(|&h| h != id);
  }

  /// True if any queue holds work that must run without blocking in poll.
  pub fn has_immediate_work(&self) -> bool {
    !self.pending.borrow().is_empty() || !self.closing.borrow().is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn phases_are_in_iteration_order() {
    let all = LoopPhase::all();
    assert_eq!(all.first(), Some(&LoopPhase::Timers));
    assert_eq!(all.last(), Some(&LoopPhase::CloseCallbacks));
    let poll_pos = all.iter().position(|p| *p == LoopPhase::Poll).unwrap();
    let check_pos = all.iter().position(|p| *p == LoopPhase::Check).unwrap();
    assert!(poll_pos < check_pos);
  }

  #[test]
  fn snapshot_is_detached_from_the_list() {
    let queues = PhaseQueues::default();
    queues.idle.borrow_mut().extend([1, 2, 3]);
    let snap = PhaseQueues::snapshot(&queues.idle);
    PhaseQueues::remove_from(&queues.idle, 2);
    assert_eq!(snap.as_slice(), &[1, 2, 3]);
    assert_eq!(queues.idle.borrow().as_slice(), &[1, 3]);
  }
}

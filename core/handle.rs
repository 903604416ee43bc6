// Copyright 2018-2025 the Spindle authors. MIT license.

//! Handle lifecycle.
//!
//! Every reactor-managed object (timer, hook, socket, ...) embeds a
//! [`HandleCore`] that owns the shared state machine:
//!
//! ```text
//! initialized ──start──▶ active ◀──start/stop──▶ inactive
//!      │                   │                        │
//!      └───────────────────┴────────close()─────────┘
//!                          │
//!                       closing ──(closing pass)──▶ closed
//! ```
//!
//! `closing` and `closed` are terminal and monotonic. `close()` marks the
//! handle synchronously but defers the close callback and resource release
//! to the closing pass of a loop iteration, never inline.
//!
//! Lifetime across async completions is tracked with a pending-operation
//! count rather than host-language reference counting: every outstanding
//! operation (timer start, queued write, in-flight connect) holds one unit,
//! and the closing pass refuses to finalize a handle until the count reaches
//! zero -- i.e. until every completion or cancellation callback has fired.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::rc::Weak;

use crate::error::AnyError;
use crate::error::Error;
use crate::poller::Readiness;
use crate::reactor::LoopInner;

/// Integer id naming a handle within its loop, comparable to a file
/// descriptor. Ids are allocated monotonically and never reused.
pub type HandleId = u32;

// Handle flag word. A u32 rather than separate bools so state transitions
// are single-cell updates visible to every clone of the handle.
pub(crate) const HANDLE_ACTIVE: u32 = 1 << 0;
pub(crate) const HANDLE_REF: u32 = 1 << 1;
pub(crate) const HANDLE_CLOSING: u32 = 1 << 2;
pub(crate) const HANDLE_CLOSED: u32 = 1 << 3;

/// The closed set of handle kinds this reactor manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandleKind {
  Timer,
  Idle,
  Prepare,
  Check,
  Async,
  TcpStream,
  TcpListener,
  Udp,
  #[cfg(unix)]
  Pipe,
  #[cfg(unix)]
  PipeListener,
  #[cfg(unix)]
  PollWatcher,
  #[cfg(unix)]
  Signal,
}

impl HandleKind {
  pub fn name(self) -> &'static str {
    match self {
      HandleKind::Timer => "timer",
      HandleKind::Idle => "idle",
      HandleKind::Prepare => "prepare",
      HandleKind::Check => "check",
      HandleKind::Async => "async",
      HandleKind::TcpStream => "tcp",
      HandleKind::TcpListener => "tcp-listener",
      HandleKind::Udp => "udp",
      #[cfg(unix)]
      HandleKind::Pipe => "pipe",
      #[cfg(unix)]
      HandleKind::PipeListener => "pipe-listener",
      #[cfg(unix)]
      HandleKind::PollWatcher => "poll",
      #[cfg(unix)]
      HandleKind::Signal => "signal",
    }
  }
}

/// Callback invoked from the closing pass after a handle is finalized.
pub type CloseCallback = Box<dyn FnOnce() -> Result<(), AnyError>>;

/// State shared by every handle kind.
pub struct HandleCore {
  id: HandleId,
  kind: HandleKind,
  pub(crate) owner: Weak<LoopInner>,
  flags: Cell<u32>,
  pending_ops: Cell<u32>,
  close_cb: RefCell<Option<CloseCallback>>,
}

impl HandleCore {
  pub(crate) fn new(
    kind: HandleKind,
    id: HandleId,
    owner: Weak<LoopInner>,
  ) -> Self {
    Self {
      id,
      kind,
      owner,
      flags: Cell::new(HANDLE_REF),
      pending_ops: Cell::new(0),
      close_cb: RefCell::new(None),
    }
  }

  pub(crate) fn id(&self) -> HandleId {
    self.id
  }

  pub(crate) fn kind(&self) -> HandleKind {
    self.kind
  }

  pub(crate) fn loop_inner(&self) -> Result<Rc<LoopInner>, Error> {
    self.owner.upgrade().ok_or(Error::LoopGone)
  }

  pub(crate) fn is_active(&self) -> bool {
    self.flags.get() & HANDLE_ACTIVE != 0
  }

  pub(crate) fn is_closing(&self) -> bool {
    self.flags.get() & (HANDLE_CLOSING | HANDLE_CLOSED) != 0
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.flags.get() & HANDLE_CLOSED != 0
  }

  pub(crate) fn has_ref(&self) -> bool {
    self.flags.get() & HANDLE_REF != 0
  }

  pub(crate) fn set_active(&self, active: bool) {
    let flags = self.flags.get();
    if active {
      self.flags.set(flags | HANDLE_ACTIVE);
    } else {
      self.flags.set(flags & !HANDLE_ACTIVE);
    }
  }

  pub(crate) fn set_ref(&self, referenced: bool) {
    let flags = self.flags.get();
    if referenced {
      self.flags.set(flags | HANDLE_REF);
    } else {
      self.flags.set(flags & !HANDLE_REF);
    }
  }

  /// Counts toward loop liveness: active and referenced.
  pub(crate) fn keeps_loop_alive(&self) -> bool {
    let flags = self.flags.get();
    flags & HANDLE_ACTIVE != 0 && flags & HANDLE_REF != 0
  }

  /// An asynchronous operation began; the handle may not be finalized until
  /// the matching [`Self::op_end`] has run.
  pub(crate) fn op_begin(&self) {
    self.pending_ops.set(self.pending_ops.get() + 1);
  }

  pub(crate) fn op_end(&self) {
    let n = self.pending_ops.get();
    debug_assert!(n > 0, "op_end without matching op_begin");
    self.pending_ops.set(n.saturating_sub(1));
  }

  pub(crate) fn pending_ops(&self) -> u32 {
    self.pending_ops.get()
  }

  /// Rejects operations on a closing or closed handle.
  pub(crate) fn check_open(&self) -> Result<(), Error> {
    if self.is_closing() {
      Err(Error::HandleClosed)
    } else {
      Ok(())
    }
  }

  /// The close protocol entry point. Marks the handle closing, tears down
  /// event delivery, and enqueues it for the closing pass. The close
  /// callback is *not* invoked here.
  pub(crate) fn request_close(
    &self,
    on_close: Option<CloseCallback>,
  ) -> Result<(), Error> {
    if self.is_closing() {
      // A second close is a contract violation, not an idempotent no-op.
      return Err(Error::HandleClosed);
    }
    let lp = self.loop_inner()?;
    // CLOSING first so re-entrant operations from teardown callbacks fail;
    // ACTIVE is cleared by enqueue_close after teardown has observed it.
    self.flags.set(self.flags.get() | HANDLE_CLOSING);
    *self.close_cb.borrow_mut() = on_close;
    log::debug!("closing {} handle #{}", self.kind.name(), self.id);
    lp.enqueue_close(self.id);
    Ok(())
  }

  pub(crate) fn mark_closed(&self) {
    self.flags.set(self.flags.get() | HANDLE_CLOSED);
  }

  pub(crate) fn take_close_cb(&self) -> Option<CloseCallback> {
    self.close_cb.borrow_mut().take()
  }
}

/// Capability interface common to every handle kind, dispatched dynamically
/// from the loop's phase runners.
pub(crate) trait HandleOps: 'static {
  fn core(&self) -> &HandleCore;

  /// Synchronously stop event delivery and cancel outstanding operations.
  /// Runs inside `close()`. Cancellations that owe the application a
  /// callback are deferred to the pending phase and hold the handle's
  /// pending-operation count until they have run.
  fn teardown(&self, lp: &Rc<LoopInner>);

  /// Readiness dispatch for poller-registered handles.
  fn on_io(&self, lp: &Rc<LoopInner>, ready: Readiness) {
    let _ = (lp, ready);
  }

  /// Per-iteration dispatch for idle/prepare/check hooks.
  fn on_phase(&self, lp: &Rc<LoopInner>) {
    let _ = lp;
  }

  /// Cross-thread wakeup dispatch for async handles, run after poll.
  fn on_wakeup(&self, lp: &Rc<LoopInner>) {
    let _ = lp;
  }

  /// True if a cross-thread wakeup is queued (async handles only).
  fn wakeup_pending(&self) -> bool {
    false
  }

  /// Dispatch for signal watchers, run after poll with the signal number.
  #[cfg(unix)]
  fn on_signal(&self, lp: &Rc<LoopInner>, signum: i32) {
    let _ = (lp, signum);
  }
}

/// Operations common to every handle.
pub trait Handle {
  #[doc(hidden)]
  fn core(&self) -> &HandleCore;

  /// Request closure. The handle is marked closing immediately; the
  /// optional callback fires from the closing pass of a later iteration
  /// step, after all outstanding operation callbacks. Closing a handle
  /// twice is an error.
  fn close(&self, on_close: Option<CloseCallback>) -> Result<(), Error> {
    self.core().request_close(on_close)
  }

  /// Mark this handle as keeping `run(Default)` alive (the default).
  fn ref_(&self) -> Result<(), Error> {
    self.core().check_open()?;
    self.core().set_ref(true);
    Ok(())
  }

  /// Mark this handle as *not* keeping `run(Default)` alive. A pure flag
  /// toggle; event delivery is unaffected.
  fn unref(&self) -> Result<(), Error> {
    self.core().check_open()?;
    self.core().set_ref(false);
    Ok(())
  }

  fn has_ref(&self) -> bool {
    self.core().has_ref()
  }

  /// True while the handle is registered for event delivery.
  fn is_active(&self) -> bool {
    self.core().is_active()
  }

  /// True from the `close()` call onward.
  fn is_closing(&self) -> bool {
    self.core().is_closing()
  }

  /// True once the closing pass has finalized the handle.
  fn is_closed(&self) -> bool {
    self.core().is_closed()
  }

  /// The handle's id within its loop.
  fn id(&self) -> HandleId {
    self.core().id()
  }
}

/// Map of live handles, keyed by id. The table's `Rc` is the loop's internal
/// reference to the handle; it is dropped by the closing pass, after which
/// only application clones keep the backing memory alive.
#[derive(Default)]
pub(crate) struct HandleTable {
  index: BTreeMap<HandleId, Rc<dyn HandleOps>>,
  next_id: HandleId,
}

impl HandleTable {
  pub fn next_id(&mut self) -> HandleId {
    let id = self.next_id;
    self.next_id += 1;
    id
  }

  pub fn insert(&mut self, id: HandleId, handle: Rc<dyn HandleOps>) {
    let prev = self.index.insert(id, handle);
    debug_assert!(prev.is_none(), "handle id reused");
  }

  pub fn get(&self, id: HandleId) -> Option<Rc<dyn HandleOps>> {
    self.index.get(&id).cloned()
  }

  pub fn remove(&mut self, id: HandleId) -> Option<Rc<dyn HandleOps>> {
    self.index.remove(&id)
  }

  pub fn len(&self) -> usize {
    self.index.len()
  }

  pub fn is_empty(&self) -> bool {
    self.index.is_empty()
  }

  /// True if any handle alone justifies another `run(Default)` iteration.
  pub fn any_keeps_loop_alive(&self) -> bool {
    self.index.values().any(|h| h.core().keeps_loop_alive())
  }

  /// `(id, kind name)` for every live handle, for diagnostics.
  pub fn names(&self) -> impl Iterator<Item = (HandleId, &'static str)> + '_ {
    self.index.iter().map(|(&id, h)| (id, h.core().kind().name()))
  }
}

/// Invoke a `FnMut` callback stored in a `RefCell<Option<_>>` slot.
///
/// The callback is taken out of the slot for the duration of the call so it
/// may re-enter the handle's API (including replacing itself); it is put
/// back only if the slot is still empty and the handle did not close, which
/// keeps `teardown` authoritative about dropping callbacks that capture the
/// handle.
macro_rules! invoke_callback {
  ($lp:expr, $core:expr, $slot:expr $(, $arg:expr)*) => {{
    let taken = $slot.borrow_mut().take();
    if let Some(mut cb) = taken {
      let result = cb($($arg),*);
      {
        let mut slot = $slot.borrow_mut();
        if slot.is_none() && !$core.is_closing() {
          *slot = Some(cb);
        }
      }
      if let Err(err) = result {
        $lp.report(err);
      }
    }
  }};
}
pub(crate) use invoke_callback;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_default_to_referenced_and_inactive() {
    let core = HandleCore::new(HandleKind::Timer, 7, Weak::new());
    assert!(core.has_ref());
    assert!(!core.is_active());
    assert!(!core.is_closing());
    assert_eq!(core.id(), 7);
  }

  #[test]
  fn liveness_requires_active_and_referenced() {
    let core = HandleCore::new(HandleKind::Timer, 0, Weak::new());
    assert!(!core.keeps_loop_alive());
    core.set_active(true);
    assert!(core.keeps_loop_alive());
    core.set_ref(false);
    assert!(!core.keeps_loop_alive());
  }

  #[test]
  fn close_without_a_loop_reports_loop_gone() {
    let core = HandleCore::new(HandleKind::Timer, 0, Weak::new());
    match core.request_close(None) {
      Err(Error::LoopGone) => {}
      other => panic!("expected LoopGone, got {other:?}"),
    }
  }

  #[test]
  fn table_ids_are_monotonic() {
    let mut table = HandleTable::default();
    let a = table.next_id();
    let b = table.next_id();
    assert!(b > a);
  }
}

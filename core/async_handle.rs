// Copyright 2018-2025 the Spindle authors. MIT license.

//! Cross-thread wakeup handle.
//!
//! [`Async`] is the one handle whose trigger may be pulled from any thread:
//! [`AsyncSender::send`] sets an atomic pending flag and kicks the poller's
//! waker, and the loop invokes the callback on its own thread after the
//! poll step. Sends coalesce -- any number of `send()` calls before the
//! dispatch produce one callback invocation.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::AnyError;
use crate::error::Error;
use crate::event_loop::PhaseQueues;
use crate::handle::invoke_callback;
use crate::handle::Handle;
use crate::handle::HandleCore;
use crate::handle::HandleKind;
use crate::handle::HandleOps;
use crate::reactor::EventLoop;
use crate::reactor::LoopInner;

struct AsyncShared {
  pending: AtomicBool,
  waker: Arc<mio::Waker>,
}

/// Thread-safe trigger for an [`Async`] handle. Cheap to clone; outlives the
/// handle harmlessly (sends after close are ignored).
#[derive(Clone)]
pub struct AsyncSender {
  shared: Arc<AsyncShared>,
}

impl AsyncSender {
  /// Queue a wakeup. Safe to call from any thread, including concurrently.
  pub fn send(&self) {
    if !self.shared.pending.swap(true, Ordering::AcqRel) {
      // Waking an already-awake loop is harmless; failure here means the
      // poller is gone, which only happens when the loop is too.
      let _ = self.shared.waker.wake();
    }
  }
}

pub(crate) struct AsyncInner {
  core: HandleCore,
  me: Weak<AsyncInner>,
  shared: Arc<AsyncShared>,
  cb: RefCell<Option<Box<dyn FnMut(&Async) -> Result<(), AnyError>>>>,
}

/// Handle that marshals wakeups from other threads onto the loop thread.
/// Active (and keeping the loop alive) from creation until closed.
#[derive(Clone)]
pub struct Async {
  inner: Rc<AsyncInner>,
}

impl Async {
  pub fn new(
    lp: &EventLoop,
    cb: impl FnMut(&Async) -> Result<(), AnyError> + 'static,
  ) -> Result<Async, Error> {
    let waker = lp.inner().poller.waker();
    let inner = lp.inner().register(|id, owner| {
      Rc::new_cyclic(|me| AsyncInner {
        core: HandleCore::new(HandleKind::Async, id, owner),
        me: me.clone(),
        shared: Arc::new(AsyncShared {
          pending: AtomicBool::new(false),
          waker,
        }),
        cb: RefCell::new(Some(Box::new(cb))),
      })
    })?;
    inner.core.set_active(true);
    inner.core.op_begin();
    lp.inner().queues.asyncs.borrow_mut().push(inner.core.id());
    Ok(Async { inner })
  }

  /// A cloneable, `Send` trigger for this handle.
  pub fn sender(&self) -> AsyncSender {
    AsyncSender {
      shared: self.inner.shared.clone(),
    }
  }

  /// Same-thread convenience for [`AsyncSender::send`].
  pub fn send(&self) {
    self.sender().send()
  }
}

impl Handle for Async {
  fn core(&self) -> &HandleCore {
    &self.inner.core
  }
}

impl HandleOps for AsyncInner {
  fn core(&self) -> &HandleCore {
    &self.core
  }

  fn teardown(&self, lp: &Rc<LoopInner>) {
    if self.core.is_active() {
      PhaseQueues::remove_from(&lp.queues.asyncs, self.core.id());
      self.core.set_active(false);
      self.core.op_end();
    }
    self.cb.borrow_mut().take();
  }

  fn wakeup_pending(&self) -> bool {
    self.shared.pending.load(Ordering::Acquire)
  }

  fn on_wakeup(&self, lp: &Rc<LoopInner>) {
    if !self.shared.pending.swap(false, Ordering::AcqRel) {
      return;
    }
    if !self.core.is_active() {
      return;
    }
    let Some(me) = self.me.upgrade() else {
      return;
    };
    let public = Async { inner: me };
    invoke_callback!(lp, self.core, self.cb, &public);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event_loop::RunMode;
  use std::time::Duration;

  #[test]
  fn send_from_another_thread_wakes_a_blocked_loop() {
    let lp = EventLoop::new().unwrap();
    let hits = Rc::new(std::cell::Cell::new(0u32));
    let async_handle = {
      let hits = hits.clone();
      Async::new(&lp, move |a| {
        hits.set(hits.get() + 1);
        a.close(None)?;
        Ok(())
      })
      .unwrap()
    };
    let sender = async_handle.sender();
    let thread = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(30));
      sender.send();
      sender.send(); // coalesces with the first
    });
    let start = std::time::Instant::now();
    assert!(!lp.run(RunMode::Default).unwrap());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(hits.get(), 1);
    assert!(async_handle.is_closed());
    thread.join().unwrap();
  }

  #[test]
  fn sends_after_close_are_ignored() {
    let lp = EventLoop::new().unwrap();
    let async_handle = Async::new(&lp, |_| Ok(())).unwrap();
    let sender = async_handle.sender();
    async_handle.close(None).unwrap();
    sender.send();
    assert!(!lp.run(RunMode::NoWait).unwrap());
    assert!(async_handle.is_closed());
  }
}

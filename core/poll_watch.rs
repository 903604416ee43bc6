// Copyright 2018-2025 the Spindle authors. MIT license.

//! Readiness watcher over a caller-owned file descriptor.
//!
//! The watcher never reads, writes, or closes the descriptor; it only
//! reports readiness. The descriptor must stay valid (and nonblocking, for
//! the caller's own I/O) while the watcher is active.

#![cfg(unix)]

use std::cell::Cell;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::rc::Weak;

use crate::error::AnyError;
use crate::error::Error;
use crate::handle::invoke_callback;
use crate::handle::Handle;
use crate::handle::HandleCore;
use crate::handle::HandleKind;
use crate::handle::HandleOps;
use crate::poller::interest_for;
use crate::poller::Readiness;
use crate::poller::READABLE;
use crate::poller::WRITABLE;
use crate::reactor::EventLoop;
use crate::reactor::LoopInner;

/// Callback receiving the readiness mask ([`READABLE`] | [`WRITABLE`]).
pub type PollCallback =
  Box<dyn FnMut(&PollWatcher, Result<u32, Error>) -> Result<(), AnyError>>;

pub(crate) struct PollWatchInner {
  core: HandleCore,
  me: Weak<PollWatchInner>,
  fd: RawFd,
  registered: Cell<bool>,
  cb: RefCell<Option<PollCallback>>,
}

/// Handle reporting readiness events for an arbitrary descriptor.
#[derive(Clone)]
pub struct PollWatcher {
  inner: Rc<PollWatchInner>,
}

impl PollWatcher {
  pub fn new(lp: &EventLoop, fd: RawFd) -> Result<PollWatcher, Error> {
    if fd < 0 {
      return Err(Error::InvalidInput("negative file descriptor"));
    }
    let inner = lp.inner().register(|id, owner| {
      Rc::new_cyclic(|me| PollWatchInner {
        core: HandleCore::new(HandleKind::PollWatcher, id, owner),
        me: me.clone(),
        fd,
        registered: Cell::new(false),
        cb: RefCell::new(None),
      })
    })?;
    Ok(PollWatcher { inner })
  }

  /// Start watching for the events in `mask`. Starting an active watcher
  /// re-arms it with the new mask and callback.
  pub fn start(
    &self,
    mask: u32,
    cb: impl FnMut(&PollWatcher, Result<u32, Error>) -> Result<(), AnyError>
      + 'static,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    let Some(interest) =
      interest_for(mask & READABLE != 0, mask & WRITABLE != 0)
    else {
      return Err(Error::InvalidInput("empty event mask"));
    };
    let mut source = mio::unix::SourceFd(&inner.fd);
    if inner.registered.get() {
      lp.poller.reregister(&mut source, inner.core.id(), interest)?;
    } else {
      lp.poller.register(&mut source, inner.core.id(), interest)?;
      inner.registered.set(true);
      inner.core.set_active(true);
      inner.core.op_begin();
    }
    *inner.cb.borrow_mut() = Some(Box::new(cb));
    Ok(())
  }

  /// Stop watching. Stopping an inactive watcher is a no-op.
  pub fn stop(&self) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    inner.detach(&lp);
    Ok(())
  }
}

impl Handle for PollWatcher {
  fn core(&self) -> &HandleCore {
    &self.inner.core
  }
}

impl PollWatchInner {
  fn detach(&self, lp: &Rc<LoopInner>) {
    if !self.registered.replace(false) {
      return;
    }
    let mut source = mio::unix::SourceFd(&self.fd);
    let _ = lp.poller.deregister(&mut source);
    self.core.set_active(false);
    self.core.op_end();
  }
}

impl HandleOps for PollWatchInner {
  fn core(&self) -> &HandleCore {
    &self.core
  }

  fn teardown(&self, lp: &Rc<LoopInner>) {
    self.detach(lp);
    self.cb.borrow_mut().take();
  }

  fn on_io(&self, lp: &Rc<LoopInner>, ready: Readiness) {
    if !self.core.is_active() {
      return;
    }
    let Some(me) = self.me.upgrade() else {
      return;
    };
    let public = PollWatcher { inner: me };
    let delivery = if ready.is_error() {
      Err(crate::error::Error::Io {
        errno: crate::error::Errno::EBADF,
        source: std::io::ErrorKind::Other.into(),
      })
    } else {
      Ok(ready.mask())
    };
    invoke_callback!(lp, self.core, self.cb, &public, delivery);
  }
}

// Copyright 2018-2025 the Spindle authors. MIT license.

//! The OS readiness collaborator.
//!
//! The loop consumes polling as a black box with one contract: given a set
//! of registered descriptors and a timeout, block until at least one is
//! ready or the timeout elapses, and report `(handle id, readiness)` pairs.
//! The box may wake spuriously with zero results (timeout, EINTR, or a
//! cross-thread wakeup through the [`mio::Waker`]); the loop treats all of
//! those identically.
//!
//! Backed by `mio` (epoll/kqueue/IOCP). Registrations are edge-triggered on
//! Unix, which is why stream reads re-arm themselves through the pending
//! phase until they observe `WouldBlock` (see `stream.rs`).

use std::cell::RefCell;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;

use crate::handle::HandleId;

/// Readable-interest bit for watcher masks.
pub const READABLE: u32 = 1 << 0;
/// Writable-interest bit for watcher masks.
pub const WRITABLE: u32 = 1 << 1;

/// Token reserved for the cross-thread waker; never a handle id.
const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

/// What a descriptor reported ready for.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
  readable: bool,
  writable: bool,
  read_closed: bool,
  write_closed: bool,
  error: bool,
}

impl Readiness {
  fn from_event(ev: &mio::event::Event) -> Self {
    Self {
      readable: ev.is_readable(),
      writable: ev.is_writable(),
      read_closed: ev.is_read_closed(),
      write_closed: ev.is_write_closed(),
      error: ev.is_error(),
    }
  }

  pub fn is_readable(&self) -> bool {
    self.readable || self.read_closed
  }

  pub fn is_writable(&self) -> bool {
    self.writable || self.write_closed
  }

  pub fn is_error(&self) -> bool {
    self.error
  }

  /// The peer shut down its write side; reads will report EOF.
  pub fn is_read_closed(&self) -> bool {
    self.read_closed
  }

  pub fn is_write_closed(&self) -> bool {
    self.write_closed
  }

  /// Interest-mask form, for the raw poll watcher callback.
  pub fn mask(&self) -> u32 {
    let mut mask = 0;
    if self.is_readable() {
      mask |= READABLE;
    }
    if self.is_writable() {
      mask |= WRITABLE;
    }
    mask
  }
}

pub(crate) type ReadyList = SmallVec<[(HandleId, Readiness); 32]>;

pub(crate) struct Poller {
  poll: RefCell<mio::Poll>,
  events: RefCell<mio::Events>,
  waker: Arc<mio::Waker>,
}

impl Poller {
  pub fn new() -> io::Result<Self> {
    let poll = mio::Poll::new()?;
    let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
    Ok(Self {
      poll: RefCell::new(poll),
      events: RefCell::new(mio::Events::with_capacity(256)),
      waker,
    })
  }

  /// Waker that interrupts a blocked poll from any thread.
  pub fn waker(&self) -> Arc<mio::Waker> {
    self.waker.clone()
  }

  pub fn register<S: mio::event::Source + ?Sized>(
    &self,
    source: &mut S,
    id: HandleId,
    interest: mio::Interest,
  ) -> io::Result<()> {
    self
      .poll
      .borrow()
      .registry()
      .register(source, mio::Token(id as usize), interest)
  }

  pub fn reregister<S: mio::event::Source + ?Sized>(
    &self,
    source: &mut S,
    id: HandleId,
    interest: mio::Interest,
  ) -> io::Result<()> {
    self
      .poll
      .borrow()
      .registry()
      .reregister(source, mio::Token(id as usize), interest)
  }

  pub fn deregister<S: mio::event::Source + ?Sized>(
    &self,
    source: &mut S,
  ) -> io::Result<()> {
    self.poll.borrow().registry().deregister(source)
  }

  /// Block until readiness or timeout (`None` = wait indefinitely) and
  /// append ready pairs to `out`. EINTR is reported as a spurious wake with
  /// zero results so the iteration can drain pending signal counters.
  pub fn poll(
    &self,
    timeout: Option<Duration>,
    out: &mut ReadyList,
  ) -> io::Result<()> {
    let mut poll = self.poll.borrow_mut();
    let mut events = self.events.borrow_mut();
    match poll.poll(&mut events, timeout) {
      Ok(()) => {}
      Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
      Err(err) => return Err(err),
    }
    for ev in events.iter() {
      if ev.token() == WAKE_TOKEN {
        continue;
      }
      out.push((ev.token().0 as HandleId, Readiness::from_event(ev)));
    }
    Ok(())
  }
}

/// Build a mio interest from reading/writing wants; `None` when the handle
/// wants no events and should be deregistered.
pub(crate) fn interest_for(
  readable: bool,
  writable: bool,
) -> Option<mio::Interest> {
  match (readable, writable) {
    (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
    (true, false) => Some(mio::Interest::READABLE),
    (false, true) => Some(mio::Interest::WRITABLE),
    (false, false) => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn interest_builder_covers_all_combinations() {
    assert!(interest_for(false, false).is_none());
    assert_eq!(interest_for(true, false), Some(mio::Interest::READABLE));
    assert_eq!(interest_for(false, true), Some(mio::Interest::WRITABLE));
    let both = interest_for(true, true).unwrap();
    assert!(both.is_readable() && both.is_writable());
  }

  #[test]
  fn waker_interrupts_a_blocked_poll() {
    let poller = Poller::new().unwrap();
    let waker = poller.waker();
    let thread = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(20));
      waker.wake().unwrap();
    });
    let mut out = ReadyList::new();
    let start = std::time::Instant::now();
    poller.poll(Some(Duration::from_secs(5)), &mut out).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    // The waker token is filtered out of the ready list.
    assert!(out.is_empty());
    thread.join().unwrap();
  }
}

// Copyright 2018-2025 the Spindle authors. MIT license.

//! UDP handle.
//!
//! Datagram recv delivers one datagram per callback through the loop's
//! scratch buffer, draining until `WouldBlock` within a pass (datagram
//! boundaries make the one-chunk re-arm protocol of streams unnecessary --
//! a full buffer still holds exactly one datagram, truncated by the OS).
//! Sends queue in submission order with the same backpressure signal as
//! stream writes.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::rc::Weak;

use bytes::Bytes;

use crate::error::not_connected;
use crate::error::AnyError;
use crate::error::Error;
use crate::handle::invoke_callback;
use crate::handle::Handle;
use crate::handle::HandleCore;
use crate::handle::HandleKind;
use crate::handle::HandleOps;
use crate::poller::interest_for;
use crate::poller::Readiness;
use crate::reactor::EventLoop;
use crate::reactor::LoopInner;

/// Callback fired once per received datagram.
pub type RecvCallback = Box<
  dyn FnMut(&UdpSocket, Result<(&[u8], SocketAddr), Error>) -> Result<(), AnyError>,
>;

/// Callback fired exactly once per queued send.
pub type SendCallback =
  Box<dyn FnOnce(Result<(), Error>) -> Result<(), AnyError>>;

struct SendRequest {
  data: Bytes,
  addr: SocketAddr,
  cb: Option<SendCallback>,
}

pub(crate) struct UdpInner {
  core: HandleCore,
  me: Weak<UdpInner>,
  io: RefCell<Option<mio::net::UdpSocket>>,
  queue: RefCell<VecDeque<SendRequest>>,
  queued_bytes: Cell<usize>,
  receiving: Cell<bool>,
  flush_scheduled: Cell<bool>,
  registered: Cell<Option<mio::Interest>>,
  recv_cb: RefCell<Option<RecvCallback>>,
}

/// A UDP socket handle bound to a local address.
#[derive(Clone)]
pub struct UdpSocket {
  inner: Rc<UdpInner>,
}

impl UdpSocket {
  pub fn bind(lp: &EventLoop, addr: SocketAddr) -> Result<UdpSocket, Error> {
    let sock = mio::net::UdpSocket::bind(addr)?;
    let inner = lp.inner().register(|id, owner| {
      Rc::new_cyclic(|me| UdpInner {
        core: HandleCore::new(HandleKind::Udp, id, owner),
        me: me.clone(),
        io: RefCell::new(Some(sock)),
        queue: RefCell::new(VecDeque::new()),
        queued_bytes: Cell::new(0),
        receiving: Cell::new(false),
        flush_scheduled: Cell::new(false),
        registered: Cell::new(None),
        recv_cb: RefCell::new(None),
      })
    })?;
    Ok(UdpSocket { inner })
  }

  pub fn local_addr(&self) -> Result<SocketAddr, Error> {
    match self.inner.io.borrow().as_ref() {
      Some(sock) => Ok(sock.local_addr()?),
      None => Err(not_connected()),
    }
  }

  /// Start delivering inbound datagrams.
  pub fn recv_start(
    &self,
    cb: impl FnMut(&UdpSocket, Result<(&[u8], SocketAddr), Error>) -> Result<(), AnyError>
      + 'static,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    if inner.receiving.get() {
      return Err(Error::Already);
    }
    *inner.recv_cb.borrow_mut() = Some(Box::new(cb));
    inner.receiving.set(true);
    inner.core.set_active(true);
    inner.core.op_begin();
    inner.update_registration(&lp);
    Ok(())
  }

  pub fn recv_stop(&self) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    if !inner.receiving.get() {
      return Err(Error::NotActive);
    }
    inner.stop_receiving(&lp);
    Ok(())
  }

  /// Queue one datagram to `addr`. Sends complete in submission order.
  pub fn send(
    &self,
    data: impl Into<Bytes>,
    addr: SocketAddr,
    cb: Option<SendCallback>,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    if inner.io.borrow().is_none() {
      return Err(not_connected());
    }
    let data = data.into();
    inner.queued_bytes.set(inner.queued_bytes.get() + data.len());
    inner.queue.borrow_mut().push_back(SendRequest { data, addr, cb });
    inner.core.op_begin();
    inner.core.set_active(true);
    inner.schedule_flush(&lp);
    inner.update_registration(&lp);
    Ok(())
  }

  /// Bytes queued but not yet handed to the OS.
  pub fn send_queue_size(&self) -> usize {
    self.inner.queued_bytes.get()
  }
}

impl Handle for UdpSocket {
  fn core(&self) -> &HandleCore {
    &self.inner.core
  }
}

impl UdpInner {
  fn public(&self) -> Option<UdpSocket> {
    self.me.upgrade().map(|inner| UdpSocket { inner })
  }

  fn recompute_active(&self) {
    self
      .core
      .set_active(self.receiving.get() || !self.queue.borrow().is_empty());
  }

  fn update_registration(&self, lp: &Rc<LoopInner>) {
    let desired =
      interest_for(self.receiving.get(), !self.queue.borrow().is_empty());
    if desired == self.registered.get() {
      return;
    }
    let mut io = self.io.borrow_mut();
    let Some(sock) = io.as_mut() else {
      return;
    };
    let id = self.core.id();
    let result = match (self.registered.get(), desired) {
      (None, Some(interest)) => lp.poller.register(sock, id, interest),
      (Some(_), Some(interest)) => lp.poller.reregister(sock, id, interest),
      (Some(_), None) => lp.poller.deregister(sock),
      (None, None) => Ok(()),
    };
    if let Err(err) = result {
      log::warn!("udp #{id}: poller registration failed: {err}");
      return;
    }
    self.registered.set(desired);
  }

  fn schedule_flush(&self, lp: &Rc<LoopInner>) {
    if self.flush_scheduled.replace(true) {
      return;
    }
    let me = self.me.clone();
    lp.push_pending(Box::new(move |lp| {
      if let Some(inner) = me.upgrade() {
        inner.flush_scheduled.set(false);
        inner.pump_sends(lp);
      }
    }));
  }

  fn pump_sends(&self, lp: &Rc<LoopInner>) {
    if self.core.is_closing() {
      return;
    }
    loop {
      let outcome = {
        let io = self.io.borrow();
        let Some(sock) = io.as_ref() else {
          return;
        };
        let queue = self.queue.borrow();
        let Some(front) = queue.front() else {
          break;
        };
        sock.send_to(&front.data, front.addr)
      };
      match outcome {
        Ok(_) => {
          let req = self.queue.borrow_mut().pop_front().expect("front existed");
          self
            .queued_bytes
            .set(self.queued_bytes.get() - req.data.len());
          self.core.op_end();
          if let Some(cb) = req.cb {
            if let Err(err) = cb(Ok(())) {
              lp.report(err);
            }
          }
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => {
          let req = self.queue.borrow_mut().pop_front().expect("front existed");
          self
            .queued_bytes
            .set(self.queued_bytes.get() - req.data.len());
          self.core.op_end();
          if let Some(cb) = req.cb {
            if let Err(err) = cb(Err(err.into())) {
              lp.report(err);
            }
          }
          // Per-datagram failure; later datagrams may still be deliverable.
          continue;
        }
      }
    }
    self.recompute_active();
    self.update_registration(lp);
  }

  fn pump_recv(&self, lp: &Rc<LoopInner>) {
    if !self.receiving.get() || self.core.is_closing() {
      return;
    }
    if lp.read_buf_busy.get() {
      let me = self.me.clone();
      lp.push_pending(Box::new(move |lp| {
        if let Some(inner) = me.upgrade() {
          inner.pump_recv(lp);
        }
      }));
      return;
    }
    lp.read_buf_busy.set(true);
    let mut buf = lp.read_buf.borrow_mut();
    loop {
      if !self.receiving.get() || self.core.is_closing() {
        break;
      }
      let outcome = {
        let io = self.io.borrow();
        let Some(sock) = io.as_ref() else {
          break;
        };
        sock.recv_from(&mut buf)
      };
      let Some(public) = self.public() else {
        break;
      };
      match outcome {
        Ok((n, peer)) => {
          let datagram = (&buf[..n], peer);
          invoke_callback!(lp, self.core, self.recv_cb, &public, Ok(datagram));
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => {
          invoke_callback!(lp, self.core, self.recv_cb, &public, Err(err.into()));
          break;
        }
      }
    }
    drop(buf);
    lp.read_buf_busy.set(false);
  }

  fn stop_receiving(&self, lp: &Rc<LoopInner>) {
    if !self.receiving.replace(false) {
      return;
    }
    self.core.op_end();
    self.recompute_active();
    self.update_registration(lp);
  }

  fn drop_io(&self, lp: &Rc<LoopInner>) {
    let mut io = self.io.borrow_mut();
    if let Some(mut sock) = io.take() {
      if self.registered.get().is_some() {
        let _ = lp.poller.deregister(&mut sock);
        self.registered.set(None);
      }
    }
  }
}

impl HandleOps for UdpInner {
  fn core(&self) -> &HandleCore {
    &self.core
  }

  fn teardown(&self, lp: &Rc<LoopInner>) {
    let me = self.me.upgrade();
    if self.receiving.replace(false) {
      self.core.op_end();
    }
    let mut queue = self.queue.borrow_mut();
    while let Some(req) = queue.pop_front() {
      match (req.cb, me.clone()) {
        (Some(cb), Some(me)) => {
          lp.push_pending(Box::new(move |lp| {
            me.core.op_end();
            if let Err(err) = cb(Err(Error::Canceled)) {
              lp.report(err);
            }
          }));
        }
        _ => self.core.op_end(),
      }
    }
    self.queued_bytes.set(0);
    drop(queue);
    self.drop_io(lp);
    self.recv_cb.borrow_mut().take();
  }

  fn on_io(&self, lp: &Rc<LoopInner>, ready: Readiness) {
    if self.receiving.get() && ready.is_readable() {
      self.pump_recv(lp);
    }
    if !self.queue.borrow().is_empty() && ready.is_writable() {
      self.pump_sends(lp);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event_loop::RunMode;
  use crate::timers::Timer;

  #[test]
  fn datagram_round_trip_on_loopback() {
    let lp = EventLoop::new().unwrap();
    let guard = Timer::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      guard
        .start(
          move |_| {
            lp2.stop();
            Ok(())
          },
          5_000,
          0,
        )
        .unwrap();
    }

    let receiver =
      UdpSocket::bind(&lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let receiver_addr = receiver.local_addr().unwrap();
    let sender = UdpSocket::bind(&lp, "127.0.0.1:0".parse().unwrap()).unwrap();

    let got: Rc<RefCell<Vec<(Vec<u8>, SocketAddr)>>> = Default::default();
    {
      let lp2 = lp.clone();
      let got = got.clone();
      receiver
        .recv_start(move |_, datagram| {
          let (data, peer) = datagram?;
          got.borrow_mut().push((data.to_vec(), peer));
          lp2.stop();
          Ok(())
        })
        .unwrap();
    }

    let sent = Rc::new(Cell::new(false));
    {
      let sent = sent.clone();
      sender
        .send(
          &b"datagram"[..],
          receiver_addr,
          Some(Box::new(move |result| {
            result?;
            sent.set(true);
            Ok(())
          })),
        )
        .unwrap();
    }
    assert_eq!(sender.send_queue_size(), 8);

    lp.run(RunMode::Default).unwrap();
    assert!(sent.get());
    assert_eq!(sender.send_queue_size(), 0);
    let got = got.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, b"datagram".to_vec());
  }

  #[test]
  fn send_on_closing_socket_fails() {
    let lp = EventLoop::new().unwrap();
    let sock = UdpSocket::bind(&lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = sock.local_addr().unwrap();
    sock.close(None).unwrap();
    assert!(matches!(
      sock.send(&b"x"[..], addr, None),
      Err(Error::HandleClosed)
    ));
    lp.run(RunMode::NoWait).unwrap();
  }
}

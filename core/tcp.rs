// Copyright 2018-2025 the Spindle authors. MIT license.

//! TCP stream and listener handles.
//!
//! A stream registers with the poller only while it wants events: readable
//! interest while reading, writable interest while a connect is in flight
//! or the write queue is nonempty. Reads deliver at most one scratch-buffer
//! chunk per pass and re-arm through the pending phase until the socket
//! reports `WouldBlock` (the poller is edge-triggered). Writes flush in
//! submission order from the pending phase and from writable events.

use std::cell::Cell;
use std::cell::RefCell;
use std::io;
use std::io::Read;
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
use crate::stream::read_once;
use crate::stream::RawRead;
use crate::stream::ReadEvent;
use crate::stream::WriteCallback;
use crate::stream::WriteQueue;

/// Callback fired exactly once when a connect resolves.
pub type ConnectCallback =
  Box<dyn FnOnce(&TcpStream, Result<(), Error>) -> Result<(), AnyError>>;

/// Callback fired per read delivery while reading is active.
pub type TcpReadCallback =
  Box<dyn FnMut(&TcpStream, Result<ReadEvent, Error>) -> Result<(), AnyError>>;

/// Callback fired per inbound connection on a listening handle.
pub type ConnectionCallback =
  Box<dyn FnMut(&TcpListener, Result<TcpStream, Error>) -> Result<(), AnyError>>;

pub(crate) struct TcpStreamInner {
  core: HandleCore,
  me: Weak<TcpStreamInner>,
  io: RefCell<Option<mio::net::TcpStream>>,
  wq: WriteQueue,
  reading: Cell<bool>,
  connecting: Cell<bool>,
  flush_scheduled: Cell<bool>,
  registered: Cell<Option<mio::Interest>>,
  read_cb: RefCell<Option<TcpReadCallback>>,
  connect_cb: RefCell<Option<ConnectCallback>>,
}

/// A TCP connection handle.
#[derive(Clone)]
pub struct TcpStream {
  inner: Rc<TcpStreamInner>,
}

impl TcpStream {
  /// Create an unconnected handle; pair with [`TcpStream::connect`].
  pub fn new(lp: &EventLoop) -> Result<TcpStream, Error> {
    Ok(TcpStream {
      inner: Self::register(lp)?,
    })
  }

  fn register(lp: &EventLoop) -> Result<Rc<TcpStreamInner>, Error> {
    lp.inner().register(|id, owner| {
      Rc::new_cyclic(|me| TcpStreamInner {
        core: HandleCore::new(HandleKind::TcpStream, id, owner),
        me: me.clone(),
        io: RefCell::new(None),
        wq: WriteQueue::default(),
        reading: Cell::new(false),
        connecting: Cell::new(false),
        flush_scheduled: Cell::new(false),
        registered: Cell::new(None),
        read_cb: RefCell::new(None),
        connect_cb: RefCell::new(None),
      })
    })
  }

  /// Wrap a socket accepted by a listener.
  pub(crate) fn from_accepted(
    lp: &Rc<LoopInner>,
    sock: mio::net::TcpStream,
  ) -> Result<TcpStream, Error> {
    let inner = lp.register(|id, owner| {
      Rc::new_cyclic(|me| TcpStreamInner {
        core: HandleCore::new(HandleKind::TcpStream, id, owner),
        me: me.clone(),
        io: RefCell::new(Some(sock)),
        wq: WriteQueue::default(),
        reading: Cell::new(false),
        connecting: Cell::new(false),
        flush_scheduled: Cell::new(false),
        registered: Cell::new(None),
        read_cb: RefCell::new(None),
        connect_cb: RefCell::new(None),
      })
    })?;
    Ok(TcpStream { inner })
  }

  /// Begin a nonblocking connect; `cb` fires exactly once with the outcome.
  pub fn connect(
    &self,
    addr: SocketAddr,
    cb: impl FnOnce(&TcpStream, Result<(), Error>) -> Result<(), AnyError> + 'static,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    if inner.connecting.get() || inner.io.borrow().is_some() {
      return Err(Error::Already);
    }
    let sock = mio::net::TcpStream::connect(addr)?;
    *inner.io.borrow_mut() = Some(sock);
    *inner.connect_cb.borrow_mut() = Some(Box::new(cb));
    inner.connecting.set(true);
    inner.core.set_active(true);
    inner.core.op_begin();
    inner.update_registration(&lp);
    Ok(())
  }

  /// Start delivering read events. At most one read is active per stream.
  pub fn start_read(
    &self,
    cb: impl FnMut(&TcpStream, Result<ReadEvent, Error>) -> Result<(), AnyError>
      + 'static,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    if inner.reading.get() {
      return Err(Error::Already);
    }
    if inner.io.borrow().is_none() {
      return Err(not_connected());
    }
    *inner.read_cb.borrow_mut() = Some(Box::new(cb));
    inner.reading.set(true);
    inner.core.set_active(true);
    inner.core.op_begin();
    inner.update_registration(&lp);
    Ok(())
  }

  /// Stop delivering read events. Fails with [`Error::NotActive`] when no
  /// read is active.
  pub fn stop_read(&self) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    if !inner.reading.get() {
      return Err(Error::NotActive);
    }
    inner.stop_reading(&lp);
    Ok(())
  }

  /// Queue one write. Writes on the same stream complete in submission
  /// order; `cb` (if any) fires exactly once, on completion or failure.
  pub fn write(
    &self,
    data: impl Into<Bytes>,
    cb: Option<WriteCallback>,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    if inner.io.borrow().is_none() || inner.connecting.get() {
      return Err(not_connected());
    }
    inner.wq.push(data.into(), cb);
    inner.core.op_begin();
    inner.core.set_active(true);
    inner.schedule_flush(&lp);
    inner.update_registration(&lp);
    Ok(())
  }

  /// Bytes accepted but not yet flushed -- the backpressure signal.
  pub fn write_queue_size(&self) -> usize {
    self.inner.wq.size()
  }

  pub fn local_addr(&self) -> Result<SocketAddr, Error> {
    match self.inner.io.borrow().as_ref() {
      Some(sock) => Ok(sock.local_addr()?),
      None => Err(not_connected()),
    }
  }

  pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
    match self.inner.io.borrow().as_ref() {
      Some(sock) => Ok(sock.peer_addr()?),
      None => Err(not_connected()),
    }
  }
}

impl Handle for TcpStream {
  fn core(&self) -> &HandleCore {
    &self.inner.core
  }
}

enum ConnectProbe {
  Done(Result<(), Error>),
  StillPending,
}

impl TcpStreamInner {
  fn public(&self) -> Option<TcpStream> {
    self.me.upgrade().map(|inner| TcpStream { inner })
  }

  fn recompute_active(&self) {
    self.core.set_active(
      self.connecting.get() || self.reading.get() || !self.wq.is_empty(),
    );
  }

  /// Keep the poller registration in sync with what the stream wants.
  fn update_registration(&self, lp: &Rc<LoopInner>) {
    let desired = if self.connecting.get() {
      interest_for(false, true)
    } else {
      interest_for(self.reading.get(), !self.wq.is_empty())
    };
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
      log::warn!("tcp #{id}: poller registration failed: {err}");
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
        inner.pump_writes(lp);
      }
    }));
  }

  fn pump_writes(&self, lp: &Rc<LoopInner>) {
    if self.core.is_closing() {
      return;
    }
    let (finished, _progress) = {
      let io = self.io.borrow();
      let Some(sock) = io.as_ref() else {
        return;
      };
      let mut writer = sock;
      self.wq.flush(&mut writer)
    };
    for (cb, result) in finished {
      self.core.op_end();
      if let Some(cb) = cb {
        if let Err(err) = cb(result) {
          lp.report(err);
        }
      }
    }
    self.recompute_active();
    self.update_registration(lp);
  }

  /// Deliver at most one chunk, then re-arm through the pending phase.
  fn pump_read(&self, lp: &Rc<LoopInner>) {
    if !self.reading.get() || self.core.is_closing() {
      return;
    }
    if lp.read_buf_busy.get() {
      // Scratch buffer serialization: try again next iteration rather than
      // aliasing a buffer another callback is still observing.
      let me = self.me.clone();
      lp.push_pending(Box::new(move |lp| {
        if let Some(inner) = me.upgrade() {
          inner.pump_read(lp);
        }
      }));
      return;
    }
    lp.read_buf_busy.set(true);
    let mut buf = lp.read_buf.borrow_mut();
    let raw = {
      let io = self.io.borrow();
      match io.as_ref() {
        Some(sock) => {
          let mut reader = sock;
          read_once(&mut buf, |chunk| reader.read(chunk))
        }
        None => RawRead::Block,
      }
    };
    let Some(public) = self.public() else {
      drop(buf);
      lp.read_buf_busy.set(false);
      return;
    };
    match raw {
      RawRead::Data(n) => {
        let event = ReadEvent::Data(&buf[..n]);
        invoke_callback!(lp, self.core, self.read_cb, &public, Ok(event));
        if self.reading.get() && !self.core.is_closing() {
          let me = self.me.clone();
          lp.push_pending(Box::new(move |lp| {
            if let Some(inner) = me.upgrade() {
              inner.pump_read(lp);
            }
          }));
        }
      }
      RawRead::Eof => {
        self.stop_reading(lp);
        invoke_callback!(lp, self.core, self.read_cb, &public, Ok(ReadEvent::Eof));
      }
      RawRead::Block => {}
      RawRead::Err(err) => {
        self.stop_reading(lp);
        invoke_callback!(lp, self.core, self.read_cb, &public, Err(err.into()));
      }
    }
    drop(buf);
    lp.read_buf_busy.set(false);
  }

  fn stop_reading(&self, lp: &Rc<LoopInner>) {
    if !self.reading.replace(false) {
      return;
    }
    self.core.op_end();
    self.recompute_active();
    self.update_registration(lp);
  }

  fn probe_connect(&self) -> ConnectProbe {
    let io = self.io.borrow();
    let Some(sock) = io.as_ref() else {
      return ConnectProbe::Done(Err(not_connected()));
    };
    match sock.take_error() {
      Ok(Some(err)) => ConnectProbe::Done(Err(err.into())),
      Err(err) => ConnectProbe::Done(Err(err.into())),
      Ok(None) => match sock.peer_addr() {
        Ok(_) => ConnectProbe::Done(Ok(())),
        Err(err) if err.kind() == io::ErrorKind::NotConnected => {
          ConnectProbe::StillPending
        }
        Err(err) => ConnectProbe::Done(Err(err.into())),
      },
    }
  }

  fn finish_connect(&self, lp: &Rc<LoopInner>) {
    let result = match self.probe_connect() {
      ConnectProbe::StillPending => return,
      ConnectProbe::Done(result) => result,
    };
    self.connecting.set(false);
    self.core.op_end();
    if result.is_err() {
      // The socket is unusable; make later writes report ENOTCONN.
      self.drop_io(lp);
    }
    self.recompute_active();
    self.update_registration(lp);
    let cb = self.connect_cb.borrow_mut().take();
    if let (Some(cb), Some(public)) = (cb, self.public()) {
      if let Err(err) = cb(&public, result) {
        lp.report(err);
      }
    }
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

impl HandleOps for TcpStreamInner {
  fn core(&self) -> &HandleCore {
    &self.core
  }

  fn teardown(&self, lp: &Rc<LoopInner>) {
    let me = self.me.upgrade();
    if self.connecting.replace(false) {
      let cb = self.connect_cb.borrow_mut().take();
      if let (Some(cb), Some(me)) = (cb, me.clone()) {
        lp.push_pending(Box::new(move |lp| {
          me.core.op_end();
          if let Some(public) = me.public() {
            if let Err(err) = cb(&public, Err(Error::Canceled)) {
              lp.report(err);
            }
          }
        }));
      } else {
        self.core.op_end();
      }
    }
    if self.reading.replace(false) {
      // No completion is owed for a stopped read.
      self.core.op_end();
    }
    for (cb, _) in self.wq.cancel_all() {
      match (cb, me.clone()) {
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
    self.drop_io(lp);
    self.read_cb.borrow_mut().take();
  }

  fn on_io(&self, lp: &Rc<LoopInner>, ready: Readiness) {
    if self.connecting.get() && (ready.is_writable() || ready.is_error()) {
      self.finish_connect(lp);
    }
    if self.reading.get() && ready.is_readable() {
      self.pump_read(lp);
    }
    if !self.wq.is_empty() && ready.is_writable() {
      self.pump_writes(lp);
    }
  }
}

pub(crate) struct TcpListenerInner {
  core: HandleCore,
  me: Weak<TcpListenerInner>,
  io: RefCell<Option<mio::net::TcpListener>>,
  conn_cb: RefCell<Option<ConnectionCallback>>,
}

/// A listening TCP socket. Bound at construction, delivering connections
/// once [`TcpListener::listen`] installs a callback.
#[derive(Clone)]
pub struct TcpListener {
  inner: Rc<TcpListenerInner>,
}

impl TcpListener {
  pub fn bind(lp: &EventLoop, addr: SocketAddr) -> Result<TcpListener, Error> {
    let sock = mio::net::TcpListener::bind(addr)?;
    let inner = lp.inner().register(|id, owner| {
      Rc::new_cyclic(|me| TcpListenerInner {
        core: HandleCore::new(HandleKind::TcpListener, id, owner),
        me: me.clone(),
        io: RefCell::new(Some(sock)),
        conn_cb: RefCell::new(None),
      })
    })?;
    Ok(TcpListener { inner })
  }

  /// Start accepting. Each inbound connection (or accept failure) is
  /// delivered to `cb`; listening again just replaces the callback.
  pub fn listen(
    &self,
    cb: impl FnMut(&TcpListener, Result<TcpStream, Error>) -> Result<(), AnyError>
      + 'static,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    *inner.conn_cb.borrow_mut() = Some(Box::new(cb));
    if !inner.core.is_active() {
      let mut io = inner.io.borrow_mut();
      let Some(sock) = io.as_mut() else {
        return Err(not_connected());
      };
      lp.poller
        .register(sock, inner.core.id(), mio::Interest::READABLE)?;
      inner.core.set_active(true);
      inner.core.op_begin();
    }
    Ok(())
  }

  pub fn local_addr(&self) -> Result<SocketAddr, Error> {
    match self.inner.io.borrow().as_ref() {
      Some(sock) => Ok(sock.local_addr()?),
      None => Err(not_connected()),
    }
  }
}

impl Handle for TcpListener {
  fn core(&self) -> &HandleCore {
    &self.inner.core
  }
}

impl HandleOps for TcpListenerInner {
  fn core(&self) -> &HandleCore {
    &self.core
  }

  fn teardown(&self, lp: &Rc<LoopInner>) {
    if self.core.is_active() {
      self.core.op_end();
    }
    let mut io = self.io.borrow_mut();
    if let Some(mut sock) = io.take() {
      if self.core.is_active() {
        let _ = lp.poller.deregister(&mut sock);
      }
    }
    self.conn_cb.borrow_mut().take();
  }

  fn on_io(&self, lp: &Rc<LoopInner>, _ready: Readiness) {
    loop {
      if !self.core.is_active() || self.core.is_closing() {
        break;
      }
      let accepted = {
        let io = self.io.borrow();
        let Some(sock) = io.as_ref() else {
          break;
        };
        sock.accept()
      };
      let Some(me) = self.me.upgrade() else {
        break;
      };
      let public = TcpListener { inner: me };
      match accepted {
        Ok((sock, _peer)) => {
          let delivery = TcpStream::from_accepted(lp, sock);
          invoke_callback!(lp, self.core, self.conn_cb, &public, delivery);
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => {
          invoke_callback!(lp, self.core, self.conn_cb, &public, Err(err.into()));
          break;
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event_loop::RunMode;
  use crate::timers::Timer;
  use pretty_assertions::assert_eq;

  /// Stop the loop after `ms` in case the interesting path never fires.
  fn guard(lp: &EventLoop, ms: u64) -> Timer {
    let t = Timer::new(lp).unwrap();
    let lp2 = lp.clone();
    t.start(
      move |_| {
        lp2.stop();
        Ok(())
      },
      ms,
      0,
    )
    .unwrap();
    t
  }

  #[test]
  fn connect_accept_and_round_trip() {
    let lp = EventLoop::new().unwrap();
    let _guard = guard(&lp, 5_000);
    let received: Rc<RefCell<Vec<u8>>> = Default::default();
    let server_streams: Rc<RefCell<Vec<TcpStream>>> = Default::default();

    let listener = TcpListener::bind(&lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    {
      let server_streams = server_streams.clone();
      listener
        .listen(move |_, conn| {
          let stream = conn?;
          // Echo one read back to the peer.
          let echo = stream.clone();
          stream.start_read(move |_, event| {
            if let Ok(ReadEvent::Data(data)) = event {
              echo.write(data.to_vec(), None)?;
            }
            Ok(())
          })?;
          server_streams.borrow_mut().push(stream);
          Ok(())
        })
        .unwrap();
    }

    let client = TcpStream::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      let received = received.clone();
      client
        .connect(addr, move |stream, result| {
          result?;
          let lp2 = lp2.clone();
          let received = received.clone();
          stream.start_read(move |_, event| {
            if let Ok(ReadEvent::Data(data)) = event {
              received.borrow_mut().extend_from_slice(data);
              lp2.stop();
            }
            Ok(())
          })?;
          stream.write(&b"ping"[..], None)?;
          Ok(())
        })
        .unwrap();
    }

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*received.borrow(), b"ping".to_vec());
  }

  #[test]
  fn eof_is_distinct_from_error() {
    let lp = EventLoop::new().unwrap();
    let _guard = guard(&lp, 5_000);
    let outcome: Rc<RefCell<Vec<&'static str>>> = Default::default();

    let listener = TcpListener::bind(&lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    listener
      .listen(move |_, conn| {
        // Close the server side immediately: the peer observes EOF.
        conn?.close(None)?;
        Ok(())
      })
      .unwrap();

    let client = TcpStream::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      let outcome = outcome.clone();
      client
        .connect(addr, move |stream, result| {
          result?;
          let lp2 = lp2.clone();
          let outcome = outcome.clone();
          stream.start_read(move |_, event| {
            outcome.borrow_mut().push(match event {
              Ok(ReadEvent::Data(_)) => "data",
              Ok(ReadEvent::Eof) => "eof",
              Err(_) => "error",
            });
            lp2.stop();
            Ok(())
          })?;
          Ok(())
        })
        .unwrap();
    }

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*outcome.borrow(), vec!["eof"]);
  }

  #[test]
  fn writes_complete_in_submission_order() {
    let lp = EventLoop::new().unwrap();
    let _guard = guard(&lp, 5_000);
    let order: Rc<RefCell<Vec<u8>>> = Default::default();
    let server_streams: Rc<RefCell<Vec<TcpStream>>> = Default::default();

    let listener = TcpListener::bind(&lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    {
      let server_streams = server_streams.clone();
      listener
        .listen(move |_, conn| {
          server_streams.borrow_mut().push(conn?);
          Ok(())
        })
        .unwrap();
    }

    let client = TcpStream::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      let order = order.clone();
      client
        .connect(addr, move |stream, result| {
          result?;
          assert_eq!(stream.write_queue_size(), 0);
          let o1 = order.clone();
          stream.write(
            &b"first"[..],
            Some(Box::new(move |r| {
              r?;
              o1.borrow_mut().push(1);
              Ok(())
            })),
          )?;
          let o2 = order.clone();
          let lp2 = lp2.clone();
          stream.write(
            &b"second"[..],
            Some(Box::new(move |r| {
              r?;
              o2.borrow_mut().push(2);
              lp2.stop();
              Ok(())
            })),
          )?;
          assert_eq!(stream.write_queue_size(), 11);
          Ok(())
        })
        .unwrap();
    }

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*order.borrow(), vec![1, 2]);
    assert_eq!(client.write_queue_size(), 0);
  }

  #[test]
  fn write_on_closing_stream_fails_immediately() {
    let lp = EventLoop::new().unwrap();
    let stream = TcpStream::new(&lp).unwrap();
    stream.close(None).unwrap();
    match stream.write(&b"late"[..], None) {
      Err(Error::HandleClosed) => {}
      other => panic!("expected HandleClosed, got {other:?}"),
    }
    lp.run(RunMode::NoWait).unwrap();
  }

  #[test]
  fn refused_connect_delivers_an_operational_error() {
    let lp = EventLoop::new().unwrap();
    let _guard = guard(&lp, 5_000);
    // Grab a port that nobody is listening on.
    let addr = {
      let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      sock.local_addr().unwrap()
    };
    let outcome = Rc::new(RefCell::new(None));
    let client = TcpStream::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      let outcome = outcome.clone();
      client
        .connect(addr, move |_, result| {
          *outcome.borrow_mut() = Some(result.map_err(|e| e.errno()));
          lp2.stop();
          Ok(())
        })
        .unwrap();
    }
    lp.run(RunMode::Default).unwrap();
    match outcome.borrow_mut().take() {
      Some(Err(errno)) => {
        assert_eq!(errno, crate::error::Errno::ECONNREFUSED);
      }
      other => panic!("expected refused connect, got {other:?}"),
    }
    // The failed stream can only be closed.
    assert!(matches!(
      client.write(&b"x"[..], None),
      Err(crate::error::Error::Io { .. })
    ));
    client.close(None).unwrap();
    lp.run(RunMode::NoWait).unwrap();
  }

  #[test]
  fn second_start_read_is_rejected() {
    let lp = EventLoop::new().unwrap();
    let _guard = guard(&lp, 5_000);
    let listener = TcpListener::bind(&lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    listener
      .listen(|_, conn| {
        conn?;
        Ok(())
      })
      .unwrap();

    let client = TcpStream::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      client
        .connect(addr, move |stream, result| {
          result?;
          stream.start_read(|_, _| Ok(()))?;
          assert!(matches!(
            stream.start_read(|_, _| Ok(())),
            Err(Error::Already)
          ));
          stream.stop_read()?;
          assert!(matches!(stream.stop_read(), Err(Error::NotActive)));
          lp2.stop();
          Ok(())
        })
        .unwrap();
    }
    lp.run(RunMode::Default).unwrap();
  }
}

// Copyright 2018-2025 the Spindle authors. MIT license.

//! Unix pipe handles (Unix domain sockets).
//!
//! Same event machinery as TCP: readable interest while reading, writable
//! while connecting or flushing, one scratch-buffer chunk per read pass.
//! Only the endpoint naming differs (filesystem paths instead of socket
//! addresses).

#![cfg(unix)]

use std::cell::Cell;
use std::cell::RefCell;
use std::io;
use std::io::Read;
use std::path::Path;
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

/// Callback fired exactly once when a pipe connect resolves.
pub type PipeConnectCallback =
  Box<dyn FnOnce(&Pipe, Result<(), Error>) -> Result<(), AnyError>>;

/// Callback fired per read delivery while reading is active.
pub type PipeReadCallback =
  Box<dyn FnMut(&Pipe, Result<ReadEvent, Error>) -> Result<(), AnyError>>;

/// Callback fired per inbound connection on a listening pipe.
pub type PipeConnectionCallback =
  Box<dyn FnMut(&PipeListener, Result<Pipe, Error>) -> Result<(), AnyError>>;

pub(crate) struct PipeInner {
  core: HandleCore,
  me: Weak<PipeInner>,
  io: RefCell<Option<mio::net::UnixStream>>,
  wq: WriteQueue,
  reading: Cell<bool>,
  connecting: Cell<bool>,
  flush_scheduled: Cell<bool>,
  registered: Cell<Option<mio::Interest>>,
  read_cb: RefCell<Option<PipeReadCallback>>,
  connect_cb: RefCell<Option<PipeConnectCallback>>,
}

/// A connected (or connecting) Unix domain stream.
#[derive(Clone)]
pub struct Pipe {
  inner: Rc<PipeInner>,
}

impl Pipe {
  pub fn new(lp: &EventLoop) -> Result<Pipe, Error> {
    let inner = Self::register(lp.inner())?;
    Ok(Pipe { inner })
  }

  fn register(lp: &Rc<LoopInner>) -> Result<Rc<PipeInner>, Error> {
    lp.register(|id, owner| {
      Rc::new_cyclic(|me| PipeInner {
        core: HandleCore::new(HandleKind::Pipe, id, owner),
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

  /// Begin a nonblocking connect to a listening socket path.
  pub fn connect(
    &self,
    path: impl AsRef<Path>,
    cb: impl FnOnce(&Pipe, Result<(), Error>) -> Result<(), AnyError> + 'static,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    if inner.connecting.get() || inner.io.borrow().is_some() {
      return Err(Error::Already);
    }
    let sock = mio::net::UnixStream::connect(path)?;
    *inner.io.borrow_mut() = Some(sock);
    *inner.connect_cb.borrow_mut() = Some(Box::new(cb));
    inner.connecting.set(true);
    inner.core.set_active(true);
    inner.core.op_begin();
    inner.update_registration(&lp);
    Ok(())
  }

  pub fn start_read(
    &self,
    cb: impl FnMut(&Pipe, Result<ReadEvent, Error>) -> Result<(), AnyError>
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

  pub fn write_queue_size(&self) -> usize {
    self.inner.wq.size()
  }
}

impl Handle for Pipe {
  fn core(&self) -> &HandleCore {
    &self.inner.core
  }
}

impl PipeInner {
  fn public(&self) -> Option<Pipe> {
    self.me.upgrade().map(|inner| Pipe { inner })
  }

  fn recompute_active(&self) {
    self.core.set_active(
      self.connecting.get() || self.reading.get() || !self.wq.is_empty(),
    );
  }

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
      log::warn!("pipe #{id}: poller registration failed: {err}");
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

  fn pump_read(&self, lp: &Rc<LoopInner>) {
    if !self.reading.get() || self.core.is_closing() {
      return;
    }
    if lp.read_buf_busy.get() {
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

  fn finish_connect(&self, lp: &Rc<LoopInner>) {
    let result = {
      let io = self.io.borrow();
      match io.as_ref() {
        Some(sock) => match sock.take_error() {
          Ok(Some(err)) => Err(Error::from(err)),
          Ok(None) => Ok(()),
          Err(err) => Err(Error::from(err)),
        },
        None => Err(not_connected()),
      }
    };
    self.connecting.set(false);
    self.core.op_end();
    if result.is_err() {
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

impl HandleOps for PipeInner {
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

pub(crate) struct PipeListenerInner {
  core: HandleCore,
  me: Weak<PipeListenerInner>,
  io: RefCell<Option<mio::net::UnixListener>>,
  conn_cb: RefCell<Option<PipeConnectionCallback>>,
}

/// A listening Unix domain socket bound to a filesystem path.
#[derive(Clone)]
pub struct PipeListener {
  inner: Rc<PipeListenerInner>,
}

impl PipeListener {
  pub fn bind(
    lp: &EventLoop,
    path: impl AsRef<Path>,
  ) -> Result<PipeListener, Error> {
    let sock = mio::net::UnixListener::bind(path)?;
    let inner = lp.inner().register(|id, owner| {
      Rc::new_cyclic(|me| PipeListenerInner {
        core: HandleCore::new(HandleKind::PipeListener, id, owner),
        me: me.clone(),
        io: RefCell::new(Some(sock)),
        conn_cb: RefCell::new(None),
      })
    })?;
    Ok(PipeListener { inner })
  }

  pub fn listen(
    &self,
    cb: impl FnMut(&PipeListener, Result<Pipe, Error>) -> Result<(), AnyError>
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
}

impl Handle for PipeListener {
  fn core(&self) -> &HandleCore {
    &self.inner.core
  }
}

impl HandleOps for PipeListenerInner {
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
      let public = PipeListener { inner: me };
      match accepted {
        Ok((sock, _peer)) => {
          let delivery = Pipe::register(lp).map(|inner| {
            *inner.io.borrow_mut() = Some(sock);
            Pipe { inner }
          });
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

  fn temp_sock_path(tag: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("spindle-{tag}-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
  }

  #[test]
  fn pipe_round_trip_over_a_socket_path() {
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
    let path = temp_sock_path("roundtrip");
    let received: Rc<RefCell<Vec<u8>>> = Default::default();
    let accepted: Rc<RefCell<Vec<Pipe>>> = Default::default();

    let listener = PipeListener::bind(&lp, &path).unwrap();
    {
      let accepted = accepted.clone();
      listener
        .listen(move |_, conn| {
          let pipe = conn?;
          pipe.write(&b"over the pipe"[..], None)?;
          accepted.borrow_mut().push(pipe);
          Ok(())
        })
        .unwrap();
    }

    let client = Pipe::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      let received = received.clone();
      client
        .connect(&path, move |pipe, result| {
          result?;
          let lp2 = lp2.clone();
          let received = received.clone();
          pipe.start_read(move |_, event| {
            if let Ok(ReadEvent::Data(data)) = event {
              received.borrow_mut().extend_from_slice(data);
              lp2.stop();
            }
            Ok(())
          })?;
          Ok(())
        })
        .unwrap();
    }

    lp.run(RunMode::Default).unwrap();
    assert_eq!(*received.borrow(), b"over the pipe".to_vec());
    let _ = std::fs::remove_file(&path);
  }
}

// Copyright 2018-2025 the Spindle authors. MIT license.

//! Shared stream machinery: the ordered write queue with its backpressure
//! signal, and the one-chunk-per-pass read protocol.
//!
//! Reads use the loop's single scratch buffer, guarded by a busy flag; a
//! read dispatch that finds the buffer busy re-queues itself through the
//! pending phase rather than aliasing it. After delivering one chunk the
//! stream re-arms itself the same way, so data beyond the first chunk is
//! consumed on later iterations and the poller's edge-triggered contract
//! (keep reading until `WouldBlock`) is still met across iterations.
//!
//! Writes complete strictly in submission order. A write error fails the
//! entire remaining queue with the same code: once the transport has
//! reported an error there is no ordering under which later queued writes
//! could still succeed.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;

use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::AnyError;
use crate::error::Error;

/// One delivery on a reading stream.
#[derive(Debug)]
pub enum ReadEvent<'a> {
  /// A chunk of data, at most one scratch-buffer's worth.
  Data(&'a [u8]),
  /// Orderly end-of-stream: the peer shut down its write side. Zero bytes
  /// with no error -- distinct from an `Err(_)` delivery.
  Eof,
}

/// Callback fired once per completed (or failed) write.
pub type WriteCallback = Box<dyn FnOnce(Result<(), Error>) -> Result<(), AnyError>>;

pub(crate) struct WriteRequest {
  pub data: Bytes,
  pub offset: usize,
  pub cb: Option<WriteCallback>,
}

/// Completed write callbacks collected during a flush, dispatched by the
/// caller after all queue borrows are released.
pub(crate) type FinishedWrites = SmallVec<[(Option<WriteCallback>, Result<(), Error>); 2]>;

pub(crate) enum FlushProgress {
  /// Everything queued was flushed.
  Drained,
  /// The transport reported `WouldBlock`; wait for the next writable event.
  Blocked,
}

/// Write-queue state shared by TCP and pipe streams.
#[derive(Default)]
pub(crate) struct WriteQueue {
  queue: RefCell<VecDeque<WriteRequest>>,
  queued_bytes: Cell<usize>,
}

impl WriteQueue {
  pub fn push(&self, data: Bytes, cb: Option<WriteCallback>) {
    self.queued_bytes.set(self.queued_bytes.get() + data.len());
    self.queue.borrow_mut().push_back(WriteRequest {
      data,
      offset: 0,
      cb,
    });
  }

  /// Sum of bytes accepted but not yet flushed -- the backpressure signal.
  pub fn size(&self) -> usize {
    self.queued_bytes.get()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.borrow().is_empty()
  }

  /// Flush front-to-back until drained or blocked. Completion callbacks are
  /// returned, not invoked: the caller dispatches them once no borrow of
  /// the stream state remains on the stack.
  pub fn flush<W: io::Write>(&self, w: &mut W) -> (FinishedWrites, FlushProgress) {
    let mut finished = FinishedWrites::new();
    loop {
      let mut queue = self.queue.borrow_mut();
      let Some(front) = queue.front_mut() else {
        return (finished, FlushProgress::Drained);
      };
      while front.offset < front.data.len() {
        match w.write(&front.data[front.offset..]) {
          Ok(0) => {
            // A transport that accepts zero bytes of a nonempty buffer will
            // never make progress; surface it as a broken pipe.
            drop(queue);
            finished.extend(self.fail_all(crate::error::Errno::EPIPE));
            return (finished, FlushProgress::Drained);
          }
          Ok(n) => {
            front.offset += n;
            self.queued_bytes.set(self.queued_bytes.get() - n);
          }
          Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            return (finished, FlushProgress::Blocked);
          }
          Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
          Err(err) => {
            // Fail the whole queue with one classified code.
            drop(queue);
            let errno = Error::from(err).errno();
            finished.extend(self.fail_all(errno));
            return (finished, FlushProgress::Drained);
          }
        }
      }
      let done = queue.pop_front().expect("front existed");
      finished.push((done.cb, Ok(())));
    }
  }

  /// Drain the queue, producing an error completion for every request.
  pub fn fail_all(&self, errno: crate::error::Errno) -> FinishedWrites {
    let mut finished = FinishedWrites::new();
    let mut queue = self.queue.borrow_mut();
    while let Some(req) = queue.pop_front() {
      self
        .queued_bytes
        .set(self.queued_bytes.get() - (req.data.len() - req.offset));
      finished.push((
        req.cb,
        Err(Error::Io {
          errno,
          source: io::Error::from(io::ErrorKind::Other),
        }),
      ));
    }
    finished
  }

  /// Drain the queue for a closing handle; every request completes with
  /// [`Error::Canceled`].
  pub fn cancel_all(&self) -> FinishedWrites {
    let mut finished = FinishedWrites::new();
    let mut queue = self.queue.borrow_mut();
    while let Some(req) = queue.pop_front() {
      finished.push((req.cb, Err(Error::Canceled)));
    }
    self.queued_bytes.set(0);
    finished
  }
}

/// Outcome of a single nonblocking read attempt.
pub(crate) enum RawRead {
  Data(usize),
  Eof,
  Block,
  Err(io::Error),
}

/// One nonblocking read into `buf`, with EOF and `WouldBlock`
/// classification. EINTR retries inline.
pub(crate) fn read_once(
  buf: &mut [u8],
  mut read: impl FnMut(&mut [u8]) -> io::Result<usize>,
) -> RawRead {
  loop {
    match read(buf) {
      Ok(0) => return RawRead::Eof,
      Ok(n) => return RawRead::Data(n),
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        return RawRead::Block;
      }
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => return RawRead::Err(err),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// An `io::Write` that accepts a bounded number of bytes total, a bounded
  /// number per call, then reports `WouldBlock` -- or a hard error.
  struct Transport {
    accepted: Vec<u8>,
    per_call: usize,
    capacity: usize,
    broken: bool,
  }

  impl Transport {
    fn new(per_call: usize, capacity: usize) -> Self {
      Self {
        accepted: vec![],
        per_call,
        capacity,
        broken: false,
      }
    }
  }

  impl io::Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      if self.broken {
        return Err(io::ErrorKind::BrokenPipe.into());
      }
      let room = self.capacity - self.accepted.len();
      let n = buf.len().min(self.per_call).min(room);
      if n == 0 {
        return Err(io::ErrorKind::WouldBlock.into());
      }
      self.accepted.extend_from_slice(&buf[..n]);
      Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn flush_completes_in_submission_order() {
    let q = WriteQueue::default();
    q.push(Bytes::from_static(b"first"), None);
    q.push(Bytes::from_static(b"second"), None);
    assert_eq!(q.size(), 11);
    let mut t = Transport::new(3, usize::MAX);
    let (finished, progress) = q.flush(&mut t);
    assert!(matches!(progress, FlushProgress::Drained));
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(t.accepted, b"firstsecond");
    assert_eq!(q.size(), 0);
  }

  #[test]
  fn partial_flush_keeps_backpressure_signal() {
    let q = WriteQueue::default();
    q.push(Bytes::from_static(b"abcdef"), None);
    let mut t = Transport::new(4, 4);
    let (finished, progress) = q.flush(&mut t);
    assert!(matches!(progress, FlushProgress::Blocked));
    assert!(finished.is_empty());
    assert_eq!(q.size(), 2);
    assert_eq!(t.accepted, b"abcd");
    // The blocked request completes once the transport drains.
    t.capacity = usize::MAX;
    let (finished, progress) = q.flush(&mut t);
    assert!(matches!(progress, FlushProgress::Drained));
    assert_eq!(finished.len(), 1);
    assert_eq!(t.accepted, b"abcdef");
    assert_eq!(q.size(), 0);
  }

  #[test]
  fn write_error_fails_the_whole_queue() {
    let q = WriteQueue::default();
    q.push(Bytes::from_static(b"one"), None);
    q.push(Bytes::from_static(b"two"), None);
    let mut t = Transport::new(64, usize::MAX);
    t.broken = true;
    let (finished, _) = q.flush(&mut t);
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|(_, r)| r.is_err()));
    assert_eq!(q.size(), 0);
  }

  #[test]
  fn read_once_distinguishes_eof_from_error() {
    let mut buf = [0u8; 8];
    assert!(matches!(read_once(&mut buf, |_| Ok(0)), RawRead::Eof));
    assert!(matches!(read_once(&mut buf, |_| Ok(3)), RawRead::Data(3)));
    assert!(matches!(
      read_once(&mut buf, |_| Err(io::ErrorKind::WouldBlock.into())),
      RawRead::Block
    ));
    assert!(matches!(
      read_once(&mut buf, |_| Err(io::ErrorKind::ConnectionReset.into())),
      RawRead::Err(_)
    ));
  }
}

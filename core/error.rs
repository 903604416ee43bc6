// Copyright 2018-2025 the Spindle authors. MIT license.

//! Error taxonomy for the reactor.
//!
//! Two layers:
//!
//! - [`Errno`]: the stable, enumerable code table. Every failure an
//!   application can observe maps to exactly one of these codes, so callers
//!   can match on codes without parsing message strings.
//! - [`Error`]: the concrete error type returned by loop and handle
//!   operations. Programming errors (closed handle, re-entrant run) are
//!   returned synchronously from the violating call; operational errors
//!   (connection refused, broken pipe) are delivered through completion
//!   callbacks as `Err` values.
//!
//! Application callbacks themselves return `Result<(), AnyError>`; an `Err`
//! is routed to the loop's uncaught-error hook and never unwinds through the
//! dispatch machinery.

use std::fmt;

/// Opaque error type carried by application callbacks.
pub type AnyError = anyhow::Error;

macro_rules! errno_table {
  ($( $name:ident => $msg:literal, )+) => {
    /// Stable errno-style error codes.
    ///
    /// The set is closed: new codes may be appended, existing codes never
    /// change meaning.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[non_exhaustive]
    pub enum Errno {
      $( $name, )+
    }

    impl Errno {
      /// All codes, in declaration order.
      pub const ALL: &'static [Errno] = &[ $( Errno::$name, )+ ];

      /// The symbolic name, e.g. `"EINVAL"`.
      pub const fn name(self) -> &'static str {
        match self {
          $( Errno::$name => stringify!($name), )+
        }
      }

      /// A short human-readable description.
      pub const fn message(self) -> &'static str {
        match self {
          $( Errno::$name => $msg, )+
        }
      }
    }
  };
}

errno_table! {
  EACCES => "permission denied",
  EADDRINUSE => "address already in use",
  EADDRNOTAVAIL => "address not available",
  EAGAIN => "resource temporarily unavailable",
  EALREADY => "operation already in progress",
  EBADF => "bad handle or file descriptor",
  EBUSY => "resource busy or locked",
  ECANCELED => "operation canceled",
  ECONNABORTED => "software caused connection abort",
  ECONNREFUSED => "connection refused",
  ECONNRESET => "connection reset by peer",
  EEXIST => "already exists",
  EINVAL => "invalid argument",
  ENOENT => "no such file or directory",
  ENOTCONN => "socket is not connected",
  ENOTSUP => "operation not supported",
  EPIPE => "broken pipe",
  ETIMEDOUT => "operation timed out",
  EOF => "end of file",
  UNKNOWN => "unknown error",
}

impl fmt::Display for Errno {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.name(), self.message())
  }
}

/// Errors produced by loop and handle operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  /// The handle is closing or has been closed. Any operation other than
  /// read-only property access reports this once `close()` has been
  /// requested, including a second `close()`.
  #[error("handle is closing or was closed")]
  HandleClosed,
  /// `run()` was called while the loop is already running on this thread.
  #[error("loop is already running")]
  LoopBusy,
  /// The loop backing this handle has been released.
  #[error("event loop has been released")]
  LoopGone,
  /// `close()` was called on a loop that still owns handles.
  #[error("loop still has open handles")]
  HandlesRemain,
  /// The operation is already in progress (e.g. a second `start_read`).
  #[error("operation already in progress")]
  Already,
  /// The operation requires an active state it is not in (e.g. `stop_read`
  /// on a stream that is not reading).
  #[error("operation is not active")]
  NotActive,
  /// `again()` on a timer that has no repeat interval.
  #[error("timer has no repeat interval")]
  NoRepeat,
  /// The operation was canceled, typically because the handle was closed
  /// while the operation was still queued.
  #[error("operation canceled")]
  Canceled,
  /// A caller-supplied argument violated the documented contract.
  #[error("invalid argument: {0}")]
  InvalidInput(&'static str),
  /// The process-wide default loop is owned by a different thread.
  #[error("default loop belongs to another thread")]
  WrongThread,
  /// An operating system error, classified into the stable code table.
  #[error("{errno}")]
  Io {
    errno: Errno,
    #[source]
    source: std::io::Error,
  },
}

impl Error {
  /// The stable code for this error.
  pub fn errno(&self) -> Errno {
    match self {
      Error::HandleClosed => Errno::EBADF,
      Error::LoopBusy => Errno::EBUSY,
      Error::LoopGone => Errno::EBADF,
      Error::HandlesRemain => Errno::EBUSY,
      Error::Already => Errno::EALREADY,
      Error::NotActive => Errno::EINVAL,
      Error::NoRepeat => Errno::EINVAL,
      Error::Canceled => Errno::ECANCELED,
      Error::InvalidInput(_) => Errno::EINVAL,
      Error::WrongThread => Errno::EBUSY,
      Error::Io { errno, .. } => *errno,
    }
  }
}

/// Stream/UDP operation attempted before a transport exists.
pub(crate) fn not_connected() -> Error {
  Error::Io {
    errno: Errno::ENOTCONN,
    source: std::io::ErrorKind::NotConnected.into(),
  }
}

impl From<std::io::Error> for Error {
  fn from(source: std::io::Error) -> Self {
    let errno = classify_io(&source);
    Error::Io { errno, source }
  }
}

/// Translates an `io::Error` into the stable code table. On Unix the raw OS
/// errno is authoritative; elsewhere (and for synthetic errors with no OS
/// code) the `ErrorKind` is used.
fn classify_io(err: &std::io::Error) -> Errno {
  #[cfg(unix)]
  if let Some(raw) = err.raw_os_error() {
    return classify_raw_os(raw);
  }
  classify_kind(err.kind())
}

#[cfg(unix)]
fn classify_raw_os(raw: i32) -> Errno {
  match raw {
    libc::EACCES => Errno::EACCES,
    libc::EADDRINUSE => Errno::EADDRINUSE,
    libc::EADDRNOTAVAIL => Errno::EADDRNOTAVAIL,
    libc::EAGAIN => Errno::EAGAIN,
    libc::EALREADY => Errno::EALREADY,
    libc::EBADF => Errno::EBADF,
    libc::EBUSY => Errno::EBUSY,
    libc::ECANCELED => Errno::ECANCELED,
    libc::ECONNABORTED => Errno::ECONNABORTED,
    libc::ECONNREFUSED => Errno::ECONNREFUSED,
    libc::ECONNRESET => Errno::ECONNRESET,
    libc::EEXIST => Errno::EEXIST,
    libc::EINVAL => Errno::EINVAL,
    libc::ENOENT => Errno::ENOENT,
    libc::ENOTCONN => Errno::ENOTCONN,
    libc::EOPNOTSUPP => Errno::ENOTSUP,
    libc::EPIPE => Errno::EPIPE,
    libc::ETIMEDOUT => Errno::ETIMEDOUT,
    _ => Errno::UNKNOWN,
  }
}

fn classify_kind(kind: std::io::ErrorKind) -> Errno {
  use std::io::ErrorKind;
  match kind {
    ErrorKind::PermissionDenied => Errno::EACCES,
    ErrorKind::AddrInUse => Errno::EADDRINUSE,
    ErrorKind::AddrNotAvailable => Errno::EADDRNOTAVAIL,
    ErrorKind::WouldBlock => Errno::EAGAIN,
    ErrorKind::ConnectionAborted => Errno::ECONNABORTED,
    ErrorKind::ConnectionRefused => Errno::ECONNREFUSED,
    ErrorKind::ConnectionReset => Errno::ECONNRESET,
    ErrorKind::AlreadyExists => Errno::EEXIST,
    ErrorKind::InvalidInput => Errno::EINVAL,
    ErrorKind::NotFound => Errno::ENOENT,
    ErrorKind::NotConnected => Errno::ENOTCONN,
    ErrorKind::Unsupported => Errno::ENOTSUP,
    ErrorKind::BrokenPipe => Errno::EPIPE,
    ErrorKind::TimedOut => Errno::ETIMEDOUT,
    ErrorKind::UnexpectedEof => Errno::EOF,
    _ => Errno::UNKNOWN,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn errno_names_match_variants() {
    assert_eq!(Errno::EINVAL.name(), "EINVAL");
    assert_eq!(Errno::ECONNREFUSED.name(), "ECONNREFUSED");
    for code in Errno::ALL {
      assert!(!code.message().is_empty());
    }
  }

  #[test]
  fn error_maps_to_stable_codes() {
    assert_eq!(Error::HandleClosed.errno(), Errno::EBADF);
    assert_eq!(Error::LoopBusy.errno(), Errno::EBUSY);
    assert_eq!(Error::Canceled.errno(), Errno::ECANCELED);
    assert_eq!(Error::NoRepeat.errno(), Errno::EINVAL);
  }

  #[test]
  fn io_error_classified_by_kind() {
    let err = Error::from(std::io::Error::new(
      std::io::ErrorKind::ConnectionRefused,
      "refused",
    ));
    assert_eq!(err.errno(), Errno::ECONNREFUSED);
  }

  #[cfg(unix)]
  #[test]
  fn io_error_classified_by_raw_os_code() {
    let err = Error::from(std::io::Error::from_raw_os_error(libc::EPIPE));
    assert_eq!(err.errno(), Errno::EPIPE);
  }
}

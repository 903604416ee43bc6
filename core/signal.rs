// Copyright 2018-2025 the Spindle authors. MIT license.

//! Signal watchers (Unix).
//!
//! The installed C handler is restricted to async-signal-safe work: it
//! increments a per-signum atomic counter and kicks each registered loop's
//! waker (an `eventfd`/pipe write). Everything else -- bookkeeping, callback
//! dispatch -- happens on loop threads. The handler is installed without
//! `SA_RESTART`, so a poll blocked on the loop thread is interrupted even if
//! the waker write races the poll setup.
//!
//! Deliveries coalesce: any number of signals between two loop iterations
//! produce one callback invocation per watcher. A signum watched by two
//! loops is drained by whichever loop iterates first; processes that need
//! per-loop signal fan-out should dedicate one loop to signal handling.

#![cfg(unix)]

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::AnyError;
use crate::error::Error;
use crate::handle::invoke_callback;
use crate::handle::Handle;
use crate::handle::HandleCore;
use crate::handle::HandleKind;
use crate::handle::HandleOps;
use crate::reactor::EventLoop;
use crate::reactor::LoopInner;

const MAX_SIGNAL: usize = 64;

// Pending delivery counts, incremented by the C handler.
static PENDING: [AtomicU32; MAX_SIGNAL] =
  [const { AtomicU32::new(0) }; MAX_SIGNAL];

// Immutable snapshot of loop wakers for the C handler. Replaced snapshots
// are intentionally leaked: the handler may still be iterating one, and the
// list is bounded by the number of loops that ever watched a signal.
struct WakerList {
  wakers: Vec<Arc<mio::Waker>>,
}

static WAKER_LIST: AtomicPtr<WakerList> =
  AtomicPtr::new(std::ptr::null_mut());

struct Registry {
  // signum -> (watcher count across all loops, previous disposition)
  installed: HashMap<i32, (usize, libc::sigaction)>,
  // loop identity -> (waker, active watcher count on that loop)
  loop_wakers: HashMap<usize, (Arc<mio::Waker>, usize)>,
}

static REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);

extern "C" fn on_signal(signum: libc::c_int) {
  let idx = signum as usize;
  if idx >= MAX_SIGNAL {
    return;
  }
  PENDING[idx].fetch_add(1, Ordering::SeqCst);
  // Wake every registered loop. `mio::Waker::wake` is a single write
  // syscall on the platforms this crate supports.
  let list = WAKER_LIST.load(Ordering::Acquire);
  if !list.is_null() {
    // SAFETY: snapshots are never freed, so the pointer stays valid.
    for waker in unsafe { &(*list).wakers } {
      let _ = waker.wake();
    }
  }
}

fn with_registry<T>(f: impl FnOnce(&mut Registry) -> T) -> T {
  let mut guard = REGISTRY.lock();
  let registry = guard.get_or_insert_with(|| Registry {
    installed: HashMap::new(),
    loop_wakers: HashMap::new(),
  });
  f(registry)
}

fn rebuild_waker_list(registry: &Registry) {
  let snapshot = Box::new(WakerList {
    wakers: registry
      .loop_wakers
      .values()
      .map(|(waker, _)| waker.clone())
      .collect(),
  });
  WAKER_LIST.store(Box::into_raw(snapshot), Ordering::Release);
}

fn install(signum: i32, lp: &Rc<LoopInner>) -> Result<(), Error> {
  with_registry(|registry| {
    let loop_key = Rc::as_ptr(lp) as usize;
    let entry = registry
      .loop_wakers
      .entry(loop_key)
      .or_insert_with(|| (lp.poller.waker(), 0));
    entry.1 += 1;
    rebuild_waker_list(registry);

    if let Some((count, _)) = registry.installed.get_mut(&signum) {
      *count += 1;
      return Ok(());
    }
    // SAFETY: standard sigaction installation; the handler only performs
    // async-signal-safe operations.
    let old = unsafe {
      let mut action: libc::sigaction = std::mem::zeroed();
      action.sa_sigaction = on_signal as libc::sighandler_t;
      action.sa_flags = 0;
      libc::sigemptyset(&mut action.sa_mask);
      let mut old: libc::sigaction = std::mem::zeroed();
      if libc::sigaction(signum, &action, &mut old) != 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
      }
      old
    };
    registry.installed.insert(signum, (1, old));
    Ok(())
  })
}

fn uninstall(signum: i32, lp: &Rc<LoopInner>) {
  with_registry(|registry| {
    let loop_key = Rc::as_ptr(lp) as usize;
    let drop_waker = match registry.loop_wakers.get_mut(&loop_key) {
      Some(entry) => {
        entry.1 -= 1;
        entry.1 == 0
      }
      None => false,
    };
    if drop_waker {
      registry.loop_wakers.remove(&loop_key);
    }
    rebuild_waker_list(registry);

    let restore = match registry.installed.get_mut(&signum) {
      Some((count, old)) => {
        *count -= 1;
        (*count == 0).then_some(*old)
      }
      None => None,
    };
    if let Some(old) = restore {
      registry.installed.remove(&signum);
      // SAFETY: restoring the disposition saved at install time.
      unsafe {
        libc::sigaction(signum, &old, std::ptr::null_mut());
      }
    }
  })
}

/// True if the signum has undispatched deliveries.
pub(crate) fn has_pending(signum: i32) -> bool {
  let idx = signum as usize;
  idx < MAX_SIGNAL && PENDING[idx].load(Ordering::SeqCst) > 0
}

/// Drain pending counts for the signums this loop watches and dispatch the
/// watchers' callbacks. Runs on the loop thread after the poll step.
pub(crate) fn dispatch_pending(lp: &Rc<LoopInner>) {
  let watched: SmallVec<[(i32, SmallVec<[crate::handle::HandleId; 2]>); 4]> = {
    let watch = lp.signal_watch.borrow();
    watch
      .iter()
      .map(|(&sig, ids)| (sig, ids.clone()))
      .collect()
  };
  for (signum, ids) in watched {
    let idx = signum as usize;
    if idx >= MAX_SIGNAL || PENDING[idx].swap(0, Ordering::SeqCst) == 0 {
      continue;
    }
    for id in ids {
      let ops = lp.handles.borrow().get(id);
      if let Some(ops) = ops {
        if ops.core().is_active() {
          ops.on_signal(lp, signum);
        }
      }
    }
  }
}

/// Callback fired (coalesced) when the watched signal is delivered.
pub type SignalCallback =
  Box<dyn FnMut(&Signal, i32) -> Result<(), AnyError>>;

pub(crate) struct SignalInner {
  core: HandleCore,
  me: Weak<SignalInner>,
  signum: Cell<i32>,
  cb: RefCell<Option<SignalCallback>>,
}

/// A signal watcher handle.
#[derive(Clone)]
pub struct Signal {
  inner: Rc<SignalInner>,
}

impl Signal {
  pub fn new(lp: &EventLoop) -> Result<Signal, Error> {
    let inner = lp.inner().register(|id, owner| {
      Rc::new_cyclic(|me| SignalInner {
        core: HandleCore::new(HandleKind::Signal, id, owner),
        me: me.clone(),
        signum: Cell::new(0),
        cb: RefCell::new(None),
      })
    })?;
    Ok(Signal { inner })
  }

  /// Start watching `signum`. One signum per handle; starting an active
  /// watcher fails with [`Error::Already`].
  pub fn start(
    &self,
    signum: i32,
    cb: impl FnMut(&Signal, i32) -> Result<(), AnyError> + 'static,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    inner.core.check_open()?;
    let lp = inner.core.loop_inner()?;
    if inner.core.is_active() {
      return Err(Error::Already);
    }
    if signum <= 0
      || signum as usize >= MAX_SIGNAL
      || signum == libc::SIGKILL
      || signum == libc::SIGSTOP
    {
      return Err(Error::InvalidInput("signal cannot be watched"));
    }
    install(signum, &lp)?;
    *inner.cb.borrow_mut() = Some(Box::new(cb));
    inner.signum.set(signum);
    lp.signal_watch
      .borrow_mut()
      .entry(signum)
      .or_default()
      .push(inner.core.id());
    inner.core.set_active(true);
    inner.core.op_begin();
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

  /// The watched signal number, 0 while stopped.
  pub fn signum(&self) -> i32 {
    if self.inner.core.is_active() {
      self.inner.signum.get()
    } else {
      0
    }
  }
}

impl Handle for Signal {
  fn core(&self) -> &HandleCore {
    &self.inner.core
  }
}

impl SignalInner {
  fn detach(&self, lp: &Rc<LoopInner>) {
    if !self.core.is_active() {
      return;
    }
    let signum = self.signum.get();
    {
      let mut watch = lp.signal_watch.borrow_mut();
      if let Some(ids) = watch.get_mut(&signum) {
        ids.retain(|id| *id != self.core.id());
        if ids.is_empty() {
          watch.remove(&signum);
        }
      }
    }
    uninstall(signum, lp);
    self.core.set_active(false);
    self.core.op_end();
  }
}

impl HandleOps for SignalInner {
  fn core(&self) -> &HandleCore {
    &self.core
  }

  fn teardown(&self, lp: &Rc<LoopInner>) {
    self.detach(lp);
    self.cb.borrow_mut().take();
  }

  fn on_signal(&self, lp: &Rc<LoopInner>, signum: i32) {
    let Some(me) = self.me.upgrade() else {
      return;
    };
    let public = Signal { inner: me };
    invoke_callback!(lp, self.core, self.cb, &public, signum);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event_loop::RunMode;
  use crate::timers::Timer;

  #[test]
  fn raised_signal_reaches_the_watcher() {
    let lp = EventLoop::new().unwrap();
    let seen = Rc::new(Cell::new(0));
    let watcher = Signal::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      let seen = seen.clone();
      watcher
        .start(libc::SIGUSR1, move |_, signum| {
          seen.set(signum);
          lp2.stop();
          Ok(())
        })
        .unwrap();
    }
    assert_eq!(watcher.signum(), libc::SIGUSR1);

    let trigger = Timer::new(&lp).unwrap();
    trigger
      .start(
        move |_| {
          // SAFETY: raising a handled signal in-process.
          unsafe {
            libc::raise(libc::SIGUSR1);
          }
          Ok(())
        },
        10,
        0,
      )
      .unwrap();

    lp.run(RunMode::Default).unwrap();
    assert_eq!(seen.get(), libc::SIGUSR1);
    watcher.stop().unwrap();
    assert_eq!(watcher.signum(), 0);
  }

  #[test]
  fn kill_and_stop_cannot_be_watched() {
    let lp = EventLoop::new().unwrap();
    let watcher = Signal::new(&lp).unwrap();
    assert!(matches!(
      watcher.start(libc::SIGKILL, |_, _| Ok(())),
      Err(Error::InvalidInput(_))
    ));
    assert!(matches!(
      watcher.start(0, |_, _| Ok(())),
      Err(Error::InvalidInput(_))
    ));
  }
}

// Copyright 2018-2025 the Spindle authors. MIT license.

//! The reactor core.
//!
//! One loop iteration, in order: refresh the cached clock, run due timers,
//! run deferred pending callbacks, run idle and prepare hooks, poll for
//! readiness with a computed timeout, dispatch I/O / worker completions /
//! async wakeups / signals, run check hooks, then finalize closing handles.
//!
//! The loop is strictly single-threaded and cooperative: every callback runs
//! on the owning thread, and the only cross-thread entry points are the
//! worker-completion queue, `AsyncSender::send` and `WorkRequest::cancel`,
//! all of which hand off through atomics and the poller's waker.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use crate::error::AnyError;
use crate::error::Error;
use crate::event_loop::PendingTask;
use crate::event_loop::PhaseQueues;
use crate::event_loop::RunMode;
use crate::handle::invoke_callback;
use crate::handle::HandleId;
use crate::handle::HandleOps;
use crate::handle::HandleTable;
use crate::poller::Poller;
use crate::poller::ReadyList;
use crate::tasks::CompletionQueue;
use crate::tasks::WorkState;
use crate::timers::Timer;
use crate::timers::TimerHeap;
use crate::timers::TimerInner;

/// Size of the per-loop scratch buffer reads are delivered through.
pub(crate) const READ_BUF_SIZE: usize = 64 * 1024;

/// Hook receiving errors raised by application callbacks. Returning `Err`
/// from the hook itself is fatal to the process.
pub type ErrorHook = Box<dyn FnMut(AnyError) -> Result<(), AnyError>>;

// At most one default loop exists process-wide; the Rc itself lives in the
// creating thread's slot because loops are not Send.
static DEFAULT_LOOP_EXISTS: AtomicBool = AtomicBool::new(false);
thread_local! {
  static DEFAULT_LOOP: RefCell<Option<Rc<LoopInner>>> = const { RefCell::new(None) };
}

pub(crate) struct LoopInner {
  pub(crate) handles: RefCell<HandleTable>,
  pub(crate) timers: RefCell<TimerHeap<Rc<TimerInner>>>,
  pub(crate) queues: PhaseQueues,
  pub(crate) poller: Poller,
  pub(crate) completions: std::sync::Arc<CompletionQueue>,
  pub(crate) work: RefCell<WorkState>,
  #[cfg(unix)]
  pub(crate) signal_watch:
    RefCell<std::collections::HashMap<i32, smallvec::SmallVec<[HandleId; 2]>>>,
  time_ms: Cell<u64>,
  origin: Instant,
  stop_flag: Cell<bool>,
  running: Cell<bool>,
  closed: Cell<bool>,
  is_default: Cell<bool>,
  pub(crate) read_buf: RefCell<Box<[u8]>>,
  pub(crate) read_buf_busy: Cell<bool>,
  error_hook: RefCell<Option<ErrorHook>>,
}

/// A single-threaded event loop. Cloning is cheap and yields another
/// reference to the same loop.
#[derive(Clone)]
pub struct EventLoop {
  inner: Rc<LoopInner>,
}

impl EventLoop {
  /// Create a new, independent loop.
  pub fn new() -> Result<EventLoop, Error> {
    let poller = Poller::new()?;
    let completions = std::sync::Arc::new(CompletionQueue::new(poller.waker()));
    let inner = Rc::new(LoopInner {
      handles: RefCell::new(HandleTable::default()),
      timers: RefCell::new(TimerHeap::default()),
      queues: PhaseQueues::default(),
      poller,
      completions,
      work: RefCell::new(WorkState::default()),
      #[cfg(unix)]
      signal_watch: RefCell::new(std::collections::HashMap::new()),
      time_ms: Cell::new(0),
      origin: Instant::now(),
      stop_flag: Cell::new(false),
      running: Cell::new(false),
      closed: Cell::new(false),
      is_default: Cell::new(false),
      read_buf: RefCell::new(vec![0u8; READ_BUF_SIZE].into_boxed_slice()),
      read_buf_busy: Cell::new(false),
      error_hook: RefCell::new(None),
    });
    Ok(EventLoop { inner })
  }

  /// The process-wide default loop, lazily created on first request. A
  /// convenience accessor only -- every API also accepts an explicitly
  /// constructed loop. Fails with [`Error::WrongThread`] if another thread
  /// already owns it.
  pub fn default_loop() -> Result<EventLoop, Error> {
    DEFAULT_LOOP.with(|slot| {
      if let Some(inner) = slot.borrow().clone() {
        return Ok(EventLoop { inner });
      }
      if DEFAULT_LOOP_EXISTS
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
      {
        return Err(Error::WrongThread);
      }
      match EventLoop::new() {
        Ok(lp) => {
          lp.inner.is_default.set(true);
          *slot.borrow_mut() = Some(lp.inner.clone());
          Ok(lp)
        }
        Err(err) => {
          DEFAULT_LOOP_EXISTS.store(false, Ordering::SeqCst);
          Err(err)
        }
      }
    })
  }

  pub(crate) fn inner(&self) -> &Rc<LoopInner> {
    &self.inner
  }

  pub(crate) fn from_inner(inner: Rc<LoopInner>) -> EventLoop {
    EventLoop { inner }
  }

  /// Drive the loop. Returns `Ok(true)` iff the loop could still make
  /// progress (active referenced handles or queued work remain) after the
  /// call. Re-entrant calls fail with [`Error::LoopBusy`].
  pub fn run(&self, mode: RunMode) -> Result<bool, Error> {
    let inner = &self.inner;
    if inner.running.get() {
      return Err(Error::LoopBusy);
    }
    if inner.closed.get() {
      return Err(Error::LoopGone);
    }
    inner.running.set(true);
    inner.stop_flag.set(false);
    struct RunGuard<'a>(&'a LoopInner);
    impl Drop for RunGuard<'_> {
      fn drop(&mut self) {
        self.0.running.set(false);
      }
    }
    let _guard = RunGuard(inner);
    match mode {
      RunMode::Default => {
        if !inner.has_alive() {
          inner.update_time();
          return Ok(false);
        }
        while inner.has_alive() && !inner.stop_flag.get() {
          inner.tick(mode)?;
        }
      }
      RunMode::Once | RunMode::NoWait => {
        inner.tick(mode)?;
        if mode == RunMode::Once {
          // Once implies forward progress: a poll that slept until the next
          // deadline still owes that timer its callback.
          inner.update_time();
          inner.run_timers();
        }
      }
    }
    Ok(inner.has_alive())
  }

  /// Request that the current (or next) `run(Default)` iteration be the
  /// last. Takes effect at the iteration boundary, never mid-phase.
  pub fn stop(&self) {
    self.inner.stop_flag.set(true);
  }

  /// The cached loop time in milliseconds, stable for a whole iteration.
  pub fn now(&self) -> u64 {
    self.inner.now()
  }

  /// Force a refresh of the cached clock from the monotonic time source.
  pub fn update_time(&self) {
    self.inner.update_time();
  }

  /// Install the uncaught-error hook, replacing the default (which logs the
  /// error and continues). If the hook itself returns `Err`, a diagnostic
  /// is printed and the process aborts.
  pub fn set_error_hook(
    &self,
    hook: impl FnMut(AnyError) -> Result<(), AnyError> + 'static,
  ) {
    *self.inner.error_hook.borrow_mut() = Some(Box::new(hook));
  }

  /// True while active referenced handles or queued work remain.
  pub fn alive(&self) -> bool {
    self.inner.has_alive()
  }

  /// Number of live handles (including closing ones not yet finalized).
  pub fn handle_count(&self) -> usize {
    self.inner.handles.borrow().len()
  }

  /// `(id, kind)` for every live handle, for diagnostics.
  pub fn handle_names(&self) -> Vec<(HandleId, &'static str)> {
    self.inner.handles.borrow().names().collect()
  }

  /// Release the loop. Fails loudly with [`Error::HandlesRemain`] while
  /// handles are still open, and with [`Error::LoopBusy`] while running.
  pub fn close(&self) -> Result<(), Error> {
    let inner = &self.inner;
    if inner.running.get() {
      return Err(Error::LoopBusy);
    }
    if !inner.handles.borrow().is_empty()
      || !inner.queues.closing.borrow().is_empty()
    {
      return Err(Error::HandlesRemain);
    }
    inner.closed.set(true);
    if inner.is_default.get() {
      DEFAULT_LOOP.with(|slot| slot.borrow_mut().take());
      DEFAULT_LOOP_EXISTS.store(false, Ordering::SeqCst);
    }
    Ok(())
  }
}

impl LoopInner {
  pub(crate) fn now(&self) -> u64 {
    self.time_ms.get()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.get()
  }

  pub(crate) fn update_time(&self) {
    self.time_ms.set(self.origin.elapsed().as_millis() as u64);
  }

  /// Allocate an id, build the handle, and enter it into the table. The
  /// table's `Rc` is the loop's internal reference to the handle.
  pub(crate) fn register<T: HandleOps>(
    self: &Rc<Self>,
    make: impl FnOnce(HandleId, Weak<LoopInner>) -> Rc<T>,
  ) -> Result<Rc<T>, Error> {
    if self.closed.get() {
      return Err(Error::LoopGone);
    }
    let id = self.handles.borrow_mut().next_id();
    let rc = make(id, Rc::downgrade(self));
    self.handles.borrow_mut().insert(id, rc.clone());
    Ok(rc)
  }

  /// Close-protocol continuation: synchronous teardown now, finalization in
  /// the closing pass.
  pub(crate) fn enqueue_close(self: &Rc<Self>, id: HandleId) {
    let ops = self.handles.borrow().get(id);
    if let Some(ops) = ops {
      ops.teardown(self);
      ops.core().set_active(false);
    }
    self.queues.closing.borrow_mut().push_back(id);
  }

  pub(crate) fn push_pending(&self, task: PendingTask) {
    self.queues.pending.borrow_mut().push_back(task);
  }

  /// Route a callback-raised error to the uncaught-error hook.
  pub(crate) fn report(&self, err: AnyError) {
    let hook = self.error_hook.borrow_mut().take();
    match hook {
      Some(mut hook) => {
        let result = hook(err);
        {
          let mut slot = self.error_hook.borrow_mut();
          if slot.is_none() {
            *slot = Some(hook);
          }
        }
        if let Err(fatal) = result {
          // Failure inside the hook itself is unrecoverable.
          eprintln!("fatal: uncaught-error hook failed: {fatal:?}");
          std::process::abort();
        }
      }
      None => log::error!("uncaught callback error: {err:#}"),
    }
  }

  /// True while anything justifies another `run(Default)` iteration.
  pub(crate) fn has_alive(&self) -> bool {
    self.handles.borrow().any_keeps_loop_alive()
      || !self.queues.closing.borrow().is_empty()
      || !self.queues.pending.borrow().is_empty()
      || self.work.borrow().has_pending()
  }

  fn idle_active(&self) -> bool {
    let handles = self.handles.borrow();
    self
      .queues
      .idle
      .borrow()
      .iter()
      .any(|&id| handles.get(id).is_some_and(|h| h.core().is_active()))
  }

  fn asyncs_pending(&self) -> bool {
    let handles = self.handles.borrow();
    self
      .queues
      .asyncs
      .borrow()
      .iter()
      .any(|&id| handles.get(id).is_some_and(|h| h.wakeup_pending()))
  }

  #[cfg(unix)]
  fn signals_pending(&self) -> bool {
    let watch = self.signal_watch.borrow();
    watch.keys().any(|&sig| crate::signal::has_pending(sig))
  }

  #[cfg(not(unix))]
  fn signals_pending(&self) -> bool {
    false
  }

  /// Zero when immediate work exists, else the distance to the next timer
  /// deadline, else block indefinitely while something is alive.
  fn compute_poll_timeout(&self) -> Option<Duration> {
    if self.stop_flag.get()
      || self.queues.has_immediate_work()
      || self.completions.has_pending()
      || self.idle_active()
      || self.asyncs_pending()
      || self.signals_pending()
    {
      return Some(Duration::ZERO);
    }
    if let Some(deadline) = self.timers.borrow().peek_min_deadline() {
      let now = self.time_ms.get();
      return Some(Duration::from_millis(deadline.saturating_sub(now)));
    }
    if self.has_alive() { None } else { Some(Duration::ZERO) }
  }

  /// One full iteration.
  pub(crate) fn tick(self: &Rc<Self>, mode: RunMode) -> Result<(), Error> {
    self.update_time();
    log::trace!("loop tick, t={}ms", self.time_ms.get());
    self.run_timers();
    self.run_pending();
    self.run_phase(&self.queues.idle);
    self.run_phase(&self.queues.prepare);
    let timeout = match mode {
      RunMode::NoWait => Some(Duration::ZERO),
      _ => self.compute_poll_timeout(),
    };
    self.run_poll(timeout)?;
    self.drain_completions();
    self.run_async_wakeups();
    #[cfg(unix)]
    crate::signal::dispatch_pending(self);
    self.run_phase(&self.queues.check);
    self.run_closing();
    Ok(())
  }

  /// Run due timers in deadline order, FIFO among equal deadlines. A
  /// repeating timer is rescheduled *before* its callback runs, so a
  /// callback reading "time until next fire" sees the new deadline.
  fn run_timers(self: &Rc<Self>) {
    let now = self.time_ms.get();
    let watermark = self.timers.borrow().watermark();
    loop {
      let popped = self.timers.borrow_mut().pop_due(now, watermark);
      let Some((_, timer)) = popped else {
        break;
      };
      if timer.core.is_closing() || !timer.core.is_active() {
        continue;
      }
      let repeat = timer.repeat.get();
      if repeat > 0 {
        let key = self
          .timers
          .borrow_mut()
          .schedule(now.saturating_add(repeat), timer.clone());
        timer.key.set(Some(key));
      } else {
        timer.key.set(None);
        timer.core.set_active(false);
        timer.core.op_end();
      }
      let public = Timer {
        inner: timer.clone(),
      };
      invoke_callback!(self, timer.core, timer.cb, &public);
    }
  }

  /// Deferred work from previous phases: write completions, re-armed reads,
  /// cancellation callbacks. Tasks queued while draining run next iteration.
  fn run_pending(self: &Rc<Self>) {
    let batch: Vec<PendingTask> =
      self.queues.pending.borrow_mut().drain(..).collect();
    for task in batch {
      task(self);
    }
  }

  fn run_phase(self: &Rc<Self>, list: &RefCell<Vec<HandleId>>) {
    for id in PhaseQueues::snapshot(list) {
      let ops = self.handles.borrow().get(id);
      if let Some(ops) = ops {
        if ops.core().is_active() {
          ops.on_phase(self);
        }
      }
    }
  }

  fn run_poll(self: &Rc<Self>, timeout: Option<Duration>) -> Result<(), Error> {
    let mut ready = ReadyList::new();
    self.poller.poll(timeout, &mut ready)?;
    for (id, readiness) in ready {
      let ops = self.handles.borrow().get(id);
      if let Some(ops) = ops {
        if !ops.core().is_closing() {
          ops.on_io(self, readiness);
        }
      }
    }
    Ok(())
  }

  fn run_async_wakeups(self: &Rc<Self>) {
    for id in PhaseQueues::snapshot(&self.queues.asyncs) {
      let ops = self.handles.borrow().get(id);
      if let Some(ops) = ops {
        ops.on_wakeup(self);
      }
    }
  }

  /// Finalize handles marked closing. Runs once per iteration after all
  /// other callbacks. A handle still owing completion callbacks
  /// (pending operation count > 0) is carried to the next iteration, so no
  /// close callback ever precedes one of the handle's own completions.
  fn run_closing(self: &Rc<Self>) {
    let batch: Vec<HandleId> =
      self.queues.closing.borrow_mut().drain(..).collect();
    for id in batch {
      let ops = self.handles.borrow().get(id);
      let Some(ops) = ops else {
        continue;
      };
      if ops.core().pending_ops() > 0 {
        self.queues.closing.borrow_mut().push_back(id);
        continue;
      }
      self.handles.borrow_mut().remove(id);
      ops.core().mark_closed();
      log::debug!(
        "finalized {} handle #{}",
        ops.core().kind().name(),
        id
      );
      if let Some(cb) = ops.core().take_close_cb() {
        if let Err(err) = cb() {
          self.report(err);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handle::Handle;
  use crate::hooks::Check;
  use crate::hooks::Prepare;
  use anyhow::anyhow;
  use pretty_assertions::assert_eq;

  type Log = Rc<RefCell<Vec<String>>>;

  #[test]
  fn zero_timers_fire_in_scheduling_order() {
    let lp = EventLoop::new().unwrap();
    let log: Log = Default::default();
    let timers: Vec<Timer> = ["a", "b", "c"]
      .into_iter()
      .map(|name| {
        let t = Timer::new(&lp).unwrap();
        let log = log.clone();
        t.start(
          move |_| {
            log.borrow_mut().push(name.to_string());
            Ok(())
          },
          0,
          0,
        )
        .unwrap();
        t
      })
      .collect();
    assert!(!lp.run(RunMode::NoWait).unwrap());
    assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    for t in &timers {
      assert!(!t.is_active());
    }
  }

  #[test]
  fn close_defers_finalization_past_check_phase() {
    let lp = EventLoop::new().unwrap();
    let log: Log = Default::default();

    let check = Check::new(&lp).unwrap();
    {
      let log = log.clone();
      check
        .start(move |_| {
          log.borrow_mut().push("check".into());
          Ok(())
        })
        .unwrap();
    }
    check.unref().unwrap();

    let victim = Timer::new(&lp).unwrap();
    victim.unref().unwrap();

    let closer = Timer::new(&lp).unwrap();
    {
      let log = log.clone();
      let victim = victim.clone();
      let close_log = log.clone();
      closer
        .start(
          move |_| {
            log.borrow_mut().push("timer".into());
            let close_log = close_log.clone();
            victim
              .close(Some(Box::new(move || {
                close_log.borrow_mut().push("close".into());
                Ok(())
              })))
              .unwrap();
            Ok(())
          },
          0,
          0,
        )
        .unwrap();
    }

    lp.run(RunMode::NoWait).unwrap();
    // Same iteration: timer phase, then check phase, then the closing pass.
    assert_eq!(*log.borrow(), vec!["timer", "check", "close"]);
    assert!(victim.is_closed());
  }

  #[test]
  fn double_close_is_an_error() {
    let lp = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(0u32));
    let t = Timer::new(&lp).unwrap();
    let fired2 = fired.clone();
    t.close(Some(Box::new(move || {
      fired2.set(fired2.get() + 1);
      Ok(())
    })))
    .unwrap();
    match t.close(None) {
      Err(Error::HandleClosed) => {}
      other => panic!("expected HandleClosed, got {other:?}"),
    }
    lp.run(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 1);
  }

  #[test]
  fn operations_on_closing_handles_fail() {
    let lp = EventLoop::new().unwrap();
    let t = Timer::new(&lp).unwrap();
    t.close(None).unwrap();
    assert!(matches!(t.start(|_| Ok(()), 1, 0), Err(Error::HandleClosed)));
    assert!(matches!(t.ref_(), Err(Error::HandleClosed)));
    assert!(matches!(t.unref(), Err(Error::HandleClosed)));
    // Read-only property access stays valid.
    assert!(t.is_closing());
    assert!(!t.is_closed());
    lp.run(RunMode::NoWait).unwrap();
    assert!(t.is_closed());
  }

  #[test]
  fn unref_lets_the_loop_exit() {
    let lp = EventLoop::new().unwrap();
    let t = Timer::new(&lp).unwrap();
    t.start(|_| Ok(()), 60_000, 0).unwrap();
    t.unref().unwrap();
    let start = Instant::now();
    assert!(!lp.run(RunMode::Default).unwrap());
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(t.is_active());
  }

  #[test]
  fn repeating_timer_is_rescheduled_before_its_callback() {
    let lp = EventLoop::new().unwrap();
    let t = Timer::new(&lp).unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));
    {
      let lp2 = lp.clone();
      let seen = seen.clone();
      t.start(
        move |timer| {
          // The new deadline is already armed while we run.
          seen.borrow_mut().push(timer.is_active());
          if seen.borrow().len() == 3 {
            lp2.stop();
          }
          Ok(())
        },
        1,
        1,
      )
      .unwrap();
    }
    lp.run(RunMode::Default).unwrap();
    assert_eq!(*seen.borrow(), vec![true, true, true]);
    t.stop().unwrap();
    assert!(!t.is_active());
  }

  #[test]
  fn stop_takes_effect_at_the_iteration_boundary() {
    let lp = EventLoop::new().unwrap();
    let iterations = Rc::new(Cell::new(0u32));
    let prep = Prepare::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      let iterations = iterations.clone();
      prep
        .start(move |_| {
          iterations.set(iterations.get() + 1);
          lp2.stop();
          Ok(())
        })
        .unwrap();
    }
    // The loop would otherwise iterate forever: prepare hooks are active
    // referenced handles.
    assert!(lp.run(RunMode::Default).unwrap());
    assert_eq!(iterations.get(), 1);
  }

  #[test]
  fn reentrant_run_fails_synchronously() {
    let lp = EventLoop::new().unwrap();
    let observed = Rc::new(RefCell::new(None));
    let t = Timer::new(&lp).unwrap();
    {
      let lp2 = lp.clone();
      let observed = observed.clone();
      t.start(
        move |_| {
          *observed.borrow_mut() = Some(matches!(
            lp2.run(RunMode::NoWait),
            Err(Error::LoopBusy)
          ));
          Ok(())
        },
        0,
        0,
      )
      .unwrap();
    }
    lp.run(RunMode::NoWait).unwrap();
    assert_eq!(*observed.borrow(), Some(true));
  }

  #[test]
  fn callback_errors_reach_the_hook_and_the_loop_continues() {
    let lp = EventLoop::new().unwrap();
    let caught: Log = Default::default();
    {
      let caught = caught.clone();
      lp.set_error_hook(move |err| {
        caught.borrow_mut().push(err.to_string());
        Ok(())
      });
    }
    let bad = Timer::new(&lp).unwrap();
    bad.start(|_| Err(anyhow!("boom")), 0, 0).unwrap();
    let good = Timer::new(&lp).unwrap();
    let fired = Rc::new(Cell::new(false));
    {
      let fired = fired.clone();
      good
        .start(
          move |_| {
            fired.set(true);
            Ok(())
          },
          0,
          0,
        )
        .unwrap();
    }
    lp.run(RunMode::NoWait).unwrap();
    assert_eq!(*caught.borrow(), vec!["boom"]);
    assert!(fired.get());
  }

  #[test]
  fn now_is_stable_within_an_iteration() {
    let lp = EventLoop::new().unwrap();
    let times = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..2 {
      let t = Timer::new(&lp).unwrap();
      let lp2 = lp.clone();
      let times = times.clone();
      t.start(
        move |_| {
          std::thread::sleep(Duration::from_millis(5));
          times.borrow_mut().push(lp2.now());
          Ok(())
        },
        0,
        0,
      )
      .unwrap();
    }
    lp.run(RunMode::NoWait).unwrap();
    let times = times.borrow();
    assert_eq!(times.len(), 2);
    assert_eq!(times[0], times[1]);
  }

  #[test]
  fn loop_close_fails_loudly_while_handles_remain() {
    let lp = EventLoop::new().unwrap();
    let t = Timer::new(&lp).unwrap();
    assert!(matches!(lp.close(), Err(Error::HandlesRemain)));
    t.close(None).unwrap();
    lp.run(RunMode::NoWait).unwrap();
    lp.close().unwrap();
    assert!(matches!(Timer::new(&lp), Err(Error::LoopGone)));
  }

  #[test]
  fn default_loop_is_a_per_process_singleton() {
    let a = EventLoop::default_loop().unwrap();
    let b = EventLoop::default_loop().unwrap();
    assert!(Rc::ptr_eq(a.inner(), b.inner()));
    // Loops are !Send, so only the error can cross back from the thread.
    let other_thread_errno = std::thread::spawn(|| {
      EventLoop::default_loop().map(|_| ()).unwrap_err().errno()
    })
    .join()
    .unwrap();
    assert_eq!(other_thread_errno, crate::error::Errno::EBUSY);
    a.close().unwrap();
  }

  #[test]
  fn run_once_blocks_until_the_next_timer() {
    let lp = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(false));
    let t = Timer::new(&lp).unwrap();
    {
      let fired = fired.clone();
      t.start(
        move |_| {
          fired.set(true);
          Ok(())
        },
        30,
        0,
      )
      .unwrap();
    }
    let start = Instant::now();
    lp.run(RunMode::Once).unwrap();
    assert!(fired.get());
    assert!(start.elapsed() >= Duration::from_millis(25));
  }
}

// Copyright 2018-2025 the Spindle authors. MIT license.

//! Worker-pool bridge.
//!
//! `queue_work` ships a `Send` closure to a worker thread and marshals its
//! result back onto the loop thread, where the completion closure runs with
//! full access to loop and handle state. The hand-off is a mutex-guarded
//! vector plus an atomic has-tasks flag and the poller's waker; the worker
//! never touches loop state and the loop never blocks on the worker.
//!
//! Cancellation is best-effort: [`WorkRequest::cancel`] succeeds only while
//! the work is still queued. A canceled request still receives its
//! completion callback, with `Err(WorkError::Canceled)`.

use std::any::Any;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::error::AnyError;
use crate::error::Error;
use crate::reactor::EventLoop;
use crate::reactor::LoopInner;

/// Default number of worker threads, spawned lazily on first use.
const DEFAULT_POOL_SIZE: usize = 4;

/// Why a unit of work produced no result.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
  /// The request was canceled before the work started.
  #[error("work request canceled")]
  Canceled,
  /// The work closure returned an error.
  #[error(transparent)]
  Failed(AnyError),
}

// Work request lifecycle, advanced with compare-and-swap so `cancel` and
// the worker race deterministically.
const WORK_QUEUED: u8 = 0;
const WORK_RUNNING: u8 = 1;
const WORK_DONE: u8 = 2;
const WORK_CANCELED: u8 = 3;

struct WorkShared {
  state: AtomicU8,
}

/// Tracks one queued unit of work. Dropping the request does not cancel it.
#[derive(Clone)]
pub struct WorkRequest {
  shared: Arc<WorkShared>,
}

impl WorkRequest {
  /// Best-effort cancel. Returns `true` only if the work had not started;
  /// a request already running or completed keeps its outcome.
  pub fn cancel(&self) -> bool {
    self
      .shared
      .state
      .compare_exchange(
        WORK_QUEUED,
        WORK_CANCELED,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
  }

  /// True once the completion callback's result is determined (done or
  /// canceled), though the callback itself may not have run yet.
  pub fn is_settled(&self) -> bool {
    matches!(
      self.shared.state.load(Ordering::Acquire),
      WORK_DONE | WORK_CANCELED
    )
  }
}

type WorkPayload = Result<Box<dyn Any + Send>, WorkError>;
type DoneWrapper = Box<dyn FnOnce(&EventLoop, WorkPayload) -> Result<(), AnyError>>;

/// Cross-thread completion queue: workers push, the loop thread drains once
/// per iteration after the poll step.
pub(crate) struct CompletionQueue {
  completions: Mutex<Vec<(u64, WorkPayload)>>,
  has_tasks: AtomicBool,
  waker: Arc<mio::Waker>,
}

impl CompletionQueue {
  pub fn new(waker: Arc<mio::Waker>) -> Self {
    Self {
      completions: Mutex::new(Vec::new()),
      has_tasks: AtomicBool::new(false),
      waker,
    }
  }

  fn push(&self, id: u64, payload: WorkPayload) {
    self.completions.lock().push((id, payload));
    self.has_tasks.store(true, Ordering::SeqCst);
    let _ = self.waker.wake();
  }

  pub fn has_pending(&self) -> bool {
    self.has_tasks.load(Ordering::SeqCst)
  }

  fn drain(&self) -> Vec<(u64, WorkPayload)> {
    if !self.has_tasks.swap(false, Ordering::SeqCst) {
      return Vec::new();
    }
    std::mem::take(&mut *self.completions.lock())
  }
}

type Job = Box<dyn FnOnce() + Send>;

struct PoolQueue {
  jobs: Mutex<(VecDeque<Job>, bool)>,
  available: Condvar,
}

/// Fixed-size worker pool. Workers exit when the owning loop drops.
struct ThreadPool {
  queue: Arc<PoolQueue>,
  workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPool {
  fn new(size: usize) -> Self {
    let queue = Arc::new(PoolQueue {
      jobs: Mutex::new((VecDeque::new(), false)),
      available: Condvar::new(),
    });
    let workers = (0..size)
      .map(|i| {
        let queue = queue.clone();
        std::thread::Builder::new()
          .name(format!("loop-worker-{i}"))
          .spawn(move || loop {
            let job = {
              let mut guard = queue.jobs.lock();
              loop {
                if let Some(job) = guard.0.pop_front() {
                  break job;
                }
                if guard.1 {
                  return;
                }
                queue.available.wait(&mut guard);
              }
            };
            job();
          })
          .expect("failed to spawn worker thread")
      })
      .collect();
    Self { queue, workers }
  }

  fn submit(&self, job: Job) {
    self.queue.jobs.lock().0.push_back(job);
    self.queue.available.notify_one();
  }
}

impl Drop for ThreadPool {
  fn drop(&mut self) {
    self.queue.jobs.lock().1 = true;
    self.queue.available.notify_all();
    for worker in self.workers.drain(..) {
      let _ = worker.join();
    }
  }
}

/// Loop-side work bookkeeping: the lazily spawned pool plus the completion
/// wrappers keyed by request id. Wrappers are `!Send` and never leave the
/// loop thread; only the opaque payload crosses threads.
#[derive(Default)]
pub(crate) struct WorkState {
  pool: Option<ThreadPool>,
  pending: HashMap<u64, DoneWrapper>,
  next_id: u64,
}

impl WorkState {
  pub fn has_pending(&self) -> bool {
    !self.pending.is_empty()
  }
}

impl EventLoop {
  /// Submit `work` to a worker thread; `done` runs later on the loop thread
  /// with the result. The work closure must be self-contained (`Send`) --
  /// loop and handle state is only touchable from `done`.
  pub fn queue_work<T, W, D>(&self, work: W, done: D) -> Result<WorkRequest, Error>
  where
    T: Send + 'static,
    W: FnOnce() -> Result<T, AnyError> + Send + 'static,
    D: FnOnce(&EventLoop, Result<T, WorkError>) -> Result<(), AnyError> + 'static,
  {
    let inner = self.inner();
    if inner.is_closed() {
      return Err(Error::LoopGone);
    }
    let shared = Arc::new(WorkShared {
      state: AtomicU8::new(WORK_QUEUED),
    });

    let id = {
      let mut work_state = inner.work.borrow_mut();
      let id = work_state.next_id;
      work_state.next_id += 1;
      work_state.pending.insert(
        id,
        Box::new(move |lp, payload| {
          let result = payload.map(|boxed| {
            // The payload for id N is always the T produced by work N.
            *boxed.downcast::<T>().expect("work payload type mismatch")
          });
          done(lp, result)
        }),
      );
      id
    };

    let completions = inner.completions.clone();
    let job_shared = shared.clone();
    let job: Job = Box::new(move || {
      let claimed = job_shared.state.compare_exchange(
        WORK_QUEUED,
        WORK_RUNNING,
        Ordering::AcqRel,
        Ordering::Acquire,
      );
      if claimed.is_err() {
        // Canceled while queued; still owes its completion callback.
        completions.push(id, Err(WorkError::Canceled));
        return;
      }
      // Contain panics to the job: a poisoned worker thread would strand
      // every later completion and hang the loop.
      let outcome =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(work));
      let payload = match outcome {
        Ok(Ok(value)) => Ok(Box::new(value) as Box<dyn Any + Send>),
        Ok(Err(err)) => Err(WorkError::Failed(err)),
        Err(_) => {
          Err(WorkError::Failed(anyhow::anyhow!("work closure panicked")))
        }
      };
      job_shared.state.store(WORK_DONE, Ordering::Release);
      completions.push(id, payload);
    });

    let mut work_state = inner.work.borrow_mut();
    work_state
      .pool
      .get_or_insert_with(|| ThreadPool::new(DEFAULT_POOL_SIZE))
      .submit(job);
    Ok(WorkRequest { shared })
  }
}

impl LoopInner {
  /// Dispatch completions marshalled from worker threads. Runs on the loop
  /// thread as part of the poll step's callback dispatch.
  pub(crate) fn drain_completions(self: &Rc<Self>) {
    let batch = self.completions.drain();
    if batch.is_empty() {
      return;
    }
    let lp = EventLoop::from_inner(self.clone());
    for (id, payload) in batch {
      let wrapper = self.work.borrow_mut().pending.remove(&id);
      let Some(wrapper) = wrapper else {
        continue;
      };
      if let Err(err) = wrapper(&lp, payload) {
        self.report(err);
      }
    }
  }
}

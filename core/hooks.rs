// Copyright 2018-2025 the Spindle authors. MIT license.

//! Per-iteration phase hooks.
//!
//! Idle and prepare hooks run once per iteration before the poll step,
//! check hooks after it. While any idle hook is active the poll timeout is
//! forced to zero, so idle handles effectively turn the loop into a busy
//! loop -- callers are expected to stop them when there is nothing to do.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use crate::error::AnyError;
use crate::error::Error;
use crate::event_loop::PhaseQueues;
use crate::handle::invoke_callback;
use crate::handle::Handle;
use crate::handle::HandleCore;
use crate::handle::HandleKind;
use crate::handle::HandleOps;
use crate::reactor::EventLoop;
use crate::reactor::LoopInner;

macro_rules! phase_hook {
  (
    $(#[$docs:meta])*
    $name:ident, $inner:ident, $list:ident, $kind:expr
  ) => {
    pub(crate) struct $inner {
      core: HandleCore,
      me: Weak<$inner>,
      cb: RefCell<Option<Box<dyn FnMut(&$name) -> Result<(), AnyError>>>>,
    }

    $(#[$docs])*
    #[derive(Clone)]
    pub struct $name {
      inner: Rc<$inner>,
    }

    impl $name {
      pub fn new(lp: &EventLoop) -> Result<$name, Error> {
        let inner = lp.inner().register(|id, owner| {
          Rc::new_cyclic(|me| $inner {
            core: HandleCore::new($kind, id, owner),
            me: me.clone(),
            cb: RefCell::new(None),
          })
        })?;
        Ok($name { inner })
      }

      /// Start running the hook once per loop iteration. Starting an
      /// already-started hook just replaces its callback.
      pub fn start(
        &self,
        cb: impl FnMut(&$name) -> Result<(), AnyError> + 'static,
      ) -> Result<(), Error> {
        let core = &self.inner.core;
        core.check_open()?;
        let lp = core.loop_inner()?;
        *self.inner.cb.borrow_mut() = Some(Box::new(cb));
        if !core.is_active() {
          core.set_active(true);
          core.op_begin();
          lp.queues.$list.borrow_mut().push(core.id());
        }
        Ok(())
      }

      /// Stop the hook. Stopping an inactive hook is a no-op.
      pub fn stop(&self) -> Result<(), Error> {
        let core = &self.inner.core;
        core.check_open()?;
        let lp = core.loop_inner()?;
        self.inner.detach(&lp);
        Ok(())
      }
    }

    impl Handle for $name {
      fn core(&self) -> &HandleCore {
        &self.inner.core
      }
    }

    impl $inner {
      fn detach(&self, lp: &Rc<LoopInner>) {
        if !self.core.is_active() {
          return;
        }
        PhaseQueues::remove_from(&lp.queues.$list, self.core.id());
        self.core.set_active(false);
        self.core.op_end();
      }
    }

    impl HandleOps for $inner {
      fn core(&self) -> &HandleCore {
        &self.core
      }

      fn teardown(&self, lp: &Rc<LoopInner>) {
        self.detach(lp);
        self.cb.borrow_mut().take();
      }

      fn on_phase(&self, lp: &Rc<LoopInner>) {
        let Some(me) = self.me.upgrade() else {
          return;
        };
        let public = $name { inner: me };
        invoke_callback!(lp, self.core, self.cb, &public);
      }
    }
  };
}

phase_hook! {
  /// Hook that runs once per iteration, before prepare hooks and the poll
  /// step. An active idle handle forces a zero poll timeout.
  Idle, IdleInner, idle, HandleKind::Idle
}

phase_hook! {
  /// Hook that runs once per iteration, immediately before the poll step.
  Prepare, PrepareInner, prepare, HandleKind::Prepare
}

phase_hook! {
  /// Hook that runs once per iteration, immediately after the poll step.
  Check, CheckInner, check, HandleKind::Check
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::event_loop::RunMode;
  use crate::timers::Timer;
  use std::cell::Cell;

  #[test]
  fn prepare_runs_before_check_every_iteration() {
    let lp = EventLoop::new().unwrap();
    let log: Rc<RefCell<Vec<&'static str>>> = Default::default();

    let prep = Prepare::new(&lp).unwrap();
    {
      let log = log.clone();
      prep
        .start(move |_| {
          log.borrow_mut().push("prepare");
          Ok(())
        })
        .unwrap();
    }
    let check = Check::new(&lp).unwrap();
    {
      let log = log.clone();
      check
        .start(move |_| {
          log.borrow_mut().push("check");
          Ok(())
        })
        .unwrap();
    }
    let timer = Timer::new(&lp).unwrap();
    {
      let log = log.clone();
      timer
        .start(
          move |_| {
            log.borrow_mut().push("timer");
            Ok(())
          },
          0,
          0,
        )
        .unwrap();
    }

    lp.run(RunMode::NoWait).unwrap();
    assert_eq!(*log.borrow(), vec!["timer", "prepare", "check"]);
  }

  #[test]
  fn idle_forces_busy_iterations_until_stopped() {
    let lp = EventLoop::new().unwrap();
    let spins = Rc::new(Cell::new(0u32));
    let idle = Idle::new(&lp).unwrap();
    {
      let spins = spins.clone();
      let idle2 = idle.clone();
      idle
        .start(move |_| {
          spins.set(spins.get() + 1);
          if spins.get() == 3 {
            idle2.stop()?;
          }
          Ok(())
        })
        .unwrap();
    }
    // Exits promptly: once the idle hook stops, nothing is alive.
    assert!(!lp.run(RunMode::Default).unwrap());
    assert_eq!(spins.get(), 3);
    assert!(!idle.is_active());
  }

  #[test]
  fn stopping_a_hook_is_idempotent_but_closing_is_not() {
    let lp = EventLoop::new().unwrap();
    let idle = Idle::new(&lp).unwrap();
    idle.start(|_| Ok(())).unwrap();
    idle.stop().unwrap();
    idle.stop().unwrap();
    idle.close(None).unwrap();
    assert!(matches!(idle.stop(), Err(Error::HandleClosed)));
    assert!(matches!(idle.close(None), Err(Error::HandleClosed)));
    lp.run(RunMode::NoWait).unwrap();
    assert!(idle.is_closed());
  }
}

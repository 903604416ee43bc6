// Copyright 2018-2025 the Spindle authors. MIT license.

//! A single-threaded cooperative event-loop reactor.
//!
//! One [`EventLoop`] multiplexes heterogeneous event sources -- timers,
//! sockets, pipes, signals, per-iteration hooks, worker-pool completions --
//! into a single ordered callback stream. Handles own a reference-counted
//! lifecycle across asynchronous completions, with a close protocol that
//! defers finalization to a dedicated pass so no callback ever observes a
//! half-destroyed handle.
//!
//! ```no_run
//! use spindle_core::{EventLoop, Handle, RunMode, Timer};
//!
//! let lp = EventLoop::new()?;
//! let timer = Timer::new(&lp)?;
//! timer.start(
//!   |t| {
//!     println!("tick");
//!     t.close(None)?;
//!     Ok(())
//!   },
//!   100,
//!   0,
//! )?;
//! lp.run(RunMode::Default)?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Loops and handles are deliberately `!Send`: the reactor model is
//! single-threaded, and the only cross-thread entry points are
//! [`AsyncSender::send`], [`WorkRequest::cancel`], and the worker-pool
//! completion queue behind [`EventLoop::queue_work`].

mod async_handle;
mod error;
mod event_loop;
mod handle;
mod hooks;
mod pipe;
mod poll_watch;
mod poller;
mod reactor;
mod signal;
mod stream;
mod tasks;
mod tcp;
mod timers;
mod udp;

pub use async_handle::Async;
pub use async_handle::AsyncSender;
pub use error::AnyError;
pub use error::Errno;
pub use error::Error;
pub use event_loop::LoopPhase;
pub use event_loop::RunMode;
pub use handle::CloseCallback;
pub use handle::Handle;
pub use handle::HandleId;
pub use handle::HandleKind;
pub use hooks::Check;
pub use hooks::Idle;
pub use hooks::Prepare;
#[cfg(unix)]
pub use pipe::Pipe;
#[cfg(unix)]
pub use pipe::PipeConnectCallback;
#[cfg(unix)]
pub use pipe::PipeConnectionCallback;
#[cfg(unix)]
pub use pipe::PipeListener;
#[cfg(unix)]
pub use pipe::PipeReadCallback;
#[cfg(unix)]
pub use poll_watch::PollCallback;
#[cfg(unix)]
pub use poll_watch::PollWatcher;
pub use poller::Readiness;
pub use poller::READABLE;
pub use poller::WRITABLE;
pub use reactor::ErrorHook;
pub use reactor::EventLoop;
#[cfg(unix)]
pub use signal::Signal;
#[cfg(unix)]
pub use signal::SignalCallback;
pub use stream::ReadEvent;
pub use stream::WriteCallback;
pub use tasks::WorkError;
pub use tasks::WorkRequest;
pub use tcp::ConnectCallback;
pub use tcp::ConnectionCallback;
pub use tcp::TcpListener;
pub use tcp::TcpReadCallback;
pub use tcp::TcpStream;
pub use timers::Timer;
pub use timers::TimerCallback;
pub use udp::RecvCallback;
pub use udp::SendCallback;
pub use udp::UdpSocket;

// The reactor model is single-threaded by construction.
static_assertions::assert_not_impl_any!(EventLoop: Send, Sync);
static_assertions::assert_not_impl_any!(Timer: Send, Sync);
static_assertions::assert_not_impl_any!(TcpStream: Send, Sync);
static_assertions::assert_impl_all!(AsyncSender: Send, Sync);
static_assertions::assert_impl_all!(WorkRequest: Send, Sync);

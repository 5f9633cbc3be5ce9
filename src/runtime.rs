//! The cooperative, single-threaded event loop each task runs on its own
//! thread: start-up handshake with the coordinator, then a steady-state
//! `mio::Poll` loop over the signal back-channel and the task's own sources.

use std::sync::Arc;

use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::dispatch::{self, PacketHandler};
use crate::error::{Error, Result};
use crate::ring::SharedRing;
use crate::signal::{Signal, TaskSide};
use crate::stats::DispatchStats;
use crate::task::{SeqState, TaskDescriptor};

const SIGNAL_TOKEN: Token = Token(0);
/// First token a task may use for its own sources (client socket, etc).
pub const FIRST_TASK_TOKEN: usize = 1;

/// Implemented by the two built-in tasks. The runtime owns the event loop;
/// a `Task` owns everything downstream of "a frame was dispatched" or "the
/// client socket is readable".
pub trait Task: PacketHandler {
    /// Allocates scratch buffers, binds the client-facing socket if any.
    /// Returning `Err` aborts start-up and sends `DIED` instead of `INIT`.
    fn init(&mut self) -> Result<()>;

    /// Registers any sources beyond the signal channel, using tokens
    /// starting at [`FIRST_TASK_TOKEN`].
    fn register(&mut self, poll: &Poll) -> Result<()>;

    /// Called when one of the task's own registered sources is ready. `poll`
    /// is handed back in so a task may register newly-accepted sockets
    /// (e.g. a client connection accepted off a listener) without the
    /// runtime needing to know about them.
    fn on_ready(&mut self, token: Token, ready: Ready, poll: &Poll) -> Result<()>;

    /// Runs once, before the task thread exits (on `STOP` or fatal error).
    fn finalize(&mut self);

    /// Initial value of the task descriptor's `active` flag.
    fn autoactivate(&self) -> bool {
        false
    }
}

/// Drives one task's thread body: the start-up handshake followed by the
/// steady-state loop. Blocks until `STOP` or a fatal error.
pub fn run<T: Task>(
    rings: Vec<SharedRing>,
    desc: Arc<TaskDescriptor>,
    signals: TaskSide,
    mut task: T,
) {
    let TaskSide {
        from_coordinator,
        to_coordinator,
    } = signals;

    if let Err(e) = task.init() {
        error!("task {} failed to initialize: {}", desc.id, e);
        let _ = to_coordinator.send(Signal::Died);
        return;
    }

    let poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            error!("task {} failed to create poll: {}", desc.id, e);
            let _ = to_coordinator.send(Signal::Died);
            return;
        }
    };

    if poll
        .register(&from_coordinator, SIGNAL_TOKEN, Ready::readable(), PollOpt::edge())
        .is_err()
        || task.register(&poll).is_err()
    {
        let _ = to_coordinator.send(Signal::Died);
        return;
    }

    if let Err(e) = to_coordinator.send(Signal::Init) {
        error!("task {} could not report INIT: {}", desc.id, e);
        return;
    }

    let mut seq = SeqState::default();
    let mut stats = DispatchStats::default();
    let mut events = Events::with_capacity(16);

    'outer: loop {
        if let Err(e) = poll.poll(&mut events, None) {
            error!("task {} poll failed: {}", desc.id, e);
            break;
        }

        for event in events.iter() {
            if event.token() == SIGNAL_TOKEN {
                for sig in from_coordinator.drain() {
                    match sig {
                        Signal::Stop => break 'outer,
                        Signal::Wakeup => {
                            desc.set_busy(true);
                            let fatal = dispatch::on_wakeup(&rings, &desc, &mut seq, &mut stats, &mut task);
                            desc.set_busy(false);
                            if fatal {
                                task.finalize();
                                let _ = to_coordinator.send(Signal::Died);
                                return;
                            }
                        }
                        Signal::Init | Signal::Died => {
                            // these only ever flow the other direction
                        }
                    }
                }
            } else if let Err(e) = task.on_ready(event.token(), event.readiness(), &poll) {
                warn!("task {} source error: {}", desc.id, e);
                if let Error::Protocol { .. } = e {
                    continue;
                }
                task.finalize();
                let _ = to_coordinator.send(Signal::Died);
                return;
            }
        }
    }

    task.finalize();
}

/// Coordinator-side convenience: broadcast `WAKEUP` to every eligible task.
pub fn wakeup_eligible<'a>(handles: impl Iterator<Item = &'a crate::task::TaskHandle>) {
    for h in handles {
        let _ = h.wake_if_eligible();
    }
}

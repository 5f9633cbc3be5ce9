//! The four-signal back-channel between the coordinator and a task.
//!
//! Signals carry no payload beyond their kind; delivery is via a
//! `crossbeam_channel`, and readiness is surfaced to whichever `mio::Poll`
//! is waiting on the receiving end through a `mio::Registration` pair, the
//! same technique used elsewhere to surface a raw fd's readiness to `mio`.

use std::io;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::{Evented, Poll, PollOpt, Ready, SetReadiness, Token};

/// One of the four signal kinds on the coordinator-task channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Task → coordinator: private initializer succeeded.
    Init,
    /// Coordinator → task: shut down.
    Stop,
    /// Task → coordinator: fatal error, terminate.
    Died,
    /// Coordinator → task: new frames may be available.
    Wakeup,
}

/// The sending half of one direction of the back-channel.
#[derive(Clone)]
pub struct SignalSender {
    tx: Sender<Signal>,
    set_readiness: SetReadiness,
}

impl SignalSender {
    pub fn send(&self, sig: Signal) -> io::Result<()> {
        self.tx
            .send(sig)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        self.set_readiness.set_readiness(Ready::readable())
    }
}

/// The receiving half, registerable with a `mio::Poll`.
pub struct SignalReceiver {
    rx: Receiver<Signal>,
    registration: mio::Registration,
}

impl SignalReceiver {
    /// Drains and returns every signal currently queued.
    pub fn drain(&self) -> Vec<Signal> {
        self.rx.try_iter().collect()
    }

    /// True if there is nothing queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocks until a signal arrives. Used only for the start-up handshake,
    /// before the coordinator has anything registered with `mio::Poll`.
    pub fn recv(&self) -> Option<Signal> {
        self.rx.recv().ok()
    }
}

impl Evented for SignalReceiver {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        self.registration.register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        self.registration.reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        self.registration.deregister(poll)
    }
}

/// Builds one direction of the channel: a sender the caller keeps, and a
/// pollable receiver for the other end.
pub fn channel() -> (SignalSender, SignalReceiver) {
    let (registration, set_readiness) = mio::Registration::new2();
    let (tx, rx) = unbounded();
    (
        SignalSender { tx, set_readiness },
        SignalReceiver { rx, registration },
    )
}

/// The coordinator's half of a task's back-channel: send `WAKEUP`/`STOP`,
/// receive `DIED`.
pub struct CoordinatorSide {
    pub to_task: SignalSender,
    pub from_task: SignalReceiver,
}

/// The task thread's half: receive `WAKEUP`/`STOP`, send `INIT`/`DIED`.
pub struct TaskSide {
    pub from_coordinator: SignalReceiver,
    pub to_coordinator: SignalSender,
}

/// Builds both halves of a coordinator↔task back-channel at task spawn time.
pub fn signal_pair() -> (CoordinatorSide, TaskSide) {
    let (to_task, from_coordinator) = channel();
    let (to_coordinator, from_task) = channel();
    (
        CoordinatorSide { to_task, from_task },
        TaskSide { from_coordinator, to_coordinator },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, PollOpt, Ready, Token};

    #[test]
    fn signal_wakes_a_registered_poll() {
        let (tx, rx) = channel();
        let poll = Poll::new().unwrap();
        poll.register(&rx, Token(0), Ready::readable(), PollOpt::edge()).unwrap();

        tx.send(Signal::Wakeup).unwrap();

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, None).unwrap();
        assert_eq!(events.iter().count(), 1);
        assert_eq!(rx.drain(), vec![Signal::Wakeup]);
    }
}

//! The per-task descriptor shared between a task thread and the coordinator.
//!
//! Per the concurrency model, a task writes its own `heads`, `busy`, `error`
//! and `active`; the coordinator only ever reads `active` and `heads`. Both
//! sides tolerate a stale read of the other's fields, so every field here is
//! an individually relaxed atomic rather than anything mutex-guarded.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::signal::{SignalReceiver, SignalSender};

/// Shared cross-thread state for one task. `Arc`'d between the task thread
/// and the coordinator's bookkeeping.
pub struct TaskDescriptor {
    pub id: usize,
    heads: Vec<AtomicU32>,
    active: AtomicBool,
    busy: AtomicBool,
    error: AtomicBool,
}

impl TaskDescriptor {
    pub fn new(id: usize, num_rings: u32, autoactivate: bool) -> Self {
        TaskDescriptor {
            id,
            heads: (0..num_rings).map(|_| AtomicU32::new(0)).collect(),
            active: AtomicBool::new(autoactivate),
            busy: AtomicBool::new(false),
            error: AtomicBool::new(false),
        }
    }

    pub fn num_rings(&self) -> u32 {
        self.heads.len() as u32
    }

    pub fn head(&self, ring: u32) -> u32 {
        self.heads[ring as usize].load(Ordering::Relaxed)
    }

    pub fn set_head(&self, ring: u32, idx: u32) {
        self.heads[ring as usize].store(idx, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    pub fn set_error(&self, error: bool) {
        self.error.store(error, Ordering::Relaxed);
    }
}

/// The coordinator's handle to a spawned task: the shared descriptor, the
/// signal directions it owns, and the join handle reclaimed at shutdown.
pub struct TaskHandle {
    pub descriptor: Arc<TaskDescriptor>,
    pub to_task: SignalSender,
    pub from_task: SignalReceiver,
    pub join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn wake_if_eligible(&self) -> ::std::io::Result<()> {
        if self.descriptor.is_active() && !self.descriptor.is_busy() {
            self.to_task.send(crate::signal::Signal::Wakeup)?;
        }
        Ok(())
    }
}

/// Per-task sequence-tracking state, owned exclusively by the task thread
/// (never read cross-thread, so plain `Cell`-style fields suffice).
#[derive(Default, Clone, Copy)]
pub struct SeqState {
    pub prev_fseq: u16,
    pub prev_pseq_mca: u16,
    pub prev_pseq_trace: u16,
    pub prev_pseq_pulse: u16,
}

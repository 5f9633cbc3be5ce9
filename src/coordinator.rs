//! The coordinator thread: owns the NIC and its rings, starts the worker
//! tasks, and runs the per-readiness ring-retirement algorithm whenever the
//! NIC file descriptor goes readable.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::nic::Nic;
use crate::ring::{RingManager, RingReader, SharedRing};
use crate::runtime::{self, Task};
use crate::seq;
use crate::signal::{self, Signal};
use crate::stats::CoordinatorStats;
use crate::task::{TaskDescriptor, TaskHandle};

const NIC_TOKEN: Token = Token(usize::max_value());

/// Owns the capture side of the process: the NIC handle, the per-ring
/// atomic indices, and the tasks draining them.
pub struct Coordinator {
    nic: Box<dyn Nic>,
    rings: Vec<SharedRing>,
    handles: Vec<TaskHandle>,
    stats: CoordinatorStats,
    config: Config,
}

impl Coordinator {
    pub fn new(nic: Box<dyn Nic>, config: Config) -> Self {
        let rings = (0..nic.rx_ring_count()).map(|i| nic.rx_ring(i)).collect();
        Coordinator {
            nic,
            rings,
            handles: Vec::new(),
            stats: CoordinatorStats::default(),
            config,
        }
    }

    /// Spawns a task built by `make_task` on its own thread and waits for its
    /// `INIT` handshake. `make_task` receives the task's own shared
    /// descriptor so the task can flip its `active` bit from within its
    /// packet or client handler (e.g. the writer task clearing `active` once
    /// a job's tick count is reached).
    pub fn start_task<T, F>(&mut self, autoactivate: bool, make_task: F) -> Result<()>
    where
        T: Task + Send + 'static,
        F: FnOnce(Arc<TaskDescriptor>) -> T + Send + 'static,
    {
        let id = self.handles.len();
        let num_rings = self.rings.len() as u32;
        let descriptor = Arc::new(TaskDescriptor::new(id, num_rings, autoactivate));
        let (coord_side, task_side) = signal::signal_pair();
        let rings = self.rings.clone();
        let desc_for_thread = Arc::clone(&descriptor);

        let join = thread::Builder::new()
            .name(format!("task-{}", id))
            .spawn(move || {
                let task = make_task(Arc::clone(&desc_for_thread));
                runtime::run(rings, desc_for_thread, task_side, task)
            })
            .map_err(|e| Error::TaskInit { inner: e.to_string() })?;

        match coord_side.from_task.recv() {
            Some(Signal::Init) => {}
            Some(Signal::Died) | None => {
                let _ = join.join();
                return Err(Error::TaskInit { inner: format!("task {} failed to start", id) });
            }
            Some(other) => {
                warn!("task {} sent unexpected start-up signal {:?}", id, other);
            }
        }

        self.handles.push(TaskHandle {
            descriptor,
            to_task: coord_side.to_task,
            from_task: coord_side.from_task,
            join: Some(join),
        });
        Ok(())
    }

    /// Runs the coordinator's event loop until a `STOP` is requested
    /// externally (by returning `Ok` from this function's caller dropping
    /// it) or every task has died.
    pub fn run(mut self) -> Result<()> {
        let poll = Poll::new()?;
        poll.register(&EventedFd(&self.nic.fd()), NIC_TOKEN, Ready::readable(), PollOpt::edge())?;

        let mut events = Events::with_capacity(16);
        let mut last_report = Instant::now();
        let mut alive = vec![true; self.handles.len()];

        loop {
            let timeout = self.config.stats_period.and_then(|period| period.checked_sub(last_report.elapsed()));
            if self.config.stats_period.is_some() && timeout.is_none() {
                self.report_stats();
                last_report = Instant::now();
            }

            poll.poll(&mut events, timeout.or(self.config.stats_period))?;

            for event in events.iter() {
                if event.token() == NIC_TOKEN {
                    self.on_nic_readable();
                }
            }

            for (i, h) in self.handles.iter().enumerate() {
                if h.from_task.drain().into_iter().any(|s| s == Signal::Died) {
                    warn!("task {} died", h.descriptor.id);
                    alive[i] = false;
                }
            }

            if !alive.is_empty() && alive.iter().all(|a| !a) {
                break;
            }
        }

        self.shutdown();
        Ok(())
    }

    /// The per-readiness algorithm of 4.D: compute the slowest active head per
    /// ring, broadcast `WAKEUP`, then retire slots up to that head.
    fn on_nic_readable(&mut self) {
        let num_rings = self.rings.len() as u32;

        let global_heads: Vec<u32> = (0..num_rings)
            .map(|r| self.global_head(r))
            .collect();

        runtime::wakeup_eligible(self.handles.iter());

        for (r, ring) in self.rings.iter_mut().enumerate() {
            let old_head = ring.head();
            let new_head = global_heads[r];
            let tail = ring.tail();

            if old_head == tail {
                self.stats.skipped += 1;
                continue;
            }

            let new_count = (new_head + ring.num_bufs() - old_head) % ring.num_bufs();
            if new_count > 0 {
                let a = ring.buf_at(old_head).map(|b| Frame::new(b).frame_seq());
                let b_idx = ring.preceding(new_head);
                let b = ring.buf_at(b_idx).map(|b| Frame::new(b).frame_seq());
                if let (Some(a), Some(b)) = (a, b) {
                    let span = seq::distance(a, b);
                    self.stats.received += new_count as u64;
                    self.stats.missed += (span as u32 + 1).saturating_sub(new_count) as u64;
                }
            }

            ring.release_to(new_head);
            self.stats.polled += 1;
        }
    }

    /// `global_head[r]` per 4.D.1: the earliest active task's head, or the
    /// ring's own tail if no task is active (free everything).
    fn global_head(&self, r: u32) -> u32 {
        let ring = &self.rings[r as usize];
        let mut chosen: Option<u32> = None;
        for h in &self.handles {
            if !h.descriptor.is_active() {
                continue;
            }
            let head = h.descriptor.head(r);
            chosen = Some(match chosen {
                Some(c) => ring.earlier_id(c, head),
                None => head,
            });
        }
        chosen.unwrap_or_else(|| ring.tail())
    }

    fn report_stats(&self) {
        info!(
            "coordinator stats: received={} missed={} polled={} skipped={}",
            self.stats.received, self.stats.missed, self.stats.polled, self.stats.skipped
        );
    }

    fn shutdown(mut self) {
        for h in &self.handles {
            let _ = h.to_task.send(Signal::Stop);
        }
        for h in &mut self.handles {
            if let Some(join) = h.join.take() {
                let _ = join.join();
            }
        }
        self.nic.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Continue, PacketHandler};
    use crate::nic::FakeNic;
    use mio::Token as MioToken;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    struct CountingTask {
        seen: StdArc<AtomicUsize>,
    }

    impl PacketHandler for CountingTask {
        fn handle(&mut self, _frame: Frame, _gap: u16) -> Continue {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Continue::More
        }
    }

    impl Task for CountingTask {
        fn init(&mut self) -> Result<()> {
            Ok(())
        }
        fn register(&mut self, _poll: &Poll) -> Result<()> {
            Ok(())
        }
        fn on_ready(&mut self, _token: MioToken, _ready: Ready, _poll: &Poll) -> Result<()> {
            Ok(())
        }
        fn finalize(&mut self) {}
        fn autoactivate(&self) -> bool {
            true
        }
    }

    #[test]
    fn global_head_frees_everything_with_no_active_tasks() {
        let nic = FakeNic::new(1, 8, 64).unwrap();
        nic.inject(0, &[0u8; 32]);
        let config = Config::new("fake0", std::env::temp_dir());
        let coord = Coordinator::new(Box::new(nic), config);
        assert_eq!(coord.global_head(0), coord.rings[0].tail());
    }

    #[test]
    fn start_task_registers_handle_after_init_handshake() {
        let nic = FakeNic::new(1, 8, 64).unwrap();
        let config = Config::new("fake0", std::env::temp_dir());
        let mut coord = Coordinator::new(Box::new(nic), config);
        let seen = StdArc::new(AtomicUsize::new(0));
        coord.start_task(true, move |_desc| CountingTask { seen }).unwrap();
        assert_eq!(coord.handles.len(), 1);
        assert!(coord.handles[0].descriptor.is_active());
        let _ = coord.handles[0].to_task.send(Signal::Stop);
        if let Some(join) = coord.handles[0].join.take() {
            let _ = join.join();
        }
    }
}

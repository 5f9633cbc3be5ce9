//! Accounting counters kept by the coordinator and by each task's dispatch
//! loop. None of these affect control flow; they exist purely for the
//! periodic statistics report and for tests asserting on drop/miss counts.

#[derive(Default, Debug, Clone, Copy)]
pub struct CoordinatorStats {
    pub received: u64,
    pub missed: u64,
    pub polled: u64,
    pub skipped: u64,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct DispatchStats {
    pub inactive_wakeups: u64,
    pub false_wakeups: u64,
    pub dropped_invalid: u64,
    pub dispatched: u64,
}

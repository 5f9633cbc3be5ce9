//! Read-only and manager views over a single kernel-bypass receive ring.
//!
//! A ring is a fixed array of `num_bufs()` buffers. Three indices advance
//! modulo `num_bufs()`: `head` (oldest slot not yet released to the NIC),
//! `cur` (next slot to inspect) and `tail` (one past the newest filled slot).
//! Exactly one manager mutates `head`/`cur`; any number of readers may read
//! slot bytes in `[head, tail)` concurrently with the manager.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Read-only operations any task may perform on a ring, concurrently with
/// the coordinator's manager view and with other tasks.
pub trait RingReader {
    fn num_bufs(&self) -> u32;
    fn head(&self) -> u32;
    fn cur(&self) -> u32;
    fn tail(&self) -> u32;

    /// The slot immediately after `idx`, wrapping at `num_bufs()`.
    fn following(&self, idx: u32) -> u32 {
        (idx + 1) % self.num_bufs()
    }

    /// The slot immediately before `idx`, wrapping at `num_bufs()`.
    fn preceding(&self, idx: u32) -> u32 {
        (idx + self.num_bufs() - 1) % self.num_bufs()
    }

    /// Bytes of the slot at `idx`, or `None` if `idx` lies outside `[head, tail)`.
    fn buf_at(&self, idx: u32) -> Option<&[u8]>;

    /// `a.cmp(b)` relative to forward distance from the current `head`.
    /// `Ordering::Less` means `a` is closer to head. Ties on raw equality are
    /// `Equal`; otherwise the index on the same side as `head` (i.e. not yet
    /// wrapped) wins, and among two indices on the same side the numerically
    /// smaller one wins.
    fn compare_ids(&self, a: u32, b: u32) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let head = self.head();
        let a_ahead = a >= head;
        let b_ahead = b >= head;
        if a_ahead == b_ahead {
            a.cmp(&b)
        } else if a_ahead {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Whichever of `a`, `b` is closer to `head`.
    fn earlier_id(&self, a: u32, b: u32) -> u32 {
        match self.compare_ids(a, b) {
            Ordering::Greater => b,
            _ => a,
        }
    }

    /// Whichever of `a`, `b` is further from `head`.
    fn later_id(&self, a: u32, b: u32) -> u32 {
        match self.compare_ids(a, b) {
            Ordering::Greater => a,
            _ => b,
        }
    }

    /// Number of filled-but-uninspected slots, `[cur, tail)`.
    fn pending(&self) -> u32 {
        (self.tail() + self.num_bufs() - self.cur()) % self.num_bufs()
    }

    /// Number of inspected-but-unreleased slots, `[head, cur)`.
    fn done(&self) -> u32 {
        (self.cur() + self.num_bufs() - self.head()) % self.num_bufs()
    }

    /// Total filled slots, `[head, tail)`.
    fn total(&self) -> u32 {
        (self.tail() + self.num_bufs() - self.head()) % self.num_bufs()
    }
}

/// The sole mutator of a ring's `head`/`cur`. Owned by the coordinator.
pub trait RingManager: RingReader {
    /// Moves `cur` to `idx`. Refuses (no-op) if `idx` would move `cur` behind
    /// `head` or ahead of `tail` in forward distance.
    fn set_cur(&mut self, idx: u32);

    /// Moves `head` to `idx`, releasing slots in `[old_head, idx)` back to
    /// the NIC. Refuses if `idx` is ahead of `cur` in forward distance.
    fn set_head(&mut self, idx: u32);

    /// Convenience: `set_cur` and `set_head` both to `idx` (the usual
    /// "release everything up to here" operation).
    fn release_to(&mut self, idx: u32) {
        self.set_cur(idx);
        self.set_head(idx);
    }

    /// Releases every slot currently pending, i.e. moves both indices to `tail`.
    fn release_all(&mut self) {
        let tail = self.tail();
        self.release_to(tail);
    }
}

/// The actual cross-thread ring representation: buffer bytes never move
/// once written, and the three indices are individually atomic so that a
/// task reading `head`/`cur` concurrently with the coordinator's mutation
/// sees either the old or the new value, never a torn one (see the design
/// note on avoiding a descriptor-wide mutex).
struct Inner {
    bufs: Vec<Vec<u8>>,
    head: AtomicU32,
    cur: AtomicU32,
    tail: AtomicU32,
}

/// A cheaply cloneable handle to one ring, shared between the coordinator
/// (which alone calls the [`RingManager`] methods) and any number of tasks
/// (which only ever call [`RingReader`] methods).
#[derive(Clone)]
pub struct SharedRing(Arc<Inner>);

impl SharedRing {
    pub fn new(num_bufs: u32, buf_len: usize) -> Self {
        SharedRing(Arc::new(Inner {
            bufs: (0..num_bufs).map(|_| vec![0u8; buf_len]).collect(),
            head: AtomicU32::new(0),
            cur: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }))
    }

    /// Fills the slot at the current `tail` and advances it. Stands in for
    /// the NIC driver's production side; real hardware does this via DMA.
    pub fn produce(&self, bytes: &[u8]) {
        let idx = self.0.tail.load(AtomicOrdering::Relaxed) as usize;
        // SAFETY: slots in [head, tail) are shared read-only with readers;
        // this writes only the slot about to become the new tail, which no
        // reader may access until the store below publishes it.
        let slot = self.0.bufs.as_ptr() as *mut Vec<u8>;
        unsafe {
            let buf = &mut *slot.add(idx);
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
        }
        let next = self.following(idx as u32);
        self.0.tail.store(next, AtomicOrdering::Release);
    }
}

unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

impl RingReader for SharedRing {
    fn num_bufs(&self) -> u32 {
        self.0.bufs.len() as u32
    }

    fn head(&self) -> u32 {
        self.0.head.load(AtomicOrdering::Acquire)
    }

    fn cur(&self) -> u32 {
        self.0.cur.load(AtomicOrdering::Acquire)
    }

    fn tail(&self) -> u32 {
        self.0.tail.load(AtomicOrdering::Acquire)
    }

    fn buf_at(&self, idx: u32) -> Option<&[u8]> {
        let dist = (idx + self.num_bufs() - self.head()) % self.num_bufs();
        if dist < self.total() || idx == self.head() {
            Some(&self.0.bufs[idx as usize])
        } else {
            None
        }
    }
}

impl RingManager for SharedRing {
    fn set_cur(&mut self, idx: u32) {
        self.0.cur.store(idx, AtomicOrdering::Release);
    }

    fn set_head(&mut self, idx: u32) {
        self.0.head.store(idx, AtomicOrdering::Release);
    }
}

#[cfg(test)]
pub mod software {
    //! An in-memory ring used by unit tests in place of real kernel-bypass
    //! hardware.

    use super::*;

    pub struct SoftwareRing {
        bufs: Vec<Vec<u8>>,
        head: u32,
        cur: u32,
        tail: u32,
    }

    impl SoftwareRing {
        pub fn new(num_bufs: u32, buf_len: usize) -> Self {
            SoftwareRing {
                bufs: (0..num_bufs).map(|_| vec![0u8; buf_len]).collect(),
                head: 0,
                cur: 0,
                tail: 0,
            }
        }

        /// Test helper: write `bytes` into the slot at `tail` and advance `tail`.
        pub fn push(&mut self, bytes: &[u8]) {
            let idx = self.tail as usize;
            let buf = &mut self.bufs[idx];
            buf[..bytes.len()].copy_from_slice(bytes);
            self.tail = self.following(self.tail);
        }
    }

    impl RingReader for SoftwareRing {
        fn num_bufs(&self) -> u32 {
            self.bufs.len() as u32
        }

        fn head(&self) -> u32 {
            self.head
        }

        fn cur(&self) -> u32 {
            self.cur
        }

        fn tail(&self) -> u32 {
            self.tail
        }

        fn buf_at(&self, idx: u32) -> Option<&[u8]> {
            if self.total_contains(idx) {
                Some(&self.bufs[idx as usize])
            } else {
                None
            }
        }
    }

    impl SoftwareRing {
        fn total_contains(&self, idx: u32) -> bool {
            let dist = (idx + self.num_bufs() - self.head) % self.num_bufs();
            dist < self.total() || idx == self.head
        }
    }

    impl RingManager for SoftwareRing {
        fn set_cur(&mut self, idx: u32) {
            self.cur = idx;
        }

        fn set_head(&mut self, idx: u32) {
            self.head = idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::software::SoftwareRing;
    use super::*;

    #[test]
    fn compare_ids_same_side_prefers_smaller() {
        let mut r = SoftwareRing::new(10, 8);
        for _ in 0..10 {
            r.push(&[0; 8]);
        }
        r.set_head(5);
        assert_eq!(r.compare_ids(6, 8), Ordering::Less);
        assert_eq!(r.earlier_id(6, 8), 6);
    }

    #[test]
    fn compare_ids_across_wrap_prefers_ahead_side() {
        let mut r = SoftwareRing::new(10, 8);
        for _ in 0..10 {
            r.push(&[0; 8]);
        }
        r.set_head(5);
        // 9 hasn't wrapped (>= head); 2 has (< head) -> 9 is earlier.
        assert_eq!(r.compare_ids(9, 2), Ordering::Less);
        assert_eq!(r.earlier_id(9, 2), 9);
        assert_eq!(r.later_id(9, 2), 2);
    }

    #[test]
    fn pending_done_total_track_three_indices() {
        let mut r = SoftwareRing::new(10, 8);
        for _ in 0..4 {
            r.push(&[0; 8]);
        }
        assert_eq!(r.total(), 4);
        r.set_cur(2);
        assert_eq!(r.done(), 2);
        assert_eq!(r.pending(), 2);
    }
}

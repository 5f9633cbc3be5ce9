//! Per-task dispatch core: turns one `WAKEUP` into zero or more packet
//! callback invocations, choosing which ring to drain by the
//! smallest-sequence-gap heuristic.

use crate::frame::Frame;
use crate::ring::RingReader;
use crate::seq;
use crate::stats::DispatchStats;
use crate::task::{SeqState, TaskDescriptor};

/// What a packet callback asks the dispatch loop to do next.
pub enum Continue {
    /// Keep draining the current ring.
    More,
    /// Enough for now; the dispatcher returns control to the runtime.
    Stop,
}

/// Implemented by the two built-in tasks (and any test double) to receive
/// decoded frames from the dispatch loop.
pub trait PacketHandler {
    /// `gap` is the number of frames lost immediately before this one,
    /// computed from the relevant sequence counter.
    fn handle(&mut self, frame: Frame, gap: u16) -> Continue;
}

/// Runs the dispatch algorithm for one `WAKEUP`, against `rings` using
/// `desc`'s per-ring heads and `seq`'s previous-sequence state.
///
/// Returns `true` if the handler requested the task terminate (fatal error),
/// in which case the caller must clear `active` and notify the coordinator.
pub fn on_wakeup<R: RingReader>(
    rings: &[R],
    desc: &TaskDescriptor,
    seq: &mut SeqState,
    stats: &mut DispatchStats,
    handler: &mut dyn PacketHandler,
) -> bool {
    if !desc.is_active() {
        stats.inactive_wakeups += 1;
        return false;
    }

    let chosen = match pick_ring(rings, desc, seq) {
        Some(r) => r,
        None => {
            stats.false_wakeups += 1;
            return false;
        }
    };

    dispatch_loop(&rings[chosen], chosen as u32, desc, seq, stats, handler)
}

/// Chooses the ring whose head frame has the smallest gap from `prev_fseq`;
/// ties go to the lower ring index. Returns `None` if every ring is empty at
/// the task's head (a "false wakeup").
fn pick_ring<R: RingReader>(rings: &[R], desc: &TaskDescriptor, seq: &SeqState) -> Option<usize> {
    let mut best: Option<(usize, u16)> = None;
    for (i, ring) in rings.iter().enumerate() {
        let head = desc.head(i as u32);
        if head == ring.tail() {
            continue;
        }
        let fseq = match ring.buf_at(head) {
            Some(bytes) => Frame::new(bytes).frame_seq(),
            None => continue,
        };
        let gap = seq::gap(seq.prev_fseq, fseq);
        best = match best {
            Some((_, best_gap)) if best_gap <= gap => best,
            _ => Some((i, gap)),
        };
    }
    best.map(|(i, _)| i)
}

fn dispatch_loop<R: RingReader>(
    ring: &R,
    ring_idx: u32,
    desc: &TaskDescriptor,
    seq: &mut SeqState,
    stats: &mut DispatchStats,
    handler: &mut dyn PacketHandler,
) -> bool {
    loop {
        let head = desc.head(ring_idx);
        if head == ring.tail() {
            return false;
        }

        let bytes = match ring.buf_at(head) {
            Some(b) => b,
            None => return false,
        };
        let frame = Frame::new(bytes);
        let declared = frame.pkt_len() as usize;

        if declared > bytes.len() {
            debug!("dropping frame at ring {} slot {}: declared len {} exceeds slot", ring_idx, head, declared);
            stats.dropped_invalid += 1;
        } else {
            let gap = seq::gap(seq.prev_fseq, frame.frame_seq());
            let outcome = handler.handle(frame, gap);
            stats.dispatched += 1;

            seq.prev_fseq = frame.frame_seq();
            if frame.is_mca() {
                seq.prev_pseq_mca = frame.proto_seq();
            } else if frame.is_trace() {
                seq.prev_pseq_trace = frame.proto_seq();
            } else if frame.is_pulse() {
                seq.prev_pseq_pulse = frame.proto_seq();
            }

            if desc.is_error() {
                desc.set_active(false);
                return true;
            }

            if let Continue::Stop = outcome {
                desc.set_head(ring_idx, ring.following(head));
                return false;
            }
        }

        let next = ring.following(head);
        desc.set_head(ring_idx, next);

        if next == ring.tail() {
            return false;
        }
        let next_fseq = match ring.buf_at(next) {
            Some(b) => Frame::new(b).frame_seq(),
            None => return false,
        };
        if seq::gap(seq.prev_fseq, next_fseq) != 0 {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::software::SoftwareRing;
    use crate::ring::RingManager;

    struct CountingHandler {
        seen: Vec<u16>,
    }

    impl PacketHandler for CountingHandler {
        fn handle(&mut self, frame: Frame, _gap: u16) -> Continue {
            self.seen.push(frame.frame_seq());
            Continue::More
        }
    }

    fn push_frame(ring: &mut SoftwareRing, frame_seq: u16) {
        let mut buf = vec![0u8; 32];
        buf[12] = 0x88;
        buf[13] = 0xB5; // ETH_EVT_TYPE little-endian bytes
        buf[14] = 32;
        buf[16] = (frame_seq & 0xff) as u8;
        buf[17] = (frame_seq >> 8) as u8;
        buf[20] = 1; // evt_size == 1 (peak)
        ring.push(&buf);
    }

    #[test]
    fn dispatch_stops_on_sequence_gap() {
        let mut ring = SoftwareRing::new(8, 32);
        push_frame(&mut ring, 0);
        push_frame(&mut ring, 1);
        push_frame(&mut ring, 3); // gap: frame 2 missing
        let desc = TaskDescriptor::new(0, 1, true);
        let mut seq = SeqState::default();
        let mut stats = DispatchStats::default();
        let mut handler = CountingHandler { seen: vec![] };

        let rings = vec![ring];
        let fatal = on_wakeup(&rings, &desc, &mut seq, &mut stats, &mut handler);

        assert!(!fatal);
        assert_eq!(handler.seen, vec![0, 1]);
        assert_eq!(desc.head(0), 2);
    }

    #[test]
    fn inactive_task_records_inactive_wakeup() {
        let mut ring = SoftwareRing::new(8, 32);
        push_frame(&mut ring, 0);
        let desc = TaskDescriptor::new(0, 1, false);
        let mut seq = SeqState::default();
        let mut stats = DispatchStats::default();
        let mut handler = CountingHandler { seen: vec![] };

        let rings = vec![ring];
        on_wakeup(&rings, &desc, &mut seq, &mut stats, &mut handler);

        assert_eq!(stats.inactive_wakeups, 1);
        assert!(handler.seen.is_empty());
    }

    #[test]
    fn empty_ring_at_head_is_a_false_wakeup() {
        let ring = SoftwareRing::new(8, 32);
        let desc = TaskDescriptor::new(0, 1, true);
        let mut seq = SeqState::default();
        let mut stats = DispatchStats::default();
        let mut handler = CountingHandler { seen: vec![] };

        let rings = vec![ring];
        on_wakeup(&rings, &desc, &mut seq, &mut stats, &mut handler);

        assert_eq!(stats.false_wakeups, 1);
    }
}

//! Histogram (MCA) reassembly and publish task (spec §4.G).
//!
//! Header frames (`proto_seq == 0`) start a new histogram; subsequent frames
//! extend it as long as `proto_seq` stays contiguous. A gap, or a new header
//! arriving before the current histogram finished, aborts the in-progress
//! one. Completed histograms are broadcast to every connected subscriber.

use std::collections::VecDeque;
use std::io::{self, Write};

use mio::net::{TcpListener, TcpStream};
use mio::{Poll, PollOpt, Ready, Token};

use crate::dispatch::{Continue, PacketHandler};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::runtime::{Task, FIRST_TASK_TOKEN};

const LISTENER_TOKEN: Token = Token(FIRST_TASK_TOKEN);
const FIRST_SUBSCRIBER_TOKEN: usize = FIRST_TASK_TOKEN + 1;

/// Reassembly buffer capacity: 2^16 minus an 8-byte margin, the larger of the
/// two values the original carried for `THIST_MAXSIZE`.
const REASSEMBLY_CAPACITY: usize = 65528;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum State {
    Idle,
    Collecting,
    Aborted,
}

/// Reassembly state machine. `discard` starts `true`: a histogram is only
/// ever trusted once a header frame has been seen, so any tail end of a
/// collection in progress when the task activates is thrown away.
///
/// The reassembly buffer holds each frame's body past the 24-byte FPGA
/// header verbatim — on the header frame that includes the 40-byte MCA
/// header — so the published message is exactly the on-wire byte layout a
/// subscriber already knows how to decode, with nothing added or reshaped.
struct Reassembler {
    state: State,
    discard: bool,
    expected_pseq: u16,
    declared_bins: u32,
    accumulated_bins: u32,
    buf: Vec<u8>,
}

impl Reassembler {
    fn new() -> Self {
        Reassembler {
            state: State::Idle,
            discard: true,
            expected_pseq: 0,
            declared_bins: 0,
            accumulated_bins: 0,
            buf: Vec::with_capacity(REASSEMBLY_CAPACITY),
        }
    }

    fn abort(&mut self, reason: &str) {
        warn!("histogram task: aborting collection: {}", reason);
        self.state = State::Aborted;
        self.discard = true;
        self.buf.clear();
        self.accumulated_bins = 0;
    }

    fn start(&mut self, frame: &Frame) {
        self.declared_bins = frame.mca_num_allbins();
        self.accumulated_bins = 0;
        self.buf.clear();
        self.expected_pseq = 1;
        self.discard = false;
        self.state = State::Collecting;
    }

    /// Feeds one MCA frame in. Returns a finished histogram (the raw
    /// reassembled byte buffer) once `accumulated_bins` reaches
    /// `declared_bins`.
    fn feed(&mut self, frame: &Frame) -> Option<Vec<u8>> {
        if frame.is_header() {
            if self.state == State::Collecting {
                self.abort("new header arrived before the previous histogram completed");
            }
            self.start(frame);
        } else {
            if self.discard || self.state != State::Collecting {
                return None;
            }
            if frame.proto_seq() != self.expected_pseq {
                self.abort(&format!(
                    "sequence gap (expected proto_seq {}, got {})",
                    self.expected_pseq,
                    frame.proto_seq()
                ));
                return None;
            }
            self.expected_pseq = self.expected_pseq.wrapping_add(1);
        }

        let body = frame.mca_body();
        if self.buf.len() + body.len() > REASSEMBLY_CAPACITY {
            self.abort("reassembly buffer would overflow");
            return None;
        }
        self.buf.extend_from_slice(body);
        self.accumulated_bins += frame.mca_num_bins() as u32;

        if self.accumulated_bins == self.declared_bins {
            self.state = State::Idle;
            Some(std::mem::take(&mut self.buf))
        } else if self.accumulated_bins > self.declared_bins {
            self.abort("accumulated more bins than declared");
            None
        } else {
            None
        }
    }
}

struct Subscriber {
    stream: TcpStream,
    backlog: VecDeque<u8>,
}

impl Subscriber {
    fn queue(&mut self, bytes: &[u8]) {
        self.backlog.extend(bytes.iter().copied());
    }

    /// Best-effort non-blocking flush. Drops the subscriber on a hard error;
    /// a slow subscriber that never drains just accumulates backlog.
    fn flush(&mut self) -> io::Result<()> {
        while !self.backlog.is_empty() {
            let (front, _) = self.backlog.as_slices();
            match self.stream.write(front) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "subscriber gone")),
                Ok(n) => {
                    self.backlog.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub struct HistogramTask {
    addr: std::net::SocketAddr,
    listener: Option<TcpListener>,
    subscribers: Vec<(Token, Subscriber)>,
    next_token: usize,
    reassembler: Reassembler,
    published: u64,
}

impl HistogramTask {
    pub fn new(addr: std::net::SocketAddr) -> Self {
        HistogramTask {
            addr,
            listener: None,
            subscribers: Vec::new(),
            next_token: FIRST_SUBSCRIBER_TOKEN,
            reassembler: Reassembler::new(),
            published: 0,
        }
    }

    fn handle_accept(&mut self, poll: &Poll) -> Result<()> {
        let listener = self.listener.as_ref().expect("listener bound in init");
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    poll.register(&stream, token, Ready::writable(), PollOpt::edge())?;
                    debug!("histogram task: subscriber {} connected as {:?}", peer, token);
                    self.subscribers.push((token, Subscriber { stream, backlog: VecDeque::new() }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(inner) => return Err(Error::Io { inner }),
            }
        }
    }

    /// Publishes a completed histogram: every subscriber gets the identical
    /// byte buffer the reassembler produced, no added header or trailer —
    /// only a 4-byte length prefix on the wire, purely so a stream transport
    /// can delimit one publish from the next (a real pub/sub transport would
    /// preserve message boundaries natively and need no such prefix).
    fn publish(&mut self, histogram: Vec<u8>) {
        self.published += 1;
        let mut envelope = Vec::with_capacity(4 + histogram.len());
        envelope.extend_from_slice(&(histogram.len() as u32).to_le_bytes());
        envelope.extend_from_slice(&histogram);

        let mut dead = Vec::new();
        for (token, sub) in self.subscribers.iter_mut() {
            sub.queue(&envelope);
            if sub.flush().is_err() {
                dead.push(*token);
            }
        }
        if !dead.is_empty() {
            self.subscribers.retain(|(t, _)| !dead.contains(t));
        }
    }
}

impl PacketHandler for HistogramTask {
    fn handle(&mut self, frame: Frame, _gap: u16) -> Continue {
        if !frame.is_mca() {
            return Continue::More;
        }
        if let Some(histogram) = self.reassembler.feed(&frame) {
            self.publish(histogram);
        }
        Continue::More
    }
}

impl Task for HistogramTask {
    fn init(&mut self) -> Result<()> {
        self.listener = Some(TcpListener::bind(&self.addr)?);
        Ok(())
    }

    fn register(&mut self, poll: &Poll) -> Result<()> {
        let listener = self.listener.as_ref().expect("bound in init");
        poll.register(listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())?;
        Ok(())
    }

    fn on_ready(&mut self, token: Token, ready: Ready, poll: &Poll) -> Result<()> {
        if token == LISTENER_TOKEN {
            return self.handle_accept(poll);
        }
        if ready.is_writable() {
            if let Some((_, sub)) = self.subscribers.iter_mut().find(|(t, _)| *t == token) {
                if sub.flush().is_err() {
                    self.subscribers.retain(|(t, _)| *t != token);
                }
            }
        }
        Ok(())
    }

    fn finalize(&mut self) {
        info!("histogram task: published {} histograms", self.published);
    }

    fn autoactivate(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BIN_LEN, FPGA_HDR_LEN, MCA_HDR_LEN};

    fn header_frame(num_bins: u16, buf: &mut Vec<u8>) {
        let len = FPGA_HDR_LEN + MCA_HDR_LEN + num_bins as usize * BIN_LEN;
        buf.resize(len, 0);
        buf[12] = 0x88;
        buf[13] = 0xb6; // MCA ether type
        buf[14] = (len as u16 & 0xff) as u8;
        buf[15] = (len as u16 >> 8) as u8;
        buf[18] = 0; // proto_seq == 0 -> header
        buf[FPGA_HDR_LEN + 2] = ((num_bins - 1) & 0xff) as u8;
        buf[FPGA_HDR_LEN + 3] = (((num_bins - 1) >> 8) & 0xff) as u8;
    }

    fn continuation_frame(pseq: u16, num_bins: u16, buf: &mut Vec<u8>) {
        let len = FPGA_HDR_LEN + num_bins as usize * BIN_LEN;
        buf.resize(len, 0);
        buf[12] = 0x88;
        buf[13] = 0xb6;
        buf[14] = (len as u16 & 0xff) as u8;
        buf[15] = (len as u16 >> 8) as u8;
        buf[18] = (pseq & 0xff) as u8;
        buf[19] = (pseq >> 8) as u8;
    }

    #[test]
    fn single_header_frame_completes_immediately() {
        let mut r = Reassembler::new();
        let mut buf = Vec::new();
        header_frame(2, &mut buf);
        let f = Frame::new(&buf);
        let h = r.feed(&f).expect("2-bin histogram should complete in one frame");
        assert_eq!(h.len(), MCA_HDR_LEN + 2 * BIN_LEN);
    }

    #[test]
    fn multi_frame_histogram_reassembles_across_continuations() {
        let mut r = Reassembler::new();
        let mut buf = Vec::new();
        header_frame(4, &mut buf);
        // shrink the header frame's bin payload so it needs one continuation
        buf.truncate(FPGA_HDR_LEN + MCA_HDR_LEN + 2 * BIN_LEN);
        let len = buf.len() as u16;
        buf[14] = (len & 0xff) as u8;
        buf[15] = (len >> 8) as u8;
        assert!(r.feed(&Frame::new(&buf)).is_none());

        let mut cont = Vec::new();
        continuation_frame(1, 2, &mut cont);
        let h = r.feed(&Frame::new(&cont)).expect("should complete after continuation");
        assert_eq!(h.len(), MCA_HDR_LEN + 4 * BIN_LEN);
    }

    #[test]
    fn sequence_gap_aborts_collection() {
        let mut r = Reassembler::new();
        let mut buf = Vec::new();
        header_frame(4, &mut buf);
        buf.truncate(FPGA_HDR_LEN + MCA_HDR_LEN + 2 * BIN_LEN);
        let len = buf.len() as u16;
        buf[14] = (len & 0xff) as u8;
        buf[15] = (len >> 8) as u8;
        assert!(r.feed(&Frame::new(&buf)).is_none());
        assert_eq!(r.state, State::Collecting);

        let mut cont = Vec::new();
        continuation_frame(5, 2, &mut cont); // wrong proto_seq, expected 1
        assert!(r.feed(&Frame::new(&cont)).is_none());
        assert_eq!(r.state, State::Aborted);
        assert!(r.discard);
    }

    #[test]
    fn new_header_before_completion_aborts_then_restarts() {
        let mut r = Reassembler::new();
        let mut first = Vec::new();
        header_frame(4, &mut first);
        first.truncate(FPGA_HDR_LEN + MCA_HDR_LEN + 2 * BIN_LEN);
        let len = first.len() as u16;
        first[14] = (len & 0xff) as u8;
        first[15] = (len >> 8) as u8;
        assert!(r.feed(&Frame::new(&first)).is_none());

        let mut second = Vec::new();
        header_frame(2, &mut second);
        let h = r.feed(&Frame::new(&second)).expect("new header's own histogram completes");
        assert_eq!(h.len(), MCA_HDR_LEN + 2 * BIN_LEN);
    }

    #[test]
    fn discard_until_next_header_after_late_join() {
        let mut r = Reassembler::new();
        assert!(r.discard);
        let mut cont = Vec::new();
        continuation_frame(3, 2, &mut cont);
        assert!(r.feed(&Frame::new(&cont)).is_none());
        assert_eq!(r.state, State::Idle);
    }
}

//! Write-to-file task (spec §4.F).
//!
//! One TCP client at a time sends a request; a valid save request opens a
//! file and activates the task so the coordinator starts waking it for
//! frames. Frames are copied into a bounded scratch ring and drained to disk
//! with non-blocking asynchronous writes, decoupling arrival from completion.

use std::convert::TryInto;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapMut;
use mio::net::{TcpListener, TcpStream};
use mio::{Poll, PollOpt, Ready, Token};

use crate::aio::{self, AioStatus, AsyncWriter};
use crate::dispatch::{Continue, PacketHandler};
use crate::error::{Error, Result};
use crate::frame::{Frame, MAX_FPGA_FRAME_LEN};
use crate::runtime::{Task, FIRST_TASK_TOKEN};
use crate::task::TaskDescriptor;

const LISTENER_TOKEN: Token = Token(FIRST_TASK_TOKEN);
const CLIENT_TOKEN: Token = Token(FIRST_TASK_TOKEN + 1);

/// Scratch ring capacity: the original's 15 MiB `TSAVE_BUFSIZE`.
const SCRATCH_CAPACITY: usize = 15 * 1024 * 1024;
/// Stats header reserved at the start of every saved file (spec §4.F).
const HEADER_LEN: usize = 40;
/// Request wire size beyond the filename: `min_ticks: u64` + `mode: u8`.
const REQ_TAIL_LEN: usize = 9;
/// Reply wire size: `status: u8` + four `u64`s.
const REPLY_LEN: usize = 1 + 8 * 4;

#[derive(Default, Clone, Copy)]
struct JobStats {
    ticks: u64,
    size: u64,
    frames: u64,
    frames_lost: u64,
    errors: u64,
}

impl JobStats {
    fn to_header_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.ticks.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.size.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.frames.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.frames_lost.to_ne_bytes());
        buf[32..40].copy_from_slice(&self.errors.to_ne_bytes());
        buf
    }
}

/// Resolves `filename` under `root`, per spec §4.F's path discipline:
/// rejects empty names and trailing slashes, creates missing parents (unless
/// this is a status-only check), and verifies the resolved path is still
/// contained in `root`.
fn canonicalize(root: &Path, filename: &str, checkonly: bool) -> Result<PathBuf> {
    if filename.is_empty() || filename.ends_with('/') {
        return Err(Error::PathRejected);
    }

    let root_resolved = root.canonicalize().map_err(|inner| Error::Io { inner })?;
    let candidate = root_resolved.join(filename.trim_start_matches('/'));

    let resolved = match candidate.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == io::ErrorKind::NotFound && !checkonly => {
            let parent = candidate.parent().ok_or(Error::PathRejected)?;
            fs::create_dir_all(parent).map_err(|inner| Error::Io { inner })?;
            let parent_resolved = parent.canonicalize().map_err(|_| Error::PathRejected)?;
            let name = candidate.file_name().ok_or(Error::PathRejected)?;
            parent_resolved.join(name)
        }
        Err(_) => return Err(Error::PathRejected),
    };

    if !resolved.starts_with(&root_resolved) {
        return Err(Error::PathRejected);
    }
    Ok(resolved)
}

struct WriteJob {
    path: PathBuf,
    min_ticks: u64,
    file: File,
    aio: Box<dyn AsyncWriter>,
    scratch: MmapMut,
    /// Start of the currently in-flight (or next) async write.
    tail: usize,
    /// Where the next frame will be copied to.
    cur: usize,
    /// Bytes copied into the scratch ring since the last async write.
    waiting: usize,
    /// Bytes in the in-flight async write.
    enqueued: usize,
    stats: JobStats,
}

impl WriteJob {
    fn open(path: PathBuf, min_ticks: u64, overwrite: bool, checkonly: bool) -> Result<Self> {
        if checkonly {
            let mut file = File::open(&path).map_err(|inner| Error::Io { inner })?;
            let mut header = [0u8; HEADER_LEN];
            file.read_exact(&mut header).map_err(|inner| Error::Io { inner })?;
            let stats = JobStats {
                ticks: u64::from_ne_bytes(header[0..8].try_into().unwrap()),
                size: u64::from_ne_bytes(header[8..16].try_into().unwrap()),
                frames: u64::from_ne_bytes(header[16..24].try_into().unwrap()),
                frames_lost: u64::from_ne_bytes(header[24..32].try_into().unwrap()),
                errors: u64::from_ne_bytes(header[32..40].try_into().unwrap()),
            };
            return Ok(WriteJob {
                path,
                min_ticks: 0,
                file,
                aio: aio::default_writer(-1),
                scratch: MmapMut::map_anon(1).map_err(|inner| Error::Mmap { inner })?,
                tail: 0,
                cur: 0,
                waiting: 0,
                enqueued: 0,
                stats,
            });
        }

        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        if !overwrite {
            opts.custom_flags(libc::O_EXCL);
        }
        let file = opts.open(&path).map_err(|inner| Error::Io { inner })?;
        file.set_len(HEADER_LEN as u64).map_err(|inner| Error::Io { inner })?;

        let scratch = MmapMut::map_anon(SCRATCH_CAPACITY).map_err(|inner| Error::Mmap { inner })?;
        let aio = aio::default_writer(file.as_raw_fd());

        Ok(WriteJob {
            path,
            min_ticks,
            file,
            aio,
            scratch,
            tail: 0,
            cur: 0,
            waiting: 0,
            enqueued: 0,
            stats: JobStats::default(),
        })
    }

    /// Copies one frame into the scratch ring, wrapping and splitting the
    /// copy into at most two runs as needed.
    fn copy_frame(&mut self, bytes: &[u8]) {
        let cap = self.scratch.len();
        let len = bytes.len();
        let first = (cap - self.cur).min(len);
        self.scratch[self.cur..self.cur + first].copy_from_slice(&bytes[..first]);
        if first < len {
            let rest = len - first;
            self.scratch[..rest].copy_from_slice(&bytes[first..]);
            self.cur = rest;
        } else {
            self.cur = (self.cur + len) % cap;
        }
        self.waiting += len;
    }

    /// Reaps the in-flight write (blocking if `force`) and, if there is
    /// anything waiting, submits the next contiguous region.
    fn advance(&mut self, force: bool) -> Result<()> {
        if self.enqueued > 0 {
            let status = if force { AioStatus::Done(self.aio.force()?) } else { self.aio.poll()? };
            match status {
                AioStatus::InProgress => return Ok(()),
                AioStatus::Done(n) => {
                    if n != self.enqueued {
                        return Err(Error::Io {
                            inner: io::Error::new(io::ErrorKind::WriteZero, "short async write"),
                        });
                    }
                    self.stats.size += n as u64;
                    self.tail = (self.tail + n) % self.scratch.len();
                    self.enqueued = 0;
                }
            }
        }

        if self.waiting == 0 {
            return Ok(());
        }
        let cap = self.scratch.len();
        let region_len = if self.cur >= self.tail { self.cur - self.tail } else { cap - self.tail };
        if region_len == 0 {
            return Ok(());
        }
        let offset = HEADER_LEN as u64 + self.stats.size;
        let ptr = unsafe { self.scratch.as_ptr().add(self.tail) };
        unsafe { self.aio.submit(ptr, region_len, offset)? };
        self.enqueued = region_len;
        self.waiting -= region_len;
        Ok(())
    }

    /// Drains every remaining byte, blocking as needed. Used when the job is
    /// finalizing (tick threshold reached, or a fatal error).
    fn drain(&mut self) -> Result<()> {
        while self.waiting > 0 || self.enqueued > 0 {
            self.advance(true)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file.write_at(&self.stats.to_header_bytes(), 0).map_err(|inner| Error::Io { inner })?;
        Ok(())
    }
}

enum ReqReadState {
    Len { buf: [u8; 2], have: usize },
    Body { name_len: usize, buf: Vec<u8>, have: usize },
}

impl Default for ReqReadState {
    fn default() -> Self {
        ReqReadState::Len { buf: [0; 2], have: 0 }
    }
}

struct ClientConn {
    stream: TcpStream,
    read_state: ReqReadState,
    write_buf: Vec<u8>,
    write_off: usize,
}

impl ClientConn {
    fn new(stream: TcpStream) -> Self {
        ClientConn { stream, read_state: ReqReadState::default(), write_buf: Vec::new(), write_off: 0 }
    }

    /// Drives the read state machine. Returns `Ok(Some(..))` once a full
    /// request has been parsed, `Ok(None)` if more data is needed, `Err` on
    /// disconnect (treated as non-fatal by the runtime; see
    /// [`crate::error::Error::Protocol`]).
    fn read_request(&mut self) -> Result<Option<(String, u64, u8)>> {
        loop {
            match &mut self.read_state {
                ReqReadState::Len { buf, have } => {
                    let n = match self.stream.read(&mut buf[*have..]) {
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(inner) => return Err(Error::Io { inner }),
                    };
                    if n == 0 {
                        return Err(Error::Protocol { inner: "client disconnected".into() });
                    }
                    *have += n;
                    if *have == buf.len() {
                        let name_len = u16::from_le_bytes(*buf) as usize;
                        self.read_state =
                            ReqReadState::Body { name_len, buf: vec![0u8; name_len + REQ_TAIL_LEN], have: 0 };
                    } else {
                        return Ok(None);
                    }
                }
                ReqReadState::Body { name_len, buf, have } => {
                    let n = match self.stream.read(&mut buf[*have..]) {
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(inner) => return Err(Error::Io { inner }),
                    };
                    if n == 0 {
                        return Err(Error::Protocol { inner: "client disconnected".into() });
                    }
                    *have += n;
                    if *have < buf.len() {
                        return Ok(None);
                    }
                    let name_len = *name_len;
                    let filename = String::from_utf8_lossy(&buf[..name_len]).into_owned();
                    let min_ticks = u64::from_le_bytes(buf[name_len..name_len + 8].try_into().unwrap());
                    let mode = buf[name_len + 8];
                    self.read_state = ReqReadState::default();
                    return Ok(Some((filename, min_ticks, mode)));
                }
            }
        }
    }

    /// Queues a reply and makes an immediate best-effort write. Under
    /// edge-triggered polling a socket that is already writable never fires
    /// another writable event on its own, so whatever doesn't fit now is left
    /// in `write_buf` for [`Self::try_flush`] to finish once a later writable
    /// edge arrives.
    fn queue_reply(&mut self, status: u8, ticks: u64, size: u64, frames: u64, frames_lost: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(REPLY_LEN);
        buf.push(status);
        buf.extend_from_slice(&ticks.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&frames.to_le_bytes());
        buf.extend_from_slice(&frames_lost.to_le_bytes());
        self.write_buf = buf;
        self.write_off = 0;
        self.try_flush().map(|_| ())
    }

    /// Non-blocking flush of any queued reply bytes. Returns `true` once
    /// fully flushed (or if there was nothing to flush).
    fn try_flush(&mut self) -> Result<bool> {
        while self.write_off < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_off..]) {
                Ok(0) => return Err(Error::Protocol { inner: "client disconnected".into() }),
                Ok(n) => self.write_off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(inner) => return Err(Error::Io { inner }),
            }
        }
        Ok(true)
    }
}

/// Request mode byte, spec §6.
const MODE_CREATE_EXCLUSIVE: u8 = 0;
const MODE_CREATE_OR_OVERWRITE: u8 = 1;

pub struct WriterTask {
    desc: Arc<TaskDescriptor>,
    root: PathBuf,
    addr: std::net::SocketAddr,
    listener: Option<TcpListener>,
    client: Option<ClientConn>,
    job: Option<WriteJob>,
}

impl WriterTask {
    pub fn new(desc: Arc<TaskDescriptor>, root: PathBuf, addr: std::net::SocketAddr) -> Self {
        WriterTask { desc, root, addr, listener: None, client: None, job: None }
    }

    fn handle_accept(&mut self, poll: &Poll) -> Result<()> {
        let listener = self.listener.as_ref().expect("listener bound in init");
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.client.is_some() {
                        debug!("writer task: rejecting concurrent connection from {}", peer);
                        drop(stream);
                        continue;
                    }
                    poll.register(&stream, CLIENT_TOKEN, Ready::readable() | Ready::writable(), PollOpt::edge())?;
                    self.client = Some(ClientConn::new(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(inner) => return Err(Error::Io { inner }),
            }
        }
    }

    fn handle_client_ready(&mut self, ready: Ready) -> Result<()> {
        if ready.is_writable() {
            if let Some(client) = self.client.as_mut() {
                client.try_flush()?;
            }
        }
        if ready.is_readable() && self.job.is_none() {
            self.handle_request()?;
        }
        Ok(())
    }

    fn handle_request(&mut self) -> Result<()> {
        let parsed = match self.client.as_mut() {
            Some(client) => client.read_request()?,
            None => return Ok(()),
        };
        let (filename, min_ticks, mode) = match parsed {
            Some(v) => v,
            None => return Ok(()),
        };

        if mode > 1 {
            self.reply_failure();
            return Ok(());
        }
        let checkonly = min_ticks == 0;
        info!(
            "writer task: {} request for '{}'{}",
            if checkonly { "status" } else { "save" },
            filename,
            if checkonly { String::new() } else { format!(" ({} ticks)", min_ticks) }
        );

        let path = match canonicalize(&self.root, &filename, checkonly) {
            Ok(p) => p,
            Err(_) => {
                self.reply_failure();
                return Ok(());
            }
        };

        let overwrite = mode == MODE_CREATE_OR_OVERWRITE;
        match WriteJob::open(path, min_ticks, overwrite, checkonly) {
            Ok(job) => {
                if checkonly {
                    let s = job.stats;
                    self.reply_success(s);
                } else {
                    self.job = Some(job);
                    self.desc.set_active(true);
                }
            }
            Err(_) => self.reply_failure(),
        }
        Ok(())
    }

    fn reply_failure(&mut self) {
        if let Some(client) = self.client.as_mut() {
            if client.queue_reply(0, 0, 0, 0, 0).is_err() {
                self.client = None;
            }
        }
    }

    fn reply_success(&mut self, stats: JobStats) {
        if let Some(client) = self.client.as_mut() {
            if client.queue_reply(1, stats.ticks, stats.size, stats.frames, stats.frames_lost).is_err() {
                self.client = None;
            }
        }
    }

    /// Finishes the in-flight job: drains the scratch ring, writes the stats
    /// header, closes the file and queues the reply.
    fn finish_job(&mut self) {
        let mut job = match self.job.take() {
            Some(j) => j,
            None => return,
        };
        self.desc.set_active(false);
        if let Err(e) = job.drain() {
            warn!("writer task: error draining scratch ring: {}", e);
            job.stats.errors += 1;
        }
        if let Err(e) = job.close() {
            warn!("writer task: error closing {}: {}", job.path.display(), e);
            job.stats.errors += 1;
        }
        info!("writer task: finished writing {} ticks to {}", job.stats.ticks, job.path.display());
        self.reply_success(job.stats);
    }
}

impl PacketHandler for WriterTask {
    fn handle(&mut self, frame: Frame, gap: u16) -> Continue {
        let job = match self.job.as_mut() {
            Some(j) => j,
            None => return Continue::More,
        };

        let declared = frame.pkt_len() as usize;
        if job.stats.frames > 0 {
            job.stats.frames_lost += gap as u64;
        }
        job.stats.frames += 1;
        if frame.is_tick() {
            job.stats.ticks += 1;
        }

        job.copy_frame(&frame.as_bytes()[..declared.min(MAX_FPGA_FRAME_LEN)]);

        let finalizing = job.stats.ticks == job.min_ticks;
        if let Err(e) = job.advance(false) {
            warn!("writer task: async write failed: {}", e);
            job.stats.errors += 1;
            self.finish_job();
            return Continue::Stop;
        }

        let max_frame = MAX_FPGA_FRAME_LEN;
        while job.waiting + job.enqueued > job.scratch.len() - max_frame || (finalizing && (job.waiting > 0 || job.enqueued > 0)) {
            if let Err(e) = job.advance(true) {
                warn!("writer task: async write failed: {}", e);
                job.stats.errors += 1;
                self.finish_job();
                return Continue::Stop;
            }
        }

        if finalizing {
            self.finish_job();
            Continue::Stop
        } else {
            Continue::More
        }
    }
}

impl Task for WriterTask {
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
            self.handle_accept(poll)
        } else if token == CLIENT_TOKEN {
            let result = self.handle_client_ready(ready);
            if let Err(Error::Protocol { .. }) = &result {
                self.client = None;
            }
            result
        } else {
            Ok(())
        }
    }

    fn finalize(&mut self) {
        self.finish_job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_rejects_empty_and_trailing_slash() {
        let root = std::env::temp_dir();
        assert!(canonicalize(&root, "", false).is_err());
        assert!(canonicalize(&root, "foo/", false).is_err());
    }

    #[test]
    fn canonicalize_rejects_path_escaping_root() {
        let dir = tempdir();
        assert!(canonicalize(&dir, "../../etc/passwd", false).is_err());
    }

    #[test]
    fn canonicalize_creates_missing_parents_and_stays_in_root() {
        let dir = tempdir();
        let resolved = canonicalize(&dir, "a/b/c.dat", false).unwrap();
        assert!(resolved.starts_with(dir.canonicalize().unwrap()));
        assert!(dir.join("a/b").is_dir());
    }

    #[test]
    fn checkonly_rejects_missing_file() {
        let dir = tempdir();
        assert!(canonicalize(&dir, "nope.dat", true).is_err());
    }

    #[test]
    fn job_stats_header_bytes_roundtrip() {
        let stats = JobStats { ticks: 5, size: 1000, frames: 7, frames_lost: 2, errors: 0 };
        let bytes = stats.to_header_bytes();
        assert_eq!(u64::from_ne_bytes(bytes[0..8].try_into().unwrap()), 5);
        assert_eq!(u64::from_ne_bytes(bytes[8..16].try_into().unwrap()), 1000);
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("daqcap-writer-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&p);
        fs::create_dir_all(&p).unwrap();
        p
    }
}

//! Asynchronous write backend used by the write-to-file task.
//!
//! The required semantics: submit a byte range for background write, poll
//! completion without blocking, or force completion (block until the
//! in-flight range lands or errors). Backed by POSIX AIO where available; a
//! worker-thread-plus-blocking-write shim covers everything else.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::thread;

use nix::errno::Errno;

use crate::error::{Error, Result};

/// Outcome of a non-blocking completion check.
pub enum AioStatus {
    InProgress,
    Done(usize),
}

pub trait AsyncWriter: Send {
    /// Submits `len` bytes starting at `ptr` for background write at file
    /// `offset`. The caller guarantees `ptr..ptr+len` stays valid and
    /// unmodified until the write is reaped.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes for the lifetime of the
    /// in-flight write.
    unsafe fn submit(&mut self, ptr: *const u8, len: usize, offset: u64) -> Result<()>;

    /// Non-blocking completion check.
    fn poll(&mut self) -> Result<AioStatus>;

    /// Blocks until the in-flight write completes or errors.
    fn force(&mut self) -> Result<usize>;
}

/// Backend using the platform's POSIX asynchronous I/O (`aio_write(2)`).
pub struct PosixAio {
    fd: RawFd,
    cb: Box<libc::aiocb>,
    in_flight: bool,
}

impl PosixAio {
    pub fn new(fd: RawFd) -> Self {
        PosixAio {
            fd,
            cb: Box::new(unsafe { mem::zeroed() }),
            in_flight: false,
        }
    }
}

unsafe impl Send for PosixAio {}

impl AsyncWriter for PosixAio {
    unsafe fn submit(&mut self, ptr: *const u8, len: usize, offset: u64) -> Result<()> {
        *self.cb = mem::zeroed();
        self.cb.aio_fildes = self.fd;
        self.cb.aio_offset = offset as libc::off_t;
        self.cb.aio_buf = ptr as *mut libc::c_void;
        self.cb.aio_nbytes = len;

        let rc = libc::aio_write(&mut *self.cb as *mut libc::aiocb);
        if rc != 0 {
            return Err(Error::Aio { errno: Errno::last() });
        }
        self.in_flight = true;
        Ok(())
    }

    fn poll(&mut self) -> Result<AioStatus> {
        if !self.in_flight {
            return Ok(AioStatus::Done(0));
        }
        let err = unsafe { libc::aio_error(&*self.cb as *const libc::aiocb) };
        match err {
            0 => {
                let n = unsafe { libc::aio_return(&mut *self.cb as *mut libc::aiocb) };
                self.in_flight = false;
                if n < 0 {
                    Err(Error::Aio { errno: Errno::last() })
                } else {
                    Ok(AioStatus::Done(n as usize))
                }
            }
            libc::EINPROGRESS => Ok(AioStatus::InProgress),
            e => {
                self.in_flight = false;
                Err(Error::Aio { errno: Errno::from_i32(e) })
            }
        }
    }

    fn force(&mut self) -> Result<usize> {
        if !self.in_flight {
            return Ok(0);
        }
        loop {
            let list = [&*self.cb as *const libc::aiocb];
            let rc = unsafe {
                libc::aio_suspend(list.as_ptr() as *const *const libc::aiocb, 1, std::ptr::null())
            };
            if rc != 0 {
                let errno = Errno::last();
                if errno == Errno::EINTR {
                    continue;
                }
                return Err(Error::Aio { errno });
            }
            return match self.poll()? {
                AioStatus::Done(n) => Ok(n),
                AioStatus::InProgress => continue,
            };
        }
    }
}

enum ThreadJob {
    Write { offset: u64, bytes: Vec<u8> },
}

enum ThreadResult {
    Done(usize),
    Failed(::std::io::Error),
}

/// Fallback backend: a single worker thread performs a blocking `pwrite` for
/// each submission, and results are handed back over a channel.
pub struct ThreadAio {
    /// `None` once dropped, so the worker's `job_rx.recv()` unblocks before
    /// `drop` joins it (the sender is otherwise kept alive by this struct
    /// field until after `drop` returns, which would deadlock the join).
    job_tx: Option<mpsc::Sender<ThreadJob>>,
    result_rx: mpsc::Receiver<ThreadResult>,
    in_flight: bool,
    worker: Option<thread::JoinHandle<()>>,
}

impl ThreadAio {
    pub fn new(fd: RawFd) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<ThreadJob>();
        let (result_tx, result_rx) = mpsc::channel::<ThreadResult>();

        let worker = thread::spawn(move || {
            use std::os::unix::io::FromRawFd;
            let file = unsafe { std::fs::File::from_raw_fd(fd) };
            while let Ok(ThreadJob::Write { offset, bytes }) = job_rx.recv() {
                use std::os::unix::fs::FileExt;
                let res = file.write_at(&bytes, offset).map(|_| bytes.len());
                let sent = match res {
                    Ok(n) => ThreadResult::Done(n),
                    Err(e) => ThreadResult::Failed(e),
                };
                if result_tx.send(sent).is_err() {
                    break;
                }
            }
            mem::forget(file); // fd is owned by the caller, not this thread
        });

        ThreadAio {
            job_tx: Some(job_tx),
            result_rx,
            in_flight: false,
            worker: Some(worker),
        }
    }
}

impl AsyncWriter for ThreadAio {
    unsafe fn submit(&mut self, ptr: *const u8, len: usize, offset: u64) -> Result<()> {
        let bytes = std::slice::from_raw_parts(ptr, len).to_vec();
        self.job_tx
            .as_ref()
            .ok_or_else(|| Error::TaskInit { inner: "aio worker thread gone".into() })?
            .send(ThreadJob::Write { offset, bytes })
            .map_err(|_| Error::TaskInit { inner: "aio worker thread gone".into() })?;
        self.in_flight = true;
        Ok(())
    }

    fn poll(&mut self) -> Result<AioStatus> {
        if !self.in_flight {
            return Ok(AioStatus::Done(0));
        }
        match self.result_rx.try_recv() {
            Ok(ThreadResult::Done(n)) => {
                self.in_flight = false;
                Ok(AioStatus::Done(n))
            }
            Ok(ThreadResult::Failed(e)) => {
                self.in_flight = false;
                Err(Error::Io { inner: e })
            }
            Err(mpsc::TryRecvError::Empty) => Ok(AioStatus::InProgress),
            Err(mpsc::TryRecvError::Disconnected) => {
                Err(Error::TaskInit { inner: "aio worker thread gone".into() })
            }
        }
    }

    fn force(&mut self) -> Result<usize> {
        if !self.in_flight {
            return Ok(0);
        }
        match self.result_rx.recv() {
            Ok(ThreadResult::Done(n)) => {
                self.in_flight = false;
                Ok(n)
            }
            Ok(ThreadResult::Failed(e)) => {
                self.in_flight = false;
                Err(Error::Io { inner: e })
            }
            Err(_) => Err(Error::TaskInit { inner: "aio worker thread gone".into() }),
        }
    }
}

impl Drop for ThreadAio {
    fn drop(&mut self) {
        // Drop the sender first: the worker's `job_rx.recv()` only returns
        // `Err` (ending its loop) once every sender is gone, so joining
        // beforehand would block forever.
        self.job_tx.take();
        if let Some(w) = self.worker.take() {
            drop(w.join());
        }
    }
}

/// The writer task's backend of choice: POSIX AIO on Linux, the thread shim
/// elsewhere.
pub fn default_writer(fd: RawFd) -> Box<dyn AsyncWriter> {
    #[cfg(target_os = "linux")]
    {
        Box::new(PosixAio::new(fd))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(ThreadAio::new(fd))
    }
}

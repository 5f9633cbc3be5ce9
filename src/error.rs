use std::io;

use failure::Fail;

use crate::frame::FrameError;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "Ring access out of bounds: {}", inner)]
    RingAccess { inner: String },
    #[fail(display = "Frame failed validation: {:?}", flags)]
    FrameInvalid { flags: FrameError },
    #[fail(display = "I/O error: {}", inner)]
    Io { inner: io::Error },
    #[fail(display = "Failed to map scratch memory: {}", inner)]
    Mmap { inner: io::Error },
    #[fail(display = "Asynchronous I/O failed: {}", errno)]
    Aio { errno: nix::errno::Errno },
    #[fail(display = "Path rejected: escapes configured root or is malformed")]
    PathRejected,
    #[fail(display = "Protocol error: {}", inner)]
    Protocol { inner: String },
    #[fail(display = "Task failed to initialize: {}", inner)]
    TaskInit { inner: String },
    #[fail(display = "NIC error: {}", inner)]
    Nic { inner: io::Error },
    #[fail(display = "Encountered an unknown error: {}", inner)]
    Misc { inner: failure::Error },
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Error::Io { inner }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        match inner {
            nix::Error::Sys(errno) => Error::Aio { errno },
            other => Error::Misc { inner: failure::Error::from(other) },
        }
    }
}

impl From<failure::Error> for Error {
    fn from(inner: failure::Error) -> Self {
        Error::Misc { inner }
    }
}

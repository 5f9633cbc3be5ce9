//! The kernel-bypass NIC interface consumed by the coordinator.
//!
//! This is deliberately thin: the real reader/manager wrapper over the
//! vendor NIC library is an external collaborator. What the core needs is
//! captured as two traits so that tests can swap in a software NIC.

use std::os::unix::io::RawFd;

use crate::ring::{RingManager, SharedRing};

/// Owned by the coordinator. Exposes the rings for both reading and, via
/// [`RingManager`], managing.
pub trait Nic: Send {
    /// File descriptor to register for readability; becomes readable when
    /// any ring has new frames.
    fn fd(&self) -> RawFd;

    fn rx_ring_count(&self) -> u32;

    /// A clone of ring `idx`'s shared handle. Cloning is cheap (an `Arc`
    /// bump); the coordinator keeps one clone per task plus its own.
    fn rx_ring(&self, idx: u32) -> SharedRing;

    fn close(&mut self);
}

/// A software-backed NIC used by tests in place of real kernel-bypass
/// hardware. Frames are injected with [`FakeNic::inject`]; readiness is
/// signaled over a pipe so it can still be registered with `mio::Poll`.
pub struct FakeNic {
    rings: Vec<SharedRing>,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl FakeNic {
    pub fn new(num_rings: u32, bufs_per_ring: u32, buf_len: usize) -> ::nix::Result<Self> {
        let (read_fd, write_fd) = ::nix::unistd::pipe()?;
        Ok(FakeNic {
            rings: (0..num_rings).map(|_| SharedRing::new(bufs_per_ring, buf_len)).collect(),
            read_fd,
            write_fd,
        })
    }

    /// Writes `bytes` as a new frame into ring `ring_idx` and marks the NIC
    /// fd readable.
    pub fn inject(&self, ring_idx: u32, bytes: &[u8]) {
        self.rings[ring_idx as usize].produce(bytes);
        let _ = ::nix::unistd::write(self.write_fd, &[0u8]);
    }

    /// Drains the one-byte readiness marker after the coordinator has
    /// consumed a readiness event, mirroring a real NIC fd's edge reset.
    pub fn drain_readiness(&self) {
        let mut buf = [0u8; 64];
        loop {
            match ::nix::unistd::read(self.read_fd, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
            }
        }
    }
}

impl Nic for FakeNic {
    fn fd(&self) -> RawFd {
        self.read_fd
    }

    fn rx_ring_count(&self) -> u32 {
        self.rings.len() as u32
    }

    fn rx_ring(&self, idx: u32) -> SharedRing {
        self.rings[idx as usize].clone()
    }

    fn close(&mut self) {
        let _ = ::nix::unistd::close(self.read_fd);
        let _ = ::nix::unistd::close(self.write_fd);
    }
}

impl Drop for FakeNic {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingReader;

    #[test]
    fn inject_advances_tail_and_marks_readable() {
        let nic = FakeNic::new(1, 8, 64).unwrap();
        let ring = nic.rx_ring(0);
        assert_eq!(ring.tail(), 0);
        nic.inject(0, &[1, 2, 3]);
        let ring = nic.rx_ring(0);
        assert_eq!(ring.tail(), 1);
    }
}

//! Eventfd notification endpoints shared with the vhost peer.
//!
//! Each endpoint is one eventfd: the side we keep is wrapped here, the raw
//! fd of the other side is registered with vhost (the peer's *call* fd is
//! the write side of our readable endpoint, its *kick* fd the read side of
//! our writeable one). Signals coalesce in the kernel counter; a waiter
//! observes the count accumulated since its last read, which is a hint, not
//! a promise of a particular value.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;

fn new_eventfd() -> io::Result<OwnedFd> {
    let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: `raw` is a freshly created fd we exclusively own.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Endpoint the peer raises and we await.
pub struct ReadableEventFd {
    fd: AsyncFd<OwnedFd>,
}

impl ReadableEventFd {
    /// Must be called from within a tokio runtime.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(new_eventfd()?)?,
        })
    }

    /// Raw fd handed to the peer as its signalling side.
    pub fn write_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }

    /// Wait for the counter to become non-zero and return its accumulated
    /// value, resetting it.
    pub async fn wait(&self) -> io::Result<u64> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|fd| read_counter(fd.get_ref().as_raw_fd())) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn read_counter(fd: RawFd) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != buf.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "short eventfd read"));
    }
    Ok(u64::from_ne_bytes(buf))
}

/// Endpoint we raise and the peer awaits.
pub struct WriteableEventFd {
    fd: OwnedFd,
}

impl WriteableEventFd {
    pub fn new() -> io::Result<Self> {
        Ok(Self { fd: new_eventfd()? })
    }

    /// Raw fd handed to the peer as its waiting side.
    pub fn read_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Add `n` to the counter.
    pub fn signal(&self, n: u64) -> io::Result<()> {
        let buf = n.to_ne_bytes();
        let written =
            unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len()) };
        if written as usize != buf.len() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

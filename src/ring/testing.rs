//! Test double for the vhost peer: drives the shared rings from the test
//! body, completing chains through the used ring and the call eventfd.

use super::layout::{AvailRing, Descriptor, UsedElem, UsedRing, VIRTQ_USED_F_NO_NOTIFY};
use super::VringConfig;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub struct MockPeer {
    config: VringConfig,
    avail: AvailRing,
    used: UsedRing,
    call_fd: RawFd,
    used_idx: u16,
}

impl MockPeer {
    /// `call_fd` is the write side of the ring's notified endpoint
    /// (`ReadableEventFd::write_fd`).
    pub fn new(config: VringConfig, call_fd: RawFd) -> Self {
        Self {
            config,
            // Safety: the test keeps the ring storage alive for the peer's
            // lifetime.
            avail: unsafe { AvailRing::new(config.avail) },
            used: unsafe { UsedRing::new(config.used) },
            call_fd,
            used_idx: 0,
        }
    }

    fn mask(&self) -> u16 {
        (self.config.size - 1) as u16
    }

    pub fn avail_idx(&self) -> u16 {
        self.avail.idx().load(Ordering::Acquire)
    }

    pub fn avail_flags(&self) -> u16 {
        self.avail.flags().load(Ordering::Relaxed)
    }

    pub fn avail_head(&self, slot: u16) -> u16 {
        self.avail.read_entry((slot & self.mask()) as usize)
    }

    pub fn desc(&self, id: u16) -> Descriptor {
        assert!((id as usize) < self.config.size, "descriptor id out of range");
        // Safety: bounds asserted; the table lives in the ring storage.
        unsafe { (self.config.descs as *const Descriptor).add(id as usize).read_volatile() }
    }

    /// Fill a peer-write buffer as the device would receive it off the wire.
    pub fn write_buffer(&self, id: u16, bytes: &[u8]) {
        let desc = self.desc(id);
        assert!(bytes.len() <= desc.len as usize, "frame larger than buffer");
        // Safety: the descriptor addresses a live buffer the engine handed
        // to the peer.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), desc.addr as *mut u8, bytes.len()) };
    }

    /// Read back a peer-read buffer's contents.
    pub fn read_buffer(&self, id: u16) -> Vec<u8> {
        let desc = self.desc(id);
        let mut out = vec![0u8; desc.len as usize];
        // Safety: as `write_buffer`.
        unsafe { std::ptr::copy_nonoverlapping(desc.addr as *const u8, out.as_mut_ptr(), out.len()) };
        out
    }

    pub fn set_no_notify(&self, on: bool) {
        let flags = if on { VIRTQ_USED_F_NO_NOTIFY } else { 0 };
        self.used.flags().store(flags, Ordering::Relaxed);
    }

    /// Post a completed chain to the used ring and raise the call signal.
    pub fn complete_chain(&mut self, head: u16, len: u32) {
        self.used.write_elem(
            (self.used_idx & self.mask()) as usize,
            UsedElem {
                id: head as u32,
                len,
            },
        );
        self.used_idx = self.used_idx.wrapping_add(1);
        self.used.idx().store(self.used_idx, Ordering::Release);
        let buf = 1u64.to_ne_bytes();
        let written =
            unsafe { libc::write(self.call_fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        assert_eq!(written, 8, "call eventfd write failed");
    }
}

/// Drain a kick eventfd without blocking; `None` if no kick was raised.
pub fn read_kick(fd: RawFd) -> Option<u64> {
    let mut buf = [0u8; 8];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n == 8 {
        Some(u64::from_ne_bytes(buf))
    } else {
        None
    }
}

/// Poll `cond` until it holds, failing the test after ~1s.
pub async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

//! TAP and vhost-net bring-up.
//!
//! Everything here is one-shot configuration: open the TAP device, hand the
//! rings and notification fds to the vhost worker, and bind the TAP fd as
//! backend for both queues. The memory table advertises a single identity
//! region (guest physical address == user virtual address), which is what
//! lets descriptors carry plain pointers.

use crate::error::NetError;
use crate::ring::VringConfig;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_ONE_QUEUE: libc::c_short = 0x2000;
const IFF_VNET_HDR: libc::c_short = 0x4000;

pub const VIRTIO_NET_F_MRG_RXBUF: u64 = 1 << 15;
pub const VIRTIO_RING_F_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_RING_F_EVENT_IDX: u64 = 1 << 29;

#[repr(C)]
struct VhostVringState {
    index: u32,
    num: u32,
}

#[repr(C)]
struct VhostVringFile {
    index: u32,
    fd: i32,
}

#[repr(C)]
struct VhostVringAddr {
    index: u32,
    flags: u32,
    desc_user_addr: u64,
    used_user_addr: u64,
    avail_user_addr: u64,
    log_guest_addr: u64,
}

#[repr(C)]
struct VhostMemoryRegion {
    guest_phys_addr: u64,
    memory_size: u64,
    userspace_addr: u64,
    flags_padding: u64,
}

#[repr(C)]
struct VhostMemory {
    nregions: u32,
    padding: u32,
    regions: [VhostMemoryRegion; 1],
}

const VHOST: u8 = 0xAF;

nix::ioctl_write_ptr!(vhost_set_features, VHOST, 0x00, u64);
nix::ioctl_none!(vhost_set_owner, VHOST, 0x01);
nix::ioctl_write_ptr!(vhost_set_mem_table, VHOST, 0x03, VhostMemory);
nix::ioctl_write_ptr!(vhost_set_vring_num, VHOST, 0x10, VhostVringState);
nix::ioctl_write_ptr!(vhost_set_vring_addr, VHOST, 0x11, VhostVringAddr);
nix::ioctl_write_ptr!(vhost_set_vring_kick, VHOST, 0x20, VhostVringFile);
nix::ioctl_write_ptr!(vhost_set_vring_call, VHOST, 0x21, VhostVringFile);
nix::ioctl_write_ptr!(vhost_net_set_backend, VHOST, 0x30, VhostVringFile);

// TUNSETIFF takes an ifreq pointer but is declared with an int payload.
nix::ioctl_write_ptr_bad!(
    tun_set_iff,
    nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
    libc::ifreq
);

/// The vhost-net control endpoint plus the TAP device backing both queues.
pub struct VhostNet {
    tap: OwnedFd,
    vhost: OwnedFd,
}

impl VhostNet {
    /// Open the TAP device, claim a vhost-net worker, advertise the identity
    /// memory region and negotiate `features`.
    pub fn open(tap_device: &str, features: u64) -> Result<Self, NetError> {
        let tap = open_tap(tap_device)?;
        let vhost: OwnedFd = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vhost-net")
            .map_err(|err| NetError::Vhost(format!("open /dev/vhost-net: {err}")))
            .map(File::into)?;

        // Safety: fd is a live vhost-net fd; the ioctls only read the
        // structs we pass.
        unsafe {
            vhost_set_owner(vhost.as_raw_fd())
                .map_err(|err| NetError::Vhost(format!("VHOST_SET_OWNER: {err}")))?;

            let mem = VhostMemory {
                nregions: 1,
                padding: 0,
                regions: [VhostMemoryRegion {
                    guest_phys_addr: 0,
                    memory_size: (1u64 << 47) - 4096,
                    userspace_addr: 0,
                    flags_padding: 0,
                }],
            };
            vhost_set_mem_table(vhost.as_raw_fd(), &mem)
                .map_err(|err| NetError::Vhost(format!("VHOST_SET_MEM_TABLE: {err}")))?;

            vhost_set_features(vhost.as_raw_fd(), &features)
                .map_err(|err| NetError::Vhost(format!("VHOST_SET_FEATURES: {err}")))?;
        }

        tracing::debug!(tap = tap_device, features, "vhost-net worker configured");
        Ok(Self { tap, vhost })
    }

    /// Register one queue: ring size, region addresses, and the kick/call
    /// eventfds. Each queue gets its own kick fd.
    pub fn setup_queue(
        &self,
        index: u32,
        config: &VringConfig,
        kick_fd: RawFd,
        call_fd: RawFd,
    ) -> Result<(), NetError> {
        let fd = self.vhost.as_raw_fd();
        // Safety: as in `open`.
        unsafe {
            let num = VhostVringState {
                index,
                num: config.size as u32,
            };
            vhost_set_vring_num(fd, &num)
                .map_err(|err| NetError::Vhost(format!("VHOST_SET_VRING_NUM[{index}]: {err}")))?;

            let addr = VhostVringAddr {
                index,
                flags: 0,
                desc_user_addr: config.descs as u64,
                used_user_addr: config.used as u64,
                avail_user_addr: config.avail as u64,
                log_guest_addr: 0,
            };
            vhost_set_vring_addr(fd, &addr)
                .map_err(|err| NetError::Vhost(format!("VHOST_SET_VRING_ADDR[{index}]: {err}")))?;

            let kick = VhostVringFile { index, fd: kick_fd };
            vhost_set_vring_kick(fd, &kick)
                .map_err(|err| NetError::Vhost(format!("VHOST_SET_VRING_KICK[{index}]: {err}")))?;

            let call = VhostVringFile { index, fd: call_fd };
            vhost_set_vring_call(fd, &call)
                .map_err(|err| NetError::Vhost(format!("VHOST_SET_VRING_CALL[{index}]: {err}")))?;
        }
        Ok(())
    }

    /// Bind the TAP fd as the queue's backend; packets start flowing once
    /// both queues are bound.
    pub fn set_backend(&self, index: u32) -> Result<(), NetError> {
        let backend = VhostVringFile {
            index,
            fd: self.tap.as_raw_fd(),
        };
        // Safety: as in `open`.
        unsafe {
            vhost_net_set_backend(self.vhost.as_raw_fd(), &backend)
                .map_err(|err| NetError::Vhost(format!("VHOST_NET_SET_BACKEND[{index}]: {err}")))?;
        }
        Ok(())
    }
}

fn open_tap(name: &str) -> Result<OwnedFd, NetError> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(NetError::Tap(format!("bad tap device name: {name:?}")));
    }
    let tap: OwnedFd = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open("/dev/net/tun")
        .map_err(|err| NetError::Tap(format!("open /dev/net/tun: {err}")))
        .map(File::into)?;

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI | IFF_ONE_QUEUE | IFF_VNET_HDR;

    // Safety: the fd is a live tun fd and ifr is fully initialized.
    unsafe {
        tun_set_iff(tap.as_raw_fd(), &ifr)
            .map_err(|err| NetError::Tap(format!("TUNSETIFF {name}: {err}")))?;
    }
    Ok(tap)
}

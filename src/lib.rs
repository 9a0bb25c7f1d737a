//! User-space virtio-net over vhost.
//!
//! The host kernel's vhost-net worker processes our virtqueues directly
//! against a TAP device; this crate owns the guest-driver side of that
//! contract: the split-queue engine, the packet-oriented net device on top
//! of it, and an ARP resolver for mapping network-layer addresses onto the
//! resulting link. Linux-only.

mod arp;
mod device;
mod error;
mod ethernet;
mod mem;
mod notify;
mod packet;
pub mod ring;
mod vhost;

pub use arp::{ArpResolver, FrameSender, Ipv4, L3Protocol, ARP_OP_REPLY, ARP_OP_REQUEST};
pub use device::{NetConfig, NetDevice, DEFAULT_HW_ADDR};
pub use error::NetError;
pub use ethernet::{EthernetAddress, ARP_HTYPE_ETHERNET, ETH_ALEN};
pub use mem::HostBuffer;
pub use notify::{ReadableEventFd, WriteableEventFd};
pub use packet::{Fragment, Fragments, Packet};
pub use vhost::{
    VhostNet, VIRTIO_NET_F_MRG_RXBUF, VIRTIO_RING_F_EVENT_IDX, VIRTIO_RING_F_INDIRECT_DESC,
};

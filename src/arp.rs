//! Address resolution.
//!
//! One resolver instance per network-layer protocol, generic over the
//! protocol's address type. Lookups that miss the table register a waiter;
//! only the first waiter per target puts a query on the wire, and a single
//! learned reply fans out to every waiter. The resolver answers requests
//! for its own address once `set_self_addr` has been called.

use crate::error::NetError;
use crate::ethernet::{EthernetAddress, ARP_HTYPE_ETHERNET, ETH_ALEN};
use crate::packet::Packet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

/// Capabilities the resolver needs from a network-layer protocol.
pub trait L3Protocol: Send + Sync + 'static {
    type Address: Copy + Eq + Hash + fmt::Display + Send + Sync + 'static;

    /// The protocol number carried in the ARP `ptype` field.
    fn arp_protocol_type() -> u16;
    /// The protocol's broadcast address, doubling as "unset".
    fn broadcast_address() -> Self::Address;
    /// Wire length of one address (`plen`).
    fn address_len() -> usize;
    fn write_address(addr: &Self::Address, out: &mut [u8]);
    fn read_address(raw: &[u8]) -> Self::Address;
}

pub struct Ipv4;

impl L3Protocol for Ipv4 {
    type Address = Ipv4Addr;

    fn arp_protocol_type() -> u16 {
        0x0800
    }

    fn broadcast_address() -> Ipv4Addr {
        Ipv4Addr::BROADCAST
    }

    fn address_len() -> usize {
        4
    }

    fn write_address(addr: &Ipv4Addr, out: &mut [u8]) {
        out[..4].copy_from_slice(&addr.octets());
    }

    fn read_address(raw: &[u8]) -> Ipv4Addr {
        Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])
    }
}

/// Link-layer seam: delivers an ARP payload to a destination hardware
/// address. The ethernet header itself belongs to the caller's frame layer.
#[async_trait]
pub trait FrameSender: Send + Sync {
    async fn send(&self, dst: EthernetAddress, payload: Packet) -> Result<(), NetError>;
}

struct ArpHdr<A> {
    htype: u16,
    ptype: u16,
    oper: u16,
    sender_hwaddr: EthernetAddress,
    sender_paddr: A,
    target_hwaddr: EthernetAddress,
    target_paddr: A,
}

fn wire_len<L3: L3Protocol>() -> usize {
    8 + 2 * (ETH_ALEN + L3::address_len())
}

fn encode<L3: L3Protocol>(hdr: &ArpHdr<L3::Address>) -> Vec<u8> {
    let alen = L3::address_len();
    let mut out = vec![0u8; wire_len::<L3>()];
    out[0..2].copy_from_slice(&hdr.htype.to_be_bytes());
    out[2..4].copy_from_slice(&hdr.ptype.to_be_bytes());
    out[4] = ETH_ALEN as u8;
    out[5] = alen as u8;
    out[6..8].copy_from_slice(&hdr.oper.to_be_bytes());
    let mut at = 8;
    hdr.sender_hwaddr.write_to(&mut out[at..]);
    at += ETH_ALEN;
    L3::write_address(&hdr.sender_paddr, &mut out[at..]);
    at += alen;
    hdr.target_hwaddr.write_to(&mut out[at..]);
    at += ETH_ALEN;
    L3::write_address(&hdr.target_paddr, &mut out[at..]);
    out
}

/// `None` means the header does not parse for this protocol and the frame
/// is to be dropped silently.
fn decode<L3: L3Protocol>(raw: &[u8]) -> Option<ArpHdr<L3::Address>> {
    let alen = L3::address_len();
    if raw.len() < wire_len::<L3>() {
        return None;
    }
    if raw[4] as usize != ETH_ALEN || raw[5] as usize != alen {
        return None;
    }
    let mut at = 8;
    let sender_hwaddr = EthernetAddress::from_bytes(&raw[at..]);
    at += ETH_ALEN;
    let sender_paddr = L3::read_address(&raw[at..]);
    at += alen;
    let target_hwaddr = EthernetAddress::from_bytes(&raw[at..]);
    at += ETH_ALEN;
    let target_paddr = L3::read_address(&raw[at..]);
    Some(ArpHdr {
        htype: u16::from_be_bytes([raw[0], raw[1]]),
        ptype: u16::from_be_bytes([raw[2], raw[3]]),
        oper: u16::from_be_bytes([raw[6], raw[7]]),
        sender_hwaddr,
        sender_paddr,
        target_hwaddr,
        target_paddr,
    })
}

struct Resolution {
    waiters: Vec<oneshot::Sender<EthernetAddress>>,
}

struct ResolverState<L3: L3Protocol> {
    self_l3: L3::Address,
    table: HashMap<L3::Address, EthernetAddress>,
    in_progress: HashMap<L3::Address, Resolution>,
}

pub struct ArpResolver<L3: L3Protocol> {
    self_l2: EthernetAddress,
    link: Arc<dyn FrameSender>,
    state: Mutex<ResolverState<L3>>,
}

impl<L3: L3Protocol> ArpResolver<L3> {
    pub fn new(self_l2: EthernetAddress, link: Arc<dyn FrameSender>) -> Self {
        Self {
            self_l2,
            link,
            state: Mutex::new(ResolverState {
                self_l3: L3::broadcast_address(),
                table: HashMap::new(),
                in_progress: HashMap::new(),
            }),
        }
    }

    /// Set the local protocol address. Requests arriving before this are
    /// not answered.
    pub fn set_self_addr(&self, addr: L3::Address) {
        self.lock_state().self_l3 = addr;
    }

    /// Resolve `addr` to a hardware address, querying the wire on a miss.
    /// Concurrent lookups for the same address share one outstanding query.
    pub async fn lookup(&self, addr: L3::Address) -> Result<EthernetAddress, NetError> {
        let (rx, query) = {
            let mut state = self.lock_state();
            if let Some(l2) = state.table.get(&addr) {
                return Ok(*l2);
            }
            let (tx, rx) = oneshot::channel();
            let resolution = state
                .in_progress
                .entry(addr)
                .or_insert_with(|| Resolution { waiters: Vec::new() });
            resolution.waiters.push(tx);
            let first = resolution.waiters.len() == 1;
            let self_l3 = state.self_l3;
            (rx, first.then_some(self_l3))
        };

        if let Some(self_l3) = query {
            tracing::debug!(%addr, "sending arp query");
            let request = ArpHdr {
                htype: ARP_HTYPE_ETHERNET,
                ptype: L3::arp_protocol_type(),
                oper: ARP_OP_REQUEST,
                sender_hwaddr: self.self_l2,
                sender_paddr: self_l3,
                target_hwaddr: EthernetAddress::BROADCAST,
                target_paddr: addr,
            };
            let packet = Packet::from_vec(encode::<L3>(&request));
            self.link.send(EthernetAddress::BROADCAST, packet).await?;
        }

        rx.await.map_err(|_| NetError::ResolutionAborted)
    }

    /// Install a mapping and fulfil every waiter pending on it.
    pub fn learn(&self, l2: EthernetAddress, l3: L3::Address) {
        let waiters = {
            let mut state = self.lock_state();
            state.table.insert(l3, l2);
            state.in_progress.remove(&l3)
        };
        if let Some(resolution) = waiters {
            tracing::debug!(l3 = %l3, l2 = %l2, waiters = resolution.waiters.len(), "resolved");
            for waiter in resolution.waiters {
                let _ = waiter.send(l2);
            }
        }
    }

    /// Consume one ARP frame. Malformed frames are dropped silently;
    /// requests for the local address are answered; replies are learned.
    pub async fn received(&self, packet: Packet) -> Result<(), NetError> {
        let mut raw = vec![0u8; wire_len::<L3>()];
        let copied = packet.copy_into(&mut raw);
        if copied < raw.len() {
            return Ok(());
        }
        let Some(hdr) = decode::<L3>(&raw) else {
            tracing::debug!("dropping malformed arp frame");
            return Ok(());
        };
        match hdr.oper {
            ARP_OP_REQUEST => self.handle_request(hdr).await,
            ARP_OP_REPLY => {
                self.learn(hdr.sender_hwaddr, hdr.sender_paddr);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_request(&self, hdr: ArpHdr<L3::Address>) -> Result<(), NetError> {
        let self_l3 = self.lock_state().self_l3;
        if self_l3 == L3::broadcast_address() || hdr.target_paddr != self_l3 {
            return Ok(());
        }
        let reply = ArpHdr {
            htype: hdr.htype,
            ptype: hdr.ptype,
            oper: ARP_OP_REPLY,
            sender_hwaddr: self.self_l2,
            sender_paddr: self_l3,
            target_hwaddr: hdr.sender_hwaddr,
            target_paddr: hdr.sender_paddr,
        };
        let packet = Packet::from_vec(encode::<L3>(&reply));
        self.link.send(hdr.sender_hwaddr, packet).await
    }

    fn lock_state(&self) -> MutexGuard<'_, ResolverState<L3>> {
        self.state.lock().expect("arp state mutex poisoned")
    }

    #[cfg(test)]
    fn cached(&self, addr: L3::Address) -> Option<EthernetAddress> {
        self.lock_state().table.get(&addr).copied()
    }
}

//! Virtio-net device over vhost.
//!
//! Wires two rings (RX at index 0, TX at index 1) to a packet send/receive
//! interface. The TX producer drains an internal packet queue, prepends the
//! virtio-net header and emits one peer-read chain per packet; the RX
//! producer keeps the ring stocked with page-sized peer-write buffers whose
//! completions strip the header and land packets on the receive queue.

use crate::error::NetError;
use crate::ethernet::EthernetAddress;
use crate::mem::HostBuffer;
use crate::notify::{ReadableEventFd, WriteableEventFd};
use crate::packet::{Fragment, Packet};
use crate::ring::layout::RingMemory;
use crate::ring::{Buffer, BufferChain, CompleteFn, Producer, RingHandle, Vring, VringConfig};
use crate::vhost::{VhostNet, VIRTIO_NET_F_MRG_RXBUF, VIRTIO_RING_F_INDIRECT_DESC};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

const QUEUE_SIZE: usize = 256;
const RX_INDEX: u32 = 0;
const TX_INDEX: u32 = 1;
const RX_BUFFER_SIZE: usize = 4096;

/// Virtio-net header prepended to every frame, little-endian on the wire:
/// {flags, gso_type, hdr_len, gso_size, csum_start, csum_offset} plus
/// num_buffers with mergeable receive buffers. Every field stays zero here
/// (no offloads), but the header must be present: the peer requires
/// `hdr_len` to exist even with GSO disabled.
const VNET_HDR_LEN: usize = 10;
const VNET_HDR_MRG_LEN: usize = 12;

/// Locally administered default; override per device.
pub const DEFAULT_HW_ADDR: EthernetAddress = EthernetAddress([0x02, 0x76, 0x71, 0x6e, 0x65, 0x74]);

#[derive(Clone)]
pub struct NetConfig {
    pub tap_device: String,
    pub hw_addr: EthernetAddress,
    pub mergeable_rx_buffers: bool,
}

impl NetConfig {
    pub fn new(tap_device: impl Into<String>) -> Self {
        Self {
            tap_device: tap_device.into(),
            hw_addr: DEFAULT_HW_ADDR,
            mergeable_rx_buffers: false,
        }
    }
}

struct DeviceShared {
    header_len: usize,
    // TODO: bound the tx queue and propagate backpressure through send().
    tx_queue: Mutex<VecDeque<Packet>>,
    tx_pending: Semaphore,
    rx_queue: Mutex<VecDeque<Packet>>,
    rx_pending: Semaphore,
}

impl DeviceShared {
    fn new(header_len: usize) -> Arc<Self> {
        Arc::new(Self {
            header_len,
            tx_queue: Mutex::new(VecDeque::new()),
            tx_pending: Semaphore::new(0),
            rx_queue: Mutex::new(VecDeque::new()),
            rx_pending: Semaphore::new(0),
        })
    }

    fn post_tx(&self, packet: Packet) {
        self.tx_queue
            .lock()
            .expect("tx queue mutex poisoned")
            .push_back(packet);
        self.tx_pending.add_permits(1);
    }

    async fn pop_tx(&self) -> Result<Packet, NetError> {
        let permit = self
            .tx_pending
            .acquire()
            .await
            .map_err(|_| NetError::DeviceStopped)?;
        permit.forget();
        let packet = self
            .tx_queue
            .lock()
            .expect("tx queue mutex poisoned")
            .pop_front();
        Ok(packet.expect("tx queue behind its semaphore"))
    }

    fn queue_rx(&self, packet: Packet) {
        self.rx_queue
            .lock()
            .expect("rx queue mutex poisoned")
            .push_back(packet);
        self.rx_pending.add_permits(1);
    }

    async fn next_rx(&self) -> Result<Packet, NetError> {
        let permit = self
            .rx_pending
            .acquire()
            .await
            .map_err(|_| NetError::DeviceStopped)?;
        permit.forget();
        let packet = self
            .rx_queue
            .lock()
            .expect("rx queue mutex poisoned")
            .pop_front();
        Ok(packet.expect("rx queue behind its semaphore"))
    }

    /// Reject pending and future waiters; the ring producers stop on their
    /// next wait.
    fn close(&self) {
        self.tx_pending.close();
        self.rx_pending.close();
    }
}

struct TxProducer {
    shared: Arc<DeviceShared>,
}

#[async_trait]
impl Producer for TxProducer {
    async fn produce(&mut self, available: &Semaphore) -> Result<Vec<BufferChain>, NetError> {
        let packet = self.shared.pop_tx().await?;
        let packet = packet.prepend(Fragment::from_vec(vec![0u8; self.shared.header_len]));
        let fragments = packet.fragment_count();
        let permit = available
            .acquire_many(fragments as u32)
            .await
            .map_err(|_| NetError::DeviceStopped)?;
        permit.forget();

        let mut chain: BufferChain = packet
            .fragments()
            .map(|frag| Buffer {
                addr: frag.base() as u64,
                len: frag.len() as u32,
                writeable: false,
                completed: None,
            })
            .collect();
        // The head completion keeps the packet (and thus every fragment the
        // descriptors point at) alive until the peer is done with it.
        chain[0].completed = Some(Box::new(move |_written| drop(packet)));
        Ok(vec![chain])
    }
}

struct RxProducer {
    shared: Arc<DeviceShared>,
}

impl RxProducer {
    fn receive_buffer(&self) -> BufferChain {
        let buf = HostBuffer::zeroed(RX_BUFFER_SIZE, 4096);
        let addr = buf.as_ptr() as u64;
        let shared = Arc::clone(&self.shared);
        let completed: CompleteFn = Box::new(move |written| {
            let written = written as usize;
            if written < shared.header_len || written > RX_BUFFER_SIZE {
                tracing::debug!(written, "dropping runt rx buffer");
                return;
            }
            shared.queue_rx(Packet::from_host_buffer(buf, shared.header_len..written));
        });
        vec![Buffer {
            addr,
            len: RX_BUFFER_SIZE as u32,
            writeable: true,
            completed: Some(completed),
        }]
    }
}

#[async_trait]
impl Producer for RxProducer {
    async fn produce(&mut self, available: &Semaphore) -> Result<Vec<BufferChain>, NetError> {
        let permit = available
            .acquire()
            .await
            .map_err(|_| NetError::DeviceStopped)?;
        permit.forget();
        // Opportunistically top the ring up with whatever is free right now.
        let mut count = 1;
        let extra = available.available_permits();
        if extra > 0 {
            if let Ok(permit) = available.try_acquire_many(extra as u32) {
                permit.forget();
                count += extra;
            }
        }
        Ok((0..count).map(|_| self.receive_buffer()).collect())
    }
}

/// A running virtio-net device.
pub struct NetDevice {
    // Declaration order is drop order: stop the ring tasks, then release the
    // vhost worker and TAP, then the queues.
    _tx_handle: RingHandle,
    _rx_handle: RingHandle,
    _tx_ring: Arc<Vring>,
    _rx_ring: Arc<Vring>,
    _backend: VhostNet,
    shared: Arc<DeviceShared>,
    hw_addr: EthernetAddress,
}

impl NetDevice {
    /// Bring the device up: TAP, vhost worker, both rings. Must be called
    /// within a tokio runtime. Either returns a running device or a
    /// configuration error.
    pub fn new(config: NetConfig) -> Result<Self, NetError> {
        let header_len = if config.mergeable_rx_buffers {
            VNET_HDR_MRG_LEN
        } else {
            VNET_HDR_LEN
        };
        let mut features = VIRTIO_RING_F_INDIRECT_DESC;
        if config.mergeable_rx_buffers {
            features |= VIRTIO_NET_F_MRG_RXBUF;
        }
        let backend = VhostNet::open(&config.tap_device, features)?;

        let tx_mem = RingMemory::allocate(QUEUE_SIZE);
        let rx_mem = RingMemory::allocate(QUEUE_SIZE);
        let tx_config = VringConfig::from_memory(&tx_mem, false, false, false);
        let rx_config = VringConfig::from_memory(&rx_mem, false, false, config.mergeable_rx_buffers);

        let tx_notified = ReadableEventFd::new()?;
        let tx_kick = WriteableEventFd::new()?;
        let rx_notified = ReadableEventFd::new()?;
        let rx_kick = WriteableEventFd::new()?;

        backend.setup_queue(RX_INDEX, &rx_config, rx_kick.read_fd(), rx_notified.write_fd())?;
        backend.setup_queue(TX_INDEX, &tx_config, tx_kick.read_fd(), tx_notified.write_fd())?;
        backend.set_backend(RX_INDEX)?;
        backend.set_backend(TX_INDEX)?;

        let shared = DeviceShared::new(header_len);
        let tx_ring = Arc::new(Vring::new(tx_config, Some(tx_mem), tx_notified, tx_kick));
        let rx_ring = Arc::new(Vring::new(rx_config, Some(rx_mem), rx_notified, rx_kick));
        let tx_handle = tx_ring.clone().run(Box::new(TxProducer {
            shared: Arc::clone(&shared),
        }));
        let rx_handle = rx_ring.clone().run(Box::new(RxProducer {
            shared: Arc::clone(&shared),
        }));

        tracing::info!(tap = %config.tap_device, hw = %config.hw_addr, "virtio-net device running");
        Ok(Self {
            _tx_handle: tx_handle,
            _rx_handle: rx_handle,
            _tx_ring: tx_ring,
            _rx_ring: rx_ring,
            _backend: backend,
            shared,
            hw_addr: config.hw_addr,
        })
    }

    /// Queue a packet for transmission. Resolves on admission to the TX
    /// queue, not on transmission.
    pub async fn send(&self, packet: Packet) -> Result<(), NetError> {
        self.shared.post_tx(packet);
        Ok(())
    }

    /// Next received packet, in the order the peer completed them.
    pub async fn receive(&self) -> Result<Packet, NetError> {
        self.shared.next_rx().await
    }

    pub fn hw_address(&self) -> EthernetAddress {
        self.hw_addr
    }
}

impl Drop for NetDevice {
    fn drop(&mut self) {
        self.shared.close();
    }
}

//! Virtqueue engine.
//!
//! One `Vring` drives a split-queue ring shared with an asynchronous vhost
//! peer: a producer yields buffer chains which get published to the avail
//! ring, the peer posts completed chains to the used ring, and a reap loop
//! fires each chain's completion and recycles its descriptors. All engine
//! state (free list head, avail head, used tail, completion table) sits
//! behind one mutex; coordination with the peer is purely the split-queue
//! memory-order discipline plus the two eventfd endpoints.

pub mod layout;
#[cfg(test)]
pub(crate) mod testing;

use crate::error::NetError;
use crate::notify::{ReadableEventFd, WriteableEventFd};
use async_trait::async_trait;
use layout::{
    AvailRing, Descriptor, RingMemory, UsedRing, VIRTQ_AVAIL_F_NO_INTERRUPT, VIRTQ_DESC_F_NEXT,
    VIRTQ_DESC_F_WRITE, VIRTQ_USED_F_NO_NOTIFY,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// End marker for the descriptor free list threaded through `next` fields.
const FREE_LIST_END: u16 = u16::MAX;

/// Completion for a buffer chain, fired exactly once on the reap path with
/// the total bytes the peer reported. Invoked with the engine lock held:
/// keep it short and do not call back into the ring.
pub type CompleteFn = Box<dyn FnOnce(u32) + Send>;

/// One buffer handed to the peer. `writeable` marks peer-write (RX) buffers;
/// only a chain's first buffer normally carries the completion.
pub struct Buffer {
    pub addr: u64,
    pub len: u32,
    pub writeable: bool,
    pub completed: Option<CompleteFn>,
}

/// A non-empty ordered sequence of buffers forming one request.
pub type BufferChain = Vec<Buffer>;

/// Pull-style source of buffer chains. The engine invokes `produce` exactly
/// once at a time per ring, in a loop; the implementation must wait on
/// `available` for every descriptor its chains will consume before
/// returning them. Returning `Err` stops the ring's producer loop.
#[async_trait]
pub trait Producer: Send {
    async fn produce(&mut self, available: &Semaphore) -> Result<Vec<BufferChain>, NetError>;
}

/// Shared-memory layout plus negotiated ring features.
#[derive(Clone, Copy)]
pub struct VringConfig {
    pub descs: *mut u8,
    pub avail: *mut u8,
    pub used: *mut u8,
    pub size: usize,
    pub event_index: bool,
    pub indirect: bool,
    pub mergeable_buffers: bool,
}

impl VringConfig {
    /// Direct layout over `mem` with the given feature bits.
    pub fn from_memory(mem: &RingMemory, event_index: bool, indirect: bool, mergeable_buffers: bool) -> Self {
        Self {
            descs: mem.descs(),
            avail: mem.avail(),
            used: mem.used(),
            size: mem.size(),
            event_index,
            indirect,
            mergeable_buffers,
        }
    }
}

// Safety: the pointers are plain addresses into ring storage; all access to
// the memory behind them goes through Vring's synchronized accessors.
unsafe impl Send for VringConfig {}

struct VringState {
    free_head: u16,
    avail_head: u16,
    used_tail: u16,
    completions: Vec<Option<CompleteFn>>,
}

pub struct Vring {
    config: VringConfig,
    mask: u16,
    descs: *mut Descriptor,
    avail: AvailRing,
    used: UsedRing,
    available: Semaphore,
    notified: ReadableEventFd,
    kick: WriteableEventFd,
    state: Mutex<VringState>,
    // Keeps the ring storage alive as long as any task holds the ring.
    _storage: Option<RingMemory>,
}

// Safety: the descriptor table is written only under the state mutex, the
// avail/used indices are accessed with the atomic orderings the split-queue
// protocol prescribes, and the peer lives in another address space.
unsafe impl Send for Vring {}
unsafe impl Sync for Vring {}

impl Vring {
    pub fn new(
        config: VringConfig,
        storage: Option<RingMemory>,
        notified: ReadableEventFd,
        kick: WriteableEventFd,
    ) -> Self {
        assert!(
            config.size.is_power_of_two() && config.size <= 32768,
            "bad ring size {}",
            config.size
        );
        let ring = Self {
            config,
            mask: (config.size - 1) as u16,
            descs: config.descs as *mut Descriptor,
            // Safety: config points at a live layout of `config.size` entries.
            avail: unsafe { AvailRing::new(config.avail) },
            used: unsafe { UsedRing::new(config.used) },
            available: Semaphore::new(0),
            notified,
            kick,
            state: Mutex::new(VringState {
                free_head: FREE_LIST_END,
                avail_head: 0,
                used_tail: 0,
                completions: (0..config.size).map(|_| None).collect(),
            }),
            _storage: storage,
        };
        let mut state = ring.lock_state();
        for id in 0..config.size as u16 {
            ring.free_desc(&mut state, id);
        }
        drop(state);
        ring
    }

    /// Start the producer and reap loops. Dropping the returned handle
    /// aborts both.
    pub fn run(self: Arc<Self>, mut producer: Box<dyn Producer>) -> RingHandle {
        let ring = Arc::clone(&self);
        let producer_task = tokio::spawn(async move {
            loop {
                let chains = match producer.produce(&ring.available).await {
                    Ok(chains) => chains,
                    Err(err) => {
                        tracing::debug!(error = %err, "ring producer stopped");
                        break;
                    }
                };
                ring.publish(chains);
                ring.complete();
            }
        });
        let ring = self;
        let reap_task = tokio::spawn(async move {
            loop {
                ring.complete();
                if let Err(err) = ring.notified.wait().await {
                    tracing::debug!(error = %err, "ring notify endpoint closed");
                    break;
                }
            }
        });
        RingHandle {
            tasks: [producer_task, reap_task],
        }
    }

    /// Total number of descriptors in the ring.
    pub fn size(&self) -> usize {
        self.config.size
    }

    /// Current free-list length, mirrored by the available-descriptors
    /// semaphore.
    pub fn free_descriptors(&self) -> usize {
        self.available.available_permits()
    }

    pub fn enable_interrupts(&self) {
        self.avail.flags().store(0, Ordering::Relaxed);
    }

    /// Advise the peer that we do not need used-ring interrupts. The hint is
    /// unreliable; the reap loop stays correct either way.
    pub fn disable_interrupts(&self) {
        self.avail.flags().store(VIRTQ_AVAIL_F_NO_INTERRUPT, Ordering::Relaxed);
    }

    /// Publish a batch of chains to the avail ring and kick the peer.
    fn publish(&self, chains: Vec<BufferChain>) {
        if chains.is_empty() {
            return;
        }
        let mut state = self.lock_state();
        for mut chain in chains {
            assert!(!chain.is_empty(), "empty buffer chain");
            let mut has_next = false;
            let mut next_idx = 0u16;
            let mut head = 0u16;
            for buf in chain.iter_mut().rev() {
                let id = self.allocate_desc(&mut state);
                let mut flags = 0u16;
                if buf.writeable {
                    flags |= VIRTQ_DESC_F_WRITE;
                }
                if has_next {
                    flags |= VIRTQ_DESC_F_NEXT;
                }
                self.write_desc(
                    id,
                    Descriptor {
                        addr: buf.addr,
                        len: buf.len,
                        flags,
                        next: next_idx,
                    },
                );
                state.completions[id as usize] = buf.completed.take();
                has_next = true;
                next_idx = id;
                head = id;
            }
            self.avail.write_entry((state.avail_head & self.mask) as usize, head);
            state.avail_head = state.avail_head.wrapping_add(1);
        }
        // Descriptor and ring-slot writes must be visible before the index.
        self.avail.idx().store(state.avail_head, Ordering::Release);
        drop(state);

        if self.used.flags().load(Ordering::Relaxed) & VIRTQ_USED_F_NO_NOTIFY == 0 {
            if let Err(err) = self.kick.signal(1) {
                tracing::warn!(error = %err, "kick failed");
            }
        }
    }

    /// Drain the used ring: fire completions in the order the peer posted
    /// them and return every reaped descriptor to the free list.
    fn complete(&self) {
        let mut state = self.lock_state();
        loop {
            let used_idx = self.used.idx().load(Ordering::Acquire);
            if state.used_tail == used_idx {
                break;
            }
            while state.used_tail != used_idx {
                let elem = self.used.read_elem((state.used_tail & self.mask) as usize);
                state.used_tail = state.used_tail.wrapping_add(1);
                if elem.id as usize >= self.config.size {
                    // Shared memory no longer obeys the ring protocol; there
                    // is no safe way to continue.
                    tracing::error!(
                        id = elem.id,
                        size = self.config.size,
                        "used ring returned descriptor id out of range"
                    );
                    std::process::abort();
                }
                let completion = state.completions[elem.id as usize].take();
                if let Some(complete) = completion {
                    complete(elem.len);
                }
                let mut id = elem.id as u16;
                loop {
                    let desc = self.read_desc(id);
                    let next = desc.next;
                    let has_next = desc.flags & VIRTQ_DESC_F_NEXT != 0;
                    self.free_desc(&mut state, id);
                    if !has_next {
                        break;
                    }
                    id = next;
                }
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, VringState> {
        self.state.lock().expect("vring state mutex poisoned")
    }

    fn allocate_desc(&self, state: &mut VringState) -> u16 {
        let id = state.free_head;
        // The producer already waited on the semaphore for this descriptor.
        assert!(id != FREE_LIST_END, "descriptor free list exhausted");
        state.free_head = self.read_desc(id).next;
        id
    }

    fn free_desc(&self, state: &mut VringState, id: u16) {
        self.write_desc(
            id,
            Descriptor {
                next: state.free_head,
                ..Descriptor::default()
            },
        );
        state.free_head = id;
        self.available.add_permits(1);
    }

    fn read_desc(&self, id: u16) -> Descriptor {
        // Safety: `id < size` is enforced at every call site; the table is
        // only written by us.
        unsafe { self.descs.add(id as usize).read_volatile() }
    }

    fn write_desc(&self, id: u16, desc: Descriptor) {
        // Safety: as `read_desc`.
        unsafe { self.descs.add(id as usize).write_volatile(desc) }
    }
}

/// Aborts the ring's tasks when dropped.
pub struct RingHandle {
    tasks: [JoinHandle<()>; 2],
}

impl Drop for RingHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{eventually, read_kick, MockPeer};
    use super::*;
    use std::collections::VecDeque;
    use std::sync::mpsc;

    /// Yields one pre-built batch per `produce` call, waiting on the
    /// semaphore for the descriptors each batch needs; pends forever once
    /// the feed is exhausted.
    struct FeedProducer {
        batches: VecDeque<Vec<BufferChain>>,
    }

    #[async_trait]
    impl Producer for FeedProducer {
        async fn produce(&mut self, available: &Semaphore) -> Result<Vec<BufferChain>, NetError> {
            let Some(batch) = self.batches.pop_front() else {
                std::future::pending::<()>().await;
                return Ok(Vec::new());
            };
            let descs: usize = batch.iter().map(Vec::len).sum();
            let permit = available
                .acquire_many(descs as u32)
                .await
                .map_err(|_| NetError::DeviceStopped)?;
            permit.forget();
            Ok(batch)
        }
    }

    fn tagged_chain(addr: u64, len: u32, tag: usize, done: &mpsc::Sender<(usize, u32)>) -> BufferChain {
        let done = done.clone();
        vec![Buffer {
            addr,
            len,
            writeable: false,
            completed: Some(Box::new(move |written| {
                let _ = done.send((tag, written));
            })),
        }]
    }

    struct Rig {
        ring: Arc<Vring>,
        peer: MockPeer,
        kick_fd: std::os::fd::RawFd,
        _handle: RingHandle,
    }

    fn start_ring(size: usize, batches: Vec<Vec<BufferChain>>) -> Rig {
        let mem = RingMemory::allocate(size);
        let config = VringConfig::from_memory(&mem, false, false, false);
        let notified = ReadableEventFd::new().unwrap();
        let kick = WriteableEventFd::new().unwrap();
        let peer = MockPeer::new(config, notified.write_fd());
        let kick_fd = kick.read_fd();
        let ring = Arc::new(Vring::new(config, Some(mem), notified, kick));
        let handle = ring.clone().run(Box::new(FeedProducer {
            batches: batches.into(),
        }));
        Rig {
            ring,
            peer,
            kick_fd,
            _handle: handle,
        }
    }

    #[tokio::test]
    async fn completes_in_peer_order_and_restores_free_list() {
        // Three single-buffer chains; the peer completes them in reverse
        // order with its own lengths.
        let (done_tx, done_rx) = mpsc::channel();
        let batch = vec![
            tagged_chain(0x1000, 100, 0, &done_tx),
            tagged_chain(0x2000, 200, 1, &done_tx),
            tagged_chain(0x3000, 300, 2, &done_tx),
        ];
        let mut rig = start_ring(4, vec![batch]);

        eventually(|| rig.peer.avail_idx() == 3).await;
        assert_eq!(rig.ring.free_descriptors(), 1);
        assert!(read_kick(rig.kick_fd).is_some());

        let heads: Vec<u16> = (0..3).map(|slot| rig.peer.avail_head(slot)).collect();
        for (&head, len) in heads.iter().rev().zip([300u32, 200, 100]) {
            rig.peer.complete_chain(head, len);
        }

        eventually(|| rig.ring.free_descriptors() == 4).await;
        let fired: Vec<(usize, u32)> = done_rx.try_iter().collect();
        assert_eq!(fired, vec![(2, 300), (1, 200), (0, 100)]);
    }

    #[tokio::test]
    async fn submission_blocks_until_a_reap_frees_descriptors() {
        // Five chains against four descriptors: the fifth publish must wait
        // for a completion.
        let (done_tx, _done_rx) = mpsc::channel();
        let batches = (0..5usize)
            .map(|tag| vec![tagged_chain(0x1000 * (tag as u64 + 1), 64, tag, &done_tx)])
            .collect();
        let mut rig = start_ring(4, batches);

        eventually(|| rig.peer.avail_idx() == 4).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(rig.peer.avail_idx(), 4);
        assert_eq!(rig.ring.free_descriptors(), 0);

        let head = rig.peer.avail_head(0);
        rig.peer.complete_chain(head, 64);
        eventually(|| rig.peer.avail_idx() == 5).await;
    }

    #[tokio::test]
    async fn multi_buffer_chain_links_descriptors_in_order() {
        let (done_tx, done_rx) = mpsc::channel();
        let done = done_tx.clone();
        let chain: BufferChain = vec![
            Buffer {
                addr: 0xa000,
                len: 10,
                writeable: false,
                completed: Some(Box::new(move |written| {
                    let _ = done.send((0, written));
                })),
            },
            Buffer {
                addr: 0xb000,
                len: 90,
                writeable: false,
                completed: None,
            },
        ];
        let mut rig = start_ring(4, vec![vec![chain]]);

        eventually(|| rig.peer.avail_idx() == 1).await;
        let head = rig.peer.avail_head(0);
        let first = rig.peer.desc(head);
        assert_eq!(first.addr, 0xa000);
        assert_eq!(first.len, 10);
        assert_eq!(first.flags & VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_NEXT);
        let second = rig.peer.desc(first.next);
        assert_eq!(second.addr, 0xb000);
        assert_eq!(second.len, 90);
        assert_eq!(second.flags & VIRTQ_DESC_F_NEXT, 0);

        rig.peer.complete_chain(head, 100);
        eventually(|| rig.ring.free_descriptors() == 4).await;
        assert_eq!(done_rx.try_iter().collect::<Vec<_>>(), vec![(0, 100)]);
    }

    #[tokio::test]
    async fn honours_peer_no_notify_hint() {
        let (done_tx, _done_rx) = mpsc::channel();
        let mem = RingMemory::allocate(4);
        let config = VringConfig::from_memory(&mem, false, false, false);
        let notified = ReadableEventFd::new().unwrap();
        let kick = WriteableEventFd::new().unwrap();
        let peer = MockPeer::new(config, notified.write_fd());
        peer.set_no_notify(true);
        let kick_fd = kick.read_fd();
        let ring = Arc::new(Vring::new(config, Some(mem), notified, kick));
        let _handle = ring.clone().run(Box::new(FeedProducer {
            batches: vec![vec![tagged_chain(0x1000, 8, 0, &done_tx)]].into(),
        }));

        eventually(|| peer.avail_idx() == 1).await;
        assert!(read_kick(kick_fd).is_none());
    }

    #[tokio::test]
    async fn interrupt_toggles_write_avail_flags() {
        let rig = start_ring(4, Vec::new());
        rig.ring.disable_interrupts();
        assert_eq!(rig.peer.avail_flags(), VIRTQ_AVAIL_F_NO_INTERRUPT);
        rig.ring.enable_interrupts();
        assert_eq!(rig.peer.avail_flags(), 0);
    }
}

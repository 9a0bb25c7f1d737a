//! Raw allocations shared with the vhost peer.
//!
//! The peer addresses our memory through an identity guest-physical mapping,
//! so anything it reads or writes (ring storage, receive buffers) must stay
//! at a stable address for as long as a descriptor can reference it. A
//! `HostBuffer` is that owner: a fixed, aligned allocation freed exactly
//! once when dropped.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

pub struct HostBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostBuffer {
    /// Allocate `len` zeroed bytes at the given alignment.
    pub fn zeroed(len: usize, align: usize) -> Self {
        assert!(len > 0, "zero-length host buffer");
        let layout = Layout::from_size_align(len, align).expect("invalid host buffer layout");
        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        // Safety: allocated with this exact layout in `zeroed`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// Safety: the buffer is the sole owner of its allocation; the safe API only
// hands out the base pointer, and coordination with the peer happens through
// the ring protocol, not through this type.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

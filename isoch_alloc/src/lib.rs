//! # isoch_alloc
//!
//! Page-aligned, regioned VM allocator for the isochronous audio
//! transport (`spec.md §4.1`). One VM block is carved into four
//! page-aligned regions: `client` (audio PCM), `cipHeaders`,
//! `isochHeaders`, and `timestamps`. The block is zeroed on acquisition
//! and released only when the allocator is dropped.
//!
//! Grounded on `IsochBufferManager::allocateBuffers` (page-alignment,
//! region layout, zero-on-acquisition, single VM range for DMA
//! registration) and on `bbx_core`'s typed-error-on-allocation-failure
//! idiom.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use isoch_core::{lock_memory, Result, TransportError};

/// 8 bytes of CIP header per cycle.
pub const CIP_HEADER_SIZE: usize = 8;
/// 4 bytes of bus-side isoch header per cycle (hardware-written).
pub const ISOCH_HEADER_SIZE: usize = 4;
/// 4 bytes of timestamp per cycle.
pub const TIMESTAMP_SIZE: usize = 4;
/// 4 bytes per audio channel quadlet (AM824 framing).
pub const BYTES_PER_CHANNEL_QUADLET: usize = 4;

const PAGE_SIZE: usize = 4096;

/// Round `size` up to the next multiple of the page size.
///
/// Grounded on `detail::alignToPage` in `IsochBufferManager.cpp`.
pub fn align_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A `{address, length}` range suitable for bus DMA registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    pub address: usize,
    pub length: usize,
}

/// Page-aligned, regioned VM allocation backing one `Stream`'s transport.
///
/// Owns its VM block exclusively; the block is released only when this
/// value is dropped, which callers must ensure happens after the
/// transport has been confirmed stopped and finalized (`spec.md §3`,
/// Ownership and lifecycle).
pub struct BufferAllocator {
    base: NonNull<u8>,
    layout: Layout,

    total_cycles: usize,
    client_size: usize,
    cip_headers_offset: usize,
    isoch_headers_offset: usize,
    timestamps_offset: usize,

    aligned_client_size: usize,
    aligned_cip_size: usize,
    aligned_isoch_size: usize,
}

// SAFETY: `BufferAllocator` owns a heap allocation accessed only through
// raw-pointer accessors; callers are responsible for the external
// synchronization the spec's segment-ownership protocol already requires.
unsafe impl Send for BufferAllocator {}
unsafe impl Sync for BufferAllocator {}

impl BufferAllocator {
    /// Allocate the four regions for `total_cycles` cycles of `channels`
    /// audio channels. `client_bytes_override`, if given, replaces the
    /// computed `total_cycles * channels * 4` client region size (used
    /// by callers that pack client buffers with a different stride).
    pub fn new(total_cycles: usize, channels: usize, client_bytes_override: Option<usize>) -> Result<Self> {
        if total_cycles == 0 || channels == 0 {
            return Err(TransportError::BadArgument);
        }

        let client_size = client_bytes_override.unwrap_or(total_cycles * channels * BYTES_PER_CHANNEL_QUADLET);
        let cip_headers_size = total_cycles * CIP_HEADER_SIZE;
        let isoch_headers_size = total_cycles * ISOCH_HEADER_SIZE;
        let timestamps_size = total_cycles * TIMESTAMP_SIZE;

        let aligned_client_size = align_to_page(client_size);
        let aligned_cip_size = align_to_page(cip_headers_size);
        let aligned_isoch_size = align_to_page(isoch_headers_size);
        let aligned_timestamps_size = align_to_page(timestamps_size);

        let total_size = aligned_client_size + aligned_cip_size + aligned_isoch_size + aligned_timestamps_size;

        let layout = Layout::from_size_align(total_size, PAGE_SIZE).map_err(|_| TransportError::BadArgument)?;

        // SAFETY: `layout` has non-zero size (total_cycles/channels checked above)
        // and a valid alignment; `alloc_zeroed` satisfies the "zero on
        // acquisition" invariant directly.
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(TransportError::OutOfMemory)?;

        Ok(Self {
            base,
            layout,
            total_cycles,
            client_size,
            cip_headers_offset: aligned_client_size,
            isoch_headers_offset: aligned_client_size + aligned_cip_size,
            timestamps_offset: aligned_client_size + aligned_cip_size + aligned_isoch_size,
            aligned_client_size,
            aligned_cip_size,
            aligned_isoch_size,
        })
    }

    #[inline]
    fn region_ptr(&self, offset: usize) -> *mut u8 {
        // SAFETY: `offset` is always one of the four region offsets computed
        // in `new`, all of which lie within the allocation's total size.
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Base pointer of the `client` (audio PCM) region.
    pub fn client_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Base pointer of the `cipHeaders` region.
    pub fn cip_headers_ptr(&self) -> *mut u8 {
        self.region_ptr(self.cip_headers_offset)
    }

    /// Base pointer of the `isochHeaders` region.
    pub fn isoch_headers_ptr(&self) -> *mut u8 {
        self.region_ptr(self.isoch_headers_offset)
    }

    /// Base pointer of the `timestamps` region.
    pub fn timestamps_ptr(&self) -> *mut u8 {
        self.region_ptr(self.timestamps_offset)
    }

    /// Size in bytes of the `client` region (before page alignment).
    pub fn client_size(&self) -> usize {
        self.client_size
    }

    /// Number of cycles this allocation was sized for.
    pub fn total_cycles(&self) -> usize {
        self.total_cycles
    }

    /// Total VM block size, in bytes (sum of the four page-aligned regions).
    pub fn total_size(&self) -> usize {
        self.layout.size()
    }

    /// The `{address, length}` range for bus DMA registration.
    pub fn dma_range(&self) -> VirtualRange {
        VirtualRange {
            address: self.base.as_ptr() as usize,
            length: self.layout.size(),
        }
    }

    /// `true` exactly for addresses in `[client, client + client_size)`.
    ///
    /// Grounded on `IsochBufferManager::isAddressInClientBuffer`.
    pub fn contains_client_address(&self, addr: *const u8) -> bool {
        let base = self.client_ptr() as usize;
        let addr = addr as usize;
        addr >= base && addr < base + self.client_size
    }

    /// Size actually reserved (page-aligned) for the `cipHeaders` region.
    pub fn cip_headers_capacity(&self) -> usize {
        self.aligned_cip_size
    }

    /// Size actually reserved (page-aligned) for the `isochHeaders` region.
    pub fn isoch_headers_capacity(&self) -> usize {
        self.aligned_isoch_size
    }

    /// Size actually reserved (page-aligned) for the `client` region.
    pub fn client_capacity(&self) -> usize {
        self.aligned_client_size
    }

    /// Best-effort page lock over the whole VM block (`spec.md §5`/`§9`).
    /// Call once at `Stream` startup, after this allocation completes.
    /// Returns `false` on failure; callers treat that as a warning, not
    /// an error.
    pub fn lock_in_memory(&self) -> bool {
        lock_memory(self.base.as_ptr(), self.layout.size())
    }
}

impl Drop for BufferAllocator {
    fn drop(&mut self) {
        // SAFETY: `self.base`/`self.layout` are exactly the pointer and
        // layout returned by the matching `alloc_zeroed` call in `new`.
        unsafe {
            dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

//! Reference-counted handles to page cache entries.
//!
//! A page cache entry owns one physical page and optionally publishes a
//! kernel virtual address once the page has been mapped. Buffers take one
//! reference per cache slot they populate and release it on free or reset;
//! cloning a handle takes a reference, dropping it releases one.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::{PhysAddr, VirtAddr};

#[derive(Debug)]
struct EntryInner {
    physical_address: PhysAddr,
    /// Published kernel virtual address. Zero means no mapping has been
    /// published; VA zero is never a valid kernel mapping.
    virtual_address: AtomicU64,
}

/// A handle to one page cache entry.
///
/// Cloning increments the reference count; when the last handle is dropped
/// the entry is returned to the cache's control.
#[derive(Clone, Debug)]
pub struct PageCacheEntry {
    inner: Arc<EntryInner>,
}

impl PageCacheEntry {
    /// Create an entry for the page at `physical_address`, optionally with
    /// an already-published virtual address.
    pub fn new(physical_address: PhysAddr, virtual_address: Option<VirtAddr>) -> Self {
        Self {
            inner: Arc::new(EntryInner {
                physical_address,
                virtual_address: AtomicU64::new(
                    virtual_address.map_or(0, |address| address.as_u64()),
                ),
            }),
        }
    }

    /// Physical address of the page this entry owns.
    pub fn physical_address(&self) -> PhysAddr {
        self.inner.physical_address
    }

    /// The published kernel virtual address, if any mapper has won the race
    /// to set one.
    pub fn virtual_address(&self) -> Option<VirtAddr> {
        match self.inner.virtual_address.load(Ordering::Acquire) {
            0 => None,
            address => Some(VirtAddr::new(address)),
        }
    }

    /// Publish a virtual address for the page. The first publisher wins;
    /// losing the race is benign because both mappers publish the same
    /// mapping. Returns whether this call set the address.
    pub fn publish_virtual_address(&self, virtual_address: VirtAddr) -> bool {
        self.inner
            .virtual_address
            .compare_exchange(
                0,
                virtual_address.as_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Current reference count on the entry.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

//! Collaborator interface to the rest of the memory manager.
//!
//! The buffer subsystem does not allocate pages, reserve address space, or
//! edit page tables itself; it drives those collaborators through this
//! trait. The kernel supplies one implementation; tests supply a mock.

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::IoBufferError;
use crate::page_cache::PageCacheEntry;

/// One page delivered by [`ImageSection::page_in`].
pub struct PagedInPage {
    /// Base physical address of the now-resident, pinned page.
    pub physical_address: PhysAddr,
    /// Page cache entry backing the page, when the section is file backed.
    /// The reference travels with this value; the receiver owns it.
    pub cache_entry: Option<PageCacheEntry>,
}

/// Failure modes of paging a section page in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageInError {
    /// Transient contention; retry the same page.
    TryAgain,
    /// Hard failure.
    Failed(IoBufferError),
}

/// A reference-counted handle to a user image section. Dropping the handle
/// releases the reference.
pub trait ImageSection {
    /// Base virtual address and size in bytes of the section.
    fn virtual_range(&self) -> (VirtAddr, usize);

    /// Page the page at `page_offset` (in pages from the section base) into
    /// memory and pin it there.
    fn page_in(&self, page_offset: usize) -> Result<PagedInPage, PageInError>;
}

/// Services the buffer subsystem consumes from the memory manager: the
/// physical page allocator, the kernel virtual address space, the page
/// table mapper, image sections, and user-space copy routines.
///
/// All methods are safe to call from any context except where noted;
/// [`MemoryHal::reserve_range`] and [`ImageSection::page_in`] may block.
///
/// # Safety
///
/// Implementations must return valid, exclusively-granted resources:
/// allocated pages and reserved ranges must not be handed out twice,
/// mappings installed by `map_page`/`map_range` must actually be in effect
/// when the call returns, and `release_range` must broadcast a TLB
/// invalidation. The buffer subsystem builds raw pointer accesses on these
/// guarantees.
pub unsafe trait MemoryHal {
    type Section: ImageSection;

    /// Allocate `count` physically contiguous pages with the given byte
    /// alignment (zero or one for no constraint). Returns the base address,
    /// or `None` when physical memory is exhausted.
    fn allocate_pages(count: usize, alignment: usize) -> Option<PhysAddr>;

    /// Return one page to the physical allocator.
    fn free_page(physical_address: PhysAddr);

    /// Release the pin on one page without freeing it.
    fn unlock_page(physical_address: PhysAddr);

    /// Reserve `size` bytes of kernel virtual address space. May block.
    fn reserve_range(size: usize) -> Result<VirtAddr, IoBufferError>;

    /// Release a reserved range, unmapping whatever is mapped there and
    /// broadcasting a TLB invalidation. When `free_physical_pages` is set,
    /// pages found mapped in the range are returned to the allocator.
    fn release_range(
        virtual_address: VirtAddr,
        size: usize,
        free_physical_pages: bool,
    ) -> Result<(), IoBufferError>;

    /// Map one physical page at the given virtual address.
    fn map_page(physical_address: PhysAddr, virtual_address: VirtAddr, flags: PageTableFlags);

    /// Back `[virtual_address, virtual_address + size)` with freshly
    /// allocated physical memory in runs of `run_size` bytes aligned to
    /// `run_alignment`, and map it.
    fn map_range(
        virtual_address: VirtAddr,
        size: usize,
        run_alignment: usize,
        run_size: usize,
        write_through: bool,
        non_cached: bool,
    ) -> Result<(), IoBufferError>;

    /// Resolve a mapped virtual address to its exact physical address
    /// (including the offset within the page), or `None` when nothing is
    /// mapped there.
    fn virtual_to_physical(virtual_address: VirtAddr) -> Option<PhysAddr>;

    /// Find the image section covering the given address in the current
    /// process, taking a reference on it.
    fn lookup_section(virtual_address: VirtAddr) -> Option<Self::Section>;

    /// Copy kernel bytes out to the current user address space.
    fn copy_to_user(destination: VirtAddr, source: &[u8]) -> Result<(), IoBufferError>;

    /// Copy bytes in from the current user address space.
    fn copy_from_user(destination: &mut [u8], source: VirtAddr) -> Result<(), IoBufferError>;

    /// Line size of the first-level data cache.
    fn cpu_cache_line_size() -> usize;

    /// Largest line size registered by any external cache controller.
    fn platform_cache_line_size() -> usize;
}

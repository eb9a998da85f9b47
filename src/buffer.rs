//! The I/O buffer descriptor: construction, queries, and release.
//!
//! Constructors produce a descriptor; callers may map it, mutate it, query
//! it, and finally drop it. Dropping runs the release protocol: unmap if the
//! address range belongs to this subsystem, then free, unlock, or
//! de-reference every page according to the buffer's flags.

use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::mem;
use core::slice;

use x86_64::{PhysAddr, VirtAddr};

use crate::error::IoBufferError;
use crate::flags::BufferFlags;
use crate::fragment::Fragment;
use crate::hal::{ImageSection, MemoryHal, PageInError};
use crate::page_cache::PageCacheEntry;
use crate::{
    align_range_up, is_aligned, page_align_down, page_align_up, KERNEL_VA_START,
    LOCAL_IO_VECTOR_COUNT, MAX_IO_VECTOR_COUNT, PAGE_SHIFT, PAGE_SIZE, USER_VA_END,
};

/// One element of a scatter/gather vector. The layout matches the user-mode
/// ABI so that arrays can be copied in wholesale.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IoVector {
    /// Base address of the element.
    pub base: u64,
    /// Length of the element in bytes.
    pub length: u64,
}

/// Where a scatter/gather vector array lives.
pub enum IoVectorSource<'a> {
    /// The array is kernel memory.
    Kernel(&'a [IoVector]),
    /// The array lives in the current user address space.
    User { base: VirtAddr, count: usize },
}

/// Fragment and cache-slot storage. The inline variant backs the
/// single-page in-place initializer, which must not allocate; everything
/// else reserves heap arrays sized so the worst-case layout fits without
/// reallocation.
#[derive(Debug)]
enum Store {
    Inline {
        fragment: Option<Fragment>,
        cache_entry: Option<PageCacheEntry>,
    },
    Heap {
        fragments: Vec<Fragment>,
        cache_entries: Vec<Option<PageCacheEntry>>,
        /// Pageable data area owned by the descriptor
        /// ([`IoBuffer::allocate_paged`]).
        _backing: Option<Vec<u8>>,
    },
}

/// A scatter/gather descriptor over physical pages.
///
/// Not internally synchronised; callers serialise access per buffer.
pub struct IoBuffer<H: MemoryHal> {
    pub(crate) flags: BufferFlags,
    pub(crate) total_size: usize,
    pub(crate) current_offset: usize,
    pub(crate) page_count: usize,
    pub(crate) max_fragment_count: usize,
    store: Store,
    _hal: PhantomData<H>,
}

impl<H: MemoryHal> core::fmt::Debug for IoBuffer<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("flags", &self.flags)
            .field("total_size", &self.total_size)
            .field("current_offset", &self.current_offset)
            .field("page_count", &self.page_count)
            .field("max_fragment_count", &self.max_fragment_count)
            .field("store", &self.store)
            .finish()
    }
}

impl<H: MemoryHal> IoBuffer<H> {
    /// Allocate memory for use as an I/O buffer. The memory is locked,
    /// mapped virtually contiguous, and remains mapped until the buffer is
    /// dropped.
    ///
    /// `alignment` is the required physical alignment in bytes and is
    /// rounded up to at least a page; `size` is rounded up to the
    /// alignment. When `physically_contiguous` is set the backing is a
    /// single physical run.
    pub fn allocate_non_paged(
        minimum_physical_address: u64,
        maximum_physical_address: u64,
        alignment: usize,
        size: usize,
        physically_contiguous: bool,
        write_through: bool,
        non_cached: bool,
    ) -> Result<Self, IoBufferError> {
        // Aligning up to a page does not work if the value is zero.
        let alignment = if alignment == 0 {
            PAGE_SIZE
        } else {
            align_range_up(alignment, PAGE_SIZE)
        };

        let aligned_size = align_range_up(size, alignment);
        let page_count = aligned_size >> PAGE_SHIFT;

        // TODO: honor the minimum and maximum physical addresses.
        debug_assert!(minimum_physical_address == 0 && maximum_physical_address == u64::MAX);
        let _ = (minimum_physical_address, maximum_physical_address);

        // A physically contiguous buffer needs only one fragment. The page
        // cache slots are always reserved because the pages may later be
        // adopted by the cache.
        let fragment_capacity = if physically_contiguous { 1 } else { page_count };
        let mut buffer = Self {
            flags: BufferFlags::empty(),
            total_size: aligned_size,
            current_offset: 0,
            page_count,
            max_fragment_count: fragment_capacity,
            store: Store::Heap {
                fragments: Vec::with_capacity(fragment_capacity),
                cache_entries: vec![None; page_count],
                _backing: None,
            },
            _hal: PhantomData,
        };

        let virtual_address = H::reserve_range(aligned_size)?;
        let run_alignment = alignment;
        let run_size = if physically_contiguous {
            aligned_size
        } else {
            run_alignment
        };

        match buffer.populate_non_paged(
            virtual_address,
            aligned_size,
            run_alignment,
            run_size,
            physically_contiguous,
            write_through,
            non_cached,
        ) {
            Ok(()) => {
                buffer.flags = BufferFlags::NON_PAGED
                    | BufferFlags::UNMAP_ON_FREE
                    | BufferFlags::MEMORY_OWNED
                    | BufferFlags::MEMORY_LOCKED
                    | BufferFlags::MAPPED
                    | BufferFlags::VIRTUALLY_CONTIGUOUS;
                Ok(buffer)
            }
            Err(error) => {
                // The range may be partially backed; free the physical pages
                // along with it. The flags are still empty, so dropping the
                // buffer releases nothing twice.
                if H::release_range(virtual_address, aligned_size, true).is_err() {
                    log::error!(
                        "leaking {} bytes of kernel address space at {:#x}",
                        aligned_size,
                        virtual_address.as_u64()
                    );
                }
                buffer.clear_fragments();
                Err(error)
            }
        }
    }

    /// Back the reserved range and build the fragment list from the
    /// resulting mappings.
    #[allow(clippy::too_many_arguments)]
    fn populate_non_paged(
        &mut self,
        virtual_address: VirtAddr,
        aligned_size: usize,
        run_alignment: usize,
        run_size: usize,
        physically_contiguous: bool,
        write_through: bool,
        non_cached: bool,
    ) -> Result<(), IoBufferError> {
        H::map_range(
            virtual_address,
            aligned_size,
            run_alignment,
            run_size,
            write_through,
            non_cached,
        )?;

        if physically_contiguous {
            let physical_address = H::virtual_to_physical(virtual_address)
                .ok_or(IoBufferError::InvalidParameter)?;
            self.push_fragment(Fragment::new(
                Some(virtual_address),
                Some(physical_address),
                aligned_size,
            ));
        } else {
            // Walk the new mappings, coalescing physically contiguous runs
            // into shared fragments.
            let mut current = virtual_address.as_u64();
            for _ in 0..self.page_count {
                let page = VirtAddr::new(current);
                let physical_address =
                    H::virtual_to_physical(page).ok_or(IoBufferError::InvalidParameter)?;

                self.coalesce_or_push(
                    Fragment::new(Some(page), Some(physical_address), PAGE_SIZE),
                    |last| last.physically_precedes(physical_address),
                );

                current += PAGE_SIZE as u64;
            }

            debug_assert!(self.fragment_count() <= self.page_count);
        }

        Ok(())
    }

    /// Allocate a pageable I/O buffer. The data area lives directly behind
    /// the descriptor as one virtually contiguous fragment with no known
    /// physical address.
    pub fn allocate_paged(size: usize) -> Self {
        let backing = vec![0u8; size];
        let virtual_address = VirtAddr::from_ptr(backing.as_ptr());

        let mut buffer = Self {
            flags: BufferFlags::VIRTUALLY_CONTIGUOUS | BufferFlags::MAPPED,
            total_size: size,
            current_offset: 0,
            page_count: 0,
            max_fragment_count: 1,
            store: Store::Heap {
                fragments: Vec::with_capacity(1),
                cache_entries: Vec::new(),
                _backing: Some(backing),
            },
            _hal: PhantomData,
        };

        buffer.push_fragment(Fragment::new(Some(virtual_address), None, size));
        buffer
    }

    /// Allocate an uninitialized I/O buffer that the caller will fill in
    /// with pages, one fragment slot per page of `size` (rounded up). When
    /// `cache_backed` is set, per-page cache entry slots are reserved as
    /// well.
    pub fn allocate_uninitialized(size: usize, cache_backed: bool) -> Self {
        let size = align_range_up(size, PAGE_SIZE);
        let page_count = size >> PAGE_SHIFT;

        let mut flags = BufferFlags::NON_PAGED | BufferFlags::EXTENDABLE;
        let cache_entries = if cache_backed {
            flags |= BufferFlags::PAGE_CACHE_BACKED | BufferFlags::MEMORY_LOCKED;
            vec![None; page_count]
        } else {
            Vec::new()
        };

        Self {
            flags,
            total_size: 0,
            current_offset: 0,
            page_count,
            max_fragment_count: page_count,
            store: Store::Heap {
                fragments: Vec::with_capacity(page_count),
                cache_entries,
                _backing: None,
            },
            _hal: PhantomData,
        }
    }

    /// Create an I/O buffer from an existing memory range.
    ///
    /// With `kernel_mode` unset every byte of the range must lie in user
    /// space; violations return an access-violation error. With
    /// `lock_memory` unset the result is a single virtual-only fragment.
    /// With it set, the range is paged in and pinned page by page, taking
    /// over page cache references where the range is section backed.
    ///
    /// Must be called at the lowest dispatch level; locking may block.
    pub fn from_range(
        range: VirtAddr,
        size: usize,
        non_paged: bool,
        lock_memory: bool,
        kernel_mode: bool,
    ) -> Result<Self, IoBufferError> {
        let start = range.as_u64();
        let end = start.checked_add(size as u64);

        let mut flags = BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS;

        // The descriptor metadata placement is recorded so release takes
        // the matching path.
        if non_paged {
            flags |= BufferFlags::NON_PAGED;
        }

        if kernel_mode {
            debug_assert!(start >= KERNEL_VA_START && end.is_some());
        } else {
            let Some(end) = end else {
                return Err(IoBufferError::AccessViolation);
            };
            if start >= USER_VA_END || end > USER_VA_END {
                return Err(IoBufferError::AccessViolation);
            }
            flags |= BufferFlags::USER_MODE;
        }

        if !lock_memory {
            let mut buffer = Self {
                flags,
                total_size: size,
                current_offset: 0,
                page_count: 0,
                max_fragment_count: 1,
                store: Store::Heap {
                    fragments: Vec::with_capacity(1),
                    cache_entries: Vec::new(),
                    _backing: None,
                },
                _hal: PhantomData,
            };
            buffer.push_fragment(Fragment::new(Some(range), None, size));
            return Ok(buffer);
        }

        let page_count =
            ((page_align_up(start + size as u64) - page_align_down(start)) >> PAGE_SHIFT) as usize;

        let mut buffer = Self {
            flags,
            total_size: size,
            current_offset: 0,
            page_count,
            max_fragment_count: page_count,
            store: Store::Heap {
                fragments: Vec::with_capacity(page_count),
                cache_entries: vec![None; page_count],
                _backing: None,
            },
            _hal: PhantomData,
        };

        // On failure the buffer has MEMORY_LOCKED set iff at least one byte
        // was locked, so dropping it unwinds exactly the partial work.
        buffer.lock_range(range, size)?;
        Ok(buffer)
    }

    /// Page in and pin every page of the range, building the fragment list
    /// as it goes.
    fn lock_range(&mut self, range: VirtAddr, size: usize) -> Result<(), IoBufferError> {
        let end = range.as_u64() + size as u64;
        let mut current = range.as_u64();
        let mut page_index = 0usize;
        let mut bytes_locked = 0usize;
        let mut section: Option<H::Section> = None;
        let mut section_end = 0u64;

        let outcome = loop {
            if current >= end {
                break Ok(());
            }

            // Grab the next section when a boundary was just crossed or no
            // lookup has happened yet. Replacing the handle drops the old
            // reference. A page with no section must be non-paged memory.
            if section_end <= current {
                section = H::lookup_section(VirtAddr::new(current));
                if let Some(active) = &section {
                    let (base, section_size) = active.virtual_range();
                    section_end = base.as_u64() + section_size as u64;
                }
            }

            let physical_address = if let Some(active) = &section {
                let (base, _) = active.virtual_range();
                let page_offset =
                    ((page_align_down(current) - page_align_down(base.as_u64())) >> PAGE_SHIFT)
                        as usize;

                match active.page_in(page_offset) {
                    Err(PageInError::TryAgain) => continue,
                    Err(PageInError::Failed(error)) => break Err(error),
                    Ok(page) => {
                        if let Some(entry) = page.cache_entry {
                            // Take over the reference returned by the pager.
                            self.set_cache_slot(page_index, entry);
                            self.flags |= BufferFlags::PAGE_CACHE_BACKED;
                        }
                        page.physical_address + (current - page_align_down(current))
                    }
                }
            } else {
                match H::virtual_to_physical(VirtAddr::new(current)) {
                    Some(physical_address) => physical_address,
                    None => break Err(IoBufferError::InvalidParameter),
                }
            };

            // All fragments are page aligned except possibly the first and
            // the last: the first ends at the next page boundary, the last
            // is clipped at the end of the range.
            let next = page_align_up(current + 1).min(end);
            let fragment_size = (next - current) as usize;
            debug_assert!(fragment_size != 0);

            self.coalesce_or_push(
                Fragment::new(
                    Some(VirtAddr::new(current)),
                    Some(physical_address),
                    fragment_size,
                ),
                |last| last.physically_precedes(physical_address),
            );

            bytes_locked += fragment_size;
            current = next;
            page_index += 1;
        };

        if bytes_locked != 0 {
            self.flags |= BufferFlags::MEMORY_LOCKED;
        }

        outcome
    }

    /// Create a paged user-mode I/O buffer from a scatter/gather vector
    /// array, coalescing virtually adjacent elements and dropping empty
    /// ones. Must be called at the lowest dispatch level.
    pub fn from_vector(source: IoVectorSource<'_>) -> Result<Self, IoBufferError> {
        let count = match &source {
            IoVectorSource::Kernel(elements) => elements.len(),
            IoVectorSource::User { count, .. } => *count,
        };

        if count == 0 || count > MAX_IO_VECTOR_COUNT {
            return Err(IoBufferError::InvalidParameter);
        }

        // User-supplied arrays are copied into kernel storage before
        // validation: a small stack buffer when it fits, a heap array
        // otherwise.
        let mut local = [IoVector::default(); LOCAL_IO_VECTOR_COUNT];
        let mut allocated: Vec<IoVector> = Vec::new();
        let vector: &[IoVector] = match source {
            IoVectorSource::Kernel(elements) => elements,
            IoVectorSource::User { base, count } => {
                let destination: &mut [IoVector] = if count < LOCAL_IO_VECTOR_COUNT {
                    &mut local[..count]
                } else {
                    allocated.resize(count, IoVector::default());
                    &mut allocated[..]
                };

                let byte_count = count * mem::size_of::<IoVector>();
                let bytes = unsafe {
                    slice::from_raw_parts_mut(destination.as_mut_ptr().cast::<u8>(), byte_count)
                };
                H::copy_from_user(bytes, base)?;
                destination
            }
        };

        let mut buffer = Self {
            flags: BufferFlags::USER_MODE | BufferFlags::MAPPED,
            total_size: 0,
            current_offset: 0,
            page_count: 0,
            max_fragment_count: count,
            store: Store::Heap {
                fragments: Vec::with_capacity(count),
                cache_entries: Vec::new(),
                _backing: None,
            },
            _hal: PhantomData,
        };

        let mut total_size = 0usize;
        for element in vector {
            let length = element.length as usize;
            let end = element
                .base
                .checked_add(element.length)
                .ok_or(IoBufferError::AccessViolation)?;
            if element.base >= USER_VA_END || end > USER_VA_END {
                return Err(IoBufferError::AccessViolation);
            }

            if length == 0 {
                continue;
            }

            let base = element.base;
            buffer.coalesce_or_push(
                Fragment::new(Some(VirtAddr::new(base)), None, length),
                |last| last.virtually_precedes(base),
            );

            total_size += length;
        }

        buffer.total_size = total_size;
        Ok(buffer)
    }

    /// Build a descriptor over a single page of memory without allocating.
    /// The descriptor storage belongs to the caller; dropping it releases
    /// only the page resources the flags call for.
    ///
    /// When only a virtual address is supplied, the physical address is
    /// resolved through the mapper.
    pub fn initialize_single_page(
        virtual_address: Option<VirtAddr>,
        physical_address: Option<PhysAddr>,
        size: usize,
        cache_backed: bool,
        memory_locked: bool,
    ) -> Self {
        // The range must fit within one page.
        match virtual_address {
            Some(address) => debug_assert!(
                page_align_up(address.as_u64() + size as u64) - page_align_down(address.as_u64())
                    <= PAGE_SIZE as u64
            ),
            None => debug_assert!(size <= PAGE_SIZE),
        }

        let mut flags = BufferFlags::STRUCTURE_NOT_OWNED;
        let mut page_count = 0;
        if cache_backed {
            flags |=
                BufferFlags::PAGE_CACHE_BACKED | BufferFlags::EXTENDABLE | BufferFlags::MEMORY_LOCKED;
            page_count = 1;
        }

        if memory_locked {
            flags |= BufferFlags::MEMORY_LOCKED;
        }

        let mut physical_address = physical_address;
        if let Some(address) = virtual_address {
            flags |= BufferFlags::MAPPED | BufferFlags::VIRTUALLY_CONTIGUOUS;
            if physical_address.is_none() {
                physical_address = H::virtual_to_physical(address);
                debug_assert!(physical_address.is_some());
            }
        }

        let mut buffer = Self {
            flags,
            total_size: 0,
            current_offset: 0,
            page_count,
            max_fragment_count: 1,
            store: Store::Inline {
                fragment: None,
                cache_entry: None,
            },
            _hal: PhantomData,
        };

        if let Some(physical_address) = physical_address {
            debug_assert!(size != 0);
            buffer.total_size = size;
            buffer.push_fragment(Fragment::new(
                virtual_address,
                Some(physical_address),
                size,
            ));
        }

        buffer
    }

    /// Active fragments, in buffer order.
    pub fn fragments(&self) -> &[Fragment] {
        match &self.store {
            Store::Inline {
                fragment: Some(fragment),
                ..
            } => slice::from_ref(fragment),
            Store::Inline { fragment: None, .. } => &[],
            Store::Heap { fragments, .. } => fragments,
        }
    }

    pub(crate) fn fragments_mut(&mut self) -> &mut [Fragment] {
        match &mut self.store {
            Store::Inline {
                fragment: Some(fragment),
                ..
            } => slice::from_mut(fragment),
            Store::Inline { fragment: None, .. } => &mut [],
            Store::Heap { fragments, .. } => fragments,
        }
    }

    /// Number of active fragments.
    pub fn fragment_count(&self) -> usize {
        self.fragments().len()
    }

    pub(crate) fn push_fragment(&mut self, fragment: Fragment) {
        debug_assert!(self.fragment_count() < self.max_fragment_count);
        match &mut self.store {
            Store::Inline { fragment: slot, .. } => {
                debug_assert!(slot.is_none());
                *slot = Some(fragment);
            }
            Store::Heap { fragments, .. } => fragments.push(fragment),
        }
    }

    pub(crate) fn last_fragment_mut(&mut self) -> Option<&mut Fragment> {
        self.fragments_mut().last_mut()
    }

    /// Grow the last fragment by `fragment.size` when `can_coalesce` holds
    /// for it, otherwise append `fragment` as a new one. Coalescing during
    /// construction is a correctness concern: callers rely on a predictable
    /// fragment list when stepping through physical addresses.
    pub(crate) fn coalesce_or_push(
        &mut self,
        fragment: Fragment,
        can_coalesce: impl FnOnce(&Fragment) -> bool,
    ) {
        if let Some(last) = self.last_fragment_mut() {
            if can_coalesce(last) {
                last.size += fragment.size;
                return;
            }
        }

        self.push_fragment(fragment);
    }

    fn clear_fragments(&mut self) {
        match &mut self.store {
            Store::Inline { fragment, .. } => *fragment = None,
            Store::Heap { fragments, .. } => fragments.clear(),
        }
    }

    /// Whether per-page cache entry slots were reserved at construction.
    pub(crate) fn has_cache_slots(&self) -> bool {
        match &self.store {
            Store::Inline { .. } => self.page_count != 0,
            Store::Heap { cache_entries, .. } => !cache_entries.is_empty(),
        }
    }

    pub(crate) fn cache_slot(&self, index: usize) -> Option<&PageCacheEntry> {
        match &self.store {
            Store::Inline { cache_entry, .. } => {
                if index == 0 && self.page_count != 0 {
                    cache_entry.as_ref()
                } else {
                    None
                }
            }
            Store::Heap { cache_entries, .. } => cache_entries.get(index).and_then(Option::as_ref),
        }
    }

    pub(crate) fn set_cache_slot(&mut self, index: usize, entry: PageCacheEntry) {
        match &mut self.store {
            Store::Inline { cache_entry, .. } => {
                debug_assert!(index == 0 && cache_entry.is_none());
                *cache_entry = Some(entry);
            }
            Store::Heap { cache_entries, .. } => {
                debug_assert!(cache_entries[index].is_none());
                cache_entries[index] = Some(entry);
            }
        }
    }

    fn take_cache_slot(&mut self, index: usize) -> Option<PageCacheEntry> {
        match &mut self.store {
            Store::Inline { cache_entry, .. } => {
                if index == 0 {
                    cache_entry.take()
                } else {
                    None
                }
            }
            Store::Heap { cache_entries, .. } => cache_entries.get_mut(index).and_then(Option::take),
        }
    }

    fn clear_cache_slots(&mut self) {
        match &mut self.store {
            Store::Inline { cache_entry, .. } => *cache_entry = None,
            Store::Heap { cache_entries, .. } => {
                for slot in cache_entries.iter_mut() {
                    *slot = None;
                }
            }
        }
    }

    /// Current flag set.
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// Bytes remaining past the current offset: `total_size - current_offset`.
    pub fn size(&self) -> usize {
        self.total_size - self.current_offset
    }

    /// Cumulative byte size across all fragments.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// The point at which all I/O begins.
    pub fn current_offset(&self) -> usize {
        self.current_offset
    }

    /// Advance the offset cursor.
    pub fn increment_offset(&mut self, bytes: usize) {
        self.current_offset += bytes;
        debug_assert!(self.current_offset <= self.total_size);
    }

    /// Move the offset cursor back.
    pub fn decrement_offset(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.current_offset);
        self.current_offset -= bytes;
    }

    /// Physical address `offset` bytes past the current offset, or `None`
    /// when the offset is out of range or the covering fragment has no
    /// known physical address.
    pub fn physical_address_at(&self, offset: usize) -> Option<PhysAddr> {
        self.physical_address_at_absolute(self.current_offset + offset)
    }

    pub(crate) fn physical_address_at_absolute(&self, offset: usize) -> Option<PhysAddr> {
        let mut fragment_start = 0usize;
        for fragment in self.fragments() {
            let fragment_end = fragment_start + fragment.size;
            if offset >= fragment_start && offset < fragment_end {
                return fragment
                    .physical_address
                    .map(|address| address + (offset - fragment_start) as u64);
            }

            fragment_start = fragment_end;
        }

        None
    }

    /// Append one page described by a page cache entry, taking a reference
    /// on the entry and recording it in the slot for the new page.
    pub fn append_cache_page(&mut self, entry: &PageCacheEntry) {
        self.append_page_inner(
            entry.virtual_address(),
            Some(entry.physical_address()),
            Some(entry),
        );
    }

    /// Append one page described by its physical address and an optional
    /// virtual address.
    pub fn append_physical_page(
        &mut self,
        virtual_address: Option<VirtAddr>,
        physical_address: PhysAddr,
    ) {
        self.append_page_inner(virtual_address, Some(physical_address), None);
    }

    fn append_page_inner(
        &mut self,
        virtual_address: Option<VirtAddr>,
        physical_address: Option<PhysAddr>,
        entry: Option<&PageCacheEntry>,
    ) {
        debug_assert!(self.flags.contains(BufferFlags::EXTENDABLE));
        debug_assert!(entry.is_none() || self.has_cache_slots());
        // There had better be a free fragment slot in case the page is not
        // contiguous with the previous one.
        debug_assert!(self.fragment_count() < self.max_fragment_count);
        debug_assert!(is_aligned(self.total_size, PAGE_SIZE));

        // Extend the last fragment only when the page is physically
        // adjacent and the virtual address states agree.
        self.coalesce_or_push(
            Fragment::new(virtual_address, physical_address, PAGE_SIZE),
            |last| {
                physical_address.is_some_and(|address| last.physically_precedes(address))
                    && last.virtually_continues_to(virtual_address)
            },
        );

        if let Some(entry) = entry {
            debug_assert!(self.fragment_count() <= self.page_count);
            let page_index = self.total_size >> PAGE_SHIFT;
            debug_assert!(page_index < self.page_count);
            debug_assert!(self.flags.contains(BufferFlags::PAGE_CACHE_BACKED));
            self.set_cache_slot(page_index, entry.clone());
        }

        self.total_size += PAGE_SIZE;
    }

    /// Associate a cache entry with a fully built buffer at the given
    /// offset. The physical address of the entry must match the buffer's at
    /// that offset.
    pub fn set_cache_entry(&mut self, offset: usize, entry: &PageCacheEntry) {
        let offset = offset + self.current_offset;
        debug_assert!(is_aligned(offset, PAGE_SIZE));
        debug_assert!(!self.flags.contains(BufferFlags::USER_MODE));

        let page_index = offset >> PAGE_SHIFT;
        debug_assert!(page_index < self.page_count);
        debug_assert_eq!(
            self.physical_address_at_absolute(offset),
            Some(entry.physical_address())
        );

        self.set_cache_slot(page_index, entry.clone());
        self.flags |= BufferFlags::PAGE_CACHE_BACKED;
    }

    /// The cache entry associated with the page at the given offset, if the
    /// buffer is cache backed and the slot is populated.
    pub fn cache_entry(&self, offset: usize) -> Option<&PageCacheEntry> {
        if !self.flags.contains(BufferFlags::PAGE_CACHE_BACKED) {
            return None;
        }

        let offset = offset + self.current_offset;
        debug_assert!(is_aligned(offset, PAGE_SIZE));
        debug_assert!(!self.flags.contains(BufferFlags::USER_MODE));

        self.cache_slot(offset >> PAGE_SHIFT)
    }

    /// Release every resource the buffer holds, leaving the descriptor
    /// itself intact for [`reset`](Self::reset) or drop.
    pub(crate) fn release_resources(&mut self) {
        let flags = self.flags;
        self.current_offset = 0;

        if flags.contains(BufferFlags::UNMAP_ON_FREE) {
            self.unmap();
        }

        if flags.intersects(BufferFlags::MEMORY_OWNED | BufferFlags::PAGE_CACHE_BACKED) {
            // Pages borrowed by the page cache are released through their
            // entry reference; only unshared owned pages go back to the
            // allocator directly. This ordering is load bearing.
            let mut page_index = 0usize;
            for fragment_index in 0..self.fragment_count() {
                let fragment = self.fragments()[fragment_index];
                let Some(physical_address) = fragment.physical_address else {
                    debug_assert!(false, "releasing a fragment with no physical address");
                    continue;
                };

                debug_assert!(is_aligned(fragment.size, PAGE_SIZE) || !flags.contains(BufferFlags::MEMORY_OWNED));

                let page_offset = (physical_address.as_u64() % PAGE_SIZE as u64) as usize;
                let pages = align_range_up(fragment.size + page_offset, PAGE_SIZE) >> PAGE_SHIFT;
                let mut physical_address =
                    PhysAddr::new(physical_address.as_u64() - page_offset as u64);
                for _ in 0..pages {
                    if let Some(entry) = self.take_cache_slot(page_index) {
                        debug_assert_eq!(entry.physical_address(), physical_address);
                        drop(entry);
                    } else if flags.contains(BufferFlags::MEMORY_OWNED) {
                        H::free_page(physical_address);
                    } else {
                        // A purely cache backed buffer with an untracked
                        // page should not exist.
                        debug_assert!(false, "page cache backed buffer with a hole");
                    }

                    page_index += 1;
                    physical_address += PAGE_SIZE as u64;
                }
            }
        } else if flags.contains(BufferFlags::MEMORY_LOCKED) {
            // Locking may have referenced cache entries for some pages and
            // pinned plain physical pages for others; decide per page. The
            // first fragment's physical address is not guaranteed to be
            // page aligned, so round down and unlock whole pages.
            let mut page_index = 0usize;
            for fragment_index in 0..self.fragment_count() {
                let fragment = self.fragments()[fragment_index];
                let Some(physical_address) = fragment.physical_address else {
                    continue;
                };

                let page_offset = (physical_address.as_u64() % PAGE_SIZE as u64) as usize;
                let pages = align_range_up(fragment.size + page_offset, PAGE_SIZE) >> PAGE_SHIFT;
                let mut physical_address =
                    PhysAddr::new(physical_address.as_u64() - page_offset as u64);
                for _ in 0..pages {
                    if let Some(entry) = self.take_cache_slot(page_index) {
                        drop(entry);
                    } else {
                        H::unlock_page(physical_address);
                    }

                    page_index += 1;
                    physical_address += PAGE_SIZE as u64;
                }
            }
        }
    }

    /// Reset the buffer for re-use: release all resources, clear the
    /// fragment and cache entry arrays, and drop the mapping flags.
    pub fn reset(&mut self) {
        debug_assert!(!self.flags.contains(BufferFlags::USER_MODE));

        self.release_resources();
        self.clear_fragments();
        self.clear_cache_slots();
        self.total_size = 0;
        self.current_offset = 0;
        self.flags -= BufferFlags::UNMAP_ON_FREE
            | BufferFlags::MAPPED
            | BufferFlags::VIRTUALLY_CONTIGUOUS;
    }
}

impl<H: MemoryHal> Drop for IoBuffer<H> {
    fn drop(&mut self) {
        self.release_resources();
    }
}

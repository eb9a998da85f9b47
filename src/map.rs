//! The mapping engine: ensuring fragments have kernel virtual addresses and
//! tearing those mappings down again.
//!
//! Mapping cooperates with the page cache: when a freshly mapped page is
//! backed by a cache entry that has not published a virtual address yet, the
//! new address is published into the entry. Unmapping preserves exactly the
//! pages whose address the cache owns.

use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::buffer::IoBuffer;
use crate::error::IoBufferError;
use crate::flags::BufferFlags;
use crate::fragment::Fragment;
use crate::hal::MemoryHal;
use crate::page_cache::PageCacheEntry;
use crate::{is_aligned, PAGE_SHIFT, PAGE_SIZE};

impl<H: MemoryHal> IoBuffer<H> {
    /// Map the buffer into kernel memory. With `virtually_contiguous` set,
    /// all fragments end up in one continuous virtual range (remapping any
    /// existing partial mappings); otherwise every fragment merely gets a
    /// valid address, batching maximal runs of unmapped fragments into
    /// shared reservations.
    ///
    /// Idempotent: a buffer that already satisfies the requested level
    /// returns immediately, setting the matching flag if it was merely
    /// unrecorded. User-mode buffers must never reach the mapping path.
    pub fn map(
        &mut self,
        write_through: bool,
        non_cached: bool,
        virtually_contiguous: bool,
    ) -> Result<(), IoBufferError> {
        debug_assert!(self.fragment_count() >= 1);

        // The flag may be unset even though the buffer qualifies, e.g. for
        // a page-cache-backed buffer that has not seen a contiguous mapping
        // request yet.
        if virtually_contiguous {
            if self.flags.contains(BufferFlags::VIRTUALLY_CONTIGUOUS) {
                debug_assert!(self.is_mapped(true));
                return Ok(());
            }

            if self.is_mapped(true) {
                self.flags |= BufferFlags::VIRTUALLY_CONTIGUOUS;
                return Ok(());
            }
        } else {
            if self.flags.contains(BufferFlags::MAPPED) {
                debug_assert!(self.is_mapped(false));
                return Ok(());
            }

            if self.is_mapped(false) {
                self.flags |= BufferFlags::MAPPED;
                return Ok(());
            }
        }

        // User mode buffers are always fully mapped; they must not reach
        // the kernel address allocation below.
        debug_assert!(!self.flags.contains(BufferFlags::USER_MODE));

        let mut map_flags = PageTableFlags::PRESENT | PageTableFlags::GLOBAL;
        if write_through {
            map_flags |= PageTableFlags::WRITE_THROUGH;
        }

        if non_cached {
            map_flags |= PageTableFlags::NO_CACHE;
        }

        if virtually_contiguous {
            // Unmap any partial ranges first, then cover the whole buffer
            // with one reservation.
            if self.flags.contains(BufferFlags::MAPPED) {
                self.unmap();
            }

            self.map_fragments(0, self.fragment_count(), map_flags)?;
            self.flags |= BufferFlags::VIRTUALLY_CONTIGUOUS;
        } else {
            // Map each maximal run of unmapped fragments together; mapped
            // fragments are left untouched.
            let mut run_start = 0usize;
            let mut run_active = false;
            for index in 0..self.fragment_count() {
                if self.fragments()[index].virtual_address().is_some() {
                    if run_active {
                        self.map_fragments(run_start, index - run_start, map_flags)?;
                        run_active = false;
                    }
                } else if !run_active {
                    run_start = index;
                    run_active = true;
                }
            }

            if run_active {
                self.map_fragments(run_start, self.fragment_count() - run_start, map_flags)?;
            }
        }

        self.flags |= BufferFlags::UNMAP_ON_FREE | BufferFlags::MAPPED;
        Ok(())
    }

    /// Whether every fragment has a virtual address, and, when
    /// `virtually_contiguous` is requested, whether those addresses form a
    /// single gapless run.
    pub(crate) fn is_mapped(&self, virtually_contiguous: bool) -> bool {
        debug_assert!(self.fragment_count() >= 1);

        let mut expected = match self.fragments().first().and_then(Fragment::virtual_address) {
            Some(address) => address.as_u64(),
            None => return false,
        };

        for fragment in self.fragments() {
            match fragment.virtual_address() {
                None => return false,
                Some(address) => {
                    if virtually_contiguous && address.as_u64() != expected {
                        return false;
                    }
                }
            }

            expected = expected.wrapping_add(fragment.size() as u64);
        }

        true
    }

    /// Reserve one virtual range covering `fragment_count` fragments
    /// starting at `fragment_start` and map their pages into it, writing
    /// the new addresses back into the fragments.
    fn map_fragments(
        &mut self,
        fragment_start: usize,
        fragment_count: usize,
        map_flags: PageTableFlags,
    ) -> Result<(), IoBufferError> {
        debug_assert!(fragment_count != 0);
        debug_assert!(fragment_start + fragment_count <= self.fragment_count());

        let size: usize = self.fragments()[fragment_start..fragment_start + fragment_count]
            .iter()
            .map(Fragment::size)
            .sum();

        debug_assert!(size != 0);
        debug_assert!(is_aligned(size, PAGE_SIZE));

        let range = H::reserve_range(size)?;

        // From here on the reservation belongs to the buffer; even if a
        // later run fails, teardown must release it.
        self.flags |= BufferFlags::UNMAP_ON_FREE;

        // Cumulative page index across the whole buffer, used to find the
        // cache entry belonging to each page.
        let track_cache = self.flags.contains(BufferFlags::PAGE_CACHE_BACKED);
        let mut page_index = 0usize;
        if track_cache {
            let preceding: usize = self.fragments()[..fragment_start]
                .iter()
                .map(Fragment::size)
                .sum();
            debug_assert!(is_aligned(preceding, PAGE_SIZE));
            page_index = preceding >> PAGE_SHIFT;
        }

        let mut virtual_address = range.as_u64();
        for index in fragment_start..fragment_start + fragment_count {
            let (physical_address, fragment_size) = {
                let fragment = &mut self.fragments_mut()[index];
                fragment.virtual_address = Some(VirtAddr::new(virtual_address));
                (fragment.physical_address, fragment.size)
            };

            let Some(mut physical_address) = physical_address else {
                debug_assert!(false, "mapping a fragment with no physical address");
                continue;
            };

            debug_assert!(is_aligned(physical_address.as_u64() as usize, PAGE_SIZE));
            debug_assert!(is_aligned(fragment_size, PAGE_SIZE));

            let mut remaining = fragment_size;
            while remaining != 0 {
                let page = VirtAddr::new(virtual_address);
                H::map_page(physical_address, page, map_flags);

                // A page appended from an unmapped cache entry left the
                // entry without an address; try to win the race to publish
                // this one. Losing is benign.
                if track_cache {
                    if let Some(entry) = self.cache_slot(page_index) {
                        entry.publish_virtual_address(page);
                    }

                    page_index += 1;
                }

                physical_address += PAGE_SIZE as u64;
                virtual_address += PAGE_SIZE as u64;
                remaining -= PAGE_SIZE;
            }
        }

        Ok(())
    }

    /// Tear down the buffer's virtual mappings, batching the longest
    /// possible contiguous runs into single releases. Pages whose virtual
    /// address is exactly the one published in their page cache entry
    /// belong to the cache and stay mapped.
    pub(crate) fn unmap(&mut self) {
        debug_assert!(self.flags.contains(BufferFlags::UNMAP_ON_FREE));

        let track_cache =
            self.flags.contains(BufferFlags::PAGE_CACHE_BACKED) && self.has_cache_slots();

        // The pending run accumulates (start, end) until a gap or a
        // cache-owned page forces a release.
        let mut run: Option<(u64, u64)> = None;
        let mut fragment_index = 0usize;
        let mut fragment_offset = 0usize;
        let mut page_cache_index = 0usize;

        while fragment_index < self.fragment_count() {
            let fragment = self.fragments()[fragment_index];
            let Some(fragment_address) = fragment.virtual_address() else {
                // Unmapped fragment; the next one may still continue the
                // current run.
                fragment_index += 1;
                continue;
            };

            let mut pending: Option<(u64, u64)> = None;

            if track_cache {
                // Walk the fragment page by page, possibly resuming one
                // that was partially processed on the previous pass.
                let page_count = (fragment.size() - fragment_offset) >> PAGE_SHIFT;
                let mut current = fragment_address.as_u64() + fragment_offset as u64;
                for _ in 0..page_count {
                    debug_assert!(page_cache_index < self.page_count);
                    let published = self
                        .cache_slot(page_cache_index)
                        .and_then(PageCacheEntry::virtual_address)
                        .map(VirtAddr::as_u64);

                    fragment_offset += PAGE_SIZE;
                    page_cache_index += 1;

                    // Literal comparison against the published address: the
                    // page belongs to the cache only when the two match
                    // byte for byte.
                    if published != Some(current) {
                        match run {
                            Some((start, end)) if current != end => {
                                pending = Some((start, end - start));
                                run = Some((current, current + PAGE_SIZE as u64));
                                break;
                            }
                            Some((start, end)) => run = Some((start, end + PAGE_SIZE as u64)),
                            None => run = Some((current, current + PAGE_SIZE as u64)),
                        }

                        current += PAGE_SIZE as u64;
                        continue;
                    }

                    // Owned by the page cache: never unmapped here. Flush
                    // any accumulated run and do not start a new one.
                    if let Some((start, end)) = run {
                        pending = Some((start, end - start));
                        run = None;
                        break;
                    }

                    current += PAGE_SIZE as u64;
                }

                if fragment_offset >= fragment.size() {
                    fragment_offset = 0;
                    fragment_index += 1;
                }
            } else {
                // No page cache entries to worry about; batch whole
                // fragments by virtual adjacency.
                match run {
                    Some((start, end)) if fragment_address.as_u64() != end => {
                        pending = Some((start, end - start));
                        run = Some((
                            fragment_address.as_u64(),
                            fragment_address.as_u64() + fragment.size() as u64,
                        ));
                    }
                    Some((start, end)) => run = Some((start, end + fragment.size() as u64)),
                    None => {
                        run = Some((
                            fragment_address.as_u64(),
                            fragment_address.as_u64() + fragment.size() as u64,
                        ))
                    }
                }

                fragment_index += 1;
            }

            if let Some((start, size)) = pending {
                debug_assert!(size != 0);
                Self::release_mapping(start, size as usize);
            }
        }

        if let Some((start, end)) = run {
            Self::release_mapping(start, (end - start) as usize);
        }

        self.flags -= BufferFlags::MAPPED
            | BufferFlags::UNMAP_ON_FREE
            | BufferFlags::VIRTUALLY_CONTIGUOUS;
    }

    /// Release one virtual range with a TLB invalidation broadcast. The
    /// range freer can fail if the system can no longer allocate memory
    /// descriptors; there is nothing the caller can do, so log the leak.
    fn release_mapping(start: u64, size: usize) {
        if H::release_range(VirtAddr::new(start), size, false).is_err() {
            log::error!("leaking {size} bytes of kernel address space at {start:#x}");
        }
    }
}

#[cfg(test)]
mod tests {
    use x86_64::PhysAddr;

    use super::*;
    use crate::buffer::tests::{assert_invariants, TestBuffer};
    use crate::page_cache::PageCacheEntry;
    use crate::test_hal;

    #[test]
    fn test_map_batches_unmapped_runs() {
        test_hal::reset();
        test_hal::seed_free_pages(&[0x300000, 0x500000]);

        let mut buffer = TestBuffer::allocate_uninitialized(8192, false);
        buffer.extend(0, u64::MAX, 0, 8192, false).unwrap();
        assert_eq!(buffer.fragment_count(), 2);
        assert!(!buffer.flags().contains(BufferFlags::MAPPED));

        buffer.map(false, false, false).unwrap();
        assert!(buffer
            .flags()
            .contains(BufferFlags::MAPPED | BufferFlags::UNMAP_ON_FREE));
        assert!(buffer.is_mapped(false));

        // Both fragments were unmapped, so they share one reservation and
        // come out virtually contiguous.
        assert!(buffer.is_mapped(true));
        assert_invariants(&buffer);

        // Idempotent, and the contiguous request merely records the flag.
        buffer.map(false, false, false).unwrap();
        buffer.map(false, false, true).unwrap();
        assert!(buffer.flags().contains(BufferFlags::VIRTUALLY_CONTIGUOUS));

        drop(buffer);
        assert_eq!(test_hal::outstanding_reservation_pages(), 0);
        assert_eq!(test_hal::outstanding_pages(), 0);
    }

    #[test]
    fn test_map_leaves_mapped_fragments_untouched() {
        test_hal::reset();

        let published = VirtAddr::new(0xffff_8000_0100_0000);
        let entry = PageCacheEntry::new(PhysAddr::new(0x900000), Some(published));

        let mut buffer = TestBuffer::allocate_uninitialized(8192, true);
        buffer.append_cache_page(&entry);
        buffer.extend(0, u64::MAX, 0, 4096, false).unwrap();
        assert_eq!(buffer.fragment_count(), 2);

        buffer.map(false, false, false).unwrap();
        assert_eq!(buffer.fragments()[0].virtual_address(), Some(published));
        assert!(buffer.fragments()[1].virtual_address().is_some());
        assert_invariants(&buffer);

        drop(buffer);
        // Only the second fragment's page was reserved here; the published
        // page belongs to the cache and stays mapped.
        assert_eq!(test_hal::released_ranges().len(), 1);
        assert_eq!(test_hal::outstanding_reservation_pages(), 0);
        assert_eq!(entry.reference_count(), 1);
    }

    #[test]
    fn test_map_publishes_cache_virtual_address() {
        test_hal::reset();

        let entry = PageCacheEntry::new(PhysAddr::new(0xa00000), None);
        let mut buffer = TestBuffer::allocate_uninitialized(4096, true);
        buffer.append_cache_page(&entry);

        buffer.map(false, false, false).unwrap();
        let fragment_address = buffer.fragments()[0].virtual_address().unwrap();
        assert_eq!(entry.virtual_address(), Some(fragment_address));

        drop(buffer);
        // The page's address is exactly the published one, so unmap
        // preserves it for the page cache.
        assert!(test_hal::released_ranges().is_empty());
        assert_eq!(test_hal::outstanding_reservation_pages(), 1);
        assert_eq!(entry.reference_count(), 1);
    }

    #[test]
    fn test_map_contiguous_remaps_partial_mappings() {
        test_hal::reset();

        let published = VirtAddr::new(0xffff_8000_0180_0000);
        let entry = PageCacheEntry::new(PhysAddr::new(0xb00000), Some(published));

        let mut buffer = TestBuffer::allocate_uninitialized(8192, true);
        buffer.append_cache_page(&entry);
        buffer.extend(0, u64::MAX, 0, 4096, false).unwrap();
        buffer.map(false, false, false).unwrap();

        // The two fragments live in separate ranges, so a contiguous
        // mapping request must remap the whole buffer.
        assert!(!buffer.is_mapped(true));
        buffer.map(false, false, true).unwrap();
        assert!(buffer.flags().contains(BufferFlags::VIRTUALLY_CONTIGUOUS));
        assert!(buffer.is_mapped(true));
        assert_eq!(buffer.fragment_count(), 2);
        assert_invariants(&buffer);

        drop(buffer);
        assert_eq!(test_hal::outstanding_reservation_pages(), 0);
        assert_eq!(test_hal::outstanding_pages(), 0);
        assert_eq!(entry.reference_count(), 1);
    }
}

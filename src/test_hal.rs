//! A mock memory manager for host tests.
//!
//! Physical pages are identifiers handed out by a small allocator: a seeded
//! free set popped lowest-address-first (so tests can script fragmentation)
//! with a bump region behind it. Reserved virtual ranges are real host
//! allocations so buffer contents can actually be read and written through
//! fragment addresses. All state is thread local, keeping parallel tests
//! isolated; each test starts by calling [`reset`].

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::cell::RefCell;
use std::alloc::{alloc_zeroed, Layout};
use std::thread_local;

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use crate::error::IoBufferError;
use crate::hal::{ImageSection, MemoryHal, PageInError, PagedInPage};
use crate::page_cache::PageCacheEntry;
use crate::{page_align_down, PAGE_SIZE};

/// Base of the bump region for unseeded physical allocations.
const BUMP_BASE: u64 = 0x100_0000;

struct SectionPage {
    physical_address: u64,
    cache_entry: Option<PageCacheEntry>,
    /// Remaining number of try-again faults to serve before succeeding.
    try_again_count: u32,
}

struct MockSection {
    base: u64,
    size: usize,
    pages: Vec<SectionPage>,
}

struct MockState {
    free_pages: BTreeSet<u64>,
    next_page: u64,
    /// Successful allocations remaining before the allocator starts
    /// refusing, or `None` for no limit.
    remaining_allocations: Option<usize>,
    allocated_pages: BTreeSet<u64>,
    freed_pages: Vec<u64>,
    unlocked_pages: Vec<u64>,
    mappings: BTreeMap<u64, u64>,
    reserved_pages: BTreeSet<u64>,
    released_ranges: Vec<(u64, usize)>,
    sections: Vec<MockSection>,
}

impl MockState {
    fn new() -> Self {
        Self {
            free_pages: BTreeSet::new(),
            next_page: BUMP_BASE,
            remaining_allocations: None,
            allocated_pages: BTreeSet::new(),
            freed_pages: Vec::new(),
            unlocked_pages: Vec::new(),
            mappings: BTreeMap::new(),
            reserved_pages: BTreeSet::new(),
            released_ranges: Vec::new(),
            sections: Vec::new(),
        }
    }

    fn allocate_run(&mut self, count: usize, alignment: usize) -> Option<u64> {
        match &mut self.remaining_allocations {
            Some(0) => return None,
            Some(remaining) => *remaining -= 1,
            None => {}
        }

        // Single pages come from the seeded free set first, lowest address
        // first, the way a real free list drains.
        if count == 1 {
            let lowest = self.free_pages.iter().next().copied();
            if let Some(lowest) = lowest {
                self.free_pages.remove(&lowest);
                self.allocated_pages.insert(lowest);
                return Some(lowest);
            }
        }

        let alignment = (alignment.max(PAGE_SIZE)) as u64;
        let base = self.next_page.div_ceil(alignment) * alignment;
        self.next_page = base + (count * PAGE_SIZE) as u64;
        for index in 0..count {
            self.allocated_pages.insert(base + (index * PAGE_SIZE) as u64);
        }

        Some(base)
    }
}

thread_local! {
    static STATE: RefCell<MockState> = RefCell::new(MockState::new());
}

fn with_state<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

/// Start a test from a clean slate.
pub(crate) fn reset() {
    with_state(|state| *state = MockState::new());
}

/// Seed scattered free pages for the allocator to drain lowest-first.
pub(crate) fn seed_free_pages(pages: &[u64]) {
    with_state(|state| state.free_pages.extend(pages.iter().copied()));
}

/// Let the next `count` physical allocations succeed, then refuse.
pub(crate) fn limit_allocations(count: usize) {
    with_state(|state| state.remaining_allocations = Some(count));
}

/// Install a fixed virtual-to-physical translation, as if some other part
/// of the kernel had mapped the page.
pub(crate) fn map_fixed(virtual_address: u64, physical_address: u64) {
    with_state(|state| {
        state
            .mappings
            .insert(page_align_down(virtual_address), page_align_down(physical_address));
    });
}

/// Register an image section covering `[base, base + size)`. Each entry of
/// `pages` is the page's physical address, its optional cache entry, and
/// the number of try-again faults to serve before paging in succeeds.
pub(crate) fn register_section(
    base: u64,
    size: usize,
    pages: Vec<(u64, Option<PageCacheEntry>, u32)>,
) {
    with_state(|state| {
        state.sections.push(MockSection {
            base,
            size,
            pages: pages
                .into_iter()
                .map(|(physical_address, cache_entry, try_again_count)| SectionPage {
                    physical_address,
                    cache_entry,
                    try_again_count,
                })
                .collect(),
        });
    });
}

/// Pages returned to the physical allocator so far.
pub(crate) fn freed_pages() -> Vec<u64> {
    with_state(|state| state.freed_pages.clone())
}

/// Pages unpinned so far.
pub(crate) fn unlocked_pages() -> Vec<u64> {
    with_state(|state| state.unlocked_pages.clone())
}

/// Physical pages currently outstanding.
pub(crate) fn outstanding_pages() -> usize {
    with_state(|state| state.allocated_pages.len())
}

/// Pages of reserved virtual address space not yet released.
pub(crate) fn outstanding_reservation_pages() -> usize {
    with_state(|state| state.reserved_pages.len())
}

/// Ranges released so far, as (base, size) pairs.
pub(crate) fn released_ranges() -> Vec<(u64, usize)> {
    with_state(|state| state.released_ranges.clone())
}

/// A section handle; dropping it releases the reference (the mock registry
/// itself keeps sections alive for the duration of the test).
#[derive(Clone)]
pub(crate) struct TestSection {
    base: u64,
    size: usize,
    index: usize,
}

impl ImageSection for TestSection {
    fn virtual_range(&self) -> (VirtAddr, usize) {
        (VirtAddr::new(self.base), self.size)
    }

    fn page_in(&self, page_offset: usize) -> Result<PagedInPage, PageInError> {
        with_state(|state| {
            let section = &mut state.sections[self.index];
            let page = section
                .pages
                .get_mut(page_offset)
                .ok_or(PageInError::Failed(IoBufferError::InvalidParameter))?;

            if page.try_again_count > 0 {
                page.try_again_count -= 1;
                return Err(PageInError::TryAgain);
            }

            Ok(PagedInPage {
                physical_address: PhysAddr::new(page.physical_address),
                cache_entry: page.cache_entry.clone(),
            })
        })
    }
}

pub(crate) struct TestHal;

unsafe impl MemoryHal for TestHal {
    type Section = TestSection;

    fn allocate_pages(count: usize, alignment: usize) -> Option<PhysAddr> {
        with_state(|state| state.allocate_run(count, alignment)).map(PhysAddr::new)
    }

    fn free_page(physical_address: PhysAddr) {
        with_state(|state| {
            let page = physical_address.as_u64();
            assert!(
                state.allocated_pages.remove(&page),
                "freeing a page that was not allocated: {page:#x}"
            );
            state.freed_pages.push(page);
        });
    }

    fn unlock_page(physical_address: PhysAddr) {
        with_state(|state| state.unlocked_pages.push(physical_address.as_u64()));
    }

    fn reserve_range(size: usize) -> Result<VirtAddr, IoBufferError> {
        assert!(size % PAGE_SIZE == 0 && size != 0);
        let layout = Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let pointer = unsafe { alloc_zeroed(layout) };
        if pointer.is_null() {
            return Err(IoBufferError::InsufficientResources);
        }

        let base = pointer as u64;
        with_state(|state| {
            for offset in (0..size).step_by(PAGE_SIZE) {
                state.reserved_pages.insert(base + offset as u64);
            }
        });

        Ok(VirtAddr::new(base))
    }

    fn release_range(
        virtual_address: VirtAddr,
        size: usize,
        free_physical_pages: bool,
    ) -> Result<(), IoBufferError> {
        with_state(|state| {
            let base = virtual_address.as_u64();
            for offset in (0..size).step_by(PAGE_SIZE) {
                let page = base + offset as u64;
                state.reserved_pages.remove(&page);
                if let Some(physical) = state.mappings.remove(&page) {
                    if free_physical_pages {
                        state.allocated_pages.remove(&physical);
                        state.freed_pages.push(physical);
                    }
                }
            }

            state.released_ranges.push((base, size));
        });

        Ok(())
    }

    fn map_page(physical_address: PhysAddr, virtual_address: VirtAddr, _flags: PageTableFlags) {
        with_state(|state| {
            state
                .mappings
                .insert(virtual_address.as_u64(), physical_address.as_u64());
        });
    }

    fn map_range(
        virtual_address: VirtAddr,
        size: usize,
        run_alignment: usize,
        run_size: usize,
        _write_through: bool,
        _non_cached: bool,
    ) -> Result<(), IoBufferError> {
        assert!(run_size % PAGE_SIZE == 0 && size % run_size == 0);
        with_state(|state| {
            for run_offset in (0..size).step_by(run_size) {
                let Some(base) = state.allocate_run(run_size / PAGE_SIZE, run_alignment) else {
                    return Err(IoBufferError::NoMemory);
                };

                for page_offset in (0..run_size).step_by(PAGE_SIZE) {
                    state.mappings.insert(
                        virtual_address.as_u64() + (run_offset + page_offset) as u64,
                        base + page_offset as u64,
                    );
                }
            }

            Ok(())
        })
    }

    fn virtual_to_physical(virtual_address: VirtAddr) -> Option<PhysAddr> {
        with_state(|state| {
            let address = virtual_address.as_u64();
            let page = page_align_down(address);
            state
                .mappings
                .get(&page)
                .map(|physical| PhysAddr::new(physical + (address - page)))
        })
    }

    fn lookup_section(virtual_address: VirtAddr) -> Option<TestSection> {
        with_state(|state| {
            let address = virtual_address.as_u64();
            state
                .sections
                .iter()
                .enumerate()
                .find(|(_, section)| {
                    address >= section.base && address < section.base + section.size as u64
                })
                .map(|(index, section)| TestSection {
                    base: section.base,
                    size: section.size,
                    index,
                })
        })
    }

    fn copy_to_user(destination: VirtAddr, source: &[u8]) -> Result<(), IoBufferError> {
        unsafe {
            core::ptr::copy_nonoverlapping(
                source.as_ptr(),
                destination.as_u64() as *mut u8,
                source.len(),
            );
        }

        Ok(())
    }

    fn copy_from_user(destination: &mut [u8], source: VirtAddr) -> Result<(), IoBufferError> {
        unsafe {
            core::ptr::copy_nonoverlapping(
                source.as_u64() as *const u8,
                destination.as_mut_ptr(),
                destination.len(),
            );
        }

        Ok(())
    }

    fn cpu_cache_line_size() -> usize {
        64
    }

    fn platform_cache_line_size() -> usize {
        128
    }
}

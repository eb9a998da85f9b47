//! Data access and growth: copying in and out, zeroing, extension by
//! allocation, and validation against device constraints.
//!
//! Every access applies the buffer's offset cursor, extends extendable
//! destinations that cannot hold the request, and maps the buffer before
//! touching memory. Transfers walk the fragment list; they never assume the
//! buffer is virtually contiguous.

use core::ptr;
use core::slice;

use x86_64::{PhysAddr, VirtAddr};

use crate::buffer::IoBuffer;
use crate::error::IoBufferError;
use crate::flags::BufferFlags;
use crate::fragment::Fragment;
use crate::hal::MemoryHal;
use crate::{align_range_up, is_aligned, PAGE_SHIFT, PAGE_SIZE};

impl<H: MemoryHal> IoBuffer<H> {
    /// Copy `byte_count` bytes from `source` starting at `source_offset` to
    /// `destination` starting at `destination_offset`. Each buffer's offset
    /// cursor is applied to its offset argument. An extendable destination
    /// grows to fit; both buffers are mapped as needed. At most one side may
    /// be a user-mode buffer.
    pub fn copy(
        destination: &mut Self,
        destination_offset: usize,
        source: &mut Self,
        source_offset: usize,
        byte_count: usize,
    ) -> Result<(), IoBufferError> {
        let destination_offset = destination_offset + destination.current_offset;
        let source_offset = source_offset + source.current_offset;

        // The source must always have enough data for the copy.
        debug_assert!(source_offset + byte_count <= source.total_size);
        debug_assert!(
            destination.flags.contains(BufferFlags::EXTENDABLE)
                || destination_offset + byte_count <= destination.total_size
        );

        if destination.flags.contains(BufferFlags::EXTENDABLE)
            && destination_offset + byte_count > destination.total_size
        {
            let extension = destination_offset + byte_count - destination.total_size;
            destination.extend(0, u64::MAX, 0, extension, false)?;
        }

        debug_assert!(
            !(destination.flags.contains(BufferFlags::USER_MODE)
                && source.flags.contains(BufferFlags::USER_MODE))
        );

        destination.map(false, false, false)?;
        source.map(false, false, false)?;

        if byte_count == 0 {
            return Ok(());
        }

        // Find the starting fragment on each side; the fragments need not
        // line up, so the walk takes the smaller remainder each round.
        let (mut destination_index, mut destination_fragment_offset) = destination
            .locate_fragment(destination_offset)
            .ok_or(IoBufferError::IncorrectBufferSize)?;

        let (mut source_index, mut source_fragment_offset) = source
            .locate_fragment(source_offset)
            .ok_or(IoBufferError::IncorrectBufferSize)?;

        let mut remaining = byte_count;
        while remaining != 0 {
            let destination_fragment = destination.fragments()[destination_index];
            let source_fragment = source.fragments()[source_index];

            let chunk = (destination_fragment.size() - destination_fragment_offset)
                .min(source_fragment.size() - source_fragment_offset)
                .min(remaining);

            let destination_address = destination_fragment
                .virtual_address()
                .expect("destination fragment mapped")
                .as_u64()
                + destination_fragment_offset as u64;

            let source_address = source_fragment
                .virtual_address()
                .expect("source fragment mapped")
                .as_u64()
                + source_fragment_offset as u64;

            if destination.flags.contains(BufferFlags::USER_MODE) {
                let source_bytes =
                    unsafe { slice::from_raw_parts(source_address as *const u8, chunk) };
                H::copy_to_user(VirtAddr::new(destination_address), source_bytes)?;
            } else if source.flags.contains(BufferFlags::USER_MODE) {
                let destination_bytes =
                    unsafe { slice::from_raw_parts_mut(destination_address as *mut u8, chunk) };
                H::copy_from_user(destination_bytes, VirtAddr::new(source_address))?;
            } else {
                unsafe {
                    ptr::copy_nonoverlapping(
                        source_address as *const u8,
                        destination_address as *mut u8,
                        chunk,
                    );
                }
            }

            destination_fragment_offset += chunk;
            if destination_fragment_offset == destination_fragment.size() && remaining > chunk {
                destination_index += 1;
                destination_fragment_offset = 0;
                if destination_index >= destination.fragment_count() {
                    return Err(IoBufferError::IncorrectBufferSize);
                }
            }

            source_fragment_offset += chunk;
            if source_fragment_offset == source_fragment.size() && remaining > chunk {
                source_index += 1;
                source_fragment_offset = 0;
                if source_index >= source.fragment_count() {
                    return Err(IoBufferError::IncorrectBufferSize);
                }
            }

            remaining -= chunk;
        }

        Ok(())
    }

    /// Zero `byte_count` bytes starting at `offset` past the offset cursor,
    /// extending an extendable buffer as needed.
    pub fn zero(&mut self, offset: usize, byte_count: usize) -> Result<(), IoBufferError> {
        let offset = offset + self.current_offset;

        debug_assert!(!self.flags.contains(BufferFlags::USER_MODE));
        debug_assert!(
            self.flags.contains(BufferFlags::EXTENDABLE)
                || offset + byte_count <= self.total_size
        );

        if self.flags.contains(BufferFlags::EXTENDABLE)
            && offset + byte_count > self.total_size
        {
            self.extend(0, u64::MAX, 0, offset + byte_count - self.total_size, false)?;
        }

        self.map(false, false, false)?;

        let mut remaining = byte_count;
        let mut fragment_index = 0usize;
        let mut current_offset = 0usize;
        while remaining != 0 {
            if fragment_index >= self.fragment_count() {
                return Err(IoBufferError::IncorrectBufferSize);
            }

            let fragment = self.fragments()[fragment_index];
            fragment_index += 1;
            if current_offset + fragment.size() <= offset {
                current_offset += fragment.size();
                continue;
            }

            let fragment_offset = offset.saturating_sub(current_offset);
            let zero_size = (fragment.size() - fragment_offset).min(remaining);
            let address = fragment
                .virtual_address()
                .expect("fragment mapped")
                .as_u64()
                + fragment_offset as u64;

            unsafe {
                ptr::write_bytes(address as *mut u8, 0, zero_size);
            }

            remaining -= zero_size;
            current_offset += fragment.size();
        }

        Ok(())
    }

    /// Copy the contents of a linear kernel buffer into this buffer at
    /// `offset` past the offset cursor, extending as needed.
    pub fn write_data(&mut self, offset: usize, data: &[u8]) -> Result<(), IoBufferError> {
        self.copy_linear(offset, data.as_ptr().cast_mut(), data.len(), true)
    }

    /// Copy this buffer's contents starting at `offset` past the offset
    /// cursor out to a linear kernel buffer.
    pub fn read_data(&mut self, offset: usize, data: &mut [u8]) -> Result<(), IoBufferError> {
        self.copy_linear(offset, data.as_mut_ptr(), data.len(), false)
    }

    fn copy_linear(
        &mut self,
        offset: usize,
        linear: *mut u8,
        size: usize,
        to_io_buffer: bool,
    ) -> Result<(), IoBufferError> {
        let offset = offset + self.current_offset;

        debug_assert!(to_io_buffer || offset + size <= self.total_size);
        debug_assert!(
            !to_io_buffer
                || self.flags.contains(BufferFlags::EXTENDABLE)
                || offset + size <= self.total_size
        );

        if to_io_buffer
            && self.flags.contains(BufferFlags::EXTENDABLE)
            && offset + size > self.total_size
        {
            self.extend(0, u64::MAX, 0, offset + size - self.total_size, false)?;
        }

        self.map(false, false, false)?;

        let user_mode = self.flags.contains(BufferFlags::USER_MODE);
        let mut linear = linear;
        let mut remaining = size;
        let mut fragment_index = 0usize;
        let mut current_offset = 0usize;
        while remaining != 0 {
            if fragment_index >= self.fragment_count() {
                return Err(IoBufferError::IncorrectBufferSize);
            }

            let fragment = self.fragments()[fragment_index];
            fragment_index += 1;
            if current_offset + fragment.size() <= offset {
                current_offset += fragment.size();
                continue;
            }

            let fragment_offset = offset.saturating_sub(current_offset);
            let chunk = (fragment.size() - fragment_offset).min(remaining);
            let fragment_address = fragment
                .virtual_address()
                .expect("fragment mapped")
                .as_u64()
                + fragment_offset as u64;

            if to_io_buffer {
                if user_mode {
                    let source = unsafe { slice::from_raw_parts(linear, chunk) };
                    H::copy_to_user(VirtAddr::new(fragment_address), source)?;
                } else {
                    unsafe {
                        ptr::copy_nonoverlapping(linear, fragment_address as *mut u8, chunk);
                    }
                }
            } else if user_mode {
                let destination = unsafe { slice::from_raw_parts_mut(linear, chunk) };
                H::copy_from_user(destination, VirtAddr::new(fragment_address))?;
            } else {
                unsafe {
                    ptr::copy_nonoverlapping(fragment_address as *const u8, linear, chunk);
                }
            }

            remaining -= chunk;
            linear = unsafe { linear.add(chunk) };
            current_offset += fragment.size();
        }

        Ok(())
    }

    /// Extend the buffer by allocating physical pages and appending them to
    /// the last fragment or to fresh fragment slots.
    ///
    /// The non-contiguous path allocates page by page; a failure leaves the
    /// already-appended pages in place. New pages are unmapped, so the
    /// mapped flag drops, and the buffer now owns memory that release must
    /// free.
    pub fn extend(
        &mut self,
        minimum_physical_address: u64,
        maximum_physical_address: u64,
        alignment: usize,
        size: usize,
        physically_contiguous: bool,
    ) -> Result<(), IoBufferError> {
        debug_assert!(self.flags.contains(BufferFlags::EXTENDABLE));

        // TODO: honor the minimum and maximum physical addresses.
        debug_assert!(minimum_physical_address == 0 && maximum_physical_address == u64::MAX);
        let _ = (minimum_physical_address, maximum_physical_address);

        // Worst case every new page needs its own fragment slot.
        let page_count = align_range_up(size, PAGE_SIZE) >> PAGE_SHIFT;
        let available = self.max_fragment_count - self.fragment_count();
        if page_count > available {
            return Err(IoBufferError::BufferTooSmall);
        }

        if physically_contiguous {
            let physical_address =
                H::allocate_pages(page_count, alignment).ok_or(IoBufferError::NoMemory)?;
            self.attach_pages(physical_address, page_count << PAGE_SHIFT);
        } else {
            for _ in 0..page_count {
                let Some(physical_address) = H::allocate_pages(1, alignment) else {
                    return Err(IoBufferError::NoMemory);
                };
                self.attach_pages(physical_address, PAGE_SIZE);
            }
        }

        Ok(())
    }

    /// Append freshly allocated pages to the fragment list, coalescing into
    /// the last fragment when it has no virtual address and is physically
    /// adjacent.
    fn attach_pages(&mut self, physical_address: PhysAddr, size: usize) {
        self.coalesce_or_push(Fragment::new(None, Some(physical_address), size), |last| {
            last.virtual_address().is_none() && last.physically_precedes(physical_address)
        });

        self.total_size += size;

        // The new pages are unmapped and owned. Updating the flags per
        // attachment keeps a partially failed extension releasable.
        self.flags -= BufferFlags::MAPPED;
        self.flags |= BufferFlags::MEMORY_OWNED;
    }

    /// Validate the buffer for DMA by a device with the given physical
    /// constraints, extending it in place when possible.
    ///
    /// Returns `Ok(Some(buffer))` when the buffer cannot meet the
    /// constraints and a fresh non-paged buffer was allocated instead; the
    /// caller owns the replacement in addition to the untouched original.
    pub fn validate_for_dma(
        &mut self,
        minimum_physical_address: u64,
        maximum_physical_address: u64,
        alignment: usize,
        size: usize,
        physically_contiguous: bool,
    ) -> Result<Option<Self>, IoBufferError> {
        // A buffer that cannot fit the data and cannot grow is not worth
        // replacing; just fail.
        if !self.flags.contains(BufferFlags::EXTENDABLE)
            && self.current_offset + size > self.total_size
        {
            return Err(IoBufferError::BufferTooSmall);
        }

        // DMA cannot be done to a user mode buffer.
        let must_reallocate = self.flags.contains(BufferFlags::USER_MODE)
            || !self.dma_constraints_hold(
                minimum_physical_address,
                maximum_physical_address,
                alignment,
                size,
                physically_contiguous,
            );

        if must_reallocate {
            let replacement = Self::allocate_non_paged(
                minimum_physical_address,
                maximum_physical_address,
                alignment,
                size,
                physically_contiguous,
                false,
                false,
            )?;
            return Ok(Some(replacement));
        }

        if self.flags.contains(BufferFlags::EXTENDABLE)
            && self.current_offset + size > self.total_size
        {
            // A physically contiguous run cannot be spliced into the middle
            // of the buffer; extension only works from the very end.
            if physically_contiguous && self.current_offset != self.total_size {
                let replacement = Self::allocate_non_paged(
                    minimum_physical_address,
                    maximum_physical_address,
                    alignment,
                    size,
                    physically_contiguous,
                    false,
                    false,
                )?;
                return Ok(Some(replacement));
            }

            let extension = self.current_offset + size - self.total_size;
            self.extend(
                minimum_physical_address,
                maximum_physical_address,
                alignment,
                extension,
                physically_contiguous,
            )?;
        }

        Ok(None)
    }

    /// Check the physical layout from the offset cursor against the
    /// device's constraints: per-fragment physical and size alignment,
    /// allowed address window, and contiguity when required.
    fn dma_constraints_hold(
        &self,
        minimum_physical_address: u64,
        maximum_physical_address: u64,
        alignment: usize,
        size: usize,
        physically_contiguous: bool,
    ) -> bool {
        let mut buffer_offset = self.current_offset;
        if buffer_offset == self.total_size {
            return true;
        }

        let alignment = alignment.max(1) as u64;
        let end_offset = (buffer_offset + size).min(self.total_size);
        let mut fragment_index = 0usize;
        let mut current_offset = 0usize;
        let mut previous_end: Option<u64> = None;
        while buffer_offset < end_offset {
            if fragment_index >= self.fragment_count() {
                return false;
            }

            let fragment = self.fragments()[fragment_index];
            if buffer_offset >= current_offset + fragment.size() {
                current_offset += fragment.size();
                fragment_index += 1;
                continue;
            }

            let fragment_offset = buffer_offset - current_offset;

            // A fragment with no known physical address cannot be handed to
            // a device.
            let Some(physical_address) = fragment.physical_address() else {
                return false;
            };

            let start = physical_address.as_u64() + fragment_offset as u64;
            if physically_contiguous && previous_end.is_some_and(|end| end != start) {
                return false;
            }

            let fragment_size = (fragment.size() - fragment_offset) as u64;
            if start % alignment != 0 || fragment_size % alignment != 0 {
                return false;
            }

            let end = start + fragment_size;
            if start < minimum_physical_address || end > maximum_physical_address {
                return false;
            }

            previous_end = Some(end);
            buffer_offset += fragment_size as usize;
            current_offset += fragment.size();
            fragment_index += 1;
        }

        true
    }

    /// Validate a buffer for cached I/O of `size` bytes at the given
    /// alignment. Returns a replacement cache-backed uninitialized buffer
    /// when none was supplied or the supplied one cannot take the I/O
    /// directly: not cache backed, not extendable, offset cursor unaligned
    /// or not at the end, or too few fragment slots remaining.
    pub fn validate_for_cached_io(
        buffer: Option<&Self>,
        size: usize,
        alignment: usize,
    ) -> Option<Self> {
        let needs_allocation = match buffer {
            None => true,
            Some(buffer) => {
                let available = buffer.max_fragment_count - buffer.fragment_count();
                let page_count = align_range_up(size, PAGE_SIZE) >> PAGE_SHIFT;

                !buffer.flags.contains(BufferFlags::PAGE_CACHE_BACKED)
                    || !buffer.flags.contains(BufferFlags::EXTENDABLE)
                    || !is_aligned(buffer.current_offset, alignment)
                    || buffer.current_offset != buffer.total_size
                    || page_count > available
            }
        };

        needs_allocation
            .then(|| Self::allocate_uninitialized(align_range_up(size, alignment), true))
    }

    /// Find the fragment covering the absolute `offset`, returning its
    /// index and the offset within it.
    fn locate_fragment(&self, offset: usize) -> Option<(usize, usize)> {
        let mut fragment_start = 0usize;
        for (index, fragment) in self.fragments().iter().enumerate() {
            if fragment_start + fragment.size() > offset {
                return Some((index, offset - fragment_start));
            }

            fragment_start += fragment.size();
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::buffer::tests::{assert_invariants, TestBuffer};
    use crate::buffer::{IoVector, IoVectorSource};
    use crate::test_hal;

    #[test]
    fn test_linear_copy_round_trip() {
        test_hal::reset();

        let mut buffer = TestBuffer::allocate_paged(300);
        let data: Vec<u8> = (0..300u32).map(|value| (value % 251) as u8).collect();
        buffer.write_data(0, &data).unwrap();

        let mut readback = vec![0u8; 300];
        buffer.read_data(0, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn test_zero_range() {
        test_hal::reset();

        let mut buffer = TestBuffer::allocate_paged(300);
        let data = [0xaau8; 300];
        buffer.write_data(0, &data).unwrap();
        buffer.zero(10, 20).unwrap();

        let mut readback = vec![0u8; 300];
        buffer.read_data(0, &mut readback).unwrap();
        assert!(readback[..10].iter().all(|&byte| byte == 0xaa));
        assert!(readback[10..30].iter().all(|&byte| byte == 0));
        assert!(readback[30..].iter().all(|&byte| byte == 0xaa));
    }

    #[test]
    fn test_access_crosses_fragments() {
        test_hal::reset();
        test_hal::seed_free_pages(&[0x300000, 0x600000, 0x400000]);

        // Three scattered pages: two fragments, one shared mapping.
        let mut buffer =
            TestBuffer::allocate_non_paged(0, u64::MAX, 0, 12288, false, false, false).unwrap();
        assert!(buffer.fragment_count() > 1);

        let data: Vec<u8> = (0..12288u32).map(|value| (value % 253) as u8).collect();
        buffer.write_data(0, &data).unwrap();

        let mut readback = vec![0u8; 12288];
        buffer.read_data(0, &mut readback).unwrap();
        assert_eq!(readback, data);

        // A window crossing the fragment boundary.
        let mut window = vec![0u8; 1000];
        buffer.read_data(3700, &mut window).unwrap();
        assert_eq!(window[..], data[3700..4700]);
    }

    #[test]
    fn test_access_honors_offset_cursor() {
        test_hal::reset();

        let mut buffer = TestBuffer::allocate_paged(1024);
        let data: Vec<u8> = (0..1024u32).map(|value| (value % 199) as u8).collect();
        buffer.write_data(0, &data).unwrap();

        buffer.increment_offset(100);
        let mut window = vec![0u8; 64];
        buffer.read_data(0, &mut window).unwrap();
        assert_eq!(window[..], data[100..164]);

        buffer.zero(0, 8).unwrap();
        buffer.decrement_offset(100);
        let mut readback = vec![0u8; 1024];
        buffer.read_data(0, &mut readback).unwrap();
        assert!(readback[100..108].iter().all(|&byte| byte == 0));
        assert_eq!(readback[..100], data[..100]);
    }

    #[test]
    fn test_copy_extends_destination() {
        test_hal::reset();

        let mut source =
            TestBuffer::allocate_non_paged(0, u64::MAX, 0, 8192, false, false, false).unwrap();
        let pattern: Vec<u8> = (0..8192u32).map(|value| (value % 241) as u8).collect();
        source.write_data(0, &pattern).unwrap();

        let mut destination = TestBuffer::allocate_uninitialized(8192, false);
        IoBuffer::copy(&mut destination, 0, &mut source, 0, 8192).unwrap();
        assert_eq!(destination.total_size(), 8192);
        assert!(destination
            .flags()
            .contains(BufferFlags::MEMORY_OWNED | BufferFlags::MAPPED));

        let mut readback = vec![0u8; 8192];
        destination.read_data(0, &mut readback).unwrap();
        assert_eq!(readback, pattern);
        assert_invariants(&destination);

        drop(destination);
        drop(source);
        assert_eq!(test_hal::outstanding_pages(), 0);
        assert_eq!(test_hal::outstanding_reservation_pages(), 0);
    }

    #[test]
    fn test_copy_to_user_buffer() {
        test_hal::reset();

        // The "user" memory is a host allocation; its address sits in the
        // user range, so the user-mode copy routine reaches it.
        let mut user_memory = vec![0u8; 300];
        let vector = [IoVector {
            base: user_memory.as_mut_ptr() as u64,
            length: 300,
        }];

        let mut destination = TestBuffer::from_vector(IoVectorSource::Kernel(&vector)).unwrap();

        let mut source = TestBuffer::allocate_paged(300);
        let pattern: Vec<u8> = (0..300u32).map(|value| (value % 7) as u8).collect();
        source.write_data(0, &pattern).unwrap();

        IoBuffer::copy(&mut destination, 0, &mut source, 0, 300).unwrap();
        assert_eq!(user_memory, pattern);
    }

    #[test]
    fn test_extend_contiguous() {
        test_hal::reset();

        let mut buffer = TestBuffer::allocate_uninitialized(8192, false);
        buffer.extend(0, u64::MAX, 0, 8192, true).unwrap();
        assert_eq!(buffer.fragment_count(), 1);
        assert_eq!(buffer.total_size(), 8192);
        assert!(buffer.flags().contains(BufferFlags::MEMORY_OWNED));
        assert!(!buffer.flags().contains(BufferFlags::MAPPED));
        assert_invariants(&buffer);

        drop(buffer);
        assert_eq!(test_hal::freed_pages().len(), 2);
    }

    #[test]
    fn test_extend_needs_fragment_slots() {
        test_hal::reset();

        let mut buffer = TestBuffer::allocate_uninitialized(4096, false);
        assert_eq!(
            buffer.extend(0, u64::MAX, 0, 8192, false).unwrap_err(),
            IoBufferError::BufferTooSmall
        );
    }

    #[test]
    fn test_extend_partial_failure_stays_releasable() {
        test_hal::reset();
        test_hal::limit_allocations(1);

        let mut buffer = TestBuffer::allocate_uninitialized(8192, false);
        assert_eq!(
            buffer.extend(0, u64::MAX, 0, 8192, false).unwrap_err(),
            IoBufferError::NoMemory
        );

        // The page that made it in stays attached and owned.
        assert_eq!(buffer.total_size(), 4096);
        assert!(buffer.flags().contains(BufferFlags::MEMORY_OWNED));
        assert_invariants(&buffer);

        drop(buffer);
        assert_eq!(test_hal::outstanding_pages(), 0);
    }

    #[test]
    fn test_validate_relocates_user_buffer() {
        test_hal::reset();

        let vector = [IoVector {
            base: 0x1000,
            length: 4096,
        }];
        let mut buffer = TestBuffer::from_vector(IoVectorSource::Kernel(&vector)).unwrap();

        let replacement = buffer
            .validate_for_dma(0, u64::MAX, 4096, 4096, true)
            .unwrap()
            .expect("user buffers must be reallocated for DMA");
        assert!(replacement.flags().contains(
            BufferFlags::NON_PAGED | BufferFlags::MEMORY_OWNED | BufferFlags::MAPPED
        ));
        assert_eq!(replacement.total_size(), 4096);
        assert_invariants(&replacement);

        // The original is untouched; the caller owns both.
        assert!(buffer.flags().contains(BufferFlags::USER_MODE));
        assert_eq!(buffer.total_size(), 4096);
        assert_eq!(buffer.fragment_count(), 1);
    }

    #[test]
    fn test_validate_accepts_suitable_buffer() {
        test_hal::reset();

        let mut buffer =
            TestBuffer::allocate_non_paged(0, u64::MAX, 0, 8192, true, false, false).unwrap();
        let replacement = buffer.validate_for_dma(0, u64::MAX, 4096, 8192, true).unwrap();
        assert!(replacement.is_none());
    }

    #[test]
    fn test_validate_rejects_misaligned_layout() {
        test_hal::reset();

        let mut buffer =
            TestBuffer::allocate_non_paged(0, u64::MAX, 0, 8192, true, false, false).unwrap();
        buffer.increment_offset(512);

        // The physical start is no longer page aligned for this device.
        let replacement = buffer
            .validate_for_dma(0, u64::MAX, 4096, 4096, false)
            .unwrap();
        assert!(replacement.is_some());
    }

    #[test]
    fn test_validate_extends_in_place() {
        test_hal::reset();

        let mut buffer = TestBuffer::allocate_uninitialized(8192, false);
        buffer.extend(0, u64::MAX, 0, 4096, false).unwrap();
        buffer.increment_offset(4096);

        // Cursor at the end; a non-contiguous request grows in place.
        let replacement = buffer
            .validate_for_dma(0, u64::MAX, 4096, 4096, false)
            .unwrap();
        assert!(replacement.is_none());
        assert_eq!(buffer.total_size(), 8192);
        assert_invariants(&buffer);
    }

    #[test]
    fn test_validate_contiguous_growth_needs_cursor_at_end() {
        test_hal::reset();

        let mut buffer = TestBuffer::allocate_uninitialized(8192, false);
        buffer.extend(0, u64::MAX, 0, 4096, true).unwrap();

        // Cursor mid-buffer: a contiguous run cannot be spliced in, so a
        // replacement comes back instead of a partial extension.
        let replacement = buffer
            .validate_for_dma(0, u64::MAX, 4096, 8192, true)
            .unwrap();
        assert!(replacement.is_some());
        assert_eq!(buffer.total_size(), 4096);
    }

    #[test]
    fn test_validate_nonextendable_too_small() {
        test_hal::reset();

        let mut buffer = TestBuffer::allocate_paged(1024);
        assert_eq!(
            buffer
                .validate_for_dma(0, u64::MAX, 512, 4096, false)
                .unwrap_err(),
            IoBufferError::BufferTooSmall
        );
    }

    #[test]
    fn test_validate_for_cached_io() {
        test_hal::reset();

        // No buffer supplied: a cache-backed shell comes back, sized up to
        // the alignment.
        let replacement = TestBuffer::validate_for_cached_io(None, 5000, 4096).unwrap();
        assert!(replacement
            .flags()
            .contains(BufferFlags::PAGE_CACHE_BACKED | BufferFlags::EXTENDABLE));
        assert_eq!(replacement.max_fragment_count, 2);

        // A fresh cache-backed shell with room is taken as is.
        let suitable = TestBuffer::allocate_uninitialized(8192, true);
        assert!(TestBuffer::validate_for_cached_io(Some(&suitable), 8192, 4096).is_none());

        // Not cache backed: replaced.
        let plain = TestBuffer::allocate_uninitialized(8192, false);
        assert!(TestBuffer::validate_for_cached_io(Some(&plain), 4096, 4096).is_some());

        // Cursor not at the end: replaced.
        let mut appended = TestBuffer::allocate_uninitialized(8192, true);
        let entry = crate::page_cache::PageCacheEntry::new(x86_64::PhysAddr::new(0xd00000), None);
        appended.append_cache_page(&entry);
        assert!(TestBuffer::validate_for_cached_io(Some(&appended), 4096, 4096).is_some());
    }
}

use bitflags::bitflags;

bitflags! {
    /// State and lifecycle flags of an I/O buffer.
    ///
    /// Each bit carries a distinct contract for the release protocol; see
    /// the field documentation and [`IoBuffer`](crate::IoBuffer).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        /// The backing physical pages were allocated by this buffer and are
        /// freed on release.
        const MEMORY_OWNED = 1 << 0;
        /// The descriptor storage is owned by the caller (in-place
        /// initialization).
        const STRUCTURE_NOT_OWNED = 1 << 1;
        /// All physical pages are pinned against reclaim and are unlocked on
        /// release, unless they belong to the page cache.
        const MEMORY_LOCKED = 1 << 2;
        /// The descriptor metadata itself resides in non-pageable storage.
        const NON_PAGED = 1 << 3;
        /// At least one page is shared with a page cache entry whose
        /// reference protects it.
        const PAGE_CACHE_BACKED = 1 << 4;
        /// The descriptor is a logical sub-view of another buffer and holds
        /// no resources.
        const FRAGMENT = 1 << 5;
        /// Virtual addresses refer to the current user address space.
        const USER_MODE = 1 << 6;
        /// Every fragment has a valid virtual address. The buffer need not
        /// be virtually contiguous.
        const MAPPED = 1 << 7;
        /// One continuous virtual address range covers all fragments.
        const VIRTUALLY_CONTIGUOUS = 1 << 8;
        /// The virtual address range was allocated by this subsystem and is
        /// released on teardown.
        const UNMAP_ON_FREE = 1 << 9;
        /// More pages may be appended through the extension path.
        const EXTENDABLE = 1 << 10;
    }
}

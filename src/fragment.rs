use x86_64::{PhysAddr, VirtAddr};

/// A maximal run of bytes within a buffer that is contiguous in both
/// physical and virtual address space.
///
/// `None` for the physical address means "not yet known", distinct from
/// address zero. The virtual address may be a kernel or user pointer
/// depending on the owning buffer's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fragment {
    pub(crate) virtual_address: Option<VirtAddr>,
    pub(crate) physical_address: Option<PhysAddr>,
    pub(crate) size: usize,
}

impl Fragment {
    pub(crate) fn new(
        virtual_address: Option<VirtAddr>,
        physical_address: Option<PhysAddr>,
        size: usize,
    ) -> Self {
        Self {
            virtual_address,
            physical_address,
            size,
        }
    }

    /// Virtual address of the first byte, if the fragment is mapped.
    pub fn virtual_address(&self) -> Option<VirtAddr> {
        self.virtual_address
    }

    /// Physical address of the first byte, if known.
    pub fn physical_address(&self) -> Option<PhysAddr> {
        self.physical_address
    }

    /// Size of the fragment in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last physical byte, as a raw value so that the end of
    /// the address space stays representable.
    pub(crate) fn physical_end(&self) -> Option<u64> {
        self.physical_address
            .map(|address| address.as_u64() + self.size as u64)
    }

    /// One past the last virtual byte, as a raw value.
    pub(crate) fn virtual_end(&self) -> Option<u64> {
        self.virtual_address
            .map(|address| address.as_u64().wrapping_add(self.size as u64))
    }

    /// True when `physical_address` begins exactly where this fragment ends.
    pub(crate) fn physically_precedes(&self, physical_address: PhysAddr) -> bool {
        self.physical_end() == Some(physical_address.as_u64())
    }

    /// True when `virtual_address` begins exactly where this fragment ends.
    pub(crate) fn virtually_precedes(&self, virtual_address: u64) -> bool {
        self.virtual_end() == Some(virtual_address)
    }

    /// True when a page at the given addresses would share this fragment's
    /// virtual address state: either neither side is mapped, or both are and
    /// the new page continues the fragment's virtual run.
    pub(crate) fn virtually_continues_to(&self, virtual_address: Option<VirtAddr>) -> bool {
        match (self.virtual_address, virtual_address) {
            (None, None) => true,
            (Some(_), Some(next)) => self.virtual_end() == Some(next.as_u64()),
            _ => false,
        }
    }
}

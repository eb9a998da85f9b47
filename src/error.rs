/// Errors surfaced by I/O buffer operations.
///
/// Every failure leaves the buffer in a releasable state: dropping it still
/// returns exactly the pages, references, and address ranges it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBufferError {
    /// An allocator (descriptor, pool, or virtual address range) refused the
    /// request.
    InsufficientResources,
    /// A parameter was out of range, or a supposedly resident page had no
    /// physical mapping.
    InvalidParameter,
    /// An address range crossed the kernel/user boundary.
    AccessViolation,
    /// The buffer cannot hold the requested bytes and cannot be extended, or
    /// an extension needs more fragment slots than remain.
    BufferTooSmall,
    /// A copy or zero walk ran off the end of the fragment list.
    IncorrectBufferSize,
    /// The physical page allocator failed during an extension.
    NoMemory,
}

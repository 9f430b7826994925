//! Offset allocators for GPU heaps.
//!
//! None of the allocators in this crate own memory. They hand out offsets
//! into a heap that lives somewhere else (an upload buffer, a descriptor
//! heap), and leave it to the caller to turn those offsets into pointers or
//! descriptor handles.
//!
//! - [`LinearAllocator`]: bump allocation, reset all at once.
//! - [`RingAllocator`]: allocations are grouped into frames and reclaimed in
//!   the order the frames were sealed.
//! - [`FreeList`]: an address-sorted list of free index ranges for
//!   long-lived allocations that may be freed at any time.
//!
//! None of these types lock. Callers that share an allocator between threads
//! wrap it in a mutex.

mod free_list;
mod linear;
mod ring;

pub use free_list::FreeList;
pub use linear::LinearAllocator;
pub use ring::RingAllocator;

/// Offset value used by callers that store offsets in plain integers to mark
/// the absence of an allocation.
pub const INVALID_OFFSET: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The allocator does not have enough free space to satisfy the
    /// allocation.
    #[error("out of memory: requested {requested}, {available} of {capacity} available")]
    OutOfMemory {
        capacity: u64,
        available: u64,
        requested: u64,
    },
    /// The allocator is not large enough to satisfy the allocation, even when
    /// empty.
    #[error("allocation of {requested} exceeds allocator capacity of {capacity}")]
    InsufficientCapacity { capacity: u64, requested: u64 },
}

/// Rounds `a` up to the next multiple of `b`. An alignment of 0 or 1 leaves
/// `a` unchanged.
#[must_use]
pub fn next_multiple_of(a: u64, b: u64) -> u64 {
    if b <= 1 {
        return a;
    }

    match a % b {
        0 => a,
        r => a + b - r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(next_multiple_of(0, 256), 0);
        assert_eq!(next_multiple_of(1, 256), 256);
        assert_eq!(next_multiple_of(256, 256), 256);
        assert_eq!(next_multiple_of(257, 256), 512);
        assert_eq!(next_multiple_of(13, 0), 13);
        assert_eq!(next_multiple_of(13, 1), 13);
    }
}

use crate::{next_multiple_of, Error};

/// A bump allocator over `[reserve, max_size)`.
///
/// Allocations cannot be freed individually. The whole allocator is reset
/// with [`LinearAllocator::clear`], typically once the GPU has finished with
/// every allocation made from it.
#[derive(Debug)]
pub struct LinearAllocator {
    max_size: u64,
    reserve: u64,
    top: u64,
}

impl LinearAllocator {
    /// Creates an allocator over `[reserve, max_size)`. The first `reserve`
    /// units are never handed out.
    ///
    /// ## Panics
    ///
    /// Panics if `reserve` is larger than `max_size`.
    #[must_use]
    pub fn new(max_size: u64, reserve: u64) -> Self {
        assert!(
            reserve <= max_size,
            "reserve ({reserve}) cannot be larger than the allocator ({max_size})"
        );

        Self {
            max_size,
            reserve,
            top: reserve,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn reserve(&self) -> u64 {
        self.reserve
    }

    /// The offset at which the next unaligned allocation would begin.
    pub fn top(&self) -> u64 {
        self.top
    }

    /// Units consumed since the last clear, alignment padding included.
    pub fn used_size(&self) -> u64 {
        self.top - self.reserve
    }

    pub fn is_full(&self) -> bool {
        self.top == self.max_size
    }

    pub fn can_fit(&self, size: u64, align: u64) -> bool {
        next_multiple_of(self.top, align)
            .checked_add(size)
            .map_or(false, |end| end <= self.max_size)
    }

    /// Allocates `size` units aligned to `align`.
    ///
    /// ## Errors
    ///
    /// Returns `Error::InsufficientCapacity` if `size` is larger than the
    /// allocator could ever hold, and `Error::OutOfMemory` if the allocation
    /// would cross `max_size`. The allocator is unchanged on failure.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<u64, Error> {
        let capacity = self.max_size - self.reserve;

        if size > capacity {
            return Err(Error::InsufficientCapacity {
                capacity,
                requested: size,
            });
        }

        if !self.can_fit(size, align) {
            return Err(Error::OutOfMemory {
                capacity,
                available: self.max_size - self.top,
                requested: size,
            });
        }

        let offset = next_multiple_of(self.top, align);
        self.top = offset + size;
        Ok(offset)
    }

    /// Discards every allocation, leaving the reserved prefix untouched.
    pub fn clear(&mut self) {
        self.top = self.reserve;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump() {
        let mut allocator = LinearAllocator::new(1024, 0);

        assert_eq!(allocator.allocate(100, 0), Ok(0));
        assert_eq!(allocator.allocate(100, 1), Ok(100));
        assert_eq!(allocator.allocate(100, 256), Ok(256));
        assert_eq!(allocator.top(), 356);
        assert_eq!(allocator.used_size(), 356);
    }

    #[test]
    fn reserve_is_never_allocated() {
        let mut allocator = LinearAllocator::new(64, 16);

        assert_eq!(allocator.allocate(8, 0), Ok(16));
        assert_eq!(allocator.allocate(40, 0), Ok(24));
        assert!(allocator.is_full());

        allocator.clear();
        assert_eq!(allocator.top(), 16);
        assert_eq!(allocator.allocate(48, 0), Ok(16));
    }

    #[test]
    fn out_of_memory() {
        let mut allocator = LinearAllocator::new(128, 0);
        allocator.allocate(100, 0).unwrap();

        let top = allocator.top();
        assert_eq!(
            allocator.allocate(29, 0),
            Err(Error::OutOfMemory {
                capacity: 128,
                available: 28,
                requested: 29
            })
        );
        assert_eq!(
            allocator.top(),
            top,
            "failed allocation cannot change allocator state"
        );

        // fits unaligned, but not once aligned
        assert!(allocator.can_fit(28, 1));
        assert!(!allocator.can_fit(28, 8));
        assert_eq!(allocator.allocate(28, 0), Ok(100));

        assert_eq!(
            allocator.allocate(129, 0),
            Err(Error::InsufficientCapacity {
                capacity: 128,
                requested: 129
            })
        );
    }

    #[test]
    fn clear_is_idempotent() {
        let mut allocator = LinearAllocator::new(256, 32);
        allocator.allocate(100, 16).unwrap();

        allocator.clear();
        assert_eq!(allocator.top(), allocator.reserve());
        allocator.clear();
        assert_eq!(allocator.top(), allocator.reserve());
        assert_eq!(allocator.used_size(), 0);
    }

    #[test]
    fn allocations_are_disjoint_and_aligned() {
        let mut allocator = LinearAllocator::new(4096, 10);
        let requests = [(1, 0), (17, 4), (3, 256), (64, 64), (5, 2), (100, 16), (1, 128)];

        let mut ranges = Vec::new();
        for (size, align) in requests {
            let offset = allocator.allocate(size, align).unwrap();
            if align > 1 {
                assert_eq!(offset % align, 0);
            }
            assert!(offset >= 10 && offset + size <= 4096);
            ranges.push(offset..offset + size);
        }

        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(a.end <= b.start || b.end <= a.start, "{a:?} overlaps {b:?}");
            }
        }
    }
}

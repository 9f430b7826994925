use std::ops::Range;

use crate::Error;

/// An address-sorted list of free index ranges.
///
/// Ranges never overlap and are never adjacent; freeing an index next to an
/// existing range extends that range, and freeing the gap between two ranges
/// merges them.
#[derive(Debug)]
pub struct FreeList {
    capacity: u32,
    ranges: Vec<Range<u32>>,
}

impl FreeList {
    /// Creates a list in which every index in `0..capacity` is free.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        let ranges = if capacity > 0 {
            vec![0..capacity]
        } else {
            Vec::new()
        };

        Self { capacity, ranges }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The total number of free indices.
    pub fn available(&self) -> u32 {
        self.ranges.iter().map(|range| range.end - range.start).sum()
    }

    pub fn is_exhausted(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[Range<u32>] {
        &self.ranges
    }

    /// Takes one index from the front of the first free range.
    pub fn allocate(&mut self) -> Result<u32, Error> {
        self.allocate_range(1)
    }

    /// Takes `count` contiguous indices from the front of the first free range
    /// that can hold them.
    ///
    /// ## Errors
    ///
    /// Returns `Error::InsufficientCapacity` if the list could never hold
    /// `count` indices, and `Error::OutOfMemory` if no free range is large
    /// enough. The list is unchanged on failure.
    pub fn allocate_range(&mut self, count: u32) -> Result<u32, Error> {
        if count > self.capacity {
            return Err(Error::InsufficientCapacity {
                capacity: self.capacity.into(),
                requested: count.into(),
            });
        }

        let Some(index) = self
            .ranges
            .iter()
            .position(|range| range.end - range.start >= count)
        else {
            return Err(Error::OutOfMemory {
                capacity: self.capacity.into(),
                available: self.available().into(),
                requested: count.into(),
            });
        };

        let range = &mut self.ranges[index];
        let offset = range.start;
        range.start += count;

        if range.is_empty() {
            self.ranges.remove(index);
        }

        Ok(offset)
    }

    /// Returns a single index to the list.
    pub fn free(&mut self, offset: u32) {
        self.free_range(offset, 1);
    }

    /// Returns `count` contiguous indices starting at `offset` to the list.
    ///
    /// ## Panics
    ///
    /// Panics if any index in the range is out of bounds or already free.
    pub fn free_range(&mut self, offset: u32, count: u32) {
        if count == 0 {
            return;
        }

        let end = offset
            .checked_add(count)
            .filter(|end| *end <= self.capacity)
            .unwrap_or_else(|| {
                panic!(
                    "range {offset}..{} is out of bounds ({})",
                    u64::from(offset) + u64::from(count),
                    self.capacity
                )
            });

        let index = self.ranges.partition_point(|range| range.start < offset);

        let merge_prev = match index.checked_sub(1).map(|i| &self.ranges[i]) {
            Some(prev) => {
                assert!(prev.end <= offset, "double free of {offset}..{end}");
                prev.end == offset
            }
            None => false,
        };

        let merge_next = match self.ranges.get(index) {
            Some(next) => {
                assert!(end <= next.start, "double free of {offset}..{end}");
                next.start == end
            }
            None => false,
        };

        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.ranges.remove(index);
                self.ranges[index - 1].end = next.end;
            }
            (true, false) => self.ranges[index - 1].end = end,
            (false, true) => self.ranges[index].start = offset,
            (false, false) => self.ranges.insert(index, offset..end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_two_frees() {
        let mut list = FreeList::new(4);

        assert_eq!(list.allocate(), Ok(0));
        assert_eq!(list.allocate(), Ok(1));
        assert_eq!(list.allocate(), Ok(2));
        assert_eq!(list.allocate(), Ok(3));
        assert!(list.is_exhausted());

        list.free(1);
        assert!(list.allocate_range(2).is_err());

        list.free(2);
        assert_eq!(list.ranges(), &[1..3]);
        assert_eq!(list.allocate_range(2), Ok(1));
        assert!(list.is_exhausted());
    }

    #[test]
    fn merge_both_neighbours() {
        let mut list = FreeList::new(8);
        assert_eq!(list.allocate_range(8), Ok(0));

        list.free(1);
        list.free(3);
        assert_eq!(list.ranges(), &[1..2, 3..4]);

        list.free(2);
        assert_eq!(list.ranges(), &[1..4]);

        list.free(0);
        list.free_range(5, 3);
        assert_eq!(list.ranges(), &[0..4, 5..8]);

        list.free(4);
        assert_eq!(list.ranges(), &[0..8]);
        assert_eq!(list.available(), 8);
    }

    #[test]
    fn reuse_after_free() {
        let mut list = FreeList::new(16);

        let a = list.allocate().unwrap();
        let b = list.allocate().unwrap();
        list.free(a);

        assert_eq!(list.allocate(), Ok(a));
        assert_ne!(list.allocate(), Ok(b));
    }

    #[test]
    fn first_fit() {
        let mut list = FreeList::new(10);
        list.allocate_range(10).unwrap();

        list.free(0);
        list.free_range(4, 3);
        list.free_range(8, 2);

        assert_eq!(list.allocate_range(2), Ok(4));
        assert_eq!(list.allocate(), Ok(0));
        assert_eq!(list.allocate_range(2), Ok(8));
        assert_eq!(list.ranges(), &[6..7]);

        let before = list.ranges().to_vec();
        assert_eq!(
            list.allocate_range(2),
            Err(Error::OutOfMemory {
                capacity: 10,
                available: 1,
                requested: 2
            })
        );
        assert_eq!(list.ranges(), &before[..]);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free() {
        let mut list = FreeList::new(4);
        list.allocate().unwrap();
        list.free(0);
        list.free(0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn overlapping_free() {
        let mut list = FreeList::new(8);
        list.allocate_range(4).unwrap();
        list.free_range(2, 4);
    }
}

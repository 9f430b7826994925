use std::collections::VecDeque;

use crate::{next_multiple_of, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FrameEntry {
    /// The frame that sealed this batch.
    frame: u64,
    /// The tail of the ring when the batch was sealed. Releasing the batch
    /// moves the head here.
    offset: u64,
    /// Every unit charged to the batch, including alignment padding and
    /// space skipped when wrapping.
    size: u64,
}

/// An allocator of frame-scoped ranges from a fixed-size ring.
///
/// Allocations are made from the tail of the ring and grouped into batches
/// with [`RingAllocator::finish_current_frame`]. Batches are reclaimed from
/// the head, in the order they were sealed, with
/// [`RingAllocator::release_completed_frames`].
///
/// The first `reserve` units of the heap are excluded from the ring. Offsets
/// are always reported relative to the start of the heap, not the ring.
#[derive(Debug)]
pub struct RingAllocator {
    completed_frames: VecDeque<FrameEntry>,
    reserve: u64,
    capacity: u64,
    head: u64,
    tail: u64,
    used_size: u64,
    current_frame_size: u64,
}

impl RingAllocator {
    /// Creates a ring over `[reserve, max_size)`.
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
            completed_frames: VecDeque::new(),
            reserve,
            capacity: max_size - reserve,
            head: 0,
            tail: 0,
            used_size: 0,
            current_frame_size: 0,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.reserve + self.capacity
    }

    pub fn reserve(&self) -> u64 {
        self.reserve
    }

    /// The number of units available to the ring, excluding the reserve.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Units that cannot be allocated until their batch is released. This
    /// includes alignment padding and space skipped when wrapping.
    pub fn used_size(&self) -> u64 {
        self.used_size
    }

    pub fn head(&self) -> u64 {
        self.reserve + self.head
    }

    pub fn tail(&self) -> u64 {
        self.reserve + self.tail
    }

    pub fn is_full(&self) -> bool {
        self.used_size == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.used_size == 0
    }

    /// The number of sealed batches that have not been released.
    pub fn pending_frames(&self) -> usize {
        self.completed_frames.len()
    }

    /// Allocates `size` units aligned to `align` from the tail of the ring.
    ///
    /// If the space between the tail and the end of the ring is too small,
    /// the allocation wraps around to the start of the ring. The skipped
    /// space is charged to the current frame and becomes available again
    /// when the frame is released. An empty ring keeps its head and tail,
    /// so a request must still fit after the tail or before the head.
    ///
    /// ## Errors
    ///
    /// Returns `Error::InsufficientCapacity` if the ring could never hold
    /// `size` units, and `Error::OutOfMemory` if it cannot hold them until
    /// more frames are released. The allocator is unchanged on failure.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<u64, Error> {
        if size > self.capacity {
            return Err(Error::InsufficientCapacity {
                capacity: self.capacity,
                requested: size,
            });
        }

        let out_of_memory = Error::OutOfMemory {
            capacity: self.capacity,
            available: self.capacity - self.used_size,
            requested: size,
        };

        if self.is_full() {
            return Err(out_of_memory);
        }

        let aligned_tail = self.align(self.tail, align);

        let (start, charged) = if self.tail >= self.head {
            if aligned_tail + size <= self.capacity {
                // [   free   |   used   |  <here>  ]
                //            ^head      ^tail
                (aligned_tail, aligned_tail - self.tail + size)
            } else {
                // [  <here>  |   used   |  <wasted>  ]
                //            ^head      ^tail
                let aligned_start = self.align(0, align);
                if aligned_start + size <= self.head {
                    (aligned_start, (self.capacity - self.tail) + aligned_start + size)
                } else {
                    return Err(out_of_memory);
                }
            }
        } else if aligned_tail + size <= self.head {
            // [   used   |  <here>  |   used   ]
            //            ^tail      ^head
            (aligned_tail, aligned_tail - self.tail + size)
        } else {
            return Err(out_of_memory);
        };

        self.tail = start + size;
        self.used_size += charged;
        self.current_frame_size += charged;

        debug_assert!(self.used_size <= self.capacity);

        Ok(self.reserve + start)
    }

    /// Seals everything allocated since the last call into one batch tagged
    /// with `frame`.
    ///
    /// Frame tags must not decrease from one call to the next.
    pub fn finish_current_frame(&mut self, frame: u64) {
        debug_assert!(
            self.completed_frames
                .back()
                .map_or(true, |entry| entry.frame <= frame),
            "frames must be finished in order"
        );

        self.completed_frames.push_back(FrameEntry {
            frame,
            offset: self.tail,
            size: self.current_frame_size,
        });

        self.current_frame_size = 0;
    }

    /// Reclaims every sealed batch tagged with a frame no later than
    /// `completed_frame`, returning the number of batches released.
    ///
    /// `completed_frame` must be a frame the GPU has finished with.
    pub fn release_completed_frames(&mut self, completed_frame: u64) -> usize {
        let mut released = 0;

        while let Some(entry) = self.completed_frames.front() {
            if entry.frame > completed_frame {
                break;
            }

            self.used_size -= entry.size;
            self.head = entry.offset;
            self.completed_frames.pop_front();
            released += 1;
        }

        if released > 0 {
            log::trace!(
                "ring released {released} frame(s) up to {completed_frame}, {} of {} in use",
                self.used_size,
                self.capacity
            );
        }

        released
    }

    /// Aligns a ring-relative offset so that its heap-relative position is a
    /// multiple of `align`.
    fn align(&self, offset: u64, align: u64) -> u64 {
        next_multiple_of(self.reserve + offset, align) - self.reserve
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debug_print(allocator: &RingAllocator) {
        println!(
            "head: {} tail: {} used: {}/{} frames: {:?}",
            allocator.head(),
            allocator.tail(),
            allocator.used_size(),
            allocator.capacity(),
            allocator.completed_frames
        );
    }

    #[test]
    fn wraparound() {
        let mut allocator = RingAllocator::new(1000, 0);

        assert_eq!(allocator.allocate(300, 0), Ok(0));
        assert_eq!(allocator.allocate(300, 0), Ok(300));
        allocator.finish_current_frame(1);

        assert_eq!(allocator.allocate(300, 0), Ok(600));
        allocator.finish_current_frame(2);
        assert_eq!(allocator.used_size(), 900);

        assert_eq!(allocator.release_completed_frames(1), 1);
        assert_eq!(allocator.used_size(), 300);
        assert_eq!(allocator.head(), 600);
        debug_print(&allocator);

        // 900 + 500 > 1000, but the 600 units before the head are free
        assert_eq!(allocator.allocate(500, 0), Ok(0));
        assert_eq!(allocator.tail(), 500);
        // 100 units skipped at the end of the ring are charged to this frame
        assert_eq!(allocator.used_size(), 900);
        allocator.finish_current_frame(3);

        assert_eq!(allocator.release_completed_frames(3), 2);
        assert!(allocator.is_empty());
        assert_eq!(allocator.head(), 500);
        assert_eq!(allocator.tail(), 500);
    }

    #[test]
    fn release_is_fifo() {
        let mut allocator = RingAllocator::new(100, 0);

        allocator.allocate(10, 0).unwrap();
        allocator.finish_current_frame(1);
        allocator.allocate(20, 0).unwrap();
        allocator.finish_current_frame(2);
        allocator.allocate(30, 0).unwrap();
        allocator.finish_current_frame(4);

        assert_eq!(allocator.release_completed_frames(0), 0);
        assert_eq!(allocator.used_size(), 60);

        assert_eq!(allocator.release_completed_frames(1), 1);
        assert_eq!(allocator.used_size(), 50);
        assert_eq!(allocator.head(), 10);

        // frame 3 was never sealed, frame 4 is still in flight
        assert_eq!(allocator.release_completed_frames(3), 1);
        assert_eq!(allocator.used_size(), 30);
        assert_eq!(allocator.pending_frames(), 1);

        assert_eq!(allocator.release_completed_frames(4), 1);
        assert!(allocator.is_empty());
    }

    #[test]
    fn unsealed_allocations_survive_release() {
        let mut allocator = RingAllocator::new(100, 0);

        allocator.allocate(40, 0).unwrap();
        allocator.finish_current_frame(1);
        allocator.allocate(40, 0).unwrap();

        allocator.release_completed_frames(u64::MAX);
        assert_eq!(allocator.used_size(), 40);
        assert_eq!(allocator.head(), 40);

        // the unsealed allocation blocks the wrap
        assert!(allocator.allocate(41, 0).is_err());
        assert_eq!(allocator.allocate(40, 0), Ok(0));
    }

    #[test]
    fn failure_does_not_change_state() {
        let mut allocator = RingAllocator::new(128, 0);

        allocator.allocate(64, 0).unwrap();
        allocator.finish_current_frame(1);
        allocator.allocate(32, 0).unwrap();

        let head = allocator.head();
        let tail = allocator.tail();
        let used = allocator.used_size();

        assert_eq!(
            allocator.allocate(33, 0),
            Err(Error::OutOfMemory {
                capacity: 128,
                available: 32,
                requested: 33
            })
        );

        assert_eq!(
            allocator.allocate(129, 0),
            Err(Error::InsufficientCapacity {
                capacity: 128,
                requested: 129
            })
        );

        assert_eq!(allocator.head(), head, "failed allocation cannot change allocator state");
        assert_eq!(allocator.tail(), tail, "failed allocation cannot change allocator state");
        assert_eq!(allocator.used_size(), used, "failed allocation cannot change allocator state");
    }

    #[test]
    fn full_ring() {
        let mut allocator = RingAllocator::new(64, 0);

        assert_eq!(allocator.allocate(64, 0), Ok(0));
        assert!(allocator.is_full());
        assert!(allocator.allocate(0, 0).is_err());
        allocator.finish_current_frame(1);

        allocator.release_completed_frames(1);
        assert!(allocator.is_empty());

        assert_eq!(allocator.allocate(64, 0), Ok(0));
        assert!(allocator.is_full());
    }

    #[test]
    fn empty_ring_keeps_its_position() {
        let mut allocator = RingAllocator::new(1000, 0);

        allocator.allocate(500, 0).unwrap();
        allocator.finish_current_frame(1);
        allocator.release_completed_frames(1);
        assert!(allocator.is_empty());
        assert_eq!(allocator.head(), 500);
        assert_eq!(allocator.tail(), 500);

        // neither [500, 1000) nor [0, 500) fits
        assert!(allocator.allocate(800, 0).is_err());
        assert_eq!(allocator.tail(), 500);
        assert_eq!(allocator.used_size(), 0);

        assert_eq!(allocator.allocate(500, 0), Ok(500));
        assert_eq!(allocator.tail(), 1000);
        assert_eq!(allocator.used_size(), 500);
    }

    #[test]
    fn reserve() {
        let mut allocator = RingAllocator::new(110, 10);
        assert_eq!(allocator.capacity(), 100);

        assert_eq!(allocator.allocate(60, 0), Ok(10));
        allocator.finish_current_frame(1);
        assert_eq!(allocator.allocate(30, 0), Ok(70));
        allocator.finish_current_frame(2);
        allocator.release_completed_frames(1);

        assert_eq!(allocator.allocate(50, 0), Ok(10));
        assert_eq!(allocator.tail(), 60);
        assert_eq!(allocator.used_size(), 90);
    }

    #[test]
    fn alignment() {
        let mut allocator = RingAllocator::new(1024 + 3, 3);

        for (size, align) in [(1, 256), (7, 16), (100, 64), (3, 4), (256, 256)] {
            let offset = allocator.allocate(size, align).unwrap();
            assert_eq!(offset % align, 0, "offset {offset} not aligned to {align}");
        }

        // padding is charged to the frame
        let used = allocator.used_size();
        allocator.finish_current_frame(1);
        allocator.release_completed_frames(1);
        assert!(used > 1 + 7 + 100 + 3 + 256);
        assert!(allocator.is_empty());
    }

    #[test]
    fn live_ranges_never_overlap() {
        let mut allocator = RingAllocator::new(1000, 0);
        let mut live: VecDeque<(u64, Vec<std::ops::Range<u64>>)> = VecDeque::new();
        let mut current = Vec::new();

        // deterministic pseudo-random sizes
        let mut seed = 0x2545_f491_u64;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for frame in 1..=200 {
            for _ in 0..(next() % 4) {
                let size = 1 + next() % 150;
                let align = 1 << (next() % 5);

                if let Ok(offset) = allocator.allocate(size, align) {
                    assert_eq!(offset % align, 0);
                    assert!(offset + size <= allocator.max_size());

                    let range = offset..offset + size;
                    for other in live.iter().flat_map(|(_, r)| r).chain(&current) {
                        assert!(
                            range.end <= other.start || other.end <= range.start,
                            "{range:?} overlaps {other:?}"
                        );
                    }
                    current.push(range);
                }

                assert!(allocator.used_size() <= allocator.capacity());
            }

            allocator.finish_current_frame(frame);
            live.push_back((frame, std::mem::take(&mut current)));

            // keep two frames in flight
            if frame > 2 {
                let completed = frame - 2;
                allocator.release_completed_frames(completed);
                live.retain(|(f, _)| *f > completed);
            }
        }
    }
}

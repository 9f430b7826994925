use allocators::{FreeList, LinearAllocator, RingAllocator};
use parking_lot::Mutex;

use crate::{
    backend::{Backend, RawDescriptorHeap},
    fatal, DescriptorHeapKind, Error,
};

/// The CPU address of a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuDescriptor(pub usize);

impl CpuDescriptor {
    #[must_use]
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self(self.0 + count as usize * increment as usize)
    }
}

/// The GPU address of a descriptor in a shader-visible heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GpuDescriptor(pub u64);

impl GpuDescriptor {
    #[must_use]
    pub fn offset(self, count: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(count) * u64::from(increment))
    }
}

/// A descriptor slot in a [`DescriptorHeap`].
///
/// Handles do not own their slot. Returning the slot to its allocator, if
/// that is needed, is up to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    pub cpu: CpuDescriptor,
    /// Only present for shader-visible heaps.
    pub gpu: Option<GpuDescriptor>,
    /// The index of the slot within its heap.
    pub index: u32,
}

/// A fixed-size array of descriptors.
pub struct DescriptorHeap<B: Backend> {
    raw: B::DescriptorHeap,
    kind: DescriptorHeapKind,
    count: u32,
    increment: u32,
}

impl<B: Backend> DescriptorHeap<B> {
    pub fn new(
        backend: &B,
        kind: DescriptorHeapKind,
        count: u32,
        shader_visible: bool,
    ) -> Result<Self, Error> {
        assert!(
            !shader_visible || kind.can_be_shader_visible(),
            "{kind:?} descriptor heaps cannot be shader-visible"
        );

        let raw = backend.create_descriptor_heap(kind, count, shader_visible)?;
        let increment = backend.descriptor_increment(kind);

        log::debug!(
            "created {}{kind:?} descriptor heap with {count} descriptors",
            if shader_visible { "shader-visible " } else { "" }
        );

        Ok(Self {
            raw,
            kind,
            count,
            increment,
        })
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn increment(&self) -> u32 {
        self.increment
    }

    pub fn is_shader_visible(&self) -> bool {
        self.raw.gpu_start().is_some()
    }

    pub fn raw(&self) -> &B::DescriptorHeap {
        &self.raw
    }

    /// Returns the handle of the descriptor at `index`.
    ///
    /// ## Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn handle(&self, index: u32) -> DescriptorHandle {
        assert!(
            index < self.count,
            "descriptor index {index} out of bounds ({})",
            self.count
        );

        self.handle_unchecked(index)
    }

    /// Returns the first handle of a run of `count` descriptors starting at
    /// `index`. An empty run may start one past the last descriptor.
    fn range_start(&self, index: u32, count: u32) -> DescriptorHandle {
        debug_assert!(u64::from(index) + u64::from(count) <= u64::from(self.count));
        self.handle_unchecked(index)
    }

    fn handle_unchecked(&self, index: u32) -> DescriptorHandle {
        DescriptorHandle {
            cpu: self.raw.cpu_start().offset(index, self.increment),
            gpu: self
                .raw
                .gpu_start()
                .map(|start| start.offset(index, self.increment)),
            index,
        }
    }

    /// Checks that `handle` was produced by this heap.
    fn owns(&self, handle: &DescriptorHandle) -> bool {
        handle.index < self.count && self.handle(handle.index) == *handle
    }
}

/// An allocator for descriptors that live as long as the views they
/// describe.
///
/// Descriptors may be freed in any order and at any time, but the caller
/// must make sure that no GPU work still reads a descriptor before freeing
/// it.
pub struct OfflineDescriptorAllocator<B: Backend> {
    heap: DescriptorHeap<B>,
    free: Mutex<FreeList>,
}

impl<B: Backend> OfflineDescriptorAllocator<B> {
    pub fn new(backend: &B, kind: DescriptorHeapKind, count: u32) -> Result<Self, Error> {
        Ok(Self {
            heap: DescriptorHeap::new(backend, kind, count, false)?,
            free: Mutex::new(FreeList::new(count)),
        })
    }

    pub fn heap(&self) -> &DescriptorHeap<B> {
        &self.heap
    }

    /// The number of free descriptors.
    pub fn available(&self) -> u32 {
        self.free.lock().available()
    }

    /// Allocates one descriptor.
    ///
    /// ## Panics
    ///
    /// Panics if the heap is exhausted.
    #[must_use]
    pub fn allocate(&self) -> DescriptorHandle {
        self.allocate_range(1)
    }

    /// Allocates `count` contiguous descriptors, returning the first.
    ///
    /// ## Panics
    ///
    /// Panics if the heap has no free range large enough.
    #[must_use]
    pub fn allocate_range(&self, count: u32) -> DescriptorHandle {
        self.try_allocate_range(count).unwrap_or_else(|error| {
            fatal(format_args!(
                "{:?} offline descriptor heap exhausted: {error}",
                self.heap.kind
            ))
        })
    }

    pub fn try_allocate(&self) -> Result<DescriptorHandle, allocators::Error> {
        self.try_allocate_range(1)
    }

    pub fn try_allocate_range(&self, count: u32) -> Result<DescriptorHandle, allocators::Error> {
        let index = self.free.lock().allocate_range(count)?;
        Ok(self.heap.range_start(index, count))
    }

    /// Returns a descriptor to the heap.
    ///
    /// ## Panics
    ///
    /// Panics if the descriptor does not belong to this heap, or is already
    /// free.
    pub fn free(&self, handle: DescriptorHandle) {
        self.free_range(handle, 1);
    }

    /// Returns `count` contiguous descriptors starting at `handle` to the heap.
    pub fn free_range(&self, handle: DescriptorHandle, count: u32) {
        assert!(
            self.heap.owns(&handle),
            "{handle:?} does not belong to this {:?} heap",
            self.heap.kind
        );

        self.free.lock().free_range(handle.index, count);
    }
}

/// A shader-visible descriptor heap whose descriptors are allocated for a
/// single frame and reclaimed once the GPU has finished that frame.
///
/// The first `reserve` descriptors of the heap are excluded from the ring and
/// are available through [`RingDescriptorAllocator::reserved`].
pub struct RingDescriptorAllocator<B: Backend> {
    heap: DescriptorHeap<B>,
    ring: Mutex<RingAllocator>,
}

impl<B: Backend> RingDescriptorAllocator<B> {
    pub fn new(
        backend: &B,
        kind: DescriptorHeapKind,
        count: u32,
        reserve: u32,
    ) -> Result<Self, Error> {
        Ok(Self {
            heap: DescriptorHeap::new(backend, kind, count, true)?,
            ring: Mutex::new(RingAllocator::new(count.into(), reserve.into())),
        })
    }

    pub fn heap(&self) -> &DescriptorHeap<B> {
        &self.heap
    }

    pub fn reserve(&self) -> u32 {
        self.ring.lock().reserve() as u32
    }

    /// Returns the handle of a descriptor in the reserved prefix.
    ///
    /// ## Panics
    ///
    /// Panics if `index` is not in the reserved prefix.
    #[must_use]
    pub fn reserved(&self, index: u32) -> DescriptorHandle {
        let reserve = self.reserve();
        assert!(
            index < reserve,
            "descriptor {index} is not reserved ({reserve} reserved)"
        );
        self.heap.handle(index)
    }

    /// The number of descriptors held by frames that have not been released,
    /// including those skipped when the ring wrapped.
    pub fn used(&self) -> u32 {
        self.ring.lock().used_size() as u32
    }

    /// Allocates `count` contiguous descriptors for the current frame,
    /// returning the first.
    ///
    /// ## Panics
    ///
    /// Panics if the ring cannot fit `count` descriptors before more frames
    /// are released.
    #[must_use]
    pub fn allocate(&self, count: u32) -> DescriptorHandle {
        self.try_allocate(count).unwrap_or_else(|error| {
            fatal(format_args!(
                "{:?} online descriptor ring exhausted: {error}",
                self.heap.kind
            ))
        })
    }

    pub fn try_allocate(&self, count: u32) -> Result<DescriptorHandle, allocators::Error> {
        let index = self.ring.lock().allocate(count.into(), 1)?;
        Ok(self.heap.range_start(index as u32, count))
    }

    /// Seals the descriptors allocated since the last call as belonging to
    /// `frame`.
    pub fn finish_current_frame(&mut self, frame: u64) {
        self.ring.get_mut().finish_current_frame(frame);
    }

    /// Reclaims descriptors from every frame up to and including
    /// `completed_frame`.
    pub fn release_completed_frames(&mut self, completed_frame: u64) -> usize {
        self.ring.get_mut().release_completed_frames(completed_frame)
    }
}

/// A shader-visible descriptor heap with bump allocation, reset all at once.
pub struct LinearDescriptorAllocator<B: Backend> {
    heap: DescriptorHeap<B>,
    linear: Mutex<LinearAllocator>,
}

impl<B: Backend> LinearDescriptorAllocator<B> {
    pub fn new(
        backend: &B,
        kind: DescriptorHeapKind,
        count: u32,
        reserve: u32,
    ) -> Result<Self, Error> {
        Ok(Self {
            heap: DescriptorHeap::new(backend, kind, count, true)?,
            linear: Mutex::new(LinearAllocator::new(count.into(), reserve.into())),
        })
    }

    pub fn heap(&self) -> &DescriptorHeap<B> {
        &self.heap
    }

    pub fn used(&self) -> u32 {
        self.linear.lock().used_size() as u32
    }

    /// ## Panics
    ///
    /// Panics if the heap cannot fit `count` more descriptors.
    #[must_use]
    pub fn allocate(&self, count: u32) -> DescriptorHandle {
        self.try_allocate(count).unwrap_or_else(|error| {
            fatal(format_args!(
                "{:?} linear descriptor heap exhausted: {error}",
                self.heap.kind
            ))
        })
    }

    pub fn try_allocate(&self, count: u32) -> Result<DescriptorHandle, allocators::Error> {
        let index = self.linear.lock().allocate(count.into(), 1)?;
        Ok(self.heap.range_start(index as u32, count))
    }

    /// Discards every allocation. The GPU must have finished with all of
    /// them.
    pub fn clear(&mut self) {
        self.linear.get_mut().clear();
    }
}

use std::ptr::NonNull;

use allocators::{LinearAllocator, RingAllocator};
use parking_lot::Mutex;

use crate::{
    backend::{Backend, UploadBuffer},
    fatal, Error,
};

/// A range of upload memory that the CPU writes and the GPU reads.
///
/// The range stays valid until the frame it was allocated in has been
/// released by its allocator. Allocations from the same allocator never
/// overlap, so different threads may write to different allocations at the
/// same time.
pub struct DynamicAllocation<'a, B: Backend> {
    buffer: &'a B::UploadBuffer,
    cpu_address: NonNull<u8>,
    gpu_address: u64,
    offset: u64,
    size: u64,
}

impl<'a, B: Backend> DynamicAllocation<'a, B> {
    fn new(buffer: &'a B::UploadBuffer, offset: u64, size: u64) -> Self {
        debug_assert!(offset + size <= buffer.size());

        Self {
            buffer,
            // SAFETY: The allocator keeps `offset + size` within the buffer.
            cpu_address: unsafe {
                NonNull::new_unchecked(buffer.cpu_address().as_ptr().add(offset as usize))
            },
            gpu_address: buffer.gpu_address() + offset,
            offset,
            size,
        }
    }

    /// The buffer the allocation was made from.
    pub fn buffer(&self) -> &'a B::UploadBuffer {
        self.buffer
    }

    pub fn cpu_address(&self) -> NonNull<u8> {
        self.cpu_address
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    /// The offset of the allocation from the start of its buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copies `data` to the start of the allocation.
    ///
    /// ## Panics
    ///
    /// Panics if `data` is larger than the allocation.
    pub fn write(&self, data: &[u8]) {
        self.write_slice(data);
    }

    /// Copies a value to the start of the allocation.
    pub fn write_value<T: Copy>(&self, value: &T) {
        self.write_slice(std::slice::from_ref(value));
    }

    /// Copies a slice of values to the start of the allocation.
    ///
    /// ## Panics
    ///
    /// Panics if `data` is larger than the allocation.
    pub fn write_slice<T: Copy>(&self, data: &[T]) {
        let len = std::mem::size_of_val(data);
        assert!(
            len as u64 <= self.size,
            "writing {len} bytes into an allocation of {} bytes",
            self.size
        );

        // SAFETY: The destination lies within this allocation, which no other
        // allocation overlaps. Upload memory has no alignment requirement
        // visible to the CPU, so the copy is done bytewise.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr().cast::<u8>(), self.cpu_address.as_ptr(), len);
        }
    }
}

impl<B: Backend> std::fmt::Debug for DynamicAllocation<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicAllocation")
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Upload memory with bump allocation, reset all at once.
///
/// The device keeps one per backbuffer and clears it when the backbuffer
/// comes around again, at which point the GPU has finished reading it.
pub struct LinearDynamicAllocator<B: Backend> {
    buffer: B::UploadBuffer,
    linear: Mutex<LinearAllocator>,
}

impl<B: Backend> LinearDynamicAllocator<B> {
    pub fn new(backend: &B, size: u64) -> Result<Self, Error> {
        let buffer = backend.create_upload_buffer(size)?;
        log::debug!("created {size} byte linear upload buffer");

        Ok(Self {
            buffer,
            linear: Mutex::new(LinearAllocator::new(size, 0)),
        })
    }

    pub fn buffer(&self) -> &B::UploadBuffer {
        &self.buffer
    }

    pub fn used(&self) -> u64 {
        self.linear.lock().used_size()
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// ## Panics
    ///
    /// Panics if the buffer cannot fit the allocation.
    pub fn allocate(&self, size: u64, align: u64) -> DynamicAllocation<'_, B> {
        self.try_allocate(size, align).unwrap_or_else(|error| {
            fatal(format_args!("linear upload buffer exhausted: {error}"))
        })
    }

    pub fn try_allocate(
        &self,
        size: u64,
        align: u64,
    ) -> Result<DynamicAllocation<'_, B>, allocators::Error> {
        let offset = self.linear.lock().allocate(size, align)?;
        Ok(DynamicAllocation::new(&self.buffer, offset, size))
    }

    /// Allocates space for `data` and copies it in.
    pub fn upload<T: Copy>(&self, data: &[T], align: u64) -> DynamicAllocation<'_, B> {
        let allocation = self.allocate(std::mem::size_of_val(data) as u64, align);
        allocation.write_slice(data);
        allocation
    }

    /// Discards every allocation. The GPU must have finished with all of them.
    pub fn clear(&mut self) {
        self.linear.get_mut().clear();
    }
}

/// Upload memory allocated per frame from a ring, reclaimed once the GPU has
/// finished each frame.
pub struct RingDynamicAllocator<B: Backend> {
    buffer: B::UploadBuffer,
    ring: Mutex<RingAllocator>,
}

impl<B: Backend> RingDynamicAllocator<B> {
    pub fn new(backend: &B, size: u64) -> Result<Self, Error> {
        let buffer = backend.create_upload_buffer(size)?;
        log::debug!("created {size} byte upload ring");

        Ok(Self {
            buffer,
            ring: Mutex::new(RingAllocator::new(size, 0)),
        })
    }

    pub fn buffer(&self) -> &B::UploadBuffer {
        &self.buffer
    }

    /// Bytes held by frames that have not been released, including alignment
    /// padding and space skipped when the ring wrapped.
    pub fn used(&self) -> u64 {
        self.ring.lock().used_size()
    }

    /// Allocates `size` bytes aligned to `align` for the current frame.
    ///
    /// ## Panics
    ///
    /// Panics if the ring cannot fit the allocation before more frames are
    /// released.
    pub fn allocate(&self, size: u64, align: u64) -> DynamicAllocation<'_, B> {
        self.try_allocate(size, align)
            .unwrap_or_else(|error| fatal(format_args!("upload ring exhausted: {error}")))
    }

    pub fn try_allocate(
        &self,
        size: u64,
        align: u64,
    ) -> Result<DynamicAllocation<'_, B>, allocators::Error> {
        let offset = self.ring.lock().allocate(size, align)?;
        Ok(DynamicAllocation::new(&self.buffer, offset, size))
    }

    /// Allocates space for `data` and copies it in.
    pub fn upload<T: Copy>(&self, data: &[T], align: u64) -> DynamicAllocation<'_, B> {
        let allocation = self.allocate(std::mem::size_of_val(data) as u64, align);
        allocation.write_slice(data);
        allocation
    }

    pub fn finish_current_frame(&mut self, frame: u64) {
        self.ring.get_mut().finish_current_frame(frame);
    }

    pub fn release_completed_frames(&mut self, completed_frame: u64) -> usize {
        self.ring.get_mut().release_completed_frames(completed_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeadlessBackend;

    #[test]
    fn linear_allocations_are_aligned_and_addressed() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let mut allocator = LinearDynamicAllocator::new(&backend, 1024).unwrap();

        let a = allocator.allocate(10, 0);
        let b = allocator.allocate(64, 256);

        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 256);
        assert_eq!(b.gpu_address(), allocator.buffer().gpu_address() + 256);
        assert_eq!(
            b.cpu_address().as_ptr() as usize - a.cpu_address().as_ptr() as usize,
            256
        );
        assert_eq!(b.buffer().size(), 1024);

        allocator.clear();
        assert_eq!(allocator.used(), 0);
        assert_eq!(allocator.allocate(1, 0).offset(), 0);
    }

    #[test]
    fn upload_writes_memory() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let allocator = RingDynamicAllocator::new(&backend, 256).unwrap();

        allocator.allocate(3, 0);
        let allocation = allocator.upload(&[0x0403_0201u32, 0x0807_0605], 4);
        assert_eq!(allocation.offset(), 4);
        assert_eq!(allocation.size(), 8);

        let bytes = unsafe { allocator.buffer().read(allocation.offset(), 8) };
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    #[should_panic(expected = "writing 8 bytes")]
    fn write_out_of_bounds() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let allocator = LinearDynamicAllocator::new(&backend, 64).unwrap();

        allocator.allocate(4, 0).write_value(&0u64);
    }

    #[test]
    fn ring_reuses_memory_after_release() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let mut allocator = RingDynamicAllocator::new(&backend, 512).unwrap();

        assert_eq!(allocator.allocate(256, 256).offset(), 0);
        allocator.finish_current_frame(1);
        assert_eq!(allocator.allocate(256, 256).offset(), 256);
        allocator.finish_current_frame(2);

        assert!(allocator.try_allocate(1, 0).is_err());

        assert_eq!(allocator.release_completed_frames(1), 1);
        assert_eq!(allocator.allocate(200, 256).offset(), 0);
        assert_eq!(allocator.used(), 456);
    }

    #[test]
    #[should_panic(expected = "upload ring exhausted")]
    fn ring_exhaustion_is_fatal() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let allocator = RingDynamicAllocator::new(&backend, 64).unwrap();

        allocator.allocate(65, 0);
    }
}

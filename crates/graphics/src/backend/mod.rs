//! The seam between the device and the graphics API.
//!
//! The device never calls the API directly. Everything it needs, from
//! creating fences to presenting the swapchain, goes through [`Backend`].

use std::ptr::NonNull;

use crate::{
    descriptor::{CpuDescriptor, GpuDescriptor},
    Color, DescriptorHeapKind, Error, QueueKind,
};

#[cfg(target_os = "windows")]
pub mod dx12;
pub mod headless;

/// The states a swapchain image moves between during a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Present,
    RenderTarget,
}

/// A GPU timeline value that the CPU can observe.
pub trait Fence: Send + Sync {
    /// The most recent value the GPU has signaled.
    fn completed_value(&self) -> u64;

    /// Blocks until the fence reaches `value`. There is no timeout.
    fn wait(&self, value: u64);
}

pub trait RawDescriptorHeap: Send + Sync {
    /// The CPU address of the first descriptor in the heap.
    fn cpu_start(&self) -> CpuDescriptor;

    /// The GPU address of the first descriptor, if the heap is shader-visible.
    fn gpu_start(&self) -> Option<GpuDescriptor>;
}

/// A persistently-mapped buffer in CPU-writable, GPU-readable memory.
pub trait UploadBuffer: Send + Sync {
    fn size(&self) -> u64;

    /// The address of the first byte of the mapping.
    fn cpu_address(&self) -> NonNull<u8>;

    /// The GPU virtual address of the first byte of the buffer.
    fn gpu_address(&self) -> u64;
}

/// The graphics API operations a [`GraphicsDevice`](crate::GraphicsDevice)
/// is built on.
///
/// A backend owns the API device, one graphics queue, one compute queue and
/// a swapchain. All methods other than swapchain resizing take `&self` and
/// may be called from any thread, though a single command list must only be
/// recorded from one thread at a time.
///
/// Failures of methods that return `Result` are reported to the caller.
/// Failures of the others are fatal.
pub trait Backend: Send + Sync + Sized + 'static {
    type Fence: Fence;
    type CommandList: Send + Sync;
    type Resource: Send + Sync;
    type DescriptorHeap: RawDescriptorHeap;
    type UploadBuffer: UploadBuffer;

    fn create_fence(&self, name: &str) -> Result<Self::Fence, Error>;

    /// Creates a command list in the recording state, along with whatever
    /// memory it records into.
    fn create_command_list(&self, queue: QueueKind) -> Result<Self::CommandList, Error>;

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        count: u32,
        shader_visible: bool,
    ) -> Result<Self::DescriptorHeap, Error>;

    /// The distance in bytes between two descriptors of `kind`.
    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32;

    fn create_upload_buffer(&self, size: u64) -> Result<Self::UploadBuffer, Error>;

    /// Enqueues a signal of `fence` to `value` on `queue`.
    fn signal(&self, queue: QueueKind, fence: &Self::Fence, value: u64);

    /// Makes `queue` wait until `fence` reaches `value` before executing any
    /// further work. The CPU does not block.
    fn queue_wait(&self, queue: QueueKind, fence: &Self::Fence, value: u64);

    /// Closes the command lists and submits them to `queue` in order.
    fn execute(&self, queue: QueueKind, lists: &[&Self::CommandList]);

    /// Discards the contents of a command list and puts it back into the
    /// recording state. The GPU must have finished executing it.
    fn reset_command_list(&self, list: &Self::CommandList);

    fn record_transition(
        &self,
        list: &Self::CommandList,
        resource: &Self::Resource,
        before: ResourceState,
        after: ResourceState,
    );

    fn record_clear(&self, list: &Self::CommandList, target: CpuDescriptor, color: Color);

    /// Binds the shader-visible descriptor heap for subsequent draws and
    /// dispatches.
    fn record_bind_descriptor_heap(&self, list: &Self::CommandList, heap: &Self::DescriptorHeap);

    /// Copies `count` descriptors from `src` to `dst`. Executes immediately on
    /// the CPU timeline.
    fn copy_descriptors(
        &self,
        count: u32,
        dst: CpuDescriptor,
        src: CpuDescriptor,
        kind: DescriptorHeapKind,
    );

    fn create_render_target_view(&self, resource: &Self::Resource, dst: CpuDescriptor);

    fn backbuffer_count(&self) -> u32;

    /// The width and height of the swapchain images.
    fn swapchain_size(&self) -> (u32, u32);

    /// The index of the swapchain image that the next frame renders to.
    fn current_backbuffer_index(&self) -> u32;

    fn backbuffer(&self, index: u32) -> Result<Self::Resource, Error>;

    fn present(&self, vsync: bool);

    /// Resizes the swapchain images. Every reference to the previous images,
    /// including those held by the GPU, must have been released.
    fn resize_swapchain(&mut self, width: u32, height: u32) -> Result<(), Error>;
}

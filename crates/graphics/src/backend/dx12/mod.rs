//! Direct3D 12 backend.

use std::ptr::NonNull;

use raw_window_handle::RawWindowHandle;
use windows::{
    core::ComInterface,
    Win32::{
        Foundation::{E_POINTER, HWND},
        Graphics::{
            Direct3D12::*,
            Dxgi::Common::{DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC},
        },
    },
};

use crate::{
    descriptor::{CpuDescriptor, GpuDescriptor},
    fatal, Color, DescriptorHeapKind, DeviceConfig, Error, QueueKind,
};

use super::{Backend, RawDescriptorHeap, ResourceState, UploadBuffer};

mod dx;
mod queue;
mod removal;
mod surface;

pub use queue::{Dx12CommandList, Dx12Fence};

use queue::{set_name, Queue};
use removal::RemovalWatcher;
use surface::Swapchain;

/// Aborts with a log message if a per-frame API call fails.
#[track_caller]
pub(super) fn check<T>(result: windows::core::Result<T>, call: &str) -> T {
    match result {
        Ok(value) => value,
        Err(error) => fatal(format_args!("{call} failed: {error}")),
    }
}

fn heap_type(kind: DescriptorHeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        DescriptorHeapKind::CbvSrvUav => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapKind::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        DescriptorHeapKind::RenderTarget => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapKind::DepthStencil => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
    }
}

fn transition_barrier(
    resource: &ID3D12Resource,
    state_before: D3D12_RESOURCE_STATES,
    state_after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: std::mem::ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                // borrowed for the duration of the call, so not add-ref'd
                pResource: std::mem::ManuallyDrop::new(Some(unsafe {
                    std::mem::transmute_copy(resource)
                })),
                StateBefore: state_before,
                StateAfter: state_after,
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
            }),
        },
    }
}

pub struct Dx12Resource(ID3D12Resource);

impl Dx12Resource {
    pub fn resource(&self) -> &ID3D12Resource {
        &self.0
    }
}

pub struct Dx12DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    cpu_start: CpuDescriptor,
    gpu_start: Option<GpuDescriptor>,
}

impl RawDescriptorHeap for Dx12DescriptorHeap {
    fn cpu_start(&self) -> CpuDescriptor {
        self.cpu_start
    }

    fn gpu_start(&self) -> Option<GpuDescriptor> {
        self.gpu_start
    }
}

/// A committed buffer in an upload heap, mapped for its whole lifetime.
pub struct Dx12UploadBuffer {
    _resource: ID3D12Resource,
    cpu_address: NonNull<u8>,
    gpu_address: u64,
    size: u64,
}

impl UploadBuffer for Dx12UploadBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn cpu_address(&self) -> NonNull<u8> {
        self.cpu_address
    }

    fn gpu_address(&self) -> u64 {
        self.gpu_address
    }
}

// SAFETY: Direct3D 12 devices, queues, fences, heaps and resources are
// free-threaded. A command list is only recorded from one thread at a time,
// which the device guarantees by handing each list to one recorder. Writes
// through an upload buffer's mapping go to disjoint allocated ranges.
unsafe impl Send for Dx12Backend {}
unsafe impl Sync for Dx12Backend {}
unsafe impl Send for Dx12Fence {}
unsafe impl Sync for Dx12Fence {}
unsafe impl Send for Dx12CommandList {}
unsafe impl Sync for Dx12CommandList {}
unsafe impl Send for Dx12Resource {}
unsafe impl Sync for Dx12Resource {}
unsafe impl Send for Dx12DescriptorHeap {}
unsafe impl Sync for Dx12DescriptorHeap {}
unsafe impl Send for Dx12UploadBuffer {}
unsafe impl Sync for Dx12UploadBuffer {}

/// A Direct3D 12 device with a graphics queue, a compute queue, and a
/// swapchain for one window.
pub struct Dx12Backend {
    // dropped before the device it watches
    _removal: Option<RemovalWatcher>,
    swapchain: Swapchain,
    graphics: Queue,
    compute: Queue,
    dx: dx::Interfaces,
}

impl Dx12Backend {
    /// Creates a device and a swapchain for `window` with
    /// `config.backbuffer_count` images.
    ///
    /// ## Errors
    ///
    /// Returns `Error::UnsupportedWindow` if `window` is not a Win32 window,
    /// and `Error::Api` if any part of the device could not be created.
    pub fn new(window: RawWindowHandle, config: &DeviceConfig) -> Result<Self, Error> {
        let hwnd = match window {
            RawWindowHandle::Win32(handle) => HWND(handle.hwnd as _),
            _ => return Err(Error::UnsupportedWindow("only Win32 windows are supported")),
        };

        let dx = dx::Interfaces::new(config)?;
        let graphics = Queue::new(&dx, QueueKind::Graphics)?;
        let compute = Queue::new(&dx, QueueKind::Compute)?;
        let swapchain = Swapchain::new(&dx, &graphics, hwnd, config.backbuffer_count)?;

        let removal = if config.track_device_removal {
            Some(RemovalWatcher::new(&dx)?)
        } else {
            None
        };

        Ok(Self {
            _removal: removal,
            swapchain,
            graphics,
            compute,
            dx,
        })
    }

    pub fn device(&self) -> &ID3D12Device {
        &self.dx.device
    }

    fn queue(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Graphics => &self.graphics,
            QueueKind::Compute => &self.compute,
        }
    }
}

impl Backend for Dx12Backend {
    type Fence = Dx12Fence;
    type CommandList = Dx12CommandList;
    type Resource = Dx12Resource;
    type DescriptorHeap = Dx12DescriptorHeap;
    type UploadBuffer = Dx12UploadBuffer;

    fn create_fence(&self, name: &str) -> Result<Self::Fence, Error> {
        Dx12Fence::new(&self.dx, name)
    }

    fn create_command_list(&self, queue: QueueKind) -> Result<Self::CommandList, Error> {
        Dx12CommandList::new(&self.dx, queue)
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        count: u32,
        shader_visible: bool,
    ) -> Result<Self::DescriptorHeap, Error> {
        let heap: ID3D12DescriptorHeap = unsafe {
            self.dx
                .device
                .CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                    Type: heap_type(kind),
                    NumDescriptors: count,
                    Flags: if shader_visible {
                        D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
                    } else {
                        D3D12_DESCRIPTOR_HEAP_FLAG_NONE
                    },
                    NodeMask: 0,
                })
        }?;

        set_name(&self.dx, &heap.cast()?, &format!("{kind:?} Descriptor Heap"));

        let cpu_start = CpuDescriptor(unsafe { heap.GetCPUDescriptorHandleForHeapStart() }.ptr);
        let gpu_start = shader_visible
            .then(|| GpuDescriptor(unsafe { heap.GetGPUDescriptorHandleForHeapStart() }.ptr));

        Ok(Dx12DescriptorHeap {
            heap,
            cpu_start,
            gpu_start,
        })
    }

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        unsafe {
            self.dx
                .device
                .GetDescriptorHandleIncrementSize(heap_type(kind))
        }
    }

    fn create_upload_buffer(&self, size: u64) -> Result<Self::UploadBuffer, Error> {
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.dx.device.CreateCommittedResource(
                &D3D12_HEAP_PROPERTIES {
                    Type: D3D12_HEAP_TYPE_UPLOAD,
                    CPUPageProperty: D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                    MemoryPoolPreference: D3D12_MEMORY_POOL_UNKNOWN,
                    CreationNodeMask: 0,
                    VisibleNodeMask: 0,
                },
                D3D12_HEAP_FLAG_NONE,
                &D3D12_RESOURCE_DESC {
                    Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                    Alignment: 0,
                    Width: size,
                    Height: 1,
                    DepthOrArraySize: 1,
                    MipLevels: 1,
                    Format: DXGI_FORMAT_UNKNOWN,
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                    Flags: D3D12_RESOURCE_FLAG_NONE,
                },
                D3D12_RESOURCE_STATE_GENERIC_READ,
                None,
                &mut resource,
            )
        }?;
        let resource = resource.ok_or_else(|| windows::core::Error::from(E_POINTER))?;

        let mut mapping = std::ptr::null_mut();
        unsafe { resource.Map(0, None, Some(&mut mapping)) }?;
        let cpu_address = NonNull::new(mapping.cast::<u8>())
            .ok_or_else(|| windows::core::Error::from(E_POINTER))?;

        set_name(&self.dx, &resource.cast()?, "Upload Buffer");

        Ok(Dx12UploadBuffer {
            gpu_address: unsafe { resource.GetGPUVirtualAddress() },
            _resource: resource,
            cpu_address,
            size,
        })
    }

    fn signal(&self, queue: QueueKind, fence: &Self::Fence, value: u64) {
        self.queue(queue).signal(fence, value);
    }

    fn queue_wait(&self, queue: QueueKind, fence: &Self::Fence, value: u64) {
        self.queue(queue).wait(fence, value);
    }

    fn execute(&self, queue: QueueKind, lists: &[&Self::CommandList]) {
        self.queue(queue).execute(lists);
    }

    fn reset_command_list(&self, list: &Self::CommandList) {
        list.reset();
    }

    fn record_transition(
        &self,
        list: &Self::CommandList,
        resource: &Self::Resource,
        before: ResourceState,
        after: ResourceState,
    ) {
        let barrier = transition_barrier(&resource.0, resource_state(before), resource_state(after));
        unsafe { list.list.ResourceBarrier(&[barrier]) };
    }

    fn record_clear(&self, list: &Self::CommandList, target: CpuDescriptor, color: Color) {
        let color = color.to_array();
        unsafe {
            list.list.ClearRenderTargetView(
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: target.0 },
                color.as_ptr(),
                &[],
            );
        }
    }

    fn record_bind_descriptor_heap(&self, list: &Self::CommandList, heap: &Self::DescriptorHeap) {
        unsafe { list.list.SetDescriptorHeaps(&[Some(heap.heap.clone())]) };
    }

    fn copy_descriptors(
        &self,
        count: u32,
        dst: CpuDescriptor,
        src: CpuDescriptor,
        kind: DescriptorHeapKind,
    ) {
        unsafe {
            self.dx.device.CopyDescriptorsSimple(
                count,
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dst.0 },
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: src.0 },
                heap_type(kind),
            );
        }
    }

    fn create_render_target_view(&self, resource: &Self::Resource, dst: CpuDescriptor) {
        unsafe {
            self.dx.device.CreateRenderTargetView(
                &resource.0,
                None,
                D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dst.0 },
            );
        }
    }

    fn backbuffer_count(&self) -> u32 {
        self.swapchain.buffer_count()
    }

    fn swapchain_size(&self) -> (u32, u32) {
        self.swapchain.size()
    }

    fn current_backbuffer_index(&self) -> u32 {
        self.swapchain.image_index()
    }

    fn backbuffer(&self, index: u32) -> Result<Self::Resource, Error> {
        let resource: ID3D12Resource = self.swapchain.buffer(index)?;
        set_name(&self.dx, &resource.cast()?, &format!("Swapchain Buffer {index}"));
        Ok(Dx12Resource(resource))
    }

    fn present(&self, vsync: bool) {
        self.swapchain.present(vsync);
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> Result<(), Error> {
        self.swapchain.resize(width, height)
    }
}

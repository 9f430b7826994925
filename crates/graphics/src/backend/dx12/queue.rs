use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use windows::{
    core::{ComInterface, PCWSTR},
    Win32::{
        Foundation::{CloseHandle, HANDLE},
        Graphics::Direct3D12::*,
        System::Threading::{CreateEventW, WaitForSingleObject},
    },
};

use crate::{backend::Fence, Error, QueueKind};

use super::{check, dx};

pub(super) fn list_type(kind: QueueKind) -> D3D12_COMMAND_LIST_TYPE {
    match kind {
        QueueKind::Graphics => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueKind::Compute => D3D12_COMMAND_LIST_TYPE_COMPUTE,
    }
}

pub(super) fn set_name(dx: &dx::Interfaces, object: &ID3D12Object, name: &str) {
    if dx.is_debug {
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        if let Err(error) = unsafe { object.SetName(PCWSTR(wide.as_ptr())) } {
            log::debug!("failed to name {name}: {error}");
        }
    }
}

pub struct Queue {
    pub queue: ID3D12CommandQueue,
    pub kind: QueueKind,
}

impl Queue {
    pub fn new(dx: &dx::Interfaces, kind: QueueKind) -> Result<Self, Error> {
        let queue: ID3D12CommandQueue = unsafe {
            dx.device.CreateCommandQueue(&D3D12_COMMAND_QUEUE_DESC {
                Type: list_type(kind),
                ..Default::default()
            })
        }?;

        set_name(dx, &queue.cast()?, &format!("{kind:?} Queue"));

        Ok(Self { queue, kind })
    }

    pub fn signal(&self, fence: &Dx12Fence, value: u64) {
        check(
            unsafe { self.queue.Signal(&fence.fence, value) },
            "ID3D12CommandQueue::Signal",
        );
    }

    pub fn wait(&self, fence: &Dx12Fence, value: u64) {
        check(
            unsafe { self.queue.Wait(&fence.fence, value) },
            "ID3D12CommandQueue::Wait",
        );
    }

    pub fn execute(&self, lists: &[&Dx12CommandList]) {
        let lists = lists
            .iter()
            .map(|list| {
                debug_assert_eq!(list.kind, self.kind);
                list.close();
                Some(check(list.list.cast::<ID3D12CommandList>(), "cast"))
            })
            .collect::<smallvec::SmallVec<[_; 8]>>();

        unsafe { self.queue.ExecuteCommandLists(&lists) };
    }
}

/// A fence and the event the CPU blocks on while waiting for it.
pub struct Dx12Fence {
    pub(super) fence: ID3D12Fence,
    event: Mutex<HANDLE>,
}

impl Dx12Fence {
    pub fn new(dx: &dx::Interfaces, name: &str) -> Result<Self, Error> {
        let fence: ID3D12Fence = unsafe { dx.device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }?;
        set_name(dx, &fence.cast()?, name);

        let event = unsafe { CreateEventW(None, false, false, None) }?;

        Ok(Self {
            fence,
            event: Mutex::new(event),
        })
    }
}

impl Fence for Dx12Fence {
    fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn wait(&self, value: u64) {
        if self.completed_value() >= value {
            return;
        }

        let event = self.event.lock();
        check(
            unsafe { self.fence.SetEventOnCompletion(value, *event) },
            "ID3D12Fence::SetEventOnCompletion",
        );
        unsafe { WaitForSingleObject(*event, u32::MAX) };
    }
}

impl Drop for Dx12Fence {
    fn drop(&mut self) {
        unsafe { CloseHandle(*self.event.get_mut()) };
    }
}

/// A command list and the allocator it records into.
pub struct Dx12CommandList {
    pub(super) list: ID3D12GraphicsCommandList,
    allocator: ID3D12CommandAllocator,
    kind: QueueKind,
    open: AtomicBool,
}

impl Dx12CommandList {
    pub fn new(dx: &dx::Interfaces, kind: QueueKind) -> Result<Self, Error> {
        let allocator: ID3D12CommandAllocator =
            unsafe { dx.device.CreateCommandAllocator(list_type(kind)) }?;

        let list: ID3D12GraphicsCommandList = unsafe {
            dx.device
                .CreateCommandList(0, list_type(kind), &allocator, None)
        }?;

        set_name(dx, &allocator.cast()?, &format!("{kind:?} Command Allocator"));

        Ok(Self {
            list,
            allocator,
            kind,
            open: AtomicBool::new(true),
        })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            check(unsafe { self.list.Close() }, "ID3D12GraphicsCommandList::Close");
        }
    }

    pub fn reset(&self) {
        // lists are created open, and may be reset without ever being submitted
        self.close();

        check(
            unsafe { self.allocator.Reset() },
            "ID3D12CommandAllocator::Reset",
        );
        check(
            unsafe { self.list.Reset(&self.allocator, None) },
            "ID3D12GraphicsCommandList::Reset",
        );

        self.open.store(true, Ordering::Release);
    }
}

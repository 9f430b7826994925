use std::ffi::c_void;

use windows::{
    core::ComInterface,
    Win32::{
        Foundation::{CloseHandle, BOOLEAN, HANDLE, INVALID_HANDLE_VALUE},
        Graphics::Direct3D12::*,
        System::Threading::{
            CreateEventW, RegisterWaitForSingleObject, UnregisterWaitEx, WT_EXECUTEONLYONCE,
        },
    },
};

use crate::Error;

use super::dx;

/// Logs what is known about a device removal from a thread pool thread, then
/// aborts the process.
///
/// A removed device signals every fence with `u64::MAX`, so a fence that is
/// never signaled otherwise serves as the trigger.
pub struct RemovalWatcher {
    wait: HANDLE,
    event: HANDLE,
    _fence: ID3D12Fence,
    // read by the callback through a raw pointer until the wait is unregistered
    _device: Box<ID3D12Device>,
}

impl RemovalWatcher {
    pub fn new(dx: &dx::Interfaces) -> Result<Self, Error> {
        let fence: ID3D12Fence = unsafe { dx.device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }?;
        let event = unsafe { CreateEventW(None, false, false, None) }?;
        unsafe { fence.SetEventOnCompletion(u64::MAX, event) }?;

        let device = Box::new(dx.device.clone());

        let mut wait = HANDLE::default();
        unsafe {
            RegisterWaitForSingleObject(
                &mut wait,
                event,
                Some(on_device_removed),
                Some(std::ptr::addr_of!(*device).cast()),
                u32::MAX,
                WT_EXECUTEONLYONCE,
            )
        }
        .ok()?;

        Ok(Self {
            wait,
            event,
            _fence: fence,
            _device: device,
        })
    }
}

impl Drop for RemovalWatcher {
    fn drop(&mut self) {
        // blocks until a running callback has returned
        let _ = unsafe { UnregisterWaitEx(self.wait, INVALID_HANDLE_VALUE) };
        let _ = unsafe { CloseHandle(self.event) };
        log::trace!("stopped watching for device removal");
    }
}

unsafe extern "system" fn on_device_removed(context: *mut c_void, _timed_out: BOOLEAN) {
    let device = &*context.cast::<ID3D12Device>().cast_const();

    match device.GetDeviceRemovedReason() {
        Ok(()) => log::error!("graphics device removed for an unknown reason"),
        Err(reason) => log::error!("graphics device removed: {reason}"),
    }

    if let Ok(dred) = device.cast::<ID3D12DeviceRemovedExtendedData>() {
        log_breadcrumbs(&dred);
        log_page_fault(&dred);
    }

    log::logger().flush();
    std::process::abort();
}

unsafe fn log_breadcrumbs(dred: &ID3D12DeviceRemovedExtendedData) {
    let Ok(output) = dred.GetAutoBreadcrumbsOutput() else {
        return;
    };

    let mut node = output.pHeadAutoBreadcrumbNode;
    while let Some(current) = node.as_ref() {
        let name = if current.pCommandListDebugNameW.is_null() {
            String::from("<unnamed>")
        } else {
            current
                .pCommandListDebugNameW
                .to_string()
                .unwrap_or_default()
        };

        let completed = current.pLastBreadcrumbValue.as_ref().copied().unwrap_or(0);
        log::error!(
            "command list {name}: {completed} of {} operations completed",
            current.BreadcrumbCount
        );

        node = current.pNext;
    }
}

unsafe fn log_page_fault(dred: &ID3D12DeviceRemovedExtendedData) {
    if let Ok(output) = dred.GetPageFaultAllocationOutput() {
        log::error!("page fault at GPU address {:#x}", output.PageFaultVA);
    }
}

use windows::{
    core::{ComInterface, PCSTR},
    Win32::{
        Foundation::E_NOINTERFACE,
        Graphics::{Direct3D::D3D_FEATURE_LEVEL_11_0, Direct3D12::*, Dxgi::*},
    },
};

use crate::{DeviceConfig, Error, PowerPreference};

pub struct Interfaces {
    pub is_debug: bool,
    pub gi: IDXGIFactory6,
    pub device: ID3D12Device,
}

impl Interfaces {
    pub fn new(config: &DeviceConfig) -> Result<Self, Error> {
        let is_debug = config.debug_enabled();

        // IDXGIFactory6 for power preference selection
        let gi: IDXGIFactory6 = {
            let flags = if is_debug { DXGI_CREATE_FACTORY_DEBUG } else { 0 };
            unsafe { CreateDXGIFactory2(flags) }?
        };

        let power_preference = match config.power_preference {
            PowerPreference::LowPower => DXGI_GPU_PREFERENCE_MINIMUM_POWER,
            PowerPreference::HighPerformance => DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE,
        };

        let adapter: IDXGIAdapter = unsafe { gi.EnumAdapterByGpuPreference(0, power_preference) }
            .or_else(|error| {
                log::warn!("no hardware adapter available ({error}), falling back to WARP");
                unsafe { gi.EnumWarpAdapter() }
            })?;

        if is_debug {
            let mut debug: Option<ID3D12Debug> = None;
            unsafe { D3D12GetDebugInterface(&mut debug) }?;
            if let Some(debug) = debug {
                unsafe { debug.EnableDebugLayer() };
            }
        }

        if config.track_device_removal {
            let mut dred: Option<ID3D12DeviceRemovedExtendedDataSettings> = None;
            match unsafe { D3D12GetDebugInterface(&mut dred) } {
                Ok(()) => {
                    if let Some(dred) = dred {
                        unsafe {
                            dred.SetAutoBreadcrumbsEnablement(D3D12_DRED_ENABLEMENT_FORCED_ON);
                            dred.SetPageFaultEnablement(D3D12_DRED_ENABLEMENT_FORCED_ON);
                        }
                    }
                }
                Err(error) => log::warn!("device removed extended data unavailable: {error}"),
            }
        }

        let mut device: Option<ID3D12Device> = None;
        unsafe { D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device) }?;
        let device = device.ok_or_else(|| windows::core::Error::from(E_NOINTERFACE))?;

        if is_debug {
            let queue: ID3D12InfoQueue1 = device.cast()?;

            let mut cookie = 0;
            unsafe {
                queue.RegisterMessageCallback(
                    Some(Self::d3d12_debug_callback),
                    D3D12_MESSAGE_CALLBACK_IGNORE_FILTERS,
                    std::ptr::null(),
                    &mut cookie,
                )
            }?;
        }

        if let Ok(desc) = unsafe { adapter.GetDesc() } {
            let len = desc
                .Description
                .iter()
                .position(|c| *c == 0)
                .unwrap_or(desc.Description.len());

            log::info!(
                "using adapter {} (debug layer: {is_debug})",
                String::from_utf16_lossy(&desc.Description[..len])
            );
        }

        Ok(Self {
            is_debug,
            gi,
            device,
        })
    }

    extern "system" fn d3d12_debug_callback(
        _category: D3D12_MESSAGE_CATEGORY,
        severity: D3D12_MESSAGE_SEVERITY,
        id: D3D12_MESSAGE_ID,
        description: PCSTR,
        _context: *mut std::ffi::c_void,
    ) {
        let level = match severity {
            D3D12_MESSAGE_SEVERITY_CORRUPTION | D3D12_MESSAGE_SEVERITY_ERROR => log::Level::Error,
            D3D12_MESSAGE_SEVERITY_WARNING => log::Level::Warn,
            D3D12_MESSAGE_SEVERITY_INFO => log::Level::Info,
            _ => log::Level::Debug,
        };

        log::log!(level, "D3D12: {:?} {}", id, unsafe { description.display() });
    }
}

impl Drop for Interfaces {
    fn drop(&mut self) {
        if self.is_debug {
            if let Ok(dxgi_debug) = unsafe { DXGIGetDebugInterface1::<IDXGIDebug1>(0) } {
                let _ = unsafe {
                    dxgi_debug.ReportLiveObjects(
                        DXGI_DEBUG_ALL,
                        DXGI_DEBUG_RLO_SUMMARY | DXGI_DEBUG_RLO_IGNORE_INTERNAL,
                    )
                };
            }
        }
    }
}

use std::sync::atomic::{AtomicU32, Ordering};

use windows::{
    core::ComInterface,
    Win32::{
        Foundation::HWND,
        Graphics::Dxgi::{Common::*, *},
    },
};

use crate::Error;

use super::{check, dx, queue::Queue};

/// The swapchain of the window the device presents to.
pub struct Swapchain {
    swapchain: IDXGISwapChain3,
    buffer_count: u32,
    width: u32,
    height: u32,
    image_index: AtomicU32,
}

impl Swapchain {
    const FORMAT: DXGI_FORMAT = DXGI_FORMAT_R8G8B8A8_UNORM;
    const FLAGS: u32 = 0;

    pub fn new(
        dx: &dx::Interfaces,
        queue: &Queue,
        window: HWND,
        buffer_count: u32,
    ) -> Result<Self, Error> {
        let swapchain: IDXGISwapChain3 = unsafe {
            dx.gi.CreateSwapChainForHwnd(
                &queue.queue,
                window,
                &DXGI_SWAP_CHAIN_DESC1 {
                    Width: 0,  // automatically match the size of the window
                    Height: 0, // automatically match the size of the window
                    Format: Self::FORMAT,
                    Stereo: false.into(),
                    SampleDesc: DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
                    BufferCount: buffer_count,
                    Scaling: DXGI_SCALING_NONE,
                    SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
                    AlphaMode: DXGI_ALPHA_MODE_IGNORE,
                    Flags: Self::FLAGS,
                },
                None,
                None,
            )
        }?
        .cast()?;

        // disable fullscreen transitions
        unsafe { dx.gi.MakeWindowAssociation(window, DXGI_MWA_NO_ALT_ENTER) }?;

        let desc = unsafe { swapchain.GetDesc1() }?;
        let image_index = unsafe { swapchain.GetCurrentBackBufferIndex() };

        Ok(Self {
            swapchain,
            buffer_count,
            width: desc.Width,
            height: desc.Height,
            image_index: AtomicU32::new(image_index),
        })
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn image_index(&self) -> u32 {
        self.image_index.load(Ordering::Acquire)
    }

    pub fn buffer<T: ComInterface>(&self, index: u32) -> Result<T, Error> {
        Ok(unsafe { self.swapchain.GetBuffer(index) }?)
    }

    pub fn present(&self, vsync: bool) {
        let interval = u32::from(vsync);
        check(
            unsafe { self.swapchain.Present(interval, 0) }.ok(),
            "IDXGISwapChain::Present",
        );

        self.image_index.store(
            unsafe { self.swapchain.GetCurrentBackBufferIndex() },
            Ordering::Release,
        );
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), Error> {
        unsafe {
            self.swapchain.ResizeBuffers(
                self.buffer_count,
                width,
                height,
                DXGI_FORMAT_UNKNOWN,
                Self::FLAGS,
            )
        }?;

        self.width = width;
        self.height = height;
        *self.image_index.get_mut() = unsafe { self.swapchain.GetCurrentBackBufferIndex() };

        Ok(())
    }
}

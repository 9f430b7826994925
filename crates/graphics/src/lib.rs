//! GPU memory and descriptor management, and the frame loop that drives it.
//!
//! [`GraphicsDevice`] owns every allocator a renderer needs from one frame to
//! the next, and the fences that decide when an allocation may be reused:
//!
//! - offline descriptor heaps for long-lived views
//!   ([`OfflineDescriptorAllocator`]),
//! - a shader-visible descriptor ring for per-frame descriptor tables
//!   ([`RingDescriptorAllocator`]),
//! - a linear upload allocator per backbuffer and a shared upload ring for
//!   per-draw constants ([`LinearDynamicAllocator`],
//!   [`RingDynamicAllocator`]),
//! - a release queue that keeps objects alive until the GPU is done with them
//!   ([`ReleaseQueue`]).
//!
//! The device is generic over a [`Backend`]. On Windows, `Dx12Backend` talks
//! to Direct3D 12. [`HeadlessBackend`] emulates a GPU in software and is used
//! for testing on every platform.
//!
//! ## Frame loop
//!
//! ```ignore
//! let mut device = GraphicsDevice::new(backend, &DeviceConfig::default())?;
//!
//! loop {
//!     let frame = device.begin_frame();
//!     device.clear_backbuffer(&frame, Color::BLACK);
//!
//!     // record passes, possibly from several threads
//!
//!     device.end_frame(frame, true);
//! }
//! ```
//!
//! ## Failure
//!
//! Creating a device returns an error if the GPU API refuses to create one of
//! its objects. After that, running out of descriptors or upload memory is a
//! sizing bug and panics, as do failures of per-frame API calls.

mod backend;
mod descriptor;
mod device;
mod dynamic;
mod error;
mod release_queue;

pub use backend::{
    headless::{
        HeadlessBackend, HeadlessBuffer, HeadlessCommand, HeadlessCommandList,
        HeadlessDescriptorHeap, HeadlessFence, HeadlessImage,
    },
    Backend, Fence, RawDescriptorHeap, ResourceState, UploadBuffer,
};
#[cfg(target_os = "windows")]
pub use backend::dx12::{
    Dx12Backend, Dx12CommandList, Dx12DescriptorHeap, Dx12Fence, Dx12Resource, Dx12UploadBuffer,
};
pub use descriptor::{
    CpuDescriptor, DescriptorHandle, DescriptorHeap, GpuDescriptor, LinearDescriptorAllocator,
    OfflineDescriptorAllocator, RingDescriptorAllocator,
};
pub use device::{Frame, FrameState, GraphicsDevice};
pub use dynamic::{DynamicAllocation, LinearDynamicAllocator, RingDynamicAllocator};
pub use error::Error;
pub use release_queue::{Deferred, ReleaseQueue};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const RED: Self = Self::new(1.0, 0.0, 0.0, 1.0);
    pub const GREEN: Self = Self::new(0.0, 1.0, 0.0, 1.0);
    pub const BLUE: Self = Self::new(0.0, 0.0, 1.0, 1.0);
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);

    #[must_use]
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    #[must_use]
    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PowerPreference {
    LowPower,
    #[default]
    HighPerformance,
}

/// The hardware queues a device submits work to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
}

impl QueueKind {
    /// The queue that this queue synchronizes against in cross-queue waits.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Graphics => Self::Compute,
            Self::Compute => Self::Graphics,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// Constant buffer, shader resource and unordered access views.
    CbvSrvUav,
    Sampler,
    RenderTarget,
    DepthStencil,
}

impl DescriptorHeapKind {
    pub const ALL: [Self; 4] = [
        Self::CbvSrvUav,
        Self::Sampler,
        Self::RenderTarget,
        Self::DepthStencil,
    ];

    /// Whether descriptors of this kind can be placed in a heap that shaders
    /// read from directly.
    #[must_use]
    pub fn can_be_shader_visible(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::CbvSrvUav => 0,
            Self::Sampler => 1,
            Self::RenderTarget => 2,
            Self::DepthStencil => 3,
        }
    }
}

/// Options for configuring a [`GraphicsDevice`] on initialization. Once set,
/// these options cannot be changed without recreating the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Enables the API's validation layer. Defaults to on in debug builds and
    /// off in release builds.
    pub debug_mode: Option<bool>,

    pub power_preference: PowerPreference,

    /// The number of swapchain images, and so the maximum number of frames
    /// that may be in flight at once.
    pub backbuffer_count: u32,

    /// The number of auxiliary graphics and compute command lists available
    /// to each frame for parallel recording.
    pub command_lists_per_frame: u32,

    /// The size of the shader-visible descriptor ring.
    pub online_descriptor_count: u32,

    /// Descriptors at the start of the shader-visible heap that are excluded
    /// from the ring and managed by the application.
    pub online_descriptor_reserve: u32,

    /// The size of each offline descriptor heap (one per heap kind).
    pub offline_descriptor_count: u32,

    /// The size in bytes of the linear upload allocator given to each
    /// backbuffer.
    pub dynamic_allocator_size: u64,

    /// The size in bytes of the upload ring shared by all frames.
    pub upload_ring_size: u64,

    /// Watches for device removal and logs diagnostics before terminating the
    /// process.
    pub track_device_removal: bool,
}

impl DeviceConfig {
    pub const MAX_BACKBUFFER_COUNT: u32 = 16;

    /// Checks that the configuration describes a usable device.
    ///
    /// ## Errors
    ///
    /// Returns `Error::InvalidConfig` describing the first invalid field.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| Err(Error::InvalidConfig(message));

        if !(2..=Self::MAX_BACKBUFFER_COUNT).contains(&self.backbuffer_count) {
            return invalid(format!(
                "backbuffer_count must be between 2 and {}, got {}",
                Self::MAX_BACKBUFFER_COUNT,
                self.backbuffer_count
            ));
        }

        if self.command_lists_per_frame == 0 {
            return invalid("command_lists_per_frame cannot be 0".into());
        }

        if self.online_descriptor_count == 0 || self.offline_descriptor_count == 0 {
            return invalid("descriptor heaps cannot be empty".into());
        }

        if self.online_descriptor_reserve >= self.online_descriptor_count {
            return invalid(format!(
                "online_descriptor_reserve ({}) must be smaller than online_descriptor_count ({})",
                self.online_descriptor_reserve, self.online_descriptor_count
            ));
        }

        if self.dynamic_allocator_size == 0 || self.upload_ring_size == 0 {
            return invalid("upload allocators cannot be empty".into());
        }

        Ok(())
    }

    /// Whether the API's validation layer should be enabled.
    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.debug_mode.unwrap_or(cfg!(debug_assertions))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            debug_mode: None,
            power_preference: PowerPreference::HighPerformance,
            backbuffer_count: 3,
            command_lists_per_frame: 16,
            online_descriptor_count: 32767,
            online_descriptor_reserve: 0,
            offline_descriptor_count: 1024,
            dynamic_allocator_size: 1024 * 1024,
            upload_ring_size: 4 * 1024 * 1024,
            track_device_removal: true,
        }
    }
}

/// Logs a fatal error and panics.
#[track_caller]
pub(crate) fn fatal(message: std::fmt::Arguments) -> ! {
    log::error!("{message}");
    panic!("{message}");
}

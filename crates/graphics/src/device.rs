use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    backend::{Backend, Fence, ResourceState},
    descriptor::{
        CpuDescriptor, DescriptorHandle, DescriptorHeap, OfflineDescriptorAllocator,
        RingDescriptorAllocator,
    },
    dynamic::{LinearDynamicAllocator, RingDynamicAllocator},
    fatal,
    release_queue::{Deferred, ReleaseQueue},
    Color, DescriptorHeapKind, DeviceConfig, Error, QueueKind,
};

/// A frame that is being recorded.
///
/// Returned by [`GraphicsDevice::begin_frame`] and consumed by
/// [`GraphicsDevice::end_frame`]. Everything that records into the frame
/// borrows it, so a frame cannot be ended while a pass is still recording.
#[derive(Debug)]
#[must_use = "frames must be submitted with `GraphicsDevice::end_frame`"]
pub struct Frame {
    index: u64,
    backbuffer_index: u32,
}

impl Frame {
    /// The number of frames begun before this one.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn backbuffer_index(&self) -> u32 {
        self.backbuffer_index
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// The frame has not been submitted yet.
    Recording,
    /// The frame has been submitted, but the GPU has not finished it.
    Submitted,
    /// The GPU has finished the frame. Its allocations have been, or will be,
    /// reclaimed.
    Complete,
}

/// Command lists handed out to recording threads, one at a time.
struct CommandListPool<B: Backend> {
    lists: Vec<B::CommandList>,
    next: AtomicUsize,
}

impl<B: Backend> CommandListPool<B> {
    fn new(backend: &B, queue: QueueKind, count: u32) -> Result<Self, Error> {
        let lists = (0..count)
            .map(|_| backend.create_command_list(queue))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            lists,
            next: AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> Option<&B::CommandList> {
        self.lists.get(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// The lists acquired since the last reset.
    fn used(&self) -> &[B::CommandList] {
        let used = self.next.load(Ordering::Acquire).min(self.lists.len());
        &self.lists[..used]
    }

    fn reset(&mut self) {
        *self.next.get_mut() = 0;
    }
}

/// Everything owned by one backbuffer slot.
struct FrameResources<B: Backend> {
    back_buffer: Option<B::Resource>,
    rtv: CpuDescriptor,
    default_list: B::CommandList,
    graphics_lists: CommandListPool<B>,
    compute_lists: CommandListPool<B>,
    dynamic_allocator: LinearDynamicAllocator<B>,
    /// The frame fence value signaled after the slot's last submission.
    fence_value: u64,
}

impl<B: Backend> FrameResources<B> {
    fn back_buffer(&self) -> &B::Resource {
        self.back_buffer
            .as_ref()
            .unwrap_or_else(|| fatal(format_args!("swapchain image was not reacquired")))
    }

    fn pool(&self, queue: QueueKind) -> &CommandListPool<B> {
        match queue {
            QueueKind::Graphics => &self.graphics_lists,
            QueueKind::Compute => &self.compute_lists,
        }
    }
}

struct QueueFence<B: Backend> {
    fence: B::Fence,
    next_value: AtomicU64,
}

impl<B: Backend> QueueFence<B> {
    fn new(backend: &B, name: &str) -> Result<Self, Error> {
        Ok(Self {
            fence: backend.create_fence(name)?,
            next_value: AtomicU64::new(1),
        })
    }

    fn signal(&self, backend: &B, queue: QueueKind) -> u64 {
        let value = self.next_value.fetch_add(1, Ordering::AcqRel);
        backend.signal(queue, &self.fence, value);
        value
    }
}

/// Owns the swapchain, the per-frame resources of every backbuffer, and the
/// allocators that passes record with.
///
/// Frame `n` (counting from 0) signals the frame fence with `n + 1` once its
/// work has been submitted. That value tags everything allocated from the
/// descriptor and upload rings during the frame, which is reclaimed when the
/// GPU reaches it.
pub struct GraphicsDevice<B: Backend> {
    config: DeviceConfig,
    width: u32,
    height: u32,

    frames: Vec<FrameResources<B>>,
    backbuffer_index: u32,
    frame_index: u64,
    frame_in_progress: bool,

    frame_fence: B::Fence,
    frame_fence_value: u64,

    graphics_fence: QueueFence<B>,
    compute_fence: QueueFence<B>,

    release_queue: Mutex<ReleaseQueue>,
    release_fence: B::Fence,
    release_fence_value: u64,

    rtv_heap: DescriptorHeap<B>,
    offline: Vec<OfflineDescriptorAllocator<B>>,
    online: RingDescriptorAllocator<B>,
    upload_ring: RingDynamicAllocator<B>,

    // Dropped last, after every object created from it.
    backend: B,
}

impl<B: Backend> GraphicsDevice<B> {
    /// Creates the device's per-frame resources and allocators on top of
    /// `backend`.
    ///
    /// ## Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` is invalid or does not match
    /// the backend's swapchain, and any error the backend returns while
    /// creating resources.
    pub fn new(backend: B, config: &DeviceConfig) -> Result<Self, Error> {
        config.validate()?;

        let backbuffer_count = backend.backbuffer_count();
        if backbuffer_count != config.backbuffer_count {
            return Err(Error::InvalidConfig(format!(
                "swapchain has {backbuffer_count} images, but backbuffer_count is {}",
                config.backbuffer_count
            )));
        }

        let rtv_heap = DescriptorHeap::new(
            &backend,
            DescriptorHeapKind::RenderTarget,
            backbuffer_count,
            false,
        )?;

        let mut frames = Vec::with_capacity(backbuffer_count as usize);
        for index in 0..backbuffer_count {
            let back_buffer = backend.backbuffer(index)?;
            let rtv = rtv_heap.handle(index).cpu;
            backend.create_render_target_view(&back_buffer, rtv);

            frames.push(FrameResources {
                back_buffer: Some(back_buffer),
                rtv,
                default_list: backend.create_command_list(QueueKind::Graphics)?,
                graphics_lists: CommandListPool::new(
                    &backend,
                    QueueKind::Graphics,
                    config.command_lists_per_frame,
                )?,
                compute_lists: CommandListPool::new(
                    &backend,
                    QueueKind::Compute,
                    config.command_lists_per_frame,
                )?,
                dynamic_allocator: LinearDynamicAllocator::new(
                    &backend,
                    config.dynamic_allocator_size,
                )?,
                fence_value: 0,
            });
        }

        let offline = DescriptorHeapKind::ALL
            .iter()
            .map(|kind| {
                OfflineDescriptorAllocator::new(&backend, *kind, config.offline_descriptor_count)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let online = RingDescriptorAllocator::new(
            &backend,
            DescriptorHeapKind::CbvSrvUav,
            config.online_descriptor_count,
            config.online_descriptor_reserve,
        )?;

        let upload_ring = RingDynamicAllocator::new(&backend, config.upload_ring_size)?;

        let frame_fence = backend.create_fence("Frame Fence")?;
        let release_fence = backend.create_fence("Release Fence")?;
        let graphics_fence = QueueFence::new(&backend, "Graphics Queue Fence")?;
        let compute_fence = QueueFence::new(&backend, "Compute Queue Fence")?;

        let (width, height) = backend.swapchain_size();
        let backbuffer_index = backend.current_backbuffer_index();

        log::debug!(
            "created graphics device: {width}x{height}, {backbuffer_count} backbuffers, \
             {} online descriptors, {} byte upload ring",
            config.online_descriptor_count,
            config.upload_ring_size
        );

        Ok(Self {
            config: config.clone(),
            width,
            height,
            frames,
            backbuffer_index,
            frame_index: 0,
            frame_in_progress: false,
            frame_fence,
            frame_fence_value: 1,
            graphics_fence,
            compute_fence,
            release_queue: Mutex::new(ReleaseQueue::new()),
            release_fence,
            release_fence_value: 1,
            rtv_heap,
            offline,
            online,
            upload_ring,
            backend,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// The width and height of the swapchain.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn backbuffer_count(&self) -> u32 {
        self.frames.len() as u32
    }

    pub fn backbuffer_index(&self) -> u32 {
        self.backbuffer_index
    }

    /// The index of the frame being recorded, or of the next frame if none
    /// is.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn backbuffer(&self) -> &B::Resource {
        self.current().back_buffer()
    }

    pub fn backbuffer_rtv(&self) -> CpuDescriptor {
        self.current().rtv
    }

    pub fn rtv_heap(&self) -> &DescriptorHeap<B> {
        &self.rtv_heap
    }

    pub fn frame_state(&self, frame: u64) -> FrameState {
        if frame >= self.frame_index {
            FrameState::Recording
        } else if self.frame_fence.completed_value() > frame {
            FrameState::Complete
        } else {
            FrameState::Submitted
        }
    }

    /// Starts recording a frame into the current backbuffer.
    ///
    /// Reclaims ring allocations from every frame the GPU has finished, and
    /// resets the backbuffer's command lists and linear upload allocator.
    /// The backbuffer is bound for rendering on the default command list.
    ///
    /// ## Panics
    ///
    /// Panics if the previous frame has not been ended.
    pub fn begin_frame(&mut self) -> Frame {
        assert!(
            !self.frame_in_progress,
            "begin_frame called while frame {} is still being recorded",
            self.frame_index
        );

        let completed = self.frame_fence.completed_value();
        let released = self.online.release_completed_frames(completed)
            + self.upload_ring.release_completed_frames(completed);

        let backend = &self.backend;
        let heap = self.online.heap().raw();
        let slot = &mut self.frames[self.backbuffer_index as usize];

        slot.dynamic_allocator.clear();
        slot.graphics_lists.reset();
        slot.compute_lists.reset();

        backend.reset_command_list(&slot.default_list);
        backend.record_bind_descriptor_heap(&slot.default_list, heap);
        backend.record_transition(
            &slot.default_list,
            slot.back_buffer(),
            ResourceState::Present,
            ResourceState::RenderTarget,
        );

        log::trace!(
            "begin frame {} on backbuffer {} (gpu at {completed}, {released} ring batches released)",
            self.frame_index,
            self.backbuffer_index
        );

        self.frame_in_progress = true;

        Frame {
            index: self.frame_index,
            backbuffer_index: self.backbuffer_index,
        }
    }

    /// Records a clear of the backbuffer on the default command list.
    pub fn clear_backbuffer(&self, frame: &Frame, color: Color) {
        self.check_frame(frame);
        let slot = self.current();
        self.backend.record_clear(&slot.default_list, slot.rtv, color);
    }

    /// Submits the frame's command lists, presents the backbuffer, and moves
    /// on to the next backbuffer.
    ///
    /// Compute lists are submitted before graphics lists. Graphics lists are
    /// submitted with the default list first, followed by auxiliary lists in
    /// the order they were acquired.
    ///
    /// Blocks if the GPU is still working on the frame that last used the next
    /// backbuffer.
    pub fn end_frame(&mut self, frame: Frame, vsync: bool) {
        self.check_frame(&frame);

        let fence_value = self.frame_fence_value;

        {
            let backend = &self.backend;
            let slot = self.current();

            let compute: SmallVec<[&B::CommandList; 8]> =
                slot.compute_lists.used().iter().collect();
            let graphics: SmallVec<[&B::CommandList; 8]> = std::iter::once(&slot.default_list)
                .chain(slot.graphics_lists.used())
                .collect();

            if let Some(last) = graphics.last() {
                backend.record_transition(
                    last,
                    slot.back_buffer(),
                    ResourceState::RenderTarget,
                    ResourceState::Present,
                );
            }

            if !compute.is_empty() {
                backend.execute(QueueKind::Compute, &compute);
            }
            backend.execute(QueueKind::Graphics, &graphics);
        }

        self.online.finish_current_frame(fence_value);
        self.upload_ring.finish_current_frame(fence_value);

        self.process_release_queue();
        self.backend.present(vsync);
        self.move_to_next_frame();

        self.frame_in_progress = false;
    }

    /// Releases every deferred object whose fence value the GPU has reached,
    /// then signals the release fence so that objects deferred since the
    /// last call can be released once the GPU catches up.
    fn process_release_queue(&mut self) -> usize {
        let completed = self.release_fence.completed_value();
        let released = self.release_queue.get_mut().release_completed(completed);

        self.backend.signal(
            QueueKind::Graphics,
            &self.release_fence,
            self.release_fence_value,
        );
        self.release_fence_value += 1;

        if released > 0 {
            log::trace!("released {released} deferred objects (release fence at {completed})");
        }

        released
    }

    fn move_to_next_frame(&mut self) {
        let value = self.frame_fence_value;
        self.backend
            .signal(QueueKind::Graphics, &self.frame_fence, value);
        self.frames[self.backbuffer_index as usize].fence_value = value;
        self.frame_fence_value += 1;

        self.backbuffer_index = self.backend.current_backbuffer_index();

        let pending = self.frames[self.backbuffer_index as usize].fence_value;
        if self.frame_fence.completed_value() < pending {
            log::trace!(
                "waiting for backbuffer {} to be released by the GPU",
                self.backbuffer_index
            );
            self.frame_fence.wait(pending);
        }

        self.frame_index += 1;
    }

    /// Blocks until both queues have finished all submitted work.
    pub fn wait_for_gpu(&self) {
        for queue in [QueueKind::Graphics, QueueKind::Compute] {
            let fence = self.queue_fence(queue);
            let value = fence.signal(&self.backend, queue);
            fence.fence.wait(value);
        }
    }

    /// Signals `queue`'s fence once the work submitted to it so far is done,
    /// returning the signaled value.
    pub fn signal_from_queue(&self, queue: QueueKind) -> u64 {
        self.queue_fence(queue).signal(&self.backend, queue)
    }

    /// Makes `queue` wait for the other queue to reach `value`, as returned by
    /// [`GraphicsDevice::signal_from_queue`]. The CPU does not block.
    pub fn wait_on_queue(&self, queue: QueueKind, value: u64) {
        let other = self.queue_fence(queue.other());
        self.backend.queue_wait(queue, &other.fence, value);
    }

    /// Resizes the swapchain, waiting for the GPU to finish with the current
    /// images first.
    ///
    /// Zero-sized and unchanged sizes are ignored.
    ///
    /// ## Panics
    ///
    /// Panics if a frame is being recorded.
    pub fn resize_backbuffer(&mut self, width: u32, height: u32) -> Result<(), Error> {
        assert!(
            !self.frame_in_progress,
            "cannot resize the swapchain while a frame is being recorded"
        );

        if width == 0 || height == 0 {
            log::warn!("ignoring swapchain resize to {width}x{height}");
            return Ok(());
        }

        if (width, height) == (self.width, self.height) {
            return Ok(());
        }

        self.wait_for_gpu();

        for slot in &mut self.frames {
            slot.back_buffer = None;
        }

        self.backend.resize_swapchain(width, height)?;

        for (index, slot) in self.frames.iter_mut().enumerate() {
            let back_buffer = self.backend.backbuffer(index as u32)?;
            self.backend
                .create_render_target_view(&back_buffer, slot.rtv);
            slot.back_buffer = Some(back_buffer);
        }

        self.backbuffer_index = self.backend.current_backbuffer_index();
        self.width = width;
        self.height = height;

        log::debug!("resized swapchain to {width}x{height}");
        Ok(())
    }

    /// The default graphics command list of the frame. It is the first list
    /// submitted, and is where the backbuffer is cleared.
    pub fn command_list(&self, frame: &Frame) -> &B::CommandList {
        self.check_frame(frame);
        &self.current().default_list
    }

    /// Acquires an auxiliary command list for recording on another thread.
    /// Graphics lists have the shader-visible descriptor heap bound.
    ///
    /// ## Panics
    ///
    /// Panics if the frame has used every list for `queue`.
    pub fn new_command_list(&self, frame: &Frame, queue: QueueKind) -> &B::CommandList {
        self.check_frame(frame);

        let Some(list) = self.current().pool(queue).acquire() else {
            fatal(format_args!(
                "out of {queue:?} command lists for frame {} ({} per frame)",
                frame.index, self.config.command_lists_per_frame
            ))
        };

        self.backend.reset_command_list(list);
        if queue == QueueKind::Graphics {
            self.backend
                .record_bind_descriptor_heap(list, self.online.heap().raw());
        }

        list
    }

    /// The auxiliary command list for `queue` acquired most recently this
    /// frame.
    pub fn last_command_list(&self, frame: &Frame, queue: QueueKind) -> Option<&B::CommandList> {
        self.check_frame(frame);
        self.current().pool(queue).used().last()
    }

    /// The upload allocator of the frame's backbuffer. Cleared the next time
    /// the backbuffer is used.
    pub fn dynamic_allocator(&self, frame: &Frame) -> &LinearDynamicAllocator<B> {
        self.check_frame(frame);
        &self.current().dynamic_allocator
    }

    /// The shader-visible descriptor ring shared by every frame.
    pub fn online_descriptor_allocator(&self) -> &RingDescriptorAllocator<B> {
        &self.online
    }

    /// The upload ring shared by every frame.
    pub fn upload_ring(&self) -> &RingDynamicAllocator<B> {
        &self.upload_ring
    }

    /// Recreates the shader-visible descriptor heap with `reserve` descriptors
    /// at its start excluded from the ring. Waits for the GPU to go idle.
    ///
    /// ## Errors
    ///
    /// Returns `Error::InvalidConfig` if the reserve does not leave room for
    /// the ring, and any error the backend returns while creating the heap.
    pub fn reserve_online_descriptors(&mut self, reserve: u32) -> Result<(), Error> {
        assert!(
            !self.frame_in_progress,
            "cannot replace the descriptor heap while a frame is being recorded"
        );

        if reserve >= self.config.online_descriptor_count {
            return Err(Error::InvalidConfig(format!(
                "cannot reserve {reserve} of {} online descriptors",
                self.config.online_descriptor_count
            )));
        }

        self.wait_for_gpu();

        self.online = RingDescriptorAllocator::new(
            &self.backend,
            DescriptorHeapKind::CbvSrvUav,
            self.config.online_descriptor_count,
            reserve,
        )?;
        self.config.online_descriptor_reserve = reserve;

        log::debug!("reserved {reserve} online descriptors");
        Ok(())
    }

    pub fn offline_descriptor_allocator(
        &self,
        kind: DescriptorHeapKind,
    ) -> &OfflineDescriptorAllocator<B> {
        &self.offline[kind.index()]
    }

    pub fn allocate_offline_descriptor(&self, kind: DescriptorHeapKind) -> DescriptorHandle {
        self.offline_descriptor_allocator(kind).allocate()
    }

    /// Frees a descriptor allocated with
    /// [`GraphicsDevice::allocate_offline_descriptor`]. No GPU work may still
    /// read it.
    pub fn free_offline_descriptor(&self, handle: DescriptorHandle, kind: DescriptorHeapKind) {
        self.offline_descriptor_allocator(kind).free(handle);
    }

    /// Copies `count` descriptors, typically from an offline heap into the
    /// online ring.
    pub fn copy_descriptors(
        &self,
        count: u32,
        dst: CpuDescriptor,
        src: CpuDescriptor,
        kind: DescriptorHeapKind,
    ) {
        self.backend.copy_descriptors(count, dst, src, kind);
    }

    /// Keeps `object` alive until the GPU has finished all work submitted
    /// up to the end of the current frame.
    pub fn add_to_release_queue<T: Send + 'static>(&self, object: T) {
        self.release_queue
            .lock()
            .push(Deferred::new(object, self.release_fence_value));
    }

    /// Like [`GraphicsDevice::add_to_release_queue`], but calls `release`
    /// instead of dropping an object.
    pub fn add_to_release_queue_with(&self, release: impl FnOnce() + Send + 'static) {
        self.release_queue
            .lock()
            .push(Deferred::with(release, self.release_fence_value));
    }

    /// The number of deferred releases waiting on the GPU.
    pub fn pending_releases(&self) -> usize {
        self.release_queue.lock().len()
    }

    fn current(&self) -> &FrameResources<B> {
        &self.frames[self.backbuffer_index as usize]
    }

    fn queue_fence(&self, queue: QueueKind) -> &QueueFence<B> {
        match queue {
            QueueKind::Graphics => &self.graphics_fence,
            QueueKind::Compute => &self.compute_fence,
        }
    }

    fn check_frame(&self, frame: &Frame) {
        assert!(
            self.frame_in_progress && frame.index == self.frame_index,
            "frame {} is not being recorded by this device",
            frame.index
        );
    }
}

impl<B: Backend> Drop for GraphicsDevice<B> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        self.wait_for_gpu();
        let released = self.release_queue.get_mut().flush();
        log::debug!("graphics device destroyed ({released} deferred releases flushed)");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{HeadlessBackend, HeadlessCommand};

    fn small_config() -> DeviceConfig {
        DeviceConfig {
            command_lists_per_frame: 4,
            online_descriptor_count: 64,
            offline_descriptor_count: 16,
            dynamic_allocator_size: 4096,
            upload_ring_size: 4096,
            ..Default::default()
        }
    }

    fn device(config: &DeviceConfig) -> GraphicsDevice<HeadlessBackend> {
        let backend = HeadlessBackend::new(config.backbuffer_count, 640, 480);
        GraphicsDevice::new(backend, config).unwrap()
    }

    fn run_frame(device: &mut GraphicsDevice<HeadlessBackend>) {
        let frame = device.begin_frame();
        device.end_frame(frame, false);
    }

    #[test]
    fn mismatched_backbuffer_count() {
        let backend = HeadlessBackend::new(2, 640, 480);
        let result = GraphicsDevice::new(backend, &small_config());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn frame_states() {
        let mut device = device(&small_config());
        assert_eq!(device.frame_state(0), FrameState::Recording);

        run_frame(&mut device);
        assert_eq!(device.frame_index(), 1);
        assert_eq!(device.frame_state(0), FrameState::Submitted);

        device.backend().complete_all();
        assert_eq!(device.frame_state(0), FrameState::Complete);
        assert_eq!(device.frame_state(1), FrameState::Recording);
    }

    #[test]
    fn frames_in_flight_are_bounded_by_backbuffer_count() {
        let mut device = device(&small_config());

        run_frame(&mut device);
        run_frame(&mut device);
        assert_eq!(device.frame_state(0), FrameState::Submitted);
        assert_eq!(device.frame_state(1), FrameState::Submitted);

        // the next backbuffer is the one frame 0 rendered to
        run_frame(&mut device);
        assert_eq!(device.backbuffer_index(), 0);
        assert_eq!(device.frame_state(0), FrameState::Complete);
        assert_eq!(device.frame_state(1), FrameState::Submitted);
        assert_eq!(device.frame_state(2), FrameState::Submitted);
    }

    #[test]
    fn ring_allocations_wait_for_the_gpu() {
        let mut device = device(&DeviceConfig {
            online_descriptor_count: 8,
            ..small_config()
        });

        let frame = device.begin_frame();
        assert_eq!(device.online_descriptor_allocator().allocate(4).index, 0);
        device.end_frame(frame, false);

        let frame = device.begin_frame();
        assert_eq!(device.online_descriptor_allocator().allocate(4).index, 4);
        device.end_frame(frame, false);

        // both frames are still in flight
        let frame = device.begin_frame();
        assert!(device.online_descriptor_allocator().try_allocate(1).is_err());
        device.backend().complete_all();
        device.end_frame(frame, false);

        let frame = device.begin_frame();
        assert_eq!(device.online_descriptor_allocator().used(), 0);
        assert_eq!(device.online_descriptor_allocator().allocate(8).index, 0);
        device.end_frame(frame, false);
    }

    #[test]
    fn upload_ring_is_reclaimed_per_frame() {
        let mut device = device(&small_config());

        for _ in 0..16 {
            let frame = device.begin_frame();
            let allocation = device.upload_ring().upload(&[1.0f32; 16], 256);
            assert_eq!(allocation.offset() % 256, 0);
            device.end_frame(frame, false);
        }

        device.wait_for_gpu();
        let frame = device.begin_frame();
        assert_eq!(device.upload_ring().used(), 0);
        device.end_frame(frame, false);
    }

    #[test]
    fn dynamic_allocator_is_cleared_when_its_backbuffer_returns() {
        let mut device = device(&small_config());

        let frame = device.begin_frame();
        assert_eq!(frame.backbuffer_index(), 0);
        device.dynamic_allocator(&frame).allocate(100, 0);
        assert_eq!(device.dynamic_allocator(&frame).used(), 100);
        device.end_frame(frame, false);

        run_frame(&mut device);
        run_frame(&mut device);

        let frame = device.begin_frame();
        assert_eq!(frame.backbuffer_index(), 0);
        assert_eq!(device.dynamic_allocator(&frame).used(), 0);
        device.end_frame(frame, false);
    }

    #[test]
    fn default_list_commands() {
        let mut device = device(&small_config());
        let rtv = device.backbuffer_rtv();
        let heap_start = device.online_descriptor_allocator().heap().handle(0).cpu;

        let frame = device.begin_frame();
        device.clear_backbuffer(&frame, Color::BLUE);
        device.end_frame(frame, true);

        assert_eq!(
            device.frames[0].default_list.commands(),
            [
                HeadlessCommand::BindDescriptorHeap { start: heap_start },
                HeadlessCommand::Transition {
                    backbuffer: 0,
                    before: ResourceState::Present,
                    after: ResourceState::RenderTarget,
                },
                HeadlessCommand::Clear {
                    target: rtv,
                    color: Color::BLUE,
                },
                HeadlessCommand::Transition {
                    backbuffer: 0,
                    before: ResourceState::RenderTarget,
                    after: ResourceState::Present,
                },
            ]
        );
        assert_eq!(device.backend().presents(), 1);
    }

    #[test]
    fn parallel_recording() {
        let mut device = device(&small_config());
        let frame = device.begin_frame();

        std::thread::scope(|scope| {
            for i in 0..4u32 {
                let device = &device;
                let frame = &frame;

                scope.spawn(move || {
                    let _list = device.new_command_list(frame, QueueKind::Graphics);
                    device.upload_ring().allocate(64, 256).write_value(&i);
                    let _table = device.online_descriptor_allocator().allocate(4);
                });
            }
        });

        let _compute = device.new_command_list(&frame, QueueKind::Compute);

        assert_eq!(device.online_descriptor_allocator().used(), 16);
        assert!(device.last_command_list(&frame, QueueKind::Graphics).is_some());
        device.end_frame(frame, false);

        device.backend().complete_all();
        assert_eq!(device.backend().executed_command_lists(), 6);

        // the backbuffer goes back to presentable at the end of the last list
        let last = &device.frames[0].graphics_lists.used()[3];
        assert!(last.is_closed());
        assert!(matches!(
            last.commands().last(),
            Some(HeadlessCommand::Transition {
                after: ResourceState::Present,
                ..
            })
        ));
    }

    #[test]
    #[should_panic(expected = "out of Graphics command lists")]
    fn command_list_exhaustion() {
        let mut device = device(&DeviceConfig {
            command_lists_per_frame: 1,
            ..small_config()
        });

        let frame = device.begin_frame();
        let _a = device.new_command_list(&frame, QueueKind::Graphics);
        let _b = device.new_command_list(&frame, QueueKind::Graphics);
    }

    #[test]
    #[should_panic(expected = "still being recorded")]
    fn begin_frame_twice() {
        let mut device = device(&small_config());
        let _frame = device.begin_frame();
        let _ = device.begin_frame();
    }

    #[test]
    fn release_queue_waits_for_the_gpu() {
        let mut device = device(&small_config());
        let object = Arc::new(());

        let frame = device.begin_frame();
        device.add_to_release_queue(object.clone());
        device.end_frame(frame, false);

        assert_eq!(Arc::strong_count(&object), 2);
        assert_eq!(device.pending_releases(), 1);

        device.backend().complete_all();
        run_frame(&mut device);

        assert_eq!(Arc::strong_count(&object), 1);
        assert_eq!(device.pending_releases(), 0);
    }

    #[test]
    fn release_queue_outlives_recording_frame() {
        let mut device = device(&small_config());
        let object = Arc::new(());

        let frame = device.begin_frame();
        device.add_to_release_queue(object.clone());

        // an idle GPU has not seen any of this frame's work yet
        device.backend().complete_all();
        device.end_frame(frame, false);
        assert_eq!(Arc::strong_count(&object), 2);

        device.backend().complete_all();
        run_frame(&mut device);
        assert_eq!(Arc::strong_count(&object), 1);
    }

    #[test]
    fn drop_flushes_release_queue() {
        let device = device(&small_config());
        let object = Arc::new(());
        device.add_to_release_queue(object.clone());

        drop(device);
        assert_eq!(Arc::strong_count(&object), 1);
    }

    #[test]
    fn cross_queue_synchronization() {
        let device = device(&small_config());

        let value = device.signal_from_queue(QueueKind::Compute);
        device.wait_on_queue(QueueKind::Graphics, value);
        assert_eq!(value, 1);

        device.wait_for_gpu();
        assert_eq!(device.backend().pending_operations(), 0);
        assert_eq!(device.signal_from_queue(QueueKind::Compute), 3);
    }

    #[test]
    fn resize() {
        let mut device = device(&small_config());
        assert_eq!(device.size(), (640, 480));
        assert_eq!(device.backend().render_target_views(), 3);

        run_frame(&mut device);
        device.resize_backbuffer(800, 600).unwrap();

        assert_eq!(device.size(), (800, 600));
        assert_eq!(device.backbuffer_index(), 0);
        assert_eq!(device.backbuffer().size(), (800, 600));
        assert_eq!(device.backend().live_images(), 3);
        assert_eq!(device.backend().render_target_views(), 6);

        device.resize_backbuffer(800, 600).unwrap();
        device.resize_backbuffer(0, 600).unwrap();
        assert_eq!(device.size(), (800, 600));
        assert_eq!(device.backend().render_target_views(), 6);

        run_frame(&mut device);
    }

    #[test]
    fn offline_descriptors() {
        let device = device(&small_config());

        let a = device.allocate_offline_descriptor(DescriptorHeapKind::CbvSrvUav);
        let b = device.allocate_offline_descriptor(DescriptorHeapKind::Sampler);
        assert_eq!((a.index, b.index), (0, 0));
        assert_eq!(a.gpu, None);

        let table = device.online_descriptor_allocator().allocate(1);
        device.copy_descriptors(1, table.cpu, a.cpu, DescriptorHeapKind::CbvSrvUav);
        assert_eq!(device.backend().descriptor_copies(), 1);

        device.free_offline_descriptor(a, DescriptorHeapKind::CbvSrvUav);
        assert_eq!(
            device
                .offline_descriptor_allocator(DescriptorHeapKind::CbvSrvUav)
                .available(),
            16
        );
    }

    #[test]
    fn reserve_online_descriptors() {
        let mut device = device(&small_config());

        device.reserve_online_descriptors(16).unwrap();
        assert!(device.reserve_online_descriptors(64).is_err());

        let frame = device.begin_frame();
        assert_eq!(device.online_descriptor_allocator().allocate(1).index, 16);
        assert_eq!(device.online_descriptor_allocator().reserved(3).index, 3);
        device.end_frame(frame, false);
    }
}

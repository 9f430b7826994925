//! A backend that emulates a GPU in software.
//!
//! Submitted work is not executed when it is submitted. It is queued per
//! hardware queue and only runs when the CPU waits on a fence, or when the
//! owner of the backend calls [`HeadlessBackend::advance`] or
//! [`HeadlessBackend::complete_all`]. Tests use this to hold the GPU at a
//! known point in its timeline.
//!
//! The backend also checks usage the real API would reject or silently
//! mishandle: recording into a closed command list, submitting a list twice,
//! resizing the swapchain while its images are still referenced, and queue
//! waits that can never be satisfied.

use std::{
    collections::VecDeque,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    descriptor::{CpuDescriptor, GpuDescriptor},
    Color, DescriptorHeapKind, Error, QueueKind,
};

use super::{Backend, Fence, RawDescriptorHeap, ResourceState, UploadBuffer};

enum Operation {
    Signal { fence: Arc<AtomicU64>, value: u64 },
    Wait { fence: Arc<AtomicU64>, value: u64 },
    Execute { count: usize },
}

impl Operation {
    fn is_ready(&self) -> bool {
        match self {
            Self::Wait { fence, value } => fence.load(Ordering::Acquire) >= *value,
            Self::Signal { .. } | Self::Execute { .. } => true,
        }
    }
}

enum Step {
    Progress,
    Idle,
    Blocked,
}

/// Work submitted to the emulated queues, in submission order per queue.
#[derive(Default)]
struct Timeline {
    queues: Mutex<[VecDeque<(u64, Operation)>; 2]>,
    next_submission: AtomicU64,
    executed_lists: AtomicU64,
}

impl Timeline {
    fn push(&self, queue: QueueKind, operation: Operation) {
        let submission = self.next_submission.fetch_add(1, Ordering::Relaxed);
        self.queues.lock()[queue_index(queue)].push_back((submission, operation));
    }

    /// Runs the oldest operation at the front of a queue that is not blocked
    /// on a fence.
    fn step(&self) -> Step {
        let mut queues = self.queues.lock();

        let runnable = queues
            .iter()
            .enumerate()
            .filter_map(|(index, queue)| {
                queue
                    .front()
                    .filter(|(_, operation)| operation.is_ready())
                    .map(|(submission, _)| (*submission, index))
            })
            .min();

        let Some((_, index)) = runnable else {
            return if queues.iter().all(VecDeque::is_empty) {
                Step::Idle
            } else {
                Step::Blocked
            };
        };

        match queues[index].pop_front() {
            Some((_, Operation::Signal { fence, value })) => {
                fence.fetch_max(value, Ordering::AcqRel);
            }
            Some((_, Operation::Execute { count })) => {
                self.executed_lists
                    .fetch_add(count as u64, Ordering::Relaxed);
            }
            Some((_, Operation::Wait { .. })) | None => {}
        }

        Step::Progress
    }

    fn pending(&self) -> usize {
        self.queues.lock().iter().map(VecDeque::len).sum()
    }
}

fn queue_index(queue: QueueKind) -> usize {
    match queue {
        QueueKind::Graphics => 0,
        QueueKind::Compute => 1,
    }
}

pub struct HeadlessFence {
    name: String,
    value: Arc<AtomicU64>,
    timeline: Arc<Timeline>,
}

impl Fence for HeadlessFence {
    fn completed_value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Runs queued GPU work until the fence reaches `value`.
    ///
    /// ## Panics
    ///
    /// Panics if every queue runs dry or deadlocks before the fence reaches
    /// `value`. On a real GPU this would block forever.
    fn wait(&self, value: u64) {
        while self.completed_value() < value {
            match self.timeline.step() {
                Step::Progress => {}
                Step::Idle => panic!(
                    "waiting for {} to reach {value}, but it is never signaled",
                    self.name
                ),
                Step::Blocked => panic!(
                    "waiting for {} to reach {value}, but the queues are deadlocked",
                    self.name
                ),
            }
        }
    }
}

/// A command recorded by the device into a [`HeadlessCommandList`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HeadlessCommand {
    Transition {
        backbuffer: u32,
        before: ResourceState,
        after: ResourceState,
    },
    Clear {
        target: CpuDescriptor,
        color: Color,
    },
    BindDescriptorHeap {
        start: CpuDescriptor,
    },
}

pub struct HeadlessCommandList {
    queue: QueueKind,
    commands: Mutex<Vec<HeadlessCommand>>,
    closed: AtomicBool,
    submissions: AtomicU64,
}

impl HeadlessCommandList {
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// The commands recorded since the list was last reset.
    pub fn commands(&self) -> Vec<HeadlessCommand> {
        self.commands.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The number of times the list has been submitted.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    fn record(&self, command: HeadlessCommand) {
        assert!(
            !self.is_closed(),
            "recording {command:?} into a closed command list"
        );
        self.commands.lock().push(command);
    }
}

/// A swapchain image.
#[derive(Debug)]
pub struct HeadlessImage {
    index: u32,
    width: u32,
    height: u32,
    _reference: Arc<()>,
}

impl HeadlessImage {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

pub struct HeadlessDescriptorHeap {
    cpu_start: CpuDescriptor,
    gpu_start: Option<GpuDescriptor>,
}

impl RawDescriptorHeap for HeadlessDescriptorHeap {
    fn cpu_start(&self) -> CpuDescriptor {
        self.cpu_start
    }

    fn gpu_start(&self) -> Option<GpuDescriptor> {
        self.gpu_start
    }
}

/// An upload buffer backed by host memory.
pub struct HeadlessBuffer {
    memory: NonNull<u8>,
    size: u64,
    gpu_address: u64,
}

// SAFETY: The buffer owns its memory and never hands out references to it.
// Writes go through raw pointers to disjoint ranges handed out by an
// allocator, the same as for a mapped GPU buffer.
unsafe impl Send for HeadlessBuffer {}
unsafe impl Sync for HeadlessBuffer {}

impl HeadlessBuffer {
    fn new(size: u64, gpu_address: u64) -> Self {
        let memory = vec![0u8; size as usize].into_boxed_slice();

        Self {
            memory: NonNull::from(Box::leak(memory)).cast(),
            size,
            gpu_address,
        }
    }

    /// Copies `len` bytes starting at `offset` out of the buffer.
    ///
    /// # Safety
    ///
    /// No other thread may be writing to the range while it is read.
    ///
    /// ## Panics
    ///
    /// Panics if the range is out of bounds.
    pub unsafe fn read(&self, offset: u64, len: usize) -> Vec<u8> {
        assert!(offset + len as u64 <= self.size, "read out of bounds");
        std::slice::from_raw_parts(self.memory.as_ptr().add(offset as usize), len).to_vec()
    }
}

impl UploadBuffer for HeadlessBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn cpu_address(&self) -> NonNull<u8> {
        self.memory
    }

    fn gpu_address(&self) -> u64 {
        self.gpu_address
    }
}

impl Drop for HeadlessBuffer {
    fn drop(&mut self) {
        // SAFETY: The memory was leaked from a boxed slice of exactly this
        // length in `new`.
        drop(unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.memory.as_ptr(),
                self.size as usize,
            ))
        });
    }
}

/// A software [`Backend`] for tests and for running without a GPU.
pub struct HeadlessBackend {
    timeline: Arc<Timeline>,
    backbuffer_count: u32,
    width: u32,
    height: u32,
    current_backbuffer: AtomicU32,
    images: Arc<()>,
    next_address: AtomicUsize,
    next_gpu_address: AtomicU64,
    presents: AtomicU64,
    descriptor_copies: AtomicU64,
    render_target_views: AtomicU64,
}

impl HeadlessBackend {
    const CPU_BASE_ADDRESS: usize = 0x1000_0000;
    const GPU_BASE_ADDRESS: u64 = 0x10_0000_0000;

    #[must_use]
    pub fn new(backbuffer_count: u32, width: u32, height: u32) -> Self {
        Self {
            timeline: Arc::default(),
            backbuffer_count,
            width,
            height,
            current_backbuffer: AtomicU32::new(0),
            images: Arc::new(()),
            next_address: AtomicUsize::new(Self::CPU_BASE_ADDRESS),
            next_gpu_address: AtomicU64::new(Self::GPU_BASE_ADDRESS),
            presents: AtomicU64::new(0),
            descriptor_copies: AtomicU64::new(0),
            render_target_views: AtomicU64::new(0),
        }
    }

    /// Runs up to `count` queued GPU operations, returning the number that
    /// ran.
    pub fn advance(&self, count: usize) -> usize {
        let mut ran = 0;
        while ran < count {
            match self.timeline.step() {
                Step::Progress => ran += 1,
                Step::Idle | Step::Blocked => break,
            }
        }
        ran
    }

    /// Runs queued GPU operations until every queue is empty or blocked.
    pub fn complete_all(&self) {
        loop {
            match self.timeline.step() {
                Step::Progress => {}
                Step::Idle => break,
                Step::Blocked => {
                    log::warn!("headless queues are blocked on fences that are never signaled");
                    break;
                }
            }
        }
    }

    /// The number of queued operations that have not run yet.
    pub fn pending_operations(&self) -> usize {
        self.timeline.pending()
    }

    /// The number of command lists the GPU has finished executing.
    pub fn executed_command_lists(&self) -> u64 {
        self.timeline.executed_lists.load(Ordering::Relaxed)
    }

    pub fn presents(&self) -> u64 {
        self.presents.load(Ordering::Relaxed)
    }

    /// The total number of descriptors copied.
    pub fn descriptor_copies(&self) -> u64 {
        self.descriptor_copies.load(Ordering::Relaxed)
    }

    pub fn render_target_views(&self) -> u64 {
        self.render_target_views.load(Ordering::Relaxed)
    }

    /// The number of swapchain images that are still referenced.
    pub fn live_images(&self) -> usize {
        Arc::strong_count(&self.images) - 1
    }

    fn descriptor_increment_for(kind: DescriptorHeapKind) -> u32 {
        match kind {
            DescriptorHeapKind::CbvSrvUav
            | DescriptorHeapKind::Sampler
            | DescriptorHeapKind::RenderTarget => 32,
            DescriptorHeapKind::DepthStencil => 8,
        }
    }
}

impl Backend for HeadlessBackend {
    type Fence = HeadlessFence;
    type CommandList = HeadlessCommandList;
    type Resource = HeadlessImage;
    type DescriptorHeap = HeadlessDescriptorHeap;
    type UploadBuffer = HeadlessBuffer;

    fn create_fence(&self, name: &str) -> Result<Self::Fence, Error> {
        Ok(HeadlessFence {
            name: name.to_owned(),
            value: Arc::new(AtomicU64::new(0)),
            timeline: self.timeline.clone(),
        })
    }

    fn create_command_list(&self, queue: QueueKind) -> Result<Self::CommandList, Error> {
        Ok(HeadlessCommandList {
            queue,
            commands: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            submissions: AtomicU64::new(0),
        })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        count: u32,
        shader_visible: bool,
    ) -> Result<Self::DescriptorHeap, Error> {
        let size = count as usize * Self::descriptor_increment_for(kind) as usize;

        // leave a gap between heaps so that stray handles don't alias
        let cpu_start = self.next_address.fetch_add(size + 0x1000, Ordering::Relaxed);
        let gpu_start = shader_visible.then(|| {
            GpuDescriptor(
                self.next_gpu_address
                    .fetch_add(size as u64 + 0x1000, Ordering::Relaxed),
            )
        });

        Ok(HeadlessDescriptorHeap {
            cpu_start: CpuDescriptor(cpu_start),
            gpu_start,
        })
    }

    fn descriptor_increment(&self, kind: DescriptorHeapKind) -> u32 {
        Self::descriptor_increment_for(kind)
    }

    fn create_upload_buffer(&self, size: u64) -> Result<Self::UploadBuffer, Error> {
        let gpu_address = self
            .next_gpu_address
            .fetch_add(size + 0x1_0000, Ordering::Relaxed);
        Ok(HeadlessBuffer::new(size, gpu_address))
    }

    fn signal(&self, queue: QueueKind, fence: &Self::Fence, value: u64) {
        self.timeline.push(
            queue,
            Operation::Signal {
                fence: fence.value.clone(),
                value,
            },
        );
    }

    fn queue_wait(&self, queue: QueueKind, fence: &Self::Fence, value: u64) {
        self.timeline.push(
            queue,
            Operation::Wait {
                fence: fence.value.clone(),
                value,
            },
        );
    }

    fn execute(&self, queue: QueueKind, lists: &[&Self::CommandList]) {
        for list in lists {
            assert_eq!(
                list.queue, queue,
                "{:?} command list submitted to the {queue:?} queue",
                list.queue
            );
            assert!(
                !list.closed.swap(true, Ordering::AcqRel),
                "command list submitted twice without being reset"
            );
            list.submissions.fetch_add(1, Ordering::Relaxed);
        }

        self.timeline
            .push(queue, Operation::Execute { count: lists.len() });
    }

    fn reset_command_list(&self, list: &Self::CommandList) {
        list.commands.lock().clear();
        list.closed.store(false, Ordering::Release);
    }

    fn record_transition(
        &self,
        list: &Self::CommandList,
        resource: &Self::Resource,
        before: ResourceState,
        after: ResourceState,
    ) {
        list.record(HeadlessCommand::Transition {
            backbuffer: resource.index,
            before,
            after,
        });
    }

    fn record_clear(&self, list: &Self::CommandList, target: CpuDescriptor, color: Color) {
        list.record(HeadlessCommand::Clear { target, color });
    }

    fn record_bind_descriptor_heap(&self, list: &Self::CommandList, heap: &Self::DescriptorHeap) {
        list.record(HeadlessCommand::BindDescriptorHeap {
            start: heap.cpu_start,
        });
    }

    fn copy_descriptors(
        &self,
        count: u32,
        dst: CpuDescriptor,
        src: CpuDescriptor,
        _kind: DescriptorHeapKind,
    ) {
        assert_ne!(dst, src, "copying descriptors onto themselves");
        self.descriptor_copies
            .fetch_add(count.into(), Ordering::Relaxed);
    }

    fn create_render_target_view(&self, _resource: &Self::Resource, _dst: CpuDescriptor) {
        self.render_target_views.fetch_add(1, Ordering::Relaxed);
    }

    fn backbuffer_count(&self) -> u32 {
        self.backbuffer_count
    }

    fn swapchain_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn current_backbuffer_index(&self) -> u32 {
        self.current_backbuffer.load(Ordering::Acquire)
    }

    fn backbuffer(&self, index: u32) -> Result<Self::Resource, Error> {
        assert!(
            index < self.backbuffer_count,
            "backbuffer {index} out of range ({})",
            self.backbuffer_count
        );

        Ok(HeadlessImage {
            index,
            width: self.width,
            height: self.height,
            _reference: self.images.clone(),
        })
    }

    fn present(&self, vsync: bool) {
        let presented = self.current_backbuffer.load(Ordering::Acquire);
        log::trace!("present backbuffer {presented} (vsync: {vsync})");

        self.presents.fetch_add(1, Ordering::Relaxed);
        self.current_backbuffer
            .store((presented + 1) % self.backbuffer_count, Ordering::Release);
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> Result<(), Error> {
        assert_eq!(
            self.live_images(),
            0,
            "swapchain resized while its images are still referenced"
        );

        self.width = width;
        self.height = height;
        self.current_backbuffer.store(0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_complete_in_submission_order() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let fence = backend.create_fence("test fence").unwrap();

        backend.signal(QueueKind::Graphics, &fence, 1);
        backend.signal(QueueKind::Graphics, &fence, 2);
        assert_eq!(fence.completed_value(), 0);
        assert_eq!(backend.pending_operations(), 2);

        assert_eq!(backend.advance(1), 1);
        assert_eq!(fence.completed_value(), 1);

        fence.wait(2);
        assert_eq!(fence.completed_value(), 2);
        assert_eq!(backend.pending_operations(), 0);
    }

    #[test]
    fn cross_queue_wait() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let graphics = backend.create_fence("graphics").unwrap();
        let compute = backend.create_fence("compute").unwrap();

        // graphics waits on compute work that is submitted afterwards
        backend.queue_wait(QueueKind::Graphics, &compute, 1);
        backend.signal(QueueKind::Graphics, &graphics, 1);
        backend.signal(QueueKind::Compute, &compute, 1);

        graphics.wait(1);
        assert_eq!(compute.completed_value(), 1);
    }

    #[test]
    #[should_panic(expected = "deadlocked")]
    fn deadlock() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let graphics = backend.create_fence("graphics").unwrap();
        let compute = backend.create_fence("compute").unwrap();

        backend.queue_wait(QueueKind::Graphics, &compute, 1);
        backend.signal(QueueKind::Graphics, &graphics, 1);

        graphics.wait(1);
    }

    #[test]
    #[should_panic(expected = "never signaled")]
    fn wait_for_unsignaled_value() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let fence = backend.create_fence("fence").unwrap();
        fence.wait(1);
    }

    #[test]
    fn command_list_lifecycle() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let list = backend.create_command_list(QueueKind::Graphics).unwrap();
        let heap = backend
            .create_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 16, true)
            .unwrap();

        backend.record_bind_descriptor_heap(&list, &heap);
        backend.execute(QueueKind::Graphics, &[&list]);
        assert!(list.is_closed());
        assert_eq!(list.submissions(), 1);

        backend.complete_all();
        assert_eq!(backend.executed_command_lists(), 1);

        backend.reset_command_list(&list);
        assert!(list.commands().is_empty());
        assert!(!list.is_closed());
    }

    #[test]
    #[should_panic(expected = "closed command list")]
    fn record_into_closed_list() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let list = backend.create_command_list(QueueKind::Graphics).unwrap();

        backend.execute(QueueKind::Graphics, &[&list]);
        backend.record_clear(&list, CpuDescriptor(0x1000), Color::BLACK);
    }

    #[test]
    fn swapchain_rotates_on_present() {
        let backend = HeadlessBackend::new(3, 64, 64);

        assert_eq!(backend.current_backbuffer_index(), 0);
        backend.present(true);
        backend.present(false);
        assert_eq!(backend.current_backbuffer_index(), 2);
        backend.present(true);
        assert_eq!(backend.current_backbuffer_index(), 0);
        assert_eq!(backend.presents(), 3);
    }

    #[test]
    #[should_panic(expected = "still referenced")]
    fn resize_with_live_images() {
        let mut backend = HeadlessBackend::new(2, 64, 64);
        let _image = backend.backbuffer(0).unwrap();
        backend.resize_swapchain(128, 128).unwrap();
    }

    #[test]
    fn upload_buffer_memory() {
        let backend = HeadlessBackend::new(2, 64, 64);
        let buffer = backend.create_upload_buffer(256).unwrap();

        unsafe {
            buffer
                .cpu_address()
                .as_ptr()
                .add(10)
                .copy_from_nonoverlapping([1u8, 2, 3].as_ptr(), 3);
            assert_eq!(buffer.read(9, 5), vec![0, 1, 2, 3, 0]);
        }
    }
}

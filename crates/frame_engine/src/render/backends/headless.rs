//! Headless device with a simulated queue
//!
//! Fabricates handles, keeps buffer contents in memory and models fences as
//! `Unsignaled -> Pending -> Signaled`. Submissions stay pending until
//! [`HeadlessDevice::complete_all`] (or [`HeadlessDevice::complete_next`]) runs,
//! unless auto-completion is enabled, which makes it behave like an
//! infinitely fast GPU.
//!
//! The device also checks the hazards the frame layer exists to prevent:
//! resetting a pool, fence or descriptor set, or destroying a buffer or
//! framebuffer, while a pending submission still references it. Each one is
//! logged and recorded in [`HeadlessDevice::violations`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use parking_lot::{Condvar, Mutex};

use super::device::{Command, GpuDevice, QueueFamilies, QueueFamily, SemaphoreWait, Submission};
use crate::render::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

/// A submission as seen by the simulated queue
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionLog {
    /// Submission order across all queues, starting at 0
    pub sequence: u64,
    /// Queue the batch went to
    pub family: QueueFamily,
    /// Semaphores waited on
    pub wait: Vec<SemaphoreWait>,
    /// Submitted command buffers
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Semaphores signaled
    pub signal: Vec<vk::Semaphore>,
    /// Fence signaled on completion
    pub fence: vk::Fence,
    /// Commands recorded into the buffers at submit time
    pub commands: Vec<Command>,
    /// Whether the simulated GPU finished the batch
    pub completed: bool,
}

impl SubmissionLog {
    fn references_buffer(&self, buffer: vk::Buffer) -> bool {
        self.commands.iter().any(|command| match command {
            Command::BindVertexBuffer { buffer: bound, .. }
            | Command::BindIndexBuffer { buffer: bound, .. } => *bound == buffer,
            Command::CopyBuffer { src, dst, .. } => *src == buffer || *dst == buffer,
            _ => false,
        })
    }

    fn references_framebuffer(&self, framebuffer: vk::Framebuffer) -> bool {
        self.commands.iter().any(|command| {
            matches!(
                command,
                Command::BeginRenderPass { framebuffer: bound, .. } if *bound == framebuffer
            )
        })
    }

    fn references_set(&self, set: vk::DescriptorSet) -> bool {
        self.commands.iter().any(|command| {
            matches!(command, Command::BindDescriptorSet { set: bound, .. } if *bound == set)
        })
    }
}

/// Counts of objects currently alive on the device
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LiveObjects {
    /// Command pools
    pub command_pools: usize,
    /// Command buffers
    pub command_buffers: usize,
    /// Descriptor pools
    pub descriptor_pools: usize,
    /// Descriptor sets allocated and not yet freed by a pool reset
    pub descriptor_sets: usize,
    /// Semaphores
    pub semaphores: usize,
    /// Fences
    pub fences: usize,
    /// Buffers
    pub buffers: usize,
    /// Framebuffers
    pub framebuffers: usize,
}

struct CommandBufferState {
    pool: vk::CommandPool,
    recording: bool,
    commands: Vec<Command>,
}

struct DescriptorPoolState {
    max_sets: u32,
    allocated: Vec<vk::DescriptorSet>,
}

struct HeadlessBuffer {
    data: Vec<u8>,
    host_visible: bool,
}

#[derive(Default)]
struct HeadlessState {
    fences: HashMap<vk::Fence, FenceState>,
    /// `true` while a signal is outstanding that nobody has waited on
    semaphores: HashMap<vk::Semaphore, bool>,
    command_pools: HashMap<vk::CommandPool, QueueFamily>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferState>,
    descriptor_pools: HashMap<vk::DescriptorPool, DescriptorPoolState>,
    descriptor_writes: HashMap<(vk::DescriptorSet, u32), vk::Buffer>,
    buffers: HashMap<vk::Buffer, HeadlessBuffer>,
    framebuffers: HashSet<vk::Framebuffer>,
    submissions: Vec<SubmissionLog>,
    injected_submit_errors: VecDeque<vk::Result>,
    creation_failure: Option<vk::Result>,
    violations: Vec<String>,
}

impl HeadlessState {
    fn violation(&mut self, message: String) {
        log::error!("Headless device hazard: {message}");
        self.violations.push(message);
    }

    fn pending(&self) -> impl Iterator<Item = &SubmissionLog> {
        self.submissions.iter().filter(|submission| !submission.completed)
    }

    fn take_creation_failure(&mut self, what: &'static str) -> RenderResult<()> {
        match self.creation_failure.take() {
            Some(result) => Err(RenderError::from_vk(result, what)),
            None => Ok(()),
        }
    }

    fn complete(&mut self, index: usize) {
        let fence = {
            let submission = &mut self.submissions[index];
            submission.completed = true;
            submission.fence
        };
        if fence != vk::Fence::null() {
            self.fences.insert(fence, FenceState::Signaled);
        }
    }
}

/// In-process [`GpuDevice`] with a simulated queue
pub struct HeadlessDevice {
    families: QueueFamilies,
    auto_complete: AtomicBool,
    next_handle: AtomicU64,
    state: Mutex<HeadlessState>,
    completion: Condvar,
}

impl HeadlessDevice {
    /// Create a device exposing `families`; submissions stay pending until completed
    pub fn new(families: QueueFamilies) -> Self {
        Self {
            families,
            auto_complete: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            state: Mutex::new(HeadlessState::default()),
            completion: Condvar::new(),
        }
    }

    /// Complete every submission as soon as it is queued
    pub fn with_auto_complete(self, enabled: bool) -> Self {
        self.set_auto_complete(enabled);
        self
    }

    /// Toggle immediate completion of new submissions
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::SeqCst);
    }

    /// Produce a fresh non-null handle of any type
    ///
    /// Stands in for objects the frame layer only references, such as
    /// pipelines, render passes, layouts and image views.
    pub fn fabricate<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Finish every pending submission; returns how many completed
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let pending: Vec<usize> = (0..state.submissions.len())
            .filter(|&index| !state.submissions[index].completed)
            .collect();
        for &index in &pending {
            state.complete(index);
        }
        drop(state);
        self.completion.notify_all();
        pending.len()
    }

    /// Finish the oldest pending submission; returns its sequence number
    pub fn complete_next(&self) -> Option<u64> {
        let mut state = self.state.lock();
        let index = state.submissions.iter().position(|submission| !submission.completed)?;
        state.complete(index);
        let sequence = state.submissions[index].sequence;
        drop(state);
        self.completion.notify_all();
        Some(sequence)
    }

    /// Make the next submission fail with `result`
    pub fn inject_submit_error(&self, result: vk::Result) {
        self.state.lock().injected_submit_errors.push_back(result);
    }

    /// Make the next object creation fail with `result`
    pub fn fail_next_creation(&self, result: vk::Result) {
        self.state.lock().creation_failure = Some(result);
    }

    /// Every submission so far, in order
    pub fn submissions(&self) -> Vec<SubmissionLog> {
        self.state.lock().submissions.clone()
    }

    /// Number of submissions that have not completed
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending().count()
    }

    /// Hazards detected so far
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    /// Counts of live objects
    pub fn live_objects(&self) -> LiveObjects {
        let state = self.state.lock();
        LiveObjects {
            command_pools: state.command_pools.len(),
            command_buffers: state.command_buffers.len(),
            descriptor_pools: state.descriptor_pools.len(),
            descriptor_sets: state.descriptor_pools.values().map(|pool| pool.allocated.len()).sum(),
            semaphores: state.semaphores.len(),
            fences: state.fences.len(),
            buffers: state.buffers.len(),
            framebuffers: state.framebuffers.len(),
        }
    }

    /// Current contents of a buffer
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|stored| stored.data.clone())
    }

    /// Buffer currently written into a descriptor binding
    pub fn descriptor_binding(&self, set: vk::DescriptorSet, binding: u32) -> Option<vk::Buffer> {
        self.state.lock().descriptor_writes.get(&(set, binding)).copied()
    }

    /// Commands recorded into a command buffer since its last reset
    pub fn recorded_commands(&self, command_buffer: vk::CommandBuffer) -> Vec<Command> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .map(|buffer| buffer.commands.clone())
            .unwrap_or_default()
    }
}

impl GpuDevice for HeadlessDevice {
    fn supported_queue_families(&self) -> QueueFamilies {
        self.families
    }

    fn create_command_pool(&self, family: QueueFamily) -> RenderResult<vk::CommandPool> {
        if !self.supports(family) {
            return Err(RenderError::UnsupportedQueueFamily(family));
        }
        let mut state = self.state.lock();
        state.take_creation_failure("command pool")?;
        let pool = self.fabricate();
        state.command_pools.insert(pool, family);
        Ok(pool)
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RenderResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        state.take_creation_failure("command buffer")?;
        if !state.command_pools.contains_key(&pool) {
            return Err(RenderError::invalid(format!("unknown command pool {pool:?}")));
        }
        let command_buffer = self.fabricate();
        let stored = CommandBufferState { pool, recording: false, commands: Vec::new() };
        state.command_buffers.insert(command_buffer, stored);
        Ok(command_buffer)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RenderResult<()> {
        let mut state = self.state.lock();
        let in_flight = state
            .pending()
            .flat_map(|submission| submission.command_buffers.iter())
            .filter(|buffer| state.command_buffers.get(buffer).is_some_and(|b| b.pool == pool))
            .count();
        if in_flight > 0 {
            state.violation(format!(
                "command pool {pool:?} reset while {in_flight} of its buffers are still executing"
            ));
        }
        for buffer in state.command_buffers.values_mut().filter(|buffer| buffer.pool == pool) {
            buffer.recording = false;
            buffer.commands.clear();
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.command_pools.remove(&pool);
        state.command_buffers.retain(|_, buffer| buffer.pool != pool);
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or_else(|| {
                RenderError::invalid(format!("unknown command buffer {command_buffer:?}"))
            })?;
        if buffer.recording {
            return Err(RenderError::invalid("Command buffer already recording"));
        }
        buffer.recording = true;
        buffer.commands.clear();
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &Command) {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&command_buffer) {
            Some(buffer) if buffer.recording => buffer.commands.push(command.clone()),
            _ => state.violation(format!(
                "{command:?} recorded outside of recording on {command_buffer:?}"
            )),
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&command_buffer) {
            Some(buffer) if buffer.recording => {
                buffer.recording = false;
                Ok(())
            }
            _ => Err(RenderError::invalid("Command buffer not recording")),
        }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<vk::DescriptorPool> {
        let mut state = self.state.lock();
        state.take_creation_failure("descriptor pool")?;
        let pool = self.fabricate();
        let stored = DescriptorPoolState { max_sets, allocated: Vec::new() };
        state.descriptor_pools.insert(pool, stored);
        Ok(pool)
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> RenderResult<vk::DescriptorSet> {
        let set = self.fabricate();
        let mut state = self.state.lock();
        let stored = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| RenderError::invalid(format!("unknown descriptor pool {pool:?}")))?;
        if stored.allocated.len() >= stored.max_sets as usize {
            let result = vk::Result::ERROR_OUT_OF_POOL_MEMORY;
            return Err(RenderError::from_vk(result, "descriptor set"));
        }
        stored.allocated.push(set);
        Ok(set)
    }

    fn update_descriptor_buffer(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        _descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        _range: vk::DeviceSize,
    ) {
        self.state.lock().descriptor_writes.insert((set, binding), buffer);
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RenderResult<()> {
        let mut state = self.state.lock();
        let freed = state
            .descriptor_pools
            .get_mut(&pool)
            .map(|stored| std::mem::take(&mut stored.allocated))
            .unwrap_or_default();
        let in_use = freed
            .iter()
            .filter(|&&set| state.pending().any(|submission| submission.references_set(set)))
            .count();
        if in_use > 0 {
            state.violation(format!(
                "descriptor pool {pool:?} reset while {in_use} of its sets are still bound"
            ));
        }
        state.descriptor_writes.retain(|(set, _), _| !freed.contains(set));
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().descriptor_pools.remove(&pool);
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let mut state = self.state.lock();
        state.take_creation_failure("semaphore")?;
        let semaphore = self.fabricate();
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let mut state = self.state.lock();
        state.take_creation_failure("fence")?;
        let fence = self.fabricate();
        let initial = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RenderResult<()> {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            match state.fences.get(&fence) {
                Some(FenceState::Signaled) => return Ok(()),
                Some(_) => {}
                None => {
                    return Err(RenderError::invalid(format!("unknown fence {fence:?}")));
                }
            }
            match deadline {
                Some(deadline) => {
                    if self.completion.wait_until(&mut state, deadline).timed_out()
                        && state.fences.get(&fence) != Some(&FenceState::Signaled)
                    {
                        return Err(RenderError::Timeout { timeout_ns });
                    }
                }
                None => self.completion.wait(&mut state),
            }
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RenderResult<bool> {
        match self.state.lock().fences.get(&fence) {
            Some(stored) => Ok(*stored == FenceState::Signaled),
            None => Err(RenderError::invalid(format!("unknown fence {fence:?}"))),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        let mut state = self.state.lock();
        match state.fences.get(&fence).copied() {
            Some(FenceState::Pending) => {
                state.violation(format!(
                    "fence {fence:?} reset while its submission is still executing"
                ));
            }
            Some(_) => {}
            None => return Err(RenderError::invalid(format!("unknown fence {fence:?}"))),
        }
        state.fences.insert(fence, FenceState::Unsignaled);
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        if state.fences.get(&fence) == Some(&FenceState::Pending) {
            state.violation(format!(
                "fence {fence:?} destroyed while its submission is still executing"
            ));
        }
        state.fences.remove(&fence);
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> RenderResult<vk::Buffer> {
        let length = usize::try_from(size)
            .map_err(|_| RenderError::from_vk(vk::Result::ERROR_OUT_OF_HOST_MEMORY, "buffer"))?;
        let mut state = self.state.lock();
        state.take_creation_failure("buffer")?;
        let buffer = self.fabricate();
        state.buffers.insert(buffer, HeadlessBuffer { data: vec![0; length], host_visible });
        Ok(buffer)
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> RenderResult<()> {
        let mut state = self.state.lock();
        let stored = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| RenderError::invalid(format!("unknown buffer {buffer:?}")))?;
        if !stored.host_visible {
            return Err(RenderError::invalid("Buffer is not host visible"));
        }
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= stored.data.len())
            .ok_or_else(|| RenderError::invalid("Buffer write would overflow"))?;
        stored.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        if state.pending().any(|submission| submission.references_buffer(buffer)) {
            state.violation(format!(
                "buffer {buffer:?} destroyed while a submission still reads it"
            ));
        }
        state.buffers.remove(&buffer);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _width: u32,
        _height: u32,
    ) -> RenderResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        state.take_creation_failure("framebuffer")?;
        let framebuffer = self.fabricate();
        state.framebuffers.insert(framebuffer);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        if state.pending().any(|submission| submission.references_framebuffer(framebuffer)) {
            state.violation(format!(
                "framebuffer {framebuffer:?} destroyed while a submission still renders to it"
            ));
        }
        state.framebuffers.remove(&framebuffer);
    }

    fn submit(
        &self,
        family: QueueFamily,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> RenderResult<()> {
        if !self.supports(family) {
            return Err(RenderError::UnsupportedQueueFamily(family));
        }

        let mut state = self.state.lock();
        if let Some(result) = state.injected_submit_errors.pop_front() {
            log::debug!("Headless submit on {family:?} failing with injected {result:?}");
            return Err(RenderError::from_vk(result, "submission"));
        }

        if fence != vk::Fence::null() && state.fences.get(&fence) != Some(&FenceState::Unsignaled) {
            state.violation(format!(
                "submission on {family:?} used fence {fence:?} that is not unsignaled"
            ));
        }

        let mut commands = Vec::new();
        for command_buffer in submission.command_buffers {
            match state.command_buffers.get(command_buffer) {
                Some(buffer) if !buffer.recording => {
                    commands.extend(buffer.commands.iter().cloned());
                }
                _ => state.violation(format!(
                    "submitted {command_buffer:?} is not in the executable state"
                )),
            }
        }

        for wait in submission.wait {
            match state.semaphores.get_mut(&wait.semaphore) {
                Some(signal_pending) if *signal_pending => *signal_pending = false,
                _ => state.violation(format!(
                    "submission waits on {:?} which no earlier submission signals",
                    wait.semaphore
                )),
            }
        }
        for semaphore in submission.signal {
            if state.semaphores.insert(*semaphore, true) == Some(true) {
                state.violation(format!(
                    "{semaphore:?} signaled again before any submission waited on it"
                ));
            }
        }

        if fence != vk::Fence::null() {
            state.fences.insert(fence, FenceState::Pending);
        }
        let sequence = state.submissions.len() as u64;
        state.submissions.push(SubmissionLog {
            sequence,
            family,
            wait: submission.wait.to_vec(),
            command_buffers: submission.command_buffers.to_vec(),
            signal: submission.signal.to_vec(),
            fence,
            commands,
            completed: false,
        });
        log::trace!("Headless submission #{sequence} queued on {family:?}");

        if self.auto_complete.load(Ordering::SeqCst) {
            let index = state.submissions.len() - 1;
            state.complete(index);
            drop(state);
            self.completion.notify_all();
        }
        Ok(())
    }

    fn wait_idle(&self) -> RenderResult<()> {
        self.complete_all();
        Ok(())
    }
}

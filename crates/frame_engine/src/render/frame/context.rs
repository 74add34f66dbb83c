//! Per-slot aggregate of resource pools
//!
//! A `FrameContext` owns everything a frame slot hands out: command buffers
//! per queue family, descriptor sets, semaphores, fences, uniform buffers and
//! framebuffer references. A single [`FrameContext::reset`] recycles all of it
//! once the slot's fences are known to have signaled.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use super::command::CommandBufferManager;
use super::descriptor::{DescriptorLayoutInfo, DescriptorSetManager};
use super::framebuffer::FramebufferKeeper;
use super::sync::SyncObjectManager;
use super::uniform::UniformBufferManager;
use crate::core::config::FrameConfig;
use crate::render::backends::{GpuDevice, QueueFamily, SemaphoreWait};
use crate::render::release::ReleaseQueue;
use crate::render::resources::{Framebuffer, GpuBuffer};
use crate::render::task::TaskRegistry;
use crate::render::{RenderError, RenderResult};

/// Pool occupancy of one frame context
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameContextStats {
    /// Slot index
    pub slot: usize,
    /// Command buffers allocated across all queue families
    pub command_buffers: usize,
    /// Command buffers handed out since the last reset
    pub command_buffers_acquired: usize,
    /// Descriptor sets handed out since the last reset
    pub descriptor_sets_acquired: usize,
    /// Semaphores created
    pub semaphores: usize,
    /// Fences created
    pub fences: usize,
    /// Cached uniform buffers
    pub uniform_buffers: usize,
    /// Framebuffers kept alive for the current frame
    pub framebuffers: usize,
    /// Fences the next gate wait will block on
    pub outstanding_fences: usize,
}

struct FrameGate {
    frame_rendered: Option<vk::Fence>,
    submitted: Vec<vk::Fence>,
    waited: bool,
}

impl FrameGate {
    fn fences(&self) -> Vec<vk::Fence> {
        let mut fences: Vec<vk::Fence> =
            self.frame_rendered.iter().chain(self.submitted.iter()).copied().collect();
        fences.sort_unstable_by_key(|fence| ash::vk::Handle::as_raw(*fence));
        fences.dedup();
        fences
    }
}

/// Resources for one frame slot
pub struct FrameContext<D: GpuDevice> {
    slot: usize,
    device: Arc<D>,
    command_buffers: HashMap<QueueFamily, CommandBufferManager<D>>,
    descriptor_sets: DescriptorSetManager<D>,
    sync_objects: SyncObjectManager<D>,
    uniform_buffers: UniformBufferManager<D>,
    framebuffers: FramebufferKeeper<D>,
    gate: Mutex<FrameGate>,
    release: Option<ReleaseQueue>,
    fence_timeout_ns: u64,
}

impl<D: GpuDevice> FrameContext<D> {
    /// Create the pools for slot `slot`, sizing descriptors for `layouts`
    ///
    /// One command buffer manager is created per queue family the device
    /// supports.
    pub fn new(
        device: Arc<D>,
        slot: usize,
        layouts: &[DescriptorLayoutInfo],
        config: &FrameConfig,
    ) -> RenderResult<Self> {
        let command_buffers = device
            .supported_queue_families()
            .families()
            .map(|family| Ok((family, CommandBufferManager::new(device.clone(), family)?)))
            .collect::<RenderResult<HashMap<_, _>>>()?;

        let per_layout = config.descriptor_sets_per_layout;
        let descriptor_sets = DescriptorSetManager::new(device.clone(), layouts, per_layout)?;

        log::debug!(
            "Frame context {slot} ready: {} queue families, {} descriptor layouts",
            command_buffers.len(),
            layouts.len()
        );

        Ok(Self {
            slot,
            sync_objects: SyncObjectManager::new(device.clone()),
            uniform_buffers: UniformBufferManager::new(device.clone()),
            framebuffers: FramebufferKeeper::new(),
            command_buffers,
            descriptor_sets,
            gate: Mutex::new(FrameGate {
                frame_rendered: None,
                submitted: Vec::new(),
                waited: true,
            }),
            release: None,
            fence_timeout_ns: config.fence_timeout_ns,
            device,
        })
    }

    /// Create a context sized for every task in `registry`
    pub fn from_registry(
        device: Arc<D>,
        slot: usize,
        registry: &TaskRegistry,
        config: &FrameConfig,
    ) -> RenderResult<Self> {
        Self::new(device, slot, &registry.layouts(), config)
    }

    /// Notify `release` of fences retired by this slot's gate
    #[must_use]
    pub fn with_release_queue(mut self, release: ReleaseQueue) -> Self {
        self.release = Some(release);
        self
    }

    /// A command buffer for `family`, ready to record
    pub fn acquire_command_buffer(&self, family: QueueFamily) -> RenderResult<vk::CommandBuffer> {
        self.command_buffers
            .get(&family)
            .ok_or(RenderError::UnsupportedQueueFamily(family))?
            .acquire_buffer()
    }

    /// A descriptor set with `layout`, valid until the next reset
    pub fn acquire_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> RenderResult<vk::DescriptorSet> {
        self.descriptor_sets.acquire_set(layout)
    }

    /// A semaphore for one signal/wait pair
    pub fn acquire_semaphore(&self) -> RenderResult<vk::Semaphore> {
        self.sync_objects.acquire_semaphore()
    }

    /// An unsignaled fence
    pub fn acquire_fence(&self) -> RenderResult<vk::Fence> {
        self.sync_objects.acquire_fence()
    }

    /// The uniform buffer cached under `id`
    pub fn acquire_uniform_buffer(
        &self,
        id: u32,
        size: vk::DeviceSize,
    ) -> RenderResult<Arc<GpuBuffer<D>>> {
        self.uniform_buffers.acquire_buffer(id, size)
    }

    /// Keep `framebuffer` alive until this slot is reset
    pub fn register_framebuffer(&self, framebuffer: Arc<Framebuffer<D>>) {
        self.framebuffers.register_framebuffer(framebuffer);
    }

    /// Mark `fence` as the one signaling completion of this slot's frame
    pub fn set_frame_rendered(&self, fence: vk::Fence) {
        let mut gate = self.gate.lock();
        gate.frame_rendered = Some(fence);
        gate.waited = false;
    }

    /// Record a fence submitted from this slot; the gate waits it too
    pub fn record_submission(&self, fence: vk::Fence) {
        let mut gate = self.gate.lock();
        gate.submitted.push(fence);
        gate.waited = false;
    }

    /// Record which semaphores a submission from this slot waits on and signals
    ///
    /// A signal nothing has waited on by the next reset is not reused.
    pub fn track_semaphores(&self, waits: &[SemaphoreWait], signals: &[vk::Semaphore]) {
        self.sync_objects.track_submission(waits, signals);
    }

    /// Block until every fence submitted from this slot has signaled
    pub fn wait_frame_rendered(&self) -> RenderResult<()> {
        let mut gate = self.gate.lock();
        if gate.waited {
            return Ok(());
        }

        let fences = gate.fences();
        for &fence in &fences {
            self.device.wait_for_fence(fence, self.fence_timeout_ns).map_err(|err| {
                log::error!("Frame slot {} gate wait on {fence:?} failed: {err}", self.slot);
                err
            })?;
        }
        gate.waited = true;
        log::trace!("Frame slot {} gate passed ({} fences)", self.slot, fences.len());

        if let Some(release) = &self.release {
            release.retire(fences);
        }
        Ok(())
    }

    /// Recycle every pool of this slot
    ///
    /// Must follow [`FrameContext::wait_frame_rendered`]; resetting with an
    /// unwaited fence fails with [`RenderError::FrameGateViolation`]. The
    /// uniform buffer cache is kept.
    pub fn reset(&self) -> RenderResult<()> {
        let mut gate = self.gate.lock();
        if !gate.waited {
            log::error!("Frame slot {} reset while its GPU work may still be running", self.slot);
            return Err(RenderError::FrameGateViolation { slot: self.slot });
        }

        for manager in self.command_buffers.values() {
            manager.reset()?;
        }
        self.descriptor_sets.reset()?;
        self.sync_objects.reset()?;
        let released = self.framebuffers.reset();

        gate.frame_rendered = None;
        gate.submitted.clear();
        log::trace!("Frame slot {} reset ({released} framebuffers released)", self.slot);
        Ok(())
    }

    /// Drop the cached uniform buffers at teardown
    ///
    /// Like [`FrameContext::reset`], only valid once the gate has been waited.
    pub fn release_uniform_buffers(&self) -> RenderResult<()> {
        if !self.gate.lock().waited {
            return Err(RenderError::FrameGateViolation { slot: self.slot });
        }
        let released = self.uniform_buffers.len();
        self.uniform_buffers.reset();
        log::debug!("Frame slot {} released {released} uniform buffers", self.slot);
        Ok(())
    }

    /// Slot index in the rotation
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// The device this context allocates from
    pub const fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Fence last passed to [`FrameContext::set_frame_rendered`]
    pub fn frame_rendered(&self) -> Option<vk::Fence> {
        self.gate.lock().frame_rendered
    }

    /// Pool occupancy
    pub fn stats(&self) -> FrameContextStats {
        let outstanding_fences = {
            let gate = self.gate.lock();
            if gate.waited { 0 } else { gate.fences().len() }
        };
        FrameContextStats {
            slot: self.slot,
            command_buffers: self.command_buffers.values().map(CommandBufferManager::len).sum(),
            command_buffers_acquired: self
                .command_buffers
                .values()
                .map(CommandBufferManager::acquired_len)
                .sum(),
            descriptor_sets_acquired: self.descriptor_sets.acquired_len(),
            semaphores: self.sync_objects.semaphore_count(),
            fences: self.sync_objects.fence_count(),
            uniform_buffers: self.uniform_buffers.len(),
            framebuffers: self.framebuffers.len(),
            outstanding_fences,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::{HeadlessDevice, QueueFamilies, Submission};

    fn context(families: QueueFamilies) -> (Arc<HeadlessDevice>, FrameContext<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::new(families));
        let context = FrameContext::new(device.clone(), 0, &[], &FrameConfig::default()).unwrap();
        (device, context)
    }

    fn submit_with(device: &HeadlessDevice, context: &FrameContext<HeadlessDevice>) -> vk::Fence {
        let fence = context.acquire_fence().unwrap();
        let empty = Submission { wait: &[], command_buffers: &[], signal: &[] };
        device.submit(QueueFamily::Graphics, &empty, fence).unwrap();
        context.record_submission(fence);
        fence
    }

    #[test]
    fn test_only_supported_families_are_populated() {
        let (_device, context) = context(QueueFamilies::GRAPHICS | QueueFamilies::TRANSFER);
        assert!(context.acquire_command_buffer(QueueFamily::Graphics).is_ok());
        assert!(context.acquire_command_buffer(QueueFamily::Transfer).is_ok());
        assert_eq!(
            context.acquire_command_buffer(QueueFamily::Compute),
            Err(RenderError::UnsupportedQueueFamily(QueueFamily::Compute))
        );
    }

    #[test]
    fn test_reset_before_wait_is_a_gate_violation() {
        let (device, context) = context(QueueFamilies::all());
        let fence = submit_with(&device, &context);
        context.set_frame_rendered(fence);

        assert_eq!(context.reset(), Err(RenderError::FrameGateViolation { slot: 0 }));

        device.complete_all();
        context.wait_frame_rendered().unwrap();
        context.reset().unwrap();
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_gate_waits_every_submitted_fence() {
        let (device, context) = context(QueueFamilies::all());
        let first = submit_with(&device, &context);
        let second = submit_with(&device, &context);
        context.set_frame_rendered(second);
        assert_eq!(context.stats().outstanding_fences, 2);

        assert_eq!(device.complete_next(), Some(0));
        assert!(device.fence_signaled(first).unwrap());
        let short_timeout = FrameConfig::default().with_fence_timeout_ns(1_000_000);
        let other = FrameContext::new(device.clone(), 1, &[], &short_timeout).unwrap();
        other.record_submission(second);
        assert!(matches!(other.wait_frame_rendered(), Err(RenderError::Timeout { .. })));

        device.complete_all();
        context.wait_frame_rendered().unwrap();
        assert_eq!(context.stats().outstanding_fences, 0);
    }

    #[test]
    fn test_reset_recycles_everything_but_uniforms() {
        let (device, context) = context(QueueFamilies::all());
        let command_buffer = context.acquire_command_buffer(QueueFamily::Graphics).unwrap();
        let semaphore = context.acquire_semaphore().unwrap();
        context.acquire_uniform_buffer(5, 64).unwrap();
        let framebuffer =
            Arc::new(Framebuffer::new(device.clone(), device.fabricate(), &[], 8, 8).unwrap());
        context.register_framebuffer(framebuffer);

        let stats = context.stats();
        assert_eq!(stats.command_buffers_acquired, 1);
        assert_eq!(stats.framebuffers, 1);

        context.reset().unwrap();
        let stats = context.stats();
        assert_eq!(stats.command_buffers_acquired, 0);
        assert_eq!(stats.framebuffers, 0);
        assert_eq!(stats.uniform_buffers, 1);
        assert_eq!(device.live_objects().framebuffers, 0);

        assert_eq!(context.acquire_command_buffer(QueueFamily::Graphics).unwrap(), command_buffer);
        assert_eq!(context.acquire_semaphore().unwrap(), semaphore);
        assert_eq!(context.acquire_uniform_buffer(5, 64).unwrap().size(), 64);
    }

    #[test]
    fn test_uniform_buffers_released_only_after_gate() {
        let (device, context) = context(QueueFamilies::all());
        context.acquire_uniform_buffer(1, 32).unwrap();
        context.set_frame_rendered(submit_with(&device, &context));

        let early = context.release_uniform_buffers();
        assert_eq!(early, Err(RenderError::FrameGateViolation { slot: 0 }));
        assert_eq!(device.live_objects().buffers, 1);

        device.complete_all();
        context.wait_frame_rendered().unwrap();
        context.release_uniform_buffers().unwrap();
        assert_eq!(context.stats().uniform_buffers, 0);
        assert_eq!(device.live_objects().buffers, 0);
    }

    #[test]
    fn test_fresh_context_passes_gate() {
        let (_device, context) = context(QueueFamilies::all());
        context.wait_frame_rendered().unwrap();
        context.reset().unwrap();
        assert_eq!(context.frame_rendered(), None);
    }
}

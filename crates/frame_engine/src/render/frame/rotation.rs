//! Frames-in-flight rotation driver
//!
//! Frame `i` uses slot `i mod N`. Before a slot is reused its gate is waited,
//! so at most N frames are ever in flight, then the slot is reset and handed
//! to the caller's recording closure.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;

use super::context::FrameContext;
use crate::core::config::FrameConfig;
use crate::render::backends::GpuDevice;
use crate::render::release::ReleaseQueue;
use crate::render::resources::Framebuffer;
use crate::render::task::TaskRegistry;
use crate::render::{RenderError, RenderResult};

/// One frame slot: its context plus optional output targets
pub struct FrameSlot<D: GpuDevice> {
    context: Arc<FrameContext<D>>,
    targets: Option<Arc<Framebuffer<D>>>,
}

impl<D: GpuDevice> FrameSlot<D> {
    /// The slot's frame context
    pub const fn context(&self) -> &Arc<FrameContext<D>> {
        &self.context
    }

    /// Framebuffer this slot renders into, if one was assigned
    pub const fn targets(&self) -> Option<&Arc<Framebuffer<D>>> {
        self.targets.as_ref()
    }

    /// Slot index
    pub fn index(&self) -> usize {
        self.context.slot()
    }
}

/// Result of one tick of the rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Work was submitted and the slot is gated on `fence`
    Rendered {
        /// Frame number
        frame: u64,
        /// Slot used
        slot: usize,
        /// Frame-rendered fence
        fence: vk::Fence,
    },
    /// A recoverable error skipped the frame
    Skipped {
        /// Frame number
        frame: u64,
        /// Slot used
        slot: usize,
        /// Status that caused the skip
        status: vk::Result,
    },
}

/// Drives N frame slots in round-robin order
pub struct FrameRotation<D: GpuDevice> {
    device: Arc<D>,
    slots: Vec<FrameSlot<D>>,
    frame_number: u64,
    release: ReleaseQueue,
    shut_down: bool,
}

impl<D: GpuDevice> FrameRotation<D> {
    /// Create one frame context per slot, sized for the tasks in `registry`
    pub fn new(device: Arc<D>, registry: &TaskRegistry, config: FrameConfig) -> RenderResult<Self> {
        config.validate()?;

        let release = ReleaseQueue::spawn(
            device.clone(),
            Duration::from_millis(config.release_poll_interval_ms),
            &config.release_thread_name,
        )?;

        let slots = (0..config.frames_in_flight)
            .map(|slot| {
                let context = FrameContext::from_registry(device.clone(), slot, registry, &config)?
                    .with_release_queue(release.clone());
                Ok(FrameSlot { context: Arc::new(context), targets: None })
            })
            .collect::<RenderResult<Vec<_>>>()?;

        log::info!(
            "Frame rotation ready: {} frames in flight, {} registered tasks",
            slots.len(),
            registry.len()
        );

        Ok(Self { device, slots, frame_number: 0, release, shut_down: false })
    }

    /// Run one frame
    ///
    /// Waits the gate of the slot being reused, resets it, then calls
    /// `record` with the slot and the release queue. `record` returns the
    /// fence that signals when the frame's work is complete. Recoverable
    /// errors skip the frame; every other error is returned.
    pub fn render_frame<F>(&mut self, record: F) -> RenderResult<FrameOutcome>
    where
        F: FnOnce(&FrameSlot<D>, &ReleaseQueue) -> RenderResult<vk::Fence>,
    {
        let frame = self.frame_number;
        let index = self.slot_index(frame);
        let slot = &self.slots[index];

        slot.context.wait_frame_rendered()?;
        slot.context.reset()?;
        self.frame_number += 1;

        match record(slot, &self.release) {
            Ok(fence) => {
                slot.context.set_frame_rendered(fence);
                log::trace!("Frame {frame} submitted on slot {index}");
                Ok(FrameOutcome::Rendered { frame, slot: index, fence })
            }
            Err(err) if err.is_recoverable() => {
                log::warn!("Frame {frame} skipped on slot {index}: {err}");
                let status = err.status().unwrap_or(vk::Result::ERROR_UNKNOWN);
                Ok(FrameOutcome::Skipped { frame, slot: index, status })
            }
            Err(err) => {
                log::error!("Frame {frame} failed on slot {index}: {err}");
                Err(err)
            }
        }
    }

    /// Assign the framebuffer slot `index` renders into
    pub fn set_slot_targets(
        &mut self,
        index: usize,
        targets: Option<Arc<Framebuffer<D>>>,
    ) -> RenderResult<()> {
        let slot = self.slots.get_mut(index).ok_or_else(|| RenderError::InvalidOperation {
            reason: format!("Frame slot {index} does not exist"),
        })?;
        slot.targets = targets;
        Ok(())
    }

    /// Wait for the device, pass every gate and release uniform buffers and all deferred resources
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.device.wait_idle()?;
        for slot in &self.slots {
            slot.context.wait_frame_rendered()?;
            slot.context.release_uniform_buffers()?;
        }
        let flushed = self.release.flush();
        self.release.shutdown();
        self.shut_down = true;
        log::info!(
            "Frame rotation shut down after {} frames ({flushed} bundles flushed)",
            self.frame_number
        );
        Ok(())
    }

    /// Slot used by frame `frame`
    pub fn slot_index(&self, frame: u64) -> usize {
        (frame % self.slots.len() as u64) as usize
    }

    /// Slot by index
    pub fn slot(&self, index: usize) -> Option<&FrameSlot<D>> {
        self.slots.get(index)
    }

    /// Number of slots
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Frames started so far
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// The shared release queue
    pub const fn release_queue(&self) -> &ReleaseQueue {
        &self.release
    }

    /// The device
    pub const fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: GpuDevice> Drop for FrameRotation<D> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("Frame rotation shutdown failed: {err}");
            self.release.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::{HeadlessDevice, QueueFamilies, QueueFamily, Submission};

    fn rotation(frames: usize) -> (Arc<HeadlessDevice>, FrameRotation<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let config = FrameConfig::default().with_frames_in_flight(frames);
        let rotation = FrameRotation::new(device.clone(), &TaskRegistry::new(), config).unwrap();
        (device, rotation)
    }

    fn submit_frame(
        device: &HeadlessDevice,
        slot: &FrameSlot<HeadlessDevice>,
    ) -> RenderResult<vk::Fence> {
        let fence = slot.context().acquire_fence()?;
        let empty = Submission { wait: &[], command_buffers: &[], signal: &[] };
        device.submit(QueueFamily::Graphics, &empty, fence)?;
        slot.context().record_submission(fence);
        Ok(fence)
    }

    #[test]
    fn test_slots_rotate_round_robin() {
        let (device, mut rotation) = rotation(3);
        device.set_auto_complete(true);
        let slots: Vec<usize> = (0..6)
            .map(|_| match rotation.render_frame(|slot, _| submit_frame(&device, slot)).unwrap() {
                FrameOutcome::Rendered { slot, .. } => slot,
                FrameOutcome::Skipped { .. } => panic!("unexpected skip"),
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2]);
        rotation.shutdown().unwrap();
    }

    #[test]
    fn test_transient_error_skips_frame() {
        let (device, mut rotation) = rotation(2);
        device.set_auto_complete(true);
        device.inject_submit_error(vk::Result::ERROR_OUT_OF_DATE_KHR);

        let outcome = rotation.render_frame(|slot, _| submit_frame(&device, slot)).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Skipped { frame: 0, slot: 0, status: vk::Result::ERROR_OUT_OF_DATE_KHR }
        );

        let outcome = rotation.render_frame(|slot, _| submit_frame(&device, slot)).unwrap();
        assert!(matches!(outcome, FrameOutcome::Rendered { frame: 1, slot: 1, .. }));
    }

    #[test]
    fn test_fatal_error_is_returned() {
        let (device, mut rotation) = rotation(2);
        device.inject_submit_error(vk::Result::ERROR_DEVICE_LOST);
        let result = rotation.render_frame(|slot, _| submit_frame(&device, slot));
        assert_eq!(result, Err(RenderError::DeviceLost));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let config = FrameConfig::default().with_frames_in_flight(0);
        let result = FrameRotation::new(device, &TaskRegistry::new(), config);
        assert!(matches!(result, Err(RenderError::InvalidConfig(_))));
    }

    #[test]
    fn test_shutdown_releases_uniform_buffers() {
        let (device, mut rotation) = rotation(2);
        device.set_auto_complete(true);
        for _ in 0..2 {
            rotation
                .render_frame(|slot, _| {
                    slot.context().acquire_uniform_buffer(0, 64)?;
                    submit_frame(&device, slot)
                })
                .unwrap();
        }
        assert_eq!(device.live_objects().buffers, 2);

        rotation.shutdown().unwrap();
        assert_eq!(device.live_objects().buffers, 0);
        assert_eq!(rotation.slot(0).unwrap().context().stats().uniform_buffers, 0);
    }

    #[test]
    fn test_slot_targets() {
        let (device, mut rotation) = rotation(2);
        let target =
            Arc::new(Framebuffer::new(device.clone(), device.fabricate(), &[], 4, 4).unwrap());
        rotation.set_slot_targets(1, Some(target)).unwrap();
        assert!(rotation.slot(1).unwrap().targets().is_some());
        assert!(rotation.slot(0).unwrap().targets().is_none());
        assert!(rotation.set_slot_targets(2, None).is_err());
    }
}

//! Staging upload task

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use super::{CommandRecorder, RenderTask, TaskCommands, TaskRegistry, TaskType};
use crate::render::backends::GpuDevice;
use crate::render::frame::{DescriptorLayoutInfo, FrameContext};
use crate::render::release::ReleaseBundle;
use crate::render::resources::GpuBuffer;
use crate::render::{RenderError, RenderResult};

struct PendingCopy<D: GpuDevice> {
    staging: GpuBuffer<D>,
    dst: Arc<GpuBuffer<D>>,
    size: vk::DeviceSize,
}

/// Copies staging buffers into device buffers
///
/// Staging buffers move into the submission's release bundle and are
/// destroyed once the copy has completed.
pub struct TransferUpload<D: GpuDevice> {
    copies: Vec<PendingCopy<D>>,
    retained: ReleaseBundle,
}

impl<D: GpuDevice> TransferUpload<D> {
    /// Create an upload task with no copies
    pub fn new() -> Self {
        Self { copies: Vec::new(), retained: ReleaseBundle::new() }
    }

    /// Register a transfer task
    pub fn task(registry: &mut TaskRegistry) -> RenderTask<D, Self> {
        RenderTask::new(registry, "transfer upload", Self::new())
    }

    /// Copies waiting for the next run
    pub fn pending_copies(&self) -> usize {
        self.copies.len()
    }
}

impl<D: GpuDevice> Default for TransferUpload<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: GpuDevice> TaskCommands<D> for TransferUpload<D> {
    const TASK_TYPE: TaskType = TaskType::Transfer;

    fn layout(&self) -> Option<DescriptorLayoutInfo> {
        None
    }

    fn record(
        &mut self,
        recorder: &mut CommandRecorder<'_, D>,
        _frame: &FrameContext<D>,
    ) -> RenderResult<()> {
        for copy in self.copies.drain(..) {
            recorder.copy_buffer(copy.staging.handle(), copy.dst.handle(), copy.size)?;
            self.retained.retain(copy.staging);
            self.retained.retain(copy.dst);
        }
        Ok(())
    }

    fn take_retained(&mut self) -> ReleaseBundle {
        self.copies.clear();
        std::mem::take(&mut self.retained)
    }
}

impl<D: GpuDevice> RenderTask<D, TransferUpload<D>> {
    /// Copy the first `size` bytes of `staging` into `dst`
    pub fn prepare_copy(
        &mut self,
        staging: GpuBuffer<D>,
        dst: Arc<GpuBuffer<D>>,
        size: vk::DeviceSize,
    ) -> RenderResult<()> {
        if size == 0 {
            return Err(RenderError::invalid("copy of zero bytes"));
        }
        if size > staging.size() || size > dst.size() {
            return Err(RenderError::InvalidOperation {
                reason: format!(
                    "copy of {size} bytes exceeds staging ({}) or destination ({})",
                    staging.size(),
                    dst.size()
                ),
            });
        }
        self.mark_prepared()?;
        self.commands.copies.push(PendingCopy { staging, dst, size });
        Ok(())
    }

    /// Stage `data` through a new host-visible buffer and copy it into `dst`
    pub fn prepare_upload<T: Pod>(
        &mut self,
        data: &[T],
        dst: Arc<GpuBuffer<D>>,
    ) -> RenderResult<()> {
        if data.is_empty() {
            return Err(RenderError::InvalidOperation {
                reason: format!("task '{}' asked to upload no data", self.label),
            });
        }
        let device = self
            .frame
            .as_ref()
            .map(|frame| frame.device().clone())
            .ok_or_else(|| RenderError::InvalidTaskState {
                reason: format!("task '{}' has no frame context", self.label),
            })?;
        let staging = GpuBuffer::staging(device, data)?;
        let size = staging.size();
        self.prepare_copy(staging, dst, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameConfig;
    use crate::render::backends::{Command, HeadlessDevice, QueueFamilies};
    use crate::render::task::TaskState;

    type Upload = RenderTask<HeadlessDevice, TransferUpload<HeadlessDevice>>;

    fn bound_upload(device: &Arc<HeadlessDevice>) -> (Upload, Arc<FrameContext<HeadlessDevice>>) {
        let mut registry = TaskRegistry::new();
        let mut task = TransferUpload::task(&mut registry);
        let config = FrameConfig::default();
        let frame = FrameContext::from_registry(device.clone(), 0, &registry, &config);
        let frame = Arc::new(frame.unwrap());
        task.set_frame_context(frame.clone()).unwrap();
        (task, frame)
    }

    fn device_buffer(
        device: &Arc<HeadlessDevice>,
        size: vk::DeviceSize,
    ) -> Arc<GpuBuffer<HeadlessDevice>> {
        let usage = vk::BufferUsageFlags::TRANSFER_DST;
        Arc::new(GpuBuffer::new(device.clone(), size, usage, false).unwrap())
    }

    #[test]
    fn test_staging_moves_into_release_bundle() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let (mut task, _frame) = bound_upload(&device);
        let dst = device_buffer(&device, 16);

        task.prepare_upload(&[1u32, 2, 3, 4], dst.clone()).unwrap();
        assert_eq!(task.commands().pending_copies(), 1);
        let record = task.run().unwrap();
        assert_eq!(task.commands().pending_copies(), 0);

        assert_eq!(record.retained.len(), 2);
        assert_eq!(device.live_objects().buffers, 2);
        let commands = &device.submissions()[0].commands;
        assert!(matches!(
            commands[0],
            Command::CopyBuffer { dst: copied, size: 16, .. } if copied == dst.handle()
        ));

        device.complete_all();
        drop(record);
        assert_eq!(device.live_objects().buffers, 1);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_oversized_copy_rejected() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let (mut task, _frame) = bound_upload(&device);

        assert!(task.prepare_upload(&[0u8; 8], device_buffer(&device, 4)).is_err());
        assert_eq!(task.state(), TaskState::FrameContextBound);
    }

    #[test]
    fn test_empty_upload_rejected() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let (mut task, _frame) = bound_upload(&device);
        let empty: &[u32] = &[];

        let err = task.prepare_upload(empty, device_buffer(&device, 4)).unwrap_err();
        assert!(matches!(err, RenderError::InvalidOperation { .. }));
        assert_eq!(task.state(), TaskState::FrameContextBound);
        assert_eq!(task.commands().pending_copies(), 0);
        assert_eq!(device.live_objects().buffers, 0);
    }
}

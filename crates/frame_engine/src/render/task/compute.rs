//! Compute dispatch task

use std::sync::Arc;

use ash::vk;

use super::{CommandRecorder, PipelineDesc, RenderTask, TaskCommands, TaskRegistry, TaskType};
use crate::render::backends::GpuDevice;
use crate::render::frame::{DescriptorLayoutInfo, FrameContext};
use crate::render::release::ReleaseBundle;
use crate::render::resources::GpuBuffer;
use crate::render::RenderResult;

/// Binds buffers to a compute pipeline and dispatches work groups
pub struct ComputeDispatch<D: GpuDevice> {
    pipeline: PipelineDesc,
    groups: (u32, u32, u32),
    inputs: Vec<(u32, Arc<GpuBuffer<D>>)>,
    retained: ReleaseBundle,
}

impl<D: GpuDevice> ComputeDispatch<D> {
    /// Create a dispatch for `pipeline`
    pub fn new(pipeline: PipelineDesc) -> Self {
        Self { pipeline, groups: (1, 1, 1), inputs: Vec::new(), retained: ReleaseBundle::new() }
    }

    /// Register a compute task for `pipeline`
    pub fn task(
        registry: &mut TaskRegistry,
        label: impl Into<String>,
        pipeline: PipelineDesc,
    ) -> RenderTask<D, Self> {
        RenderTask::new(registry, label, Self::new(pipeline))
    }

    /// Work group counts
    pub const fn groups(&self) -> (u32, u32, u32) {
        self.groups
    }

    fn descriptor_type(&self, binding: u32) -> vk::DescriptorType {
        self.pipeline
            .descriptor
            .as_ref()
            .and_then(|info| info.bindings.iter().find(|b| b.binding == binding))
            .map_or(vk::DescriptorType::STORAGE_BUFFER, |b| b.descriptor_type)
    }
}

impl<D: GpuDevice> TaskCommands<D> for ComputeDispatch<D> {
    const TASK_TYPE: TaskType = TaskType::Compute;

    fn layout(&self) -> Option<DescriptorLayoutInfo> {
        self.pipeline.descriptor.clone()
    }

    fn record(
        &mut self,
        recorder: &mut CommandRecorder<'_, D>,
        frame: &FrameContext<D>,
    ) -> RenderResult<()> {
        recorder.bind_pipeline(vk::PipelineBindPoint::COMPUTE, self.pipeline.pipeline)?;

        if let Some(info) = &self.pipeline.descriptor {
            let set = frame.acquire_descriptor_set(info.layout)?;
            for (binding, buffer) in &self.inputs {
                frame.device().update_descriptor_buffer(
                    set,
                    *binding,
                    self.descriptor_type(*binding),
                    buffer.handle(),
                    buffer.size(),
                );
            }
            let layout = self.pipeline.pipeline_layout;
            recorder.bind_descriptor_set(vk::PipelineBindPoint::COMPUTE, layout, set)?;
        }

        for (_, buffer) in &self.inputs {
            self.retained.retain(buffer.clone());
        }

        let (x, y, z) = self.groups;
        recorder.dispatch(x, y, z)
    }

    fn take_retained(&mut self) -> ReleaseBundle {
        std::mem::take(&mut self.retained)
    }
}

impl<D: GpuDevice> RenderTask<D, ComputeDispatch<D>> {
    /// Bind `buffers` to their bindings in set 0
    pub fn prepare_inputs(&mut self, buffers: Vec<(u32, Arc<GpuBuffer<D>>)>) -> RenderResult<()> {
        self.mark_prepared()?;
        self.commands.inputs = buffers;
        Ok(())
    }

    /// Dispatch `x * y * z` work groups
    pub fn prepare_groups(&mut self, x: u32, y: u32, z: u32) -> RenderResult<()> {
        self.mark_prepared()?;
        self.commands.groups = (x, y, z);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameConfig;
    use crate::render::backends::{Command, HeadlessDevice, QueueFamilies, QueueFamily};

    #[test]
    fn test_dispatch_binds_inputs() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let mut registry = TaskRegistry::new();
        let layout = device.fabricate();
        let info = DescriptorLayoutInfo::storage_buffer(layout);
        let pipeline = PipelineDesc::compute(device.fabricate(), device.fabricate(), Some(info));
        let mut task = ComputeDispatch::task(&mut registry, "simulate", pipeline);
        let config = FrameConfig::default();
        let frame = FrameContext::from_registry(device.clone(), 0, &registry, &config);
        let frame = Arc::new(frame.unwrap());
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        let particles = Arc::new(GpuBuffer::new(device.clone(), 256, usage, false).unwrap());

        task.set_frame_context(frame).unwrap();
        task.prepare_inputs(vec![(0, particles.clone())]).unwrap();
        task.prepare_groups(4, 2, 1).unwrap();
        let record = task.run().unwrap();
        assert_eq!(record.retained.len(), 1);

        let submission = &device.submissions()[0];
        assert_eq!(submission.family, QueueFamily::Compute);
        assert_eq!(submission.commands.last(), Some(&Command::Dispatch { x: 4, y: 2, z: 1 }));
        let set = submission
            .commands
            .iter()
            .find_map(|command| match command {
                Command::BindDescriptorSet { set, .. } => Some(*set),
                _ => None,
            })
            .unwrap();
        assert_eq!(device.descriptor_binding(set, 0), Some(particles.handle()));
    }
}

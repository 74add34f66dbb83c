//! Render pass task

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use super::{CommandRecorder, RenderTask, TaskCommands, TaskRegistry, TaskType};
use crate::render::backends::GpuDevice;
use crate::render::frame::{DescriptorLayoutInfo, FrameContext};
use crate::render::release::ReleaseBundle;
use crate::render::resources::{Framebuffer, GpuBuffer};
use crate::render::{RenderError, RenderResult};

/// Pipeline objects a task binds, created by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDesc {
    /// Pipeline object
    pub pipeline: vk::Pipeline,
    /// Layout the pipeline was created with
    pub pipeline_layout: vk::PipelineLayout,
    /// Render pass for graphics pipelines; null for compute
    pub render_pass: vk::RenderPass,
    /// Set 0 layout, if the pipeline uses descriptors
    pub descriptor: Option<DescriptorLayoutInfo>,
}

impl PipelineDesc {
    /// Graphics pipeline used inside `render_pass`
    pub const fn graphics(
        pipeline: vk::Pipeline,
        pipeline_layout: vk::PipelineLayout,
        render_pass: vk::RenderPass,
        descriptor: Option<DescriptorLayoutInfo>,
    ) -> Self {
        Self { pipeline, pipeline_layout, render_pass, descriptor }
    }

    /// Compute pipeline
    pub fn compute(
        pipeline: vk::Pipeline,
        pipeline_layout: vk::PipelineLayout,
        descriptor: Option<DescriptorLayoutInfo>,
    ) -> Self {
        Self { pipeline, pipeline_layout, render_pass: vk::RenderPass::null(), descriptor }
    }
}

struct Geometry<D: GpuDevice> {
    vertices: Arc<GpuBuffer<D>>,
    indices: Option<Arc<GpuBuffer<D>>>,
    count: u32,
    instances: u32,
}

/// Draws into a framebuffer with one pipeline
///
/// Without geometry the pass draws a single fullscreen triangle, which is
/// what composite passes sampling an earlier target need.
pub struct GraphicsPass<D: GpuDevice> {
    pipeline: PipelineDesc,
    clear_color: [f32; 4],
    geometry: Option<Geometry<D>>,
    uniforms: Option<(u32, Vec<u8>)>,
    output: Option<Arc<Framebuffer<D>>>,
    retained: ReleaseBundle,
}

impl<D: GpuDevice> GraphicsPass<D> {
    /// Create a pass for `pipeline`
    pub fn new(pipeline: PipelineDesc) -> Self {
        Self {
            pipeline,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            geometry: None,
            uniforms: None,
            output: None,
            retained: ReleaseBundle::new(),
        }
    }

    /// Register a graphics task for `pipeline`
    pub fn task(
        registry: &mut TaskRegistry,
        label: impl Into<String>,
        pipeline: PipelineDesc,
    ) -> RenderTask<D, Self> {
        RenderTask::new(registry, label, Self::new(pipeline))
    }

    /// Color the first attachment is cleared to
    #[must_use]
    pub const fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    /// Pipeline description
    pub const fn pipeline(&self) -> &PipelineDesc {
        &self.pipeline
    }
}

impl<D: GpuDevice> TaskCommands<D> for GraphicsPass<D> {
    const TASK_TYPE: TaskType = TaskType::Graphics;

    fn layout(&self) -> Option<DescriptorLayoutInfo> {
        self.pipeline.descriptor.clone()
    }

    fn record(
        &mut self,
        recorder: &mut CommandRecorder<'_, D>,
        frame: &FrameContext<D>,
    ) -> RenderResult<()> {
        let output = self
            .output
            .clone()
            .ok_or_else(|| RenderError::InvalidTaskState {
                reason: "graphics pass has no output".to_string(),
            })?;
        frame.register_framebuffer(output.clone());

        let descriptor_set = match &self.pipeline.descriptor {
            Some(info) => {
                let set = frame.acquire_descriptor_set(info.layout)?;
                if let Some((id, bytes)) = &self.uniforms {
                    let buffer = frame.acquire_uniform_buffer(*id, bytes.len() as vk::DeviceSize)?;
                    buffer.write_bytes(0, bytes)?;
                    frame.device().update_descriptor_buffer(
                        set,
                        0,
                        vk::DescriptorType::UNIFORM_BUFFER,
                        buffer.handle(),
                        buffer.size(),
                    );
                }
                Some(set)
            }
            None => None,
        };

        let mut pass = recorder.begin_render_pass(
            self.pipeline.render_pass,
            output.handle(),
            output.extent(),
            self.clear_color,
        )?;
        pass.bind_pipeline(self.pipeline.pipeline);
        if let Some(set) = descriptor_set {
            pass.bind_descriptor_set(self.pipeline.pipeline_layout, set);
        }

        match &self.geometry {
            Some(geometry) => {
                pass.bind_vertex_buffer(geometry.vertices.handle(), 0);
                self.retained.retain(geometry.vertices.clone());
                match &geometry.indices {
                    Some(indices) => {
                        pass.bind_index_buffer(indices.handle(), 0, vk::IndexType::UINT32);
                        pass.draw_indexed(geometry.count, geometry.instances);
                        self.retained.retain(indices.clone());
                    }
                    None => pass.draw(geometry.count, geometry.instances),
                }
            }
            None => pass.draw(3, 1),
        }
        Ok(())
    }

    fn take_retained(&mut self) -> ReleaseBundle {
        std::mem::take(&mut self.retained)
    }
}

impl<D: GpuDevice> RenderTask<D, GraphicsPass<D>> {
    /// Draw `count` vertices (or indices, with an index buffer) per instance
    pub fn prepare_geometry(
        &mut self,
        vertices: Arc<GpuBuffer<D>>,
        indices: Option<Arc<GpuBuffer<D>>>,
        count: u32,
        instances: u32,
    ) -> RenderResult<()> {
        self.mark_prepared()?;
        self.commands.geometry = Some(Geometry { vertices, indices, count, instances });
        Ok(())
    }

    /// Upload `value` into the frame's uniform buffer `id` when recording
    pub fn prepare_uniforms<T: Pod>(&mut self, id: u32, value: &T) -> RenderResult<()> {
        if self.commands.pipeline.descriptor.is_none() {
            return Err(RenderError::InvalidOperation {
                reason: format!("task '{}' has no descriptor layout for uniforms", self.label),
            });
        }
        self.mark_prepared()?;
        self.commands.uniforms = Some((id, bytemuck::bytes_of(value).to_vec()));
        Ok(())
    }

    /// Render into `framebuffer`
    pub fn prepare_output(&mut self, framebuffer: Arc<Framebuffer<D>>) -> RenderResult<()> {
        self.mark_prepared()?;
        self.commands.output = Some(framebuffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameConfig;
    use crate::render::backends::{Command, HeadlessDevice, QueueFamilies};

    #[test]
    fn test_pass_records_and_retains_output() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let mut registry = TaskRegistry::new();
        let pipeline = PipelineDesc::graphics(
            device.fabricate(),
            device.fabricate(),
            device.fabricate(),
            Some(DescriptorLayoutInfo::uniform_buffer(device.fabricate())),
        );
        let mut task = GraphicsPass::task(&mut registry, "scene", pipeline);
        let config = FrameConfig::default();
        let frame = FrameContext::from_registry(device.clone(), 0, &registry, &config);
        let frame = Arc::new(frame.unwrap());
        let target =
            Arc::new(Framebuffer::new(device.clone(), device.fabricate(), &[], 64, 32).unwrap());
        let usage = vk::BufferUsageFlags::VERTEX_BUFFER;
        let vertices = Arc::new(GpuBuffer::new(device.clone(), 36, usage, false).unwrap());

        task.set_frame_context(frame.clone()).unwrap();
        task.prepare_output(target.clone()).unwrap();
        task.prepare_uniforms(5, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        task.prepare_geometry(vertices.clone(), None, 3, 1).unwrap();
        let record = task.run().unwrap();

        assert_eq!(record.retained.len(), 1);
        assert_eq!(frame.stats().framebuffers, 1);
        let submission = &device.submissions()[0];
        assert!(matches!(
            submission.commands[0],
            Command::BeginRenderPass { width: 64, height: 32, .. }
        ));
        let draw = Command::Draw { vertex_count: 3, instance_count: 1 };
        assert!(submission.commands.contains(&draw));
        assert_eq!(submission.commands.last(), Some(&Command::EndRenderPass));

        let uniform = frame.acquire_uniform_buffer(5, 16).unwrap();
        let expected: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]).to_vec();
        assert_eq!(device.buffer_contents(uniform.handle()).unwrap(), expected);
    }

    #[test]
    fn test_pass_without_output_fails() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let mut registry = TaskRegistry::new();
        let pipeline = PipelineDesc::graphics(
            device.fabricate(),
            device.fabricate(),
            device.fabricate(),
            None,
        );
        let mut task = GraphicsPass::task(&mut registry, "composite", pipeline);
        let config = FrameConfig::default();
        let frame = FrameContext::from_registry(device.clone(), 0, &registry, &config);
        let frame = Arc::new(frame.unwrap());

        task.set_frame_context(frame).unwrap();
        assert!(task.prepare_uniforms(0, &0u32).is_err());
        assert!(matches!(task.run(), Err(RenderError::InvalidTaskState { .. })));
    }
}

//! Command buffer recording with RAII render passes

use ash::vk;

use crate::render::backends::{Command, GpuDevice};
use crate::render::{RenderError, RenderResult};

/// Records commands into one command buffer
pub struct CommandRecorder<'a, D: GpuDevice> {
    device: &'a D,
    command_buffer: vk::CommandBuffer,
    recording: bool,
}

impl<'a, D: GpuDevice> CommandRecorder<'a, D> {
    /// Wrap a command buffer acquired from a frame context
    pub const fn new(device: &'a D, command_buffer: vk::CommandBuffer) -> Self {
        Self { device, command_buffer, recording: false }
    }

    /// Begin command recording
    pub fn begin(&mut self) -> RenderResult<&mut Self> {
        if self.recording {
            return Err(RenderError::invalid("Command buffer already recording"));
        }
        self.device.begin_command_buffer(self.command_buffer)?;
        self.recording = true;
        Ok(self)
    }

    /// Begin a render pass; it ends when the returned guard is dropped
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: (u32, u32),
        clear_color: [f32; 4],
    ) -> RenderResult<ActiveRenderPass<'_, 'a, D>> {
        self.ensure_recording()?;
        self.push(&Command::BeginRenderPass {
            render_pass,
            framebuffer,
            width: extent.0,
            height: extent.1,
            clear_color,
        });
        Ok(ActiveRenderPass { recorder: self })
    }

    /// Bind a pipeline
    pub fn bind_pipeline(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) -> RenderResult<()> {
        self.ensure_recording()?;
        self.push(&Command::BindPipeline { bind_point, pipeline });
        Ok(())
    }

    /// Bind a descriptor set at set index 0
    pub fn bind_descriptor_set(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) -> RenderResult<()> {
        self.ensure_recording()?;
        self.push(&Command::BindDescriptorSet { bind_point, layout, set });
        Ok(())
    }

    /// Dispatch compute work groups
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> RenderResult<()> {
        self.ensure_recording()?;
        self.push(&Command::Dispatch { x, y, z });
        Ok(())
    }

    /// Copy `size` bytes from the start of `src` to the start of `dst`
    pub fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RenderResult<()> {
        self.ensure_recording()?;
        self.push(&Command::CopyBuffer { src, dst, size });
        Ok(())
    }

    /// End command recording
    pub fn end(mut self) -> RenderResult<vk::CommandBuffer> {
        self.ensure_recording()?;
        self.device.end_command_buffer(self.command_buffer)?;
        self.recording = false;
        Ok(self.command_buffer)
    }

    /// The command buffer being recorded
    pub const fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    fn ensure_recording(&self) -> RenderResult<()> {
        if self.recording {
            Ok(())
        } else {
            Err(RenderError::invalid("Command buffer not recording"))
        }
    }

    fn push(&self, command: &Command) {
        self.device.record(self.command_buffer, command);
    }
}

/// An open render pass; dropping it records the end of the pass
pub struct ActiveRenderPass<'r, 'a, D: GpuDevice> {
    recorder: &'r mut CommandRecorder<'a, D>,
}

impl<D: GpuDevice> ActiveRenderPass<'_, '_, D> {
    /// Bind a graphics pipeline
    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        let bind_point = vk::PipelineBindPoint::GRAPHICS;
        self.recorder.push(&Command::BindPipeline { bind_point, pipeline });
    }

    /// Bind a descriptor set for graphics
    pub fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set: vk::DescriptorSet) {
        self.recorder.push(&Command::BindDescriptorSet {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout,
            set,
        });
    }

    /// Bind the vertex buffer
    pub fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        self.recorder.push(&Command::BindVertexBuffer { buffer, offset });
    }

    /// Bind the index buffer
    pub fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.recorder.push(&Command::BindIndexBuffer { buffer, offset, index_type });
    }

    /// Draw non-indexed vertices
    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.recorder.push(&Command::Draw { vertex_count, instance_count });
    }

    /// Draw indexed vertices
    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) {
        self.recorder.push(&Command::DrawIndexed { index_count, instance_count });
    }
}

impl<D: GpuDevice> Drop for ActiveRenderPass<'_, '_, D> {
    fn drop(&mut self) {
        self.recorder.push(&Command::EndRenderPass);
    }
}

//! Device capabilities consumed by the frame resource layer
//!
//! Handles are plain `ash::vk` handles so pools, tasks and backends share one
//! vocabulary. Every creation call can fail with device exhaustion and must
//! propagate it; destruction calls never fail.

use ash::vk;
use bitflags::bitflags;

use crate::render::RenderResult;

/// Queue families a submission can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueFamily {
    /// Graphics and render pass work
    Graphics,
    /// Compute dispatches
    Compute,
    /// Buffer and image copies
    Transfer,
    /// Presentation to a surface
    Present,
}

impl QueueFamily {
    /// Every queue family, in enumeration order
    pub const ALL: [Self; 4] = [Self::Graphics, Self::Compute, Self::Transfer, Self::Present];

    /// The single flag for this family
    pub const fn flag(self) -> QueueFamilies {
        match self {
            Self::Graphics => QueueFamilies::GRAPHICS,
            Self::Compute => QueueFamilies::COMPUTE,
            Self::Transfer => QueueFamilies::TRANSFER,
            Self::Present => QueueFamilies::PRESENT,
        }
    }
}

bitflags! {
    /// Set of queue families a device exposes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueFamilies: u32 {
        /// Graphics queue
        const GRAPHICS = 1;
        /// Compute queue
        const COMPUTE = 1 << 1;
        /// Transfer queue
        const TRANSFER = 1 << 2;
        /// Present queue
        const PRESENT = 1 << 3;
    }
}

impl QueueFamilies {
    /// Iterate the individual families in the set
    pub fn families(self) -> impl Iterator<Item = QueueFamily> {
        QueueFamily::ALL.into_iter().filter(move |family| self.contains(family.flag()))
    }
}

/// A semaphore a submission waits on, with the stage that waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreWait {
    /// Semaphore signaled by an earlier submission
    pub semaphore: vk::Semaphore,
    /// Pipeline stage blocked until the semaphore signals
    pub stage: vk::PipelineStageFlags,
}

impl SemaphoreWait {
    /// Wait at the given stage
    pub const fn new(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        Self { semaphore, stage }
    }
}

/// One batch handed to a queue
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    /// Semaphores to wait on before executing
    pub wait: &'a [SemaphoreWait],
    /// Recorded command buffers
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores signaled on completion
    pub signal: &'a [vk::Semaphore],
}

/// Commands a render task can record
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Begin a render pass clearing the first attachment
    BeginRenderPass {
        /// Render pass object
        render_pass: vk::RenderPass,
        /// Target framebuffer
        framebuffer: vk::Framebuffer,
        /// Render area width
        width: u32,
        /// Render area height
        height: u32,
        /// RGBA clear color
        clear_color: [f32; 4],
    },
    /// End the current render pass
    EndRenderPass,
    /// Bind a pipeline
    BindPipeline {
        /// Graphics or compute
        bind_point: vk::PipelineBindPoint,
        /// Pipeline object
        pipeline: vk::Pipeline,
    },
    /// Bind one descriptor set at set index 0
    BindDescriptorSet {
        /// Graphics or compute
        bind_point: vk::PipelineBindPoint,
        /// Pipeline layout the set is compatible with
        layout: vk::PipelineLayout,
        /// Descriptor set
        set: vk::DescriptorSet,
    },
    /// Bind a vertex buffer at binding 0
    BindVertexBuffer {
        /// Vertex buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
    },
    /// Bind an index buffer
    BindIndexBuffer {
        /// Index buffer
        buffer: vk::Buffer,
        /// Byte offset
        offset: vk::DeviceSize,
        /// Index width
        index_type: vk::IndexType,
    },
    /// Non-indexed draw
    Draw {
        /// Vertices per instance
        vertex_count: u32,
        /// Instances
        instance_count: u32,
    },
    /// Indexed draw
    DrawIndexed {
        /// Indices per instance
        index_count: u32,
        /// Instances
        instance_count: u32,
    },
    /// Compute dispatch
    Dispatch {
        /// Work groups in x
        x: u32,
        /// Work groups in y
        y: u32,
        /// Work groups in z
        z: u32,
    },
    /// Whole-region buffer copy
    CopyBuffer {
        /// Source buffer
        src: vk::Buffer,
        /// Destination buffer
        dst: vk::Buffer,
        /// Bytes to copy
        size: vk::DeviceSize,
    },
}

/// Device surface used by pools, frame contexts and render tasks
///
/// Implementations must be shareable across threads: pools acquire from
/// several tasks and the release reaper polls fences from its own thread.
pub trait GpuDevice: Send + Sync + 'static {
    /// Queue families this device can submit to
    fn supported_queue_families(&self) -> QueueFamilies;

    /// Whether `family` can be submitted to
    fn supports(&self, family: QueueFamily) -> bool {
        self.supported_queue_families().contains(family.flag())
    }

    /// Create a command pool whose buffers are reset together
    fn create_command_pool(&self, family: QueueFamily) -> RenderResult<vk::CommandPool>;
    /// Allocate one primary command buffer
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> RenderResult<vk::CommandBuffer>;
    /// Reset every buffer allocated from the pool
    fn reset_command_pool(&self, pool: vk::CommandPool) -> RenderResult<()>;
    /// Destroy the pool and free its buffers
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// Begin one-time-submit recording
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RenderResult<()>;
    /// Record a single command
    fn record(&self, command_buffer: vk::CommandBuffer, command: &Command);
    /// Finish recording
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RenderResult<()>;

    /// Create a descriptor pool
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> RenderResult<vk::DescriptorPool>;
    /// Allocate one set with the given layout
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> RenderResult<vk::DescriptorSet>;
    /// Point a buffer binding of a set at `buffer`
    fn update_descriptor_buffer(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        range: vk::DeviceSize,
    );
    /// Free every set allocated from the pool
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> RenderResult<()>;
    /// Destroy the pool
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Create a binary semaphore
    fn create_semaphore(&self) -> RenderResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence>;
    /// Block until the fence signals or the timeout elapses
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RenderResult<()>;
    /// Non-blocking fence status
    fn fence_signaled(&self, fence: vk::Fence) -> RenderResult<bool>;
    /// Return the fence to the unsignaled state
    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);

    /// Create a buffer; host-visible buffers stay mapped until destroyed
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> RenderResult<vk::Buffer>;
    /// Copy bytes into a host-visible buffer
    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> RenderResult<()>;
    /// Destroy a buffer and its memory
    fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Create a framebuffer over existing image views
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        width: u32,
        height: u32,
    ) -> RenderResult<vk::Framebuffer>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Submit one batch to the queue of `family`, signaling `fence` on completion
    fn submit(
        &self,
        family: QueueFamily,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> RenderResult<()>;

    /// Wait until the device has no outstanding work
    fn wait_idle(&self) -> RenderResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_family_flags() {
        let families = QueueFamilies::GRAPHICS | QueueFamilies::TRANSFER;
        let listed: Vec<_> = families.families().collect();
        assert_eq!(listed, vec![QueueFamily::Graphics, QueueFamily::Transfer]);
        assert!(families.contains(QueueFamily::Graphics.flag()));
        assert!(!families.contains(QueueFamily::Compute.flag()));
        assert_eq!(QueueFamilies::all().families().count(), 4);
    }
}

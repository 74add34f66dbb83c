//! Per-queue-family command buffer pool

use std::sync::Arc;

use ash::vk;

use super::pool::{PoolItemFactory, ResourcePool};
use crate::render::backends::{GpuDevice, QueueFamily};
use crate::render::{RenderError, RenderResult};

struct CommandBufferFactory<D: GpuDevice> {
    device: Arc<D>,
    command_pool: vk::CommandPool,
}

impl<D: GpuDevice> PoolItemFactory<vk::CommandBuffer> for CommandBufferFactory<D> {
    fn create(&self) -> RenderResult<vk::CommandBuffer> {
        self.device.allocate_command_buffer(self.command_pool)
    }

    // Buffers are freed together with their command pool.
    fn destroy(&self, _item: vk::CommandBuffer) {}
}

/// Command buffers for one queue family, reset together once per frame
pub struct CommandBufferManager<D: GpuDevice> {
    family: QueueFamily,
    buffers: ResourcePool<vk::CommandBuffer, CommandBufferFactory<D>>,
}

impl<D: GpuDevice> CommandBufferManager<D> {
    /// Create the command pool for `family`
    pub fn new(device: Arc<D>, family: QueueFamily) -> RenderResult<Self> {
        if !device.supports(family) {
            return Err(RenderError::UnsupportedQueueFamily(family));
        }
        let command_pool = device.create_command_pool(family)?;
        log::debug!("Created command pool for {family:?}");

        Ok(Self {
            family,
            buffers: ResourcePool::new(
                "command buffer",
                CommandBufferFactory { device, command_pool },
            ),
        })
    }

    /// A command buffer ready to be recorded
    pub fn acquire_buffer(&self) -> RenderResult<vk::CommandBuffer> {
        self.buffers.acquire()
    }

    /// Reset the command pool, then make every buffer available again
    ///
    /// No submitted buffer from this pool may still be executing.
    pub fn reset(&self) -> RenderResult<()> {
        let factory = self.buffers.factory();
        factory.device.reset_command_pool(factory.command_pool)?;
        self.buffers.reset()?;
        Ok(())
    }

    /// Queue family this manager records for
    pub const fn family(&self) -> QueueFamily {
        self.family
    }

    /// Buffers allocated so far
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffer has been allocated yet
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffers handed out since the last reset
    pub fn acquired_len(&self) -> usize {
        self.buffers.acquired_len()
    }
}

impl<D: GpuDevice> Drop for CommandBufferManager<D> {
    fn drop(&mut self) {
        let factory = self.buffers.factory();
        factory.device.destroy_command_pool(factory.command_pool);
        log::debug!("Destroyed command pool for {:?}", self.family);
    }
}

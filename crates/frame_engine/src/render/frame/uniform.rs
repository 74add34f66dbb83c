//! Uniform buffer cache keyed by caller-chosen ids

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::render::backends::GpuDevice;
use crate::render::resources::GpuBuffer;
use crate::render::{RenderError, RenderResult};

/// Host-visible uniform buffers that live as long as their frame context
///
/// The first request for an id creates and maps the buffer; later requests
/// return the same buffer. Reusing an id with a different size is an error.
pub struct UniformBufferManager<D: GpuDevice> {
    device: Arc<D>,
    buffers: Mutex<HashMap<u32, Arc<GpuBuffer<D>>>>,
}

impl<D: GpuDevice> UniformBufferManager<D> {
    /// Create an empty cache
    pub fn new(device: Arc<D>) -> Self {
        Self { device, buffers: Mutex::new(HashMap::new()) }
    }

    /// Buffer for `id`, created with `size` bytes on first use
    pub fn acquire_buffer(&self, id: u32, size: vk::DeviceSize) -> RenderResult<Arc<GpuBuffer<D>>> {
        let mut buffers = self.buffers.lock();
        if let Some(buffer) = buffers.get(&id) {
            if buffer.size() != size {
                return Err(RenderError::UniformSizeMismatch {
                    id,
                    existing: buffer.size(),
                    requested: size,
                });
            }
            return Ok(buffer.clone());
        }

        let buffer = Arc::new(GpuBuffer::uniform(self.device.clone(), size)?);
        log::debug!("Created uniform buffer {id} ({size} bytes)");
        buffers.insert(id, buffer.clone());
        Ok(buffer)
    }

    /// Drop every cached buffer
    pub fn reset(&self) {
        self.buffers.lock().clear();
    }

    /// Number of cached buffers
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

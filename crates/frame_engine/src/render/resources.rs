//! RAII wrappers for device buffers and framebuffers
//!
//! Both release their native object on drop, so holding the last `Arc` to one
//! of them is what keeps it alive. Frame contexts and the release queue rely
//! on this to delay destruction until the GPU is done.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use crate::render::backends::GpuDevice;
use crate::render::{RenderError, RenderResult};

/// Buffer with memory management
pub struct GpuBuffer<D: GpuDevice> {
    device: Arc<D>,
    handle: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    host_visible: bool,
}

impl<D: GpuDevice> GpuBuffer<D> {
    /// Create a buffer; host-visible buffers can be written directly
    pub fn new(
        device: Arc<D>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> RenderResult<Self> {
        if size == 0 {
            return Err(RenderError::invalid("Buffer size must be non-zero"));
        }
        let handle = device.create_buffer(size, usage, host_visible)?;
        Ok(Self { device, handle, size, usage, host_visible })
    }

    /// Host-visible uniform buffer of `size` bytes
    pub fn uniform(device: Arc<D>, size: vk::DeviceSize) -> RenderResult<Self> {
        Self::new(device, size, vk::BufferUsageFlags::UNIFORM_BUFFER, true)
    }

    /// Host-visible staging buffer holding a copy of `data`
    pub fn staging<T: Pod>(device: Arc<D>, data: &[T]) -> RenderResult<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;
        let buffer = Self::new(device, size, vk::BufferUsageFlags::TRANSFER_SRC, true)?;
        buffer.write_bytes(0, bytes)?;
        Ok(buffer)
    }

    /// Copy raw bytes into the buffer at `offset`
    pub fn write_bytes(&self, offset: vk::DeviceSize, bytes: &[u8]) -> RenderResult<()> {
        if !self.host_visible {
            return Err(RenderError::invalid("Buffer is not host visible"));
        }
        let end = offset.checked_add(bytes.len() as vk::DeviceSize);
        if end.map_or(true, |end| end > self.size) {
            return Err(RenderError::InvalidOperation {
                reason: format!(
                    "Write of {} bytes at {offset} exceeds buffer size {}",
                    bytes.len(),
                    self.size
                ),
            });
        }
        self.device.write_buffer(self.handle, offset, bytes)
    }

    /// Write a plain-old-data value at the start of the buffer
    pub fn write<T: Pod>(&self, value: &T) -> RenderResult<()> {
        self.write_bytes(0, bytemuck::bytes_of(value))
    }

    /// Write a slice of plain-old-data values at the start of the buffer
    pub fn write_slice<T: Pod>(&self, values: &[T]) -> RenderResult<()> {
        self.write_bytes(0, bytemuck::cast_slice(values))
    }

    /// Get buffer handle
    pub const fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Get size
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage flags the buffer was created with
    pub const fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }
}

impl<D: GpuDevice> Drop for GpuBuffer<D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.handle);
    }
}

impl<D: GpuDevice> std::fmt::Debug for GpuBuffer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer").field("handle", &self.handle).field("size", &self.size).finish()
    }
}

/// Framebuffer wrapper
pub struct Framebuffer<D: GpuDevice> {
    device: Arc<D>,
    handle: vk::Framebuffer,
    width: u32,
    height: u32,
}

impl<D: GpuDevice> Framebuffer<D> {
    /// Create a framebuffer over existing attachments
    pub fn new(
        device: Arc<D>,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let handle = device.create_framebuffer(render_pass, attachments, width, height)?;
        Ok(Self { device, handle, width, height })
    }

    /// Get the framebuffer handle
    pub const fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    /// Width and height
    pub const fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl<D: GpuDevice> Drop for Framebuffer<D> {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.handle);
    }
}

impl<D: GpuDevice> std::fmt::Debug for Framebuffer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("handle", &self.handle)
            .field("extent", &self.extent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::{HeadlessDevice, QueueFamilies};

    #[test]
    fn test_buffer_released_on_drop() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let buffer = GpuBuffer::uniform(device.clone(), 16).unwrap();
        assert_eq!(device.live_objects().buffers, 1);
        drop(buffer);
        assert_eq!(device.live_objects().buffers, 0);
    }

    #[test]
    fn test_pod_writes() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let buffer = GpuBuffer::uniform(device.clone(), 8).unwrap();
        buffer.write_slice(&[1u32, 2u32]).unwrap();
        assert_eq!(device.buffer_contents(buffer.handle()).unwrap(), vec![1, 0, 0, 0, 2, 0, 0, 0]);
        assert!(buffer.write(&[0u64; 2]).is_err());
    }

    #[test]
    fn test_staging_copies_data() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let staging = GpuBuffer::staging(device.clone(), &[0xABu8, 0xCD]).unwrap();
        assert_eq!(staging.size(), 2);
        assert_eq!(staging.usage(), vk::BufferUsageFlags::TRANSFER_SRC);
        assert_eq!(device.buffer_contents(staging.handle()).unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
        let empty: &[u32] = &[];
        let staging = GpuBuffer::staging(device.clone(), empty);
        assert!(matches!(staging, Err(RenderError::InvalidOperation { .. })));
        assert!(GpuBuffer::uniform(device.clone(), 0).is_err());
        assert_eq!(device.live_objects().buffers, 0);
    }
}

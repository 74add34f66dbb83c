//! Vulkan implementation of [`GpuDevice`](super::GpuDevice)
//!
//! Wraps an `ash::Device` created by the application. Instance, surface and
//! device creation stay with the caller; this backend only creates and
//! destroys the per-frame objects the frame layer asks for.

mod device;

pub use device::VulkanDevice;

use ash::vk;

use super::QueueFamily;
use crate::render::{RenderError, RenderResult};

/// Queue family indices chosen by the application at device creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    /// Family used for graphics submissions
    pub graphics: Option<u32>,
    /// Family used for compute submissions
    pub compute: Option<u32>,
    /// Family used for transfer submissions
    pub transfer: Option<u32>,
    /// Family used for presentation
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Index for a queue family, if the device exposes it
    pub const fn index(&self, family: QueueFamily) -> Option<u32> {
        match family {
            QueueFamily::Graphics => self.graphics,
            QueueFamily::Compute => self.compute,
            QueueFamily::Transfer => self.transfer,
            QueueFamily::Present => self.present,
        }
    }
}

/// Find a memory type matching `type_filter` with all of `properties`
pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            (type_filter & (1 << i)) != 0
                && memory_properties.memory_types[i as usize].property_flags.contains(properties)
        })
        .ok_or(RenderError::Exhausted {
            what: "buffer memory",
            result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_memory_type_respects_filter_and_flags() {
        let mut properties =
            vk::PhysicalDeviceMemoryProperties { memory_type_count: 3, ..Default::default() };
        properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        properties.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&properties, 0b111, host), Ok(1));
        assert_eq!(find_memory_type(&properties, 0b100, host), Ok(2));
        assert!(find_memory_type(&properties, 0b001, host).is_err());
    }

    #[test]
    fn test_queue_family_indices_lookup() {
        let indices = QueueFamilyIndices {
            graphics: Some(0),
            present: Some(0),
            transfer: Some(2),
            compute: None,
        };
        assert_eq!(indices.index(QueueFamily::Transfer), Some(2));
        assert_eq!(indices.index(QueueFamily::Compute), None);
    }
}

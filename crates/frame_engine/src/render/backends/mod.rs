//! Graphics backend implementations
//!
//! [`GpuDevice`] is the narrow device surface the frame resource layer
//! consumes. [`vulkan::VulkanDevice`] implements it over an externally
//! created `ash::Device`; [`headless::HeadlessDevice`] is an in-process
//! implementation with a simulated queue used by tests and the viewer.

pub mod device;
pub mod headless;
pub mod vulkan;

pub use device::{Command, GpuDevice, QueueFamilies, QueueFamily, SemaphoreWait, Submission};
pub use headless::HeadlessDevice;
pub use vulkan::{QueueFamilyIndices, VulkanDevice};

//! Per-frame resource management
//!
//! Pools that hand out device objects for the duration of one frame, the
//! [`FrameContext`] that groups them per frame slot, and the
//! [`FrameRotation`] driver that recycles slots behind their fences.

pub mod command;
pub mod context;
pub mod descriptor;
pub mod framebuffer;
pub mod pool;
pub mod rotation;
pub mod sync;
pub mod uniform;

pub use command::CommandBufferManager;
pub use context::{FrameContext, FrameContextStats};
pub use descriptor::{DescriptorLayoutInfo, DescriptorSetManager, LayoutBinding};
pub use framebuffer::FramebufferKeeper;
pub use pool::{PoolItemFactory, ResourcePool};
pub use rotation::{FrameOutcome, FrameRotation, FrameSlot};
pub use sync::SyncObjectManager;
pub use uniform::UniformBufferManager;

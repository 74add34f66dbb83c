//! # Rendering System
//!
//! Resource lifecycle and synchronization machinery for frames in flight.
//!
//! ## Architecture
//!
//! ```text
//! FrameRotation (N slots)
//!     └── FrameContext (one per slot)
//!           ├── CommandBufferManager (one per supported queue family)
//!           ├── DescriptorSetManager
//!           ├── SyncObjectManager (semaphores + fences)
//!           ├── UniformBufferManager
//!           └── FramebufferKeeper
//! RenderTask ── records/submits against a FrameContext, returns (semaphore, fence)
//! ReleaseQueue ── drops retained resources once their fence signals
//! ```
//!
//! Everything talks to the GPU through the [`backends::GpuDevice`] trait.

pub mod backends;
pub mod error;
pub mod frame;
pub mod release;
pub mod resources;
pub mod task;

pub use error::{ErrorClass, RenderError, RenderResult};

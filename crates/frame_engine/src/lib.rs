//! # Frame Engine
//!
//! Frames-in-flight resource management for a Vulkan display pipeline.
//!
//! ## Features
//!
//! - **Resource Pools**: Lazily grown acquire/reset pools for command buffers,
//!   descriptor sets, semaphores and fences
//! - **Frame Contexts**: One aggregate of pools per frame slot, recycled with a single reset
//! - **Render Tasks**: Record, submit and chain GPU work through semaphores
//! - **Frame Rotation**: Fence-gated reuse of N frame slots
//! - **Deferred Release**: A background reaper that drops resources once their fence signals
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use frame_engine::prelude::*;
//!
//! fn main() -> Result<(), RenderError> {
//!     let device = Arc::new(HeadlessDevice::new(QueueFamilies::all()));
//!     let mut registry = TaskRegistry::new();
//!     let mut upload = TransferUpload::task(&mut registry);
//!     let mut frames = FrameRotation::new(device.clone(), &registry, FrameConfig::default())?;
//!
//!     frames.render_frame(|slot, release| {
//!         upload.set_frame_context(slot.context().clone())?;
//!         let submission = upload.run()?;
//!         let fence = submission.fence;
//!         release.defer(fence, submission.retained);
//!         Ok(fence)
//!     })?;
//!
//!     frames.shutdown()
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError},
        core::config::{FrameConfig, ViewerConfig},
        render::{
            backends::{
                Command, GpuDevice, HeadlessDevice, QueueFamilies, QueueFamily, SemaphoreWait,
                Submission,
            },
            frame::{
                DescriptorLayoutInfo, FrameContext, FrameOutcome, FrameRotation, FrameSlot,
                LayoutBinding,
            },
            release::{ReleaseBundle, ReleaseQueue},
            resources::{Framebuffer, GpuBuffer},
            task::{
                ComputeDispatch, GraphicsPass, PipelineDesc, RenderTask, SubmissionRecord,
                TaskId, TaskRegistry, TaskState, TaskType, TransferUpload,
            },
            ErrorClass, RenderError, RenderResult,
        },
    };
}

//! # Render Tasks
//!
//! A render task records one command buffer against a [`FrameContext`] and
//! submits it, returning the semaphore it signals and the fence that tracks
//! its completion.
//!
//! ## Protocol
//!
//! ```text
//! Constructed ──set_frame_context──▶ FrameContextBound ──prepare_*──▶ Prepared
//!      ▲                                                                 │
//!      └──────────── set_frame_context (next frame) ◀── Submitted ◀──run─┘
//! ```
//!
//! Tasks chain through semaphores: the [`SubmissionRecord`] of an upstream
//! task goes into the wait list of the downstream one, so the CPU never
//! blocks between submissions.
//!
//! The set of task kinds is closed: [`GraphicsPass`], [`ComputeDispatch`] and
//! [`TransferUpload`] each implement [`TaskCommands`].

pub mod compute;
pub mod graphics;
pub mod recorder;
pub mod registry;
pub mod transfer;

pub use compute::ComputeDispatch;
pub use graphics::{GraphicsPass, PipelineDesc};
pub use recorder::{ActiveRenderPass, CommandRecorder};
pub use registry::{TaskEntry, TaskId, TaskRegistry};
pub use transfer::TransferUpload;

use std::sync::Arc;

use ash::vk;

use crate::render::backends::{GpuDevice, QueueFamily, SemaphoreWait, Submission};
use crate::render::frame::{DescriptorLayoutInfo, FrameContext};
use crate::render::release::ReleaseBundle;
use crate::render::{RenderError, RenderResult};

/// Kind of GPU work a task submits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Render pass work on the graphics queue
    Graphics,
    /// Dispatches on the compute queue
    Compute,
    /// Copies on the transfer queue
    Transfer,
}

impl TaskType {
    /// Queue family the task submits to
    pub const fn queue_family(self) -> QueueFamily {
        match self {
            Self::Graphics => QueueFamily::Graphics,
            Self::Compute => QueueFamily::Compute,
            Self::Transfer => QueueFamily::Transfer,
        }
    }

    /// Pipeline bind point, if the task binds pipelines
    pub const fn bind_point(self) -> Option<vk::PipelineBindPoint> {
        match self {
            Self::Graphics => Some(vk::PipelineBindPoint::GRAPHICS),
            Self::Compute => Some(vk::PipelineBindPoint::COMPUTE),
            Self::Transfer => None,
        }
    }

    /// Stage at which this kind of task waits for upstream work
    pub const fn wait_stage(self) -> vk::PipelineStageFlags {
        match self {
            Self::Graphics => vk::PipelineStageFlags::ALL_GRAPHICS,
            Self::Compute => vk::PipelineStageFlags::COMPUTE_SHADER,
            Self::Transfer => vk::PipelineStageFlags::TRANSFER,
        }
    }
}

/// Where a task is in its per-frame protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not bound to a frame
    Constructed,
    /// Bound to a frame context and holding its command buffer
    FrameContextBound,
    /// Inputs assigned for this frame
    Prepared,
    /// Submitted; may be bound to the next frame
    Submitted,
}

/// Outcome of [`RenderTask::run`]
#[derive(Debug)]
pub struct SubmissionRecord {
    /// Task that submitted
    pub task: TaskId,
    /// Semaphore signaled when the work completes, for downstream tasks
    pub signal: vk::Semaphore,
    /// Fence signaled when the work completes
    pub fence: vk::Fence,
    /// Resources the submission reads that must outlive it
    pub retained: ReleaseBundle,
}

impl SubmissionRecord {
    /// Wait on this submission's signal at `stage`
    pub const fn wait_at(&self, stage: vk::PipelineStageFlags) -> SemaphoreWait {
        SemaphoreWait::new(self.signal, stage)
    }
}

/// Recording capability of one task kind
pub trait TaskCommands<D: GpuDevice>: Send {
    /// Kind of work recorded
    const TASK_TYPE: TaskType;

    /// Descriptor layout the task allocates sets with, if any
    fn layout(&self) -> Option<DescriptorLayoutInfo>;

    /// Record the task's commands between begin and end
    fn record(
        &mut self,
        recorder: &mut CommandRecorder<'_, D>,
        frame: &FrameContext<D>,
    ) -> RenderResult<()>;

    /// Resources to keep alive until the submission completes
    fn take_retained(&mut self) -> ReleaseBundle {
        ReleaseBundle::new()
    }
}

/// A task of kind `C` driven through the bind/prepare/run protocol
pub struct RenderTask<D: GpuDevice, C: TaskCommands<D>> {
    id: TaskId,
    label: String,
    state: TaskState,
    frame: Option<Arc<FrameContext<D>>>,
    command_buffer: vk::CommandBuffer,
    wait: Vec<SemaphoreWait>,
    commands: C,
}

impl<D: GpuDevice, C: TaskCommands<D>> RenderTask<D, C> {
    /// Register the task and fix its type and layout
    pub fn new(registry: &mut TaskRegistry, label: impl Into<String>, commands: C) -> Self {
        let label = label.into();
        let id = registry.register(label.clone(), C::TASK_TYPE, commands.layout());
        Self {
            id,
            label,
            state: TaskState::Constructed,
            frame: None,
            command_buffer: vk::CommandBuffer::null(),
            wait: Vec::new(),
            commands,
        }
    }

    /// Bind to the frame being recorded and acquire its command buffer
    ///
    /// Fails when the device has no queue for the task's family; the task
    /// then stays unbound and cannot run.
    pub fn set_frame_context(&mut self, frame: Arc<FrameContext<D>>) -> RenderResult<()> {
        let family = C::TASK_TYPE.queue_family();
        let command_buffer = frame.acquire_command_buffer(family).map_err(|err| {
            log::error!("Task '{}' cannot bind to frame slot {}: {err}", self.label, frame.slot());
            err
        })?;

        if matches!(self.state, TaskState::FrameContextBound | TaskState::Prepared) {
            log::debug!(
                "Task '{}' rebound before running; previous recording abandoned",
                self.label
            );
        }
        self.frame = Some(frame);
        self.command_buffer = command_buffer;
        self.wait.clear();
        self.state = TaskState::FrameContextBound;
        Ok(())
    }

    /// Wait on `waits` before this task's work starts
    pub fn prepare_wait(
        &mut self,
        waits: impl IntoIterator<Item = SemaphoreWait>,
    ) -> RenderResult<()> {
        self.mark_prepared()?;
        self.wait.extend(waits);
        Ok(())
    }

    /// Wait on an upstream submission at this task's natural stage
    pub fn prepare_wait_on(&mut self, upstream: &SubmissionRecord) -> RenderResult<()> {
        self.prepare_wait([upstream.wait_at(C::TASK_TYPE.wait_stage())])
    }

    /// Record and submit the task's work
    pub fn run(&mut self) -> RenderResult<SubmissionRecord> {
        if !matches!(self.state, TaskState::FrameContextBound | TaskState::Prepared) {
            return Err(RenderError::InvalidTaskState {
                reason: format!("task '{}' run while {:?}", self.label, self.state),
            });
        }
        let frame = self.frame.take().ok_or_else(|| RenderError::InvalidTaskState {
            reason: format!("task '{}' has no frame context", self.label),
        })?;

        match self.submit(&frame) {
            Ok((signal, fence)) => {
                self.state = TaskState::Submitted;
                self.wait.clear();
                log::trace!("Task '{}' submitted on slot {}", self.label, frame.slot());
                let retained = self.commands.take_retained();
                Ok(SubmissionRecord { task: self.id, signal, fence, retained })
            }
            Err(err) => {
                log::debug!("Task '{}' failed to submit: {err}", self.label);
                self.state = TaskState::Constructed;
                self.wait.clear();
                drop(self.commands.take_retained());
                Err(err)
            }
        }
    }

    fn submit(&mut self, frame: &FrameContext<D>) -> RenderResult<(vk::Semaphore, vk::Fence)> {
        let device = frame.device().as_ref();
        let mut recorder = CommandRecorder::new(device, self.command_buffer);
        recorder.begin()?;
        self.commands.record(&mut recorder, frame)?;
        let command_buffer = recorder.end()?;

        let signal = frame.acquire_semaphore()?;
        let fence = frame.acquire_fence()?;
        let submission =
            Submission { wait: &self.wait, command_buffers: &[command_buffer], signal: &[signal] };
        device.submit(C::TASK_TYPE.queue_family(), &submission, fence)?;
        frame.record_submission(fence);
        frame.track_semaphores(&self.wait, &[signal]);
        Ok((signal, fence))
    }

    fn mark_prepared(&mut self) -> RenderResult<()> {
        match self.state {
            TaskState::FrameContextBound | TaskState::Prepared => {
                self.state = TaskState::Prepared;
                Ok(())
            }
            state => Err(RenderError::InvalidTaskState {
                reason: format!("task '{}' prepared while {state:?}", self.label),
            }),
        }
    }

    /// Registry id
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Task kind
    pub const fn task_type(&self) -> TaskType {
        C::TASK_TYPE
    }

    /// Protocol state
    pub const fn state(&self) -> TaskState {
        self.state
    }

    /// Name used in logs
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current wait list
    pub fn waits(&self) -> &[SemaphoreWait] {
        &self.wait
    }

    /// The task's recording state
    pub const fn commands(&self) -> &C {
        &self.commands
    }
}

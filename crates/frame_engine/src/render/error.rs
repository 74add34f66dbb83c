//! Error taxonomy for the frame resource layer
//!
//! Errors fall into three classes that callers treat differently:
//! configuration errors are programmer mistakes and fatal, transient errors
//! (an out-of-date presentation target) are recoverable by skipping the frame,
//! and exhaustion errors are fatal because there is no degraded mode.

use ash::vk;
use thiserror::Error;

use crate::render::backends::QueueFamily;

/// How the frame driver should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Programmer error; never retried
    Configuration,
    /// Recoverable; skip the frame and retry on the next tick
    Transient,
    /// The device could not allocate a new object
    Exhaustion,
    /// Device loss, timeouts and any other API failure
    Fatal,
}

/// Frame resource and submission errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A command buffer was requested for a queue family the device does not expose
    #[error("Queue family {0:?} is not supported by this device")]
    UnsupportedQueueFamily(QueueFamily),

    /// A uniform buffer id was reused with a different size
    #[error("Uniform buffer {id} was created with {existing} bytes, requested {requested}")]
    UniformSizeMismatch {
        /// Caller-assigned buffer id
        id: u32,
        /// Size the buffer was created with
        existing: vk::DeviceSize,
        /// Size of the conflicting request
        requested: vk::DeviceSize,
    },

    /// A descriptor set was requested for a layout the pool was not sized for
    #[error("Descriptor set layout {layout:?} was not part of the descriptor pool sizing")]
    DescriptorLayoutMismatch {
        /// The unknown layout
        layout: vk::DescriptorSetLayout,
    },

    /// A frame slot was reset while its GPU work may still be running
    #[error("Frame slot {slot} reset before its frame-rendered fence was waited")]
    FrameGateViolation {
        /// Index of the offending slot
        slot: usize,
    },

    /// A render task method was called out of order
    #[error("Invalid task state: {reason}")]
    InvalidTaskState {
        /// What went wrong
        reason: String,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Configuration values failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The presentation target no longer matches the surface
    #[error("Presentation target out of date ({0:?})")]
    OutOfDate(vk::Result),

    /// The device failed to allocate a new object
    #[error("Resource exhausted while creating {what} ({result:?})")]
    Exhausted {
        /// Kind of object being created
        what: &'static str,
        /// Native status code
        result: vk::Result,
    },

    /// The device was lost
    #[error("Device lost")]
    DeviceLost,

    /// A fence did not signal in time
    #[error("Fence wait timed out after {timeout_ns} ns")]
    Timeout {
        /// The timeout that elapsed
        timeout_ns: u64,
    },

    /// Any other Vulkan API error
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),
}

/// Result type for frame resource operations
pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    /// An operation the object's current state does not allow
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    /// Map a native status code, naming the object being created for exhaustion errors
    pub fn from_vk(result: vk::Result, what: &'static str) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => {
                Self::OutOfDate(result)
            }
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL
            | vk::Result::ERROR_FRAGMENTATION
            | vk::Result::ERROR_TOO_MANY_OBJECTS => Self::Exhausted { what, result },
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Api(other),
        }
    }

    /// Classify the error for the frame driver
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::UnsupportedQueueFamily(_)
            | Self::UniformSizeMismatch { .. }
            | Self::DescriptorLayoutMismatch { .. }
            | Self::FrameGateViolation { .. }
            | Self::InvalidTaskState { .. }
            | Self::InvalidOperation { .. }
            | Self::InvalidConfig(_) => ErrorClass::Configuration,
            Self::OutOfDate(_) => ErrorClass::Transient,
            Self::Exhausted { .. } => ErrorClass::Exhaustion,
            Self::DeviceLost | Self::Timeout { .. } | Self::Api(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the frame can simply be skipped and retried
    pub const fn is_recoverable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Native status code carried by the error, if any
    pub const fn status(&self) -> Option<vk::Result> {
        match self {
            Self::OutOfDate(result) | Self::Exhausted { result, .. } | Self::Api(result) => {
                Some(*result)
            }
            Self::DeviceLost => Some(vk::Result::ERROR_DEVICE_LOST),
            Self::Timeout { .. } => Some(vk::Result::TIMEOUT),
            _ => None,
        }
    }
}

impl From<crate::config::ConfigError> for RenderError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_date_is_transient() {
        let err = RenderError::from_vk(vk::Result::ERROR_OUT_OF_DATE_KHR, "submission");
        assert_eq!(err, RenderError::OutOfDate(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert!(err.is_recoverable());
        assert_eq!(err.status(), Some(vk::Result::ERROR_OUT_OF_DATE_KHR));

        let suboptimal = RenderError::from_vk(vk::Result::SUBOPTIMAL_KHR, "submission");
        assert_eq!(suboptimal.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_allocation_failures_are_exhaustion() {
        for result in [
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            vk::Result::ERROR_OUT_OF_POOL_MEMORY,
        ] {
            let err = RenderError::from_vk(result, "fence");
            assert_eq!(err.class(), ErrorClass::Exhaustion);
            assert!(!err.is_recoverable());
        }
    }

    #[test]
    fn test_configuration_errors_are_fatal() {
        let err = RenderError::UniformSizeMismatch { id: 5, existing: 64, requested: 128 };
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(!err.is_recoverable());
        assert_eq!(RenderError::DeviceLost.class(), ErrorClass::Fatal);
        assert_eq!(
            RenderError::from_vk(vk::Result::ERROR_INITIALIZATION_FAILED, "fence"),
            RenderError::Api(vk::Result::ERROR_INITIALIZATION_FAILED)
        );
    }
}

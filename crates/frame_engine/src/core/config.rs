//! # Unified Configuration System
//!
//! Configuration for the frame rotation driver and the applications that own it.
//!
//! ## Configuration Categories
//!
//! - **Frame Config**: Frames in flight, fence timeouts, descriptor pool sizing,
//!   deferred release settings
//! - **Viewer Config**: Logging, run length and simulated device behaviour for the viewer

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError};

/// Upper bound on frame slots; more only adds latency
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

/// # Frame Configuration
///
/// Sizing and timing of the frames-in-flight rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Number of frame slots kept in rotation
    pub frames_in_flight: usize,
    /// Timeout for the per-slot frame gate, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Descriptor sets reserved per task layout in each frame context
    pub descriptor_sets_per_layout: u32,
    /// How often the release reaper polls outstanding fences
    pub release_poll_interval_ms: u64,
    /// Name of the release reaper thread
    pub release_thread_name: String,
}

impl FrameConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ns: 1_000_000_000, // 1 second, long enough for any sane frame
            descriptor_sets_per_layout: 1,
            release_poll_interval_ms: 2,
            release_thread_name: "frame-release".to_string(),
        }
    }

    /// Set the number of frames in flight
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the frame gate timeout
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Set how many descriptor sets each task layout may draw per frame
    pub fn with_descriptor_sets_per_layout(mut self, sets: u32) -> Self {
        self.descriptor_sets_per_layout = sets;
        self
    }

    /// Set the reaper poll interval
    pub fn with_release_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.release_poll_interval_ms = interval_ms;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid("frames_in_flight must be at least 1".to_string()));
        }

        if self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::Invalid(format!(
                "frames_in_flight should not exceed {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }

        if self.fence_timeout_ns == 0 {
            return Err(ConfigError::Invalid("fence_timeout_ns must be non-zero".to_string()));
        }

        if self.descriptor_sets_per_layout == 0 {
            return Err(ConfigError::Invalid(
                "descriptor_sets_per_layout must be at least 1".to_string(),
            ));
        }

        if self.release_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "release_poll_interval_ms must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Config for FrameConfig {}

/// # Viewer Configuration
///
/// Top-level configuration for the viewer binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Number of frames to render before exiting
    pub frame_count: u64,
    /// Offscreen target size
    pub extent: (u32, u32),
    /// Frame on which the headless device reports an out-of-date surface
    pub simulate_out_of_date_at: Option<u64>,
    /// Frame rotation settings
    pub frames: FrameConfig,
}

impl ViewerConfig {
    /// Create a viewer configuration with defaults
    pub fn new() -> Self {
        Self {
            log_level: "info".to_string(),
            frame_count: 240,
            extent: (1280, 720),
            simulate_out_of_date_at: None,
            frames: FrameConfig::default(),
        }
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the number of frames to run
    pub fn with_frame_count(mut self, frames: u64) -> Self {
        self.frame_count = frames;
        self
    }

    /// Set frame rotation settings
    pub fn with_frames(mut self, frames: FrameConfig) -> Self {
        self.frames = frames;
        self
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extent.0 == 0 || self.extent.1 == 0 {
            return Err(ConfigError::Invalid(format!(
                "extent must be non-zero, got {}x{}",
                self.extent.0, self.extent.1
            )));
        }
        self.frames.validate()
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Config for ViewerConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frame_config_is_valid() {
        let config = FrameConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.descriptor_sets_per_layout, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_config_rejects_bad_values() {
        assert!(FrameConfig::new().with_frames_in_flight(0).validate().is_err());
        assert!(FrameConfig::new().with_frames_in_flight(9).validate().is_err());
        assert!(FrameConfig::new().with_fence_timeout_ns(0).validate().is_err());
        assert!(FrameConfig::new().with_descriptor_sets_per_layout(0).validate().is_err());
        assert!(FrameConfig::new().with_release_poll_interval_ms(0).validate().is_err());
    }

    #[test]
    fn test_viewer_config_from_partial_toml() {
        let config = ViewerConfig::from_toml_str(
            r#"
            frame_count = 12
            log_level = "debug"

            [frames]
            frames_in_flight = 3
            "#,
        )
        .expect("partial config should parse");

        assert_eq!(config.frame_count, 12);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.frames.frames_in_flight, 3);
        assert_eq!(config.frames.fence_timeout_ns, FrameConfig::default().fence_timeout_ns);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_viewer_config_toml_round_trip() {
        let config = ViewerConfig::new().with_frame_count(5).with_log_level("trace");
        let text = config.to_toml_string().expect("serialize");
        let parsed = ViewerConfig::from_toml_str(&text).expect("parse");
        assert_eq!(parsed, config);
    }
}

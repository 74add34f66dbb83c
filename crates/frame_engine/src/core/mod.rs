//! Core engine functionality
//!
//! Unified configuration for the frame rotation driver and the viewer.

pub mod config;

pub use config::{FrameConfig, ViewerConfig};

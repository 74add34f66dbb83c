//! Foundation module - Core utilities shared by the whole crate
//!
//! Currently this is the logging facade and its initialisation helpers.

pub mod logging;

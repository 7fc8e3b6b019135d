//! Common utilities for usb-host
//!
//! This crate provides functionality shared by the host library and the
//! probe binary: the configuration/IO error type, logging setup, and test
//! fixtures that build raw descriptor sets for mock devices.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;

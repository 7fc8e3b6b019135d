//! Library half of the `usb-probe` tool: configuration and report rendering

pub mod config;
pub mod report;

pub use config::{ProbeConfig, ProbeSettings, load_config};
pub use report::{device_summary, render_json, render_tree};

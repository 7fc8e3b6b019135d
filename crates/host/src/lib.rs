//! USB host access layer
//!
//! This crate enumerates devices attached to the host, opens them, manages
//! configurations and interface claims, and performs control, bulk and
//! interrupt transfers. All host-controller access goes through the
//! [`UsbPlatform`] trait: [`platform::rusb_backend`] drives libusb, and
//! [`platform::mock`] simulates devices for tests.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use host::{Session, SessionConfig};
//! use host::platform::mock::MockPlatform;
//! use common::test_utils::{loopback_test_device, LOOPBACK_VENDOR_ID, LOOPBACK_PRODUCT_ID};
//!
//! let mock = MockPlatform::new();
//! mock.add_device(1, 4, loopback_test_device());
//!
//! let session = Session::init(Arc::new(mock), SessionConfig::default()).unwrap();
//! let topology = session.enumerate().unwrap();
//! let device = topology.find_device(LOOPBACK_VENDOR_ID, LOOPBACK_PRODUCT_ID).unwrap();
//! assert_eq!(device.location().to_string(), "001:004");
//!
//! let mut handle = session.open(device).unwrap();
//! handle.set_configuration(1).unwrap();
//! handle.claim_interface(0).unwrap();
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod handle;
pub mod platform;
pub mod session;
pub mod stats;
pub mod topology;
pub mod transfer;

pub use config::{ReenumerationSettings, SessionConfig, TransferSettings};
pub use error::{ErrorKind, HostError, Result};
pub use filter::DeviceFilter;
pub use handle::{DeviceHandle, HandleState, ResetOutcome};
pub use platform::{DeviceLocation, SetupPacket, TopologyEvent, UsbPlatform};
pub use session::Session;
pub use stats::TransferStatsSnapshot;
pub use topology::{Bus, Device, DeviceStrings, Topology};
pub use transfer::{CancelOutcome, CompletedTransfer, Transfer, TransferCanceller, TransferContext};

//! USB descriptor model
//!
//! This crate defines typed representations of the USB standard descriptors
//! (device, configuration, interface, endpoint, string), a validating parser
//! for raw descriptor bytes, and an encoder producing the wire layout.
//!
//! # Example
//!
//! ```
//! use descriptors::{parse_device_descriptor, DeviceDescriptor, BcdVersion};
//!
//! let desc = DeviceDescriptor {
//!     usb_version: BcdVersion(0x0200),
//!     class: 0xff,
//!     subclass: 0,
//!     protocol: 0,
//!     max_packet_size_0: 64,
//!     vendor_id: 0x0555,
//!     product_id: 0x000c,
//!     device_version: BcdVersion(0x0100),
//!     manufacturer_index: 1,
//!     product_index: 2,
//!     serial_number_index: 0,
//!     num_configurations: 1,
//! };
//!
//! let bytes = desc.to_bytes();
//! assert_eq!(bytes.len(), 18);
//!
//! let parsed = parse_device_descriptor(&bytes).unwrap();
//! assert_eq!(parsed.vendor_id, 0x0555);
//! assert_eq!(parsed.usb_version.to_string(), "02.00");
//! ```

pub mod constants;
pub mod encode;
pub mod error;
pub mod parse;
pub mod tree;
pub mod types;

pub use error::{DescriptorError, Result};
pub use parse::{
    parse_configuration, parse_configuration_descriptor, parse_device_descriptor,
    parse_endpoint_descriptor, parse_interface_descriptor, parse_string_descriptor,
};
pub use tree::{Configuration, Endpoint, Interface};
pub use types::{
    BcdVersion, ConfigurationDescriptor, Descriptor, DeviceDescriptor, Direction,
    EndpointAddress, EndpointDescriptor, InterfaceDescriptor, StringDescriptor, TransferKind,
};

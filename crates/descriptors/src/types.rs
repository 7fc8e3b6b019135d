//! USB standard descriptor types
//!
//! Typed representations of the fixed-layout descriptors a device reports
//! about itself. Field names follow the USB 2.0 specification with the
//! Hungarian prefixes dropped.

use crate::constants::{
    ENDPOINT_ADDRESS_MASK, ENDPOINT_DIR_MASK, ENDPOINT_TYPE_BULK, ENDPOINT_TYPE_CONTROL,
    ENDPOINT_TYPE_INTERRUPT, ENDPOINT_TYPE_ISOCHRONOUS, ENDPOINT_TYPE_MASK,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Binary-coded decimal version (bcdUSB, bcdDevice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BcdVersion(pub u16);

impl BcdVersion {
    /// Major version (two BCD digits)
    pub fn major(self) -> u8 {
        (((self.0 >> 12) & 0xf) * 10 + ((self.0 >> 8) & 0xf)) as u8
    }

    /// Minor version digit
    pub fn minor(self) -> u8 {
        ((self.0 >> 4) & 0xf) as u8
    }

    /// Sub-minor version digit
    pub fn sub_minor(self) -> u8 {
        (self.0 & 0xf) as u8
    }

    /// Build from decimal components, e.g. `(2, 0, 0)` for USB 2.0
    pub fn from_parts(major: u8, minor: u8, sub_minor: u8) -> Self {
        let major = major as u16;
        Self(
            ((major / 10) << 12)
                | ((major % 10) << 8)
                | ((minor as u16 & 0xf) << 4)
                | (sub_minor as u16 & 0xf),
        )
    }
}

impl fmt::Display for BcdVersion {
    /// Renders each nibble as a digit: `0x0200` becomes `"02.00"`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nibble = |shift: u16| (self.0 >> shift) & 0xf;
        write!(
            f,
            "{:x}{:x}.{:x}{:x}",
            nibble(12),
            nibble(8),
            nibble(4),
            nibble(0)
        )
    }
}

/// Transfer direction, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn from_endpoint(address: u8) -> Self {
        if address & ENDPOINT_DIR_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    /// Direction encoded in bit 7 of bmRequestType
    pub fn from_request_type(request_type: u8) -> Self {
        Self::from_endpoint(request_type)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "OUT"),
            Direction::In => write!(f, "IN"),
        }
    }
}

/// Endpoint address (bEndpointAddress): direction bit plus endpoint number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointAddress(pub u8);

impl EndpointAddress {
    /// Default control endpoint
    pub const CONTROL: EndpointAddress = EndpointAddress(0x00);

    pub fn number(self) -> u8 {
        self.0 & ENDPOINT_ADDRESS_MASK
    }

    pub fn direction(self) -> Direction {
        Direction::from_endpoint(self.0)
    }

    pub fn is_in(self) -> bool {
        self.direction() == Direction::In
    }
}

impl From<u8> for EndpointAddress {
    fn from(value: u8) -> Self {
        EndpointAddress(value)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & ENDPOINT_TYPE_MASK {
            ENDPOINT_TYPE_CONTROL => TransferKind::Control,
            ENDPOINT_TYPE_ISOCHRONOUS => TransferKind::Isochronous,
            ENDPOINT_TYPE_BULK => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }

    pub fn as_bits(self) -> u8 {
        match self {
            TransferKind::Control => ENDPOINT_TYPE_CONTROL,
            TransferKind::Isochronous => ENDPOINT_TYPE_ISOCHRONOUS,
            TransferKind::Bulk => ENDPOINT_TYPE_BULK,
            TransferKind::Interrupt => ENDPOINT_TYPE_INTERRUPT,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferKind::Control => "control",
            TransferKind::Isochronous => "isochronous",
            TransferKind::Bulk => "bulk",
            TransferKind::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

/// Standard device descriptor (18 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// USB specification release (bcdUSB)
    pub usb_version: BcdVersion,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Max packet size of endpoint 0
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release number (bcdDevice)
    pub device_version: BcdVersion,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn manufacturer_string_index(&self) -> Option<u8> {
        non_zero(self.manufacturer_index)
    }

    pub fn product_string_index(&self) -> Option<u8> {
        non_zero(self.product_index)
    }

    pub fn serial_number_string_index(&self) -> Option<u8> {
        non_zero(self.serial_number_index)
    }
}

/// Configuration descriptor header (9 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    /// Length of the full configuration blob (wTotalLength)
    pub total_length: u16,
    pub num_interfaces: u8,
    /// Value passed to SET_CONFIGURATION (bConfigurationValue)
    pub value: u8,
    pub description_index: u8,
    /// bmAttributes
    pub attributes: u8,
    /// bMaxPower, in 2 mA units
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    pub fn self_powered(&self) -> bool {
        self.attributes & 0x40 != 0
    }

    pub fn remote_wakeup(&self) -> bool {
        self.attributes & 0x20 != 0
    }

    /// Maximum bus power draw in milliamps
    pub fn max_power_ma(&self) -> u16 {
        self.max_power as u16 * 2
    }

    pub fn description_string_index(&self) -> Option<u8> {
        non_zero(self.description_index)
    }
}

/// Interface descriptor (9 bytes), one per alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alt_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub description_index: u8,
}

impl InterfaceDescriptor {
    pub fn description_string_index(&self) -> Option<u8> {
        non_zero(self.description_index)
    }
}

/// Endpoint descriptor (7 bytes, 9 for audio endpoints)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    /// bmAttributes: transfer type, sync type, usage type
    pub attributes: u8,
    /// wMaxPacketSize including the high-bandwidth multiplier bits
    pub max_packet_size: u16,
    /// Polling interval (bInterval)
    pub interval: u8,
    /// Audio endpoints only
    pub refresh: u8,
    /// Audio endpoints only
    pub synch_address: u8,
}

impl EndpointDescriptor {
    pub fn transfer_kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }

    pub fn direction(&self) -> Direction {
        self.address.direction()
    }

    /// Isochronous synchronization type (bits 2..3)
    pub fn sync_type(&self) -> u8 {
        (self.attributes >> 2) & 0x3
    }

    /// Isochronous usage type (bits 4..5)
    pub fn usage_type(&self) -> u8 {
        (self.attributes >> 4) & 0x3
    }

    /// Packet payload size without the additional-transaction bits
    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x07ff
    }

    /// Extra transactions per microframe for high-bandwidth endpoints
    pub fn additional_transactions(&self) -> u8 {
        ((self.max_packet_size >> 11) & 0x3) as u8
    }

    /// Whether the descriptor carries the audio refresh/synch fields
    pub fn is_audio_layout(&self) -> bool {
        self.refresh != 0 || self.synch_address != 0
    }
}

/// String descriptor payload as UTF-16 code units
///
/// Index 0 holds the table of supported LANGIDs rather than text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringDescriptor(pub Vec<u16>);

impl StringDescriptor {
    pub fn from_text(text: &str) -> Self {
        StringDescriptor(text.encode_utf16().collect())
    }

    /// Decode as text, replacing invalid surrogates
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }

    /// Interpret as the LANGID table of string index 0
    pub fn language_ids(&self) -> &[u16] {
        &self.0
    }
}

/// Any single descriptor, tagged by bDescriptorType
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Descriptor {
    Device(DeviceDescriptor),
    Configuration(ConfigurationDescriptor),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    String(StringDescriptor),
    /// Class- or vendor-specific descriptor kept as raw bytes
    Other { descriptor_type: u8, data: Vec<u8> },
}

fn non_zero(index: u8) -> Option<u8> {
    if index == 0 { None } else { Some(index) }
}

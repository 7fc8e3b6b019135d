//! Descriptor parsing
//!
//! All parsers validate bLength and bDescriptorType before reading fields and
//! never index past the supplied buffer. Multi-byte fields are little-endian.

use crate::constants::{
    DT_CONFIG, DT_CONFIG_SIZE, DT_DEVICE, DT_DEVICE_SIZE, DT_ENDPOINT, DT_ENDPOINT_AUDIO_SIZE,
    DT_ENDPOINT_SIZE, DT_INTERFACE, DT_INTERFACE_SIZE, DT_STRING,
};
use crate::error::{DescriptorError, Result};
use crate::tree::{Configuration, Endpoint, Interface};
use crate::types::{
    BcdVersion, ConfigurationDescriptor, Descriptor, DeviceDescriptor, EndpointAddress,
    EndpointDescriptor, InterfaceDescriptor, StringDescriptor,
};
use byteorder::{ByteOrder, LittleEndian};

/// Validate the two-byte header and return the descriptor body (bLength bytes)
fn checked<'a>(
    bytes: &'a [u8],
    kind: &'static str,
    expected_type: Option<u8>,
    minimum: usize,
) -> Result<&'a [u8]> {
    if bytes.len() < 2 {
        return Err(DescriptorError::Truncated {
            kind,
            needed: 2,
            available: bytes.len(),
        });
    }

    let length = bytes[0];
    if (length as usize) < minimum {
        return Err(DescriptorError::InvalidLength {
            kind,
            length,
            minimum: minimum as u8,
        });
    }

    if let Some(expected) = expected_type
        && bytes[1] != expected
    {
        return Err(DescriptorError::UnexpectedType {
            expected,
            found: bytes[1],
        });
    }

    if bytes.len() < length as usize {
        return Err(DescriptorError::Truncated {
            kind,
            needed: length as usize,
            available: bytes.len(),
        });
    }

    Ok(&bytes[..length as usize])
}

/// Parse an 18-byte device descriptor
pub fn parse_device_descriptor(bytes: &[u8]) -> Result<DeviceDescriptor> {
    let b = checked(bytes, "device", Some(DT_DEVICE), DT_DEVICE_SIZE)?;

    Ok(DeviceDescriptor {
        usb_version: BcdVersion(LittleEndian::read_u16(&b[2..4])),
        class: b[4],
        subclass: b[5],
        protocol: b[6],
        max_packet_size_0: b[7],
        vendor_id: LittleEndian::read_u16(&b[8..10]),
        product_id: LittleEndian::read_u16(&b[10..12]),
        device_version: BcdVersion(LittleEndian::read_u16(&b[12..14])),
        manufacturer_index: b[14],
        product_index: b[15],
        serial_number_index: b[16],
        num_configurations: b[17],
    })
}

/// Parse only the 9-byte header of a configuration descriptor
pub fn parse_configuration_descriptor(bytes: &[u8]) -> Result<ConfigurationDescriptor> {
    let b = checked(bytes, "configuration", Some(DT_CONFIG), DT_CONFIG_SIZE)?;

    Ok(ConfigurationDescriptor {
        total_length: LittleEndian::read_u16(&b[2..4]),
        num_interfaces: b[4],
        value: b[5],
        description_index: b[6],
        attributes: b[7],
        max_power: b[8],
    })
}

pub fn parse_interface_descriptor(bytes: &[u8]) -> Result<InterfaceDescriptor> {
    let b = checked(bytes, "interface", Some(DT_INTERFACE), DT_INTERFACE_SIZE)?;

    Ok(InterfaceDescriptor {
        number: b[2],
        alt_setting: b[3],
        num_endpoints: b[4],
        class: b[5],
        subclass: b[6],
        protocol: b[7],
        description_index: b[8],
    })
}

pub fn parse_endpoint_descriptor(bytes: &[u8]) -> Result<EndpointDescriptor> {
    let b = checked(bytes, "endpoint", Some(DT_ENDPOINT), DT_ENDPOINT_SIZE)?;
    let audio = b.len() >= DT_ENDPOINT_AUDIO_SIZE;

    Ok(EndpointDescriptor {
        address: EndpointAddress(b[2]),
        attributes: b[3],
        max_packet_size: LittleEndian::read_u16(&b[4..6]),
        interval: b[6],
        refresh: if audio { b[7] } else { 0 },
        synch_address: if audio { b[8] } else { 0 },
    })
}

/// Parse a string descriptor into UTF-16 code units
pub fn parse_string_descriptor(bytes: &[u8]) -> Result<StringDescriptor> {
    let b = checked(bytes, "string", Some(DT_STRING), 2)?;
    let payload = &b[2..];

    if payload.len() % 2 != 0 {
        return Err(DescriptorError::OddStringLength(payload.len()));
    }

    Ok(StringDescriptor(
        payload.chunks_exact(2).map(LittleEndian::read_u16).collect(),
    ))
}

/// Parse a complete configuration blob (header, interfaces, endpoints)
///
/// The buffer must hold at least wTotalLength bytes; anything past
/// wTotalLength is ignored. Descriptors that are neither interfaces nor
/// endpoints are kept as `extra` bytes of whatever precedes them.
pub fn parse_configuration(bytes: &[u8]) -> Result<Configuration> {
    let descriptor = parse_configuration_descriptor(bytes)?;
    let header_len = bytes[0] as usize;
    let total = descriptor.total_length as usize;

    if total > bytes.len() {
        return Err(DescriptorError::TotalLengthMismatch {
            declared: total,
            available: bytes.len(),
        });
    }
    if total < header_len {
        return Err(DescriptorError::Truncated {
            kind: "configuration",
            needed: header_len,
            available: total,
        });
    }

    let body = &bytes[..total];
    let mut config = Configuration {
        descriptor,
        interfaces: Vec::new(),
        extra: Vec::new(),
    };

    let mut offset = header_len;
    while offset < total {
        let chunk = checked(&body[offset..], "nested", None, 2)?;

        match chunk[1] {
            DT_INTERFACE => {
                if let Some(previous) = config.interfaces.last() {
                    check_endpoint_count(previous)?;
                }
                config.interfaces.push(Interface {
                    descriptor: parse_interface_descriptor(chunk)?,
                    endpoints: Vec::new(),
                    extra: Vec::new(),
                });
            }
            DT_ENDPOINT => {
                let interface = config
                    .interfaces
                    .last_mut()
                    .ok_or(DescriptorError::OrphanEndpoint { offset })?;
                interface.endpoints.push(Endpoint {
                    descriptor: parse_endpoint_descriptor(chunk)?,
                    extra: Vec::new(),
                });
            }
            _ => {
                let extra = match config.interfaces.last_mut() {
                    Some(interface) => match interface.endpoints.last_mut() {
                        Some(endpoint) => &mut endpoint.extra,
                        None => &mut interface.extra,
                    },
                    None => &mut config.extra,
                };
                extra.extend_from_slice(chunk);
            }
        }

        offset += chunk.len();
    }

    if let Some(last) = config.interfaces.last() {
        check_endpoint_count(last)?;
    }

    Ok(config)
}

fn check_endpoint_count(interface: &Interface) -> Result<()> {
    if interface.endpoints.len() != interface.descriptor.num_endpoints as usize {
        return Err(DescriptorError::EndpointCountMismatch {
            interface: interface.number(),
            alt_setting: interface.alt_setting(),
            declared: interface.descriptor.num_endpoints,
            found: interface.endpoints.len(),
        });
    }
    Ok(())
}

impl Descriptor {
    /// Parse the first descriptor in `bytes`, dispatching on bDescriptorType
    ///
    /// Configuration descriptors parse to their 9-byte header only; use
    /// [`parse_configuration`] for the full hierarchy.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let chunk = checked(bytes, "descriptor", None, 2)?;

        Ok(match chunk[1] {
            DT_DEVICE => Descriptor::Device(parse_device_descriptor(chunk)?),
            DT_CONFIG => Descriptor::Configuration(parse_configuration_descriptor(chunk)?),
            DT_INTERFACE => Descriptor::Interface(parse_interface_descriptor(chunk)?),
            DT_ENDPOINT => Descriptor::Endpoint(parse_endpoint_descriptor(chunk)?),
            DT_STRING => Descriptor::String(parse_string_descriptor(chunk)?),
            other => Descriptor::Other {
                descriptor_type: other,
                data: chunk.to_vec(),
            },
        })
    }
}

//! Test utilities for usb-host
//!
//! Provides descriptor fixtures for mock devices and helper functions for
//! async tests across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{loopback_test_device, LOOPBACK_VENDOR_ID};
//!
//! let device = loopback_test_device();
//! assert_eq!(device.descriptor.vendor_id, LOOPBACK_VENDOR_ID);
//! assert_eq!(device.device_bytes().len(), 18);
//! ```

use descriptors::{
    BcdVersion, Configuration, ConfigurationDescriptor, DeviceDescriptor, Endpoint,
    EndpointAddress, EndpointDescriptor, Interface, InterfaceDescriptor, TransferKind,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor ID of the loopback test firmware
pub const LOOPBACK_VENDOR_ID: u16 = 0x0555;

/// Product ID of the loopback test firmware
pub const LOOPBACK_PRODUCT_ID: u16 = 0x000c;

/// Descriptor set for one mock device
///
/// Holds the typed descriptors; the `*_bytes` methods produce what the
/// device would answer to GET_DESCRIPTOR.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceFixture {
    pub descriptor: DeviceDescriptor,
    pub configurations: Vec<Configuration>,
    /// String descriptors by index (index 0 is generated from `language_ids`)
    pub strings: BTreeMap<u8, String>,
    pub language_ids: Vec<u16>,
}

impl DeviceFixture {
    /// Vendor-specific USB 2.0 device with no configurations
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                usb_version: BcdVersion(0x0200),
                class: 0x00,
                subclass: 0x00,
                protocol: 0x00,
                max_packet_size_0: 64,
                vendor_id,
                product_id,
                device_version: BcdVersion(0x0100),
                manufacturer_index: 0,
                product_index: 0,
                serial_number_index: 0,
                num_configurations: 0,
            },
            configurations: Vec::new(),
            strings: BTreeMap::new(),
            language_ids: vec![0x0409],
        }
    }

    /// Append a configuration and bump bNumConfigurations
    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configurations.push(configuration);
        self.descriptor.num_configurations = self.configurations.len() as u8;
        self
    }

    pub fn with_string(mut self, index: u8, text: &str) -> Self {
        self.strings.insert(index, text.to_string());
        self
    }

    /// Set manufacturer, product and serial strings at indices 1, 2, 3
    pub fn with_identity(self, manufacturer: &str, product: &str, serial: &str) -> Self {
        let mut fixture = self
            .with_string(1, manufacturer)
            .with_string(2, product)
            .with_string(3, serial);
        fixture.descriptor.manufacturer_index = 1;
        fixture.descriptor.product_index = 2;
        fixture.descriptor.serial_number_index = 3;
        fixture
    }

    pub fn device_bytes(&self) -> Vec<u8> {
        self.descriptor.to_bytes()
    }

    /// One raw configuration blob per configuration, in order
    pub fn configuration_bytes(&self) -> Vec<Vec<u8>> {
        self.configurations.iter().map(|c| c.to_bytes()).collect()
    }
}

/// Build an endpoint of the given transfer type
pub fn endpoint(address: u8, kind: TransferKind, max_packet_size: u16, interval: u8) -> Endpoint {
    Endpoint {
        descriptor: EndpointDescriptor {
            address: EndpointAddress(address),
            attributes: kind.as_bits(),
            max_packet_size,
            interval,
            refresh: 0,
            synch_address: 0,
        },
        extra: Vec::new(),
    }
}

pub fn bulk_endpoint(address: u8, max_packet_size: u16) -> Endpoint {
    endpoint(address, TransferKind::Bulk, max_packet_size, 0)
}

pub fn interrupt_endpoint(address: u8, max_packet_size: u16, interval: u8) -> Endpoint {
    endpoint(address, TransferKind::Interrupt, max_packet_size, interval)
}

/// Vendor-specific interface alternate setting
pub fn interface(number: u8, alt_setting: u8, endpoints: Vec<Endpoint>) -> Interface {
    Interface {
        descriptor: InterfaceDescriptor {
            number,
            alt_setting,
            num_endpoints: endpoints.len() as u8,
            class: 0xff,
            subclass: 0x00,
            protocol: 0x00,
            description_index: 0,
        },
        endpoints,
        extra: Vec::new(),
    }
}

/// Bus-powered configuration drawing 100 mA
pub fn configuration(value: u8, interfaces: Vec<Interface>) -> Configuration {
    let mut numbers: Vec<u8> = interfaces.iter().map(|i| i.number()).collect();
    numbers.dedup();

    Configuration {
        descriptor: ConfigurationDescriptor {
            total_length: 0,
            num_interfaces: numbers.len() as u8,
            value,
            description_index: 0,
            attributes: 0x80,
            max_power: 50,
        },
        interfaces,
        extra: Vec::new(),
    }
}

/// The loopback test device (0x0555:0x000c)
///
/// Configuration 1, interface 0:
/// - alt 0: interrupt 0x01/0x81 (8 ms), bulk 0x02/0x82
/// - alt 1: bulk 0x03/0x83
///
/// Configuration 2, interface 0 alt 0: bulk 0x04/0x84.
/// Data written to an OUT endpoint comes back on the IN endpoint with the
/// same number when driven by the mock platform.
pub fn loopback_test_device() -> DeviceFixture {
    DeviceFixture::new(LOOPBACK_VENDOR_ID, LOOPBACK_PRODUCT_ID)
        .with_identity("usb-host", "Loopback Test Device", "LB000001")
        .with_configuration(configuration(
            1,
            vec![
                interface(
                    0,
                    0,
                    vec![
                        interrupt_endpoint(0x01, 64, 8),
                        interrupt_endpoint(0x81, 64, 8),
                        bulk_endpoint(0x02, 512),
                        bulk_endpoint(0x82, 512),
                    ],
                ),
                interface(0, 1, vec![bulk_endpoint(0x03, 512), bulk_endpoint(0x83, 512)]),
            ],
        ))
        .with_configuration(configuration(
            2,
            vec![interface(
                0,
                0,
                vec![bulk_endpoint(0x04, 512), bulk_endpoint(0x84, 512)],
            )],
        ))
}

/// Create test payload of the given size (0, 1, ..., 255, 0, ...)
pub fn create_test_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use descriptors::{parse_configuration, parse_device_descriptor};

    #[test]
    fn test_loopback_device_descriptors_parse() {
        let fixture = loopback_test_device();

        let device = parse_device_descriptor(&fixture.device_bytes()).unwrap();
        assert_eq!(device.vendor_id, LOOPBACK_VENDOR_ID);
        assert_eq!(device.product_id, LOOPBACK_PRODUCT_ID);
        assert_eq!(device.num_configurations, 2);
        assert_eq!(device.manufacturer_string_index(), Some(1));

        let configs = fixture.configuration_bytes();
        assert_eq!(configs.len(), 2);

        let config = parse_configuration(&configs[0]).unwrap();
        assert_eq!(config.value(), 1);
        assert_eq!(config.interface_numbers(), vec![0]);
        assert_eq!(config.interfaces[0].endpoints.len(), 4);
        assert_eq!(config.interfaces[1].alt_setting(), 1);
    }

    #[test]
    fn test_create_test_payload() {
        let data = create_test_payload(1024);

        assert_eq!(data.len(), 1024);
        assert_eq!(data[0], 0);
        assert_eq!(data[255], 255);
        assert_eq!(data[256], 0); // Wraps around
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}

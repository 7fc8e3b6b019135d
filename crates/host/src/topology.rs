//! Bus/device topology
//!
//! [`enumerate`] turns the platform's raw bus listing into an immutable
//! [`Topology`] snapshot. Re-running it never touches earlier snapshots, so
//! a caller can diff two passes to notice a device coming or going.

use crate::error::{HostError, Result};
use crate::filter::DeviceFilter;
use crate::platform::{DeviceLocation, RawDevice, UsbPlatform};
use descriptors::{
    BcdVersion, Configuration, DeviceDescriptor, parse_configuration, parse_device_descriptor,
};
use serde::Serialize;
use tracing::debug;

/// Snapshot of every bus and device visible to the session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Topology {
    pub buses: Vec<Bus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bus {
    /// Platform-assigned bus number
    pub id: u32,
    /// Directory name of the bus (e.g. "001")
    pub name: String,
    pub devices: Vec<Device>,
}

/// Manufacturer, product and serial strings, when they could be read
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// One enumerated device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    /// Id of the owning [`Bus`]
    pub bus: u32,
    pub address: u8,
    /// Platform file name of the device node
    pub file_name: String,
    pub descriptor: DeviceDescriptor,
    pub configurations: Vec<Configuration>,
    pub strings: DeviceStrings,
}

impl Device {
    pub fn location(&self) -> DeviceLocation {
        DeviceLocation::new(self.bus, self.address)
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn usb_version(&self) -> BcdVersion {
        self.descriptor.usb_version
    }

    pub fn device_version(&self) -> BcdVersion {
        self.descriptor.device_version
    }

    pub fn class(&self) -> u8 {
        self.descriptor.class
    }

    pub fn subclass(&self) -> u8 {
        self.descriptor.subclass
    }

    pub fn protocol(&self) -> u8 {
        self.descriptor.protocol
    }

    pub fn max_packet_size_0(&self) -> u8 {
        self.descriptor.max_packet_size_0
    }

    /// Configuration with the given bConfigurationValue
    pub fn configuration(&self, value: u8) -> Option<&Configuration> {
        self.configurations.iter().find(|c| c.value() == value)
    }

    pub fn configuration_values(&self) -> Vec<u8> {
        self.configurations.iter().map(|c| c.value()).collect()
    }

    pub fn matches(&self, filter: &DeviceFilter) -> bool {
        filter.matches(self.vendor_id(), self.product_id())
    }
}

impl Topology {
    /// All devices, bus by bus
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.buses.iter().flat_map(|bus| bus.devices.iter())
    }

    pub fn device_count(&self) -> usize {
        self.buses.iter().map(|bus| bus.devices.len()).sum()
    }

    /// First device with the given vendor and product ID
    pub fn find_device(&self, vendor_id: u16, product_id: u16) -> Option<&Device> {
        self.find(&DeviceFilter::new(vendor_id, product_id))
    }

    pub fn find(&self, filter: &DeviceFilter) -> Option<&Device> {
        self.devices().find(|d| d.matches(filter))
    }

    pub fn device_at(&self, location: DeviceLocation) -> Option<&Device> {
        self.devices().find(|d| d.location() == location)
    }

    pub fn bus(&self, id: u32) -> Option<&Bus> {
        self.buses.iter().find(|bus| bus.id == id)
    }
}

/// Build a fresh topology snapshot from the platform
///
/// Devices not matched by `filters` are skipped; an empty filter list keeps
/// everything. Malformed descriptor data from any device fails the whole
/// pass.
pub fn enumerate(platform: &dyn UsbPlatform, filters: &[DeviceFilter]) -> Result<Topology> {
    let raw_buses = platform.list_buses().map_err(|e| HostError::Enumeration {
        reason: e.to_string(),
    })?;

    let mut buses = Vec::with_capacity(raw_buses.len());
    for raw_bus in raw_buses {
        let mut devices = Vec::with_capacity(raw_bus.devices.len());

        for raw in &raw_bus.devices {
            let device = build_device(raw_bus.location, raw)?;

            if !DeviceFilter::allows(filters, device.vendor_id(), device.product_id()) {
                debug!(
                    "Device {:04x}:{:04x} at {} ignored by filter",
                    device.vendor_id(),
                    device.product_id(),
                    device.location()
                );
                continue;
            }

            devices.push(device);
        }

        buses.push(Bus {
            id: raw_bus.location,
            name: raw_bus.name,
            devices,
        });
    }

    let topology = Topology { buses };
    debug!(
        "Enumerated {} devices on {} buses",
        topology.device_count(),
        topology.buses.len()
    );
    Ok(topology)
}

fn build_device(bus: u32, raw: &RawDevice) -> Result<Device> {
    let location = DeviceLocation::new(bus, raw.address);
    let malformed = |source| HostError::MalformedDescriptor { location, source };

    let descriptor = parse_device_descriptor(&raw.device_descriptor).map_err(malformed)?;

    let configurations = raw
        .configurations
        .iter()
        .map(|bytes| parse_configuration(bytes))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(malformed)?;

    if configurations.len() != descriptor.num_configurations as usize {
        return Err(HostError::Enumeration {
            reason: format!(
                "device {} declares {} configurations but {} were read",
                location,
                descriptor.num_configurations,
                configurations.len()
            ),
        });
    }

    Ok(Device {
        bus,
        address: raw.address,
        file_name: raw.file_name.clone(),
        descriptor,
        configurations,
        strings: DeviceStrings::default(),
    })
}

//! Text and JSON renderings of a [`Topology`]

use anyhow::{Context, Result};
use descriptors::{Configuration, Endpoint, Interface};
use host::{Device, Topology};
use std::fmt::Write;

/// Render the topology as an indented bus → device → config → interface tree
pub fn render_tree(topology: &Topology) -> String {
    let mut out = String::new();

    if topology.device_count() == 0 {
        out.push_str("No USB devices found.\n");
        return out;
    }

    for bus in &topology.buses {
        let _ = writeln!(out, "Bus {} ({} device(s))", bus.name, bus.devices.len());
        for device in &bus.devices {
            write_device(&mut out, device);
        }
    }
    out
}

/// Render the topology as pretty-printed JSON
pub fn render_json(topology: &Topology) -> Result<String> {
    serde_json::to_string_pretty(topology).context("Failed to serialize topology")
}

/// One-line summary used when a device shows up during `--wait`
pub fn device_summary(device: &Device) -> String {
    format!(
        "Bus {:03} Device {:03}: ID {:04x}:{:04x} {} {}",
        device.bus,
        device.address,
        device.vendor_id(),
        device.product_id(),
        device
            .strings
            .manufacturer
            .as_deref()
            .unwrap_or("Unknown Manufacturer"),
        device.strings.product.as_deref().unwrap_or("Unknown Product")
    )
}

fn write_device(out: &mut String, device: &Device) {
    let _ = writeln!(out, "  {}", device_summary(device));
    if let Some(serial) = &device.strings.serial_number {
        let _ = writeln!(out, "      Serial: {}", serial);
    }
    let _ = writeln!(
        out,
        "      USB {}, class {:02x}/{:02x}/{:02x}, ep0 {} bytes, release {}",
        device.usb_version(),
        device.class(),
        device.subclass(),
        device.protocol(),
        device.max_packet_size_0(),
        device.device_version()
    );
    for configuration in &device.configurations {
        write_configuration(out, configuration);
    }
}

fn write_configuration(out: &mut String, configuration: &Configuration) {
    let power = if configuration.self_powered() {
        "self-powered"
    } else {
        "bus-powered"
    };
    let _ = writeln!(
        out,
        "      Configuration {}: {} interface(s), {}{}, {} mA",
        configuration.value(),
        configuration.descriptor.num_interfaces,
        power,
        if configuration.remote_wakeup() {
            ", remote wakeup"
        } else {
            ""
        },
        configuration.max_power_ma()
    );
    for interface in &configuration.interfaces {
        write_interface(out, interface);
    }
}

fn write_interface(out: &mut String, interface: &Interface) {
    let _ = writeln!(
        out,
        "        Interface {} alt {}: class {:02x}/{:02x}/{:02x}, {} endpoint(s)",
        interface.number(),
        interface.alt_setting(),
        interface.class(),
        interface.descriptor.subclass,
        interface.descriptor.protocol,
        interface.endpoints.len()
    );
    for endpoint in &interface.endpoints {
        write_endpoint(out, endpoint);
    }
}

fn write_endpoint(out: &mut String, endpoint: &Endpoint) {
    let _ = writeln!(
        out,
        "          Endpoint {} {:?} {}, {} bytes, interval {}",
        endpoint.address(),
        endpoint.direction(),
        endpoint.transfer_kind(),
        endpoint.max_packet_size(),
        endpoint.interval()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::loopback_test_device;
    use host::platform::mock::MockPlatform;
    use host::{Session, SessionConfig};
    use std::sync::Arc;

    fn loopback_topology() -> Topology {
        let mock = MockPlatform::new();
        mock.add_device(1, 4, loopback_test_device());
        let session = Session::init(Arc::new(mock), SessionConfig::default()).unwrap();
        session.enumerate().unwrap()
    }

    #[test]
    fn test_tree_lists_every_level() {
        let tree = render_tree(&loopback_topology());

        assert!(tree.contains("Bus 001 (1 device(s))"));
        assert!(tree.contains("Bus 001 Device 004: ID 0555:000c"));
        assert!(tree.contains("Configuration 1:"));
        assert!(tree.contains("Interface 0 alt 0:"));
        assert!(tree.contains("Interface 0 alt 1:"));
        assert!(tree.contains("Endpoint 0x81 In interrupt, 64 bytes, interval 8"));
        assert!(tree.contains("Endpoint 0x82 In bulk"));
    }

    #[test]
    fn test_tree_without_devices() {
        assert_eq!(render_tree(&Topology::default()), "No USB devices found.\n");
    }

    #[test]
    fn test_json_contains_ids() {
        let json = render_json(&loopback_topology()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        let device = &value["buses"][0]["devices"][0];
        assert_eq!(device["address"], 4);
        assert_eq!(device["descriptor"]["vendor_id"], 0x0555);
        assert_eq!(device["descriptor"]["product_id"], 0x000c);
    }
}

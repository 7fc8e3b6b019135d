//! Descriptor encoding
//!
//! Produces the wire layout a device would return for GET_DESCRIPTOR. Used to
//! rebuild raw descriptors from already-parsed platform data and to build
//! fixtures for mock devices.

use crate::constants::{
    DT_CONFIG, DT_CONFIG_SIZE, DT_DEVICE, DT_DEVICE_SIZE, DT_ENDPOINT, DT_ENDPOINT_AUDIO_SIZE,
    DT_ENDPOINT_SIZE, DT_INTERFACE, DT_INTERFACE_SIZE, DT_STRING,
};
use crate::tree::{Configuration, Interface};
use crate::types::{
    ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
    StringDescriptor,
};
use bytes::BufMut;

impl DeviceDescriptor {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DT_DEVICE_SIZE);
        buf.put_u8(DT_DEVICE_SIZE as u8);
        buf.put_u8(DT_DEVICE);
        buf.put_u16_le(self.usb_version.0);
        buf.put_u8(self.class);
        buf.put_u8(self.subclass);
        buf.put_u8(self.protocol);
        buf.put_u8(self.max_packet_size_0);
        buf.put_u16_le(self.vendor_id);
        buf.put_u16_le(self.product_id);
        buf.put_u16_le(self.device_version.0);
        buf.put_u8(self.manufacturer_index);
        buf.put_u8(self.product_index);
        buf.put_u8(self.serial_number_index);
        buf.put_u8(self.num_configurations);
        buf
    }
}

impl ConfigurationDescriptor {
    /// Encode the 9-byte header exactly as stored
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DT_CONFIG_SIZE);
        buf.put_u8(DT_CONFIG_SIZE as u8);
        buf.put_u8(DT_CONFIG);
        buf.put_u16_le(self.total_length);
        buf.put_u8(self.num_interfaces);
        buf.put_u8(self.value);
        buf.put_u8(self.description_index);
        buf.put_u8(self.attributes);
        buf.put_u8(self.max_power);
        buf
    }
}

impl InterfaceDescriptor {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DT_INTERFACE_SIZE);
        buf.put_u8(DT_INTERFACE_SIZE as u8);
        buf.put_u8(DT_INTERFACE);
        buf.put_u8(self.number);
        buf.put_u8(self.alt_setting);
        buf.put_u8(self.num_endpoints);
        buf.put_u8(self.class);
        buf.put_u8(self.subclass);
        buf.put_u8(self.protocol);
        buf.put_u8(self.description_index);
        buf
    }
}

impl EndpointDescriptor {
    /// Encode as 7 bytes, or 9 when the audio fields are set
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = if self.is_audio_layout() {
            DT_ENDPOINT_AUDIO_SIZE
        } else {
            DT_ENDPOINT_SIZE
        };

        let mut buf = Vec::with_capacity(size);
        buf.put_u8(size as u8);
        buf.put_u8(DT_ENDPOINT);
        buf.put_u8(self.address.0);
        buf.put_u8(self.attributes);
        buf.put_u16_le(self.max_packet_size);
        buf.put_u8(self.interval);
        if size == DT_ENDPOINT_AUDIO_SIZE {
            buf.put_u8(self.refresh);
            buf.put_u8(self.synch_address);
        }
        buf
    }
}

impl StringDescriptor {
    /// Encode, truncating to the 126 code units a descriptor can hold
    pub fn to_bytes(&self) -> Vec<u8> {
        let units = &self.0[..self.0.len().min(126)];
        let mut buf = Vec::with_capacity(2 + units.len() * 2);
        buf.put_u8((2 + units.len() * 2) as u8);
        buf.put_u8(DT_STRING);
        for unit in units {
            buf.put_u16_le(*unit);
        }
        buf
    }
}

impl Interface {
    /// Interface descriptor, its extra bytes, then each endpoint with extras
    ///
    /// bNumEndpoints is taken from the endpoint list.
    pub fn to_bytes(&self) -> Vec<u8> {
        let descriptor = InterfaceDescriptor {
            num_endpoints: self.endpoints.len() as u8,
            ..self.descriptor
        };

        let mut buf = descriptor.to_bytes();
        buf.extend_from_slice(&self.extra);
        for endpoint in &self.endpoints {
            buf.extend_from_slice(&endpoint.descriptor.to_bytes());
            buf.extend_from_slice(&endpoint.extra);
        }
        buf
    }
}

impl Configuration {
    /// Full configuration blob with wTotalLength recomputed
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = self.extra.clone();
        for interface in &self.interfaces {
            body.extend_from_slice(&interface.to_bytes());
        }

        let header = ConfigurationDescriptor {
            total_length: (DT_CONFIG_SIZE + body.len()) as u16,
            ..self.descriptor
        };

        let mut buf = header.to_bytes();
        buf.extend_from_slice(&body);
        buf
    }
}

//! Parsed configuration hierarchy
//!
//! A configuration blob parses into a [`Configuration`] holding its
//! interfaces in wire order. Alternate settings of the same interface are
//! sibling [`Interface`] entries sharing an interface number.

use crate::types::{
    ConfigurationDescriptor, Direction, EndpointAddress, EndpointDescriptor, InterfaceDescriptor,
    TransferKind,
};
use serde::{Deserialize, Serialize};

/// Endpoint plus any class-specific descriptors that followed it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub descriptor: EndpointDescriptor,
    pub extra: Vec<u8>,
}

impl Endpoint {
    pub fn address(&self) -> EndpointAddress {
        self.descriptor.address
    }

    pub fn direction(&self) -> Direction {
        self.descriptor.direction()
    }

    pub fn transfer_kind(&self) -> TransferKind {
        self.descriptor.transfer_kind()
    }

    pub fn max_packet_size(&self) -> u16 {
        self.descriptor.max_packet_size
    }

    pub fn interval(&self) -> u8 {
        self.descriptor.interval
    }
}

/// One alternate setting of an interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<Endpoint>,
    /// Class-specific descriptors between the interface and its first endpoint
    pub extra: Vec<u8>,
}

impl Interface {
    pub fn number(&self) -> u8 {
        self.descriptor.number
    }

    pub fn alt_setting(&self) -> u8 {
        self.descriptor.alt_setting
    }

    pub fn class(&self) -> u8 {
        self.descriptor.class
    }

    pub fn endpoint(&self, address: EndpointAddress) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| ep.address() == address)
    }
}

/// A full configuration: header, interfaces and their endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub descriptor: ConfigurationDescriptor,
    pub interfaces: Vec<Interface>,
    /// Descriptors between the header and the first interface
    pub extra: Vec<u8>,
}

impl Configuration {
    /// bConfigurationValue
    pub fn value(&self) -> u8 {
        self.descriptor.value
    }

    pub fn self_powered(&self) -> bool {
        self.descriptor.self_powered()
    }

    pub fn remote_wakeup(&self) -> bool {
        self.descriptor.remote_wakeup()
    }

    pub fn max_power_ma(&self) -> u16 {
        self.descriptor.max_power_ma()
    }

    /// Look up an alternate setting of an interface
    pub fn interface(&self, number: u8, alt_setting: u8) -> Option<&Interface> {
        self.interfaces
            .iter()
            .find(|i| i.number() == number && i.alt_setting() == alt_setting)
    }

    /// All alternate settings of one interface number, in wire order
    pub fn alt_settings(&self, number: u8) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter().filter(move |i| i.number() == number)
    }

    pub fn has_interface(&self, number: u8) -> bool {
        self.interfaces.iter().any(|i| i.number() == number)
    }

    /// Distinct interface numbers in ascending order
    pub fn interface_numbers(&self) -> Vec<u8> {
        let mut numbers: Vec<u8> = self.interfaces.iter().map(|i| i.number()).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }
}

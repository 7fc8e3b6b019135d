//! Error types for the USB host layer

use crate::handle::HandleState;
use crate::platform::{DeviceLocation, PlatformError};
use crate::transfer::TransferContext;
use descriptors::{DescriptorError, EndpointAddress, TransferKind};
use thiserror::Error;

/// Coarse classification of [`HostError`], stable for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Enumeration,
    DeviceUnavailable,
    InvalidConfiguration,
    InterfaceBusy,
    NoSuchInterface,
    NoSuchAltSetting,
    InterfaceNotClaimed,
    NoSuchEndpoint,
    WrongEndpointType,
    InvalidState,
    Stalled,
    Timeout,
    Disconnected,
    Cancelled,
    Overflow,
    InvalidArgument,
    SessionClosed,
    Platform,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Enumeration failed: {reason}")]
    Enumeration { reason: String },

    #[error("Malformed descriptor from device {location}: {source}")]
    MalformedDescriptor {
        location: DeviceLocation,
        #[source]
        source: DescriptorError,
    },

    #[error("Device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("Configuration {value} does not exist (available: {available:?})")]
    InvalidConfiguration { value: u8, available: Vec<u8> },

    #[error("Interface {interface} is busy: {reason}")]
    InterfaceBusy { interface: u8, reason: String },

    #[error("Interface {interface} is not part of configuration {configuration}")]
    NoSuchInterface { interface: u8, configuration: u8 },

    #[error("Interface {interface} has no alternate setting {alt_setting}")]
    NoSuchAltSetting { interface: u8, alt_setting: u8 },

    #[error("Interface {interface} is not claimed")]
    InterfaceNotClaimed { interface: u8 },

    #[error("Endpoint {endpoint} is not in the active setting of any claimed interface")]
    NoSuchEndpoint { endpoint: EndpointAddress },

    #[error("Endpoint {endpoint} is a {actual} endpoint, not {expected}")]
    WrongEndpointType {
        endpoint: EndpointAddress,
        expected: TransferKind,
        actual: TransferKind,
    },

    #[error("Cannot {operation} while the handle is {state}")]
    InvalidState {
        operation: &'static str,
        state: HandleState,
    },

    #[error("Endpoint stalled: {0}")]
    Stalled(TransferContext),

    #[error("Transfer timed out: {0}")]
    Timeout(TransferContext),

    #[error("Device disconnected during {during}")]
    Disconnected { during: String },

    #[error("Transfer cancelled: {0}")]
    Cancelled(TransferContext),

    #[error("Device returned more data than requested: {0}")]
    Overflow(TransferContext),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Session has been torn down")]
    SessionClosed,

    #[error("Platform error during {operation}: {source}")]
    Platform {
        operation: &'static str,
        #[source]
        source: PlatformError,
    },
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::Enumeration { .. } | HostError::MalformedDescriptor { .. } => {
                ErrorKind::Enumeration
            }
            HostError::DeviceUnavailable { .. } => ErrorKind::DeviceUnavailable,
            HostError::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            HostError::InterfaceBusy { .. } => ErrorKind::InterfaceBusy,
            HostError::NoSuchInterface { .. } => ErrorKind::NoSuchInterface,
            HostError::NoSuchAltSetting { .. } => ErrorKind::NoSuchAltSetting,
            HostError::InterfaceNotClaimed { .. } => ErrorKind::InterfaceNotClaimed,
            HostError::NoSuchEndpoint { .. } => ErrorKind::NoSuchEndpoint,
            HostError::WrongEndpointType { .. } => ErrorKind::WrongEndpointType,
            HostError::InvalidState { .. } => ErrorKind::InvalidState,
            HostError::Stalled(_) => ErrorKind::Stalled,
            HostError::Timeout(_) => ErrorKind::Timeout,
            HostError::Disconnected { .. } => ErrorKind::Disconnected,
            HostError::Cancelled(_) => ErrorKind::Cancelled,
            HostError::Overflow(_) => ErrorKind::Overflow,
            HostError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            HostError::SessionClosed => ErrorKind::SessionClosed,
            HostError::Platform { .. } => ErrorKind::Platform,
        }
    }

    /// Endpoint, size and timing of the failed transfer, if any
    pub fn transfer_context(&self) -> Option<&TransferContext> {
        match self {
            HostError::Stalled(ctx)
            | HostError::Timeout(ctx)
            | HostError::Cancelled(ctx)
            | HostError::Overflow(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Map a platform failure on an open device
    ///
    /// Vanished devices become [`HostError::Disconnected`]; everything else
    /// keeps the platform error as its source.
    pub(crate) fn from_platform(
        operation: &'static str,
        location: DeviceLocation,
        err: PlatformError,
    ) -> Self {
        match err {
            PlatformError::NoDevice | PlatformError::NotFound => HostError::Disconnected {
                during: format!("{} on device {}", operation, location),
            },
            source => HostError::Platform { operation, source },
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transfer_errors_carry_context() {
        let ctx = TransferContext {
            kind: TransferKind::Bulk,
            endpoint: EndpointAddress(0x82),
            requested: 512,
            elapsed: Duration::from_millis(100),
        };
        let err = HostError::Timeout(ctx);

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.transfer_context().map(|c| c.requested), Some(512));
        assert!(err.to_string().contains("0x82"));
    }

    #[test]
    fn test_platform_mapping() {
        let location = DeviceLocation::new(1, 5);

        let err = HostError::from_platform("claim_interface", location, PlatformError::NoDevice);
        assert_eq!(err.kind(), ErrorKind::Disconnected);
        assert!(err.to_string().contains("001:005"));

        let err = HostError::from_platform("claim_interface", location, PlatformError::Access);
        assert_eq!(err.kind(), ErrorKind::Platform);
    }

    #[test]
    fn test_malformed_descriptor_is_enumeration_kind() {
        let err = HostError::MalformedDescriptor {
            location: DeviceLocation::new(2, 3),
            source: DescriptorError::OddStringLength(5),
        };
        assert_eq!(err.kind(), ErrorKind::Enumeration);
    }
}

//! Platform capability
//!
//! Everything the host layer needs from the operating system is expressed by
//! the [`UsbPlatform`] trait: listing buses and raw descriptors, opening
//! devices, and submitting transfers whose completion is reported through a
//! [`Completion`] token. The native backend wraps rusb; [`mock::MockPlatform`]
//! simulates devices for tests.

pub mod mock;
#[cfg(feature = "rusb")]
pub mod rusb_backend;

use descriptors::{Direction, EndpointAddress, TransferKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use crate::transfer::Completion;

/// Bus number and device address, unique among attached devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceLocation {
    pub bus: u32,
    pub address: u8,
}

impl DeviceLocation {
    pub fn new(bus: u32, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Platform-level handle to an opened device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformHandle(pub u64);

/// Identifier of one submitted transfer, unique within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

/// One bus as reported by the platform
#[derive(Debug, Clone)]
pub struct RawBus {
    pub location: u32,
    /// Platform directory name of the bus (e.g. "001")
    pub name: String,
    pub devices: Vec<RawDevice>,
}

/// One device with its unparsed descriptors
#[derive(Debug, Clone)]
pub struct RawDevice {
    pub address: u8,
    /// Platform file name of the device node (e.g. "004")
    pub file_name: String,
    pub device_descriptor: Vec<u8>,
    /// Full configuration blobs, in descriptor index order
    pub configurations: Vec<Vec<u8>>,
}

/// The 8-byte setup stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn direction(&self) -> Direction {
        Direction::from_request_type(self.request_type)
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// A transfer as handed to the platform
///
/// For IN transfers `buffer` only conveys the capacity; for OUT transfers it
/// holds the payload.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub endpoint: EndpointAddress,
    pub kind: TransferKind,
    pub setup: Option<SetupPacket>,
    pub buffer: Vec<u8>,
    /// Zero means no timeout
    pub timeout: Duration,
}

impl TransferRequest {
    pub fn is_in(&self) -> bool {
        match &self.setup {
            Some(setup) => setup.direction() == Direction::In,
            None => self.endpoint.is_in(),
        }
    }
}

/// Final status reported by the platform for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    TimedOut,
    Stall,
    NoDevice,
    Cancelled,
    Overflow,
    Error,
}

/// Result of one transfer as delivered through its [`Completion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: TransferStatus,
    /// Bytes received (IN transfers only)
    pub data: Vec<u8>,
    pub actual_length: usize,
    pub message: Option<String>,
}

impl TransferOutcome {
    /// Successful IN transfer; a short read is still a success
    pub fn received(data: Vec<u8>) -> Self {
        Self {
            status: TransferStatus::Completed,
            actual_length: data.len(),
            data,
            message: None,
        }
    }

    /// Successful OUT transfer
    pub fn sent(actual_length: usize) -> Self {
        Self {
            status: TransferStatus::Completed,
            data: Vec::new(),
            actual_length,
            message: None,
        }
    }

    pub fn failed(status: TransferStatus) -> Self {
        Self {
            status,
            data: Vec::new(),
            actual_length: 0,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::failed(TransferStatus::Error)
        }
    }
}

/// Hot-plug notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEvent {
    Arrived(DeviceLocation),
    Left(DeviceLocation),
}

/// Errors reported by platform operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("Entity not found")]
    NotFound,

    #[error("No such device (it may have been disconnected)")]
    NoDevice,

    #[error("Resource busy")]
    Busy,

    #[error("Access denied (insufficient permissions)")]
    Access,

    #[error("Invalid parameter")]
    InvalidParam,

    #[error("Operation not supported on this platform")]
    NotSupported,

    #[error("Platform unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

/// Host controller access
///
/// Implementations must be safe to call from any thread. `submit_transfer`
/// must not block on the transfer itself: the outcome is delivered later
/// through the [`Completion`], possibly before `submit_transfer` returns.
/// When `submit_transfer` fails the completion is dropped unfired.
pub trait UsbPlatform: Send + Sync {
    fn list_buses(&self) -> Result<Vec<RawBus>, PlatformError>;

    fn open_device(&self, location: DeviceLocation) -> Result<PlatformHandle, PlatformError>;

    /// Release the handle; outstanding transfers complete as cancelled
    fn close_device(&self, handle: PlatformHandle);

    fn set_configuration(&self, handle: PlatformHandle, value: u8) -> Result<(), PlatformError>;

    fn claim_interface(&self, handle: PlatformHandle, interface: u8) -> Result<(), PlatformError>;

    fn release_interface(&self, handle: PlatformHandle, interface: u8)
    -> Result<(), PlatformError>;

    fn set_alt_setting(
        &self,
        handle: PlatformHandle,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), PlatformError>;

    fn submit_transfer(
        &self,
        handle: PlatformHandle,
        request: TransferRequest,
        completion: Completion,
    ) -> Result<(), PlatformError>;

    /// Ask for early completion; the completion still fires exactly once
    ///
    /// Returns [`PlatformError::NotFound`] once the transfer has completed.
    fn cancel_transfer(&self, handle: PlatformHandle, id: TransferId) -> Result<(), PlatformError>;

    /// Port reset
    ///
    /// Returns [`PlatformError::NotFound`] when the device re-enumerated and
    /// the handle no longer refers to it, and [`PlatformError::Busy`] while
    /// transfers the platform could not abort still hold the device. Claims
    /// survive a reset that keeps the handle.
    fn reset_device(&self, handle: PlatformHandle) -> Result<(), PlatformError>;

    fn clear_endpoint_halt(
        &self,
        handle: PlatformHandle,
        endpoint: EndpointAddress,
    ) -> Result<(), PlatformError>;

    /// Hot-plug notifications, if the platform supports them
    fn topology_events(&self) -> Option<async_channel::Receiver<TopologyEvent>> {
        None
    }
}

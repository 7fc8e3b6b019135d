//! Device handle
//!
//! A [`DeviceHandle`] owns one open platform handle and tracks the device's
//! configuration and interface claims:
//!
//! ```text
//! Closed --open--> Open --set_configuration--> Configured --claim_interface--> (claimed)*
//! ```
//!
//! State changes take `&mut self`; transfers (see the transfer engine) take
//! `&self` so several endpoints can be driven at once.

use crate::error::{HostError, Result};
use crate::platform::{DeviceLocation, PlatformError, PlatformHandle};
use crate::session::Session;
use crate::topology::Device;
use crate::transfer::{EndpointQueues, InFlightTable};
use descriptors::{Configuration, Endpoint, EndpointAddress};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandleState {
    Closed,
    Open,
    Configured,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleState::Closed => "closed",
            HandleState::Open => "open",
            HandleState::Configured => "configured",
        };
        f.write_str(name)
    }
}

/// What happened to the device during [`DeviceHandle::reset`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Same device, same handle; configuration and claims must be redone
    Retained,
    /// The device re-enumerated; the handle is closed and the device must
    /// be found and opened again
    Reenumerated,
}

/// Exclusive handle to one opened device
pub struct DeviceHandle {
    pub(crate) session: Session,
    device: Arc<Device>,
    platform_handle: Option<PlatformHandle>,
    active_configuration: Option<u8>,
    /// Claimed interface number -> active alternate setting
    claimed: BTreeMap<u8, u8>,
    pub(crate) in_flight: Arc<InFlightTable>,
    pub(crate) queues: EndpointQueues,
}

impl DeviceHandle {
    pub(crate) fn new(
        session: Session,
        device: Arc<Device>,
        platform_handle: PlatformHandle,
        in_flight: Arc<InFlightTable>,
    ) -> Self {
        Self {
            session,
            device,
            platform_handle: Some(platform_handle),
            active_configuration: None,
            claimed: BTreeMap::new(),
            in_flight,
            queues: EndpointQueues::default(),
        }
    }

    /// The enumeration record this handle was opened from
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn location(&self) -> DeviceLocation {
        self.device.location()
    }

    pub fn state(&self) -> HandleState {
        if self.platform_handle.is_none() || !self.session.is_live() {
            HandleState::Closed
        } else if self.active_configuration.is_some() {
            HandleState::Configured
        } else {
            HandleState::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() != HandleState::Closed
    }

    pub fn active_configuration(&self) -> Option<u8> {
        self.active_configuration
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.claimed.keys().copied().collect()
    }

    /// Active alternate setting of a claimed interface
    pub fn active_alt_setting(&self, interface: u8) -> Option<u8> {
        self.claimed.get(&interface).copied()
    }

    /// Transfers submitted through this handle that have not completed
    pub fn pending_transfers(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn require_open(&self, operation: &'static str) -> Result<PlatformHandle> {
        if !self.session.is_live() {
            return Err(HostError::SessionClosed);
        }
        self.platform_handle.ok_or(HostError::InvalidState {
            operation,
            state: HandleState::Closed,
        })
    }

    fn active_config(&self) -> Option<&Configuration> {
        self.active_configuration
            .and_then(|value| self.device.configuration(value))
    }

    /// Endpoint in the active alternate setting of a claimed interface
    pub(crate) fn claimed_endpoint(&self, address: EndpointAddress) -> Result<&Endpoint> {
        self.active_config()
            .and_then(|config| {
                self.claimed.iter().find_map(|(&number, &alt)| {
                    config.interface(number, alt)?.endpoint(address)
                })
            })
            .ok_or(HostError::NoSuchEndpoint { endpoint: address })
    }

    fn interface_has_pending(&self, interface: u8) -> bool {
        let Some(&alt) = self.claimed.get(&interface) else {
            return false;
        };
        let Some(setting) = self
            .active_config()
            .and_then(|config| config.interface(interface, alt))
        else {
            return false;
        };

        let endpoints: Vec<EndpointAddress> =
            setting.endpoints.iter().map(|ep| ep.address()).collect();
        self.in_flight.any_on(&endpoints)
    }

    fn platform_error(&self, operation: &'static str, err: PlatformError) -> HostError {
        HostError::from_platform(operation, self.location(), err)
    }

    /// Select the active configuration
    ///
    /// Valid when open or configured. Any claimed interfaces are released
    /// first.
    pub fn set_configuration(&mut self, value: u8) -> Result<()> {
        let handle = self.require_open("set a configuration")?;

        if self.device.configuration(value).is_none() {
            return Err(HostError::InvalidConfiguration {
                value,
                available: self.device.configuration_values(),
            });
        }

        if let Some(&busy) = self
            .claimed
            .keys()
            .find(|&&number| self.interface_has_pending(number))
        {
            return Err(HostError::InterfaceBusy {
                interface: busy,
                reason: "transfers are pending".to_string(),
            });
        }

        self.release_all_claims(handle);
        self.active_configuration = None;

        self.session
            .platform()
            .set_configuration(handle, value)
            .map_err(|e| self.platform_error("set_configuration", e))?;

        self.active_configuration = Some(value);
        debug!(
            "Set configuration {} on device {}",
            value,
            self.location()
        );
        Ok(())
    }

    /// Claim an interface of the active configuration
    ///
    /// The interface starts at its lowest alternate setting. Claiming an
    /// interface this handle already holds is a no-op.
    pub fn claim_interface(&mut self, interface: u8) -> Result<()> {
        let handle = self.require_open("claim an interface")?;

        let Some(config) = self.active_config() else {
            return Err(HostError::InvalidState {
                operation: "claim an interface",
                state: self.state(),
            });
        };

        if !config.has_interface(interface) {
            return Err(HostError::NoSuchInterface {
                interface,
                configuration: config.value(),
            });
        }

        if self.claimed.contains_key(&interface) {
            return Ok(());
        }

        let default_alt = config
            .alt_settings(interface)
            .map(|setting| setting.alt_setting())
            .min()
            .unwrap_or(0);

        self.session
            .platform()
            .claim_interface(handle, interface)
            .map_err(|e| match e {
                PlatformError::Busy => HostError::InterfaceBusy {
                    interface,
                    reason: "claimed by another handle or process".to_string(),
                },
                other => self.platform_error("claim_interface", other),
            })?;

        self.claimed.insert(interface, default_alt);
        debug!(
            "Claimed interface {} on device {}",
            interface,
            self.location()
        );
        Ok(())
    }

    /// Switch a claimed interface to another alternate setting
    pub fn set_alt_interface(&mut self, interface: u8, alt_setting: u8) -> Result<()> {
        let handle = self.require_open("select an alternate setting")?;

        if !self.claimed.contains_key(&interface) {
            return Err(HostError::InterfaceNotClaimed { interface });
        }

        let exists = self
            .active_config()
            .is_some_and(|config| config.interface(interface, alt_setting).is_some());
        if !exists {
            return Err(HostError::NoSuchAltSetting {
                interface,
                alt_setting,
            });
        }

        if self.interface_has_pending(interface) {
            return Err(HostError::InterfaceBusy {
                interface,
                reason: "transfers are pending".to_string(),
            });
        }

        self.session
            .platform()
            .set_alt_setting(handle, interface, alt_setting)
            .map_err(|e| self.platform_error("set_alt_setting", e))?;

        self.claimed.insert(interface, alt_setting);
        debug!(
            "Interface {} on device {} switched to alternate setting {}",
            interface,
            self.location(),
            alt_setting
        );
        Ok(())
    }

    /// Release a claimed interface
    ///
    /// Fails with `InterfaceBusy` while transfers on its endpoints are
    /// pending; cancel them first.
    pub fn release_interface(&mut self, interface: u8) -> Result<()> {
        let handle = self.require_open("release an interface")?;

        if !self.claimed.contains_key(&interface) {
            return Err(HostError::InterfaceNotClaimed { interface });
        }

        if self.interface_has_pending(interface) {
            return Err(HostError::InterfaceBusy {
                interface,
                reason: "transfers are pending".to_string(),
            });
        }

        self.session
            .platform()
            .release_interface(handle, interface)
            .map_err(|e| self.platform_error("release_interface", e))?;

        self.claimed.remove(&interface);
        debug!(
            "Released interface {} on device {}",
            interface,
            self.location()
        );
        Ok(())
    }

    /// Port reset
    ///
    /// Outstanding transfers are cancelled and the configuration and claims
    /// are dropped. When the device re-enumerates the handle closes itself;
    /// use [`Session::wait_for_device`] to find it again. If a transfer the
    /// platform could not abort still holds the device, the reset is refused
    /// and the handle is left as it was.
    pub fn reset(&mut self) -> Result<ResetOutcome> {
        let handle = self.require_open("reset the device")?;
        let location = self.location();

        self.cancel_in_flight(handle);
        let result = self.session.platform().reset_device(handle);

        match result {
            Ok(()) => {
                self.active_configuration = None;
                self.release_all_claims(handle);
                debug!("Reset device {}", location);
                Ok(ResetOutcome::Retained)
            }
            // Transfers the platform could not abort still hold the device
            Err(PlatformError::Busy) => Err(self.platform_error("reset", PlatformError::Busy)),
            Err(PlatformError::NotFound) => {
                info!("Device {} re-enumerated after reset, closing handle", location);
                self.active_configuration = None;
                self.claimed.clear();
                self.close();
                Ok(ResetOutcome::Reenumerated)
            }
            Err(e) => {
                self.active_configuration = None;
                self.claimed.clear();
                Err(self.platform_error("reset", e))
            }
        }
    }

    /// Cancel outstanding transfers, release claims and close the handle
    ///
    /// Idempotent; also runs on drop.
    pub fn close(&mut self) {
        let Some(handle) = self.platform_handle.take() else {
            return;
        };
        let location = self.location();

        // After a teardown the session has already closed the platform handle
        if self.session.forget(location, handle) {
            self.cancel_in_flight(handle);
            self.release_all_claims(handle);
            self.session.platform().close_device(handle);
            debug!("Closed device {}", location);
        }

        self.claimed.clear();
        self.active_configuration = None;
    }

    fn cancel_in_flight(&self, handle: PlatformHandle) {
        for id in self.in_flight.ids() {
            if let Err(e) = self.session.platform().cancel_transfer(handle, id) {
                debug!("Could not cancel transfer {:?}: {}", id, e);
            }
        }
    }

    fn release_all_claims(&mut self, handle: PlatformHandle) {
        for interface in std::mem::take(&mut self.claimed).into_keys() {
            if let Err(e) = self
                .session
                .platform()
                .release_interface(handle, interface)
            {
                warn!("Failed to release interface {}: {}", interface, e);
            } else {
                debug!(
                    "Released interface {} on device {}",
                    interface,
                    self.location()
                );
            }
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("location", &self.location())
            .field("state", &self.state())
            .field("active_configuration", &self.active_configuration)
            .field("claimed", &self.claimed)
            .finish()
    }
}

//! Process-wide USB session
//!
//! A [`Session`] owns the platform capability and the registry of open
//! handles. Clones share the same session. [`Session::teardown`] cancels
//! every outstanding transfer and closes every handle; it also runs when the
//! last clone is dropped.

use crate::config::SessionConfig;
use crate::error::{HostError, Result};
use crate::filter::DeviceFilter;
use crate::handle::DeviceHandle;
use crate::platform::{DeviceLocation, PlatformError, PlatformHandle, TransferId, UsbPlatform};
use crate::stats::{TransferStats, TransferStatsSnapshot};
use crate::topology::{self, Device, Topology};
use crate::transfer::InFlightTable;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    platform: Arc<dyn UsbPlatform>,
    config: SessionConfig,
    stats: Arc<TransferStats>,
    next_transfer_id: AtomicU64,
    state: Mutex<SessionState>,
}

struct SessionState {
    live: bool,
    open: HashMap<DeviceLocation, OpenRecord>,
}

struct OpenRecord {
    handle: PlatformHandle,
    in_flight: Arc<InFlightTable>,
}

impl SessionInner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self) -> usize {
        let records: Vec<(DeviceLocation, OpenRecord)> = {
            let mut state = self.lock_state();
            if !state.live {
                return 0;
            }
            state.live = false;
            state.open.drain().collect()
        };

        let closed = records.len();
        for (location, record) in records {
            for id in record.in_flight.ids() {
                if let Err(e) = self.platform.cancel_transfer(record.handle, id) {
                    debug!("Could not cancel transfer {:?} on {}: {}", id, location, e);
                }
            }
            self.platform.close_device(record.handle);
            debug!("Closed device {} during teardown", location);
        }
        closed
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Session {
    /// Start a session on the given platform
    pub fn init(platform: Arc<dyn UsbPlatform>, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        info!("USB session initialized");
        Ok(Self {
            inner: Arc::new(SessionInner {
                platform,
                config,
                stats: Arc::new(TransferStats::default()),
                next_transfer_id: AtomicU64::new(1),
                state: Mutex::new(SessionState {
                    live: true,
                    open: HashMap::new(),
                }),
            }),
        })
    }

    /// Start a session on the host's libusb
    #[cfg(feature = "rusb")]
    pub fn native(config: SessionConfig) -> Result<Self> {
        let platform = crate::platform::rusb_backend::RusbPlatform::new().map_err(|source| {
            HostError::Platform {
                operation: "session init",
                source,
            }
        })?;
        Self::init(Arc::new(platform), config)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> TransferStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock_state().live
    }

    /// Number of handles currently open in this session
    pub fn open_handles(&self) -> usize {
        self.inner.lock_state().open.len()
    }

    pub(crate) fn platform(&self) -> &Arc<dyn UsbPlatform> {
        &self.inner.platform
    }

    pub(crate) fn stats_handle(&self) -> &Arc<TransferStats> {
        &self.inner.stats
    }

    pub(crate) fn next_transfer_id(&self) -> TransferId {
        TransferId(self.inner.next_transfer_id.fetch_add(1, Ordering::Relaxed))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(HostError::SessionClosed)
        }
    }

    /// Fresh topology snapshot, restricted to the configured filters
    pub fn enumerate(&self) -> Result<Topology> {
        self.ensure_live()?;
        topology::enumerate(self.inner.platform.as_ref(), &self.inner.config.filters)
    }

    /// Snapshot with manufacturer, product and serial strings resolved
    ///
    /// Each device is opened briefly; devices that cannot be opened keep
    /// empty strings.
    pub async fn enumerate_with_strings(&self) -> Result<Topology> {
        let mut topology = self.enumerate()?;

        for device in topology.buses.iter_mut().flat_map(|bus| bus.devices.iter_mut()) {
            match self.open(device) {
                Ok(handle) => device.strings = handle.read_device_strings().await,
                Err(e) => debug!(
                    "Skipping strings for device {}: {}",
                    device.location(),
                    e
                ),
            }
        }

        Ok(topology)
    }

    /// Open a device from a topology snapshot
    pub fn open(&self, device: &Device) -> Result<DeviceHandle> {
        let location = device.location();
        let unavailable = |reason: String| HostError::DeviceUnavailable {
            device: location.to_string(),
            reason,
        };

        let mut state = self.inner.lock_state();
        if !state.live {
            return Err(HostError::SessionClosed);
        }
        if state.open.contains_key(&location) {
            return Err(unavailable("already open in this session".to_string()));
        }

        let handle = self
            .inner
            .platform
            .open_device(location)
            .map_err(|e| match e {
                PlatformError::NotFound | PlatformError::NoDevice => {
                    unavailable("device is no longer present".to_string())
                }
                PlatformError::Busy | PlatformError::Access => {
                    unavailable(format!("held by another process ({})", e))
                }
                source => HostError::Platform {
                    operation: "open",
                    source,
                },
            })?;

        let in_flight = Arc::new(InFlightTable::default());
        state.open.insert(
            location,
            OpenRecord {
                handle,
                in_flight: in_flight.clone(),
            },
        );
        drop(state);

        debug!("Opened device {} as {:?}", location, handle);
        Ok(DeviceHandle::new(
            self.clone(),
            Arc::new(device.clone()),
            handle,
            in_flight,
        ))
    }

    /// Remove the registry entry for a closing handle
    ///
    /// Returns false when teardown already closed it.
    pub(crate) fn forget(&self, location: DeviceLocation, handle: PlatformHandle) -> bool {
        let mut state = self.inner.lock_state();
        match state.open.get(&location) {
            Some(record) if record.handle == handle => {
                state.open.remove(&location);
                true
            }
            _ => false,
        }
    }

    /// Wait until a device matching `filter` is present
    ///
    /// Re-enumerates with exponential backoff; hot-plug events from the
    /// platform cut the wait short. Fails with `DeviceUnavailable` once
    /// `timeout` has passed.
    pub async fn wait_for_device(&self, filter: &DeviceFilter, timeout: Duration) -> Result<Device> {
        let deadline = Instant::now() + timeout;
        let settings = &self.inner.config.reenumeration;
        let mut backoff = settings.initial_backoff();
        let mut events = self.inner.platform.topology_events();

        loop {
            let topology = self.enumerate()?;
            if let Some(device) = topology.find(filter) {
                debug!("Device {} matching {} is present", device.location(), filter);
                return Ok(device.clone());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HostError::DeviceUnavailable {
                    device: filter.to_string(),
                    reason: format!("not present after {:?}", timeout),
                });
            }

            let wait = backoff.min(deadline - now);
            match &events {
                Some(receiver) => {
                    if let Ok(Err(_)) = tokio::time::timeout(wait, receiver.recv()).await {
                        warn!("Topology event channel closed, polling only");
                        events = None;
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
            backoff = (backoff * 2).min(settings.max_backoff());
        }
    }

    /// Cancel all transfers and close all handles
    ///
    /// Handles still held by callers become closed; further operations on
    /// them fail with `SessionClosed`. Idempotent.
    pub fn teardown(&self) {
        let closed = self.inner.teardown();
        info!("USB session torn down ({} handles closed)", closed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("live", &self.is_live())
            .field("open_handles", &self.open_handles())
            .finish()
    }
}

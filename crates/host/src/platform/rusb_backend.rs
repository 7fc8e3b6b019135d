//! libusb platform via rusb
//!
//! rusb hands out descriptors already parsed, so the raw blobs the
//! enumerator expects are rebuilt with the descriptor encoder. Class-specific
//! extra descriptors are not carried over.
//!
//! Transfers use libusb's synchronous API, one thread per transfer, and each
//! transfer is a single libusb call bounded by the caller's timeout. libusb
//! cannot abort such a call: cancelling only marks the running transfer,
//! which then reports `Cancelled` if it ends by timing out.
//!
//! Configuration changes need the libusb handle to themselves. While
//! transfers are running on it they fail with `Busy` instead of waiting.

use super::{
    Completion, DeviceLocation, PlatformError, PlatformHandle, RawBus, RawDevice, TopologyEvent,
    TransferId, TransferOutcome, TransferRequest, TransferStatus, UsbPlatform,
};
use descriptors::{
    BcdVersion, ConfigurationDescriptor, DeviceDescriptor, Direction, EndpointAddress,
    EndpointDescriptor, InterfaceDescriptor, TransferKind,
};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError,
};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long the event thread blocks in libusb before checking for shutdown
const EVENT_POLL: Duration = Duration::from_millis(100);

/// Map rusb errors for non-transfer operations
pub fn map_rusb_error(err: rusb::Error) -> PlatformError {
    match err {
        rusb::Error::NotFound => PlatformError::NotFound,
        rusb::Error::NoDevice => PlatformError::NoDevice,
        rusb::Error::Busy => PlatformError::Busy,
        rusb::Error::Access => PlatformError::Access,
        rusb::Error::InvalidParam => PlatformError::InvalidParam,
        rusb::Error::NotSupported => PlatformError::NotSupported,
        e => PlatformError::Other(e.to_string()),
    }
}

/// Outcome of a transfer that libusb reported as failed
fn failed_outcome(err: rusb::Error) -> TransferOutcome {
    match err {
        rusb::Error::Timeout => TransferOutcome::failed(TransferStatus::TimedOut),
        rusb::Error::Pipe => TransferOutcome::failed(TransferStatus::Stall),
        rusb::Error::NoDevice => TransferOutcome::failed(TransferStatus::NoDevice),
        rusb::Error::Overflow => TransferOutcome::failed(TransferStatus::Overflow),
        rusb::Error::Interrupted => TransferOutcome::failed(TransferStatus::Cancelled),
        e => TransferOutcome::error(e.to_string()),
    }
}

fn endpoint_attributes(
    transfer_type: rusb::TransferType,
    sync_type: rusb::SyncType,
    usage_type: rusb::UsageType,
) -> u8 {
    let transfer = match transfer_type {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
    .as_bits();

    let sync = match sync_type {
        rusb::SyncType::NoSync => 0,
        rusb::SyncType::Asynchronous => 1,
        rusb::SyncType::Adaptive => 2,
        rusb::SyncType::Synchronous => 3,
    };

    let usage = match usage_type {
        rusb::UsageType::Data => 0,
        rusb::UsageType::Feedback => 1,
        rusb::UsageType::FeedbackData => 2,
        rusb::UsageType::Reserved => 3,
    };

    transfer | (sync << 2) | (usage << 4)
}

fn bcd(version: rusb::Version) -> BcdVersion {
    BcdVersion::from_parts(version.major(), version.minor(), version.sub_minor())
}

fn encode_device_descriptor(descriptor: &rusb::DeviceDescriptor) -> Vec<u8> {
    DeviceDescriptor {
        usb_version: bcd(descriptor.usb_version()),
        class: descriptor.class_code(),
        subclass: descriptor.sub_class_code(),
        protocol: descriptor.protocol_code(),
        max_packet_size_0: descriptor.max_packet_size(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        device_version: bcd(descriptor.device_version()),
        manufacturer_index: descriptor.manufacturer_string_index().unwrap_or(0),
        product_index: descriptor.product_string_index().unwrap_or(0),
        serial_number_index: descriptor.serial_number_string_index().unwrap_or(0),
        num_configurations: descriptor.num_configurations(),
    }
    .to_bytes()
}

fn encode_configuration(config: &rusb::ConfigDescriptor) -> Vec<u8> {
    let mut body = Vec::new();
    for interface in config.interfaces() {
        for setting in interface.descriptors() {
            let endpoints: Vec<EndpointDescriptor> = setting
                .endpoint_descriptors()
                .map(|ep| EndpointDescriptor {
                    address: EndpointAddress(ep.address()),
                    attributes: endpoint_attributes(
                        ep.transfer_type(),
                        ep.sync_type(),
                        ep.usage_type(),
                    ),
                    max_packet_size: ep.max_packet_size(),
                    interval: ep.interval(),
                    refresh: 0,
                    synch_address: 0,
                })
                .collect();

            let descriptor = InterfaceDescriptor {
                number: setting.interface_number(),
                alt_setting: setting.setting_number(),
                num_endpoints: endpoints.len() as u8,
                class: setting.class_code(),
                subclass: setting.sub_class_code(),
                protocol: setting.protocol_code(),
                description_index: setting.description_string_index().unwrap_or(0),
            };
            body.extend_from_slice(&descriptor.to_bytes());
            for endpoint in &endpoints {
                body.extend_from_slice(&endpoint.to_bytes());
            }
        }
    }

    let mut attributes = 0x80;
    if config.self_powered() {
        attributes |= 0x40;
    }
    if config.remote_wakeup() {
        attributes |= 0x20;
    }

    let header = ConfigurationDescriptor {
        total_length: (9 + body.len()) as u16,
        num_interfaces: config.num_interfaces(),
        value: config.number(),
        description_index: config.description_string_index().unwrap_or(0),
        attributes,
        max_power: (config.max_power() / 2).min(u8::MAX as u16) as u8,
    };

    let mut bytes = header.to_bytes();
    bytes.extend_from_slice(&body);
    bytes
}

fn raw_device(device: &Device<Context>) -> Result<RawDevice, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let configurations = (0..descriptor.num_configurations())
        .map(|index| device.config_descriptor(index).map(|c| encode_configuration(&c)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RawDevice {
        address: device.address(),
        file_name: format!("{:03}", device.address()),
        device_descriptor: encode_device_descriptor(&descriptor),
        configurations,
    })
}

fn location_of<T: UsbContext>(device: &Device<T>) -> DeviceLocation {
    DeviceLocation::new(device.bus_number() as u32, device.address())
}

/// Interfaces claimed through one handle
#[derive(Debug, Default)]
struct ClaimBook {
    claimed: BTreeSet<u8>,
    /// Claimed interfaces whose kernel driver we detached
    detached: BTreeSet<u8>,
}

impl ClaimBook {
    fn record(&mut self, interface: u8, detached: bool) {
        self.claimed.insert(interface);
        if detached {
            self.detached.insert(interface);
        }
    }

    /// Forget one claim; `Some(true)` when its kernel driver needs reattaching
    fn release(&mut self, interface: u8) -> Option<bool> {
        if !self.claimed.remove(&interface) {
            return None;
        }
        Some(self.detached.remove(&interface))
    }

    fn drain(&mut self) -> Vec<(u8, bool)> {
        let detached = std::mem::take(&mut self.detached);
        std::mem::take(&mut self.claimed)
            .into_iter()
            .map(|interface| (interface, detached.contains(&interface)))
            .collect()
    }

    fn clear(&mut self) {
        self.claimed.clear();
        self.detached.clear();
    }
}

/// libusb handle and the claims made through it
struct DeviceState {
    usb: rusb::DeviceHandle<Context>,
    claims: ClaimBook,
}

impl DeviceState {
    fn release_and_reattach(&mut self, location: DeviceLocation, interface: u8, reattach: bool) {
        if let Err(e) = self.usb.release_interface(interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
        if !reattach {
            return;
        }
        // Restore the device to kernel control
        if let Err(e) = self.usb.attach_kernel_driver(interface) {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                interface, e
            );
        } else {
            debug!(
                "Reattached kernel driver to interface {} on device {}",
                interface, location
            );
        }
    }
}

/// One device opened through libusb
struct OpenDevice {
    location: DeviceLocation,
    /// Shared by running transfers; configuration changes need it alone
    state: RwLock<DeviceState>,
}

impl OpenDevice {
    fn shared(&self) -> RwLockReadGuard<'_, DeviceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn exclusive(&self) -> Result<RwLockWriteGuard<'_, DeviceState>, PlatformError> {
        try_exclusive(&self.state).inspect_err(|_| {
            debug!(
                "Device {} has transfers running, refusing configuration change",
                self.location
            )
        })
    }
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        let location = self.location;
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (interface, reattach) in state.claims.drain() {
            state.release_and_reattach(location, interface, reattach);
        }
        debug!("Released libusb handle for device {}", location);
    }
}

/// Write access that fails with `Busy` instead of waiting for readers
fn try_exclusive<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, PlatformError> {
    match lock.try_write() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => Err(PlatformError::Busy),
    }
}

/// Transfers whose worker thread has not finished yet
#[derive(Debug, Default)]
struct RunningTransfers {
    /// Running id -> cancellation requested
    transfers: Mutex<HashMap<TransferId, bool>>,
}

impl RunningTransfers {
    fn start(&self, id: TransferId) {
        lock(&self.transfers).insert(id, false);
    }

    /// Mark a running transfer cancelled; false once it has finished
    fn request_cancel(&self, id: TransferId) -> bool {
        match lock(&self.transfers).get_mut(&id) {
            Some(cancelled) => {
                *cancelled = true;
                true
            }
            None => false,
        }
    }

    fn is_cancelled(&self, id: TransferId) -> bool {
        lock(&self.transfers).get(&id).copied().unwrap_or(false)
    }

    /// Forget a transfer, reporting whether it was cancelled while running
    fn finish(&self, id: TransferId) -> bool {
        lock(&self.transfers).remove(&id).unwrap_or(false)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.transfers).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}


/// Forwards libusb hot-plug callbacks to async receivers
struct HotplugForwarder {
    sender: async_channel::Sender<TopologyEvent>,
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        let location = location_of(&device);
        debug!("Hot-plug callback: device arrived at {}", location);
        let _ = self.sender.try_send(TopologyEvent::Arrived(location));
    }

    fn device_left(&mut self, device: Device<T>) {
        let location = location_of(&device);
        debug!("Hot-plug callback: device left {}", location);
        let _ = self.sender.try_send(TopologyEvent::Left(location));
    }
}

/// Event thread driving libusb hot-plug callbacks
struct HotplugThread {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    _registration: Mutex<Registration<Context>>,
}

impl HotplugThread {
    fn start(
        context: &Context,
        sender: async_channel::Sender<TopologyEvent>,
    ) -> Result<Self, rusb::Error> {
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(context, Box::new(HotplugForwarder { sender }))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let context = context.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("usb-events".to_string())
                .spawn(move || run_event_loop(context, shutdown))
                .map_err(|_| rusb::Error::Other)?
        };

        debug!("Hot-plug callbacks registered");
        Ok(Self {
            shutdown,
            thread: Some(thread),
            _registration: Mutex::new(registration),
        })
    }
}

impl Drop for HotplugThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("USB event thread panicked");
        }
    }
}

fn run_event_loop(context: Context, shutdown: Arc<AtomicBool>) {
    info!("USB event thread started");

    while !shutdown.load(Ordering::Relaxed) {
        match context.handle_events(Some(EVENT_POLL)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL);
            }
        }
    }

    info!("USB event thread stopped");
}

/// Platform backed by the host's libusb
pub struct RusbPlatform {
    context: Context,
    devices: Mutex<HashMap<PlatformHandle, Arc<OpenDevice>>>,
    next_handle: AtomicU64,
    running: Arc<RunningTransfers>,
    events: Option<async_channel::Receiver<TopologyEvent>>,
    _hotplug: Option<HotplugThread>,
}

impl RusbPlatform {
    pub fn new() -> Result<Self, PlatformError> {
        let context = Context::new().map_err(|e| PlatformError::Unavailable(e.to_string()))?;

        let (events, hotplug) = if rusb::has_hotplug() {
            let (sender, receiver) = async_channel::unbounded();
            match HotplugThread::start(&context, sender) {
                Ok(thread) => (Some(receiver), Some(thread)),
                Err(e) => {
                    warn!("Hot-plug registration failed, falling back to polling: {}", e);
                    (None, None)
                }
            }
        } else {
            debug!("libusb has no hot-plug support on this platform");
            (None, None)
        };

        info!("libusb platform initialized");
        Ok(Self {
            context,
            devices: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            running: Arc::new(RunningTransfers::default()),
            events,
            _hotplug: hotplug,
        })
    }

    fn open_device_for(&self, handle: PlatformHandle) -> Result<Arc<OpenDevice>, PlatformError> {
        lock(&self.devices)
            .get(&handle)
            .cloned()
            .ok_or(PlatformError::NotFound)
    }
}

impl UsbPlatform for RusbPlatform {
    fn list_buses(&self) -> Result<Vec<RawBus>, PlatformError> {
        let list = self.context.devices().map_err(map_rusb_error)?;

        let mut buses: BTreeMap<u32, Vec<RawDevice>> = BTreeMap::new();
        for device in list.iter() {
            let bus = buses.entry(device.bus_number() as u32).or_default();
            match raw_device(&device) {
                Ok(raw) => bus.push(raw),
                Err(e) => warn!(
                    "Skipping device {}: failed to read descriptors: {}",
                    location_of(&device),
                    e
                ),
            }
        }

        Ok(buses
            .into_iter()
            .map(|(location, mut devices)| {
                devices.sort_by_key(|d| d.address);
                RawBus {
                    location,
                    name: format!("{:03}", location),
                    devices,
                }
            })
            .collect())
    }

    fn open_device(&self, location: DeviceLocation) -> Result<PlatformHandle, PlatformError> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        let device = list
            .iter()
            .find(|d| location_of(d) == location)
            .ok_or(PlatformError::NotFound)?;

        let usb = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", location, e);
            map_rusb_error(e)
        })?;

        let id = PlatformHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        lock(&self.devices).insert(
            id,
            Arc::new(OpenDevice {
                location,
                state: RwLock::new(DeviceState {
                    usb,
                    claims: ClaimBook::default(),
                }),
            }),
        );
        debug!("Opened device {}", location);
        Ok(id)
    }

    fn close_device(&self, handle: PlatformHandle) {
        let Some(device) = lock(&self.devices).remove(&handle) else {
            return;
        };
        // Claims go with the last reference, after any running transfer
        debug!("Closed device {}", device.location);
    }

    fn set_configuration(&self, handle: PlatformHandle, value: u8) -> Result<(), PlatformError> {
        let device = self.open_device_for(handle)?;
        device
            .exclusive()?
            .usb
            .set_active_configuration(value)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&self, handle: PlatformHandle, interface: u8) -> Result<(), PlatformError> {
        let device = self.open_device_for(handle)?;
        let mut state = device.exclusive()?;

        let detached = match state.usb.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on device {}",
                    interface, device.location
                );
                match state.usb.detach_kernel_driver(interface) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface, e
                        );
                        false
                    }
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", interface);
                false
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        if let Err(e) = state.usb.claim_interface(interface) {
            if detached && let Err(e) = state.usb.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
            return Err(map_rusb_error(e));
        }
        state.claims.record(interface, detached);
        Ok(())
    }

    fn release_interface(
        &self,
        handle: PlatformHandle,
        interface: u8,
    ) -> Result<(), PlatformError> {
        let device = self.open_device_for(handle)?;
        let mut state = device.exclusive()?;
        let reattach = state
            .claims
            .release(interface)
            .ok_or(PlatformError::NotFound)?;

        state.release_and_reattach(device.location, interface, reattach);
        Ok(())
    }

    fn set_alt_setting(
        &self,
        handle: PlatformHandle,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), PlatformError> {
        let device = self.open_device_for(handle)?;
        device
            .exclusive()?
            .usb
            .set_alternate_setting(interface, alt_setting)
            .map_err(map_rusb_error)
    }

    fn submit_transfer(
        &self,
        handle: PlatformHandle,
        request: TransferRequest,
        completion: Completion,
    ) -> Result<(), PlatformError> {
        let device = self.open_device_for(handle)?;
        let id = completion.id();
        let running = self.running.clone();
        running.start(id);

        let worker = running.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("usb-transfer-{}", id.0))
            .spawn(move || {
                let mut outcome = if worker.is_cancelled(id) {
                    TransferOutcome::failed(TransferStatus::Cancelled)
                } else {
                    run_transfer(&device.shared(), &request)
                };

                let was_cancelled = worker.finish(id);
                if was_cancelled && outcome.status == TransferStatus::TimedOut {
                    outcome = TransferOutcome::failed(TransferStatus::Cancelled);
                }
                completion.complete(outcome);
            });

        if let Err(e) = spawned {
            running.finish(id);
            return Err(PlatformError::Other(format!(
                "failed to spawn transfer thread: {}",
                e
            )));
        }
        Ok(())
    }

    fn cancel_transfer(&self, handle: PlatformHandle, id: TransferId) -> Result<(), PlatformError> {
        self.open_device_for(handle)?;
        if self.running.request_cancel(id) {
            Ok(())
        } else {
            Err(PlatformError::NotFound)
        }
    }

    fn reset_device(&self, handle: PlatformHandle) -> Result<(), PlatformError> {
        let device = self.open_device_for(handle)?;
        let mut state = device.exclusive()?;

        match state.usb.reset() {
            // libusb restores configuration and claims on the same handle
            Ok(()) => Ok(()),
            Err(e) => {
                state.claims.clear();
                Err(map_rusb_error(e))
            }
        }
    }

    fn clear_endpoint_halt(
        &self,
        handle: PlatformHandle,
        endpoint: EndpointAddress,
    ) -> Result<(), PlatformError> {
        let device = self.open_device_for(handle)?;
        device
            .exclusive()?
            .usb
            .clear_halt(endpoint.0)
            .map_err(map_rusb_error)
    }

    fn topology_events(&self) -> Option<async_channel::Receiver<TopologyEvent>> {
        self.events.clone()
    }
}

fn run_transfer(state: &DeviceState, request: &TransferRequest) -> TransferOutcome {
    let usb = &state.usb;
    let endpoint = request.endpoint.0;

    match request.kind {
        TransferKind::Control => {
            let Some(setup) = request.setup else {
                return TransferOutcome::error("control transfer without setup packet");
            };

            if setup.direction() == Direction::In {
                let mut buffer = vec![0u8; setup.length as usize];
                match usb.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &mut buffer,
                    request.timeout,
                ) {
                    Ok(len) => {
                        buffer.truncate(len);
                        TransferOutcome::received(buffer)
                    }
                    Err(e) => failed_outcome(e),
                }
            } else {
                match usb.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &request.buffer,
                    request.timeout,
                ) {
                    Ok(len) => TransferOutcome::sent(len),
                    Err(e) => failed_outcome(e),
                }
            }
        }
        TransferKind::Bulk | TransferKind::Interrupt if request.is_in() => {
            read_in(request, |buffer, timeout| match request.kind {
                TransferKind::Interrupt => usb.read_interrupt(endpoint, buffer, timeout),
                _ => usb.read_bulk(endpoint, buffer, timeout),
            })
        }
        TransferKind::Bulk => match usb.write_bulk(endpoint, &request.buffer, request.timeout) {
            Ok(len) => TransferOutcome::sent(len),
            Err(e) => failed_outcome(e),
        },
        TransferKind::Interrupt => {
            match usb.write_interrupt(endpoint, &request.buffer, request.timeout) {
                Ok(len) => TransferOutcome::sent(len),
                Err(e) => failed_outcome(e),
            }
        }
        TransferKind::Isochronous => {
            TransferOutcome::error("isochronous transfers are not supported")
        }
    }
}

/// IN transfer as one libusb call bounded by the request's timeout
fn read_in(
    request: &TransferRequest,
    read: impl FnOnce(&mut [u8], Duration) -> rusb::Result<usize>,
) -> TransferOutcome {
    let mut buffer = vec![0u8; request.buffer.len()];
    match read(&mut buffer, request.timeout) {
        Ok(len) => {
            buffer.truncate(len);
            TransferOutcome::received(buffer)
        }
        Err(e) => failed_outcome(e),
    }
}

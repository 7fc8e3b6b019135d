//! In-memory platform for tests
//!
//! Devices are built from [`DeviceFixture`]s. Bulk and interrupt endpoints
//! behave as loopbacks: data written to OUT endpoint `n` is returned by IN
//! endpoint `n | 0x80`. Reads with nothing to return stay pending until data
//! arrives or they are cancelled. Standard GET_STATUS, GET_DESCRIPTOR,
//! GET_CONFIGURATION, SET_CONFIGURATION and CLEAR_FEATURE(ENDPOINT_HALT)
//! requests are answered from the fixture.
//!
//! Faults can be injected per device: stalled or hung endpoints, unplugging,
//! exclusive holds by "another process", cancellation requests that are
//! ignored, and resets that re-enumerate the device at a new address.

use super::{
    Completion, DeviceLocation, PlatformError, PlatformHandle, RawBus, RawDevice, TopologyEvent,
    TransferId, TransferOutcome, TransferRequest, TransferStatus, UsbPlatform,
};
use common::test_utils::DeviceFixture;
use descriptors::constants::{
    DT_CONFIG, DT_DEVICE, DT_STRING, ENDPOINT_IN, ENDPOINT_OUT, FEATURE_ENDPOINT_HALT,
    RECIP_DEVICE, RECIP_ENDPOINT, REQ_CLEAR_FEATURE, REQ_GET_CONFIGURATION, REQ_GET_DESCRIPTOR,
    REQ_GET_STATUS, REQ_SET_CONFIGURATION, TYPE_STANDARD, request_type,
};
use descriptors::{Configuration, EndpointAddress, StringDescriptor, TransferKind, parse_configuration};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

const STANDARD_DEVICE_IN: u8 = request_type(ENDPOINT_IN, TYPE_STANDARD, RECIP_DEVICE);
const STANDARD_DEVICE_OUT: u8 = request_type(ENDPOINT_OUT, TYPE_STANDARD, RECIP_DEVICE);
const STANDARD_ENDPOINT_IN: u8 = request_type(ENDPOINT_IN, TYPE_STANDARD, RECIP_ENDPOINT);
const STANDARD_ENDPOINT_OUT: u8 = request_type(ENDPOINT_OUT, TYPE_STANDARD, RECIP_ENDPOINT);

/// What a device does when it is reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetBehavior {
    /// Keep the address; open handles stay valid
    #[default]
    Retain,
    /// Disappear and come back at `new_address` after `delay`
    Reenumerate { new_address: u8, delay: Duration },
}

/// Calls observed by the mock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub opens: u64,
    pub closes: u64,
    pub submitted: u64,
    pub cancel_requests: u64,
    pub resets: u64,
    pub clear_halts: u64,
}

struct Pending {
    handle: PlatformHandle,
    endpoint: EndpointAddress,
    capacity: usize,
    /// False for transfers on hung endpoints, which only end on cancel
    awaiting_data: bool,
    completion: Completion,
}

type Ready = Vec<(Completion, TransferOutcome)>;

struct MockDevice {
    device_bytes: Vec<u8>,
    configuration_bytes: Vec<Vec<u8>>,
    configurations: Vec<Configuration>,
    strings: BTreeMap<u8, String>,
    language_ids: Vec<u16>,

    held_elsewhere: bool,
    busy_interfaces: HashSet<u8>,
    reset_behavior: ResetBehavior,

    opened_by: Option<PlatformHandle>,
    configuration: Option<u8>,
    claimed: BTreeSet<u8>,
    alt_settings: HashMap<u8, u8>,

    /// Queued data per IN endpoint address
    loopback: HashMap<u8, VecDeque<Vec<u8>>>,
    pending: Vec<Pending>,
    halted: HashSet<u8>,
    hung: HashSet<u8>,
}

impl MockDevice {
    fn new(
        device_bytes: Vec<u8>,
        configuration_bytes: Vec<Vec<u8>>,
        strings: BTreeMap<u8, String>,
        language_ids: Vec<u16>,
    ) -> Self {
        let configurations = configuration_bytes
            .iter()
            .filter_map(|bytes| parse_configuration(bytes).ok())
            .collect();

        Self {
            device_bytes,
            configuration_bytes,
            configurations,
            strings,
            language_ids,
            held_elsewhere: false,
            busy_interfaces: HashSet::new(),
            reset_behavior: ResetBehavior::default(),
            opened_by: None,
            configuration: None,
            claimed: BTreeSet::new(),
            alt_settings: HashMap::new(),
            loopback: HashMap::new(),
            pending: Vec::new(),
            halted: HashSet::new(),
            hung: HashSet::new(),
        }
    }

    fn from_fixture(fixture: DeviceFixture) -> Self {
        Self::new(
            fixture.device_bytes(),
            fixture.configuration_bytes(),
            fixture.strings,
            fixture.language_ids,
        )
    }

    fn active_configuration(&self) -> Option<&Configuration> {
        let value = self.configuration?;
        self.configurations.iter().find(|c| c.value() == value)
    }

    fn descriptor(&self, descriptor_type: u8, index: u8) -> Option<Vec<u8>> {
        match descriptor_type {
            DT_DEVICE => Some(self.device_bytes.clone()),
            DT_CONFIG => self.configuration_bytes.get(index as usize).cloned(),
            DT_STRING if index == 0 => {
                Some(StringDescriptor(self.language_ids.clone()).to_bytes())
            }
            DT_STRING => self
                .strings
                .get(&index)
                .map(|text| StringDescriptor::from_text(text).to_bytes()),
            _ => None,
        }
    }

    fn control(&mut self, request: &TransferRequest) -> TransferOutcome {
        let Some(setup) = request.setup else {
            return TransferOutcome::error("control transfer without setup packet");
        };
        let capacity = setup.length as usize;
        let reply = |mut data: Vec<u8>| {
            data.truncate(capacity);
            TransferOutcome::received(data)
        };
        let stall = || TransferOutcome::failed(TransferStatus::Stall);

        match (setup.request_type, setup.request) {
            (STANDARD_DEVICE_IN, REQ_GET_STATUS) => reply(vec![0x00, 0x00]),
            (STANDARD_ENDPOINT_IN, REQ_GET_STATUS) => {
                let halted = self.halted.contains(&(setup.index as u8));
                reply(vec![halted as u8, 0x00])
            }
            (STANDARD_DEVICE_IN, REQ_GET_DESCRIPTOR) => {
                match self.descriptor((setup.value >> 8) as u8, (setup.value & 0xff) as u8) {
                    Some(bytes) => reply(bytes),
                    None => stall(),
                }
            }
            (STANDARD_DEVICE_IN, REQ_GET_CONFIGURATION) => {
                reply(vec![self.configuration.unwrap_or(0)])
            }
            (STANDARD_DEVICE_OUT, REQ_SET_CONFIGURATION) => {
                match self.apply_configuration(setup.value as u8) {
                    Ok(()) => TransferOutcome::sent(0),
                    Err(_) => stall(),
                }
            }
            (STANDARD_ENDPOINT_OUT, REQ_CLEAR_FEATURE) if setup.value == FEATURE_ENDPOINT_HALT => {
                self.halted.remove(&(setup.index as u8));
                TransferOutcome::sent(0)
            }
            _ => stall(),
        }
    }

    fn apply_configuration(&mut self, value: u8) -> Result<(), PlatformError> {
        if !self.configurations.iter().any(|c| c.value() == value) {
            return Err(PlatformError::InvalidParam);
        }
        if !self.claimed.is_empty() {
            return Err(PlatformError::Busy);
        }
        self.configuration = Some(value);
        self.alt_settings.clear();
        Ok(())
    }

    /// Hand data to an IN endpoint: complete the oldest waiting read or queue
    fn deliver(&mut self, endpoint: u8, mut data: Vec<u8>, ready: &mut Ready) {
        let waiting = self
            .pending
            .iter()
            .position(|p| p.awaiting_data && p.endpoint.0 == endpoint);

        match waiting {
            Some(pos) => {
                let pending = self.pending.remove(pos);
                if data.len() > pending.capacity {
                    let rest = data.split_off(pending.capacity);
                    self.loopback.entry(endpoint).or_default().push_front(rest);
                }
                ready.push((pending.completion, TransferOutcome::received(data)));
            }
            None => self.loopback.entry(endpoint).or_default().push_back(data),
        }
    }

    fn take_queued(&mut self, endpoint: u8, capacity: usize) -> Option<Vec<u8>> {
        let queue = self.loopback.get_mut(&endpoint)?;
        let mut data = queue.pop_front()?;
        if data.len() > capacity {
            let rest = data.split_off(capacity);
            queue.push_front(rest);
        }
        Some(data)
    }

    fn drain_pending(&mut self, status: TransferStatus, ready: &mut Ready) {
        for pending in self.pending.drain(..) {
            ready.push((pending.completion, TransferOutcome::failed(status)));
        }
    }

    /// State after the device drops off the bus
    fn detach(&mut self) {
        self.opened_by = None;
        self.configuration = None;
        self.claimed.clear();
        self.alt_settings.clear();
        self.loopback.clear();
        self.halted.clear();
    }
}

#[derive(Default)]
struct MockState {
    buses: BTreeMap<u32, BTreeMap<u8, MockDevice>>,
    handles: HashMap<PlatformHandle, DeviceLocation>,
    next_handle: u64,
    enumeration_failure: Option<String>,
    ignore_cancel: bool,
    counters: MockCounters,
}

impl MockState {
    fn device(&self, location: DeviceLocation) -> Option<&MockDevice> {
        self.buses.get(&location.bus)?.get(&location.address)
    }

    fn device_mut(&mut self, location: DeviceLocation) -> Option<&mut MockDevice> {
        self.buses.get_mut(&location.bus)?.get_mut(&location.address)
    }

    fn insert_device(&mut self, location: DeviceLocation, device: MockDevice) {
        self.buses
            .entry(location.bus)
            .or_default()
            .insert(location.address, device);
    }

    fn remove_device(&mut self, location: DeviceLocation) -> Option<MockDevice> {
        self.buses.get_mut(&location.bus)?.remove(&location.address)
    }

    /// Device behind an open handle; `NoDevice` once it has gone away
    fn open_device_mut(&mut self, handle: PlatformHandle) -> Result<&mut MockDevice, PlatformError> {
        let location = *self.handles.get(&handle).ok_or(PlatformError::NotFound)?;
        match self.device_mut(location) {
            Some(device) if device.opened_by == Some(handle) => Ok(device),
            _ => Err(PlatformError::NoDevice),
        }
    }
}

struct MockInner {
    state: Mutex<MockState>,
    events_tx: async_channel::Sender<TopologyEvent>,
    events_rx: async_channel::Receiver<TopologyEvent>,
}

impl MockInner {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: TopologyEvent) {
        debug!("Mock topology event: {:?}", event);
        let _ = self.events_tx.try_send(event);
    }

    fn arrive(&self, location: DeviceLocation, device: MockDevice) {
        self.lock().insert_device(location, device);
        self.notify(TopologyEvent::Arrived(location));
    }
}

fn fire(ready: Ready) {
    for (completion, outcome) in ready {
        completion.complete(outcome);
    }
}

/// Simulated host controller
#[derive(Clone)]
pub struct MockPlatform {
    inner: Arc<MockInner>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState {
                    next_handle: 1,
                    ..MockState::default()
                }),
                events_tx,
                events_rx,
            }),
        }
    }

    /// Attach a device without a hot-plug event
    pub fn add_device(&self, bus: u32, address: u8, fixture: DeviceFixture) {
        self.inner.lock().insert_device(
            DeviceLocation::new(bus, address),
            MockDevice::from_fixture(fixture),
        );
    }

    /// Attach a device from raw descriptor bytes, which need not be valid
    pub fn add_raw_device(
        &self,
        bus: u32,
        address: u8,
        device_descriptor: Vec<u8>,
        configurations: Vec<Vec<u8>>,
    ) {
        self.inner.lock().insert_device(
            DeviceLocation::new(bus, address),
            MockDevice::new(device_descriptor, configurations, BTreeMap::new(), vec![]),
        );
    }

    /// Attach a device and announce it
    pub fn plug(&self, bus: u32, address: u8, fixture: DeviceFixture) {
        self.inner.arrive(
            DeviceLocation::new(bus, address),
            MockDevice::from_fixture(fixture),
        );
    }

    /// Detach a device; its pending transfers fail with `NoDevice`
    pub fn unplug(&self, location: DeviceLocation) -> bool {
        let Some(mut device) = self.inner.lock().remove_device(location) else {
            return false;
        };

        let mut ready = Vec::new();
        device.drain_pending(TransferStatus::NoDevice, &mut ready);
        fire(ready);
        self.inner.notify(TopologyEvent::Left(location));
        true
    }

    /// Make `list_buses` fail (or succeed again with `None`)
    pub fn fail_enumeration(&self, reason: Option<&str>) {
        self.inner.lock().enumeration_failure = reason.map(str::to_string);
    }

    /// Ignore cancellation requests, leaving transfers pending
    pub fn set_ignore_cancel(&self, ignore: bool) {
        self.inner.lock().ignore_cancel = ignore;
    }

    fn with_device<R>(
        &self,
        location: DeviceLocation,
        f: impl FnOnce(&mut MockDevice) -> R,
    ) -> Option<R> {
        self.inner.lock().device_mut(location).map(f)
    }

    /// Halt an endpoint until its halt is cleared
    pub fn stall_endpoint(&self, location: DeviceLocation, endpoint: u8) {
        self.with_device(location, |d| d.halted.insert(endpoint));
    }

    /// Transfers on the endpoint never complete on their own; 0x00 hangs
    /// the control pipe
    pub fn hang_endpoint(&self, location: DeviceLocation, endpoint: u8) {
        self.with_device(location, |d| d.hung.insert(endpoint));
    }

    /// Data produced by the device on an IN endpoint
    pub fn inject_in_data(&self, location: DeviceLocation, endpoint: u8, data: Vec<u8>) {
        let mut ready = Vec::new();
        self.with_device(location, |d| d.deliver(endpoint, data, &mut ready));
        fire(ready);
    }

    /// Pretend another process holds the device open
    pub fn hold_elsewhere(&self, location: DeviceLocation, held: bool) {
        self.with_device(location, |d| d.held_elsewhere = held);
    }

    /// Pretend another process has claimed the interface
    pub fn hold_interface_elsewhere(&self, location: DeviceLocation, interface: u8) {
        self.with_device(location, |d| d.busy_interfaces.insert(interface));
    }

    pub fn set_reset_behavior(&self, location: DeviceLocation, behavior: ResetBehavior) {
        self.with_device(location, |d| d.reset_behavior = behavior);
    }

    pub fn counters(&self) -> MockCounters {
        self.inner.lock().counters
    }

    pub fn pending_transfers(&self, location: DeviceLocation) -> usize {
        self.inner
            .lock()
            .device(location)
            .map_or(0, |d| d.pending.len())
    }

    pub fn is_open(&self, location: DeviceLocation) -> bool {
        self.inner
            .lock()
            .device(location)
            .is_some_and(|d| d.opened_by.is_some())
    }

    pub fn active_configuration(&self, location: DeviceLocation) -> Option<u8> {
        self.inner.lock().device(location)?.configuration
    }

    pub fn claimed_interfaces(&self, location: DeviceLocation) -> Vec<u8> {
        self.inner
            .lock()
            .device(location)
            .map(|d| d.claimed.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn alt_setting(&self, location: DeviceLocation, interface: u8) -> Option<u8> {
        self.inner
            .lock()
            .device(location)?
            .alt_settings
            .get(&interface)
            .copied()
    }

    pub fn is_halted(&self, location: DeviceLocation, endpoint: u8) -> bool {
        self.inner
            .lock()
            .device(location)
            .is_some_and(|d| d.halted.contains(&endpoint))
    }
}

impl UsbPlatform for MockPlatform {
    fn list_buses(&self) -> Result<Vec<RawBus>, PlatformError> {
        let state = self.inner.lock();
        if let Some(reason) = &state.enumeration_failure {
            return Err(PlatformError::Unavailable(reason.clone()));
        }

        Ok(state
            .buses
            .iter()
            .map(|(&location, devices)| RawBus {
                location,
                name: format!("{:03}", location),
                devices: devices
                    .iter()
                    .map(|(&address, device)| RawDevice {
                        address,
                        file_name: format!("{:03}", address),
                        device_descriptor: device.device_bytes.clone(),
                        configurations: device.configuration_bytes.clone(),
                    })
                    .collect(),
            })
            .collect())
    }

    fn open_device(&self, location: DeviceLocation) -> Result<PlatformHandle, PlatformError> {
        let mut state = self.inner.lock();
        let handle = PlatformHandle(state.next_handle);

        let device = state.device_mut(location).ok_or(PlatformError::NotFound)?;
        if device.held_elsewhere || device.opened_by.is_some() {
            return Err(PlatformError::Busy);
        }
        device.opened_by = Some(handle);

        state.next_handle += 1;
        state.handles.insert(handle, location);
        state.counters.opens += 1;
        debug!("Mock opened {} as {:?}", location, handle);
        Ok(handle)
    }

    fn close_device(&self, handle: PlatformHandle) {
        let mut ready = Vec::new();
        {
            let mut state = self.inner.lock();
            state.counters.closes += 1;

            if let Some(location) = state.handles.remove(&handle)
                && let Some(device) = state.device_mut(location)
                && device.opened_by == Some(handle)
            {
                device.opened_by = None;
                device.claimed.clear();
                device.alt_settings.clear();
                device.drain_pending(TransferStatus::Cancelled, &mut ready);
            }
        }
        fire(ready);
    }

    fn set_configuration(&self, handle: PlatformHandle, value: u8) -> Result<(), PlatformError> {
        let mut state = self.inner.lock();
        state.open_device_mut(handle)?.apply_configuration(value)
    }

    fn claim_interface(&self, handle: PlatformHandle, interface: u8) -> Result<(), PlatformError> {
        let mut state = self.inner.lock();
        let device = state.open_device_mut(handle)?;

        if device.busy_interfaces.contains(&interface) {
            return Err(PlatformError::Busy);
        }
        let config = device.active_configuration().ok_or(PlatformError::InvalidParam)?;
        let lowest_alt = config
            .alt_settings(interface)
            .map(|setting| setting.alt_setting())
            .min()
            .ok_or(PlatformError::NotFound)?;

        device.claimed.insert(interface);
        device.alt_settings.insert(interface, lowest_alt);
        Ok(())
    }

    fn release_interface(
        &self,
        handle: PlatformHandle,
        interface: u8,
    ) -> Result<(), PlatformError> {
        let mut state = self.inner.lock();
        let device = state.open_device_mut(handle)?;

        if !device.claimed.remove(&interface) {
            return Err(PlatformError::NotFound);
        }
        device.alt_settings.remove(&interface);
        Ok(())
    }

    fn set_alt_setting(
        &self,
        handle: PlatformHandle,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), PlatformError> {
        let mut state = self.inner.lock();
        let device = state.open_device_mut(handle)?;

        if !device.claimed.contains(&interface) {
            return Err(PlatformError::NotFound);
        }
        let exists = device
            .active_configuration()
            .is_some_and(|config| config.interface(interface, alt_setting).is_some());
        if !exists {
            return Err(PlatformError::InvalidParam);
        }

        device.alt_settings.insert(interface, alt_setting);
        Ok(())
    }

    fn submit_transfer(
        &self,
        handle: PlatformHandle,
        request: TransferRequest,
        completion: Completion,
    ) -> Result<(), PlatformError> {
        let mut ready = Vec::new();
        {
            let mut state = self.inner.lock();
            state.counters.submitted += 1;
            let device = state.open_device_mut(handle)?;

            let endpoint = request.endpoint;
            let hang_key = match request.kind {
                TransferKind::Control => EndpointAddress::CONTROL.0,
                _ => endpoint.0,
            };

            if device.hung.contains(&hang_key) {
                device.pending.push(Pending {
                    handle,
                    endpoint,
                    capacity: 0,
                    awaiting_data: false,
                    completion,
                });
            } else if request.kind == TransferKind::Control {
                let outcome = device.control(&request);
                ready.push((completion, outcome));
            } else if device.halted.contains(&endpoint.0) {
                ready.push((completion, TransferOutcome::failed(TransferStatus::Stall)));
            } else if endpoint.is_in() {
                let capacity = request.buffer.len();
                match device.take_queued(endpoint.0, capacity) {
                    Some(data) => ready.push((completion, TransferOutcome::received(data))),
                    None => device.pending.push(Pending {
                        handle,
                        endpoint,
                        capacity,
                        awaiting_data: true,
                        completion,
                    }),
                }
            } else {
                let written = request.buffer.len();
                device.deliver(endpoint.0 | ENDPOINT_IN, request.buffer, &mut ready);
                ready.push((completion, TransferOutcome::sent(written)));
            }
        }

        fire(ready);
        Ok(())
    }

    fn cancel_transfer(&self, handle: PlatformHandle, id: TransferId) -> Result<(), PlatformError> {
        let pending = {
            let mut state = self.inner.lock();
            state.counters.cancel_requests += 1;
            if state.ignore_cancel {
                return Ok(());
            }

            let location = *state.handles.get(&handle).ok_or(PlatformError::NotFound)?;
            let device = state.device_mut(location).ok_or(PlatformError::NoDevice)?;
            let pos = device
                .pending
                .iter()
                .position(|p| p.handle == handle && p.completion.id() == id)
                .ok_or(PlatformError::NotFound)?;
            device.pending.remove(pos)
        };

        pending
            .completion
            .complete(TransferOutcome::failed(TransferStatus::Cancelled));
        Ok(())
    }

    fn reset_device(&self, handle: PlatformHandle) -> Result<(), PlatformError> {
        let mut ready = Vec::new();
        let mut reappear = None;

        let result = {
            let mut state = self.inner.lock();
            state.counters.resets += 1;
            let location = *state.handles.get(&handle).ok_or(PlatformError::NotFound)?;
            let ignore_cancel = state.ignore_cancel;
            let device = state.open_device_mut(handle)?;
            if ignore_cancel && !device.pending.is_empty() {
                return Err(PlatformError::Busy);
            }

            device.drain_pending(TransferStatus::Cancelled, &mut ready);
            device.loopback.clear();
            device.halted.clear();
            let behavior = device.reset_behavior;

            match behavior {
                ResetBehavior::Retain => Ok(()),
                ResetBehavior::Reenumerate { new_address, delay } => {
                    if let Some(mut device) = state.remove_device(location) {
                        device.detach();
                        device.reset_behavior = ResetBehavior::Retain;
                        reappear = Some((
                            location,
                            DeviceLocation::new(location.bus, new_address),
                            device,
                            delay,
                        ));
                    }
                    Err(PlatformError::NotFound)
                }
            }
        };

        fire(ready);

        if let Some((old, new, device, delay)) = reappear {
            self.inner.notify(TopologyEvent::Left(old));
            if delay.is_zero() {
                self.inner.arrive(new, device);
            } else {
                let inner = self.inner.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    inner.arrive(new, device);
                });
            }
        }

        result
    }

    fn clear_endpoint_halt(
        &self,
        handle: PlatformHandle,
        endpoint: EndpointAddress,
    ) -> Result<(), PlatformError> {
        let mut state = self.inner.lock();
        state.counters.clear_halts += 1;
        state.open_device_mut(handle)?.halted.remove(&endpoint.0);
        Ok(())
    }

    fn topology_events(&self) -> Option<async_channel::Receiver<TopologyEvent>> {
        Some(self.inner.events_rx.clone())
    }
}

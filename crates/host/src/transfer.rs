//! Transfer engine
//!
//! Control, bulk and interrupt transfers are handed to the platform together
//! with a [`Completion`] token and awaited on a oneshot channel, so a pending
//! transfer only suspends the task waiting on it. Transfers to the same
//! endpoint address are queued FIFO; different endpoints proceed in
//! parallel.
//!
//! Timeouts and cancellation both end in a definitive outcome: the platform
//! is asked to cancel and the engine waits a bounded grace period for the
//! final status before giving up on it.

use crate::error::{HostError, Result};
use crate::handle::DeviceHandle;
use crate::platform::{
    PlatformError, PlatformHandle, SetupPacket, TransferId, TransferOutcome, TransferRequest,
    TransferStatus, UsbPlatform,
};
use crate::stats::TransferStats;
use crate::topology::DeviceStrings;
use descriptors::constants::{
    DT_STRING, ENDPOINT_IN, LANG_ID_EN_US, RECIP_DEVICE, REQ_GET_DESCRIPTOR, TYPE_STANDARD,
    request_type,
};
use descriptors::{Direction, EndpointAddress, TransferKind, parse_string_descriptor};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedMutexGuard, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Longest string a string descriptor can carry, in UTF-16 code units
const MAX_STRING_UNITS: usize = 126;

/// Transfers currently owned by the platform, by id
#[derive(Debug, Default)]
pub(crate) struct InFlightTable {
    entries: Mutex<HashMap<TransferId, EndpointAddress>>,
}

impl InFlightTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<TransferId, EndpointAddress>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, id: TransferId, endpoint: EndpointAddress) {
        self.lock().insert(id, endpoint);
    }

    pub(crate) fn remove(&self, id: TransferId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: TransferId) -> bool {
        self.lock().contains_key(&id)
    }

    pub(crate) fn ids(&self) -> Vec<TransferId> {
        self.lock().keys().copied().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn any_on(&self, endpoints: &[EndpointAddress]) -> bool {
        self.lock().values().any(|ep| endpoints.contains(ep))
    }
}

/// One-shot completion token for a submitted transfer
///
/// The platform calls [`Completion::complete`] exactly once, from any
/// thread. Dropping the token without completing it reports the transfer as
/// lost.
pub struct Completion {
    id: TransferId,
    sender: Option<oneshot::Sender<TransferOutcome>>,
    in_flight: Arc<InFlightTable>,
}

impl Completion {
    pub(crate) fn new(
        id: TransferId,
        in_flight: Arc<InFlightTable>,
    ) -> (Self, oneshot::Receiver<TransferOutcome>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                id,
                sender: Some(sender),
                in_flight,
            },
            receiver,
        )
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn complete(mut self, outcome: TransferOutcome) {
        self.in_flight.remove(self.id);
        if let Some(sender) = self.sender.take() {
            // The waiter may have given up after its grace period
            let _ = sender.send(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.in_flight.remove(self.id);
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("id", &self.id).finish()
    }
}

/// FIFO queues serializing transfers per endpoint address
#[derive(Debug, Default)]
pub(crate) struct EndpointQueues {
    queues: Mutex<HashMap<u8, Arc<tokio::sync::Mutex<()>>>>,
}

impl EndpointQueues {
    async fn acquire(&self, key: u8) -> OwnedMutexGuard<()> {
        let queue = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            queues.entry(key).or_default().clone()
        };
        queue.lock_owned().await
    }
}

/// Diagnostic context attached to transfer failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferContext {
    pub kind: TransferKind,
    pub endpoint: EndpointAddress,
    pub requested: usize,
    pub elapsed: Duration,
}

impl fmt::Display for TransferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} transfer on endpoint {}, {} bytes requested, {:?} elapsed",
            self.kind, self.endpoint, self.requested, self.elapsed
        )
    }
}

/// A successfully completed transfer
///
/// For IN transfers `data` holds the bytes received; a short read is a
/// valid completion. For OUT transfers `data` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub data: Vec<u8>,
    pub actual_length: usize,
}

/// Result of asking for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The platform was asked to stop the transfer
    Requested,
    /// The transfer had already completed; its result stands
    AlreadyCompleted,
}

#[derive(Debug, Default)]
struct CancelSignal {
    requested: AtomicBool,
    notify: Notify,
}

/// Cloneable cancellation handle for one transfer
#[derive(Clone)]
pub struct TransferCanceller {
    id: TransferId,
    platform_handle: PlatformHandle,
    platform: Arc<dyn UsbPlatform>,
    in_flight: Arc<InFlightTable>,
    signal: Arc<CancelSignal>,
    stats: Arc<TransferStats>,
}

impl TransferCanceller {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Best-effort cancellation
    ///
    /// A transfer that completed before the request keeps its result; the
    /// waiter must inspect what [`Transfer::wait`] returns.
    pub fn cancel(&self) -> CancelOutcome {
        if !self.in_flight.contains(self.id) {
            self.stats.record_cancellation_race();
            debug!("Cancel of transfer {:?} arrived after completion", self.id);
            return CancelOutcome::AlreadyCompleted;
        }

        if !self.signal.requested.swap(true, Ordering::SeqCst) {
            self.request_platform_cancel();
            self.signal.notify.notify_one();
        }
        CancelOutcome::Requested
    }

    fn request_platform_cancel(&self) {
        if let Err(e) = self.platform.cancel_transfer(self.platform_handle, self.id) {
            debug!("Platform cancel of transfer {:?} failed: {}", self.id, e);
        }
    }
}

impl fmt::Debug for TransferCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferCanceller")
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    TimedOut,
    Cancelled,
}

enum Wake {
    Finished(Option<TransferOutcome>),
    Cancelled,
    TimedOut,
}

/// A transfer owned by the platform
///
/// Holds the endpoint's queue slot until the platform reports a final
/// status. Dropping it without waiting leaves the platform transfer running
/// and the endpoint queued behind it; use [`Transfer::cancel`] first if it
/// should stop.
pub struct Transfer {
    kind: TransferKind,
    endpoint: EndpointAddress,
    requested: usize,
    timeout: Duration,
    started: Instant,
    cancel_grace: Duration,
    receiver: oneshot::Receiver<TransferOutcome>,
    canceller: TransferCanceller,
    slot: Option<OwnedMutexGuard<()>>,
}

impl Transfer {
    pub fn id(&self) -> TransferId {
        self.canceller.id
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    pub fn canceller(&self) -> TransferCanceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) -> CancelOutcome {
        self.canceller.cancel()
    }

    /// Wait for completion, timeout or cancellation
    pub async fn wait(mut self) -> Result<CompletedTransfer> {
        let deadline = (!self.timeout.is_zero()).then(|| self.started + self.timeout);
        let signal = self.canceller.signal.clone();

        let wake = tokio::select! {
            outcome = &mut self.receiver => Wake::Finished(outcome.ok()),
            _ = signal.notify.notified() => Wake::Cancelled,
            _ = sleep_until(deadline) => Wake::TimedOut,
        };

        let interruption = match wake {
            Wake::Finished(outcome) => return self.finish(outcome, None),
            Wake::Cancelled => Interruption::Cancelled,
            Wake::TimedOut => {
                debug!(
                    "Transfer {:?} on endpoint {} timed out after {:?}, cancelling",
                    self.id(),
                    self.endpoint,
                    self.timeout
                );
                self.canceller.signal.requested.store(true, Ordering::SeqCst);
                self.canceller.request_platform_cancel();
                Interruption::TimedOut
            }
        };

        let outcome = match tokio::time::timeout(self.cancel_grace, &mut self.receiver).await {
            Ok(outcome) => outcome.ok(),
            Err(_) => {
                warn!(
                    "Transfer {:?} on endpoint {} not confirmed within {:?} of cancellation",
                    self.id(),
                    self.endpoint,
                    self.cancel_grace
                );
                self.release_when_completed();
                None
            }
        };

        self.finish(outcome, Some(interruption))
    }

    /// Hand the queue slot to a task that holds it until the platform
    /// finally completes the transfer
    fn release_when_completed(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let (_, closed) = oneshot::channel();
        let receiver = std::mem::replace(&mut self.receiver, closed);
        let id = self.id();
        let endpoint = self.endpoint;

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let status = receiver.await.ok().map(|outcome| outcome.status);
                    debug!(
                        "Abandoned transfer {:?} on endpoint {} finished late: {:?}",
                        id, endpoint, status
                    );
                    drop(slot);
                });
            }
            Err(_) => warn!(
                "No runtime to track abandoned transfer {:?}; endpoint {} released early",
                id, endpoint
            ),
        }
    }

    fn context(&self) -> TransferContext {
        TransferContext {
            kind: self.kind,
            endpoint: self.endpoint,
            requested: self.requested,
            elapsed: self.started.elapsed(),
        }
    }

    fn finish(
        self,
        outcome: Option<TransferOutcome>,
        interruption: Option<Interruption>,
    ) -> Result<CompletedTransfer> {
        let ctx = self.context();
        let stats = &self.canceller.stats;

        let Some(outcome) = outcome else {
            return Err(match interruption {
                Some(Interruption::TimedOut) => {
                    stats.record_timed_out();
                    HostError::Timeout(ctx)
                }
                Some(Interruption::Cancelled) => {
                    stats.record_cancelled();
                    HostError::Cancelled(ctx)
                }
                None => {
                    stats.record_failed();
                    HostError::Platform {
                        operation: "transfer",
                        source: PlatformError::Other(
                            "completion dropped without a result".to_string(),
                        ),
                    }
                }
            });
        };

        match outcome.status {
            TransferStatus::Completed => {
                if interruption.is_some() || self.canceller.signal.requested.load(Ordering::SeqCst)
                {
                    stats.record_cancellation_race();
                    debug!(
                        "Transfer {:?} completed before its cancellation took effect",
                        self.id()
                    );
                }
                stats.record_completed(outcome.actual_length);
                trace!(
                    "Transfer {:?} on endpoint {} completed: {} of {} bytes in {:?}",
                    self.id(),
                    self.endpoint,
                    outcome.actual_length,
                    self.requested,
                    ctx.elapsed
                );
                Ok(CompletedTransfer {
                    data: outcome.data,
                    actual_length: outcome.actual_length,
                })
            }
            TransferStatus::TimedOut => {
                stats.record_timed_out();
                Err(HostError::Timeout(ctx))
            }
            TransferStatus::Cancelled if interruption == Some(Interruption::TimedOut) => {
                stats.record_timed_out();
                Err(HostError::Timeout(ctx))
            }
            TransferStatus::Cancelled => {
                stats.record_cancelled();
                Err(HostError::Cancelled(ctx))
            }
            TransferStatus::Stall => {
                stats.record_stalled();
                Err(HostError::Stalled(ctx))
            }
            TransferStatus::NoDevice => {
                stats.record_failed();
                Err(HostError::Disconnected {
                    during: ctx.to_string(),
                })
            }
            TransferStatus::Overflow => {
                stats.record_failed();
                Err(HostError::Overflow(ctx))
            }
            TransferStatus::Error => {
                stats.record_failed();
                Err(HostError::Platform {
                    operation: "transfer",
                    source: PlatformError::Other(
                        outcome
                            .message
                            .unwrap_or_else(|| format!("{} failed", ctx)),
                    ),
                })
            }
        }
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if self.canceller.in_flight.contains(self.id()) {
            self.release_when_completed();
        }
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("requested", &self.requested)
            .finish()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn copy_received(done: CompletedTransfer, buffer: &mut [u8]) -> usize {
    let n = done.data.len().min(buffer.len());
    buffer[..n].copy_from_slice(&done.data[..n]);
    n
}

impl DeviceHandle {
    async fn dispatch(&self, request: TransferRequest) -> Result<Transfer> {
        let queue_key = match request.kind {
            TransferKind::Control => EndpointAddress::CONTROL.0,
            _ => request.endpoint.0,
        };
        let kind = request.kind;
        let endpoint = request.endpoint;
        let requested = request.buffer.len();
        let timeout = request.timeout;

        // Time spent queued behind earlier transfers counts against the timeout
        let started = Instant::now();
        let slot = if timeout.is_zero() {
            self.queues.acquire(queue_key).await
        } else {
            match tokio::time::timeout(timeout, self.queues.acquire(queue_key)).await {
                Ok(slot) => slot,
                Err(_) => {
                    debug!(
                        "Endpoint {} still busy after {:?}, not submitting",
                        endpoint, timeout
                    );
                    self.session.stats_handle().record_timed_out();
                    return Err(HostError::Timeout(TransferContext {
                        kind,
                        endpoint,
                        requested,
                        elapsed: started.elapsed(),
                    }));
                }
            }
        };
        let platform_handle = self.require_open("submit a transfer")?;

        let mut request = request;
        if !timeout.is_zero() {
            request.timeout = timeout
                .saturating_sub(started.elapsed())
                .max(Duration::from_millis(1));
        }

        let session = &self.session;
        let id = session.next_transfer_id();

        self.in_flight.insert(id, endpoint);
        let (completion, receiver) = Completion::new(id, self.in_flight.clone());

        debug!(
            "Submitting {} transfer {:?} on endpoint {} of device {} ({} bytes, timeout {:?})",
            kind,
            id,
            endpoint,
            self.location(),
            requested,
            timeout
        );

        if let Err(e) = session
            .platform()
            .submit_transfer(platform_handle, request, completion)
        {
            self.in_flight.remove(id);
            debug!("Submission of transfer {:?} failed: {}", id, e);
            return Err(HostError::from_platform(
                "transfer submission",
                self.location(),
                e,
            ));
        }
        session.stats_handle().record_submitted();

        Ok(Transfer {
            kind,
            endpoint,
            requested,
            timeout,
            started,
            cancel_grace: session.config().transfers.cancel_grace(),
            receiver,
            canceller: TransferCanceller {
                id,
                platform_handle,
                platform: session.platform().clone(),
                in_flight: self.in_flight.clone(),
                signal: Arc::new(CancelSignal::default()),
                stats: session.stats_handle().clone(),
            },
            slot: Some(slot),
        })
    }

    /// Submit a control transfer on the default pipe
    ///
    /// For IN requests `setup.length` is the capacity and `payload` must be
    /// empty; for OUT requests `setup.length` is taken from `payload`. No
    /// interface claim is needed.
    pub async fn submit_control(
        &self,
        setup: SetupPacket,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Transfer> {
        let is_in = setup.direction() == Direction::In;

        let (endpoint, buffer) = if is_in {
            if !payload.is_empty() {
                return Err(HostError::InvalidArgument(
                    "IN control transfers take no payload".to_string(),
                ));
            }
            (EndpointAddress(ENDPOINT_IN), vec![0; setup.length as usize])
        } else {
            (EndpointAddress::CONTROL, payload)
        };

        let length = u16::try_from(buffer.len()).map_err(|_| {
            HostError::InvalidArgument(format!(
                "control transfer of {} bytes exceeds 65535",
                buffer.len()
            ))
        })?;

        self.dispatch(TransferRequest {
            endpoint,
            kind: TransferKind::Control,
            setup: Some(SetupPacket { length, ..setup }),
            buffer,
            timeout,
        })
        .await
    }

    /// Control transfer; direction comes from bit 7 of `request_type`
    ///
    /// IN requests read up to `buffer.len()` bytes into `buffer`; OUT
    /// requests send all of it. Returns the byte count.
    pub async fn control_transfer(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let length = u16::try_from(buffer.len()).map_err(|_| {
            HostError::InvalidArgument(format!(
                "control transfer of {} bytes exceeds 65535",
                buffer.len()
            ))
        })?;
        let setup = SetupPacket {
            request_type,
            request,
            value,
            index,
            length,
        };

        if setup.direction() == Direction::In {
            let done = self.submit_control(setup, Vec::new(), timeout).await?.wait().await?;
            Ok(copy_received(done, buffer))
        } else {
            let done = self
                .submit_control(setup, buffer.to_vec(), timeout)
                .await?
                .wait()
                .await?;
            Ok(done.actual_length)
        }
    }

    async fn submit_data(
        &self,
        kind: TransferKind,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
    ) -> Result<Transfer> {
        let address = EndpointAddress(endpoint);
        let actual = self.claimed_endpoint(address)?.transfer_kind();
        if actual != kind {
            return Err(HostError::WrongEndpointType {
                endpoint: address,
                expected: kind,
                actual,
            });
        }

        self.dispatch(TransferRequest {
            endpoint: address,
            kind,
            setup: None,
            buffer,
            timeout,
        })
        .await
    }

    async fn transfer_into(
        &self,
        kind: TransferKind,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        if EndpointAddress(endpoint).is_in() {
            let capacity = vec![0; buffer.len()];
            let done = self.submit_data(kind, endpoint, capacity, timeout).await?.wait().await?;
            Ok(copy_received(done, buffer))
        } else {
            let done = self
                .submit_data(kind, endpoint, buffer.to_vec(), timeout)
                .await?
                .wait()
                .await?;
            Ok(done.actual_length)
        }
    }

    async fn write_to(
        &self,
        kind: TransferKind,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        if EndpointAddress(endpoint).is_in() {
            return Err(HostError::InvalidArgument(format!(
                "cannot write to IN endpoint {}",
                EndpointAddress(endpoint)
            )));
        }
        let done = self
            .submit_data(kind, endpoint, data.to_vec(), timeout)
            .await?
            .wait()
            .await?;
        Ok(done.actual_length)
    }

    async fn read_from(
        &self,
        kind: TransferKind,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if !EndpointAddress(endpoint).is_in() {
            return Err(HostError::InvalidArgument(format!(
                "cannot read from OUT endpoint {}",
                EndpointAddress(endpoint)
            )));
        }
        let done = self
            .submit_data(kind, endpoint, vec![0; length], timeout)
            .await?
            .wait()
            .await?;
        Ok(done.data)
    }

    /// Submit a bulk transfer
    ///
    /// For IN endpoints `buffer` gives the capacity; for OUT endpoints it is
    /// the payload.
    pub async fn submit_bulk(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
    ) -> Result<Transfer> {
        self.submit_data(TransferKind::Bulk, endpoint, buffer, timeout)
            .await
    }

    /// Bulk transfer in the endpoint's direction; short reads are valid
    pub async fn bulk_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.transfer_into(TransferKind::Bulk, endpoint, buffer, timeout)
            .await
    }

    pub async fn bulk_write(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        self.write_to(TransferKind::Bulk, endpoint, data, timeout).await
    }

    pub async fn bulk_read(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.read_from(TransferKind::Bulk, endpoint, length, timeout)
            .await
    }

    pub async fn submit_interrupt(
        &self,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
    ) -> Result<Transfer> {
        self.submit_data(TransferKind::Interrupt, endpoint, buffer, timeout)
            .await
    }

    /// Interrupt transfer, polled by the platform at the endpoint's interval
    pub async fn interrupt_transfer(
        &self,
        endpoint: u8,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.transfer_into(TransferKind::Interrupt, endpoint, buffer, timeout)
            .await
    }

    pub async fn interrupt_write(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.write_to(TransferKind::Interrupt, endpoint, data, timeout)
            .await
    }

    pub async fn interrupt_read(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.read_from(TransferKind::Interrupt, endpoint, length, timeout)
            .await
    }

    /// Clear a halt (stall) condition on one endpoint
    pub fn clear_halt(&self, endpoint: u8) -> Result<()> {
        let address = EndpointAddress(endpoint);
        let platform_handle = self.require_open("clear an endpoint halt")?;
        self.claimed_endpoint(address)?;

        self.session
            .platform()
            .clear_endpoint_halt(platform_handle, address)
            .map_err(|e| HostError::from_platform("clear_halt", self.location(), e))?;

        debug!(
            "Cleared halt on endpoint {} of device {}",
            address,
            self.location()
        );
        Ok(())
    }

    async fn read_descriptor(
        &self,
        descriptor_type: u8,
        index: u8,
        language: u16,
        length: usize,
    ) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        let n = self
            .control_transfer(
                request_type(ENDPOINT_IN, TYPE_STANDARD, RECIP_DEVICE),
                REQ_GET_DESCRIPTOR,
                ((descriptor_type as u16) << 8) | index as u16,
                language,
                &mut buffer,
                self.session.config().transfers.control_timeout(),
            )
            .await?;
        buffer.truncate(n);
        Ok(buffer)
    }

    /// Raw GET_DESCRIPTOR, returning at most `length` bytes
    pub async fn get_raw_descriptor(
        &self,
        descriptor_type: u8,
        index: u8,
        length: usize,
    ) -> Result<Vec<u8>> {
        self.read_descriptor(descriptor_type, index, 0, length)
            .await
    }

    /// Read string descriptor `index` in the device's first language
    ///
    /// The result is truncated to `max_length` characters.
    pub async fn get_string_descriptor(&self, index: u8, max_length: usize) -> Result<String> {
        if index == 0 {
            return Err(HostError::InvalidArgument(
                "string index 0 holds the language table".to_string(),
            ));
        }

        let malformed = |source| HostError::MalformedDescriptor {
            location: self.location(),
            source,
        };

        let table = self.read_descriptor(DT_STRING, 0, 0, 255).await?;
        let language = parse_string_descriptor(&table)
            .map_err(malformed)?
            .language_ids()
            .first()
            .copied()
            .unwrap_or(LANG_ID_EN_US);

        let bytes = self.read_descriptor(DT_STRING, index, language, 255).await?;
        let text = parse_string_descriptor(&bytes)
            .map_err(malformed)?
            .to_string_lossy();

        Ok(text.chars().take(max_length).collect())
    }

    /// Manufacturer, product and serial strings; unreadable ones are `None`
    pub async fn read_device_strings(&self) -> DeviceStrings {
        let descriptor = self.device().descriptor;

        DeviceStrings {
            manufacturer: self
                .read_string_best_effort(descriptor.manufacturer_string_index())
                .await,
            product: self
                .read_string_best_effort(descriptor.product_string_index())
                .await,
            serial_number: self
                .read_string_best_effort(descriptor.serial_number_string_index())
                .await,
        }
    }

    async fn read_string_best_effort(&self, index: Option<u8>) -> Option<String> {
        let index = index?;
        match self.get_string_descriptor(index, MAX_STRING_UNITS).await {
            Ok(text) => Some(text),
            Err(e) => {
                debug!(
                    "Could not read string {} from device {}: {}",
                    index,
                    self.location(),
                    e
                );
                None
            }
        }
    }
}

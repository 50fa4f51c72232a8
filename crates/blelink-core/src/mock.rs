//! Mock transport and emulated peripherals for testing.
//!
//! This module lets the whole lifecycle core run without BLE hardware.
//!
//! - [`MockTransport`] implements every transport trait. Each native call is
//!   recorded and forwarded on a channel; nothing answers it by itself.
//! - [`MockDriver`] consumes that channel and answers each call from the
//!   scripted GATT profile of a [`MockPeripheral`], by invoking the matching
//!   `on_*` callback the way a platform backend would.
//!
//! # Features
//!
//! - **Synchronous failure injection**: [`MockTransport::fail_next`] makes the
//!   next native call of a kind fail before it is issued.
//! - **Latency simulation**: every answer of a peripheral is delayed by its
//!   latency.
//! - **Scripted responses**: per operation kind, a peripheral answers,
//!   fails with a native error, or stays silent.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! let adapter = Adapter::new(transport.clone())?;
//! let driver = MockDriver::spawn(&transport, &adapter, [MockPeripheral::new(address)
//!     .with_service(MockService::new(1, BATTERY_SERVICE)
//!         .with_characteristic(3, BATTERY_LEVEL, CharacteristicProperties::READ, vec![87]))])?;
//! adapter.device(&address).connect().await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use blelink_types::{
    Advertisement, CharacteristicProperties, ClientConfiguration, DeviceAddress,
    NativeCharacteristic, NativeService, RadioState,
};

use crate::adapter::Adapter;
use crate::characteristic::Characteristic;
use crate::device::Device;
use crate::entity::OperationKind;
use crate::error::{Error, NativeError, Result};
use crate::scanner::{Broadcaster, Scanner};
use crate::service::Service;
use crate::transport::{
    AdapterTransport, BroadcastPayload, BroadcastTransport, CharacteristicTransport,
    DeviceTransport, NativeResult, ScanFilter, ScanTransport, ServiceTransport,
};

/// A native call as issued by the core.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum NativeCall {
    StartScan(ScanFilter),
    StopScan,
    StartBroadcast(BroadcastPayload),
    StopBroadcast,
    Connect(DeviceAddress),
    Disconnect(DeviceAddress),
    ExploreServices(DeviceAddress),
    ReadSignalStrength(DeviceAddress),
    ExploreCharacteristics {
        address: DeviceAddress,
        service: NativeService,
    },
    ReadValue {
        address: DeviceAddress,
        characteristic: NativeCharacteristic,
    },
    WriteValue {
        address: DeviceAddress,
        characteristic: NativeCharacteristic,
        value: Bytes,
    },
    ReadListening {
        address: DeviceAddress,
        characteristic: NativeCharacteristic,
    },
    WriteListening {
        address: DeviceAddress,
        characteristic: NativeCharacteristic,
        configuration: ClientConfiguration,
    },
}

impl NativeCall {
    /// Operation kind the call belongs to.
    pub fn kind(&self) -> OperationKind {
        match self {
            NativeCall::StartScan(_) | NativeCall::StartBroadcast(_) => OperationKind::Start,
            NativeCall::StopScan | NativeCall::StopBroadcast => OperationKind::Stop,
            NativeCall::Connect(_) => OperationKind::Connect,
            NativeCall::Disconnect(_) => OperationKind::Disconnect,
            NativeCall::ExploreServices(_) | NativeCall::ExploreCharacteristics { .. } => {
                OperationKind::Explore
            }
            NativeCall::ReadSignalStrength(_) => OperationKind::SignalRead,
            NativeCall::ReadValue { .. } => OperationKind::Read,
            NativeCall::WriteValue { .. } => OperationKind::Write,
            NativeCall::ReadListening { .. } => OperationKind::ReadListening,
            NativeCall::WriteListening { .. } => OperationKind::WriteListening,
        }
    }

    /// Remote device the call targets, if any.
    pub fn address(&self) -> Option<&DeviceAddress> {
        match self {
            NativeCall::StartScan(_)
            | NativeCall::StopScan
            | NativeCall::StartBroadcast(_)
            | NativeCall::StopBroadcast => None,
            NativeCall::Connect(address)
            | NativeCall::Disconnect(address)
            | NativeCall::ExploreServices(address)
            | NativeCall::ReadSignalStrength(address)
            | NativeCall::ExploreCharacteristics { address, .. }
            | NativeCall::ReadValue { address, .. }
            | NativeCall::WriteValue { address, .. }
            | NativeCall::ReadListening { address, .. }
            | NativeCall::WriteListening { address, .. } => Some(address),
        }
    }
}

/// A random static device address.
pub fn random_address() -> DeviceAddress {
    let mut bytes = rand::random::<[u8; 6]>();
    // Static random addresses have the two top bits set.
    bytes[0] |= 0xC0;
    DeviceAddress::from(bytes)
}

struct Shared {
    radio: Mutex<RadioState>,
    log: Mutex<Vec<NativeCall>>,
    tx: mpsc::UnboundedSender<NativeCall>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<NativeCall>>>,
    failures: Mutex<HashMap<OperationKind, NativeError>>,
}

impl Shared {
    fn issue(&self, call: NativeCall) -> NativeResult {
        trace!(?call, "Native call");
        let kind = call.kind();
        lock(&self.log).push(call.clone());
        if let Some(error) = lock(&self.failures).remove(&kind) {
            debug!(%kind, "Injected synchronous failure");
            return Err(error);
        }
        // Nobody driving the mock is the same as a silent peripheral.
        let _ = self.tx.send(call);
        Ok(())
    }
}

/// Transport that records native calls instead of talking to a radio.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Create a transport whose radio is powered on.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            shared: Arc::new(Shared {
                radio: Mutex::new(RadioState::PoweredOn),
                log: Mutex::new(Vec::new()),
                tx,
                rx: Mutex::new(Some(rx)),
                failures: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Set the state reported by the next radio poll.
    pub fn set_radio_state(&self, state: RadioState) {
        *lock(&self.shared.radio) = state;
    }

    /// Make the next call of `kind` fail synchronously with `error`.
    pub fn fail_next(&self, kind: OperationKind, error: NativeError) {
        lock(&self.shared.failures).insert(kind, error);
    }

    /// Every call issued so far, in order.
    pub fn calls(&self) -> Vec<NativeCall> {
        lock(&self.shared.log).clone()
    }

    /// Number of calls of `kind` issued so far.
    pub fn call_count(&self, kind: OperationKind) -> usize {
        lock(&self.shared.log)
            .iter()
            .filter(|call| call.kind() == kind)
            .count()
    }

    pub fn clear_calls(&self) {
        lock(&self.shared.log).clear();
    }

    /// Take the receiving end of the call channel. Only the first call
    /// gets it.
    pub fn take_call_receiver(&self) -> Option<mpsc::UnboundedReceiver<NativeCall>> {
        lock(&self.shared.rx).take()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("radio", &*lock(&self.shared.radio))
            .field("calls", &lock(&self.shared.log).len())
            .finish()
    }
}

impl AdapterTransport for MockTransport {
    fn radio_state(&self) -> RadioState {
        *lock(&self.shared.radio)
    }

    fn scanner(&self) -> Arc<dyn ScanTransport> {
        Arc::new(MockScan(Arc::clone(&self.shared)))
    }

    fn broadcaster(&self) -> Arc<dyn BroadcastTransport> {
        Arc::new(MockBroadcast(Arc::clone(&self.shared)))
    }

    fn device(&self, address: &DeviceAddress) -> Arc<dyn DeviceTransport> {
        Arc::new(MockDeviceTransport {
            shared: Arc::clone(&self.shared),
            address: address.clone(),
        })
    }
}

struct MockScan(Arc<Shared>);

impl ScanTransport for MockScan {
    fn start(&self, filter: &ScanFilter) -> NativeResult {
        self.0.issue(NativeCall::StartScan(filter.clone()))
    }

    fn stop(&self) -> NativeResult {
        self.0.issue(NativeCall::StopScan)
    }
}

struct MockBroadcast(Arc<Shared>);

impl BroadcastTransport for MockBroadcast {
    fn start(&self, payload: &BroadcastPayload) -> NativeResult {
        self.0.issue(NativeCall::StartBroadcast(payload.clone()))
    }

    fn stop(&self) -> NativeResult {
        self.0.issue(NativeCall::StopBroadcast)
    }
}

struct MockDeviceTransport {
    shared: Arc<Shared>,
    address: DeviceAddress,
}

impl DeviceTransport for MockDeviceTransport {
    fn connect(&self) -> NativeResult {
        self.shared.issue(NativeCall::Connect(self.address.clone()))
    }

    fn disconnect(&self) -> NativeResult {
        self.shared.issue(NativeCall::Disconnect(self.address.clone()))
    }

    fn explore_services(&self) -> NativeResult {
        self.shared
            .issue(NativeCall::ExploreServices(self.address.clone()))
    }

    fn read_signal_strength(&self) -> NativeResult {
        self.shared
            .issue(NativeCall::ReadSignalStrength(self.address.clone()))
    }

    fn service(&self, service: &NativeService) -> Arc<dyn ServiceTransport> {
        Arc::new(MockServiceTransport {
            shared: Arc::clone(&self.shared),
            address: self.address.clone(),
            service: service.clone(),
        })
    }
}

struct MockServiceTransport {
    shared: Arc<Shared>,
    address: DeviceAddress,
    service: NativeService,
}

impl ServiceTransport for MockServiceTransport {
    fn explore_characteristics(&self) -> NativeResult {
        self.shared.issue(NativeCall::ExploreCharacteristics {
            address: self.address.clone(),
            service: self.service.clone(),
        })
    }

    fn characteristic(&self, characteristic: &NativeCharacteristic) -> Arc<dyn CharacteristicTransport> {
        Arc::new(MockCharacteristicTransport {
            shared: Arc::clone(&self.shared),
            address: self.address.clone(),
            characteristic: characteristic.clone(),
        })
    }
}

struct MockCharacteristicTransport {
    shared: Arc<Shared>,
    address: DeviceAddress,
    characteristic: NativeCharacteristic,
}

impl CharacteristicTransport for MockCharacteristicTransport {
    fn properties(&self) -> CharacteristicProperties {
        self.characteristic.properties
    }

    fn read_value(&self) -> NativeResult {
        self.shared.issue(NativeCall::ReadValue {
            address: self.address.clone(),
            characteristic: self.characteristic.clone(),
        })
    }

    fn write_value(&self, value: &[u8]) -> NativeResult {
        self.shared.issue(NativeCall::WriteValue {
            address: self.address.clone(),
            characteristic: self.characteristic.clone(),
            value: Bytes::copy_from_slice(value),
        })
    }

    fn read_listening(&self) -> NativeResult {
        self.shared.issue(NativeCall::ReadListening {
            address: self.address.clone(),
            characteristic: self.characteristic.clone(),
        })
    }

    fn write_listening(&self, configuration: ClientConfiguration) -> NativeResult {
        self.shared.issue(NativeCall::WriteListening {
            address: self.address.clone(),
            characteristic: self.characteristic.clone(),
            configuration,
        })
    }
}

// --- Emulated peripherals ---

/// How a peripheral answers one kind of native call.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Complete successfully from the profile.
    Answer,
    /// Complete with this native error.
    Fail(NativeError),
    /// Never complete.
    Silent,
}

/// A characteristic in a scripted profile.
#[derive(Debug, Clone)]
pub struct MockCharacteristic {
    pub native: NativeCharacteristic,
    pub value: Bytes,
    pub configuration: ClientConfiguration,
}

/// A service in a scripted profile.
#[derive(Debug, Clone)]
pub struct MockService {
    pub native: NativeService,
    pub characteristics: Vec<MockCharacteristic>,
}

impl MockService {
    pub fn new(handle: u16, uuid: Uuid) -> Self {
        Self {
            native: NativeService::new(handle, uuid),
            characteristics: Vec::new(),
        }
    }

    /// Add a characteristic holding `value`.
    #[must_use]
    pub fn with_characteristic(
        mut self,
        handle: u16,
        uuid: Uuid,
        properties: CharacteristicProperties,
        value: impl Into<Bytes>,
    ) -> Self {
        self.characteristics.push(MockCharacteristic {
            native: NativeCharacteristic::new(handle, uuid, properties),
            value: value.into(),
            configuration: ClientConfiguration::Disabled,
        });
        self
    }
}

/// A scripted remote device.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub latency: Duration,
    pub services: Vec<MockService>,
    responses: HashMap<OperationKind, Response>,
}

impl MockPeripheral {
    /// A peripheral with no services that answers everything at once.
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            name: None,
            rssi: -60,
            latency: Duration::ZERO,
            services: Vec::new(),
            responses: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Delay every answer by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn with_service(mut self, service: MockService) -> Self {
        self.services.push(service);
        self
    }

    /// Answer calls of `kind` with `response`.
    #[must_use]
    pub fn respond(mut self, kind: OperationKind, response: Response) -> Self {
        self.responses.insert(kind, response);
        self
    }

    fn response(&self, kind: OperationKind) -> Response {
        self.responses.get(&kind).cloned().unwrap_or(Response::Answer)
    }

    fn characteristic_mut(&mut self, native: &NativeCharacteristic) -> Option<&mut MockCharacteristic> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.native.uuid == native.uuid && c.native.handle == native.handle)
    }

    fn characteristic_by_uuid(&mut self, uuid: Uuid) -> Option<&mut MockCharacteristic> {
        self.services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.native.uuid == uuid)
    }
}

type Peripherals = Arc<Mutex<HashMap<DeviceAddress, MockPeripheral>>>;

/// Background task answering native calls on behalf of emulated peripherals.
///
/// Calls to addresses without a peripheral are never answered. Scan and
/// broadcast calls are always answered; a scan start advertises every
/// peripheral once.
pub struct MockDriver {
    peripherals: Peripherals,
    scanner: Arc<Scanner>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MockDriver {
    /// Start answering the calls `transport` receives from `adapter`.
    pub fn spawn(
        transport: &MockTransport,
        adapter: &Adapter,
        peripherals: impl IntoIterator<Item = MockPeripheral>,
    ) -> Result<Self> {
        let rx = transport
            .take_call_receiver()
            .ok_or_else(|| Error::invalid_config("mock transport already has a driver"))?;
        let peripherals: Peripherals = Arc::new(Mutex::new(
            peripherals
                .into_iter()
                .map(|p| (p.address.clone(), p))
                .collect(),
        ));
        let cancel = CancellationToken::new();
        let worker = Worker {
            peripherals: Arc::clone(&peripherals),
            scanner: Arc::clone(adapter.scanner()),
            broadcaster: Arc::clone(adapter.broadcaster()),
        };
        let task = tokio::spawn(worker.run(rx, cancel.clone()));
        Ok(Self {
            peripherals,
            scanner: Arc::clone(adapter.scanner()),
            cancel,
            task,
        })
    }

    /// Change how a peripheral answers calls of `kind`.
    pub fn set_response(&self, address: &DeviceAddress, kind: OperationKind, response: Response) {
        if let Some(peripheral) = lock(&self.peripherals).get_mut(address) {
            peripheral.responses.insert(kind, response);
        }
    }

    /// Current value of a characteristic on the emulated side.
    pub fn value(&self, address: &DeviceAddress, characteristic: Uuid) -> Option<Bytes> {
        lock(&self.peripherals)
            .get_mut(address)
            .and_then(|p| p.characteristic_by_uuid(characteristic).map(|c| c.value.clone()))
    }

    /// Client configuration of a characteristic on the emulated side.
    pub fn configuration(&self, address: &DeviceAddress, characteristic: Uuid) -> Option<ClientConfiguration> {
        lock(&self.peripherals)
            .get_mut(address)
            .and_then(|p| p.characteristic_by_uuid(characteristic).map(|c| c.configuration))
    }

    /// Change a value on the emulated side and notify it if the client
    /// enabled notifications. Returns whether a notification was sent.
    pub fn notify(&self, address: &DeviceAddress, characteristic: Uuid, value: impl Into<Bytes>) -> bool {
        let value = value.into();
        let listening = {
            let mut peripherals = lock(&self.peripherals);
            match peripherals
                .get_mut(address)
                .and_then(|p| p.characteristic_by_uuid(characteristic))
            {
                Some(c) => {
                    c.value = value.clone();
                    c.configuration.is_listening()
                }
                None => false,
            }
        };
        if !listening {
            return false;
        }
        let device = self.scanner.device(address);
        match device
            .services()
            .iter()
            .flat_map(|s| s.characteristics())
            .find(|c| c.uuid() == characteristic)
        {
            Some(c) => {
                c.on_value_changed(value);
                true
            }
            None => false,
        }
    }

    /// Emulate a link loss.
    pub fn drop_link(&self, address: &DeviceAddress, reason: NativeError) {
        self.scanner.device(address).on_disconnected(Some(reason));
    }

    /// Advertise one peripheral now.
    pub fn advertise(&self, address: &DeviceAddress) {
        let advertisement = lock(&self.peripherals).get(address).map(advertisement_of);
        if let Some(advertisement) = advertisement {
            self.scanner.on_advertisement(advertisement);
        }
    }

    /// Stop answering calls.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDriver")
            .field("peripherals", &lock(&self.peripherals).len())
            .finish_non_exhaustive()
    }
}

fn advertisement_of(peripheral: &MockPeripheral) -> Advertisement {
    let mut advertisement = Advertisement::new(peripheral.address.clone(), peripheral.rssi)
        .with_services(peripheral.services.iter().map(|s| s.native.uuid));
    if let Some(name) = &peripheral.name {
        advertisement = advertisement.with_name(name.clone());
    }
    advertisement
}

struct Worker {
    peripherals: Peripherals,
    scanner: Arc<Scanner>,
    broadcaster: Arc<Broadcaster>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<NativeCall>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                call = rx.recv() => match call {
                    Some(call) => self.answer(call).await,
                    None => break,
                },
            }
        }
        debug!("Mock driver stopped");
    }

    async fn answer(&self, call: NativeCall) {
        let Some(address) = call.address().cloned() else {
            self.answer_activity(call);
            return;
        };

        let script = lock(&self.peripherals)
            .get(&address)
            .map(|p| (p.latency, p.response(call.kind())));
        let Some((latency, response)) = script else {
            trace!(%address, "No peripheral at address, staying silent");
            return;
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let device = self.scanner.device(&address);
        match response {
            Response::Silent => trace!(?call, "Staying silent"),
            Response::Fail(error) => self.fail(&device, call, error),
            Response::Answer => self.succeed(&device, call),
        }
    }

    fn answer_activity(&self, call: NativeCall) {
        match call {
            NativeCall::StartScan(filter) => {
                self.scanner.on_started(Ok(()));
                let advertisements: Vec<Advertisement> = lock(&self.peripherals)
                    .values()
                    .filter(|p| {
                        filter.services.is_empty()
                            || p.services.iter().any(|s| filter.services.contains(&s.native.uuid))
                    })
                    .map(advertisement_of)
                    .collect();
                for advertisement in advertisements {
                    self.scanner.on_advertisement(advertisement);
                }
            }
            NativeCall::StopScan => {
                self.scanner.on_stopped(Ok(()));
            }
            NativeCall::StartBroadcast(_) => {
                self.broadcaster.on_started(Ok(()));
            }
            NativeCall::StopBroadcast => {
                self.broadcaster.on_stopped(Ok(()));
            }
            other => trace!(call = ?other, "Not an activity call"),
        }
    }

    fn succeed(&self, device: &Device, call: NativeCall) {
        match call {
            NativeCall::Connect(_) => {
                device.on_connected();
            }
            NativeCall::Disconnect(_) => {
                device.on_disconnected(None);
            }
            NativeCall::ExploreServices(address) => {
                let services = lock(&self.peripherals)
                    .get(&address)
                    .map(|p| p.services.iter().map(|s| s.native.clone()).collect())
                    .unwrap_or_default();
                device.on_services_explored(Ok(services));
            }
            NativeCall::ReadSignalStrength(address) => {
                let rssi = lock(&self.peripherals)
                    .get(&address)
                    .map(|p| p.rssi)
                    .unwrap_or(-100);
                device.on_signal_strength(Ok(rssi));
            }
            NativeCall::ExploreCharacteristics { address, service } => {
                let characteristics = lock(&self.peripherals)
                    .get(&address)
                    .and_then(|p| p.services.iter().find(|s| s.native == service))
                    .map(|s| s.characteristics.iter().map(|c| c.native.clone()).collect())
                    .unwrap_or_default();
                if let Some(entity) = find_service(device, &service) {
                    entity.on_characteristics_explored(Ok(characteristics));
                }
            }
            NativeCall::ReadValue { address, characteristic } => {
                let value = self.with_characteristic(&address, &characteristic, |c| c.value.clone());
                if let (Some(value), Some(entity)) = (value, find_characteristic(device, &characteristic)) {
                    entity.on_value_read(Ok(value));
                }
            }
            NativeCall::WriteValue { address, characteristic, value } => {
                self.with_characteristic(&address, &characteristic, |c| c.value = value);
                if let Some(entity) = find_characteristic(device, &characteristic) {
                    entity.on_value_written(Ok(()));
                }
            }
            NativeCall::ReadListening { address, characteristic } => {
                let configuration =
                    self.with_characteristic(&address, &characteristic, |c| c.configuration);
                if let (Some(configuration), Some(entity)) =
                    (configuration, find_characteristic(device, &characteristic))
                {
                    entity.on_listening_read(Ok(configuration));
                }
            }
            NativeCall::WriteListening { address, characteristic, configuration } => {
                self.with_characteristic(&address, &characteristic, |c| c.configuration = configuration);
                if let Some(entity) = find_characteristic(device, &characteristic) {
                    entity.on_listening_written(Ok(()));
                }
            }
            other => self.answer_activity(other),
        }
    }

    fn fail(&self, device: &Device, call: NativeCall, error: NativeError) {
        match call {
            NativeCall::Connect(_) => {
                device.on_connect_failed(error);
            }
            NativeCall::Disconnect(_) => {
                device.on_disconnected(Some(error));
            }
            NativeCall::ExploreServices(_) => {
                device.on_services_explored(Err(error));
            }
            NativeCall::ReadSignalStrength(_) => {
                device.on_signal_strength(Err(error));
            }
            NativeCall::ExploreCharacteristics { service, .. } => {
                if let Some(entity) = find_service(device, &service) {
                    entity.on_characteristics_explored(Err(error));
                }
            }
            NativeCall::ReadValue { characteristic, .. } => {
                if let Some(entity) = find_characteristic(device, &characteristic) {
                    entity.on_value_read(Err(error));
                }
            }
            NativeCall::WriteValue { characteristic, .. } => {
                if let Some(entity) = find_characteristic(device, &characteristic) {
                    entity.on_value_written(Err(error));
                }
            }
            NativeCall::ReadListening { characteristic, .. } => {
                if let Some(entity) = find_characteristic(device, &characteristic) {
                    entity.on_listening_read(Err(error));
                }
            }
            NativeCall::WriteListening { characteristic, .. } => {
                if let Some(entity) = find_characteristic(device, &characteristic) {
                    entity.on_listening_written(Err(error));
                }
            }
            other => self.answer_activity(other),
        }
    }

    fn with_characteristic<R>(
        &self,
        address: &DeviceAddress,
        native: &NativeCharacteristic,
        f: impl FnOnce(&mut MockCharacteristic) -> R,
    ) -> Option<R> {
        lock(&self.peripherals)
            .get_mut(address)
            .and_then(|p| p.characteristic_mut(native))
            .map(f)
    }
}

fn find_service(device: &Device, native: &NativeService) -> Option<Arc<Service>> {
    let found = device
        .services()
        .into_iter()
        .find(|s| s.uuid() == native.uuid && s.handle() == native.handle);
    if found.is_none() {
        debug!(device = %device.address(), uuid = %native.uuid, "Answered service no longer tracked");
    }
    found
}

fn find_characteristic(device: &Device, native: &NativeCharacteristic) -> Option<Arc<Characteristic>> {
    let found = device
        .services()
        .iter()
        .flat_map(|s| s.characteristics())
        .find(|c| c.uuid() == native.uuid && c.handle() == native.handle);
    if found.is_none() {
        debug!(device = %device.address(), uuid = %native.uuid, "Answered characteristic no longer tracked");
    }
    found
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Remote device connection and service discovery.
//!
//! [`Device`] drives the connection state machine
//! `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`
//! with one extra edge: a native link-loss report moves a connected device
//! straight to `Disconnected`. Whatever the cause, a disconnection disposes
//! every discovered service (and through them every characteristic) before
//! the device reports itself disconnected.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use blelink_types::{Advertisement, DeviceAddress, NativeService, RadioState};

use crate::characteristic::Characteristic;
use crate::collection::{Tracked, TrackedCollection};
use crate::context::{BleContext, EntityScope};
use crate::entity::{EntityKey, EntityKind, OperationKind};
use crate::error::{Error, NativeError, Result, Violation};
use crate::events::{BleEvent, StateField};
use crate::metrics::MetricsSummary;
use crate::operation::{Delivery, OperationSlot, Orphan};
use crate::service::Service;
use crate::signal::{SignalStrength, SignalTracker};
use crate::traits::{Explorable, ExploreOptions};
use crate::transport::{DeviceTransport, NativeOutcome};
use crate::watch::Watched;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A remote peripheral.
///
/// Devices are shared as `Arc<Device>`; the scanner and the adapter hand out
/// the same instance for the same address.
pub struct Device {
    scope: EntityScope,
    address: DeviceAddress,
    transport: Arc<dyn DeviceTransport>,
    connected: Watched<bool>,
    explored: Watched<bool>,
    disposed: Watched<bool>,
    connect: OperationSlot<()>,
    disconnect: OperationSlot<()>,
    explore: OperationSlot<()>,
    signal_read: OperationSlot<SignalStrength>,
    services: TrackedCollection<Service>,
    /// Set while a disconnect this side asked for has not been reported yet.
    disconnect_requested: AtomicBool,
    ignore_next_unexpected_disconnect: AtomicBool,
    advertisement: Mutex<Option<Advertisement>>,
    tracker: SignalTracker,
    signal: Watched<Option<SignalStrength>>,
}

impl Device {
    pub(crate) fn new(
        ctx: Arc<BleContext>,
        address: DeviceAddress,
        transport: Arc<dyn DeviceTransport>,
    ) -> Arc<Self> {
        let tracker = SignalTracker::new(
            ctx.config.signal.connected_window,
            ctx.config.signal.advertising_window,
        );
        let scope = EntityScope::new(ctx, EntityKey::device(&address));
        Arc::new(Self {
            connect: OperationSlot::new(&scope, OperationKind::Connect, Some(StateField::Connecting)),
            disconnect: OperationSlot::new(
                &scope,
                OperationKind::Disconnect,
                Some(StateField::Disconnecting),
            ),
            explore: OperationSlot::new(&scope, OperationKind::Explore, Some(StateField::Exploring)),
            signal_read: OperationSlot::new(&scope, OperationKind::SignalRead, None),
            connected: Watched::new(false),
            explored: Watched::new(false),
            disposed: Watched::new(false),
            services: TrackedCollection::new(),
            disconnect_requested: AtomicBool::new(false),
            ignore_next_unexpected_disconnect: AtomicBool::new(false),
            advertisement: Mutex::new(None),
            signal: Watched::new(None),
            tracker,
            scope,
            address,
            transport,
        })
    }

    pub fn key(&self) -> &EntityKey {
        &self.scope.key
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Advertised local name, if any advertisement carried one.
    pub fn name(&self) -> Option<String> {
        lock(&self.advertisement)
            .as_ref()
            .and_then(|adv| adv.name.clone())
    }

    /// Most recent advertisement.
    pub fn last_advertisement(&self) -> Option<Advertisement> {
        lock(&self.advertisement).clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        if self.connected.get() {
            if self.disconnect.in_progress() {
                ConnectionState::Disconnecting
            } else {
                ConnectionState::Connected
            }
        } else if self.connect.in_progress() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    pub fn is_connecting(&self) -> bool {
        self.connect.in_progress()
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnect.in_progress()
    }

    pub fn is_explored(&self) -> bool {
        self.explored.get()
    }

    pub fn is_exploring(&self) -> bool {
        self.explore.in_progress()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Latest smoothed signal strength.
    pub fn signal(&self) -> Option<SignalStrength> {
        self.signal.get()
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.scope.metrics.summary()
    }

    /// Wait until the connected flag equals `connected`.
    pub async fn wait_until_connected(
        &self,
        connected: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.connected
            .wait_until(|c| *c == connected, timeout, cancel)
            .await
            .map(|_| ())
    }

    /// Suppress the next unexpected disconnection report.
    ///
    /// The next link loss is reported as an expected disconnection. Use this
    /// before sending a command that makes the peripheral drop the link.
    pub fn ignore_next_unexpected_disconnect(&self) {
        self.ignore_next_unexpected_disconnect
            .store(true, Ordering::SeqCst);
    }

    // --- Connect / disconnect ---

    /// Connect with the configured timeout.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(self.default_timeout(OperationKind::Connect), &CancellationToken::new())
            .await
    }

    /// Connect, or join a connection attempt in progress.
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.address, timeout = ?timeout))]
    pub async fn connect_with(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        self.connect
            .run(
                || {
                    self.require_usable()?;
                    if self.disconnect.in_progress() {
                        Err(Error::precondition(self.key(), Violation::Busy))
                    } else if self.connected.get() {
                        Err(Error::precondition(self.key(), Violation::AlreadyConnected))
                    } else {
                        Ok(())
                    }
                },
                move || transport.connect(),
                timeout,
                cancel,
            )
            .await
    }

    /// Connect unless already connected.
    pub async fn connect_if_needed(&self) -> Result<()> {
        self.connect_if_needed_with(
            self.default_timeout(OperationKind::Connect),
            &CancellationToken::new(),
        )
        .await
    }

    /// Connect unless already connected. No native call is made when the
    /// device is connected.
    pub async fn connect_if_needed_with(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        self.connect_with(timeout, cancel).await
    }

    /// Disconnect with the configured timeout.
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with(
            self.default_timeout(OperationKind::Disconnect),
            &CancellationToken::new(),
        )
        .await
    }

    /// Disconnect, or join a disconnection in progress.
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.address))]
    pub async fn disconnect_with(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        self.disconnect
            .run(
                || {
                    self.require_usable()?;
                    if self.connect.in_progress() {
                        Err(Error::precondition(self.key(), Violation::Busy))
                    } else if !self.connected.get() {
                        Err(Error::precondition(self.key(), Violation::NotConnected))
                    } else {
                        Ok(())
                    }
                },
                || {
                    self.disconnect_requested.store(true, Ordering::SeqCst);
                    let result = self.transport.disconnect();
                    if result.is_err() {
                        self.disconnect_requested.store(false, Ordering::SeqCst);
                    }
                    result
                },
                timeout,
                cancel,
            )
            .await
    }

    /// Disconnect unless already disconnected.
    pub async fn disconnect_if_needed(&self) -> Result<()> {
        self.disconnect_if_needed_with(
            self.default_timeout(OperationKind::Disconnect),
            &CancellationToken::new(),
        )
        .await
    }

    /// Disconnect unless already disconnected.
    pub async fn disconnect_if_needed_with(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        self.disconnect_with(timeout, cancel).await
    }

    // --- Exploration ---

    /// Discovered services, in discovery order.
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.snapshot()
    }

    /// Discovered services matching `filter`.
    pub fn services_with<F>(&self, filter: F) -> Vec<Arc<Service>>
    where
        F: FnMut(&Service) -> bool,
    {
        self.services.filter(filter)
    }

    /// The service with the given UUID, if discovered.
    pub fn service(&self, uuid: Uuid) -> Result<Option<Arc<Service>>> {
        self.services
            .single(&format!("service {}", uuid), |s| s.uuid() == uuid)
    }

    /// Look up a characteristic by service and characteristic UUID.
    ///
    /// Only consults what was already discovered.
    pub fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Arc<Characteristic>> {
        let svc = self
            .service(service)?
            .ok_or_else(|| Error::not_found(format!("service {} on {}", service, self.address)))?;
        svc.characteristic(characteristic)?.ok_or_else(|| {
            Error::not_found(format!(
                "characteristic {} in service {} on {}",
                characteristic, service, self.address
            ))
        })
    }

    /// Discover services unless that already happened.
    pub async fn explore(&self) -> Result<()> {
        self.explore_with(
            ExploreOptions::new(),
            self.default_timeout(OperationKind::Explore),
            &CancellationToken::new(),
        )
        .await
    }

    /// Dispose every service and discover the whole tree again.
    pub async fn rediscover(&self) -> Result<()> {
        self.explore_with(
            ExploreOptions::rediscover().recurse(true),
            self.default_timeout(OperationKind::Explore),
            &CancellationToken::new(),
        )
        .await
    }

    /// Discover services.
    ///
    /// Returns at once if the device is explored and `clear_first` is not
    /// set; joins an exploration in flight. With `recurse`, each service's
    /// characteristics are explored afterwards, one service at a time, each
    /// with `timeout`.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.address, clear_first = options.clear_first, recurse = options.recurse))]
    pub async fn explore_with(
        &self,
        options: ExploreOptions,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.is_explored() || options.clear_first {
            // Only the caller that issues the native call clears; a caller
            // joining an exploration in flight leaves its results alone.
            self.explore
                .run(
                    || self.require_connected(),
                    || {
                        if options.clear_first {
                            self.clear_services();
                        }
                        self.transport.explore_services()
                    },
                    timeout,
                    cancel,
                )
                .await?;
        }

        if options.recurse {
            for service in self.services.snapshot() {
                service
                    .explore_with(ExploreOptions::new(), timeout, cancel)
                    .await?;
            }
        }
        Ok(())
    }

    // --- Signal ---

    /// Read the signal strength of the connection with the configured timeout.
    pub async fn read_signal_strength(&self) -> Result<SignalStrength> {
        self.read_signal_strength_with(
            self.default_timeout(OperationKind::SignalRead),
            &CancellationToken::new(),
        )
        .await
    }

    /// Read the signal strength of the connection. Concurrent reads share
    /// one native read.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %self.address))]
    pub async fn read_signal_strength_with(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SignalStrength> {
        let transport = Arc::clone(&self.transport);
        self.signal_read
            .run(
                || self.require_connected(),
                move || transport.read_signal_strength(),
                timeout,
                cancel,
            )
            .await
    }

    // --- Native callbacks ---

    /// Native connection success.
    ///
    /// The device is marked connected even when nobody waits for the
    /// connection any more. A connection nobody asked for is reported to the
    /// failure sink.
    pub fn on_connected(&self) -> Delivery<()> {
        let changed = self.set_connected(true);
        if changed {
            info!(device = %self.address, "Connected");
        }
        self.disconnect_requested.store(false, Ordering::SeqCst);
        self.connect.complete(Ok(()), |_| {
            if changed {
                Orphan::Unexpected("connected with no connect pending".into())
            } else {
                Orphan::Absorb
            }
        })
    }

    /// Native connection failure.
    pub fn on_connect_failed(&self, error: NativeError) -> Delivery<()> {
        warn!(device = %self.address, "Connection failed: {}", error);
        let error = Error::native(self.key(), OperationKind::Connect, error);
        self.connect.complete(Err(error), |outcome| match outcome {
            Err(_) if !self.connected.get() => Orphan::Absorb,
            Err(error) => Orphan::Escalate(error),
            Ok(()) => Orphan::Absorb,
        })
    }

    /// Native link-down report, requested or not.
    ///
    /// `reason` carries the platform status when the link dropped with one.
    /// Services are disposed first, then the device turns disconnected, then
    /// pending calls resolve:
    ///
    /// - a pending disconnect succeeds;
    /// - a pending connect fails with the reason;
    /// - otherwise a connected device reports an unexpected disconnection,
    ///   unless [`Device::ignore_next_unexpected_disconnect`] was called.
    pub fn on_disconnected(&self, reason: Option<NativeError>) -> Delivery<()> {
        let was_connected = self.connected.get();
        self.clear_services();
        self.set_connected(false);

        let requested = self.disconnect_requested.swap(false, Ordering::SeqCst);
        if self.disconnect.in_progress() {
            info!(device = %self.address, "Disconnected");
            let delivery = self.disconnect.complete(Ok(()), |_| Orphan::Absorb);
            self.report_disconnected(true);
            return delivery;
        }

        if self.connect.in_progress() {
            let error = reason.unwrap_or_else(|| NativeError::new("link lost while connecting"));
            warn!(device = %self.address, "Connection dropped before completing: {}", error);
            return self.connect.complete(
                Err(Error::native(self.key(), OperationKind::Connect, error)),
                |_| Orphan::Absorb,
            );
        }

        if !was_connected {
            debug!(device = %self.address, "Repeated disconnection report");
            return Delivery::Absorbed;
        }

        let ignored = self
            .ignore_next_unexpected_disconnect
            .swap(false, Ordering::SeqCst);
        let expected = requested || ignored;
        if expected {
            info!(device = %self.address, "Disconnected");
        } else {
            match &reason {
                Some(reason) => warn!(device = %self.address, "Connection lost: {}", reason),
                None => warn!(device = %self.address, "Connection lost"),
            }
        }
        self.report_disconnected(expected);
        Delivery::Absorbed
    }

    /// Native services discovery completion.
    ///
    /// Applied to a connected device whether or not an exploration is
    /// pending; discarded and reported when the device is disconnected.
    pub fn on_services_explored(&self, outcome: NativeOutcome<Vec<NativeService>>) -> Delivery<()> {
        let outcome = match outcome {
            Ok(natives) if self.is_disposed() || !self.connected.get() => {
                warn!(device = %self.address, count = natives.len(), "Discarding services discovered while disconnected");
                Err(Error::unexpected(
                    self.key(),
                    OperationKind::Explore,
                    "services discovered after disconnection",
                ))
            }
            Ok(natives) => {
                self.apply_services(&natives);
                Ok(())
            }
            Err(error) => Err(Error::native(self.key(), OperationKind::Explore, error)),
        };
        self.explore.complete(outcome, |outcome| match outcome {
            Ok(()) => Orphan::Absorb,
            Err(error) => Orphan::Escalate(error),
        })
    }

    /// Native signal strength read completion.
    ///
    /// Samples are always added to the history, so a late answer still
    /// counts towards the average.
    pub fn on_signal_strength(&self, outcome: NativeOutcome<i16>) -> Delivery<SignalStrength> {
        let outcome = match outcome {
            Ok(rssi) => Ok(self.record_signal(rssi)),
            Err(error) => Err(Error::native(self.key(), OperationKind::SignalRead, error)),
        };
        self.signal_read.complete(outcome, |outcome| match outcome {
            Ok(_) => Orphan::Absorb,
            Err(error) => Orphan::Escalate(error),
        })
    }

    /// Take in an advertisement from the scanner.
    pub(crate) fn on_advertisement(&self, advertisement: Advertisement) {
        let rssi = advertisement.rssi;
        *lock(&self.advertisement) = Some(advertisement);
        self.scope.emit(BleEvent::Advertised {
            entity: self.scope.key.clone(),
            rssi,
        });
        self.record_signal(rssi);
    }

    /// Time of the most recent advertisement.
    pub(crate) fn last_seen(&self) -> Option<time::OffsetDateTime> {
        lock(&self.advertisement).as_ref().map(|adv| adv.timestamp)
    }

    // --- Internals ---

    fn record_signal(&self, rssi: i16) -> SignalStrength {
        let strength = self.tracker.record(rssi, &self.scope.ctx.bounds);
        self.signal.set(Some(strength));
        self.scope.emit(BleEvent::SignalChanged {
            entity: self.scope.key.clone(),
            rssi,
            percent: strength.percent,
        });
        strength
    }

    fn apply_services(&self, natives: &[NativeService]) {
        let delta = self.services.reconcile(natives, |native| {
            Service::new(
                self.scope.child(EntityKind::Service, &native.uuid, native.handle),
                native.clone(),
                self.transport.service(native),
                self.connected.subscribe(),
            )
        });
        if !delta.is_empty() {
            debug!(
                device = %self.address,
                added = delta.added.len(),
                removed = delta.removed.len(),
                "Services changed"
            );
            self.scope.emit(BleEvent::CollectionChanged {
                entity: self.scope.key.clone(),
                added: delta.added_keys(),
                removed: delta.removed_keys(),
            });
        }
        self.set_explored(true);
    }

    fn clear_services(&self) {
        let removed = self.services.clear();
        if !removed.is_empty() {
            debug!(device = %self.address, count = removed.len(), "Disposed services");
            self.scope.emit(BleEvent::CollectionChanged {
                entity: self.scope.key.clone(),
                added: Vec::new(),
                removed: removed.iter().map(|s| s.key().clone()).collect(),
            });
        }
        self.set_explored(false);
    }

    fn set_explored(&self, explored: bool) {
        if self.explored.set(explored) {
            self.scope.emit_state(StateField::Explored, explored);
        }
    }

    fn set_connected(&self, connected: bool) -> bool {
        let changed = self.connected.set(connected);
        if changed {
            self.tracker.set_connected(connected);
            self.scope.emit_state(StateField::Connected, connected);
        }
        changed
    }

    fn report_disconnected(&self, expected: bool) {
        self.scope.emit(BleEvent::Disconnected {
            entity: self.scope.key.clone(),
            expected,
        });
    }

    fn require_usable(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::disposed(self.key()));
        }
        match self.scope.ctx.radio.get() {
            RadioState::Unknown | RadioState::PoweredOn => Ok(()),
            _ => Err(Error::precondition(self.key(), Violation::RadioOff)),
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::disposed(self.key()))
        } else if !self.connected.get() {
            Err(Error::precondition(self.key(), Violation::NotConnected))
        } else {
            Ok(())
        }
    }

    fn default_timeout(&self, kind: OperationKind) -> Duration {
        self.scope.ctx.config.timeout(kind)
    }

    pub(crate) fn dispose(&self) {
        if !self.disposed.set(true) {
            return;
        }
        debug!(device = %self.address, "Disposing device");
        let error = Error::disposed(self.key());
        self.connect.cancel_pending(error.clone());
        self.disconnect.cancel_pending(error.clone());
        self.explore.cancel_pending(error.clone());
        self.signal_read.cancel_pending(error);
        self.clear_services();
        self.set_connected(false);
        self.scope.emit_state(StateField::Disposed, true);
    }
}

impl Tracked for Device {
    type Native = DeviceAddress;

    fn key(&self) -> &EntityKey {
        &self.scope.key
    }

    fn matches(&self, native: &DeviceAddress) -> bool {
        &self.address == native
    }

    fn dispose(&self) {
        Device::dispose(self);
    }
}

#[async_trait]
impl Explorable for Device {
    type Child = Service;

    fn entity_key(&self) -> &EntityKey {
        &self.scope.key
    }

    fn is_explored(&self) -> bool {
        Device::is_explored(self)
    }

    fn collection(&self) -> &TrackedCollection<Service> {
        &self.services
    }

    fn explore_timeout(&self) -> Duration {
        self.default_timeout(OperationKind::Explore)
    }

    async fn explore_with(
        &self,
        options: ExploreOptions,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Device::explore_with(self, options, timeout, cancel).await
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Discovery and advertising.
//!
//! [`Scanner`] and [`Broadcaster`] are the two long-lived radio activities.
//! Both follow the [`Activity`] start/stop state machine; the scanner also
//! tracks every device it has heard, keyed by address.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use blelink_types::{Advertisement, DeviceAddress};

use crate::activity::{Activity, ActivityState};
use crate::collection::TrackedCollection;
use crate::context::{BleContext, EntityScope};
use crate::device::Device;
use crate::entity::{EntityKey, EntityKind, OperationKind};
use crate::error::Result;
use crate::events::BleEvent;
use crate::operation::Delivery;
use crate::transport::{
    AdapterTransport, BroadcastPayload, BroadcastTransport, NativeOutcome, ScanFilter,
    ScanTransport,
};

/// Device discovery.
pub struct Scanner {
    scope: EntityScope,
    activity: Activity,
    transport: Arc<dyn ScanTransport>,
    adapter: Arc<dyn AdapterTransport>,
    filter: Mutex<ScanFilter>,
    devices: TrackedCollection<Device>,
}

impl Scanner {
    pub(crate) fn new(ctx: Arc<BleContext>, adapter: Arc<dyn AdapterTransport>) -> Self {
        let scope = EntityScope::new(ctx, EntityKey::new(EntityKind::Scanner, "scanner"));
        Self {
            activity: Activity::new(scope.clone()),
            transport: adapter.scanner(),
            filter: Mutex::new(ScanFilter::default()),
            devices: TrackedCollection::new(),
            scope,
            adapter,
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.scope.key
    }

    pub fn state(&self) -> ActivityState {
        self.activity.state()
    }

    pub fn is_running(&self) -> bool {
        self.activity.is_running()
    }

    /// Filter of the current or last scan.
    pub fn filter(&self) -> ScanFilter {
        lock(&self.filter).clone()
    }

    /// Wait until the scanner is running (`true`) or idle (`false`).
    pub async fn wait_until_running(
        &self,
        running: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.activity.wait_until_running(running, timeout, cancel).await
    }

    /// Start scanning with the configured timeout.
    pub async fn start(&self, filter: ScanFilter) -> Result<()> {
        self.start_with(filter, self.default_timeout(OperationKind::Start), &CancellationToken::new())
            .await
    }

    /// Start scanning, or join a start in progress.
    ///
    /// Waits for the radio to power on first, up to the radio wait timeout.
    #[tracing::instrument(level = "info", skip_all, fields(services = filter.services.len()))]
    pub async fn start_with(
        &self,
        filter: ScanFilter,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        let native_filter = filter.clone();
        self.activity
            .start(
                || {
                    *lock(&self.filter) = filter;
                    transport.start(&native_filter)
                },
                timeout,
                cancel,
            )
            .await
    }

    /// Start scanning unless already running.
    pub async fn start_if_needed(&self, filter: ScanFilter) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        let native_filter = filter.clone();
        self.activity
            .start_if_needed(
                || {
                    *lock(&self.filter) = filter;
                    transport.start(&native_filter)
                },
                self.default_timeout(OperationKind::Start),
                &CancellationToken::new(),
            )
            .await
    }

    /// Stop scanning with the configured timeout.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with(self.default_timeout(OperationKind::Stop), &CancellationToken::new())
            .await
    }

    /// Stop scanning, or join a stop in progress.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn stop_with(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        self.activity.stop(move || transport.stop(), timeout, cancel).await
    }

    /// Stop scanning unless already idle.
    pub async fn stop_if_needed(&self) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        self.activity
            .stop_if_needed(
                move || transport.stop(),
                self.default_timeout(OperationKind::Stop),
                &CancellationToken::new(),
            )
            .await
    }

    /// Native scan start completion.
    pub fn on_started(&self, outcome: NativeOutcome<()>) -> Delivery<()> {
        self.activity.on_started(outcome)
    }

    /// Native scan stop completion.
    pub fn on_stopped(&self, outcome: NativeOutcome<()>) -> Delivery<()> {
        self.activity.on_stopped(outcome)
    }

    /// Native advertisement report.
    ///
    /// Creates the device on first sight, then hands it the advertisement.
    /// Advertisements outside the current service filter are dropped.
    pub fn on_advertisement(&self, advertisement: Advertisement) {
        {
            let filter = lock(&self.filter);
            if !filter.services.is_empty()
                && !filter.services.iter().any(|uuid| advertisement.advertises(uuid))
            {
                trace!(address = %advertisement.address, "Advertisement outside filter");
                return;
            }
        }

        let address = advertisement.address.clone();
        let (device, inserted) = self.devices.get_or_insert_with(
            |d| d.address() == &address,
            || self.create_device(&address),
        );
        if inserted {
            debug!(address = %address, name = ?advertisement.name, "Discovered device");
            self.scope.emit(BleEvent::CollectionChanged {
                entity: self.scope.key.clone(),
                added: vec![device.key().clone()],
                removed: Vec::new(),
            });
        }
        device.on_advertisement(advertisement);
    }

    /// Every device heard or requested so far.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.snapshot()
    }

    /// Devices matching `filter`.
    pub fn devices_with<F>(&self, filter: F) -> Vec<Arc<Device>>
    where
        F: FnMut(&Device) -> bool,
    {
        self.devices.filter(filter)
    }

    /// The tracked device with this address, created if unknown.
    pub fn device(&self, address: &DeviceAddress) -> Arc<Device> {
        let (device, inserted) = self.devices.get_or_insert_with(
            |d| d.address() == address,
            || self.create_device(address),
        );
        if inserted {
            self.scope.emit(BleEvent::CollectionChanged {
                entity: self.scope.key.clone(),
                added: vec![device.key().clone()],
                removed: Vec::new(),
            });
        }
        device
    }

    /// Drop devices not heard from within the configured stale period.
    pub fn prune_stale(&self) -> Vec<Arc<Device>> {
        self.prune_older_than(self.scope.ctx.config.stale_device_after())
    }

    /// Drop and dispose devices whose last advertisement is older than
    /// `max_age`. Connected devices and devices never heard advertising are
    /// kept.
    pub fn prune_older_than(&self, max_age: Duration) -> Vec<Arc<Device>> {
        let now = OffsetDateTime::now_utc();
        let removed = self.devices.retain(|device| {
            device.is_connected()
                || device
                    .last_seen()
                    .is_none_or(|seen| (now - seen).unsigned_abs() < max_age)
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "Pruned stale devices");
            self.scope.emit(BleEvent::CollectionChanged {
                entity: self.scope.key.clone(),
                added: Vec::new(),
                removed: removed.iter().map(|d| d.key().clone()).collect(),
            });
        }
        removed
    }

    fn create_device(&self, address: &DeviceAddress) -> Arc<Device> {
        Device::new(
            Arc::clone(&self.scope.ctx),
            address.clone(),
            self.adapter.device(address),
        )
    }

    fn default_timeout(&self, kind: OperationKind) -> Duration {
        self.scope.ctx.config.timeout(kind)
    }

    pub(crate) fn dispose(&self) {
        self.activity.dispose();
        self.devices.clear();
    }
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("state", &self.state())
            .field("devices", &self.devices.len())
            .finish_non_exhaustive()
    }
}

/// Advertising of the local device.
pub struct Broadcaster {
    scope: EntityScope,
    activity: Activity,
    transport: Arc<dyn BroadcastTransport>,
    payload: Mutex<Option<BroadcastPayload>>,
}

impl Broadcaster {
    pub(crate) fn new(ctx: Arc<BleContext>, transport: Arc<dyn BroadcastTransport>) -> Self {
        let scope = EntityScope::new(ctx, EntityKey::new(EntityKind::Broadcaster, "broadcaster"));
        Self {
            activity: Activity::new(scope.clone()),
            payload: Mutex::new(None),
            scope,
            transport,
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.scope.key
    }

    pub fn state(&self) -> ActivityState {
        self.activity.state()
    }

    pub fn is_running(&self) -> bool {
        self.activity.is_running()
    }

    /// Payload of the current or last broadcast.
    pub fn payload(&self) -> Option<BroadcastPayload> {
        lock(&self.payload).clone()
    }

    /// Start advertising with the configured timeout.
    pub async fn start(&self, payload: BroadcastPayload) -> Result<()> {
        self.start_with(
            payload,
            self.scope.ctx.config.timeout(OperationKind::Start),
            &CancellationToken::new(),
        )
        .await
    }

    /// Start advertising, or join a start in progress.
    #[tracing::instrument(level = "info", skip_all, fields(name = ?payload.name))]
    pub async fn start_with(
        &self,
        payload: BroadcastPayload,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        self.activity
            .start(
                || {
                    let result = transport.start(&payload);
                    *lock(&self.payload) = Some(payload);
                    result
                },
                timeout,
                cancel,
            )
            .await
    }

    /// Start advertising unless already running.
    pub async fn start_if_needed(&self, payload: BroadcastPayload) -> Result<()> {
        if self.state() == ActivityState::Running {
            return Ok(());
        }
        self.start(payload).await
    }

    /// Stop advertising with the configured timeout.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with(
            self.scope.ctx.config.timeout(OperationKind::Stop),
            &CancellationToken::new(),
        )
        .await
    }

    /// Stop advertising, or join a stop in progress.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn stop_with(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        self.activity.stop(move || transport.stop(), timeout, cancel).await
    }

    /// Stop advertising unless already idle.
    pub async fn stop_if_needed(&self) -> Result<()> {
        if self.state() == ActivityState::Idle {
            return Ok(());
        }
        self.stop().await
    }

    /// Native advertising start completion.
    pub fn on_started(&self, outcome: NativeOutcome<()>) -> Delivery<()> {
        self.activity.on_started(outcome)
    }

    /// Native advertising stop completion.
    pub fn on_stopped(&self, outcome: NativeOutcome<()>) -> Delivery<()> {
        self.activity.on_stopped(outcome)
    }

    pub(crate) fn dispose(&self) {
        self.activity.dispose();
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

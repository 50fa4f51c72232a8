//! GATT services and characteristic discovery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use blelink_types::{NativeCharacteristic, NativeService};

use crate::characteristic::Characteristic;
use crate::collection::{Tracked, TrackedCollection};
use crate::context::EntityScope;
use crate::entity::{EntityKey, EntityKind, OperationKind};
use crate::error::{Error, Result, Violation};
use crate::events::{BleEvent, StateField};
use crate::metrics::MetricsSummary;
use crate::operation::{Delivery, OperationSlot, Orphan};
use crate::traits::{Explorable, ExploreOptions};
use crate::transport::{NativeOutcome, ServiceTransport};
use crate::watch::Watched;

/// A service of a connected device.
pub struct Service {
    scope: EntityScope,
    native: NativeService,
    transport: Arc<dyn ServiceTransport>,
    connected: watch::Receiver<bool>,
    explored: Watched<bool>,
    disposed: Watched<bool>,
    explore: OperationSlot<()>,
    characteristics: TrackedCollection<Characteristic>,
}

impl Service {
    pub(crate) fn new(
        scope: EntityScope,
        native: NativeService,
        transport: Arc<dyn ServiceTransport>,
        connected: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            explore: OperationSlot::new(&scope, OperationKind::Explore, Some(StateField::Exploring)),
            explored: Watched::new(false),
            disposed: Watched::new(false),
            characteristics: TrackedCollection::new(),
            scope,
            native,
            transport,
            connected,
        })
    }

    pub fn key(&self) -> &EntityKey {
        &self.scope.key
    }

    pub fn uuid(&self) -> Uuid {
        self.native.uuid
    }

    pub fn handle(&self) -> u16 {
        self.native.handle
    }

    pub fn is_primary(&self) -> bool {
        self.native.primary
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

    pub fn metrics(&self) -> MetricsSummary {
        self.scope.metrics.summary()
    }

    /// Discovered characteristics, in discovery order.
    pub fn characteristics(&self) -> Vec<Arc<Characteristic>> {
        self.characteristics.snapshot()
    }

    /// Discovered characteristics matching `filter`.
    pub fn characteristics_with<F>(&self, filter: F) -> Vec<Arc<Characteristic>>
    where
        F: FnMut(&Characteristic) -> bool,
    {
        self.characteristics.filter(filter)
    }

    /// The characteristic with the given UUID, if discovered.
    ///
    /// Fails with [`Error::MultipleFound`] if the service declares it twice.
    pub fn characteristic(&self, uuid: Uuid) -> Result<Option<Arc<Characteristic>>> {
        self.characteristics
            .single(&format!("characteristic {}", uuid), |c| c.uuid() == uuid)
    }

    /// Discover characteristics unless that already happened.
    pub async fn explore(&self) -> Result<()> {
        self.explore_with(
            ExploreOptions::new(),
            self.scope.ctx.config.timeout(OperationKind::Explore),
            &CancellationToken::new(),
        )
        .await
    }

    /// Dispose every characteristic and discover again.
    pub async fn rediscover(&self) -> Result<()> {
        self.explore_with(
            ExploreOptions::rediscover(),
            self.scope.ctx.config.timeout(OperationKind::Explore),
            &CancellationToken::new(),
        )
        .await
    }

    /// Discover characteristics.
    ///
    /// Returns at once if the service is explored and `clear_first` is not
    /// set; joins an exploration in flight. Characteristics have no
    /// collections of their own, so `recurse` has no effect here.
    #[tracing::instrument(level = "debug", skip_all, fields(service = %self.scope.key, clear_first = options.clear_first))]
    pub async fn explore_with(
        &self,
        options: ExploreOptions,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.is_explored() && !options.clear_first {
            return Ok(());
        }
        self.explore
            .run(
                || self.require_connected(),
                || {
                    if options.clear_first {
                        self.clear();
                    }
                    self.transport.explore_characteristics()
                },
                timeout,
                cancel,
            )
            .await
    }

    /// Native characteristic discovery completion.
    ///
    /// A result for a connected service is always applied, even with no
    /// exploration pending. A result for a disconnected or disposed service
    /// is discarded and reported.
    pub fn on_characteristics_explored(
        &self,
        outcome: NativeOutcome<Vec<NativeCharacteristic>>,
    ) -> Delivery<()> {
        let outcome = match outcome {
            Ok(natives) if self.is_disposed() || !*self.connected.borrow() => {
                warn!(service = %self.scope.key, count = natives.len(), "Discarding characteristics discovered while disconnected");
                Err(Error::unexpected(
                    self.key(),
                    OperationKind::Explore,
                    "characteristics discovered after disconnection",
                ))
            }
            Ok(natives) => {
                self.apply(&natives);
                Ok(())
            }
            Err(error) => Err(Error::native(self.key(), OperationKind::Explore, error)),
        };
        self.explore.complete(outcome, |outcome| match outcome {
            Ok(()) => Orphan::Absorb,
            Err(error) => Orphan::Escalate(error),
        })
    }

    fn apply(&self, natives: &[NativeCharacteristic]) {
        let delta = self.characteristics.reconcile(natives, |native| {
            Characteristic::new(
                self.scope
                    .child(EntityKind::Characteristic, &native.uuid, native.handle),
                native.clone(),
                self.transport.characteristic(native),
                self.connected.clone(),
            )
        });
        if !delta.is_empty() {
            debug!(
                service = %self.scope.key,
                added = delta.added.len(),
                removed = delta.removed.len(),
                "Characteristics changed"
            );
            self.scope.emit(BleEvent::CollectionChanged {
                entity: self.scope.key.clone(),
                added: delta.added_keys(),
                removed: delta.removed_keys(),
            });
        }
        self.set_explored(true);
    }

    fn clear(&self) {
        let removed = self.characteristics.clear();
        if !removed.is_empty() {
            self.scope.emit(BleEvent::CollectionChanged {
                entity: self.scope.key.clone(),
                added: Vec::new(),
                removed: removed.iter().map(|c| c.key().clone()).collect(),
            });
        }
        self.set_explored(false);
    }

    fn set_explored(&self, explored: bool) {
        if self.explored.set(explored) {
            self.scope.emit_state(StateField::Explored, explored);
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::disposed(self.key()))
        } else if !*self.connected.borrow() {
            Err(Error::precondition(self.key(), Violation::NotConnected))
        } else {
            Ok(())
        }
    }

    pub(crate) fn dispose(&self) {
        if !self.disposed.set(true) {
            return;
        }
        debug!(service = %self.scope.key, "Disposing service");
        self.explore.cancel_pending(Error::disposed(self.key()));
        self.clear();
        self.scope.emit_state(StateField::Disposed, true);
    }
}

impl Tracked for Service {
    type Native = NativeService;

    fn key(&self) -> &EntityKey {
        &self.scope.key
    }

    fn matches(&self, native: &NativeService) -> bool {
        self.native.uuid == native.uuid && self.native.handle == native.handle
    }

    fn dispose(&self) {
        Service::dispose(self);
    }
}

#[async_trait]
impl Explorable for Service {
    type Child = Characteristic;

    fn entity_key(&self) -> &EntityKey {
        &self.scope.key
    }

    fn is_explored(&self) -> bool {
        Service::is_explored(self)
    }

    fn collection(&self) -> &TrackedCollection<Characteristic> {
        &self.characteristics
    }

    fn explore_timeout(&self) -> Duration {
        self.scope.ctx.config.timeout(OperationKind::Explore)
    }

    async fn explore_with(
        &self,
        options: ExploreOptions,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        Service::explore_with(self, options, timeout, cancel).await
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("key", &self.scope.key)
            .field("explored", &self.explored.get())
            .field("characteristics", &self.characteristics.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::BleConfig;
    use crate::context::BleContext;
    use crate::error::NativeError;
    use crate::sink::BroadcastSink;
    use crate::transport::{CharacteristicTransport, NativeResult};
    use blelink_types::uuids::{BATTERY_SERVICE, uuid_from_u16};
    use blelink_types::{CharacteristicProperties, ClientConfiguration};

    const BATTERY_LEVEL: u16 = 0x2a19;

    #[derive(Default)]
    struct Discovery {
        explores: Mutex<usize>,
    }

    struct Inert;

    impl CharacteristicTransport for Inert {
        fn properties(&self) -> CharacteristicProperties {
            CharacteristicProperties::READ
        }
        fn read_value(&self) -> NativeResult {
            Ok(())
        }
        fn write_value(&self, _value: &[u8]) -> NativeResult {
            Ok(())
        }
        fn read_listening(&self) -> NativeResult {
            Ok(())
        }
        fn write_listening(&self, _configuration: ClientConfiguration) -> NativeResult {
            Ok(())
        }
    }

    impl ServiceTransport for Discovery {
        fn explore_characteristics(&self) -> NativeResult {
            *self.explores.lock().unwrap() += 1;
            Ok(())
        }
        fn characteristic(&self, _c: &NativeCharacteristic) -> Arc<dyn CharacteristicTransport> {
            Arc::new(Inert)
        }
    }

    fn service(connected: bool) -> (Arc<Service>, Arc<Discovery>, watch::Sender<bool>, BroadcastSink) {
        let sink = BroadcastSink::default();
        let ctx = BleContext::new(BleConfig::default(), Arc::new(sink.clone()));
        let device = EntityScope::new(ctx, EntityKey::new(EntityKind::Device, "01:02:03:04:05:06"));
        let native = NativeService::new(10, BATTERY_SERVICE);
        let scope = device.child(EntityKind::Service, &native.uuid, native.handle);
        let discovery = Arc::new(Discovery::default());
        let (tx, rx) = watch::channel(connected);
        let transport: Arc<dyn ServiceTransport> = discovery.clone();
        (Service::new(scope, native, transport, rx), discovery, tx, sink)
    }

    fn natives(handles: &[u16]) -> Vec<NativeCharacteristic> {
        handles
            .iter()
            .map(|h| NativeCharacteristic::new(*h, uuid_from_u16(BATTERY_LEVEL + h), CharacteristicProperties::READ))
            .collect()
    }

    async fn explore_once(service: &Arc<Service>, found: Vec<NativeCharacteristic>, options: ExploreOptions) {
        let task = {
            let service = Arc::clone(service);
            tokio::spawn(async move {
                service
                    .explore_with(options, Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(service.on_characteristics_explored(Ok(found)), Delivery::Resolved);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_explore_requires_connection() {
        let (service, discovery, _tx, _sink) = service(false);
        let err = service.explore().await.unwrap_err();
        assert_eq!(err.violation(), Some(Violation::NotConnected));
        assert_eq!(*discovery.explores.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explore_then_lookup() {
        let (service, discovery, _tx, _sink) = service(true);
        explore_once(&service, natives(&[1, 2]), ExploreOptions::new()).await;
        assert!(service.is_explored());
        assert_eq!(service.characteristics().len(), 2);
        assert!(service.characteristic(uuid_from_u16(BATTERY_LEVEL + 1)).unwrap().is_some());
        assert!(service.characteristic(uuid_from_u16(0x2a00)).unwrap().is_none());

        // Already explored: no second discovery.
        service.explore().await.unwrap();
        assert_eq!(*discovery.explores.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscover_replaces_instances() {
        let (service, _discovery, _tx, _sink) = service(true);
        explore_once(&service, natives(&[1]), ExploreOptions::new()).await;
        let before = service.characteristics().remove(0);

        explore_once(&service, natives(&[1]), ExploreOptions::rediscover()).await;
        let after = service.characteristics().remove(0);
        assert!(before.is_disposed());
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_rediscover_clears_once() {
        let (service, discovery, _tx, _sink) = service(true);
        explore_once(&service, natives(&[1]), ExploreOptions::new()).await;
        let before = service.characteristics().remove(0);
        let mut events = service.scope.ctx.events.subscribe();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    service
                        .explore_with(ExploreOptions::rediscover(), Duration::from_secs(5), &CancellationToken::new())
                        .await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(before.is_disposed());
        assert_eq!(service.on_characteristics_explored(Ok(natives(&[1, 2]))), Delivery::Resolved);
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(*discovery.explores.lock().unwrap(), 2);
        assert_eq!(service.characteristics().len(), 2);
        let mut clears = 0;
        while let Ok(event) = events.try_recv() {
            if let BleEvent::CollectionChanged { removed, .. } = event {
                clears += usize::from(!removed.is_empty());
            }
        }
        assert_eq!(clears, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_result_after_disconnect_escalates() {
        let (service, _discovery, tx, sink) = service(true);
        let mut failures = sink.subscribe();
        tx.send_replace(false);

        let delivery = service.on_characteristics_explored(Ok(natives(&[1])));
        assert_eq!(delivery, Delivery::Escalated);
        assert!(service.characteristics().is_empty());
        assert!(matches!(failures.try_recv().unwrap().error, Error::UnexpectedTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cascades_to_characteristics() {
        let (service, _discovery, _tx, _sink) = service(true);
        explore_once(&service, natives(&[1, 2]), ExploreOptions::new()).await;
        let characteristics = service.characteristics();

        service.dispose();
        assert!(service.characteristics().is_empty());
        assert!(!service.is_explored());
        assert!(characteristics.iter().all(|c| c.is_disposed()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_failure_reaches_caller() {
        let (service, _discovery, _tx, _sink) = service(true);
        let task = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.explore().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        service.on_characteristics_explored(Err(NativeError::with_status(0x0a, "attribute not found")));
        assert!(matches!(task.await.unwrap(), Err(Error::Native { .. })));
        assert!(!service.is_explored());
    }
}

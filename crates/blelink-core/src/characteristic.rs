//! GATT characteristic operations.
//!
//! A [`Characteristic`] supports four native operations, each tracked by its
//! own operation slot:
//!
//! - **read**: concurrent reads are coalesced into one native read.
//! - **write**: writes are queued FIFO and issued one at a time, so a write
//!   issued first completes natively before the next one starts. This holds
//!   even when the caller of the first write gave up: the next write waits
//!   for its native completion.
//! - **listen toggle**: reads the client configuration descriptor, writes it
//!   only if it differs from the wanted state, then reads it back. Toggles are
//!   queued FIFO like writes, and one timeout covers the whole sequence.
//! - **value change wait**: waits for the first notification matching a
//!   predicate.
//!
//! All of them require the owning device to be connected and the
//! characteristic to have the matching capability.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use blelink_types::{CharacteristicProperties, ClientConfiguration, NativeCharacteristic};

use crate::collection::Tracked;
use crate::context::EntityScope;
use crate::entity::{EntityKey, OperationKind};
use crate::error::{Capability, Error, Result, Violation};
use crate::events::{BleEvent, StateField};
use crate::metrics::MetricsSummary;
use crate::operation::{Delivery, OperationSlot, Orphan, enqueue};
use crate::transport::{CharacteristicTransport, NativeOutcome};
use crate::watch::Watched;

/// A characteristic of a discovered service.
pub struct Characteristic {
    scope: EntityScope,
    native: NativeCharacteristic,
    transport: Arc<dyn CharacteristicTransport>,
    connected: watch::Receiver<bool>,
    capabilities: OnceLock<CharacteristicProperties>,
    value: Mutex<Option<Bytes>>,
    pending_write: Mutex<Option<Bytes>>,
    /// A native write was issued and has not reported back yet.
    write_outstanding: Watched<bool>,
    listening: Watched<bool>,
    disposed: Watched<bool>,
    read: OperationSlot<Bytes>,
    write: OperationSlot<()>,
    read_listening: OperationSlot<ClientConfiguration>,
    write_listening: OperationSlot<()>,
    write_queue: tokio::sync::Mutex<()>,
    listen_queue: tokio::sync::Mutex<()>,
    notifications: Mutex<Option<broadcast::Sender<Bytes>>>,
}

impl Characteristic {
    pub(crate) fn new(
        scope: EntityScope,
        native: NativeCharacteristic,
        transport: Arc<dyn CharacteristicTransport>,
        connected: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(scope.ctx.config.channels.notifications);
        Arc::new(Self {
            read: OperationSlot::new(&scope, OperationKind::Read, Some(StateField::Reading)),
            write: OperationSlot::new(&scope, OperationKind::Write, Some(StateField::Writing)),
            read_listening: OperationSlot::new(&scope, OperationKind::ReadListening, None),
            write_listening: OperationSlot::new(&scope, OperationKind::WriteListening, None),
            capabilities: OnceLock::new(),
            value: Mutex::new(None),
            pending_write: Mutex::new(None),
            write_outstanding: Watched::new(false),
            listening: Watched::new(false),
            disposed: Watched::new(false),
            write_queue: tokio::sync::Mutex::new(()),
            listen_queue: tokio::sync::Mutex::new(()),
            notifications: Mutex::new(Some(notifications)),
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

    /// Attribute handle of the value.
    pub fn handle(&self) -> u16 {
        self.native.handle
    }

    /// Property bits, fetched from the transport on first use.
    pub fn properties(&self) -> CharacteristicProperties {
        *self
            .capabilities
            .get_or_init(|| self.transport.properties())
    }

    pub fn can_read(&self) -> bool {
        self.properties().can_read()
    }

    pub fn can_write(&self) -> bool {
        self.properties().can_write()
    }

    pub fn can_listen(&self) -> bool {
        self.properties().can_listen()
    }

    /// Last value read or notified.
    pub fn value(&self) -> Option<Bytes> {
        lock(&self.value).clone()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }

    pub fn is_reading(&self) -> bool {
        self.read.in_progress()
    }

    pub fn is_writing(&self) -> bool {
        self.write.in_progress()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Operation metrics of this characteristic.
    pub fn metrics(&self) -> MetricsSummary {
        self.scope.metrics.summary()
    }

    // --- Read ---

    /// Read the value with the default timeout.
    pub async fn read(&self) -> Result<Bytes> {
        self.read_with(self.default_timeout(OperationKind::Read), &CancellationToken::new())
            .await
    }

    /// Read the value. Concurrent reads share one native read.
    #[tracing::instrument(level = "debug", skip_all, fields(characteristic = %self.scope.key))]
    pub async fn read_with(&self, timeout: Duration, cancel: &CancellationToken) -> Result<Bytes> {
        let transport = Arc::clone(&self.transport);
        self.read
            .run(
                || self.require(Capability::Read),
                move || transport.read_value(),
                timeout,
                cancel,
            )
            .await
    }

    /// Return the cached value, reading only if nothing was read yet.
    pub async fn read_if_needed(&self) -> Result<Bytes> {
        self.read_if_needed_with(self.default_timeout(OperationKind::Read), &CancellationToken::new())
            .await
    }

    /// Return the cached value, reading only if nothing was read yet.
    pub async fn read_if_needed_with(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        if let Some(value) = self.value() {
            return Ok(value);
        }
        self.read_with(timeout, cancel).await
    }

    // --- Write ---

    /// Write a value with the default timeout.
    pub async fn write(&self, value: impl Into<Bytes>) -> Result<()> {
        self.write_with(
            value,
            self.default_timeout(OperationKind::Write),
            &CancellationToken::new(),
        )
        .await
    }

    /// Write a value.
    ///
    /// Writes are queued in call order; `timeout` covers the time spent
    /// waiting in the queue as well as the native write.
    #[tracing::instrument(level = "debug", skip_all, fields(characteristic = %self.scope.key))]
    pub async fn write_with(
        &self,
        value: impl Into<Bytes>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let value: Bytes = value.into();
        self.require(Capability::Write)?;
        let deadline = Instant::now() + timeout;
        let (_queued, _) = enqueue(&self.write_queue, OperationKind::Write, timeout, cancel).await?;
        self.settle_write(deadline, timeout, cancel).await?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::timeout(OperationKind::Write, timeout));
        }

        let payload = value.clone();
        let native_payload = value.clone();
        let result = self
            .write
            .run(
                || {
                    self.require(Capability::Write)?;
                    *lock(&self.pending_write) = Some(payload.clone());
                    Ok(())
                },
                || {
                    self.write_outstanding.set(true);
                    let issued = self.transport.write_value(&native_payload);
                    if issued.is_err() {
                        self.write_outstanding.set(false);
                    }
                    issued
                },
                remaining,
                cancel,
            )
            .await;
        if result.is_ok() {
            self.scope.metrics.record_bytes_written(value.len());
        }
        result
    }

    /// Wait until no abandoned native write is on the air.
    ///
    /// Completions carry no request identity, so issuing a write while an
    /// earlier one is unacknowledged would pair the earlier completion with
    /// the new write. A disconnect also ends the wait; the precondition then
    /// fails the write.
    async fn settle_write(
        &self,
        deadline: Instant,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.write_outstanding.get() {
            return Ok(());
        }
        debug!(characteristic = %self.scope.key, "Waiting for an abandoned write to complete");
        let mut outstanding = self.write_outstanding.subscribe();
        let mut connected = self.connected.clone();
        tokio::select! {
            _ = outstanding.wait_for(|outstanding| !*outstanding) => Ok(()),
            _ = connected.wait_for(|connected| !*connected) => Ok(()),
            _ = tokio::time::sleep_until(deadline) => Err(Error::timeout(OperationKind::Write, timeout)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Write unless the cached value already equals `value`.
    pub async fn write_if_needed(&self, value: impl Into<Bytes>) -> Result<()> {
        self.write_if_needed_with(
            value,
            self.default_timeout(OperationKind::Write),
            &CancellationToken::new(),
        )
        .await
    }

    /// Write unless the cached value already equals `value`.
    pub async fn write_if_needed_with(
        &self,
        value: impl Into<Bytes>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let value: Bytes = value.into();
        if self.value().as_ref() == Some(&value) {
            debug!(characteristic = %self.scope.key, "Skipping write of unchanged value");
            return Ok(());
        }
        self.write_with(value, timeout, cancel).await
    }

    // --- Listen toggle ---

    /// Enable notifications or indications with the default timeout.
    pub async fn start_listening(&self) -> Result<()> {
        self.set_listening_with(
            true,
            self.default_timeout(OperationKind::WriteListening),
            &CancellationToken::new(),
        )
        .await
    }

    /// Disable notifications or indications with the default timeout.
    pub async fn stop_listening(&self) -> Result<()> {
        self.set_listening_with(
            false,
            self.default_timeout(OperationKind::WriteListening),
            &CancellationToken::new(),
        )
        .await
    }

    /// Enable or disable value change notifications.
    ///
    /// A no-op when the characteristic is already in the wanted state.
    /// Otherwise the client configuration descriptor is read, written if it
    /// differs, and read back; the listening flag follows the read-back.
    /// `timeout` bounds the queue wait and all three descriptor operations
    /// together.
    #[tracing::instrument(level = "debug", skip_all, fields(characteristic = %self.scope.key, enable))]
    pub async fn set_listening_with(
        &self,
        enable: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.require(Capability::Listen)?;
        if self.listening.get() == enable {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let (_queued, _) =
            enqueue(&self.listen_queue, OperationKind::WriteListening, timeout, cancel).await?;
        if self.listening.get() == enable {
            return Ok(());
        }

        let current = self
            .read_configuration(remaining(deadline, timeout)?, cancel)
            .await?;
        if current.is_listening() != enable {
            let wanted = if enable {
                ClientConfiguration::enabling(self.properties())
                    .ok_or_else(|| Error::unsupported(self.key(), Capability::Listen))?
            } else {
                ClientConfiguration::Disabled
            };
            let transport = Arc::clone(&self.transport);
            self.write_listening
                .run(
                    || self.require(Capability::Listen),
                    move || transport.write_listening(wanted),
                    remaining(deadline, timeout)?,
                    cancel,
                )
                .await?;
        }

        let confirmed = self
            .read_configuration(remaining(deadline, timeout)?, cancel)
            .await?;
        if confirmed.is_listening() != enable {
            return Err(Error::unexpected(
                self.key(),
                OperationKind::WriteListening,
                format!("client configuration reads {:?} after update", confirmed),
            ));
        }
        Ok(())
    }

    async fn read_configuration(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ClientConfiguration> {
        let transport = Arc::clone(&self.transport);
        let configuration = self
            .read_listening
            .run(
                || self.require(Capability::Listen),
                move || transport.read_listening(),
                timeout,
                cancel,
            )
            .await?;
        self.set_listening(configuration.is_listening());
        Ok(configuration)
    }

    // --- Notifications ---

    /// Subscribe to value change notifications.
    ///
    /// The subscription ends when the characteristic is disposed.
    pub fn subscribe(&self) -> Result<ValueSubscription> {
        lock(&self.notifications)
            .as_ref()
            .map(|sender| ValueSubscription {
                rx: sender.subscribe(),
            })
            .ok_or_else(|| Error::disposed(self.key()))
    }

    /// Wait for the first notification whose value satisfies `predicate`.
    ///
    /// Does not enable listening; call [`Characteristic::start_listening`]
    /// first.
    #[tracing::instrument(level = "debug", skip_all, fields(characteristic = %self.scope.key))]
    pub async fn wait_for_value_change<F>(
        &self,
        mut predicate: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Bytes>
    where
        F: FnMut(&Bytes) -> bool,
    {
        let mut subscription = self.subscribe()?;
        let wait = async {
            while let Some(value) = subscription.recv().await {
                if predicate(&value) {
                    return Ok(value);
                }
            }
            Err(Error::disposed(self.key()))
        };
        tokio::select! {
            result = wait => result,
            _ = tokio::time::sleep(timeout) => Err(Error::timeout(OperationKind::Wait, timeout)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    // --- Native callbacks ---

    /// Native read completion.
    ///
    /// Some platforms report notifications through the read callback; a value
    /// that arrives with no read pending while listening is delivered as a
    /// notification.
    pub fn on_value_read(&self, outcome: NativeOutcome<Bytes>) -> Delivery<Bytes> {
        let outcome = match outcome {
            Ok(value) => {
                self.scope.metrics.record_bytes_read(value.len());
                self.store_value(value.clone());
                Ok(value)
            }
            Err(error) => Err(Error::native(self.key(), OperationKind::Read, error)),
        };
        let listening = self.listening.get();
        let delivery = self.read.complete(outcome, |outcome| match outcome {
            Ok(value) if listening => Orphan::Redirect(value),
            Ok(_) => Orphan::Unexpected("value read with no read pending".into()),
            Err(error) => Orphan::Escalate(error),
        });
        if let Delivery::Redirected(value) = &delivery {
            self.notify(value.clone());
        }
        delivery
    }

    /// Native write completion.
    ///
    /// A late success updates the cached value and is absorbed; a late
    /// failure goes to the failure sink.
    pub fn on_value_written(&self, outcome: NativeOutcome<()>) -> Delivery<()> {
        let outcome = match outcome {
            Ok(()) => {
                if let Some(value) = lock(&self.pending_write).take() {
                    self.store_value(value);
                }
                Ok(())
            }
            Err(error) => {
                lock(&self.pending_write).take();
                Err(Error::native(self.key(), OperationKind::Write, error))
            }
        };
        let delivery = self.write.complete(outcome, |outcome| match outcome {
            Ok(()) => Orphan::Absorb,
            Err(error) => Orphan::Escalate(error),
        });
        // Cleared after delivery so a queued write cannot take this completion.
        self.write_outstanding.set(false);
        delivery
    }

    /// Native client configuration read completion.
    pub fn on_listening_read(
        &self,
        outcome: NativeOutcome<ClientConfiguration>,
    ) -> Delivery<ClientConfiguration> {
        let outcome = outcome.map_err(|e| Error::native(self.key(), OperationKind::ReadListening, e));
        self.read_listening.complete(outcome, |outcome| match outcome {
            Ok(configuration) => {
                if self.set_listening(configuration.is_listening()) {
                    Orphan::Unexpected(format!("client configuration became {:?}", configuration))
                } else {
                    Orphan::Absorb
                }
            }
            Err(error) => Orphan::Escalate(error),
        })
    }

    /// Native client configuration write completion.
    pub fn on_listening_written(&self, outcome: NativeOutcome<()>) -> Delivery<()> {
        let outcome =
            outcome.map_err(|e| Error::native(self.key(), OperationKind::WriteListening, e));
        self.write_listening.complete(outcome, |outcome| match outcome {
            Ok(()) => Orphan::Unexpected("client configuration written with no toggle pending".into()),
            Err(error) => Orphan::Escalate(error),
        })
    }

    /// Native notification or indication.
    pub fn on_value_changed(&self, value: Bytes) {
        self.scope.metrics.record_bytes_read(value.len());
        self.store_value(value.clone());
        self.notify(value);
    }

    // --- Internals ---

    fn notify(&self, value: Bytes) {
        if let Some(sender) = lock(&self.notifications).as_ref() {
            // No subscribers is fine.
            let _ = sender.send(value);
        }
    }

    fn store_value(&self, value: Bytes) {
        *lock(&self.value) = Some(value.clone());
        self.scope.emit(BleEvent::ValueChanged {
            entity: self.scope.key.clone(),
            value,
        });
    }

    fn set_listening(&self, listening: bool) -> bool {
        let changed = self.listening.set(listening);
        if changed {
            self.scope.emit_state(StateField::Listening, listening);
        }
        changed
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.disposed.get() {
            return Err(Error::disposed(self.key()));
        }
        if !*self.connected.borrow() {
            return Err(Error::precondition(self.key(), Violation::NotConnected));
        }
        let supported = match capability {
            Capability::Read => self.can_read(),
            Capability::Write => self.can_write(),
            Capability::Listen => self.can_listen(),
        };
        if supported {
            Ok(())
        } else {
            Err(Error::unsupported(self.key(), capability))
        }
    }

    fn default_timeout(&self, kind: OperationKind) -> Duration {
        self.scope.ctx.config.timeout(kind)
    }

    /// Release the characteristic: pending calls fail with
    /// [`Error::Disposed`] and subscriptions end.
    pub(crate) fn dispose(&self) {
        if !self.disposed.set(true) {
            return;
        }
        debug!(characteristic = %self.scope.key, "Disposing characteristic");
        let error = Error::disposed(self.key());
        self.read.cancel_pending(error.clone());
        self.write.cancel_pending(error.clone());
        self.read_listening.cancel_pending(error.clone());
        self.write_listening.cancel_pending(error);
        if lock(&self.pending_write).take().is_some() {
            warn!(characteristic = %self.scope.key, "Disposed with a write in flight");
        }
        self.write_outstanding.set(false);
        self.set_listening(false);
        lock(&self.notifications).take();
        self.scope.emit_state(StateField::Disposed, true);
    }
}

impl Tracked for Characteristic {
    type Native = NativeCharacteristic;

    fn key(&self) -> &EntityKey {
        &self.scope.key
    }

    fn matches(&self, native: &NativeCharacteristic) -> bool {
        self.native.uuid == native.uuid && self.native.handle == native.handle
    }

    fn dispose(&self) {
        Characteristic::dispose(self);
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("key", &self.scope.key)
            .field("listening", &self.listening.get())
            .field("disposed", &self.disposed.get())
            .finish_non_exhaustive()
    }
}

/// Receiver of value change notifications of one characteristic.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct ValueSubscription {
    rx: broadcast::Receiver<Bytes>,
}

impl ValueSubscription {
    /// Next notified value; `None` once the characteristic is disposed.
    ///
    /// Values missed because the subscriber fell behind are skipped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Notification subscriber lagged, skipped {} values", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Turn the subscription into a stream of values.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|value| (value, subscription))
        })
    }
}

/// Time left before `deadline`, or a timeout error once it has passed.
fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(Error::timeout(OperationKind::WriteListening, timeout))
    } else {
        Ok(left)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

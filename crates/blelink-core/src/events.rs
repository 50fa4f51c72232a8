//! Event system for state transitions, operations and notifications.
//!
//! Every observable change in the core is published as a [`BleEvent`] on a
//! broadcast channel owned by the adapter. Consumers subscribe through the
//! [`EventDispatcher`] and filter by entity key and [`StateField`].

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use blelink_types::RadioState;

use crate::entity::{EntityKey, OperationKind};
use crate::error::{Error, Result};

/// Boolean status flag of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum StateField {
    Connected,
    Connecting,
    Disconnecting,
    Running,
    Starting,
    Stopping,
    Explored,
    Exploring,
    Listening,
    Reading,
    Writing,
    Disposed,
}

/// How an operation handle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    /// The native side reported success.
    Succeeded,
    /// The native side reported failure.
    Failed,
    /// Every caller gave up on a timeout before the native side answered.
    TimedOut,
    /// Every caller was cancelled, or the entity was disposed.
    Cancelled,
}

/// Events emitted by the core.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum BleEvent {
    /// A status flag changed.
    StateChanged {
        entity: EntityKey,
        field: StateField,
        value: bool,
    },
    /// A tracked operation created a new handle and issued the native call.
    OperationStarted {
        entity: EntityKey,
        operation: OperationKind,
    },
    /// A tracked operation handle was retired.
    OperationFinished {
        entity: EntityKey,
        operation: OperationKind,
        outcome: OperationOutcome,
    },
    /// The link to a device went down.
    Disconnected { entity: EntityKey, expected: bool },
    /// Reconciliation changed a tracked collection.
    CollectionChanged {
        entity: EntityKey,
        added: Vec<EntityKey>,
        removed: Vec<EntityKey>,
    },
    /// A characteristic value was read or notified.
    ValueChanged { entity: EntityKey, value: Bytes },
    /// An advertisement was received.
    Advertised { entity: EntityKey, rssi: i16 },
    /// The smoothed signal strength of a device changed.
    SignalChanged {
        entity: EntityKey,
        rssi: i16,
        percent: f64,
    },
    /// The local radio changed power state.
    RadioChanged { state: RadioState },
}

impl BleEvent {
    /// The entity this event is about, if any.
    pub fn entity(&self) -> Option<&EntityKey> {
        match self {
            Self::StateChanged { entity, .. }
            | Self::OperationStarted { entity, .. }
            | Self::OperationFinished { entity, .. }
            | Self::Disconnected { entity, .. }
            | Self::CollectionChanged { entity, .. }
            | Self::ValueChanged { entity, .. }
            | Self::Advertised { entity, .. }
            | Self::SignalChanged { entity, .. } => Some(entity),
            Self::RadioChanged { .. } => None,
        }
    }

    /// Whether this is a state change of `field` on `entity`.
    pub fn is_state(&self, key: &EntityKey, wanted: StateField) -> bool {
        matches!(self, Self::StateChanged { entity, field, .. } if entity == key && *field == wanted)
    }
}

/// Sender for events.
pub type EventSender = broadcast::Sender<BleEvent>;

/// Receiver for events.
pub type EventReceiver = broadcast::Receiver<BleEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: BleEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Wait for the first state change of `field` on `entity` whose value
    /// satisfies `predicate`.
    ///
    /// Only changes published after the call are observed; check the current
    /// value on the entity first when it may already hold.
    pub async fn wait_for<F>(
        &self,
        entity: &EntityKey,
        field: StateField,
        mut predicate: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool>
    where
        F: FnMut(bool) -> bool,
    {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(BleEvent::StateChanged {
                        entity: e,
                        field: f,
                        value,
                    }) if &e == entity && f == field && predicate(value) => return Ok(value),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Event waiter lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => return Err(Error::disposed(entity)),
                }
            }
        };

        tokio::select! {
            result = wait => result,
            _ = tokio::time::sleep(timeout) => Err(Error::timeout(OperationKind::Wait, timeout)),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}

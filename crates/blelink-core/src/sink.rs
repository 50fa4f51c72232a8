//! Process-wide destination for failures that no caller is waiting for.
//!
//! A native completion can arrive after its caller timed out, was cancelled,
//! or never existed. When such an orphan completion contradicts the tracked
//! state it cannot be returned to anyone, so it is reported here instead.
//!
//! The sink is held by the [`Adapter`](crate::adapter::Adapter) and shared with
//! every entity it creates. The default [`BroadcastSink`] fans reports out to
//! subscribers and panics when nobody is subscribed, so that failures are
//! never invisible.

use std::fmt;

use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::entity::{EntityKey, OperationKind};
use crate::error::Error;

/// One failure that reached the sink.
#[derive(Debug, Clone)]
pub struct UnhandledFailure {
    /// Entity that received the completion.
    pub entity: EntityKey,
    /// Operation the completion belongs to.
    pub operation: OperationKind,
    /// The failure.
    pub error: Error,
    /// When the failure was reported.
    pub at: OffsetDateTime,
}

impl UnhandledFailure {
    /// Create a report stamped with the current time.
    pub fn new(entity: EntityKey, operation: OperationKind, error: Error) -> Self {
        Self {
            entity,
            operation,
            error,
            at: OffsetDateTime::now_utc(),
        }
    }
}

impl fmt::Display for UnhandledFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unhandled {} failure on {}: {}",
            self.operation, self.entity, self.error
        )
    }
}

/// Receives failures that could not be delivered to a caller.
///
/// `report` is called from native callback context and must not block.
pub trait FailureSink: Send + Sync {
    fn report(&self, failure: UnhandledFailure);
}

/// Broadcasts reports to subscribers; panics when there are none.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<UnhandledFailure>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` reports per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to reports.
    pub fn subscribe(&self) -> broadcast::Receiver<UnhandledFailure> {
        self.sender.subscribe()
    }

    /// Number of subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl FailureSink for BroadcastSink {
    fn report(&self, failure: UnhandledFailure) {
        tracing::warn!(entity = %failure.entity, operation = %failure.operation, "{}", failure.error);
        if let Err(broadcast::error::SendError(failure)) = self.sender.send(failure) {
            panic!("{} (no failure sink subscriber)", failure);
        }
    }
}

/// Logs reports at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl FailureSink for TracingSink {
    fn report(&self, failure: UnhandledFailure) {
        tracing::error!(
            entity = %failure.entity,
            operation = %failure.operation,
            at = %failure.at,
            "Unhandled failure: {}",
            failure.error
        );
    }
}

/// Panics on every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicSink;

impl FailureSink for PanicSink {
    fn report(&self, failure: UnhandledFailure) {
        panic!("{}", failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKind;

    fn failure() -> UnhandledFailure {
        let entity = EntityKey::new(EntityKind::Device, "01:02:03:04:05:06");
        let error = Error::unexpected(&entity, OperationKind::Connect, "late success");
        UnhandledFailure::new(entity, OperationKind::Connect, error)
    }

    #[test]
    fn test_broadcast_sink_delivers() {
        let sink = BroadcastSink::default();
        let mut rx = sink.subscribe();
        sink.report(failure());

        let received = rx.try_recv().unwrap();
        assert_eq!(received.operation, OperationKind::Connect);
        assert!(matches!(received.error, Error::UnexpectedTransition { .. }));
    }

    #[test]
    #[should_panic(expected = "no failure sink subscriber")]
    fn test_broadcast_sink_panics_without_subscriber() {
        BroadcastSink::default().report(failure());
    }

    #[test]
    #[should_panic(expected = "unhandled connect failure")]
    fn test_panic_sink() {
        PanicSink.report(failure());
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        TracingSink.report(failure());
    }
}

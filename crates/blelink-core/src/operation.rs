//! Operation lifecycle controller.
//!
//! Native BLE stacks are fire-and-forget: a call like "connect" returns
//! immediately and the outcome arrives later on a callback thread, with no way
//! to cancel or time it out. [`OperationSlot`] turns that into an awaitable
//! call with single-flight coalescing, a timeout and a cancellation token.
//!
//! Each entity owns one slot per operation kind. A slot holds at most one
//! pending handle:
//!
//! - [`OperationSlot::run`] checks the precondition, then either joins the
//!   pending handle or creates a new one and issues the native call. A native
//!   call that fails synchronously resolves the new handle at once.
//! - The native callback calls [`OperationSlot::complete`], which resolves the
//!   pending handle and wakes every caller with the same outcome.
//! - A caller that times out or is cancelled leaves the handle pending while
//!   other callers still wait on it. When the last one leaves, the handle is
//!   abandoned: the slot is cleared and the in-progress flag drops. The native
//!   call is not undone.
//! - A completion that finds no pending handle is an orphan. The caller of
//!   `complete` decides through an [`Orphan`] policy whether it is absorbed,
//!   escalated to the failure sink, or redirected.
//!
//! The slot is cleared exactly once per handle, and only if the handle being
//! retired is still the current one.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::EntityScope;
use crate::entity::{EntityKey, OperationKind};
use crate::error::{Error, NativeError, Result};
use crate::events::{BleEvent, OperationOutcome, StateField};
use crate::sink::UnhandledFailure;
use crate::watch::Watched;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// One in-flight asynchronous unit of work.
struct Handle<T> {
    id: u64,
    outcome: watch::Sender<Option<Result<T>>>,
    started: Instant,
    /// Number of callers awaiting this handle. Only changed under the slot lock.
    waiters: AtomicUsize,
}

impl<T> Handle<T> {
    fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            outcome,
            started: Instant::now(),
            waiters: AtomicUsize::new(0),
        }
    }
}

/// What to do with a completion that no caller is waiting for.
#[derive(Debug)]
pub enum Orphan<T> {
    /// The tracked state already matches the outcome; log and drop it.
    Absorb,
    /// The outcome contradicts the tracked state; report it to the sink as an
    /// unexpected transition with this detail.
    Unexpected(String),
    /// Report this error to the sink.
    Escalate(Error),
    /// Hand the value back for delivery through another path.
    Redirect(T),
}

/// How [`OperationSlot::complete`] delivered an outcome.
#[derive(Debug, PartialEq)]
pub enum Delivery<T> {
    /// A pending handle was resolved.
    Resolved,
    /// Orphan absorbed.
    Absorbed,
    /// Orphan reported to the failure sink.
    Escalated,
    /// Orphan value handed back to the caller of `complete`.
    Redirected(T),
}

struct SlotState<T> {
    current: Option<Arc<Handle<T>>>,
}

/// Tracks the pending handle of one operation kind on one entity.
pub(crate) struct OperationSlot<T> {
    scope: EntityScope,
    kind: OperationKind,
    progress: Option<StateField>,
    state: Mutex<SlotState<T>>,
    in_progress: Watched<bool>,
}

impl<T> OperationSlot<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty slot. `progress` names the status flag that mirrors
    /// the in-progress state, if the entity publishes one.
    pub(crate) fn new(scope: &EntityScope, kind: OperationKind, progress: Option<StateField>) -> Self {
        Self {
            scope: scope.clone(),
            kind,
            progress,
            state: Mutex::new(SlotState { current: None }),
            in_progress: Watched::new(false),
        }
    }

    /// Whether a handle is pending.
    pub(crate) fn in_progress(&self) -> bool {
        self.in_progress.get()
    }

    pub(crate) fn key(&self) -> &EntityKey {
        &self.scope.key
    }

    /// Run the operation, or join the pending run.
    ///
    /// `precondition` is evaluated first in both cases. `native` is called at
    /// most once, outside every lock, and only by the caller that created the
    /// handle.
    pub(crate) async fn run<P, N>(
        &self,
        precondition: P,
        native: N,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        P: FnOnce() -> Result<()>,
        N: FnOnce() -> std::result::Result<(), NativeError>,
    {
        let (handle, fresh) = {
            let mut state = self.lock();
            precondition()?;
            match &state.current {
                Some(current) => {
                    current.waiters.fetch_add(1, Ordering::Relaxed);
                    debug!(entity = %self.scope.key, operation = %self.kind, id = current.id, "Joining pending operation");
                    (Arc::clone(current), false)
                }
                None => {
                    let handle = Arc::new(Handle::new());
                    handle.waiters.store(1, Ordering::Relaxed);
                    state.current = Some(Arc::clone(&handle));
                    self.in_progress.set(true);
                    (handle, true)
                }
            }
        };

        let mut waiter = Waiter {
            slot: self,
            handle,
            exit: OperationOutcome::Cancelled,
        };

        if fresh {
            debug!(entity = %self.scope.key, operation = %self.kind, id = waiter.handle.id, "Starting operation");
            if let Some(field) = self.progress {
                self.scope.emit_state(field, true);
            }
            self.scope.emit(BleEvent::OperationStarted {
                entity: self.scope.key.clone(),
                operation: self.kind,
            });
            if let Err(error) = native() {
                debug!(entity = %self.scope.key, operation = %self.kind, "Native call failed synchronously: {}", error);
                // Nothing else can retire a handle whose native call never went out.
                let _ = self.resolve(
                    &waiter.handle,
                    Err(Error::native(&self.scope.key, self.kind, error)),
                );
            }
        }

        let mut rx = waiter.handle.outcome.subscribe();
        tokio::select! {
            biased;
            outcome = rx.wait_for(Option::is_some) => {
                let outcome = match outcome {
                    Ok(value) => (*value).clone(),
                    Err(_) => None,
                };
                waiter.exit = match &outcome {
                    Some(Ok(_)) => OperationOutcome::Succeeded,
                    _ => OperationOutcome::Failed,
                };
                outcome.unwrap_or(Err(Error::Cancelled))
            }
            _ = cancel.cancelled() => {
                debug!(entity = %self.scope.key, operation = %self.kind, "Caller cancelled");
                Err(Error::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                waiter.exit = OperationOutcome::TimedOut;
                self.scope.metrics.operation(self.kind).record_timeout();
                debug!(entity = %self.scope.key, operation = %self.kind, ?timeout, "Caller timed out");
                Err(Error::timeout(self.kind, timeout))
            }
        }
    }

    /// Deliver a native completion.
    ///
    /// Resolves the pending handle if there is one. Otherwise `policy` decides
    /// what happens to the orphaned outcome. The sink is called without any
    /// lock held.
    pub(crate) fn complete<F>(&self, outcome: Result<T>, policy: F) -> Delivery<T>
    where
        F: FnOnce(Result<T>) -> Orphan<T>,
    {
        let pending = self.lock().current.clone();
        self.deliver(pending, outcome, policy)
    }

    /// Resolve `pending`, or apply `policy` when there is none or it was
    /// retired in the meantime.
    fn deliver<F>(&self, pending: Option<Arc<Handle<T>>>, outcome: Result<T>, policy: F) -> Delivery<T>
    where
        F: FnOnce(Result<T>) -> Orphan<T>,
    {
        let outcome = match pending {
            Some(handle) => match self.resolve(&handle, outcome) {
                Ok(()) => return Delivery::Resolved,
                // Retired by a racing completion or the last waiter leaving.
                Err(outcome) => outcome,
            },
            None => outcome,
        };

        self.scope.metrics.operation(self.kind).record_orphan();
        match policy(outcome) {
            Orphan::Absorb => {
                debug!(entity = %self.scope.key, operation = %self.kind, "Absorbed orphan completion");
                Delivery::Absorbed
            }
            Orphan::Unexpected(detail) => {
                warn!(entity = %self.scope.key, operation = %self.kind, "Unexpected completion: {}", detail);
                let error = Error::unexpected(&self.scope.key, self.kind, detail);
                self.escalate(error);
                Delivery::Escalated
            }
            Orphan::Escalate(error) => {
                warn!(entity = %self.scope.key, operation = %self.kind, "Orphan failure: {}", error);
                self.escalate(error);
                Delivery::Escalated
            }
            Orphan::Redirect(value) => Delivery::Redirected(value),
        }
    }

    /// Resolve the pending handle, if any, with `error`.
    ///
    /// Used on disposal. Returns `true` if a handle was pending.
    pub(crate) fn cancel_pending(&self, error: Error) -> bool {
        let pending = self.lock().current.clone();
        match pending {
            Some(handle) => self.resolve(&handle, Err(error)).is_ok(),
            None => false,
        }
    }

    /// Send a failure straight to the sink.
    pub(crate) fn escalate(&self, error: Error) {
        self.scope.ctx.sink.report(UnhandledFailure::new(
            self.scope.key.clone(),
            self.kind,
            error,
        ));
    }

    /// Resolve `handle` if it is still current. Hands `outcome` back if the
    /// handle was already retired.
    fn resolve(&self, handle: &Arc<Handle<T>>, outcome: Result<T>) -> std::result::Result<(), Result<T>> {
        {
            let mut state = self.lock();
            if !state
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, handle))
            {
                return Err(outcome);
            }
            state.current = None;
            self.in_progress.set(false);
        }

        let success = outcome.is_ok();
        let disposed = matches!(outcome, Err(Error::Disposed { .. }));
        if !disposed {
            self.scope
                .metrics
                .operation(self.kind)
                .record(success, handle.started.elapsed());
        }
        handle.outcome.send_replace(Some(outcome));

        let outcome = if success {
            OperationOutcome::Succeeded
        } else if disposed {
            OperationOutcome::Cancelled
        } else {
            OperationOutcome::Failed
        };
        self.finished(handle, outcome);
        Ok(())
    }

    /// Called when a waiter leaves. Abandons the handle when it was the last.
    fn leave(&self, handle: &Arc<Handle<T>>, exit: OperationOutcome) {
        let abandoned = {
            let mut state = self.lock();
            let remaining = handle.waiters.load(Ordering::Relaxed).saturating_sub(1);
            handle.waiters.store(remaining, Ordering::Relaxed);
            let current = state
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, handle));
            if remaining == 0 && current {
                state.current = None;
                self.in_progress.set(false);
                true
            } else {
                false
            }
        };

        if abandoned {
            debug!(entity = %self.scope.key, operation = %self.kind, id = handle.id, ?exit, "Abandoned pending operation");
            self.finished(handle, exit);
        }
    }

    fn finished(&self, handle: &Handle<T>, outcome: OperationOutcome) {
        debug!(entity = %self.scope.key, operation = %self.kind, id = handle.id, ?outcome, "Operation finished");
        if let Some(field) = self.progress {
            self.scope.emit_state(field, false);
        }
        self.scope.emit(BleEvent::OperationFinished {
            entity: self.scope.key.clone(),
            operation: self.kind,
            outcome,
        });
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Take a place in a FIFO queue, giving up after `timeout`.
///
/// Returns the guard and the part of `timeout` that is left.
pub(crate) async fn enqueue<'a>(
    queue: &'a tokio::sync::Mutex<()>,
    kind: OperationKind,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(tokio::sync::MutexGuard<'a, ()>, Duration)> {
    let deadline = Instant::now() + timeout;
    tokio::select! {
        guard = queue.lock() => {
            Ok((guard, deadline.saturating_duration_since(Instant::now())))
        }
        _ = tokio::time::sleep_until(deadline) => Err(Error::timeout(kind, timeout)),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

impl<T> fmt::Debug for OperationSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSlot")
            .field("entity", &self.scope.key)
            .field("kind", &self.kind)
            .field("in_progress", &self.in_progress)
            .finish()
    }
}

/// Registration of one caller on a handle; leaves on drop.
struct Waiter<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    slot: &'a OperationSlot<T>,
    handle: Arc<Handle<T>>,
    exit: OperationOutcome,
}

impl<T> Drop for Waiter<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.slot.leave(&self.handle, self.exit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BleConfig;
    use crate::context::BleContext;
    use crate::entity::EntityKind;
    use crate::sink::BroadcastSink;

    fn scope() -> (EntityScope, BroadcastSink) {
        let sink = BroadcastSink::default();
        let ctx = BleContext::new(BleConfig::default(), Arc::new(sink.clone()));
        let key = EntityKey::new(EntityKind::Device, "01:02:03:04:05:06");
        (EntityScope::new(ctx, key), sink)
    }

    fn slot(scope: &EntityScope) -> Arc<OperationSlot<u32>> {
        Arc::new(OperationSlot::new(
            scope,
            OperationKind::Read,
            Some(StateField::Reading),
        ))
    }

    fn ok() -> Result<()> {
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_join() {
        let (scope, _sink) = scope();
        let slot = slot(&scope);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                slot.run(
                    ok,
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
            }));
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(slot.in_progress());

        assert_eq!(slot.complete(Ok(7), |_| Orphan::Absorb), Delivery::Resolved);
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!slot.in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_precondition_fails_fast() {
        let (scope, _sink) = scope();
        let slot = slot(&scope);
        let err = slot
            .run(
                || Err(Error::precondition(slot.key(), crate::error::Violation::NotConnected)),
                || panic!("native call must not run"),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition { .. }));
        assert!(!slot.in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronous_native_failure_resolves_handle() {
        let (scope, _sink) = scope();
        let slot = slot(&scope);
        let err = slot
            .run(
                ok,
                || Err(NativeError::new("radio busy")),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Native { .. }));
        assert!(!slot.in_progress());
        let metrics = scope.metrics.operation(OperationKind::Read).snapshot();
        assert_eq!(metrics.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_abandons_handle_and_late_completion_is_orphan() {
        let (scope, sink) = scope();
        let mut failures = sink.subscribe();
        let slot = slot(&scope);

        let err = slot
            .run(ok, || Ok(()), Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(!slot.in_progress());

        let delivery = slot.complete(Ok(1), |_| Orphan::Unexpected("late read".into()));
        assert_eq!(delivery, Delivery::Escalated);
        let failure = failures.try_recv().unwrap();
        assert!(matches!(failure.error, Error::UnexpectedTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_caller_keeps_handle_alive_after_first_times_out() {
        let (scope, _sink) = scope();
        let slot = slot(&scope);
        let calls = Arc::new(AtomicUsize::new(0));

        let long = {
            let slot = Arc::clone(&slot);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                slot.run(
                    ok,
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    Duration::from_secs(10),
                    &CancellationToken::new(),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let short = slot
            .run(ok, || panic!("joined caller must not call native"), Duration::from_secs(1), &CancellationToken::new())
            .await;
        assert!(matches!(short, Err(Error::Timeout { .. })));
        assert!(slot.in_progress());

        assert_eq!(slot.complete(Ok(3), |_| Orphan::Absorb), Delivery::Resolved);
        assert_eq!(long.await.unwrap().unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_caller() {
        let (scope, _sink) = scope();
        let slot = slot(&scope);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = slot
            .run(ok, || Ok(()), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!slot.in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_on_dispose() {
        let (scope, _sink) = scope();
        let slot = slot(&scope);
        let task = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                slot.run(ok, || Ok(()), Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(slot.cancel_pending(Error::disposed(slot.key())));
        assert!(matches!(task.await.unwrap(), Err(Error::Disposed { .. })));
        assert!(!slot.cancel_pending(Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_for_retired_handle_follows_orphan_policy() {
        let (scope, sink) = scope();
        let mut failures = sink.subscribe();
        let slot = slot(&scope);
        let task = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                slot.run(ok, || Ok(()), Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        // A completion that read the handle just before it was retired.
        let stale = slot.lock().current.clone();
        assert!(stale.is_some());
        assert!(slot.cancel_pending(Error::disposed(slot.key())));
        assert!(matches!(task.await.unwrap(), Err(Error::Disposed { .. })));

        let error = Error::native(slot.key(), OperationKind::Read, NativeError::new("read failed"));
        let delivery = slot.deliver(stale, Err(error), |outcome| match outcome {
            Ok(_) => Orphan::Absorb,
            Err(error) => Orphan::Escalate(error),
        });
        assert_eq!(delivery, Delivery::Escalated);
        assert!(matches!(failures.try_recv().unwrap().error, Error::Native { .. }));
        let metrics = scope.metrics.operation(OperationKind::Read).snapshot();
        assert_eq!(metrics.orphan_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_returns_value() {
        let (scope, _sink) = scope();
        let slot = slot(&scope);
        let delivery = slot.complete(Ok(9), |outcome| match outcome {
            Ok(value) => Orphan::Redirect(value),
            Err(error) => Orphan::Escalate(error),
        });
        assert_eq!(delivery, Delivery::Redirected(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_and_finished_events() {
        let (scope, _sink) = scope();
        let mut events = scope.ctx.events.subscribe();
        let slot = slot(&scope);

        let task = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                slot.run(ok, || Ok(()), Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        slot.complete(Ok(1), |_| Orphan::Absorb);
        task.await.unwrap().unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let key = scope.key.clone();
        assert_eq!(
            seen,
            vec![
                BleEvent::StateChanged { entity: key.clone(), field: StateField::Reading, value: true },
                BleEvent::OperationStarted { entity: key.clone(), operation: OperationKind::Read },
                BleEvent::StateChanged { entity: key.clone(), field: StateField::Reading, value: false },
                BleEvent::OperationFinished {
                    entity: key,
                    operation: OperationKind::Read,
                    outcome: OperationOutcome::Succeeded,
                },
            ]
        );
    }
}

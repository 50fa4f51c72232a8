//! Start/stop lifecycle of long-lived radio activities.
//!
//! [`Activity`] drives `Idle -> Starting -> Running -> Stopping -> Idle` for
//! the scanner and the broadcaster. Starting requires the radio to be powered
//! on; if it is not yet, the start waits for it up to the radio wait timeout
//! before the native start call is issued.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::EntityScope;
use crate::entity::{EntityKey, OperationKind};
use crate::error::{Error, Result, Violation};
use crate::events::StateField;
use crate::operation::{Delivery, OperationSlot, Orphan};
use crate::transport::{NativeOutcome, NativeResult};
use crate::watch::Watched;

/// Observable state of an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Start/stop state machine built on two operation slots.
#[derive(Debug)]
pub struct Activity {
    scope: EntityScope,
    running: Watched<bool>,
    start: OperationSlot<()>,
    stop: OperationSlot<()>,
}

impl Activity {
    pub(crate) fn new(scope: EntityScope) -> Self {
        Self {
            start: OperationSlot::new(&scope, OperationKind::Start, Some(StateField::Starting)),
            stop: OperationSlot::new(&scope, OperationKind::Stop, Some(StateField::Stopping)),
            running: Watched::new(false),
            scope,
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.scope.key
    }

    /// Current state.
    pub fn state(&self) -> ActivityState {
        if self.running.get() {
            if self.stop.in_progress() {
                ActivityState::Stopping
            } else {
                ActivityState::Running
            }
        } else if self.start.in_progress() {
            ActivityState::Starting
        } else {
            ActivityState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn is_starting(&self) -> bool {
        self.start.in_progress()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.in_progress()
    }

    /// Wait until the running flag equals `running`.
    pub async fn wait_until_running(
        &self,
        running: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.running
            .wait_until(|r| *r == running, timeout, cancel)
            .await
            .map(|_| ())
    }

    /// Start the activity, or join a start in progress.
    pub(crate) async fn start<N>(
        &self,
        native: N,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        N: FnOnce() -> NativeResult,
    {
        self.require_radio(cancel).await?;
        self.start
            .run(
                || {
                    if self.stop.in_progress() {
                        Err(Error::precondition(self.key(), Violation::Busy))
                    } else if self.running.get() {
                        Err(Error::precondition(self.key(), Violation::AlreadyRunning))
                    } else {
                        Ok(())
                    }
                },
                native,
                timeout,
                cancel,
            )
            .await
    }

    /// Start unless already running.
    pub(crate) async fn start_if_needed<N>(
        &self,
        native: N,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        N: FnOnce() -> NativeResult,
    {
        if self.state() == ActivityState::Running {
            return Ok(());
        }
        self.start(native, timeout, cancel).await
    }

    /// Stop the activity, or join a stop in progress.
    pub(crate) async fn stop<N>(
        &self,
        native: N,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        N: FnOnce() -> NativeResult,
    {
        self.stop
            .run(
                || {
                    if self.start.in_progress() {
                        Err(Error::precondition(self.key(), Violation::Busy))
                    } else if !self.running.get() {
                        Err(Error::precondition(self.key(), Violation::NotRunning))
                    } else {
                        Ok(())
                    }
                },
                native,
                timeout,
                cancel,
            )
            .await
    }

    /// Stop unless already idle.
    pub(crate) async fn stop_if_needed<N>(
        &self,
        native: N,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        N: FnOnce() -> NativeResult,
    {
        if self.state() == ActivityState::Idle {
            return Ok(());
        }
        self.stop(native, timeout, cancel).await
    }

    /// Native start completion.
    pub fn on_started(&self, outcome: NativeOutcome<()>) -> Delivery<()> {
        match outcome {
            Ok(()) => {
                let changed = self.set_running(true);
                if changed {
                    info!(entity = %self.scope.key, "Activity started");
                }
                self.start.complete(Ok(()), |_| {
                    if changed {
                        Orphan::Unexpected("started with no start pending".into())
                    } else {
                        Orphan::Absorb
                    }
                })
            }
            Err(error) => {
                let error = Error::native(self.key(), OperationKind::Start, error);
                self.start.complete(Err(error), |outcome| match outcome {
                    Err(_) if !self.running.get() => Orphan::Absorb,
                    Err(error) => Orphan::Escalate(error),
                    Ok(()) => Orphan::Absorb,
                })
            }
        }
    }

    /// Native stop completion.
    pub fn on_stopped(&self, outcome: NativeOutcome<()>) -> Delivery<()> {
        match outcome {
            Ok(()) => {
                let changed = self.set_running(false);
                if changed {
                    info!(entity = %self.scope.key, "Activity stopped");
                }
                self.stop.complete(Ok(()), |_| {
                    if changed {
                        Orphan::Unexpected("stopped with no stop pending".into())
                    } else {
                        Orphan::Absorb
                    }
                })
            }
            Err(error) => {
                let error = Error::native(self.key(), OperationKind::Stop, error);
                self.stop.complete(Err(error), |outcome| match outcome {
                    Err(_) if self.running.get() => Orphan::Absorb,
                    Err(error) => Orphan::Escalate(error),
                    Ok(()) => Orphan::Absorb,
                })
            }
        }
    }

    /// Resolve pending start and stop calls with a disposal error.
    pub(crate) fn dispose(&self) {
        let error = Error::disposed(self.key());
        self.start.cancel_pending(error.clone());
        self.stop.cancel_pending(error);
        self.set_running(false);
    }

    fn set_running(&self, running: bool) -> bool {
        let changed = self.running.set(running);
        if changed {
            debug!(entity = %self.scope.key, running, "Running flag changed");
            self.scope.emit_state(StateField::Running, running);
        }
        changed
    }

    async fn require_radio(&self, cancel: &CancellationToken) -> Result<()> {
        if self.scope.ctx.radio.get().is_powered_on() {
            return Ok(());
        }
        let timeout = self.scope.ctx.config.timeout(OperationKind::RadioWait);
        debug!(entity = %self.scope.key, ?timeout, "Waiting for radio");
        match self
            .scope
            .ctx
            .radio
            .wait_until(|state| state.is_powered_on(), timeout, cancel)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Timeout { .. }) => Err(Error::precondition(self.key(), Violation::RadioOff)),
            Err(e) => Err(e),
        }
    }
}

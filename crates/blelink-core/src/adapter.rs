//! The adapter root.
//!
//! An [`Adapter`] owns everything shared by the entities it creates: the
//! configuration, the event channel, the failure sink, the process-wide
//! signal bounds and the radio state. The radio state is polled from the
//! transport on a background task until the adapter is shut down.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blelink_types::{DeviceAddress, RadioState};

use crate::config::BleConfig;
use crate::context::BleContext;
use crate::device::Device;
use crate::entity::OperationKind;
use crate::error::Result;
use crate::events::{BleEvent, EventReceiver};
use crate::scanner::{Broadcaster, Scanner};
use crate::sink::{BroadcastSink, FailureSink, UnhandledFailure};
use crate::transport::AdapterTransport;

/// Builder for an [`Adapter`].
#[must_use]
pub struct AdapterBuilder {
    transport: Arc<dyn AdapterTransport>,
    config: BleConfig,
    sink: Option<Arc<dyn FailureSink>>,
}

impl AdapterBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: BleConfig) -> Self {
        self.config = config;
        self
    }

    /// Report unhandled failures to `sink` instead of the default
    /// [`BroadcastSink`].
    pub fn sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and start the adapter.
    ///
    /// Radio polling starts when called inside a Tokio runtime.
    pub fn build(self) -> Result<Adapter> {
        self.config.validate()?;
        let (sink, failures) = match self.sink {
            Some(sink) => (sink, None),
            None => {
                let default = BroadcastSink::new(self.config.channels.failures);
                (Arc::new(default.clone()) as Arc<dyn FailureSink>, Some(default))
            }
        };
        let ctx = BleContext::new(self.config, sink);
        poll_radio(&ctx, self.transport.as_ref());

        let shutdown = CancellationToken::new();
        let poller = match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(radio_monitor(
                Arc::clone(&ctx),
                Arc::clone(&self.transport),
                shutdown.clone(),
            ))),
            Err(_) => {
                warn!("No tokio runtime available, radio state will not be polled");
                None
            }
        };

        Ok(Adapter {
            scanner: Arc::new(Scanner::new(Arc::clone(&ctx), Arc::clone(&self.transport))),
            broadcaster: Arc::new(Broadcaster::new(Arc::clone(&ctx), self.transport.broadcaster())),
            poller: Mutex::new(poller),
            transport: self.transport,
            failures,
            shutdown,
            ctx,
        })
    }
}

/// Root of a BLE client.
///
/// # Example
///
/// ```ignore
/// use blelink_core::{Adapter, ScanFilter};
///
/// let adapter = Adapter::new(transport)?;
/// let mut failures = adapter.subscribe_failures().unwrap();
/// adapter.scanner().start(ScanFilter::default()).await?;
/// ```
pub struct Adapter {
    ctx: Arc<BleContext>,
    transport: Arc<dyn AdapterTransport>,
    scanner: Arc<Scanner>,
    broadcaster: Arc<Broadcaster>,
    failures: Option<BroadcastSink>,
    shutdown: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Adapter {
    /// Start building an adapter over `transport`.
    pub fn builder(transport: Arc<dyn AdapterTransport>) -> AdapterBuilder {
        AdapterBuilder {
            transport,
            config: BleConfig::default(),
            sink: None,
        }
    }

    /// Adapter with the default configuration and failure sink.
    pub fn new(transport: Arc<dyn AdapterTransport>) -> Result<Self> {
        Self::builder(transport).build()
    }

    pub fn context(&self) -> &Arc<BleContext> {
        &self.ctx
    }

    pub fn config(&self) -> &BleConfig {
        &self.ctx.config
    }

    /// Last polled radio state.
    pub fn radio_state(&self) -> RadioState {
        self.ctx.radio.get()
    }

    /// Poll the radio state now.
    pub fn refresh_radio_state(&self) -> RadioState {
        poll_radio(&self.ctx, self.transport.as_ref())
    }

    /// Wait until the radio is powered on.
    pub async fn wait_for_radio(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        self.ctx
            .radio
            .wait_until(|state| state.is_powered_on(), timeout, cancel)
            .await
            .map(|_| ())
    }

    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// The device with this address. Returns the instance the scanner
    /// tracks, creating it when the address was never seen.
    pub fn device(&self, address: &DeviceAddress) -> Arc<Device> {
        self.scanner.device(address)
    }

    /// Subscribe to adapter events.
    pub fn subscribe(&self) -> EventReceiver {
        self.ctx.events.subscribe()
    }

    /// Subscribe to unhandled failures.
    ///
    /// `None` when the adapter was built with a custom sink. With the default
    /// sink, failures reported while nothing is subscribed panic on the
    /// reporting thread.
    pub fn subscribe_failures(&self) -> Option<broadcast::Receiver<UnhandledFailure>> {
        self.failures.as_ref().map(BroadcastSink::subscribe)
    }

    /// Stop radio polling and dispose the scanner, its devices and the
    /// broadcaster. Native activities are not stopped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let poller = lock(&self.poller).take();
        if let Some(poller) = poller {
            if let Err(e) = poller.await {
                warn!("Radio monitor ended abnormally: {}", e);
            }
        }
        self.scanner.dispose();
        self.broadcaster.dispose();
        info!("Adapter shut down");
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("radio", &self.radio_state())
            .field("scanner", &self.scanner)
            .field("broadcaster", &self.broadcaster)
            .finish_non_exhaustive()
    }
}

fn poll_radio(ctx: &BleContext, transport: &dyn AdapterTransport) -> RadioState {
    let state = transport.radio_state();
    if ctx.radio.set(state) {
        if state.is_powered_on() {
            info!(?state, "Radio state changed");
        } else {
            warn!(?state, "Radio state changed");
        }
        ctx.events.send(BleEvent::RadioChanged { state });
    }
    state
}

async fn radio_monitor(
    ctx: Arc<BleContext>,
    transport: Arc<dyn AdapterTransport>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(ctx.config.radio_poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(interval = ?ctx.config.radio_poll_interval(), timeout = ?ctx.config.timeout(OperationKind::RadioWait), "Radio monitor started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Radio monitor cancelled, shutting down");
                break;
            }
            _ = ticker.tick() => {
                poll_radio(&ctx, transport.as_ref());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

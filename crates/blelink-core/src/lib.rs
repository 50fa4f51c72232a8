//! Operation lifecycle core for a cross-platform BLE client.
//!
//! This crate sits between application code and a platform Bluetooth stack.
//! Platform stacks report the outcome of every native request through a
//! callback, at some later time, possibly after the caller gave up. This
//! crate turns that into single-flight async operations with timeouts and
//! cancellation, and keeps an accurate model of the remote GATT tree.
//!
//! # Features
//!
//! - **Single-flight operations**: concurrent callers of the same operation
//!   share one native request and one outcome
//! - **Late completions**: callbacks arriving after a timeout update state
//!   and are reported to a [`FailureSink`] when nobody could see them
//! - **State machines**: connection, exploration, listening and activity
//!   state with change events
//! - **Reconciliation**: rediscovery keeps the identity of surviving
//!   services and characteristics
//! - **Ordered writes**: writes to one characteristic reach the radio one at
//!   a time, in call order
//! - **Signal smoothing**: windowed RSSI averages mapped to a percentage
//! - **Testing without hardware**: [`mock::MockTransport`] and
//!   [`mock::MockDriver`]
//!
//! # Platform integration
//!
//! A platform backend implements the traits in [`transport`]. Each native
//! request method returns as soon as the request is issued; the backend
//! later reports the outcome through the matching `on_*` method of the
//! entity, such as [`Device::on_connected`] or
//! [`Characteristic::on_value_read`].
//!
//! # Quick Start
//!
//! ```no_run
//! use blelink_core::{Adapter, ScanFilter};
//! use blelink_core::mock::MockTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = Adapter::new(MockTransport::new())?;
//!     let _failures = adapter.subscribe_failures();
//!
//!     adapter.scanner().start(ScanFilter::default()).await?;
//!     for device in adapter.scanner().devices() {
//!         device.connect().await?;
//!         device.explore().await?;
//!         println!("{}: {} services", device.address(), device.services().len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod adapter;
pub mod characteristic;
pub mod collection;
pub mod config;
pub mod context;
pub mod device;
pub mod entity;
pub mod error;
pub mod events;
pub mod guard;
pub mod metrics;
pub mod mock;
pub mod operation;
pub mod scanner;
pub mod service;
pub mod signal;
pub mod sink;
pub mod traits;
pub mod transport;
pub mod watch;

pub use blelink_types::{types, uuids};
pub use blelink_types::{
    Advertisement, CharacteristicProperties, ClientConfiguration, DeviceAddress,
    NativeCharacteristic, NativeService, RadioState,
};

pub use activity::ActivityState;
pub use adapter::{Adapter, AdapterBuilder};
pub use characteristic::{Characteristic, ValueSubscription};
pub use collection::{Delta, Tracked, TrackedCollection};
pub use config::BleConfig;
pub use device::{ConnectionState, Device};
pub use entity::{EntityKey, EntityKind, OperationKind};
pub use error::{Capability, Error, ErrorCategory, NativeError, Result, Violation};
pub use events::{BleEvent, EventReceiver, StateField};
pub use guard::ConnectionGuard;
pub use metrics::{MetricsSummary, OperationMetrics};
pub use operation::{Delivery, Orphan};
pub use scanner::{Broadcaster, Scanner};
pub use service::Service;
pub use signal::{SignalBounds, SignalStrength};
pub use sink::{BroadcastSink, FailureSink, PanicSink, TracingSink, UnhandledFailure};
pub use traits::{Explorable, ExploreOptions};
pub use transport::{
    AdapterTransport, BroadcastPayload, BroadcastTransport, CharacteristicTransport,
    DeviceTransport, NativeOutcome, NativeResult, ScanFilter, ScanTransport, ServiceTransport,
};

/// Shared handle to a device.
pub type SharedDevice = std::sync::Arc<Device>;

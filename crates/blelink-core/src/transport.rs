//! Interfaces to the platform BLE stack.
//!
//! A platform backend implements these traits. Every method is
//! fire-and-forget: it issues the native call and returns. An `Err` return
//! means the call could not be issued at all. The outcome of an issued call
//! is reported later by calling the matching `on_*` method on the entity,
//! from whatever thread the platform delivers callbacks on:
//!
//! | Transport call | Completion callback |
//! |----------------|---------------------|
//! | [`ScanTransport::start`] | [`Activity::on_started`](crate::activity::Activity::on_started) |
//! | [`DeviceTransport::connect`] | [`Device::on_connected`](crate::device::Device::on_connected) / [`Device::on_connect_failed`](crate::device::Device::on_connect_failed) |
//! | [`DeviceTransport::disconnect`] | [`Device::on_disconnected`](crate::device::Device::on_disconnected) |
//! | [`DeviceTransport::explore_services`] | [`Device::on_services_explored`](crate::device::Device::on_services_explored) |
//! | [`DeviceTransport::read_signal_strength`] | [`Device::on_signal_strength`](crate::device::Device::on_signal_strength) |
//! | [`ServiceTransport::explore_characteristics`] | [`Service::on_characteristics_explored`](crate::service::Service::on_characteristics_explored) |
//! | [`CharacteristicTransport::read_value`] | [`Characteristic::on_value_read`](crate::characteristic::Characteristic::on_value_read) |
//! | [`CharacteristicTransport::write_value`] | [`Characteristic::on_value_written`](crate::characteristic::Characteristic::on_value_written) |
//! | [`CharacteristicTransport::read_listening`] | [`Characteristic::on_listening_read`](crate::characteristic::Characteristic::on_listening_read) |
//! | [`CharacteristicTransport::write_listening`] | [`Characteristic::on_listening_written`](crate::characteristic::Characteristic::on_listening_written) |

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use blelink_types::{
    CharacteristicProperties, ClientConfiguration, DeviceAddress, NativeCharacteristic,
    NativeService, RadioState,
};

use crate::error::NativeError;

/// Outcome of issuing a native call.
pub type NativeResult = std::result::Result<(), NativeError>;

/// Outcome of a completed native call as reported by a callback.
pub type NativeOutcome<T> = std::result::Result<T, NativeError>;

/// Discovery filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report devices advertising one of these services. Empty means all.
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    /// Filter on the given services.
    pub fn services(services: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            services: services.into_iter().collect(),
        }
    }
}

/// Data to advertise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastPayload {
    pub name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_id: Option<u16>,
    pub manufacturer_data: Bytes,
    pub connectable: bool,
}

/// The local radio.
pub trait AdapterTransport: Send + Sync {
    /// Current power state. Polled periodically; must not block.
    fn radio_state(&self) -> RadioState;

    /// Discovery backend.
    fn scanner(&self) -> Arc<dyn ScanTransport>;

    /// Advertising backend.
    fn broadcaster(&self) -> Arc<dyn BroadcastTransport>;

    /// Backend for one remote device.
    fn device(&self, address: &DeviceAddress) -> Arc<dyn DeviceTransport>;
}

/// Discovery.
pub trait ScanTransport: Send + Sync {
    fn start(&self, filter: &ScanFilter) -> NativeResult;
    fn stop(&self) -> NativeResult;
}

/// Advertising.
pub trait BroadcastTransport: Send + Sync {
    fn start(&self, payload: &BroadcastPayload) -> NativeResult;
    fn stop(&self) -> NativeResult;
}

/// One remote device.
pub trait DeviceTransport: Send + Sync {
    fn connect(&self) -> NativeResult;
    fn disconnect(&self) -> NativeResult;
    fn explore_services(&self) -> NativeResult;
    fn read_signal_strength(&self) -> NativeResult;

    /// Backend for a discovered service.
    fn service(&self, service: &NativeService) -> Arc<dyn ServiceTransport>;
}

/// One service of a remote device.
pub trait ServiceTransport: Send + Sync {
    fn explore_characteristics(&self) -> NativeResult;

    /// Backend for a discovered characteristic.
    fn characteristic(&self, characteristic: &NativeCharacteristic)
    -> Arc<dyn CharacteristicTransport>;
}

/// One characteristic of a remote service.
pub trait CharacteristicTransport: Send + Sync {
    /// Property bits from the declaration. Called once and cached.
    fn properties(&self) -> CharacteristicProperties;

    fn read_value(&self) -> NativeResult;
    fn write_value(&self, value: &[u8]) -> NativeResult;

    /// Read the client characteristic configuration descriptor.
    fn read_listening(&self) -> NativeResult;

    /// Write the client characteristic configuration descriptor.
    fn write_listening(&self, configuration: ClientConfiguration) -> NativeResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use blelink_types::uuids::BATTERY_SERVICE;

    #[test]
    fn test_scan_filter() {
        assert!(ScanFilter::default().services.is_empty());
        let filter = ScanFilter::services([BATTERY_SERVICE]);
        assert_eq!(filter.services, vec![BATTERY_SERVICE]);
    }
}

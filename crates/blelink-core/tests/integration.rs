//! Integration tests for blelink-core.
//!
//! These tests drive the full entity tree through the mock transport: every
//! native call is answered by a scripted peripheral on a background task,
//! the same way a platform backend reports completions.

use std::sync::Arc;
use std::time::Duration;

use blelink_core::mock::{MockDriver, MockPeripheral, MockService, MockTransport, NativeCall, Response, random_address};
use blelink_core::uuids::{BATTERY_SERVICE, uuid_from_u16};
use blelink_core::{
    Adapter, BleConfig, BleEvent, CharacteristicProperties, ClientConfiguration, ConnectionGuard,
    ConnectionState, DeviceAddress, Error, EventReceiver, Explorable, ExploreOptions, NativeError,
    OperationKind, RadioState, ScanFilter, Violation,
};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);
const CONTROL_SERVICE: Uuid = uuid_from_u16(0xFFF0);
const CONTROL_POINT: Uuid = uuid_from_u16(0xFFF1);

fn sensor(address: DeviceAddress) -> MockPeripheral {
    MockPeripheral::new(address)
        .with_name("Sensor 1")
        .with_rssi(-55)
        .with_service(MockService::new(1, BATTERY_SERVICE).with_characteristic(
            3,
            BATTERY_LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            vec![87],
        ))
        .with_service(MockService::new(10, CONTROL_SERVICE).with_characteristic(
            12,
            CONTROL_POINT,
            CharacteristicProperties::WRITE,
            vec![0],
        ))
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup(peripherals: Vec<MockPeripheral>) -> (Arc<MockTransport>, Adapter, MockDriver) {
    init_tracing();
    let transport = MockTransport::new();
    let adapter = Adapter::new(transport.clone()).unwrap();
    let driver = MockDriver::spawn(&transport, &adapter, peripherals).unwrap();
    (transport, adapter, driver)
}

fn drain(events: &mut EventReceiver) -> Vec<BleEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn explore_all() -> ExploreOptions {
    ExploreOptions::new().recurse(true)
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_connect_explore_read() {
    let address = random_address();
    let (_transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    assert_eq!(device.state(), ConnectionState::Connected);

    device
        .explore_with(explore_all(), Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    assert!(device.is_explored());
    assert_eq!(device.services().len(), 2);

    let battery = device.characteristic(BATTERY_SERVICE, BATTERY_LEVEL).unwrap();
    assert_eq!(battery.read().await.unwrap(), Bytes::from_static(&[87]));
    assert_eq!(battery.value(), Some(Bytes::from_static(&[87])));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_native_call() {
    let address = random_address();
    let (transport, adapter, _driver) =
        setup(vec![sensor(address.clone()).with_latency(Duration::from_millis(200))]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    let (a, b, c) = tokio::join!(device.connect(), device.connect(), device.connect());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(transport.call_count(OperationKind::Connect), 1);
}

#[tokio::test]
async fn test_connect_if_needed_skips_native_call() {
    let address = random_address();
    let (transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    transport.clear_calls();

    device.connect_if_needed().await.unwrap();
    assert!(transport.calls().is_empty());

    let err = device.connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Precondition { violation: Violation::AlreadyConnected, .. }
    ));
}

#[tokio::test]
async fn test_native_connect_failure_reaches_caller() {
    let address = random_address();
    let peripheral = sensor(address.clone())
        .respond(OperationKind::Connect, Response::Fail(NativeError::with_status(0x3E, "refused")));
    let (_transport, adapter, _driver) = setup(vec![peripheral]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    let err = device.connect().await.unwrap_err();
    assert!(matches!(err, Error::Native { operation: OperationKind::Connect, .. }));
    assert!(!device.is_connected());
    assert!(!device.is_connecting());
}

#[tokio::test]
async fn test_sync_failure_resolves_at_once() {
    let address = random_address();
    let (transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();
    transport.fail_next(OperationKind::Connect, NativeError::new("adapter busy"));

    let device = adapter.device(&address);
    assert!(device.connect().await.is_err());
    assert!(!device.is_connecting());

    // The next attempt is a fresh operation.
    device.connect().await.unwrap();
    assert_eq!(transport.call_count(OperationKind::Connect), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_connect_success_after_timeout() {
    let address = random_address();
    let (_transport, adapter, _driver) =
        setup(vec![sensor(address.clone()).with_latency(Duration::from_secs(8))]);
    let mut failures = adapter.subscribe_failures().unwrap();

    let device = adapter.device(&address);
    let err = device
        .connect_with(Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { operation: OperationKind::Connect, .. }));
    assert!(!device.is_connected());
    assert!(!device.is_connecting());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(device.is_connected());

    let failure = failures.try_recv().unwrap();
    assert_eq!(failure.operation, OperationKind::Connect);
    assert_eq!(&failure.entity, device.key());
    assert!(matches!(failure.error, Error::UnexpectedTransition { .. }));
    assert!(failures.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_connect_leaves_device_idle() {
    let address = random_address();
    let peripheral = sensor(address.clone()).respond(OperationKind::Connect, Response::Silent);
    let (_transport, adapter, _driver) = setup(vec![peripheral]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = device
        .connect_with(Duration::from_secs(30), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(device.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_is_expected() {
    let address = random_address();
    let (_transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();
    let device = adapter.device(&address);
    device.connect().await.unwrap();

    let mut events = adapter.subscribe();
    device.disconnect().await.unwrap();
    assert!(!device.is_connected());

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        BleEvent::Disconnected { entity, expected: true } if entity == device.key()
    )));

    let err = device.disconnect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Precondition { violation: Violation::NotConnected, .. }
    ));
    device.disconnect_if_needed().await.unwrap();
}

#[tokio::test]
async fn test_link_loss_disposes_tree() {
    let address = random_address();
    let (_transport, adapter, driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device
        .explore_with(explore_all(), Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    let service = device.service(BATTERY_SERVICE).unwrap().unwrap();
    let battery = device.characteristic(BATTERY_SERVICE, BATTERY_LEVEL).unwrap();

    let mut events = adapter.subscribe();
    driver.drop_link(&address, NativeError::with_status(0x08, "supervision timeout"));

    assert!(!device.is_connected());
    assert!(!device.is_explored());
    assert!(device.services().is_empty());
    assert!(service.is_disposed());
    assert!(battery.is_disposed());
    assert!(matches!(battery.read().await, Err(Error::Disposed { .. })));

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        BleEvent::Disconnected { expected: false, .. }
    )));

    // The device itself survives and reconnects.
    device.connect().await.unwrap();
    device.explore().await.unwrap();
    assert_eq!(device.services().len(), 2);
}

#[tokio::test]
async fn test_ignored_link_loss_is_expected() {
    let address = random_address();
    let (_transport, adapter, driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device.ignore_next_unexpected_disconnect();

    let mut events = adapter.subscribe();
    driver.drop_link(&address, NativeError::new("remote reboot"));
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        BleEvent::Disconnected { expected: true, .. }
    )));
}

#[tokio::test]
async fn test_guard_disconnects_on_drop() {
    let address = random_address();
    let (_transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    {
        let guard = ConnectionGuard::connect(Arc::clone(&device)).await.unwrap();
        assert!(guard.is_connected());
    }
    device
        .wait_until_connected(false, Duration::from_secs(1), &CancellationToken::new())
        .await
        .unwrap();
}

// =============================================================================
// Exploration
// =============================================================================

#[tokio::test]
async fn test_repeated_discovery_keeps_instances() {
    let address = random_address();
    let (_transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device
        .explore_with(explore_all(), Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    let service = device.service(BATTERY_SERVICE).unwrap().unwrap();
    let battery = service.characteristic(BATTERY_LEVEL).unwrap().unwrap();
    let natives: Vec<_> = device
        .services()
        .iter()
        .map(|s| blelink_core::NativeService::new(s.handle(), s.uuid()))
        .collect();

    let mut events = adapter.subscribe();
    device.on_services_explored(Ok(natives));
    service.on_characteristics_explored(Ok(vec![blelink_core::NativeCharacteristic::new(
        3,
        BATTERY_LEVEL,
        CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
    )]));

    let again = device.service(BATTERY_SERVICE).unwrap().unwrap();
    assert!(Arc::ptr_eq(&service, &again));
    let battery_again = again.characteristic(BATTERY_LEVEL).unwrap().unwrap();
    assert!(Arc::ptr_eq(&battery, &battery_again));
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, BleEvent::CollectionChanged { .. })));
}

#[tokio::test]
async fn test_explore_is_idempotent() {
    let address = random_address();
    let (transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device.explore().await.unwrap();
    device.explore().await.unwrap();
    assert_eq!(transport.call_count(OperationKind::Explore), 1);

    device.rediscover().await.unwrap();
    // One services discovery plus one per service.
    assert_eq!(transport.call_count(OperationKind::Explore), 4);
}

#[tokio::test]
async fn test_explore_then_query() {
    let address = random_address();
    let (transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();

    let service = device
        .explore_and_get("battery service", |s| s.uuid() == BATTERY_SERVICE)
        .await
        .unwrap();
    let level = service
        .explore_and_get("battery level", |c| c.uuid() == BATTERY_LEVEL)
        .await
        .unwrap();
    assert!(level.can_read());

    let err = device
        .explore_and_get("missing service", |s| s.uuid() == CONTROL_POINT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    let err = device
        .explore_and_get("any service", |_| true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MultipleFound { count: 2, .. }));

    // Device discovery ran once, the battery service once.
    assert_eq!(transport.call_count(OperationKind::Explore), 2);
}

#[tokio::test]
async fn test_explore_requires_connection() {
    let address = random_address();
    let (transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let err = adapter.device(&address).explore().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Precondition { violation: Violation::NotConnected, .. }
    ));
    assert_eq!(transport.call_count(OperationKind::Explore), 0);
}

// =============================================================================
// Characteristic operations
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_writes_reach_radio_in_call_order() {
    let address = random_address();
    let (transport, adapter, driver) =
        setup(vec![sensor(address.clone()).with_latency(Duration::from_millis(20))]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device
        .explore_with(explore_all(), Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    let control = device.characteristic(CONTROL_SERVICE, CONTROL_POINT).unwrap();
    let mut events = adapter.subscribe();

    let (a, b, c) = tokio::join!(
        control.write(vec![1u8]),
        control.write(vec![2u8]),
        control.write(vec![3u8]),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    let written: Vec<Bytes> = transport
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            NativeCall::WriteValue { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(written, vec![Bytes::from_static(&[1]), Bytes::from_static(&[2]), Bytes::from_static(&[3])]);

    // Each write finishes before the next one starts.
    let lifecycle: Vec<bool> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            BleEvent::OperationStarted { entity, operation: OperationKind::Write } if &entity == control.key() => {
                Some(true)
            }
            BleEvent::OperationFinished { entity, operation: OperationKind::Write, .. }
                if &entity == control.key() =>
            {
                Some(false)
            }
            _ => None,
        })
        .collect();
    assert_eq!(lifecycle, vec![true, false, true, false, true, false]);
    assert_eq!(driver.value(&address, CONTROL_POINT), Some(Bytes::from_static(&[3])));
    assert_eq!(control.value(), Some(Bytes::from_static(&[3])));
}

#[tokio::test(start_paused = true)]
async fn test_write_after_timed_out_write_waits_for_its_completion() {
    let address = random_address();
    let (transport, adapter, driver) =
        setup(vec![sensor(address.clone()).with_latency(Duration::from_millis(300))]);
    let mut failures = adapter.subscribe_failures().unwrap();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device
        .explore_with(explore_all(), Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    let control = device.characteristic(CONTROL_SERVICE, CONTROL_POINT).unwrap();
    let mut events = adapter.subscribe();

    let err = control
        .write_with(vec![1u8], Duration::from_millis(100), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { operation: OperationKind::Write, .. }));
    control.write(vec![2u8]).await.unwrap();

    assert_eq!(transport.call_count(OperationKind::Write), 2);
    assert_eq!(driver.value(&address, CONTROL_POINT), Some(Bytes::from_static(&[2])));
    assert_eq!(control.value(), Some(Bytes::from_static(&[2])));
    assert!(failures.try_recv().is_err());

    // The first write lands before the second one is issued.
    let order: Vec<&str> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            BleEvent::ValueChanged { entity, .. } if &entity == control.key() => Some("landed"),
            BleEvent::OperationStarted { entity, operation: OperationKind::Write } if &entity == control.key() => {
                Some("issued")
            }
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["issued", "landed", "issued", "landed"]);
}

#[tokio::test]
async fn test_write_if_needed_skips_unchanged_value() {
    let address = random_address();
    let (transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device
        .explore_with(explore_all(), Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    let control = device.characteristic(CONTROL_SERVICE, CONTROL_POINT).unwrap();

    control.write_if_needed(vec![5u8]).await.unwrap();
    control.write_if_needed(vec![5u8]).await.unwrap();
    assert_eq!(transport.call_count(OperationKind::Write), 1);
}

#[tokio::test]
async fn test_unsupported_operations() {
    let address = random_address();
    let (transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device
        .explore_with(explore_all(), Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    let battery = device.characteristic(BATTERY_SERVICE, BATTERY_LEVEL).unwrap();
    let control = device.characteristic(CONTROL_SERVICE, CONTROL_POINT).unwrap();

    assert!(matches!(battery.write(vec![1u8]).await, Err(Error::Unsupported { .. })));
    assert!(matches!(control.read().await, Err(Error::Unsupported { .. })));
    assert!(matches!(control.start_listening().await, Err(Error::Unsupported { .. })));
    assert_eq!(transport.call_count(OperationKind::Write), 0);
    assert_eq!(transport.call_count(OperationKind::Read), 0);
}

#[tokio::test]
async fn test_listen_toggle_and_notifications() {
    let address = random_address();
    let (transport, adapter, driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device
        .explore_with(explore_all(), Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    let battery = device.characteristic(BATTERY_SERVICE, BATTERY_LEVEL).unwrap();

    battery.start_listening().await.unwrap();
    assert!(battery.is_listening());
    assert_eq!(
        driver.configuration(&address, BATTERY_LEVEL),
        Some(ClientConfiguration::Notify)
    );
    // Read, write, read back.
    assert_eq!(transport.call_count(OperationKind::ReadListening), 2);
    assert_eq!(transport.call_count(OperationKind::WriteListening), 1);

    // Already listening: nothing goes to the radio.
    transport.clear_calls();
    battery.start_listening().await.unwrap();
    assert!(transport.calls().is_empty());

    let cancel = CancellationToken::new();
    let wait = battery.wait_for_value_change(
        |value| value.first() == Some(&50),
        Duration::from_secs(1),
        &cancel,
    );
    let notify = async {
        tokio::task::yield_now().await;
        assert!(driver.notify(&address, BATTERY_LEVEL, vec![60u8]));
        assert!(driver.notify(&address, BATTERY_LEVEL, vec![50u8]));
    };
    let (value, ()) = tokio::join!(wait, notify);
    assert_eq!(value.unwrap(), Bytes::from_static(&[50]));
    assert_eq!(battery.value(), Some(Bytes::from_static(&[50])));

    battery.stop_listening().await.unwrap();
    assert!(!battery.is_listening());
    assert!(!driver.notify(&address, BATTERY_LEVEL, vec![40u8]));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_value_change_times_out() {
    let address = random_address();
    let (_transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    device.connect().await.unwrap();
    device
        .explore_with(explore_all(), Duration::from_secs(5), &CancellationToken::new())
        .await
        .unwrap();
    let battery = device.characteristic(BATTERY_SERVICE, BATTERY_LEVEL).unwrap();

    let err = battery
        .wait_for_value_change(|_| true, Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { operation: OperationKind::Wait, .. }));
}

#[tokio::test]
async fn test_signal_strength_read() {
    let address = random_address();
    let (_transport, adapter, _driver) = setup(vec![sensor(address.clone()).with_rssi(-70)]);
    let _failures = adapter.subscribe_failures();

    let device = adapter.device(&address);
    let err = device.read_signal_strength().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Precondition { violation: Violation::NotConnected, .. }
    ));

    device.connect().await.unwrap();
    let signal = device.read_signal_strength().await.unwrap();
    assert_eq!(signal.rssi, -70);
    assert!((0.0..=100.0).contains(&signal.percent));
    assert_eq!(device.signal(), Some(signal));
}

// =============================================================================
// Scanner and radio
// =============================================================================

#[tokio::test]
async fn test_scan_discovers_peripherals() {
    let first = random_address();
    let second = random_address();
    let (_transport, adapter, _driver) = setup(vec![
        sensor(first.clone()),
        MockPeripheral::new(second.clone()).with_name("Beacon"),
    ]);
    let _failures = adapter.subscribe_failures();
    let scanner = adapter.scanner();

    scanner.start(ScanFilter::default()).await.unwrap();
    assert!(scanner.is_running());
    assert_eq!(scanner.devices().len(), 2);

    let device = adapter.device(&first);
    assert_eq!(device.name().as_deref(), Some("Sensor 1"));
    assert!(device.last_advertisement().is_some());
    assert!(device.signal().is_some());

    scanner.stop().await.unwrap();
    assert!(!scanner.is_running());
}

#[tokio::test]
async fn test_scan_filter_drops_other_devices() {
    let first = random_address();
    let second = random_address();
    let (_transport, adapter, _driver) = setup(vec![
        sensor(first.clone()),
        MockPeripheral::new(second.clone()),
    ]);
    let _failures = adapter.subscribe_failures();
    let scanner = adapter.scanner();

    scanner
        .start(ScanFilter {
            services: vec![BATTERY_SERVICE],
        })
        .await
        .unwrap();
    let devices = scanner.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address(), &first);
}

#[tokio::test]
async fn test_prune_keeps_connected_devices() {
    let first = random_address();
    let second = random_address();
    let (_transport, adapter, _driver) = setup(vec![
        sensor(first.clone()),
        sensor(second.clone()),
    ]);
    let _failures = adapter.subscribe_failures();
    let scanner = adapter.scanner();
    scanner.start(ScanFilter::default()).await.unwrap();

    let connected = adapter.device(&first);
    connected.connect().await.unwrap();
    let stale = adapter.device(&second);

    let removed = scanner.prune_older_than(Duration::ZERO);
    assert_eq!(removed.len(), 1);
    assert!(Arc::ptr_eq(&removed[0], &stale));
    assert!(stale.is_disposed());
    assert_eq!(scanner.devices().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scan_waits_for_radio() {
    let transport = MockTransport::new();
    transport.set_radio_state(RadioState::PoweredOff);
    let adapter = Adapter::new(transport.clone()).unwrap();
    let _driver = MockDriver::spawn(&transport, &adapter, Vec::new()).unwrap();
    let _failures = adapter.subscribe_failures();
    assert_eq!(adapter.radio_state(), RadioState::PoweredOff);

    let err = adapter
        .scanner()
        .start(ScanFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Precondition { violation: Violation::RadioOff, .. }
    ));

    let radio = transport.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        radio.set_radio_state(RadioState::PoweredOn);
    });
    adapter.scanner().start(ScanFilter::default()).await.unwrap();
    assert!(adapter.radio_state().is_powered_on());
}

#[tokio::test]
async fn test_connect_with_radio_off() {
    let transport = MockTransport::new();
    transport.set_radio_state(RadioState::PoweredOff);
    let adapter = Adapter::new(transport.clone()).unwrap();
    let _failures = adapter.subscribe_failures();

    let err = adapter.device(&random_address()).connect().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Precondition { violation: Violation::RadioOff, .. }
    ));
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn test_shutdown_disposes_devices() {
    let address = random_address();
    let (_transport, adapter, _driver) = setup(vec![sensor(address.clone())]);
    let _failures = adapter.subscribe_failures();
    let device = adapter.device(&address);
    device.connect().await.unwrap();

    adapter.shutdown().await;
    assert!(device.is_disposed());
    assert!(matches!(device.disconnect().await, Err(Error::Disposed { .. })));
}

// =============================================================================
// Configuration and events
// =============================================================================

#[tokio::test]
async fn test_builder_uses_config_timeouts() {
    let config = BleConfig::from_toml_str(
        r#"
        [timeouts]
        connect_ms = 250
        "#,
    )
    .unwrap();
    let transport = MockTransport::new();
    let adapter = Adapter::builder(transport.clone()).config(config).build().unwrap();
    assert_eq!(adapter.config().timeout(OperationKind::Connect), Duration::from_millis(250));
}

#[test]
fn test_builder_rejects_invalid_config() {
    let mut config = BleConfig::default();
    config.channels.events = 0;
    let result = Adapter::builder(MockTransport::new()).config(config).build();
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[test]
fn test_event_json_shape() {
    let address = random_address();
    let event = BleEvent::Disconnected {
        entity: blelink_core::EntityKey::device(&address),
        expected: false,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "disconnected");
    assert_eq!(json["expected"], false);

    let back: BleEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back, event);
}

//! End-to-end lifecycle scenarios over the fake adapter.

use std::sync::Arc;
use std::time::Duration;

use health_thermometer_ble::adapter::{Advertisement, ConnectBehavior};
use health_thermometer_ble::ble::uuids::{
    HEALTH_THERMOMETER_SERVICE_UUID, INTERMEDIATE_TEMPERATURE_UUID, TEMPERATURE_TYPE_UUID,
};
use health_thermometer_ble::{
    CentralConfig, ConnectionPhase, DeviceManager, Error, FailureReason, FakeAdapter,
    FakePeripheral, GrantedPermissions, PeripheralId, RadioState, ScanEvent,
    INTERMEDIATE_TEMPERATURE, TEMPERATURE_TYPE,
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

fn manager(fake: &FakeAdapter) -> Arc<DeviceManager> {
    Arc::new(
        DeviceManager::with_adapter(
            Arc::new(fake.clone()),
            Arc::new(GrantedPermissions),
            CentralConfig::default(),
        )
        .unwrap(),
    )
}

fn shine2() -> FakePeripheral {
    FakePeripheral::health_thermometer("A", Some("Shine2"))
        .with_value(TEMPERATURE_TYPE_UUID, b"2".to_vec())
        .with_value(INTERMEDIATE_TEMPERATURE_UUID, "36.6".as_bytes().to_vec())
}

fn phases(rx: &mut broadcast::Receiver<health_thermometer_ble::ConnectionEvent>) -> Vec<ConnectionPhase> {
    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        phases.push(event.phase);
    }
    phases
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn anonymous_peripherals_never_surface() {
    let fake = FakeAdapter::new();
    let manager = manager(&fake);
    let mut events = manager.subscribe_sightings();
    manager.start_scanning().await.unwrap();

    fake.advertise(Advertisement {
        id: "B".into(),
        name: None,
        local_name: None,
        rssi: Some(-50),
        services: vec![HEALTH_THERMOMETER_SERVICE_UUID],
    });
    fake.advertise(shine2().advertisement());

    match events.recv().await.unwrap() {
        ScanEvent::Sighting(sighting) => {
            assert_eq!(sighting.id, PeripheralId::from("A"));
            assert_eq!(sighting.display_name, "Shine2");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let sightings = manager.sightings();
    assert_eq!(sightings.len(), 1);
    assert!(sightings.contains_key(&PeripheralId::from("A")));
}

#[tokio::test(start_paused = true)]
async fn repeat_advertisements_are_coalesced_until_window_elapses() {
    let fake = FakeAdapter::new();
    let manager = manager(&fake);
    let mut events = manager.subscribe_sightings();
    manager.start_scanning().await.unwrap();

    let mut advertisement = shine2().advertisement();
    fake.advertise(advertisement.clone());
    assert!(matches!(events.recv().await.unwrap(), ScanEvent::Sighting(_)));

    tokio::time::advance(Duration::from_millis(4_000)).await;
    advertisement.rssi = Some(-30);
    fake.advertise(advertisement.clone());
    settle().await;
    assert!(events.try_recv().is_err());
    // Payload is updated in place.
    assert_eq!(manager.sightings()[&PeripheralId::from("A")].rssi, Some(-30));

    tokio::time::advance(Duration::from_millis(1_000)).await;
    advertisement.rssi = Some(-35);
    fake.advertise(advertisement);
    match events.recv().await.unwrap() {
        ScanEvent::Sighting(sighting) => assert_eq!(sighting.rssi, Some(-35)),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn connect_reaches_ready_and_reads_temperature_type() {
    let fake = FakeAdapter::new();
    fake.add_peripheral(shine2());
    let manager = manager(&fake);
    let mut events = manager.subscribe_connection_events();

    let session = manager.connect(&"A".into()).await.unwrap();
    assert_eq!(
        phases(&mut events),
        vec![
            ConnectionPhase::Connecting,
            ConnectionPhase::Discovering,
            ConnectionPhase::Ready
        ]
    );

    let value = session.read(TEMPERATURE_TYPE).await.unwrap();
    assert_eq!(value.as_text(), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn connect_times_out_after_ten_seconds() {
    let fake = FakeAdapter::new();
    fake.add_peripheral(shine2().with_connect(ConnectBehavior::Hang));
    let manager = manager(&fake);
    let mut events = manager.subscribe_connection_events();

    let started = tokio::time::Instant::now();
    let error = manager.connect(&"A".into()).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));

    match error {
        Error::Timeout { operation, .. } => assert_eq!(operation, "connect"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(
        phases(&mut events),
        vec![
            ConnectionPhase::Connecting,
            ConnectionPhase::Failed(FailureReason::Timeout)
        ]
    );
    assert!(manager.connection().is_none());
}

#[tokio::test]
async fn unsolicited_disconnect_terminates_subscriptions() {
    let fake = FakeAdapter::new();
    fake.add_peripheral(shine2());
    let manager = manager(&fake);

    let session = manager.connect(&"A".into()).await.unwrap();
    let mut first = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
    let mut second = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
    assert_eq!(first.recv().await.unwrap().unwrap().as_text(), Some("36.6"));
    assert_eq!(second.recv().await.unwrap().unwrap().as_text(), Some("36.6"));

    fake.push_disconnect(&"A".into());

    for rx in [&mut first, &mut second] {
        let item = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(item, Some(Err(Error::Disconnected))));
        assert!(rx.recv().await.is_none());
    }

    assert!(matches!(
        session.read(TEMPERATURE_TYPE).await,
        Err(Error::Disconnected)
    ));
    assert!(manager.connection().is_none());
    assert!(!manager.is_device_connected().await);

    // Recoverable by connecting again.
    let session = manager.connect(&"A".into()).await.unwrap();
    assert!(session.is_live());
}

#[tokio::test]
async fn concurrent_connect_fails_fast_without_disturbing_first() {
    let fake = FakeAdapter::new();
    fake.add_peripheral(shine2());
    let manager = manager(&fake);

    let session = manager.connect(&"A".into()).await.unwrap();
    let error = manager.connect(&"A".into()).await.unwrap_err();
    assert!(matches!(error, Error::AlreadyConnecting { .. }));

    assert!(session.is_live());
    assert_eq!(
        manager.connection().unwrap().phase,
        ConnectionPhase::Ready
    );
}

#[tokio::test]
async fn subscribe_replays_last_value_before_new_notifications() {
    let fake = FakeAdapter::new();
    fake.add_peripheral(shine2());
    let manager = manager(&fake);
    let session = manager.connect(&"A".into()).await.unwrap();
    let id = PeripheralId::from("A");

    let mut early = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
    assert_eq!(early.recv().await.unwrap().unwrap().as_text(), Some("36.6"));

    fake.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, "37.1".as_bytes().to_vec());
    assert_eq!(early.recv().await.unwrap().unwrap().as_text(), Some("37.1"));

    let mut late = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
    fake.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, "37.2".as_bytes().to_vec());

    assert_eq!(late.recv().await.unwrap().unwrap().as_text(), Some("37.1"));
    assert_eq!(late.recv().await.unwrap().unwrap().as_text(), Some("37.2"));
    assert_eq!(early.recv().await.unwrap().unwrap().as_text(), Some("37.2"));
}

#[tokio::test]
async fn sibling_operation_failure_does_not_affect_connection() {
    let fake = FakeAdapter::new();
    fake.add_peripheral(shine2());
    let manager = manager(&fake);
    let session = manager.connect(&"A".into()).await.unwrap();

    fake.fail_reads(
        TEMPERATURE_TYPE_UUID,
        Error::InvalidData {
            context: "GATT read not permitted".to_string(),
        },
    );
    assert!(session.read(TEMPERATURE_TYPE).await.is_err());

    let mut rx = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
    assert_eq!(rx.recv().await.unwrap().unwrap().as_text(), Some("36.6"));
    assert_eq!(
        manager.connection().unwrap().phase,
        ConnectionPhase::Ready
    );
}

#[tokio::test]
async fn radio_power_off_ends_ready_connection() {
    let fake = FakeAdapter::new();
    fake.add_peripheral(shine2());
    let manager = manager(&fake);
    let mut events = manager.subscribe_connection_events();

    let session = manager.connect(&"A".into()).await.unwrap();
    let mut readings = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
    assert_eq!(readings.recv().await.unwrap().unwrap().as_text(), Some("36.6"));
    phases(&mut events);

    fake.set_radio_state(RadioState::PoweredOff);
    settle().await;

    let item = tokio::time::timeout(Duration::from_secs(1), readings.recv())
        .await
        .unwrap();
    assert!(matches!(item, Some(Err(Error::Disconnected))));
    assert!(!session.is_live());
    assert!(manager.connection().is_none());
    assert_eq!(phases(&mut events), vec![ConnectionPhase::Disconnected]);

    // Usable again once the radio is back.
    fake.set_radio_state(RadioState::PoweredOn);
    let session = manager.connect(&"A".into()).await.unwrap();
    assert!(session.is_live());
}

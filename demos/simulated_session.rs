//! Walk through the full lifecycle against a simulated thermometer
//!
//! Run with: cargo run --example simulated_session
//!
//! No Bluetooth hardware is needed; a `FakeAdapter` plays the peripheral.

use health_thermometer_ble::adapter::Advertisement;
use health_thermometer_ble::ble::uuids::{
    HEALTH_THERMOMETER_SERVICE_UUID, INTERMEDIATE_TEMPERATURE_UUID, SERIAL_NUMBER_UUID,
    TEMPERATURE_TYPE_UUID,
};
use health_thermometer_ble::{
    CentralConfig, DeviceManager, FakeAdapter, FakePeripheral, GrantedPermissions, Result,
    ScanEvent, INTERMEDIATE_TEMPERATURE, SERIAL_NUMBER, TEMPERATURE_TYPE,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("health_thermometer_ble=info".parse().unwrap()),
        )
        .init();

    let fake = FakeAdapter::new();
    let thermometer = FakePeripheral::health_thermometer("SIM-0001", Some("Shine2"))
        .with_value(TEMPERATURE_TYPE_UUID, b"2".to_vec())
        .with_value(SERIAL_NUMBER_UUID, b"SN-4242".to_vec())
        .with_value(INTERMEDIATE_TEMPERATURE_UUID, b"36.4".to_vec());
    let id = thermometer.id.clone();
    fake.add_peripheral(thermometer);

    let manager = DeviceManager::with_adapter(
        Arc::new(fake.clone()),
        Arc::new(GrantedPermissions),
        CentralConfig::default(),
    )?;

    println!("Scanning...");
    let mut events = manager.subscribe_sightings();
    manager.start_scanning().await?;

    // An anonymous peripheral is ignored; the named one is reported once.
    fake.advertise(Advertisement {
        id: "SIM-ANON".into(),
        name: None,
        local_name: None,
        rssi: Some(-40),
        services: vec![HEALTH_THERMOMETER_SERVICE_UUID],
    });
    fake.advertise_peripheral(&id);
    fake.advertise_peripheral(&id);

    if let Ok(ScanEvent::Sighting(sighting)) = events.recv().await {
        println!("Sighted {} ({})", sighting.display_name, sighting.id);
    }

    let session = manager.connect(&id).await?;
    println!("Connection: {:?}", manager.connection().map(|c| c.phase));
    println!("Serial number: {}", session.read(SERIAL_NUMBER).await?);
    println!("Temperature type: {}", session.read(TEMPERATURE_TYPE).await?);

    let mut readings = session.subscribe(INTERMEDIATE_TEMPERATURE).await?;
    let feeder = tokio::spawn({
        let fake = fake.clone();
        let id = id.clone();
        async move {
            for reading in ["36.5", "36.7", "36.9"] {
                tokio::time::sleep(Duration::from_millis(200)).await;
                fake.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, reading.as_bytes().to_vec());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            println!("Peripheral powered off");
            fake.push_disconnect(&id);
        }
    });

    while let Some(item) = readings.recv().await {
        match item {
            Ok(value) => println!("Intermediate temperature: {}", value),
            Err(e) => println!("Subscription ended: {}", e),
        }
    }

    let _ = feeder.await;
    println!(
        "Read after disconnect: {}",
        session
            .read(TEMPERATURE_TYPE)
            .await
            .map(|v| v.to_string())
            .unwrap_or_else(|e| e.to_string())
    );

    manager.shutdown().await?;
    Ok(())
}

//! Real-time temperature monitoring example
//!
//! Run with: cargo run --example temperature_monitor

use futures::StreamExt;
use health_thermometer_ble::{
    DeviceManager, Error, Result, INTERMEDIATE_TEMPERATURE, SERIAL_NUMBER, TEMPERATURE_TYPE,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (minimal)
    tracing_subscriber::fmt().with_env_filter("warn").init();

    println!("Temperature Monitor");
    println!("==================\n");
    println!("Looking for thermometers...\n");

    let manager = DeviceManager::new().await?;
    manager.start_scanning().await?;

    // Wait for a thermometer to be discovered
    tokio::time::sleep(Duration::from_secs(5)).await;

    let nearest = manager
        .sightings_by_signal()
        .into_iter()
        .next()
        .ok_or_else(|| Error::PeripheralNotFound {
            identifier: "any".to_string(),
        })?;

    println!("Found thermometer: {} ({})", nearest.display_name, nearest.id);
    println!("Connecting...\n");

    let session = manager.connect(&nearest.id).await?;

    match session.read(SERIAL_NUMBER).await {
        Ok(serial) => println!("Serial number: {}", serial),
        Err(e) => println!("Serial number unavailable: {}", e),
    }
    match session.read(TEMPERATURE_TYPE).await {
        Ok(kind) => println!("Temperature type: {}", kind),
        Err(e) => println!("Temperature type unavailable: {}", e),
    }
    if let Ok(interval) = session.read_measurement_interval().await {
        println!("Measurement interval: {:?}", interval);
    }

    println!("\nConnected! Monitoring temperatures...");
    println!("Press Ctrl+C to exit.\n");

    let mut readings = session.subscribe(INTERMEDIATE_TEMPERATURE).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nExiting...");
                break;
            }
            item = readings.next() => match item {
                Some(Ok(value)) => println!("Intermediate temperature: {}", value),
                Some(Err(Error::DecodeFailure { reason, .. })) => {
                    println!("Discarded malformed reading: {}", reason);
                }
                Some(Err(e)) => {
                    println!("Monitoring ended: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    manager.shutdown().await?;

    Ok(())
}

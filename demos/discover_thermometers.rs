//! Basic example: Discover all nearby Health Thermometers
//!
//! Run with: cargo run --example discover_thermometers

use health_thermometer_ble::{DeviceManager, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("health_thermometer_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Starting Health Thermometer discovery...\n");

    let manager = DeviceManager::new().await?;

    // Register callback for sightings
    let _handle = manager.on_sighting(|sighting| match sighting {
        Ok(sighting) => {
            println!("\nSighted thermometer:");
            println!("  Name: {}", sighting.display_name);
            println!("  ID: {}", sighting.id);
            println!("  RSSI: {:?} dBm", sighting.rssi);
            println!("  Seen at: {}", sighting.last_seen_at.format("%H:%M:%S"));
        }
        Err(e) => println!("\nScan failed: {}", e),
    });

    println!("Waiting for Bluetooth (status: {:?})...", manager.gate_status());
    manager.start_scanning().await?;

    println!("Scanning for 30 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    println!("\n--- Scan Complete ---");
    let sightings = manager.sightings_by_signal();
    println!("Total thermometers found: {}", sightings.len());

    for sighting in sightings {
        println!(
            "  {} - {} (RSSI: {:?})",
            sighting.display_name, sighting.id, sighting.rssi
        );
    }

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}

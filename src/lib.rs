// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # health-thermometer-ble
//!
//! A cross-platform Rust library for discovering and talking to Bluetooth
//! Low Energy thermometers that implement the Health Thermometer service
//! (`1809`).
//!
//! ## Features
//!
//! - **Permission Gate**: Waits for the radio to be powered on and drives
//!   permission and radio-enable remediation
//! - **Discovery**: Filtered scanning with per-peripheral dedup and a 5 second
//!   refresh window; anonymous peripherals are dropped
//! - **Connection Lifecycle**: One connection at a time through connect,
//!   discovery and ready, with bounded timeouts and cancellation
//! - **Characteristic Sessions**: Read, write and subscribe by characteristic
//!   name; late subscribers receive the last known value first
//! - **Testability**: Every platform call goes through
//!   [`BleAdapter`](adapter::BleAdapter); [`FakeAdapter`] scripts it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use health_thermometer_ble::{DeviceManager, Result, TEMPERATURE_TYPE};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::new().await?;
//!     manager.start_scanning().await?;
//!
//!     // Wait for thermometers to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(sighting) = manager.sightings_by_signal().into_iter().next() {
//!         println!("Connecting to {} ({})", sighting.display_name, sighting.id);
//!
//!         let session = manager.connect(&sighting.id).await?;
//!         let kind = session.read(TEMPERATURE_TYPE).await?;
//!         println!("  Temperature type: {}", kind);
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod adapter;
pub mod ble;
pub mod config;
pub mod data;
pub mod device_manager;
pub mod error;
pub mod global;
pub mod handle;
pub mod protocol;
pub mod utils;

// Re-exports for convenience
pub use adapter::{BleAdapter, FakeAdapter, FakePeripheral, NativeAdapter, PeripheralId, RadioState};
pub use config::CentralConfig;
pub use device_manager::DeviceManager;
pub use error::{Error, Result};
pub use handle::SubscriptionHandle;
pub use utils::{celsius_to_fahrenheit, fahrenheit_to_celsius};

// Re-export commonly used types from submodules
pub use ble::characteristics::{
    INTERMEDIATE_TEMPERATURE, MEASUREMENT_INTERVAL, SERIAL_NUMBER, TEMPERATURE_MEASUREMENT,
    TEMPERATURE_TYPE,
};
pub use ble::{
    CharacteristicSession, Connection, ConnectionEvent, ConnectionPhase, FailureReason,
    GateStatus, GrantedPermissions, PermissionPlatform, ReplayReceiver, ScanEvent,
};
pub use data::{PeripheralSighting, TemperatureMeasurement, TemperatureType, TemperatureUnit};
pub use protocol::{CharacteristicValue, Charset, EncodedValue};

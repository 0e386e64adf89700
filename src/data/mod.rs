//! Data structures for thermometer data.
//!
//! This module contains the value types surfaced to callers: peripheral
//! sightings from discovery and parsed temperature measurements.

pub mod measurement;
pub mod sighting;

pub use measurement::{
    encode_measurement_interval, parse_measurement_interval, TemperatureMeasurement,
    TemperatureType, TemperatureUnit,
};
pub use sighting::PeripheralSighting;

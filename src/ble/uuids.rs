//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants used for Health Thermometer communication.

use uuid::Uuid;

/// Bluetooth SIG base UUID with the 16-bit slot zeroed.
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

// Health Thermometer Service (Standard BLE)
/// Health Thermometer Service UUID (`1809`).
pub const HEALTH_THERMOMETER_SERVICE_UUID: Uuid = from_short(0x1809);
/// Temperature Measurement characteristic UUID (`2A1C`).
pub const TEMPERATURE_MEASUREMENT_UUID: Uuid = from_short(0x2A1C);
/// Temperature Type characteristic UUID (`2A1D`).
pub const TEMPERATURE_TYPE_UUID: Uuid = from_short(0x2A1D);
/// Intermediate Temperature characteristic UUID (`2A1E`).
pub const INTERMEDIATE_TEMPERATURE_UUID: Uuid = from_short(0x2A1E);
/// Measurement Interval characteristic UUID (`2A21`).
pub const MEASUREMENT_INTERVAL_UUID: Uuid = from_short(0x2A21);

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID (`180A`).
pub const DEVICE_INFO_SERVICE_UUID: Uuid = from_short(0x180A);
/// Serial Number characteristic UUID (`2A25`).
pub const SERIAL_NUMBER_UUID: Uuid = from_short(0x2A25);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let service = HEALTH_THERMOMETER_SERVICE_UUID.to_string();
        assert_eq!(service, "00001809-0000-1000-8000-00805f9b34fb");
        assert_eq!(
            SERIAL_NUMBER_UUID.to_string(),
            "00002a25-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_short_form_expansion() {
        assert_eq!(
            from_short(0x2A1E),
            Uuid::from_u128(0x0000_2a1e_0000_1000_8000_00805f9b34fb)
        );
    }
}

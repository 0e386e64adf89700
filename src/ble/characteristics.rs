//! GATT characteristic table.
//!
//! Maps the logical characteristic names used by callers to their service
//! and characteristic UUIDs, the operations each supports and how its
//! payload is decoded.

use uuid::Uuid;

use crate::ble::uuids::*;
use crate::error::{Error, Result};
use crate::protocol::{CharacteristicValue, Charset, EncodedValue, Representation};

/// Logical name of the Intermediate Temperature characteristic.
pub const INTERMEDIATE_TEMPERATURE: &str = "intermediateTemperature";
/// Logical name of the Temperature Measurement characteristic.
pub const TEMPERATURE_MEASUREMENT: &str = "temperatureMeasurement";
/// Logical name of the Temperature Type characteristic.
pub const TEMPERATURE_TYPE: &str = "temperatureType";
/// Logical name of the Measurement Interval characteristic.
pub const MEASUREMENT_INTERVAL: &str = "temperatureInterval";
/// Logical name of the Serial Number characteristic.
pub const SERIAL_NUMBER: &str = "serialNumber";

/// An operation against a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read the current value.
    Read,
    /// Write with response.
    Write,
    /// Subscribe to notifications.
    Notify,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Notify => write!(f, "notify"),
        }
    }
}

/// The set of operations a characteristic supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Operations {
    read: bool,
    write: bool,
    notify: bool,
}

impl Operations {
    /// Build an operation set.
    pub const fn new(read: bool, write: bool, notify: bool) -> Self {
        Self {
            read,
            write,
            notify,
        }
    }

    /// Whether `operation` is in the set.
    pub fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::Read => self.read,
            Operation::Write => self.write,
            Operation::Notify => self.notify,
        }
    }
}

/// Static description of a known characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    /// Logical name used by callers.
    pub name: &'static str,
    /// Owning service.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supported operations.
    pub operations: Operations,
    /// How payloads are presented.
    pub representation: Representation,
}

impl CharacteristicDescriptor {
    /// Whether the characteristic supports `operation`.
    pub fn supports(&self, operation: Operation) -> bool {
        self.operations.supports(operation)
    }

    /// Decode a wire payload for this characteristic.
    pub fn decode(&self, encoded: &EncodedValue) -> Result<CharacteristicValue> {
        CharacteristicValue::decode(encoded, self.representation).map_err(|reason| {
            Error::DecodeFailure {
                characteristic: self.name.to_string(),
                reason,
            }
        })
    }
}

/// The known characteristics.
pub static CHARACTERISTICS: [CharacteristicDescriptor; 5] = [
    CharacteristicDescriptor {
        name: INTERMEDIATE_TEMPERATURE,
        service: HEALTH_THERMOMETER_SERVICE_UUID,
        uuid: INTERMEDIATE_TEMPERATURE_UUID,
        operations: Operations::new(true, true, true),
        representation: Representation::Text(Charset::Utf8),
    },
    CharacteristicDescriptor {
        name: TEMPERATURE_MEASUREMENT,
        service: HEALTH_THERMOMETER_SERVICE_UUID,
        uuid: TEMPERATURE_MEASUREMENT_UUID,
        operations: Operations::new(true, false, true),
        representation: Representation::Text(Charset::Ascii),
    },
    CharacteristicDescriptor {
        name: TEMPERATURE_TYPE,
        service: HEALTH_THERMOMETER_SERVICE_UUID,
        uuid: TEMPERATURE_TYPE_UUID,
        operations: Operations::new(true, false, false),
        representation: Representation::Text(Charset::Ascii),
    },
    CharacteristicDescriptor {
        name: MEASUREMENT_INTERVAL,
        service: HEALTH_THERMOMETER_SERVICE_UUID,
        uuid: MEASUREMENT_INTERVAL_UUID,
        operations: Operations::new(true, true, false),
        representation: Representation::Text(Charset::Ascii),
    },
    CharacteristicDescriptor {
        name: SERIAL_NUMBER,
        service: DEVICE_INFO_SERVICE_UUID,
        uuid: SERIAL_NUMBER_UUID,
        operations: Operations::new(true, false, false),
        representation: Representation::Text(Charset::Utf8),
    },
];

/// Look up a characteristic by logical name.
pub fn descriptor(name: &str) -> Option<&'static CharacteristicDescriptor> {
    CHARACTERISTICS.iter().find(|d| d.name == name)
}

/// Characteristics that support notifications.
pub fn notifiable() -> impl Iterator<Item = &'static CharacteristicDescriptor> {
    CHARACTERISTICS
        .iter()
        .filter(|d| d.supports(Operation::Notify))
}

//! Error types for the health-thermometer-ble crate.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::adapter::PeripheralId;
use crate::ble::characteristics::Operation;

/// The main error type for this crate.
///
/// Errors are `Clone` so that a terminal error can be delivered to every
/// subscriber of a notification stream.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(Arc<btleplug::Error>),

    /// The platform has not granted the permissions BLE requires.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The platform does not support Bluetooth Low Energy at all.
    #[error("Bluetooth radio unavailable on this device")]
    RadioUnavailable,

    /// A bounded operation did not complete in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// A connection attempt is already in progress or established.
    #[error("Connection to {peripheral} already in progress")]
    AlreadyConnecting {
        /// The peripheral that currently holds the connection slot.
        peripheral: PeripheralId,
    },

    /// The characteristic does not support the requested operation, or the
    /// peripheral does not expose it.
    #[error("Characteristic {characteristic} does not support {operation}")]
    NotSupported {
        /// Logical name of the characteristic.
        characteristic: String,
        /// The rejected operation.
        operation: Operation,
    },

    /// The owning connection is no longer ready.
    #[error("Peripheral disconnected")]
    Disconnected,

    /// A payload could not be decoded.
    #[error("Failed to decode {characteristic}: {reason}")]
    DecodeFailure {
        /// Logical name of the characteristic.
        characteristic: String,
        /// What was wrong with the payload.
        reason: String,
    },

    /// The adapter holds a connection this crate has no record of and it
    /// could not be resolved.
    #[error("Peripheral {peripheral} is connected at the adapter without a local connection record")]
    InconsistentState {
        /// The peripheral in question.
        peripheral: PeripheralId,
    },

    /// The adapter reports the peripheral is already connected.
    #[error("Peripheral {peripheral} is already connected")]
    DeviceAlreadyConnected {
        /// The peripheral in question.
        peripheral: PeripheralId,
    },

    /// A pending connection attempt was cancelled by a disconnect request.
    #[error("Connection attempt to {peripheral} was cancelled")]
    ConnectionCancelled {
        /// The peripheral whose attempt was cancelled.
        peripheral: PeripheralId,
    },

    /// Failed to establish a connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Service and characteristic discovery failed.
    #[error("Service discovery failed: {reason}")]
    DiscoveryFailed {
        /// Description of why discovery failed.
        reason: String,
    },

    /// The adapter reported a scan error.
    #[error("Scan failed: {reason}")]
    ScanFailed {
        /// Description of the scan failure.
        reason: String,
    },

    /// The specified peripheral was not found.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// No characteristic with this logical name exists in the table.
    #[error("Unknown characteristic: {name}")]
    UnknownCharacteristic {
        /// The name that was looked up.
        name: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Invalid data was received from the peripheral.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<btleplug::Error> for Error {
    fn from(error: btleplug::Error) -> Self {
        Error::Bluetooth(Arc::new(error))
    }
}

impl Error {
    /// Whether the caller may reasonably retry the failed operation as is.
    ///
    /// Permission, radio and programming errors need an external change
    /// first and are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Disconnected
                | Self::ConnectionCancelled { .. }
                | Self::ConnectionFailed { .. }
                | Self::DiscoveryFailed { .. }
                | Self::ScanFailed { .. }
                | Self::Bluetooth(_)
        )
    }

    /// Whether the error can only be cleared by the user or the platform.
    pub fn requires_remediation(&self) -> bool {
        matches!(self, Self::PermissionDenied | Self::RadioUnavailable)
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

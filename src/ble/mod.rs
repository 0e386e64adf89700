//! BLE communication module.
//!
//! This module orchestrates discovery of and communication with Health
//! Thermometer peripherals on top of a [`BleAdapter`](crate::adapter::BleAdapter).

pub mod characteristics;
pub mod connection;
pub mod permission;
pub mod replay;
pub mod scanner;
pub mod session;
pub mod uuids;

pub use characteristics::{CharacteristicDescriptor, Operation, Operations, CHARACTERISTICS};
pub use connection::{
    Connection, ConnectionEvent, ConnectionManager, ConnectionPhase, FailureReason,
};
pub use permission::{GateStatus, GrantedPermissions, PermissionGate, PermissionPlatform};
pub use replay::{ReplayBroadcast, ReplayReceiver};
pub use scanner::{ScanEvent, Scanner, SightingTracker};
pub use session::CharacteristicSession;
pub use uuids::*;

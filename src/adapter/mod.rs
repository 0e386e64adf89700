//! BLE adapter capability.
//!
//! Everything this crate needs from the platform radio stack goes through
//! [`BleAdapter`]. [`NativeAdapter`] drives the system adapter via btleplug;
//! [`FakeAdapter`] is a deterministic, scriptable stand-in.

pub mod fake;
pub mod native;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::error::Result;
use crate::handle::SubscriptionHandle;
use crate::protocol::EncodedValue;

pub use fake::{ConnectBehavior, DiscoveryBehavior, FakeAdapter, FakePeripheral};
pub use native::NativeAdapter;

/// Power and authorization state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioState {
    /// The platform has no BLE support.
    Unsupported,
    /// The radio is off.
    PoweredOff,
    /// The radio is on and usable.
    PoweredOn,
    /// The app is not authorized to use BLE.
    Unauthorized,
    /// The radio stack is restarting.
    Resetting,
    /// State not yet known.
    #[default]
    Unknown,
}

impl RadioState {
    /// Only a powered-on radio permits scan and connect operations.
    pub fn permits_operations(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for RadioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported => write!(f, "Unsupported"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Opaque platform identifier of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Wrap a platform identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single advertisement report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// The advertising peripheral.
    pub id: PeripheralId,
    /// Broadcast (GAP) name.
    pub name: Option<String>,
    /// Local name from the advertisement payload.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl Advertisement {
    /// The first non-empty of `name` and `local_name`.
    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| self.local_name.as_deref().filter(|name| !name.is_empty()))
    }
}

/// Platform scan options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanOptions {
    /// Report every advertisement rather than one per peripheral.
    pub allow_duplicates: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            allow_duplicates: true,
        }
    }
}

/// Properties of a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties {
    /// Readable.
    pub read: bool,
    /// Writable (with or without response).
    pub write: bool,
    /// Supports notifications or indications.
    pub notify: bool,
}

/// A characteristic found by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Reported properties.
    pub properties: CharacteristicProperties,
}

/// A service found by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<DiscoveredCharacteristic>,
}

/// Stream of advertisement reports; an `Err` item ends the scan.
pub type AdvertisementStream = BoxStream<'static, Result<Advertisement>>;

/// Stream of notified values for one characteristic.
pub type MonitorStream = BoxStream<'static, Result<EncodedValue>>;

/// A live adapter-level characteristic subscription.
///
/// Dropping or cancelling `handle` releases the adapter subscription.
pub struct MonitorSubscription {
    /// Notified values in the order the adapter reports them.
    pub values: MonitorStream,
    /// Releases the subscription.
    pub handle: SubscriptionHandle,
}

impl std::fmt::Debug for MonitorSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSubscription")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Primitive operations of a platform BLE driver.
///
/// All operations may suspend; none may be assumed to complete synchronously.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Current radio state and its changes.
    fn radio_state(&self) -> watch::Receiver<RadioState>;

    /// Peripherals the adapter reports as disconnected (link loss, power-off).
    fn disconnections(&self) -> broadcast::Receiver<PeripheralId>;

    /// Start an advertisement scan filtered to `services` (empty = all).
    async fn start_scan(&self, services: &[Uuid], options: ScanOptions)
        -> Result<AdvertisementStream>;

    /// Stop the running scan, if any.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a peripheral, giving up after `timeout`.
    async fn connect(&self, peripheral: &PeripheralId, timeout: Duration) -> Result<()>;

    /// Disconnect, or abort a pending connection.
    async fn cancel_connection(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Discover all services and characteristics of a connected peripheral.
    async fn discover_all(&self, peripheral: &PeripheralId) -> Result<Vec<DiscoveredService>>;

    /// Whether the adapter holds a link to the peripheral.
    async fn is_connected(&self, peripheral: &PeripheralId) -> Result<bool>;

    /// Read a characteristic value.
    async fn read_characteristic(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<EncodedValue>;

    /// Write a characteristic value and wait for the peripheral's response.
    async fn write_characteristic(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: EncodedValue,
    ) -> Result<()>;

    /// Subscribe to notifications of a characteristic.
    async fn monitor_characteristic(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<MonitorSubscription>;
}

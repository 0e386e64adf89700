//! Device manager for discovering and connecting to Health Thermometers.
//!
//! Wires the permission gate, scanner and connection manager to one adapter
//! and exposes them as a single entry point.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::adapter::{BleAdapter, NativeAdapter, PeripheralId};
use crate::ble::connection::{Connection, ConnectionEvent, ConnectionManager};
use crate::ble::permission::{GateStatus, GrantedPermissions, PermissionGate, PermissionPlatform};
use crate::ble::scanner::{ScanEvent, Scanner};
use crate::ble::session::CharacteristicSession;
use crate::config::CentralConfig;
use crate::data::PeripheralSighting;
use crate::error::Result;
use crate::handle::SubscriptionHandle;

/// Central manager for discovering and connecting to thermometers.
pub struct DeviceManager {
    adapter: Arc<dyn BleAdapter>,
    gate: Arc<PermissionGate>,
    scanner: Arc<Scanner>,
    connections: ConnectionManager,
    config: CentralConfig,
}

impl DeviceManager {
    /// Create a DeviceManager over the system Bluetooth adapter with default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let adapter = NativeAdapter::new().await?;
        Self::with_adapter(
            Arc::new(adapter),
            Arc::new(GrantedPermissions),
            CentralConfig::default(),
        )
    }

    /// Create a DeviceManager over a specific adapter and permission platform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`](crate::Error::InvalidParameter) if
    /// the configuration is invalid.
    pub fn with_adapter(
        adapter: Arc<dyn BleAdapter>,
        platform: Arc<dyn PermissionPlatform>,
        config: CentralConfig,
    ) -> Result<Self> {
        config.validate()?;

        let gate = Arc::new(PermissionGate::new(adapter.as_ref(), platform));
        gate.start();

        let scanner = Arc::new(Scanner::new(adapter.clone(), gate.clone(), config.clone()));
        let connections =
            ConnectionManager::new(adapter.clone(), gate.clone(), scanner.clone(), config.clone());

        Ok(Self {
            adapter,
            gate,
            scanner,
            connections,
            config,
        })
    }

    /// The adapter in use.
    pub fn adapter(&self) -> &Arc<dyn BleAdapter> {
        &self.adapter
    }

    /// The configuration in use.
    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    /// Wait until the radio is usable.
    pub async fn await_ready(&self) -> Result<()> {
        self.gate.await_ready().await
    }

    /// Current permission gate status.
    pub fn gate_status(&self) -> GateStatus {
        self.gate.status()
    }

    /// Watch permission gate status changes.
    pub fn watch_gate_status(&self) -> watch::Receiver<GateStatus> {
        self.gate.watch_status()
    }

    /// Start scanning for thermometers.
    pub async fn start_scanning(&self) -> Result<()> {
        self.scanner.start_scanning().await
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.scanner.stop_scanning().await
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Register a callback for sightings and scan failures.
    pub fn on_sighting<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Result<PeripheralSighting>) + Send + Sync + 'static,
    {
        self.scanner.on_sighting(callback)
    }

    /// Subscribe to scan events.
    pub fn subscribe_sightings(&self) -> broadcast::Receiver<ScanEvent> {
        self.scanner.subscribe()
    }

    /// All retained sightings.
    pub fn sightings(&self) -> HashMap<PeripheralId, PeripheralSighting> {
        self.scanner.sightings()
    }

    /// Retained sightings sorted by signal strength (strongest first).
    pub fn sightings_by_signal(&self) -> Vec<PeripheralSighting> {
        let mut sightings: Vec<_> = self.scanner.sightings().into_values().collect();
        sightings.sort_by_key(|s| std::cmp::Reverse(s.rssi.unwrap_or(i16::MIN)));
        sightings
    }

    /// Connect to a peripheral once the permission gate is open. Stops the
    /// scan first.
    pub async fn connect(&self, peripheral: &PeripheralId) -> Result<CharacteristicSession> {
        self.connections.connect(peripheral).await
    }

    /// Disconnect, or cancel a pending connection attempt.
    pub async fn disconnect(&self) -> Result<()> {
        self.connections.disconnect().await
    }

    /// The active connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.connections.connection()
    }

    /// The session of the ready connection.
    pub fn session(&self) -> Option<CharacteristicSession> {
        self.connections.session()
    }

    /// Subscribe to connection events.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe()
    }

    /// Whether a connection is ready and the adapter still holds its link.
    pub async fn is_device_connected(&self) -> bool {
        self.connections.is_device_connected().await
    }

    /// Shutdown the manager: stop scanning and disconnect.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        if let Err(e) = self.scanner.stop_scanning().await {
            warn!("Failed to stop scan during shutdown: {}", e);
        }

        if let Err(e) = self.connections.disconnect().await {
            warn!("Failed to disconnect during shutdown: {}", e);
        }

        self.gate.shutdown();
        debug!("Device manager shut down");
        Ok(())
    }
}

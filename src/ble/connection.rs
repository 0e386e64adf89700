//! BLE connection management.
//!
//! Handles connecting to a single Health Thermometer at a time: connect,
//! service discovery, the ready session, and teardown on disconnect.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{BleAdapter, DiscoveredService, PeripheralId, RadioState};
use crate::ble::permission::{GateStatus, PermissionGate};
use crate::ble::scanner::Scanner;
use crate::ble::session::CharacteristicSession;
use crate::config::CentralConfig;
use crate::error::{Error, Result};

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FailureReason {
    /// Connect or discovery did not complete in time.
    Timeout,
    /// The adapter rejected the connection.
    Adapter(String),
    /// Service discovery failed.
    Discovery(String),
    /// The adapter kept reporting a link this manager has no record of.
    InconsistentState,
}

impl FailureReason {
    fn from_error(error: &Error) -> Self {
        match error {
            Error::Timeout { .. } => Self::Timeout,
            Error::InconsistentState { .. } => Self::InconsistentState,
            Error::DiscoveryFailed { reason } => Self::Discovery(reason.clone()),
            other => Self::Adapter(other.to_string()),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Adapter(reason) => write!(f, "adapter error: {}", reason),
            Self::Discovery(reason) => write!(f, "discovery failed: {}", reason),
            Self::InconsistentState => write!(f, "inconsistent adapter state"),
        }
    }
}

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionPhase {
    /// Waiting for the adapter to connect.
    Connecting,
    /// Discovering services and characteristics.
    Discovering,
    /// Connected with a usable session.
    Ready,
    /// Disconnected by the caller or the adapter.
    Disconnected,
    /// The attempt failed.
    Failed(FailureReason),
}

impl ConnectionPhase {
    /// Whether the phase holds the single connection slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Discovering | Self::Ready)
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed(reason) => write!(f, "Failed ({})", reason),
        }
    }
}

/// Snapshot of the active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// The connected peripheral.
    pub peripheral: PeripheralId,
    /// Current phase.
    pub phase: ConnectionPhase,
}

/// Event for connection phase changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The peripheral concerned.
    pub peripheral: PeripheralId,
    /// The new phase.
    pub phase: ConnectionPhase,
}

struct ActiveConnection {
    attempt: u64,
    peripheral: PeripheralId,
    phase: ConnectionPhase,
    /// Fires when a pending attempt is cancelled.
    cancel: Option<oneshot::Sender<()>>,
    session: Option<CharacteristicSession>,
    watcher: Option<JoinHandle<()>>,
}

struct ConnectionShared {
    adapter: Arc<dyn BleAdapter>,
    active: Mutex<Option<ActiveConnection>>,
    next_attempt: AtomicU64,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

/// Manages the connection to one Health Thermometer at a time.
pub struct ConnectionManager {
    shared: Arc<ConnectionShared>,
    gate: Arc<PermissionGate>,
    scanner: Arc<Scanner>,
    config: CentralConfig,
}

impl ConnectionManager {
    /// Create a connection manager. Connects wait for `gate`, and `scanner`
    /// is stopped whenever a connection is attempted.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        gate: Arc<PermissionGate>,
        scanner: Arc<Scanner>,
        config: CentralConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));

        Self {
            shared: Arc::new(ConnectionShared {
                adapter,
                active: Mutex::new(None),
                next_attempt: AtomicU64::new(1),
                event_tx,
            }),
            gate,
            scanner,
            config,
        }
    }

    /// The active connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.shared.active.lock().as_ref().map(|record| Connection {
            peripheral: record.peripheral.clone(),
            phase: record.phase.clone(),
        })
    }

    /// The session of the ready connection.
    pub fn session(&self) -> Option<CharacteristicSession> {
        self.shared
            .active
            .lock()
            .as_ref()
            .and_then(|record| record.session.clone())
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Whether a connection is ready and the adapter still holds its link.
    pub async fn is_device_connected(&self) -> bool {
        let peripheral = match self.connection() {
            Some(Connection {
                peripheral,
                phase: ConnectionPhase::Ready,
            }) => peripheral,
            _ => return false,
        };

        self.shared
            .adapter
            .is_connected(&peripheral)
            .await
            .unwrap_or(false)
    }

    /// Connect to a peripheral and return its session.
    ///
    /// Stops any running scan, connects within the configured timeout,
    /// discovers services and primes the session's notifications.
    ///
    /// Waits (within the connect timeout) for the permission gate first.
    /// Dropping the returned future before it completes abandons the
    /// attempt: the slot is released and any half-open link torn down.
    ///
    /// # Errors
    ///
    /// - [`Error::RadioUnavailable`] if the platform does not support BLE
    /// - [`Error::PermissionDenied`] if Bluetooth permission is missing
    /// - [`Error::AlreadyConnecting`] if another connection holds the slot;
    ///   that connection is not affected
    /// - [`Error::Timeout`] if the radio, connect or discovery exceed their
    ///   bounds
    /// - [`Error::InconsistentState`] if the adapter keeps reporting an
    ///   untracked link to the peripheral
    /// - [`Error::ConnectionCancelled`] if [`disconnect`](Self::disconnect)
    ///   was called while the attempt was pending
    pub async fn connect(&self, peripheral: &PeripheralId) -> Result<CharacteristicSession> {
        self.require_radio().await?;

        let (attempt, mut cancel_rx) = self.claim(peripheral)?;
        let mut pending = PendingAttempt {
            shared: self.shared.clone(),
            attempt,
            peripheral: peripheral.clone(),
            session: None,
            settled: false,
        };

        info!("Connecting to {}", peripheral);

        let result = self
            .establish(attempt, peripheral, &mut cancel_rx, &mut pending)
            .await;

        match result {
            Ok(session) => {
                pending.settled = true;
                info!("Connected to {}", peripheral);
                Ok(session)
            }
            Err(e @ Error::ConnectionCancelled { .. }) => {
                pending.settled = true;
                info!("Connection attempt to {} cancelled", peripheral);
                Err(e)
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", peripheral, e);
                if let Err(teardown) = self.shared.adapter.cancel_connection(peripheral).await {
                    debug!("Teardown of {} failed: {}", peripheral, teardown);
                }
                self.shared.fail(attempt, FailureReason::from_error(&e));
                pending.settled = true;
                Err(e)
            }
        }
    }

    /// Disconnect the active connection, or cancel a pending attempt.
    ///
    /// The session is invalidated and its subscriptions end with
    /// [`Error::Disconnected`]. Does nothing if there is no connection.
    pub async fn disconnect(&self) -> Result<()> {
        let record = {
            let mut active = self.shared.active.lock();
            let record = active.take();
            if let Some(record) = &record {
                self.shared
                    .emit(&record.peripheral, ConnectionPhase::Disconnected);
            }
            record
        };

        let Some(mut record) = record else {
            debug!("No connection, ignoring disconnect request");
            return Ok(());
        };

        info!("Disconnecting from {}", record.peripheral);

        if let Some(cancel) = record.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(watcher) = record.watcher.take() {
            watcher.abort();
        }
        if let Some(session) = record.session.take() {
            session.invalidate();
        }

        self.shared
            .adapter
            .cancel_connection(&record.peripheral)
            .await
    }

    /// Wait for the permission gate to open.
    async fn require_radio(&self) -> Result<()> {
        self.gate.start();

        let mut status = self.gate.watch_status();
        let timeout = self.config.connect_timeout;
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let current = *status.borrow_and_update();
                match current {
                    GateStatus::Ready => return Ok(()),
                    GateStatus::Unsupported => return Err(Error::RadioUnavailable),
                    GateStatus::PermissionDenied => return Err(Error::PermissionDenied),
                    other => debug!("Waiting for Bluetooth before connecting: {:?}", other),
                }
                status
                    .changed()
                    .await
                    .map_err(|_| Error::Internal("permission gate dropped".to_string()))?;
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => {
                let status = self.gate.status();
                warn!("Bluetooth not ready after {:?}: {:?}", timeout, status);
                match status {
                    GateStatus::AwaitingPermission => Err(Error::PermissionDenied),
                    _ => Err(Error::Timeout {
                        operation: "radio",
                        timeout,
                    }),
                }
            }
        }
    }

    fn claim(&self, peripheral: &PeripheralId) -> Result<(u64, oneshot::Receiver<()>)> {
        let mut active = self.shared.active.lock();

        if let Some(current) = active.as_ref() {
            debug!(
                "Rejecting connect to {}: {} is {}",
                peripheral, current.peripheral, current.phase
            );
            return Err(Error::AlreadyConnecting {
                peripheral: current.peripheral.clone(),
            });
        }

        let attempt = self.shared.next_attempt.fetch_add(1, Ordering::SeqCst);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *active = Some(ActiveConnection {
            attempt,
            peripheral: peripheral.clone(),
            phase: ConnectionPhase::Connecting,
            cancel: Some(cancel_tx),
            session: None,
            watcher: None,
        });
        self.shared.emit(peripheral, ConnectionPhase::Connecting);

        Ok((attempt, cancel_rx))
    }

    async fn establish(
        &self,
        attempt: u64,
        peripheral: &PeripheralId,
        cancel_rx: &mut oneshot::Receiver<()>,
        pending: &mut PendingAttempt,
    ) -> Result<CharacteristicSession> {
        let cancelled = || Error::ConnectionCancelled {
            peripheral: peripheral.clone(),
        };

        if let Err(e) = self.scanner.stop_scanning().await {
            warn!("Failed to stop scan before connecting: {}", e);
        }

        self.connect_link(peripheral, cancel_rx).await?;

        // Subscribe before going ready so no disconnect is missed.
        let disconnections = self.shared.adapter.disconnections();

        if !self.shared.advance(attempt, ConnectionPhase::Discovering) {
            return Err(cancelled());
        }

        let services = tokio::select! {
            biased;
            _ = &mut *cancel_rx => return Err(cancelled()),
            result = self.discover(peripheral) => result?,
        };

        let session =
            CharacteristicSession::new(self.shared.adapter.clone(), peripheral.clone(), &services);
        pending.session = Some(session.clone());

        tokio::select! {
            biased;
            _ = &mut *cancel_rx => {
                session.invalidate();
                return Err(cancelled());
            }
            _ = session.prime(self.config.discovery_timeout) => {}
        }

        let radio = self.shared.adapter.radio_state();
        if !ConnectionShared::promote(&self.shared, attempt, &session, disconnections, radio) {
            session.invalidate();
            return Err(cancelled());
        }

        Ok(session)
    }

    /// Connect at the adapter level, resolving stale links.
    async fn connect_link(
        &self,
        peripheral: &PeripheralId,
        cancel_rx: &mut oneshot::Receiver<()>,
    ) -> Result<()> {
        let timeout = self.config.connect_timeout;
        let mut recovered = false;

        loop {
            let result = tokio::select! {
                biased;
                _ = &mut *cancel_rx => {
                    return Err(Error::ConnectionCancelled {
                        peripheral: peripheral.clone(),
                    });
                }
                result = tokio::time::timeout(
                    timeout,
                    self.shared.adapter.connect(peripheral, timeout),
                ) => result.unwrap_or(Err(Error::Timeout {
                    operation: "connect",
                    timeout,
                })),
            };

            match result {
                Err(Error::DeviceAlreadyConnected { .. })
                    if self.config.recover_stale_connections && !recovered =>
                {
                    warn!(
                        "Adapter already holds a link to {} with no local record, forcing disconnect",
                        peripheral
                    );
                    self.shared
                        .adapter
                        .cancel_connection(peripheral)
                        .await
                        .map_err(|e| {
                            error!("Forced disconnect of {} failed: {}", peripheral, e);
                            Error::InconsistentState {
                                peripheral: peripheral.clone(),
                            }
                        })?;
                    recovered = true;
                }
                Err(Error::DeviceAlreadyConnected { .. }) => {
                    error!("Adapter link to {} could not be resolved", peripheral);
                    return Err(Error::InconsistentState {
                        peripheral: peripheral.clone(),
                    });
                }
                other => return other,
            }
        }
    }

    async fn discover(&self, peripheral: &PeripheralId) -> Result<Vec<DiscoveredService>> {
        let timeout = self.config.discovery_timeout;
        let services = tokio::time::timeout(timeout, self.shared.adapter.discover_all(peripheral))
            .await
            .map_err(|_| Error::Timeout {
                operation: "discovery",
                timeout,
            })??;

        debug!(
            "Discovered {} services on {}",
            services.len(),
            peripheral
        );
        Ok(services)
    }
}

impl ConnectionShared {
    fn emit(&self, peripheral: &PeripheralId, phase: ConnectionPhase) {
        debug!("Connection {} -> {}", peripheral, phase);
        let _ = self.event_tx.send(ConnectionEvent {
            peripheral: peripheral.clone(),
            phase,
        });
    }

    /// Move the attempt to `phase`. Returns `false` if the attempt no longer
    /// holds the slot.
    fn advance(&self, attempt: u64, phase: ConnectionPhase) -> bool {
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(record) if record.attempt == attempt => {
                record.phase = phase.clone();
                self.emit(&record.peripheral, phase);
                true
            }
            _ => false,
        }
    }

    fn promote(
        shared: &Arc<Self>,
        attempt: u64,
        session: &CharacteristicSession,
        disconnections: broadcast::Receiver<PeripheralId>,
        radio: watch::Receiver<RadioState>,
    ) -> bool {
        let mut active = shared.active.lock();
        let Some(record) = active.as_mut().filter(|r| r.attempt == attempt) else {
            return false;
        };

        record.phase = ConnectionPhase::Ready;
        record.cancel = None;
        record.session = Some(session.clone());
        record.watcher = Some(tokio::spawn(Self::watch(
            Arc::downgrade(shared),
            attempt,
            record.peripheral.clone(),
            disconnections,
            radio,
        )));
        shared.emit(&record.peripheral, ConnectionPhase::Ready);
        true
    }

    fn fail(&self, attempt: u64, reason: FailureReason) {
        let mut active = self.active.lock();
        if active.as_ref().map(|r| r.attempt) != Some(attempt) {
            return;
        }
        if let Some(record) = active.take() {
            self.emit(&record.peripheral, ConnectionPhase::Failed(reason));
        }
    }

    /// Release the slot of an attempt whose caller went away. Returns `false`
    /// if the attempt no longer holds the slot.
    fn abandon(&self, attempt: u64) -> bool {
        let mut active = self.active.lock();
        let holds_slot = active
            .as_ref()
            .map_or(false, |r| r.attempt == attempt && !r.phase.is_ready());
        if !holds_slot {
            return false;
        }
        if let Some(record) = active.take() {
            self.emit(&record.peripheral, ConnectionPhase::Disconnected);
        }
        true
    }

    /// Tear down after the adapter reported the link gone.
    fn lost(&self, attempt: u64) {
        let record = {
            let mut active = self.active.lock();
            if active.as_ref().map(|r| r.attempt) != Some(attempt) {
                return;
            }
            let record = active.take();
            if let Some(record) = &record {
                self.emit(&record.peripheral, ConnectionPhase::Disconnected);
            }
            record
        };

        if let Some(record) = record {
            warn!("Connection to {} lost", record.peripheral);
            if let Some(session) = record.session {
                session.invalidate();
            }
        }
    }

    async fn watch(
        shared: Weak<Self>,
        attempt: u64,
        peripheral: PeripheralId,
        mut disconnections: broadcast::Receiver<PeripheralId>,
        mut radio: watch::Receiver<RadioState>,
    ) {
        let mut radio_open = true;

        loop {
            let state = *radio.borrow_and_update();
            if !state.permits_operations() {
                warn!("Radio is {}, dropping connection to {}", state, peripheral);
                if let Some(shared) = shared.upgrade() {
                    shared.lost(attempt);
                }
                return;
            }

            let suspect = tokio::select! {
                event = disconnections.recv() => match event {
                    Ok(id) => id == peripheral,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {} disconnect events, checking link", skipped);
                        true
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                changed = radio.changed(), if radio_open => {
                    if changed.is_err() {
                        debug!("Radio state stream closed");
                        radio_open = false;
                    }
                    continue;
                }
            };
            if !suspect {
                continue;
            }

            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.adapter.is_connected(&peripheral).await.unwrap_or(false) {
                debug!("Ignoring stale disconnect event for {}", peripheral);
                continue;
            }
            shared.lost(attempt);
            return;
        }
    }
}

/// Releases the slot and tears the link down if a `connect` future is
/// dropped before it completes.
struct PendingAttempt {
    shared: Arc<ConnectionShared>,
    attempt: u64,
    peripheral: PeripheralId,
    session: Option<CharacteristicSession>,
    settled: bool,
}

impl Drop for PendingAttempt {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        if let Some(session) = self.session.take() {
            session.invalidate();
        }
        if !self.shared.abandon(self.attempt) {
            return;
        }

        warn!("Connection attempt to {} abandoned", self.peripheral);
        let adapter = self.shared.adapter.clone();
        let peripheral = self.peripheral.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = adapter.cancel_connection(&peripheral).await {
                        debug!("Teardown of {} failed: {}", peripheral, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to tear down link to {}", peripheral),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(record) = self.shared.active.lock().take() {
            if let Some(watcher) = record.watcher {
                watcher.abort();
            }
            if let Some(session) = record.session {
                session.invalidate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ConnectBehavior, DiscoveryBehavior, FakeAdapter, FakePeripheral};
    use crate::ble::characteristics::INTERMEDIATE_TEMPERATURE;
    use crate::ble::permission::{GrantedPermissions, MockPermissionPlatform, PermissionPlatform};
    use crate::ble::uuids::{INTERMEDIATE_TEMPERATURE_UUID, TEMPERATURE_TYPE_UUID};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn manager(fake: &FakeAdapter) -> (Arc<Scanner>, Arc<ConnectionManager>) {
        manager_with(fake, Arc::new(GrantedPermissions))
    }

    fn manager_with(
        fake: &FakeAdapter,
        platform: Arc<dyn PermissionPlatform>,
    ) -> (Arc<Scanner>, Arc<ConnectionManager>) {
        let adapter: Arc<dyn BleAdapter> = Arc::new(fake.clone());
        let gate = Arc::new(PermissionGate::new(adapter.as_ref(), platform));
        let config = CentralConfig::default();
        let scanner = Arc::new(Scanner::new(adapter.clone(), gate.clone(), config.clone()));
        let manager = Arc::new(ConnectionManager::new(
            adapter,
            gate,
            scanner.clone(),
            config,
        ));
        (scanner, manager)
    }

    fn thermometer(id: &str) -> FakePeripheral {
        FakePeripheral::health_thermometer(id, Some("Shine2"))
            .with_value(TEMPERATURE_TYPE_UUID, b"2".to_vec())
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionPhase> {
        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            phases.push(event.phase);
        }
        phases
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_stops_scan_and_reaches_ready() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A"));
        let (scanner, manager) = manager(&fake);
        let mut events = manager.subscribe();

        scanner.start_scanning().await.unwrap();
        assert!(fake.is_scanning());

        let session = manager.connect(&"A".into()).await.unwrap();
        assert!(!scanner.is_scanning());
        assert!(!fake.is_scanning());
        assert!(session.is_live());
        assert!(manager.is_device_connected().await);
        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionPhase::Connecting,
                ConnectionPhase::Discovering,
                ConnectionPhase::Ready
            ]
        );
    }

    #[tokio::test]
    async fn test_second_connect_fails_fast() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A").with_connect(ConnectBehavior::Hang));
        fake.add_peripheral(thermometer("B"));
        let (_scanner, manager) = manager(&fake);

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(&"A".into()).await }
        });
        settle().await;

        let error = manager.connect(&"B".into()).await.unwrap_err();
        match error {
            Error::AlreadyConnecting { peripheral } => assert_eq!(peripheral.as_str(), "A"),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(
            manager.connection().unwrap().phase,
            ConnectionPhase::Connecting
        );
        assert!(!pending.is_finished());
        pending.abort();
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_attempt() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A").with_connect(ConnectBehavior::Hang));
        let (_scanner, manager) = manager(&fake);

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(&"A".into()).await }
        });
        settle().await;

        manager.disconnect().await.unwrap();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionCancelled { .. })));
        assert!(manager.connection().is_none());
        assert!(!fake.is_linked(&"A".into()));
    }

    #[tokio::test]
    async fn test_stale_adapter_link_is_recovered() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A"));
        fake.mark_connected(&"A".into());
        let (_scanner, manager) = manager(&fake);

        manager.connect(&"A".into()).await.unwrap();
        assert_eq!(fake.connect_attempts(), 2);
        assert_eq!(fake.cancel_calls(), 1);
        assert!(manager.connection().unwrap().phase.is_ready());
    }

    #[tokio::test]
    async fn test_unresolvable_link_is_inconsistent_state() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A").with_connect(ConnectBehavior::StuckConnected));
        let (_scanner, manager) = manager(&fake);
        let mut events = manager.subscribe();

        let error = manager.connect(&"A".into()).await.unwrap_err();
        assert!(matches!(error, Error::InconsistentState { .. }));
        assert_eq!(
            drain(&mut events).last(),
            Some(&ConnectionPhase::Failed(FailureReason::InconsistentState))
        );
        assert!(manager.connection().is_none());
    }

    #[tokio::test]
    async fn test_discovery_failure_tears_down_link() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(
            thermometer("A").with_discovery(DiscoveryBehavior::Fail("GATT busy".to_string())),
        );
        let (_scanner, manager) = manager(&fake);
        let mut events = manager.subscribe();

        let error = manager.connect(&"A".into()).await.unwrap_err();
        assert!(matches!(error, Error::DiscoveryFailed { .. }));
        assert!(!fake.is_linked(&"A".into()));
        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionPhase::Connecting,
                ConnectionPhase::Discovering,
                ConnectionPhase::Failed(FailureReason::Discovery("GATT busy".to_string()))
            ]
        );

        // The slot is free again.
        fake.add_peripheral(thermometer("A"));
        manager.connect(&"A".into()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_timeout() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A").with_discovery(DiscoveryBehavior::Hang));
        let (_scanner, manager) = manager(&fake);

        let error = manager.connect(&"A".into()).await.unwrap_err();
        match error {
            Error::Timeout { operation, timeout } => {
                assert_eq!(operation, "discovery");
                assert_eq!(timeout, Duration::from_secs(10));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_disconnect_event_is_ignored() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A"));
        let (_scanner, manager) = manager(&fake);
        let session = manager.connect(&"A".into()).await.unwrap();

        // Another peripheral's disconnect does not affect this connection.
        fake.push_disconnect(&"B".into());
        settle().await;
        assert!(session.is_live());

        fake.push_disconnect(&"A".into());
        settle().await;
        assert!(!session.is_live());
        assert!(manager.connection().is_none());
    }

    #[tokio::test]
    async fn test_connect_without_ble_support_fails_fast() {
        let fake = FakeAdapter::with_radio_state(RadioState::Unsupported);
        fake.add_peripheral(thermometer("A"));
        let (_scanner, manager) = manager(&fake);

        let error = manager.connect(&"A".into()).await.unwrap_err();
        assert!(matches!(error, Error::RadioUnavailable));
        assert_eq!(fake.connect_attempts(), 0);
        assert!(manager.connection().is_none());
    }

    #[tokio::test]
    async fn test_connect_reports_denied_permission() {
        let fake = FakeAdapter::with_radio_state(RadioState::Unauthorized);
        fake.add_peripheral(thermometer("A"));
        let mut platform = MockPermissionPlatform::new();
        platform
            .expect_request_permission()
            .times(1)
            .returning(|| Ok(false));
        platform.expect_request_radio_enable().never();
        let (_scanner, manager) = manager_with(&fake, Arc::new(platform));

        let error = manager.connect(&"A".into()).await.unwrap_err();
        assert!(matches!(error, Error::PermissionDenied));
        assert_eq!(fake.connect_attempts(), 0);
        assert!(manager.connection().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_radio() {
        let fake = FakeAdapter::with_radio_state(RadioState::PoweredOff);
        fake.add_peripheral(thermometer("A"));
        let (_scanner, manager) = manager(&fake);

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(&"A".into()).await }
        });
        settle().await;
        assert!(manager.connection().is_none());
        assert_eq!(fake.connect_attempts(), 0);

        fake.set_radio_state(RadioState::PoweredOn);
        let session = pending.await.unwrap().unwrap();
        assert!(session.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_while_radio_is_off() {
        let fake = FakeAdapter::with_radio_state(RadioState::PoweredOff);
        fake.add_peripheral(thermometer("A"));
        let (_scanner, manager) = manager(&fake);

        let error = manager.connect(&"A".into()).await.unwrap_err();
        match error {
            Error::Timeout { operation, .. } => assert_eq!(operation, "radio"),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(fake.connect_attempts(), 0);
        assert!(manager.connection().is_none());
    }

    #[tokio::test]
    async fn test_radio_loss_drops_connection() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A"));
        let (_scanner, manager) = manager(&fake);
        let mut events = manager.subscribe();
        let session = manager.connect(&"A".into()).await.unwrap();
        drain(&mut events);

        fake.set_radio_state(RadioState::PoweredOff);
        settle().await;
        assert!(!session.is_live());
        assert!(manager.connection().is_none());
        assert_eq!(drain(&mut events), vec![ConnectionPhase::Disconnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connect_releases_slot() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A").with_discovery(DiscoveryBehavior::Hang));
        fake.add_peripheral(thermometer("B"));
        let (_scanner, manager) = manager(&fake);
        let mut events = manager.subscribe();

        let abandoned =
            tokio::time::timeout(Duration::from_secs(1), manager.connect(&"A".into())).await;
        assert!(abandoned.is_err());
        settle().await;

        assert!(manager.connection().is_none());
        assert!(!fake.is_linked(&"A".into()));
        assert_eq!(
            drain(&mut events),
            vec![
                ConnectionPhase::Connecting,
                ConnectionPhase::Discovering,
                ConnectionPhase::Disconnected
            ]
        );

        let session = manager.connect(&"B".into()).await.unwrap();
        assert_eq!(session.peripheral().as_str(), "B");
    }

    #[tokio::test]
    async fn test_disconnect_cancels_half_established_link() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(thermometer("A").with_discovery(DiscoveryBehavior::Hang));
        let (_scanner, manager) = manager(&fake);

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect(&"A".into()).await }
        });
        settle().await;
        assert_eq!(
            manager.connection().unwrap().phase,
            ConnectionPhase::Discovering
        );
        assert!(fake.is_linked(&"A".into()));

        manager.disconnect().await.unwrap();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionCancelled { .. })));
        assert!(!fake.is_linked(&"A".into()));
        assert!(manager.connection().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_priming_read_still_reaches_ready() {
        let fake = FakeAdapter::new();
        fake.add_peripheral(
            thermometer("A").with_value(INTERMEDIATE_TEMPERATURE_UUID, b"36.4".to_vec()),
        );
        fake.stall_reads(INTERMEDIATE_TEMPERATURE_UUID);
        let (_scanner, manager) = manager(&fake);

        let session = manager.connect(&"A".into()).await.unwrap();
        assert!(manager.connection().unwrap().phase.is_ready());
        assert!(session.latest(INTERMEDIATE_TEMPERATURE).is_none());

        let mut rx = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
        fake.notify(&"A".into(), INTERMEDIATE_TEMPERATURE_UUID, b"36.8".to_vec());
        let value = rx.recv().await.unwrap().unwrap();
        assert_eq!(value.as_text(), Some("36.8"));
    }
}

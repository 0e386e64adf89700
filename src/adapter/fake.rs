//! Deterministic in-memory adapter.
//!
//! Peripherals, radio state, advertisements, notifications and link loss are
//! all driven explicitly by the caller, which makes the connection and
//! session lifecycle reproducible in tests and simulations.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    Advertisement, AdvertisementStream, BleAdapter, CharacteristicProperties,
    DiscoveredCharacteristic, DiscoveredService, MonitorSubscription, PeripheralId, RadioState,
    ScanOptions,
};
use crate::ble::characteristics::{Operation, CHARACTERISTICS};
use crate::error::{Error, Result};
use crate::handle::SubscriptionHandle;
use crate::protocol::EncodedValue;

/// How a scripted peripheral answers a connect request.
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    /// Connect immediately.
    Succeed,
    /// Never answer.
    Hang,
    /// Fail with the given error.
    Fail(Error),
    /// Always claim to be connected already, even after a forced disconnect.
    StuckConnected,
}

/// How a scripted peripheral answers service discovery.
#[derive(Debug, Clone)]
pub enum DiscoveryBehavior {
    /// Report the peripheral's services.
    Succeed,
    /// Never answer.
    Hang,
    /// Fail with the given reason.
    Fail(String),
}

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct FakePeripheral {
    /// Identifier.
    pub id: PeripheralId,
    /// Broadcast name.
    pub name: Option<String>,
    /// Local name.
    pub local_name: Option<String>,
    /// Signal strength reported in advertisements.
    pub rssi: Option<i16>,
    /// GATT layout reported by discovery.
    pub services: Vec<DiscoveredService>,
    /// Current characteristic values, keyed by characteristic UUID.
    pub values: HashMap<Uuid, Vec<u8>>,
    /// Connect behaviour.
    pub connect: ConnectBehavior,
    /// Discovery behaviour.
    pub discovery: DiscoveryBehavior,
}

impl FakePeripheral {
    /// A peripheral exposing every characteristic of the built-in table.
    pub fn health_thermometer(id: impl Into<PeripheralId>, name: Option<&str>) -> Self {
        let mut services: Vec<DiscoveredService> = Vec::new();
        for descriptor in CHARACTERISTICS.iter() {
            let characteristic = DiscoveredCharacteristic {
                uuid: descriptor.uuid,
                properties: CharacteristicProperties {
                    read: descriptor.supports(Operation::Read),
                    write: descriptor.supports(Operation::Write),
                    notify: descriptor.supports(Operation::Notify),
                },
            };
            match services.iter_mut().find(|s| s.uuid == descriptor.service) {
                Some(service) => service.characteristics.push(characteristic),
                None => services.push(DiscoveredService {
                    uuid: descriptor.service,
                    characteristics: vec![characteristic],
                }),
            }
        }

        Self {
            id: id.into(),
            name: name.map(str::to_string),
            local_name: None,
            rssi: Some(-55),
            services,
            values: HashMap::new(),
            connect: ConnectBehavior::Succeed,
            discovery: DiscoveryBehavior::Succeed,
        }
    }

    /// Set a characteristic value.
    pub fn with_value(mut self, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        self.values.insert(characteristic, value.into());
        self
    }

    /// Set the connect behaviour.
    pub fn with_connect(mut self, behavior: ConnectBehavior) -> Self {
        self.connect = behavior;
        self
    }

    /// Set the discovery behaviour.
    pub fn with_discovery(mut self, behavior: DiscoveryBehavior) -> Self {
        self.discovery = behavior;
        self
    }

    /// Remove a characteristic from the GATT layout.
    pub fn without_characteristic(mut self, characteristic: Uuid) -> Self {
        for service in &mut self.services {
            service.characteristics.retain(|c| c.uuid != characteristic);
        }
        self
    }

    /// The advertisement this peripheral broadcasts.
    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            id: self.id.clone(),
            name: self.name.clone(),
            local_name: self.local_name.clone(),
            rssi: self.rssi,
            services: self.services.iter().map(|s| s.uuid).collect(),
        }
    }
}

type MonitorKey = (PeripheralId, Uuid);

#[derive(Default)]
struct FakeState {
    peripherals: HashMap<PeripheralId, FakePeripheral>,
    scan_tx: Option<mpsc::UnboundedSender<Result<Advertisement>>>,
    scan_filter: Vec<Uuid>,
    scan_options: Option<ScanOptions>,
    scan_starts: usize,
    connected: HashSet<PeripheralId>,
    connect_attempts: usize,
    cancel_calls: usize,
    monitors: HashMap<MonitorKey, Vec<(u64, mpsc::UnboundedSender<Result<EncodedValue>>)>>,
    monitor_starts: usize,
    next_monitor_id: u64,
    read_failures: HashMap<Uuid, Error>,
    stalled_reads: HashSet<Uuid>,
    writes: Vec<(PeripheralId, Uuid, Vec<u8>)>,
}

/// Scriptable adapter for tests and simulations.
#[derive(Clone)]
pub struct FakeAdapter {
    state: Arc<Mutex<FakeState>>,
    radio_tx: Arc<watch::Sender<RadioState>>,
    disconnect_tx: broadcast::Sender<PeripheralId>,
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAdapter {
    /// An adapter whose radio is powered on.
    pub fn new() -> Self {
        Self::with_radio_state(RadioState::PoweredOn)
    }

    /// An adapter starting in `state`.
    pub fn with_radio_state(state: RadioState) -> Self {
        let (radio_tx, _) = watch::channel(state);
        let (disconnect_tx, _) = broadcast::channel(16);

        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            radio_tx: Arc::new(radio_tx),
            disconnect_tx,
        }
    }

    /// Register a peripheral.
    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        self.state
            .lock()
            .peripherals
            .insert(peripheral.id.clone(), peripheral);
    }

    /// Change the radio state.
    pub fn set_radio_state(&self, state: RadioState) {
        debug!("Fake radio state -> {}", state);
        self.radio_tx.send_replace(state);
    }

    /// Deliver an advertisement to the running scan. Returns `false` when no
    /// scan is running or the filter excludes it.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        let state = self.state.lock();
        let Some(tx) = state.scan_tx.as_ref() else {
            return false;
        };
        let matches_filter = state.scan_filter.is_empty()
            || advertisement
                .services
                .iter()
                .any(|s| state.scan_filter.contains(s));
        matches_filter && tx.send(Ok(advertisement)).is_ok()
    }

    /// Deliver the advertisement of a registered peripheral.
    pub fn advertise_peripheral(&self, id: &PeripheralId) -> bool {
        let advertisement = match self.state.lock().peripherals.get(id) {
            Some(peripheral) => peripheral.advertisement(),
            None => return false,
        };
        self.advertise(advertisement)
    }

    /// Report a scan error; the adapter's scan ends.
    pub fn fail_scan(&self, error: Error) {
        if let Some(tx) = self.state.lock().scan_tx.take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan_tx.is_some()
    }

    /// How many scans were started.
    pub fn scan_start_count(&self) -> usize {
        self.state.lock().scan_starts
    }

    /// Options of the most recent scan.
    pub fn last_scan_options(&self) -> Option<ScanOptions> {
        self.state.lock().scan_options
    }

    /// Mark a peripheral as linked at the adapter level without going
    /// through `connect`.
    pub fn mark_connected(&self, id: &PeripheralId) {
        self.state.lock().connected.insert(id.clone());
    }

    /// Whether the adapter holds a link to the peripheral.
    pub fn is_linked(&self, id: &PeripheralId) -> bool {
        self.state.lock().connected.contains(id)
    }

    /// Number of `connect` calls.
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Number of `cancel_connection` calls.
    pub fn cancel_calls(&self) -> usize {
        self.state.lock().cancel_calls
    }

    /// Simulate link loss pushed by the platform.
    pub fn push_disconnect(&self, id: &PeripheralId) {
        self.state.lock().connected.remove(id);
        debug!("Fake link loss: {}", id);
        let _ = self.disconnect_tx.send(id.clone());
    }

    /// Update a characteristic value and notify its monitors. Returns how
    /// many monitors were reached.
    pub fn notify(&self, id: &PeripheralId, characteristic: Uuid, value: impl Into<Vec<u8>>) -> usize {
        let value = value.into();
        let mut state = self.state.lock();
        if let Some(peripheral) = state.peripherals.get_mut(id) {
            peripheral.values.insert(characteristic, value.clone());
        }
        let encoded = EncodedValue::encode(&value);
        Self::deliver(&mut state, id, characteristic, Ok(encoded))
    }

    /// Notify a raw base64 payload, bypassing encoding.
    pub fn notify_encoded(&self, id: &PeripheralId, characteristic: Uuid, value: EncodedValue) -> usize {
        let mut state = self.state.lock();
        Self::deliver(&mut state, id, characteristic, Ok(value))
    }

    /// Report a monitor error on a characteristic.
    pub fn fail_monitor(&self, id: &PeripheralId, characteristic: Uuid, error: Error) -> usize {
        let mut state = self.state.lock();
        Self::deliver(&mut state, id, characteristic, Err(error))
    }

    /// Make reads of a characteristic fail.
    pub fn fail_reads(&self, characteristic: Uuid, error: Error) {
        self.state.lock().read_failures.insert(characteristic, error);
    }

    /// Make reads of a characteristic never answer.
    pub fn stall_reads(&self, characteristic: Uuid) {
        self.state.lock().stalled_reads.insert(characteristic);
    }

    /// Number of live adapter subscriptions for a characteristic.
    pub fn active_monitors(&self, id: &PeripheralId, characteristic: Uuid) -> usize {
        self.state
            .lock()
            .monitors
            .get(&(id.clone(), characteristic))
            .map(|senders| senders.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Total number of adapter subscriptions ever created.
    pub fn monitor_start_count(&self) -> usize {
        self.state.lock().monitor_starts
    }

    /// Writes received, in order.
    pub fn writes(&self) -> Vec<(PeripheralId, Uuid, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    fn deliver(
        state: &mut FakeState,
        id: &PeripheralId,
        characteristic: Uuid,
        item: Result<EncodedValue>,
    ) -> usize {
        let Some(senders) = state.monitors.get_mut(&(id.clone(), characteristic)) else {
            return 0;
        };
        senders.retain(|(_, tx)| tx.send(item.clone()).is_ok());
        senders.len()
    }

    fn require_link(state: &FakeState, id: &PeripheralId) -> Result<()> {
        if state.connected.contains(id) {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    fn radio_state(&self) -> watch::Receiver<RadioState> {
        self.radio_tx.subscribe()
    }

    fn disconnections(&self) -> broadcast::Receiver<PeripheralId> {
        self.disconnect_tx.subscribe()
    }

    async fn start_scan(
        &self,
        services: &[Uuid],
        options: ScanOptions,
    ) -> Result<AdvertisementStream> {
        if !self.radio_tx.borrow().permits_operations() {
            return Err(Error::ScanFailed {
                reason: "radio is not powered on".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.scan_tx = Some(tx);
        state.scan_filter = services.to_vec();
        state.scan_options = Some(options);
        state.scan_starts += 1;
        debug!("Fake scan started ({} service filters)", services.len());

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        if self.state.lock().scan_tx.take().is_some() {
            debug!("Fake scan stopped");
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId, _timeout: Duration) -> Result<()> {
        if !self.radio_tx.borrow().permits_operations() {
            return Err(Error::ConnectionFailed {
                reason: "radio is not powered on".to_string(),
            });
        }

        let behavior = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            let behavior = state
                .peripherals
                .get(peripheral)
                .map(|p| p.connect.clone())
                .ok_or_else(|| Error::PeripheralNotFound {
                    identifier: peripheral.to_string(),
                })?;
            let already = state.connected.contains(peripheral)
                || matches!(behavior, ConnectBehavior::StuckConnected);
            if already {
                return Err(Error::DeviceAlreadyConnected {
                    peripheral: peripheral.clone(),
                });
            }
            behavior
        };

        match behavior {
            ConnectBehavior::Succeed => {
                self.state.lock().connected.insert(peripheral.clone());
                trace!("Fake connected: {}", peripheral);
                Ok(())
            }
            ConnectBehavior::Hang => futures::future::pending().await,
            ConnectBehavior::Fail(error) => Err(error),
            ConnectBehavior::StuckConnected => Err(Error::DeviceAlreadyConnected {
                peripheral: peripheral.clone(),
            }),
        }
    }

    async fn cancel_connection(&self, peripheral: &PeripheralId) -> Result<()> {
        let mut state = self.state.lock();
        state.cancel_calls += 1;
        state.connected.remove(peripheral);
        Ok(())
    }

    async fn discover_all(&self, peripheral: &PeripheralId) -> Result<Vec<DiscoveredService>> {
        let (behavior, services) = {
            let state = self.state.lock();
            Self::require_link(&state, peripheral)?;
            let p = state
                .peripherals
                .get(peripheral)
                .ok_or_else(|| Error::PeripheralNotFound {
                    identifier: peripheral.to_string(),
                })?;
            (p.discovery.clone(), p.services.clone())
        };

        match behavior {
            DiscoveryBehavior::Succeed => Ok(services),
            DiscoveryBehavior::Hang => futures::future::pending().await,
            DiscoveryBehavior::Fail(reason) => Err(Error::DiscoveryFailed { reason }),
        }
    }

    async fn is_connected(&self, peripheral: &PeripheralId) -> Result<bool> {
        Ok(self.is_linked(peripheral))
    }

    async fn read_characteristic(
        &self,
        peripheral: &PeripheralId,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<EncodedValue> {
        let stalled = {
            let state = self.state.lock();
            Self::require_link(&state, peripheral)?;
            if let Some(error) = state.read_failures.get(&characteristic) {
                return Err(error.clone());
            }
            if !state.stalled_reads.contains(&characteristic) {
                return state
                    .peripherals
                    .get(peripheral)
                    .and_then(|p| p.values.get(&characteristic))
                    .map(|value| EncodedValue::encode(value))
                    .ok_or_else(|| Error::CharacteristicNotFound {
                        uuid: characteristic.to_string(),
                    });
            }
            characteristic
        };

        trace!("Fake read of {} stalled", stalled);
        futures::future::pending().await
    }

    async fn write_characteristic(
        &self,
        peripheral: &PeripheralId,
        _service: Uuid,
        characteristic: Uuid,
        value: EncodedValue,
    ) -> Result<()> {
        let bytes = value.decode().map_err(|reason| Error::InvalidData { context: reason })?;
        let mut state = self.state.lock();
        Self::require_link(&state, peripheral)?;
        if let Some(p) = state.peripherals.get_mut(peripheral) {
            p.values.insert(characteristic, bytes.to_vec());
        }
        state
            .writes
            .push((peripheral.clone(), characteristic, bytes.to_vec()));
        Ok(())
    }

    async fn monitor_characteristic(
        &self,
        peripheral: &PeripheralId,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<MonitorSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = (peripheral.clone(), characteristic);

        let monitor_id = {
            let mut state = self.state.lock();
            Self::require_link(&state, peripheral)?;
            state.monitor_starts += 1;
            state.next_monitor_id += 1;
            let monitor_id = state.next_monitor_id;
            state
                .monitors
                .entry(key.clone())
                .or_default()
                .push((monitor_id, tx));
            monitor_id
        };

        let state = Arc::downgrade(&self.state);
        let handle = SubscriptionHandle::new(move || {
            if let Some(state) = state.upgrade() {
                if let Some(senders) = state.lock().monitors.get_mut(&key) {
                    senders.retain(|(id, _)| *id != monitor_id);
                }
            }
        });

        Ok(MonitorSubscription {
            values: UnboundedReceiverStream::new(rx).boxed(),
            handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;

    fn thermometer() -> FakePeripheral {
        FakePeripheral::health_thermometer("A", Some("Shine2"))
            .with_value(TEMPERATURE_TYPE_UUID, b"2".to_vec())
    }

    #[test]
    fn test_health_thermometer_layout() {
        let p = thermometer();
        assert_eq!(p.services.len(), 2);
        let htp = p
            .services
            .iter()
            .find(|s| s.uuid == HEALTH_THERMOMETER_SERVICE_UUID)
            .unwrap();
        assert_eq!(htp.characteristics.len(), 4);
        let p = p.without_characteristic(MEASUREMENT_INTERVAL_UUID);
        let htp = p
            .services
            .iter()
            .find(|s| s.uuid == HEALTH_THERMOMETER_SERVICE_UUID)
            .unwrap();
        assert_eq!(htp.characteristics.len(), 3);
    }

    #[tokio::test]
    async fn test_scan_respects_filter() {
        let adapter = FakeAdapter::new();
        let mut stream = adapter
            .start_scan(&[HEALTH_THERMOMETER_SERVICE_UUID], ScanOptions::default())
            .await
            .unwrap();

        assert!(adapter.advertise(thermometer().advertisement()));
        let mut other = thermometer().advertisement();
        other.services = vec![DEVICE_INFO_SERVICE_UUID];
        other.id = PeripheralId::from("B");
        assert!(!adapter.advertise(other));

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, PeripheralId::from("A"));

        adapter.stop_scan().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_read_requires_link() {
        let adapter = FakeAdapter::new();
        adapter.add_peripheral(thermometer());
        let id = PeripheralId::from("A");

        let err = adapter
            .read_characteristic(&id, HEALTH_THERMOMETER_SERVICE_UUID, TEMPERATURE_TYPE_UUID)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected));

        adapter.connect(&id, Duration::from_secs(1)).await.unwrap();
        let value = adapter
            .read_characteristic(&id, HEALTH_THERMOMETER_SERVICE_UUID, TEMPERATURE_TYPE_UUID)
            .await
            .unwrap();
        assert_eq!(value.decode().unwrap().as_ref(), b"2");
    }

    #[tokio::test]
    async fn test_monitor_cancel_releases() {
        let adapter = FakeAdapter::new();
        adapter.add_peripheral(thermometer());
        let id = PeripheralId::from("A");
        adapter.connect(&id, Duration::from_secs(1)).await.unwrap();

        let monitor = adapter
            .monitor_characteristic(
                &id,
                HEALTH_THERMOMETER_SERVICE_UUID,
                INTERMEDIATE_TEMPERATURE_UUID,
            )
            .await
            .unwrap();
        assert_eq!(adapter.active_monitors(&id, INTERMEDIATE_TEMPERATURE_UUID), 1);
        assert_eq!(adapter.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, b"36.6".to_vec()), 1);

        monitor.handle.cancel();
        assert_eq!(adapter.active_monitors(&id, INTERMEDIATE_TEMPERATURE_UUID), 0);
    }

    #[tokio::test]
    async fn test_already_connected_is_reported() {
        let adapter = FakeAdapter::new();
        adapter.add_peripheral(thermometer());
        let id = PeripheralId::from("A");
        adapter.mark_connected(&id);

        let err = adapter.connect(&id, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::DeviceAlreadyConnected { .. }));
    }

    #[tokio::test]
    async fn test_connect_requires_powered_radio() {
        let adapter = FakeAdapter::with_radio_state(RadioState::PoweredOff);
        adapter.add_peripheral(thermometer());
        let id = PeripheralId::from("A");

        let err = adapter.connect(&id, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert!(!adapter.is_linked(&id));

        adapter.set_radio_state(RadioState::PoweredOn);
        adapter.connect(&id, Duration::from_secs(1)).await.unwrap();
        assert!(adapter.is_linked(&id));
    }
}

//! Characteristic session for a connected thermometer.
//!
//! A session is created by the connection manager once discovery succeeds
//! and is invalidated the moment the connection leaves the ready phase.
//! Every notify-capable characteristic the peripheral exposes gets one
//! adapter subscription, fanned out to any number of subscribers through a
//! [`ReplayBroadcast`].

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::adapter::{BleAdapter, DiscoveredService, MonitorSubscription, PeripheralId};
use crate::ble::characteristics::{
    self, CharacteristicDescriptor, Operation, MEASUREMENT_INTERVAL, TEMPERATURE_MEASUREMENT,
};
use crate::ble::replay::{ReplayBroadcast, ReplayReceiver};
use crate::data::{encode_measurement_interval, parse_measurement_interval, TemperatureMeasurement};
use crate::error::{Error, Result};
use crate::protocol::{CharacteristicValue, EncodedValue};

struct NotifyChannel {
    broadcast: ReplayBroadcast<CharacteristicValue>,
    pump: JoinHandle<()>,
}

struct SessionShared {
    adapter: Arc<dyn BleAdapter>,
    peripheral: PeripheralId,
    /// `(service, characteristic)` pairs found by discovery.
    exposed: HashSet<(Uuid, Uuid)>,
    live: AtomicBool,
    channels: Mutex<HashMap<&'static str, NotifyChannel>>,
    /// Serialises re-arming of failed channels.
    arming: tokio::sync::Mutex<()>,
}

/// Read, write and subscribe access to one connected peripheral.
///
/// Cheap to clone; all clones share the same state and are invalidated
/// together.
#[derive(Clone)]
pub struct CharacteristicSession {
    shared: Arc<SessionShared>,
}

impl CharacteristicSession {
    /// Create a session over the services discovery reported.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        peripheral: PeripheralId,
        services: &[DiscoveredService],
    ) -> Self {
        let exposed = services
            .iter()
            .flat_map(|s| s.characteristics.iter().map(move |c| (s.uuid, c.uuid)))
            .collect();

        Self {
            shared: Arc::new(SessionShared {
                adapter,
                peripheral,
                exposed,
                live: AtomicBool::new(true),
                channels: Mutex::new(HashMap::new()),
                arming: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Arm notifications for every exposed notify characteristic and seed
    /// each with an initial read.
    ///
    /// Each monitor request and initial read is bounded by `timeout`.
    /// Failures are scoped to the characteristic concerned and only logged;
    /// a later `subscribe` retries the monitor.
    pub async fn prime(&self, timeout: Duration) {
        for descriptor in characteristics::notifiable() {
            if !self.exposes(descriptor) {
                continue;
            }

            match tokio::time::timeout(timeout, self.arm(descriptor, None)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("Failed to monitor {}: {}", descriptor.name, e);
                    continue;
                }
                Err(_) => {
                    warn!("Monitoring {} timed out after {:?}", descriptor.name, timeout);
                    continue;
                }
            }

            if !descriptor.supports(Operation::Read) {
                continue;
            }

            match tokio::time::timeout(timeout, self.read_descriptor(descriptor)).await {
                Ok(Ok(value)) => {
                    if let Some(channel) = self.shared.channels.lock().get(descriptor.name) {
                        channel.broadcast.publish_if_empty(value);
                    }
                }
                Ok(Err(e)) => warn!("Initial read of {} failed: {}", descriptor.name, e),
                Err(_) => warn!("Initial read of {} timed out after {:?}", descriptor.name, timeout),
            }
        }

        debug!("Session for {} primed", self.shared.peripheral);
    }

    /// The peripheral this session talks to.
    pub fn peripheral(&self) -> &PeripheralId {
        &self.shared.peripheral
    }

    /// Whether the owning connection is still ready.
    pub fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Logical names of the known characteristics this peripheral exposes.
    pub fn characteristics(&self) -> Vec<&'static str> {
        characteristics::CHARACTERISTICS
            .iter()
            .filter(|d| self.exposes(d))
            .map(|d| d.name)
            .collect()
    }

    /// The last value observed on a notify characteristic.
    pub fn latest(&self, name: &str) -> Option<CharacteristicValue> {
        self.shared
            .channels
            .lock()
            .get(name)
            .and_then(|c| c.broadcast.latest())
    }

    /// Read a characteristic and decode it in its charset.
    ///
    /// # Errors
    ///
    /// - [`Error::Disconnected`] once the connection is no longer ready
    /// - [`Error::NotSupported`] if the characteristic cannot be read or is
    ///   not exposed by the peripheral
    /// - [`Error::DecodeFailure`] if the payload is not valid in its charset
    pub async fn read(&self, name: &str) -> Result<CharacteristicValue> {
        let descriptor = self.check(name, Operation::Read)?;
        self.read_descriptor(descriptor).await
    }

    /// Read a characteristic's raw bytes without charset decoding.
    pub async fn read_raw(&self, name: &str) -> Result<Bytes> {
        let descriptor = self.check(name, Operation::Read)?;
        let encoded = self.read_encoded(descriptor).await?;
        encoded.decode().map_err(|reason| Error::DecodeFailure {
            characteristic: descriptor.name.to_string(),
            reason,
        })
    }

    /// Write a characteristic with response.
    ///
    /// Writes are acknowledged by the peripheral but not deduplicated: a
    /// caller retrying after a timeout must only retry writes that are safe
    /// to apply twice.
    pub async fn write(&self, name: &str, value: &[u8]) -> Result<()> {
        let descriptor = self.check(name, Operation::Write)?;

        trace!("Writing {} bytes to {}", value.len(), descriptor.name);
        self.shared
            .adapter
            .write_characteristic(
                &self.shared.peripheral,
                descriptor.service,
                descriptor.uuid,
                EncodedValue::encode(value),
            )
            .await
            .map_err(|e| self.scoped(e))?;

        self.ensure_live()
    }

    /// Subscribe to a notify characteristic.
    ///
    /// The last known value, if any, is the first item received. All
    /// subscribers of a characteristic share one adapter subscription. The
    /// stream ends with [`Error::Disconnected`] when the connection goes
    /// away, or with the adapter's error if its monitor fails; the next
    /// `subscribe` after a monitor failure re-arms it.
    pub async fn subscribe(&self, name: &str) -> Result<ReplayReceiver<CharacteristicValue>> {
        let descriptor = self.check(name, Operation::Notify)?;

        if let Some(rx) = self.open_channel(descriptor.name) {
            return Ok(rx);
        }

        let _arming = self.shared.arming.lock().await;
        if let Some(rx) = self.open_channel(descriptor.name) {
            return Ok(rx);
        }

        let seed = self.latest(descriptor.name);
        info!("Re-arming notifications for {}", descriptor.name);
        self.arm(descriptor, seed).await
    }

    /// Read and parse the Temperature Measurement characteristic.
    pub async fn read_temperature_measurement(&self) -> Result<TemperatureMeasurement> {
        let raw = self.read_raw(TEMPERATURE_MEASUREMENT).await?;
        TemperatureMeasurement::parse(&raw)
    }

    /// Read the Measurement Interval.
    pub async fn read_measurement_interval(&self) -> Result<Duration> {
        let raw = self.read_raw(MEASUREMENT_INTERVAL).await?;
        parse_measurement_interval(&raw)
    }

    /// Write the Measurement Interval (whole seconds, at most `u16::MAX`).
    pub async fn write_measurement_interval(&self, interval: Duration) -> Result<()> {
        let payload = encode_measurement_interval(interval)?;
        self.write(MEASUREMENT_INTERVAL, &payload).await
    }

    /// Permanently invalidate the session. Open subscriptions end with
    /// [`Error::Disconnected`] and every later operation fails with it.
    pub(crate) fn invalidate(&self) {
        if !self.shared.live.swap(false, Ordering::SeqCst) {
            return;
        }

        let channels: Vec<NotifyChannel> = self
            .shared
            .channels
            .lock()
            .drain()
            .map(|(_, channel)| channel)
            .collect();

        for channel in channels {
            channel.broadcast.close(Some(Error::Disconnected));
            channel.pump.abort();
        }

        debug!("Session for {} invalidated", self.shared.peripheral);
    }

    fn exposes(&self, descriptor: &CharacteristicDescriptor) -> bool {
        self.shared
            .exposed
            .contains(&(descriptor.service, descriptor.uuid))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }

    /// Errors from an operation that raced with invalidation become
    /// `Disconnected`.
    fn scoped(&self, error: Error) -> Error {
        if self.is_live() {
            error
        } else {
            Error::Disconnected
        }
    }

    fn check(&self, name: &str, operation: Operation) -> Result<&'static CharacteristicDescriptor> {
        self.ensure_live()?;

        let descriptor =
            characteristics::descriptor(name).ok_or_else(|| Error::UnknownCharacteristic {
                name: name.to_string(),
            })?;

        if !descriptor.supports(operation) || !self.exposes(descriptor) {
            return Err(Error::NotSupported {
                characteristic: descriptor.name.to_string(),
                operation,
            });
        }

        Ok(descriptor)
    }

    async fn read_encoded(&self, descriptor: &CharacteristicDescriptor) -> Result<EncodedValue> {
        let encoded = self
            .shared
            .adapter
            .read_characteristic(&self.shared.peripheral, descriptor.service, descriptor.uuid)
            .await
            .map_err(|e| self.scoped(e))?;

        // Never hand out a value read across an invalidation.
        self.ensure_live()?;
        Ok(encoded)
    }

    async fn read_descriptor(
        &self,
        descriptor: &CharacteristicDescriptor,
    ) -> Result<CharacteristicValue> {
        let encoded = self.read_encoded(descriptor).await?;
        descriptor.decode(&encoded)
    }

    fn open_channel(&self, name: &str) -> Option<ReplayReceiver<CharacteristicValue>> {
        self.shared
            .channels
            .lock()
            .get(name)
            .filter(|c| !c.broadcast.is_closed())
            .map(|c| c.broadcast.subscribe())
    }

    /// Start the adapter monitor for `descriptor` and install its channel.
    async fn arm(
        &self,
        descriptor: &'static CharacteristicDescriptor,
        seed: Option<CharacteristicValue>,
    ) -> Result<ReplayReceiver<CharacteristicValue>> {
        let monitor = self
            .shared
            .adapter
            .monitor_characteristic(&self.shared.peripheral, descriptor.service, descriptor.uuid)
            .await
            .map_err(|e| self.scoped(e))?;

        let broadcast = ReplayBroadcast::seeded(seed);
        let rx = broadcast.subscribe();
        let pump = tokio::spawn(pump(broadcast.clone(), monitor, descriptor));

        let mut channels = self.shared.channels.lock();
        if !self.is_live() {
            broadcast.close(Some(Error::Disconnected));
            pump.abort();
            return Err(Error::Disconnected);
        }
        if let Some(previous) = channels.insert(descriptor.name, NotifyChannel { broadcast, pump }) {
            previous.pump.abort();
        }

        debug!("Monitoring {} on {}", descriptor.name, self.shared.peripheral);
        Ok(rx)
    }
}

/// Forward adapter notifications into the channel until the monitor ends.
async fn pump(
    broadcast: ReplayBroadcast<CharacteristicValue>,
    monitor: MonitorSubscription,
    descriptor: &'static CharacteristicDescriptor,
) {
    let MonitorSubscription { mut values, handle } = monitor;

    while let Some(item) = values.next().await {
        match item {
            Ok(encoded) => match descriptor.decode(&encoded) {
                Ok(value) => {
                    trace!("{} -> {}", descriptor.name, value);
                    broadcast.publish(value);
                }
                Err(e) => {
                    warn!("Discarding notification: {}", e);
                    broadcast.publish_error(e);
                }
            },
            Err(e) => {
                warn!("Monitor of {} failed: {}", descriptor.name, e);
                handle.cancel();
                broadcast.close(Some(e));
                return;
            }
        }
    }

    debug!("Monitor of {} ended", descriptor.name);
    handle.cancel();
    broadcast.close(Some(Error::Disconnected));
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        for (_, channel) in self.channels.get_mut().drain() {
            channel.pump.abort();
        }
    }
}

impl std::fmt::Debug for CharacteristicSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharacteristicSession")
            .field("peripheral", &self.shared.peripheral)
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{FakeAdapter, FakePeripheral};
    use crate::ble::characteristics::{INTERMEDIATE_TEMPERATURE, TEMPERATURE_TYPE};
    use crate::ble::uuids::*;

    async fn session_with(peripheral: FakePeripheral) -> (FakeAdapter, CharacteristicSession) {
        let fake = FakeAdapter::new();
        let id = peripheral.id.clone();
        let services = peripheral.services.clone();
        fake.add_peripheral(peripheral);
        fake.connect(&id, Duration::from_secs(1)).await.unwrap();

        let session = CharacteristicSession::new(Arc::new(fake.clone()), id, &services);
        session.prime(Duration::from_secs(1)).await;
        (fake, session)
    }

    fn thermometer() -> FakePeripheral {
        FakePeripheral::health_thermometer("A", Some("Shine2"))
            .with_value(TEMPERATURE_TYPE_UUID, b"2".to_vec())
            .with_value(INTERMEDIATE_TEMPERATURE_UUID, "36.6".as_bytes().to_vec())
    }

    async fn next_text(rx: &mut ReplayReceiver<CharacteristicValue>) -> String {
        let value = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no item")
            .expect("stream ended")
            .expect("stream error");
        value.as_text().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_read_decodes_ascii() {
        let (_fake, session) = session_with(thermometer()).await;
        let value = session.read(TEMPERATURE_TYPE).await.unwrap();
        assert_eq!(value.as_text(), Some("2"));
    }

    #[tokio::test]
    async fn test_read_decode_failure_is_reported() {
        let peripheral = thermometer().with_value(TEMPERATURE_TYPE_UUID, vec![0xC3, 0xA9]);
        let (_fake, session) = session_with(peripheral).await;
        let error = session.read(TEMPERATURE_TYPE).await.unwrap_err();
        assert!(matches!(error, Error::DecodeFailure { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let peripheral = thermometer().without_characteristic(MEASUREMENT_INTERVAL_UUID);
        let (_fake, session) = session_with(peripheral).await;

        assert!(matches!(
            session.write(TEMPERATURE_TYPE, b"1").await,
            Err(Error::NotSupported {
                operation: Operation::Write,
                ..
            })
        ));
        assert!(matches!(
            session.subscribe(TEMPERATURE_TYPE).await,
            Err(Error::NotSupported {
                operation: Operation::Notify,
                ..
            })
        ));
        // In the table but not exposed by this peripheral.
        assert!(matches!(
            session.read(MEASUREMENT_INTERVAL).await,
            Err(Error::NotSupported { .. })
        ));
        assert!(matches!(
            session.read("batteryLevel").await,
            Err(Error::UnknownCharacteristic { .. })
        ));
    }

    #[tokio::test]
    async fn test_subscribers_share_one_monitor() {
        let (fake, session) = session_with(thermometer()).await;
        let id = session.peripheral().clone();

        let mut a = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
        let mut b = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
        assert_eq!(fake.active_monitors(&id, INTERMEDIATE_TEMPERATURE_UUID), 1);

        // Both replay the initial read first.
        assert_eq!(next_text(&mut a).await, "36.6");
        assert_eq!(next_text(&mut b).await, "36.6");

        fake.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, "36.7".as_bytes().to_vec());
        fake.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, "36.8".as_bytes().to_vec());
        assert_eq!(next_text(&mut a).await, "36.7");
        assert_eq!(next_text(&mut a).await, "36.8");
        assert_eq!(next_text(&mut b).await, "36.7");
        assert_eq!(next_text(&mut b).await, "36.8");
    }

    #[tokio::test]
    async fn test_decode_failure_is_not_terminal() {
        let (fake, session) = session_with(thermometer()).await;
        let id = session.peripheral().clone();
        let mut rx = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "36.6");

        fake.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, vec![0xFF]);
        fake.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, "37.0".as_bytes().to_vec());

        assert!(matches!(
            rx.recv().await,
            Some(Err(Error::DecodeFailure { .. }))
        ));
        assert_eq!(next_text(&mut rx).await, "37.0");
        assert_eq!(
            session.latest(INTERMEDIATE_TEMPERATURE).unwrap().as_text(),
            Some("37.0")
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_not_terminal() {
        let (fake, session) = session_with(thermometer()).await;
        let id = session.peripheral().clone();
        let mut rx = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "36.6");

        fake.notify_encoded(
            &id,
            INTERMEDIATE_TEMPERATURE_UUID,
            EncodedValue::from_base64("not base64!"),
        );
        fake.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, "36.9".as_bytes().to_vec());

        assert!(matches!(
            rx.recv().await,
            Some(Err(Error::DecodeFailure { .. }))
        ));
        assert_eq!(next_text(&mut rx).await, "36.9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_initial_read_is_skipped() {
        let fake = FakeAdapter::new();
        let peripheral = thermometer();
        let id = peripheral.id.clone();
        let services = peripheral.services.clone();
        fake.add_peripheral(peripheral);
        fake.stall_reads(INTERMEDIATE_TEMPERATURE_UUID);
        fake.connect(&id, Duration::from_secs(1)).await.unwrap();

        let session = CharacteristicSession::new(Arc::new(fake.clone()), id.clone(), &services);
        let started = tokio::time::Instant::now();
        session.prime(Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(session.latest(INTERMEDIATE_TEMPERATURE).is_none());

        // The monitor armed before the read stalled still delivers.
        let mut rx = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
        fake.notify(&id, INTERMEDIATE_TEMPERATURE_UUID, "37.1".as_bytes().to_vec());
        assert_eq!(next_text(&mut rx).await, "37.1");
    }

    #[tokio::test]
    async fn test_monitor_error_releases_and_rearms() {
        let (fake, session) = session_with(thermometer()).await;
        let id = session.peripheral().clone();
        let mut rx = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "36.6");
        let starts = fake.monitor_start_count();

        fake.fail_monitor(
            &id,
            INTERMEDIATE_TEMPERATURE_UUID,
            Error::InvalidData {
                context: "GATT error 0x0e".to_string(),
            },
        );
        assert!(matches!(rx.recv().await, Some(Err(Error::InvalidData { .. }))));
        assert!(rx.recv().await.is_none());
        assert_eq!(fake.active_monitors(&id, INTERMEDIATE_TEMPERATURE_UUID), 0);

        let mut rx = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
        assert_eq!(fake.monitor_start_count(), starts + 1);
        assert_eq!(next_text(&mut rx).await, "36.6");
    }

    #[tokio::test]
    async fn test_invalidate_ends_subscriptions_and_rejects_operations() {
        let (_fake, session) = session_with(thermometer()).await;
        let mut rx = session.subscribe(INTERMEDIATE_TEMPERATURE).await.unwrap();
        assert_eq!(next_text(&mut rx).await, "36.6");

        session.invalidate();
        assert!(matches!(rx.recv().await, Some(Err(Error::Disconnected))));
        assert!(rx.recv().await.is_none());

        assert!(matches!(
            session.read(TEMPERATURE_TYPE).await,
            Err(Error::Disconnected)
        ));
        assert!(matches!(
            session.subscribe(INTERMEDIATE_TEMPERATURE).await,
            Err(Error::Disconnected)
        ));
        assert!(matches!(
            session.write(INTERMEDIATE_TEMPERATURE, b"1").await,
            Err(Error::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_measurement_interval_helpers() {
        let (fake, session) = session_with(
            thermometer().with_value(MEASUREMENT_INTERVAL_UUID, vec![0x3C, 0x00]),
        )
        .await;

        assert_eq!(
            session.read_measurement_interval().await.unwrap(),
            Duration::from_secs(60)
        );
        session
            .write_measurement_interval(Duration::from_secs(300))
            .await
            .unwrap();

        let writes = fake.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, MEASUREMENT_INTERVAL_UUID);
        assert_eq!(writes[0].2, vec![0x2C, 0x01]);
    }
}

//! System Bluetooth adapter via btleplug.

use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, CentralState, CharPropFlags, Characteristic, Central, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    Advertisement, AdvertisementStream, BleAdapter, CharacteristicProperties,
    DiscoveredCharacteristic, DiscoveredService, MonitorSubscription, PeripheralId, RadioState,
    ScanOptions,
};
use crate::error::{Error, Result};
use crate::handle::SubscriptionHandle;
use crate::protocol::EncodedValue;

struct ActiveScan {
    tx: mpsc::UnboundedSender<Result<Advertisement>>,
    services: Vec<Uuid>,
    options: ScanOptions,
}

/// Adapter backed by the first system Bluetooth adapter.
pub struct NativeAdapter {
    adapter: Adapter,
    peripherals: Arc<RwLock<HashMap<PeripheralId, Peripheral>>>,
    scan: Arc<Mutex<Option<ActiveScan>>>,
    radio_tx: Arc<watch::Sender<RadioState>>,
    disconnect_tx: broadcast::Sender<PeripheralId>,
    event_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NativeAdapter {
    /// Open the first system adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if no adapter is present.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(|_e| Error::RadioUnavailable)?;

        let adapters = manager.adapters().await?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::RadioUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Wrap a specific btleplug adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        // btleplug only reports state changes; an opened adapter is assumed on.
        let (radio_tx, _) = watch::channel(RadioState::PoweredOn);
        let (disconnect_tx, _) = broadcast::channel(16);

        let native = Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            scan: Arc::new(Mutex::new(None)),
            radio_tx: Arc::new(radio_tx),
            disconnect_tx,
            event_handle: Mutex::new(None),
        };

        let events = native.adapter.events().await?;
        let handle = tokio::spawn(Self::event_loop(
            events,
            native.adapter.clone(),
            native.peripherals.clone(),
            native.scan.clone(),
            native.radio_tx.clone(),
            native.disconnect_tx.clone(),
        ));
        *native.event_handle.lock() = Some(handle);

        Ok(native)
    }

    /// The underlying btleplug adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn event_loop(
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
        adapter: Adapter,
        peripherals: Arc<RwLock<HashMap<PeripheralId, Peripheral>>>,
        scan: Arc<Mutex<Option<ActiveScan>>>,
        radio_tx: Arc<watch::Sender<RadioState>>,
        disconnect_tx: broadcast::Sender<PeripheralId>,
    ) {
        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) => {
                    trace!("Device discovered: {:?}", id);
                    Self::report(&adapter, id, &peripherals, &scan, true).await;
                }
                CentralEvent::DeviceUpdated(id) => {
                    trace!("Device updated: {:?}", id);
                    Self::report(&adapter, id, &peripherals, &scan, false).await;
                }
                CentralEvent::DeviceConnected(id) => {
                    debug!("Device connected: {:?}", id);
                }
                CentralEvent::DeviceDisconnected(id) => {
                    debug!("Device disconnected: {:?}", id);
                    let _ = disconnect_tx.send(PeripheralId::new(id.to_string()));
                }
                CentralEvent::StateUpdate(state) => {
                    let state = match state {
                        CentralState::PoweredOn => RadioState::PoweredOn,
                        CentralState::PoweredOff => RadioState::PoweredOff,
                        _ => RadioState::Unknown,
                    };
                    info!("Radio state changed: {}", state);
                    radio_tx.send_replace(state);
                }
                _ => {}
            }
        }

        debug!("Adapter event loop ended");
    }

    async fn report(
        adapter: &Adapter,
        id: btleplug::platform::PeripheralId,
        peripherals: &Arc<RwLock<HashMap<PeripheralId, Peripheral>>>,
        scan: &Arc<Mutex<Option<ActiveScan>>>,
        first_sighting: bool,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let key = PeripheralId::new(id.to_string());
        peripherals.write().insert(key.clone(), peripheral);

        let advertisement = Advertisement {
            id: key,
            name: None,
            local_name: properties.local_name,
            rssi: properties.rssi,
            services: properties.services,
        };

        let mut scan = scan.lock();
        let Some(active) = scan.as_ref() else {
            return;
        };
        if !first_sighting && !active.options.allow_duplicates {
            return;
        }
        let wanted = active.services.is_empty()
            || advertisement
                .services
                .iter()
                .any(|s| active.services.contains(s));
        if wanted && active.tx.send(Ok(advertisement)).is_err() {
            *scan = None;
        }
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        if let Some(p) = self.peripherals.read().get(id) {
            return Ok(p.clone());
        }

        let found = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: id.to_string(),
            })?;

        self.peripherals.write().insert(id.clone(), found.clone());
        Ok(found)
    }

    async fn characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(id).await?;
        if !peripheral.is_connected().await? {
            return Err(Error::Disconnected);
        }

        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })?;

        Ok((peripheral, found))
    }
}

#[async_trait]
impl BleAdapter for NativeAdapter {
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
        let (tx, rx) = mpsc::unbounded_channel();
        *self.scan.lock() = Some(ActiveScan {
            tx,
            services: services.to_vec(),
            options,
        });

        let filter = ScanFilter {
            services: services.to_vec(),
        };
        if let Err(e) = self.adapter.start_scan(filter).await {
            error!("Failed to start scan: {}", e);
            *self.scan.lock() = None;
            return Err(e.into());
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        *self.scan.lock() = None;
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId, timeout: Duration) -> Result<()> {
        let p = self.peripheral(peripheral).await?;

        if p.is_connected().await.unwrap_or(false) {
            return Err(Error::DeviceAlreadyConnected {
                peripheral: peripheral.clone(),
            });
        }

        match tokio::time::timeout(timeout, p.connect()).await {
            Ok(result) => result.map_err(|e| Error::ConnectionFailed {
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout {
                operation: "connect",
                timeout,
            }),
        }
    }

    async fn cancel_connection(&self, peripheral: &PeripheralId) -> Result<()> {
        let p = match self.peripheral(peripheral).await {
            Ok(p) => p,
            Err(Error::PeripheralNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Err(e) = p.disconnect().await {
            warn!("Disconnect of {} failed: {}", peripheral, e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn discover_all(&self, peripheral: &PeripheralId) -> Result<Vec<DiscoveredService>> {
        let p = self.peripheral(peripheral).await?;

        p.discover_services()
            .await
            .map_err(|e| Error::DiscoveryFailed {
                reason: e.to_string(),
            })?;

        let services = p
            .services()
            .into_iter()
            .map(|service| DiscoveredService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| DiscoveredCharacteristic {
                        uuid: c.uuid,
                        properties: CharacteristicProperties {
                            read: c.properties.contains(CharPropFlags::READ),
                            write: c.properties.intersects(
                                CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
                            ),
                            notify: c
                                .properties
                                .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                        },
                    })
                    .collect(),
            })
            .collect();

        Ok(services)
    }

    async fn is_connected(&self, peripheral: &PeripheralId) -> Result<bool> {
        match self.peripheral(peripheral).await {
            Ok(p) => Ok(p.is_connected().await?),
            Err(Error::PeripheralNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read_characteristic(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<EncodedValue> {
        let (p, c) = self.characteristic(peripheral, service, characteristic).await?;
        let data = p.read(&c).await?;
        Ok(EncodedValue::encode(&data))
    }

    async fn write_characteristic(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: EncodedValue,
    ) -> Result<()> {
        let data = value
            .decode()
            .map_err(|reason| Error::InvalidData { context: reason })?;
        let (p, c) = self.characteristic(peripheral, service, characteristic).await?;
        p.write(&c, &data, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn monitor_characteristic(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<MonitorSubscription> {
        let (p, c) = self.characteristic(peripheral, service, characteristic).await?;

        let notifications = p.notifications().await?;
        p.subscribe(&c).await?;

        let values = notifications
            .filter(move |n| futures::future::ready(n.uuid == characteristic))
            .map(|n| Ok(EncodedValue::encode(&n.value)))
            .boxed();

        let handle = SubscriptionHandle::new(move || {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return;
            };
            runtime.spawn(async move {
                if let Err(e) = p.unsubscribe(&c).await {
                    debug!("Unsubscribe of {} failed: {}", c.uuid, e);
                }
            });
        });

        Ok(MonitorSubscription { values, handle })
    }
}

impl Drop for NativeAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.event_handle.lock().take() {
            handle.abort();
        }
    }
}

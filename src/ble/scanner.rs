//! BLE scanning functionality.
//!
//! Provides the scanner for discovering Health Thermometer peripherals.

use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::adapter::{Advertisement, AdvertisementStream, BleAdapter, PeripheralId, ScanOptions};
use crate::ble::permission::PermissionGate;
use crate::config::CentralConfig;
use crate::data::PeripheralSighting;
use crate::error::{Error, Result};
use crate::handle::SubscriptionHandle;

/// Dedup and coalescing policy for advertisements.
///
/// Keeps the most recent sighting per peripheral. A peripheral is emitted
/// when first seen and again on the first advertisement after its refresh
/// window has elapsed; advertisements inside the window replace the stored
/// copy without restarting the window.
#[derive(Debug, Clone)]
pub struct SightingTracker {
    refresh_interval: Duration,
    entries: HashMap<PeripheralId, Tracked>,
}

#[derive(Debug, Clone)]
struct Tracked {
    sighting: PeripheralSighting,
    window_started: Instant,
}

impl SightingTracker {
    /// Create a tracker with the given refresh window.
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            entries: HashMap::new(),
        }
    }

    /// Record an advertisement received at `now`.
    ///
    /// Returns the sighting if it should be emitted. Anonymous advertisements
    /// are dropped and never retained.
    pub fn observe(
        &mut self,
        advertisement: Advertisement,
        now: Instant,
        seen_at: DateTime<Utc>,
    ) -> Option<PeripheralSighting> {
        let sighting = PeripheralSighting::from_advertisement(advertisement, seen_at)?;

        match self.entries.get_mut(&sighting.id) {
            Some(tracked)
                if now.saturating_duration_since(tracked.window_started)
                    < self.refresh_interval =>
            {
                trace!("Coalescing advertisement for {}", sighting.id);
                tracked.sighting = sighting;
                None
            }
            _ => {
                self.entries.insert(
                    sighting.id.clone(),
                    Tracked {
                        sighting: sighting.clone(),
                        window_started: now,
                    },
                );
                Some(sighting)
            }
        }
    }

    /// The retained sighting for a peripheral.
    pub fn get(&self, id: &PeripheralId) -> Option<&PeripheralSighting> {
        self.entries.get(id).map(|t| &t.sighting)
    }

    /// All retained sightings.
    pub fn sightings(&self) -> HashMap<PeripheralId, PeripheralSighting> {
        self.entries
            .iter()
            .map(|(id, t)| (id.clone(), t.sighting.clone()))
            .collect()
    }

    /// Number of retained sightings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Event emitted by the scanner.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A new or refreshed sighting.
    Sighting(PeripheralSighting),
    /// The adapter reported an error; the scan has ended.
    Failed(Error),
}

type SightingCallback = Arc<dyn Fn(Result<PeripheralSighting>) + Send + Sync>;

struct ScanShared {
    adapter: Arc<dyn BleAdapter>,
    gate: Arc<PermissionGate>,
    tracker: Mutex<SightingTracker>,
    event_tx: broadcast::Sender<ScanEvent>,
    callbacks: RwLock<HashMap<u64, SightingCallback>>,
    next_callback_id: AtomicU64,
    is_scanning: AtomicBool,
    generation: AtomicU64,
}

/// BLE scanner for discovering Health Thermometer peripherals.
pub struct Scanner {
    shared: Arc<ScanShared>,
    config: CentralConfig,
    /// Handle to the scanning task.
    scan_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Serialises start and stop.
    control: tokio::sync::Mutex<()>,
}

impl Scanner {
    /// Create a scanner. Scans only start once `gate` is ready.
    pub fn new(adapter: Arc<dyn BleAdapter>, gate: Arc<PermissionGate>, config: CentralConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));

        Self {
            shared: Arc::new(ScanShared {
                adapter,
                gate,
                tracker: Mutex::new(SightingTracker::new(config.sighting_refresh_interval)),
                event_tx,
                callbacks: RwLock::new(HashMap::new()),
                next_callback_id: AtomicU64::new(1),
                is_scanning: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
            config,
            scan_handle: Mutex::new(None),
            control: tokio::sync::Mutex::new(()),
        }
    }

    /// Start scanning with the configured filter and options.
    ///
    /// Waits for the permission gate. Does nothing if already scanning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if the platform cannot do BLE, or
    /// the adapter's error if the scan cannot be started.
    pub async fn start_scanning(&self) -> Result<()> {
        let options = ScanOptions {
            allow_duplicates: self.config.allow_duplicate_advertisements,
        };
        let filter = self.config.service_filter.clone();
        self.start_with(&filter, options, false).await
    }

    /// Register `on_sighting` and (re)start a scan for `service_filter`.
    ///
    /// A scan already running is restarted with the new filter. Dropping or
    /// cancelling the returned handle unregisters the callback but leaves the
    /// scan running.
    pub async fn scan<F>(
        &self,
        service_filter: &[Uuid],
        allow_duplicate_advertisements: bool,
        on_sighting: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(Result<PeripheralSighting>) + Send + Sync + 'static,
    {
        let handle = self.on_sighting(on_sighting);
        let options = ScanOptions {
            allow_duplicates: allow_duplicate_advertisements,
        };
        self.start_with(service_filter, options, true).await?;
        Ok(handle)
    }

    async fn start_with(&self, filter: &[Uuid], options: ScanOptions, restart: bool) -> Result<()> {
        let _control = self.control.lock().await;

        if self.is_scanning() {
            if !restart {
                debug!("Already scanning, ignoring start request");
                return Ok(());
            }
            self.stop_locked().await?;
        }

        self.shared.gate.await_ready().await?;

        info!(
            "Starting BLE scan ({} service filters, duplicates: {})",
            filter.len(),
            options.allow_duplicates
        );

        let stream = self.shared.adapter.start_scan(filter, options).await.map_err(|e| {
            error!("Failed to start scan: {}", e);
            self.shared.gate.report_adapter_error(&e);
            e
        })?;

        self.shared.tracker.lock().clear();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.is_scanning.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(Self::run(self.shared.clone(), stream, generation));
        *self.scan_handle.lock() = Some(handle);

        Ok(())
    }

    /// Stop scanning. Does nothing if no scan is running.
    pub async fn stop_scanning(&self) -> Result<()> {
        let _control = self.control.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<()> {
        if let Some(handle) = self.scan_handle.lock().take() {
            handle.abort();
        }

        if !self.shared.is_scanning.swap(false, Ordering::SeqCst) {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.adapter.stop_scan().await
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.shared.is_scanning.load(Ordering::SeqCst)
    }

    /// Register a callback for sightings and scan failures.
    pub fn on_sighting<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(Result<PeripheralSighting>) + Send + Sync + 'static,
    {
        let id = self.shared.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.shared.callbacks.write().insert(id, Arc::new(callback));

        let shared = Arc::downgrade(&self.shared);
        SubscriptionHandle::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.callbacks.write().remove(&id);
            }
        })
    }

    /// Subscribe to scan events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.shared.event_tx.subscribe()
    }

    /// All sightings retained by the current or last scan.
    pub fn sightings(&self) -> HashMap<PeripheralId, PeripheralSighting> {
        self.shared.tracker.lock().sightings()
    }

    /// The retained sighting for one peripheral.
    pub fn sighting(&self, id: &PeripheralId) -> Option<PeripheralSighting> {
        self.shared.tracker.lock().get(id).cloned()
    }

    async fn run(shared: Arc<ScanShared>, mut stream: AdvertisementStream, generation: u64) {
        while let Some(item) = stream.next().await {
            match item {
                Ok(advertisement) => {
                    let sighting =
                        shared
                            .tracker
                            .lock()
                            .observe(advertisement, Instant::now(), Utc::now());
                    if let Some(sighting) = sighting {
                        debug!("Sighting: {} ({})", sighting.display_name, sighting.id);
                        shared.emit(Ok(sighting));
                    }
                }
                Err(e) => {
                    error!("Scan failed: {}", e);
                    shared.gate.report_adapter_error(&e);
                    if shared.finish(generation) {
                        if let Err(stop_error) = shared.adapter.stop_scan().await {
                            debug!("Stop after scan failure failed: {}", stop_error);
                        }
                        shared.emit(Err(e));
                    }
                    return;
                }
            }
        }

        debug!("Scan event loop ended");
        shared.finish(generation);
    }
}

impl ScanShared {
    /// Mark the scan of `generation` as ended. Returns `false` if a newer scan
    /// has taken over.
    fn finish(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.is_scanning.store(false, Ordering::SeqCst);
        true
    }

    fn emit(&self, item: Result<PeripheralSighting>) {
        let event = match &item {
            Ok(sighting) => ScanEvent::Sighting(sighting.clone()),
            Err(e) => ScanEvent::Failed(e.clone()),
        };
        let _ = self.event_tx.send(event);

        let callbacks: Vec<SightingCallback> = self.callbacks.read().values().cloned().collect();
        for callback in callbacks {
            callback(item.clone());
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_handle.lock().take() {
            handle.abort();
        }
    }
}

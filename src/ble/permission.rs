//! Permission and radio-state gate.
//!
//! Radio operations are only attempted once the platform reports the radio
//! as powered on. While it is not, the gate drives remediation (permission
//! prompts, radio enable requests) each time the radio state moves into a
//! state that needs it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::adapter::{BleAdapter, RadioState};
use crate::error::{Error, Result};

/// Platform permission and radio primitives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionPlatform: Send + Sync {
    /// Prompt for the permissions BLE needs. Returns whether they were granted.
    async fn request_permission(&self) -> Result<bool>;

    /// Ask the platform to power the radio on.
    async fn request_radio_enable(&self) -> Result<()>;
}

/// Platforms without runtime BLE permission prompts (desktop).
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantedPermissions;

#[async_trait]
impl PermissionPlatform for GrantedPermissions {
    async fn request_permission(&self) -> Result<bool> {
        Ok(true)
    }

    async fn request_radio_enable(&self) -> Result<()> {
        warn!("Bluetooth is powered off; enable it in the system settings");
        Ok(())
    }
}

/// Observable state of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    /// Waiting on a radio state that needs no remediation.
    Pending(RadioState),
    /// A permission prompt is outstanding or about to be issued.
    AwaitingPermission,
    /// The user declined the permission prompt; waiting for them to change it.
    PermissionDenied,
    /// Waiting for the radio to be powered on.
    AwaitingRadio,
    /// Radio operations are allowed.
    Ready,
    /// This device cannot participate in BLE.
    Unsupported,
}

impl GateStatus {
    /// Whether the gate can never open.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unsupported)
    }
}

struct GateShared {
    platform: Arc<dyn PermissionPlatform>,
    status_tx: watch::Sender<GateStatus>,
    permission_in_flight: AtomicBool,
}

/// Resolves once the radio is usable.
pub struct PermissionGate {
    shared: Arc<GateShared>,
    radio: watch::Receiver<RadioState>,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PermissionGate {
    /// Create a gate fed by the adapter's radio state.
    pub fn new(adapter: &dyn BleAdapter, platform: Arc<dyn PermissionPlatform>) -> Self {
        let (status_tx, _) = watch::channel(GateStatus::Pending(RadioState::Unknown));

        Self {
            shared: Arc::new(GateShared {
                platform,
                status_tx,
                permission_in_flight: AtomicBool::new(false),
            }),
            radio: adapter.radio_state(),
            driver: Mutex::new(None),
        }
    }

    /// Current gate status.
    pub fn status(&self) -> GateStatus {
        *self.shared.status_tx.borrow()
    }

    /// Watch gate status changes.
    pub fn watch_status(&self) -> watch::Receiver<GateStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Wait until the radio is powered on.
    ///
    /// Stays pending while the user or platform still has to act.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RadioUnavailable`] if the platform does not support
    /// BLE.
    pub async fn await_ready(&self) -> Result<()> {
        self.start();

        let mut status = self.shared.status_tx.subscribe();
        loop {
            match *status.borrow_and_update() {
                GateStatus::Ready => return Ok(()),
                GateStatus::Unsupported => return Err(Error::RadioUnavailable),
                _ => {}
            }
            status
                .changed()
                .await
                .map_err(|_| Error::Internal("permission gate dropped".to_string()))?;
        }
    }

    /// Start following the radio state. Called implicitly by `await_ready`.
    pub fn start(&self) {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let radio = self.radio.clone();
        *driver = Some(tokio::spawn(Self::drive(shared, radio)));
    }

    /// Feed back an error an adapter operation reported. Authorization
    /// failures trigger a permission request.
    pub fn report_adapter_error(&self, error: &Error) {
        if matches!(error, Error::PermissionDenied) {
            debug!("Adapter reported missing permission");
            self.shared.request_permission();
        }
    }

    /// Stop following the radio state.
    pub fn shutdown(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
    }

    async fn drive(shared: Arc<GateShared>, mut radio: watch::Receiver<RadioState>) {
        let mut previous = None;

        loop {
            let state = *radio.borrow_and_update();
            if previous != Some(state) {
                debug!("Radio state: {:?} -> {}", previous, state);
                shared.transition(state);
                previous = Some(state);
            }

            if radio.changed().await.is_err() {
                debug!("Radio state stream closed");
                break;
            }
        }
    }
}

impl GateShared {
    fn set_status(&self, status: GateStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn transition(self: &Arc<Self>, state: RadioState) {
        match state {
            RadioState::PoweredOn => {
                info!("Bluetooth radio powered on");
                self.set_status(GateStatus::Ready);
            }
            RadioState::Unsupported => {
                error!("The platform does not support Bluetooth Low Energy");
                self.set_status(GateStatus::Unsupported);
            }
            RadioState::PoweredOff => {
                warn!("Bluetooth is currently powered off");
                self.set_status(GateStatus::AwaitingRadio);
                self.request_radio_enable();
            }
            RadioState::Unauthorized => {
                warn!("Bluetooth use is not authorized");
                self.set_status(GateStatus::AwaitingPermission);
                self.request_permission();
            }
            RadioState::Resetting | RadioState::Unknown => {
                self.set_status(GateStatus::Pending(state));
            }
        }
    }

    fn request_radio_enable(self: &Arc<Self>) {
        let shared = self.clone();
        tokio::spawn(async move {
            match shared.platform.request_radio_enable().await {
                Ok(()) => debug!("Radio enable requested"),
                Err(Error::PermissionDenied) => {
                    warn!("No granted permissions allow enabling Bluetooth");
                    shared.request_permission();
                }
                Err(e) => warn!("Failed to request radio enable: {}", e),
            }
        });
    }

    /// Issue a permission prompt unless one is already outstanding.
    fn request_permission(self: &Arc<Self>) {
        if self
            .permission_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Permission request already outstanding");
            return;
        }

        let shared = self.clone();
        tokio::spawn(async move {
            let result = shared.platform.request_permission().await;
            shared.permission_in_flight.store(false, Ordering::SeqCst);

            match result {
                Ok(true) => info!("Bluetooth permission granted"),
                Ok(false) => {
                    warn!("Bluetooth permission has not been granted");
                    shared.mark_denied();
                }
                Err(e) => {
                    warn!("Permission request failed: {}", e);
                    shared.mark_denied();
                }
            }
        });
    }

    fn mark_denied(&self) {
        self.status_tx.send_if_modified(|current| {
            if *current == GateStatus::AwaitingPermission {
                *current = GateStatus::PermissionDenied;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for PermissionGate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::FakeAdapter;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Platform whose permission prompt stays open until released.
    struct HeldPermissions {
        requests: AtomicUsize,
        enables: AtomicUsize,
        release: Semaphore,
        grant: bool,
    }

    impl HeldPermissions {
        fn new(grant: bool) -> Arc<Self> {
            Arc::new(Self {
                requests: AtomicUsize::new(0),
                enables: AtomicUsize::new(0),
                release: Semaphore::new(0),
                grant,
            })
        }
    }

    #[async_trait]
    impl PermissionPlatform for HeldPermissions {
        async fn request_permission(&self) -> Result<bool> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let permit = self.release.acquire().await.expect("semaphore closed");
            permit.forget();
            Ok(self.grant)
        }

        async fn request_radio_enable(&self) -> Result<()> {
            self.enables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_resolves_when_powered_on() {
        let adapter = FakeAdapter::with_radio_state(RadioState::PoweredOff);
        let platform = HeldPermissions::new(true);
        let gate = Arc::new(PermissionGate::new(&adapter, platform.clone()));

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.await_ready().await }
        });

        settle().await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.status(), GateStatus::AwaitingRadio);
        assert_eq!(platform.enables.load(Ordering::SeqCst), 1);

        adapter.set_radio_state(RadioState::PoweredOn);
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(gate.status(), GateStatus::Ready);
    }

    #[tokio::test]
    async fn test_unsupported_is_terminal() {
        let adapter = FakeAdapter::with_radio_state(RadioState::Unsupported);
        let mut platform = MockPermissionPlatform::new();
        platform.expect_request_permission().never();
        platform.expect_request_radio_enable().never();
        let gate = PermissionGate::new(&adapter, Arc::new(platform));

        let result = tokio::time::timeout(Duration::from_secs(1), gate.await_ready())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::RadioUnavailable)));
        assert!(gate.status().is_terminal());
    }

    #[tokio::test]
    async fn test_permission_request_is_not_reentrant() {
        let adapter = FakeAdapter::with_radio_state(RadioState::Unauthorized);
        let platform = HeldPermissions::new(true);
        let gate = PermissionGate::new(&adapter, platform.clone());
        gate.start();
        settle().await;
        assert_eq!(platform.requests.load(Ordering::SeqCst), 1);

        // Leave and re-enter Unauthorized while the first prompt is open.
        adapter.set_radio_state(RadioState::Unknown);
        settle().await;
        adapter.set_radio_state(RadioState::Unauthorized);
        settle().await;
        gate.report_adapter_error(&Error::PermissionDenied);
        settle().await;
        assert_eq!(platform.requests.load(Ordering::SeqCst), 1);

        // Once answered, a new transition may prompt again.
        platform.release.add_permits(1);
        settle().await;
        adapter.set_radio_state(RadioState::Unknown);
        settle().await;
        adapter.set_radio_state(RadioState::Unauthorized);
        settle().await;
        assert_eq!(platform.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_denied_permission_is_distinguishable() {
        let adapter = FakeAdapter::with_radio_state(RadioState::Unauthorized);
        let platform = HeldPermissions::new(false);
        let gate = PermissionGate::new(&adapter, platform.clone());
        gate.start();
        settle().await;
        assert_eq!(gate.status(), GateStatus::AwaitingPermission);

        platform.release.add_permits(1);
        settle().await;
        assert_eq!(gate.status(), GateStatus::PermissionDenied);
        assert!(!gate.status().is_terminal());
    }

    #[tokio::test]
    async fn test_stays_pending_while_resetting() {
        let adapter = FakeAdapter::with_radio_state(RadioState::Resetting);
        let mut platform = MockPermissionPlatform::new();
        platform.expect_request_permission().never();
        platform.expect_request_radio_enable().never();
        let gate = PermissionGate::new(&adapter, Arc::new(platform));

        let mut ready = tokio_test::task::spawn(gate.await_ready());
        tokio_test::assert_pending!(ready.poll());
        settle().await;
        assert_eq!(gate.status(), GateStatus::Pending(RadioState::Resetting));
        tokio_test::assert_pending!(ready.poll());

        adapter.set_radio_state(RadioState::PoweredOn);
        settle().await;
        assert!(ready.is_woken());
        tokio_test::assert_ready_ok!(ready.poll());
    }

    #[tokio::test]
    async fn test_granted_permissions_platform() {
        let platform = GrantedPermissions;
        assert!(platform.request_permission().await.unwrap());
        assert!(platform.request_radio_enable().await.is_ok());
    }
}

//! Process-wide device manager.
//!
//! The shared manager is created on first use and torn down explicitly with
//! [`shutdown`], typically when the application exits.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::device_manager::DeviceManager;
use crate::error::{Error, Result};

static SHARED: Mutex<Option<Arc<DeviceManager>>> = Mutex::const_new(None);

/// The shared manager, creating one over the system adapter on first use.
///
/// # Errors
///
/// Returns an error if the system adapter cannot be opened.
pub async fn shared() -> Result<Arc<DeviceManager>> {
    let mut slot = SHARED.lock().await;
    if let Some(manager) = slot.as_ref() {
        return Ok(manager.clone());
    }

    info!("Initialising shared device manager");
    let manager = Arc::new(DeviceManager::new().await?);
    *slot = Some(manager.clone());
    Ok(manager)
}

/// Install `manager` as the shared manager.
///
/// # Errors
///
/// Returns [`Error::Internal`] if a shared manager already exists; call
/// [`shutdown`] first to replace it.
pub async fn init_with(manager: DeviceManager) -> Result<Arc<DeviceManager>> {
    let mut slot = SHARED.lock().await;
    if slot.is_some() {
        return Err(Error::Internal(
            "shared device manager already initialised".to_string(),
        ));
    }

    let manager = Arc::new(manager);
    *slot = Some(manager.clone());
    Ok(manager)
}

/// Whether a shared manager exists.
pub async fn is_initialized() -> bool {
    SHARED.lock().await.is_some()
}

/// Shut down and release the shared manager. Does nothing if none exists.
pub async fn shutdown() -> Result<()> {
    let manager = SHARED.lock().await.take();
    match manager {
        Some(manager) => manager.shutdown().await,
        None => {
            debug!("No shared device manager to shut down");
            Ok(())
        }
    }
}

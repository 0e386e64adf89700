//! Central configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::HEALTH_THERMOMETER_SERVICE_UUID;
use crate::error::{Error, Result};

/// Default bound on a connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on service and characteristic discovery.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default window during which repeat advertisements of a peripheral are
/// absorbed instead of re-emitted.
pub const DEFAULT_SIGHTING_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Tunables for scanning and connecting.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CentralConfig {
    /// Bound on the connect phase.
    pub connect_timeout: Duration,
    /// Bound on the discovery phase.
    pub discovery_timeout: Duration,
    /// Dedup window for sightings.
    pub sighting_refresh_interval: Duration,
    /// Services to scan for. Empty means every advertising peripheral.
    pub service_filter: Vec<Uuid>,
    /// Ask the platform to report repeat advertisements.
    pub allow_duplicate_advertisements: bool,
    /// Force-disconnect and retry once when the adapter claims a link this
    /// crate has no record of.
    pub recover_stale_connections: bool,
    /// Capacity of the scan and connection event channels.
    pub event_channel_capacity: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            sighting_refresh_interval: DEFAULT_SIGHTING_REFRESH_INTERVAL,
            service_filter: vec![HEALTH_THERMOMETER_SERVICE_UUID],
            allow_duplicate_advertisements: true,
            recover_stale_connections: true,
            event_channel_capacity: 32,
        }
    }
}

impl CentralConfig {
    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the sighting dedup window.
    pub fn with_sighting_refresh_interval(mut self, interval: Duration) -> Self {
        self.sighting_refresh_interval = interval;
        self
    }

    /// Set the scan service filter.
    pub fn with_service_filter(mut self, services: Vec<Uuid>) -> Self {
        self.service_filter = services;
        self
    }

    /// Enable or disable stale-connection recovery.
    pub fn with_stale_connection_recovery(mut self, enabled: bool) -> Self {
        self.recover_stale_connections = enabled;
        self
    }

    /// Check the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("connect_timeout", self.connect_timeout),
            ("discovery_timeout", self.discovery_timeout),
            ("sighting_refresh_interval", self.sighting_refresh_interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(Error::InvalidParameter {
                    name: name.to_string(),
                    value: format!("{:?}", value),
                });
            }
        }

        if self.event_channel_capacity == 0 {
            return Err(Error::InvalidParameter {
                name: "event_channel_capacity".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}

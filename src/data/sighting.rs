//! Peripheral sighting data structures.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::adapter::{Advertisement, PeripheralId};

/// A named peripheral seen while scanning.
///
/// Anonymous advertisements never become sightings, so `display_name` is
/// always non-empty.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralSighting {
    /// Platform identifier of the peripheral. Stable while the OS runs, not
    /// guaranteed across reboots.
    pub id: PeripheralId,
    /// Broadcast name, or the local name when no broadcast name is present.
    pub display_name: String,
    /// When the most recent advertisement for this peripheral arrived.
    pub last_seen_at: DateTime<Utc>,
    /// Signal strength of the most recent advertisement, in dBm.
    pub rssi: Option<i16>,
    /// Service UUIDs listed in the most recent advertisement.
    pub services: Vec<Uuid>,
}

impl PeripheralSighting {
    /// Build a sighting from an advertisement.
    ///
    /// Returns `None` for anonymous advertisements (no non-empty name and no
    /// non-empty local name).
    pub fn from_advertisement(advertisement: Advertisement, seen_at: DateTime<Utc>) -> Option<Self> {
        let display_name = advertisement.display_name()?.to_string();

        Some(Self {
            id: advertisement.id,
            display_name,
            last_seen_at: seen_at,
            rssi: advertisement.rssi,
            services: advertisement.services,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement(name: Option<&str>, local_name: Option<&str>) -> Advertisement {
        Advertisement {
            id: PeripheralId::from("A"),
            name: name.map(str::to_string),
            local_name: local_name.map(str::to_string),
            rssi: Some(-60),
            services: vec![],
        }
    }

    #[test]
    fn test_anonymous_advertisement_is_dropped() {
        let now = Utc::now();
        assert!(PeripheralSighting::from_advertisement(advertisement(None, None), now).is_none());
        assert!(
            PeripheralSighting::from_advertisement(advertisement(Some(""), Some("")), now)
                .is_none()
        );
    }

    #[test]
    fn test_display_name_prefers_broadcast_name() {
        let now = Utc::now();
        let sighting =
            PeripheralSighting::from_advertisement(advertisement(Some("Shine2"), Some("S2")), now)
                .unwrap();
        assert_eq!(sighting.display_name, "Shine2");

        let sighting =
            PeripheralSighting::from_advertisement(advertisement(Some(""), Some("S2")), now)
                .unwrap();
        assert_eq!(sighting.display_name, "S2");
        assert_eq!(sighting.rssi, Some(-60));
        assert_eq!(sighting.last_seen_at, now);
    }
}

use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

use crate::PEBBLE_MANUFACTURER_ID;

/// Connection state of the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WatcherState {
    /// Switched off
    #[default]
    Off,
    /// Transition from off, waiting for the radio to report readiness
    Unknown,
    /// Unauthorized to use Bluetooth, or Bluetooth Low Energy is unsupported
    Error,
    /// Radio is powered off or not scanning yet
    Idle,
    /// Scanning for the wearable
    Searching,
    /// Connecting to a found wearable
    Connecting,
    /// Linked to the wearable
    Connected,
}

impl WatcherState {
    /// Whether a session is running in this state
    ///
    /// `Off` and `Error` are the only states in which the watcher issues no
    /// further radio requests on its own.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Off | Self::Error)
    }
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "Off"),
            Self::Unknown => write!(f, "Unknown"),
            Self::Error => write!(f, "Error"),
            Self::Idle => write!(f, "Idle"),
            Self::Searching => write!(f, "Searching"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Reason the watcher is in [`WatcherState::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WatcherError {
    /// No error
    #[default]
    Okay,
    /// Not authorized to use Bluetooth
    Unauthorized,
    /// Device does not support Bluetooth Low Energy
    Unsupported,
}

impl fmt::Display for WatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Okay => write!(f, "Okay"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::Unsupported => write!(f, "Unsupported"),
        }
    }
}

/// Received signal strength in dBm
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rssi(pub i16);

impl Rssi {
    /// Signal strength in dBm
    #[must_use]
    pub const fn dbm(self) -> i16 {
        self.0
    }
}

impl From<i16> for Rssi {
    fn from(value: i16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Rssi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dBm", self.0)
    }
}

/// A wearable found while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Bluetooth address of the peripheral
    pub address: BDAddr,
    /// Advertised local name
    pub name: Option<String>,
    /// Signal strength at discovery
    pub rssi: Option<Rssi>,
}

impl Target {
    /// Create a new target
    #[must_use]
    pub const fn new(address: BDAddr, name: Option<String>) -> Self {
        Self {
            address,
            name,
            rssi: None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Advertisement data a [`TargetFilter`] is matched against
#[derive(Debug, Clone, Default)]
pub struct Advertisement<'a> {
    /// Peripheral address
    pub address: Option<BDAddr>,
    /// Advertised local name
    pub local_name: Option<&'a str>,
    /// Advertised service UUIDs
    pub services: &'a [Uuid],
    /// Company identifiers present in the manufacturer data
    pub manufacturer_ids: &'a [u16],
}

/// Decides which advertisements belong to the watched wearable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFilter {
    /// Local name prefix, compared case-insensitively
    pub name_prefix: Option<String>,
    /// Manufacturer (company) identifier in the advertisement
    pub manufacturer_id: Option<u16>,
    /// Service UUIDs, any of which identifies the wearable
    pub services: Vec<Uuid>,
    /// Only accept this address
    pub address: Option<BDAddr>,
}

impl TargetFilter {
    /// Check whether an advertisement matches this filter
    ///
    /// A pinned address must always match. Beyond that, any one positive
    /// criterion (name prefix, manufacturer id, service) is enough; a filter
    /// with no criteria besides the address accepts that address alone.
    #[must_use]
    pub fn matches(&self, advertisement: &Advertisement<'_>) -> bool {
        if let Some(pinned) = self.address {
            if advertisement.address != Some(pinned) {
                return false;
            }
            if self.name_prefix.is_none()
                && self.manufacturer_id.is_none()
                && self.services.is_empty()
            {
                return true;
            }
        }

        let name_match = match (&self.name_prefix, advertisement.local_name) {
            (Some(prefix), Some(name)) => name
                .to_lowercase()
                .starts_with(&prefix.to_lowercase()),
            _ => false,
        };

        let manufacturer_match = self
            .manufacturer_id
            .is_some_and(|id| advertisement.manufacturer_ids.contains(&id));

        let service_match = self
            .services
            .iter()
            .any(|uuid| advertisement.services.contains(uuid));

        name_match || manufacturer_match || service_match
    }
}

impl Default for TargetFilter {
    fn default() -> Self {
        Self {
            name_prefix: Some("Pebble".to_string()),
            manufacturer_id: Some(PEBBLE_MANUFACTURER_ID),
            services: Vec::new(),
            address: None,
        }
    }
}

/// What the watcher does when the radio withdraws authorization mid-session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RevocationPolicy {
    /// Report [`WatcherState::Error`] and wait for stop/start
    #[default]
    Error,
    /// Deactivate the radio and settle in [`WatcherState::Off`]
    Shutdown,
}

/// Watcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Which wearable to watch
    pub target: TargetFilter,
    /// Connection timeout in milliseconds, `None` to rely on the radio stack
    pub connect_timeout_ms: Option<u64>,
    /// Delay before a failed scan request is retried, in milliseconds
    pub scan_retry_delay_ms: u64,
    /// Interval between signal strength samples while connected, in milliseconds
    pub rssi_interval_ms: u64,
    /// Reaction to authorization being revoked during a session
    pub revocation: RevocationPolicy,
}

impl WatcherConfig {
    /// Connection timeout as a duration
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Scan retry delay as a duration
    #[must_use]
    pub const fn scan_retry_delay(&self) -> Duration {
        Duration::from_millis(self.scan_retry_delay_ms)
    }

    /// Signal strength sample interval as a duration
    #[must_use]
    pub const fn rssi_interval(&self) -> Duration {
        Duration::from_millis(self.rssi_interval_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            target: TargetFilter::default(),
            connect_timeout_ms: Some(30_000),
            scan_retry_delay_ms: 2_000,
            rssi_interval_ms: 1_000,
            revocation: RevocationPolicy::Error,
        }
    }
}

/// State, error and signal strength observed together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatcherSnapshot {
    /// Current state
    pub state: WatcherState,
    /// Current error, `Okay` unless `state` is `Error`
    pub error: WatcherError,
    /// Latest sample, `None` unless `state` is `Connected`
    pub signal_strength: Option<Rssi>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> BDAddr {
        BDAddr::from([0x00, 0x17, 0xE9, 0x12, 0x34, 0x56])
    }

    #[test]
    fn test_default_filter_matches_pebble_name() {
        let filter = TargetFilter::default();
        let advertisement = Advertisement {
            local_name: Some("Pebble Time 3A4F"),
            ..Default::default()
        };
        assert!(filter.matches(&advertisement));

        let advertisement = Advertisement {
            local_name: Some("pebble 1a2b"),
            ..Default::default()
        };
        assert!(filter.matches(&advertisement));

        let advertisement = Advertisement {
            local_name: Some("Fitbit Charge"),
            ..Default::default()
        };
        assert!(!filter.matches(&advertisement));
    }

    #[test]
    fn test_filter_matches_manufacturer_and_service() {
        let service = Uuid::from_u128(0x0000_fed9_0000_1000_8000_0080_5f9b_34fb);
        let filter = TargetFilter {
            name_prefix: None,
            manufacturer_id: Some(PEBBLE_MANUFACTURER_ID),
            services: vec![service],
            address: None,
        };

        let by_manufacturer = Advertisement {
            manufacturer_ids: &[0x004C, PEBBLE_MANUFACTURER_ID],
            ..Default::default()
        };
        assert!(filter.matches(&by_manufacturer));

        let services = [service];
        let by_service = Advertisement {
            services: &services,
            ..Default::default()
        };
        assert!(filter.matches(&by_service));

        assert!(!filter.matches(&Advertisement::default()));
    }

    #[test]
    fn test_filter_pinned_address() {
        let pinned = TargetFilter {
            address: Some(address()),
            ..Default::default()
        };

        let other = Advertisement {
            address: Some(BDAddr::from([1, 2, 3, 4, 5, 6])),
            local_name: Some("Pebble 0000"),
            ..Default::default()
        };
        assert!(!pinned.matches(&other));

        let same = Advertisement {
            address: Some(address()),
            local_name: Some("Pebble 3456"),
            ..Default::default()
        };
        assert!(pinned.matches(&same));

        let address_only = TargetFilter {
            name_prefix: None,
            manufacturer_id: None,
            services: Vec::new(),
            address: Some(address()),
        };
        let unnamed = Advertisement {
            address: Some(address()),
            ..Default::default()
        };
        assert!(address_only.matches(&unnamed));
    }

    #[test]
    fn test_watcher_config_defaults() {
        let config = WatcherConfig::default();
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.scan_retry_delay(), Duration::from_secs(2));
        assert_eq!(config.rssi_interval(), Duration::from_secs(1));
        assert_eq!(config.revocation, RevocationPolicy::Error);
        assert_eq!(config.target.name_prefix.as_deref(), Some("Pebble"));
    }

    #[test]
    fn test_state_activity() {
        assert!(!WatcherState::Off.is_active());
        assert!(!WatcherState::Error.is_active());
        assert!(WatcherState::Unknown.is_active());
        assert!(WatcherState::Connected.is_active());
        assert_eq!(WatcherState::default(), WatcherState::Off);
        assert_eq!(WatcherError::default(), WatcherError::Okay);
    }

    #[test]
    fn test_rssi_display() {
        assert_eq!(Rssi(-67).to_string(), "-67 dBm");
        assert_eq!(Rssi::from(-40).dbm(), -40);
    }
}

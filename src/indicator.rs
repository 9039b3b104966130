use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::WatcherState;

/// Coarse status shown to the user, e.g. as an application badge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicatorStatus {
    /// Watching is switched off or impossible
    Disabled,
    /// Watching, but not linked with the wearable
    Disconnected,
    /// Linked with the wearable
    Connected,
}

impl IndicatorStatus {
    /// Badge number for this status
    #[must_use]
    pub const fn badge_number(self) -> u8 {
        match self {
            Self::Disabled => 2,
            Self::Disconnected => 1,
            Self::Connected => 0,
        }
    }
}

impl From<WatcherState> for IndicatorStatus {
    fn from(state: WatcherState) -> Self {
        match state {
            WatcherState::Off | WatcherState::Error => Self::Disabled,
            WatcherState::Unknown
            | WatcherState::Idle
            | WatcherState::Searching
            | WatcherState::Connecting => Self::Disconnected,
            WatcherState::Connected => Self::Connected,
        }
    }
}

impl fmt::Display for IndicatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_badge_numbers() {
        let badges = [
            (WatcherState::Off, 2),
            (WatcherState::Error, 2),
            (WatcherState::Unknown, 1),
            (WatcherState::Idle, 1),
            (WatcherState::Searching, 1),
            (WatcherState::Connecting, 1),
            (WatcherState::Connected, 0),
        ];

        for (state, badge) in badges {
            assert_eq!(IndicatorStatus::from(state).badge_number(), badge, "{state}");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(IndicatorStatus::from(WatcherState::Connected).to_string(), "Connected");
        assert_eq!(IndicatorStatus::Disabled.to_string(), "Disabled");
    }
}

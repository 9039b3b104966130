use thiserror::Error;

use crate::types::WatcherError;

/// Errors that can occur while watching a Bluetooth Low Energy wearable
#[derive(Error, Debug)]
pub enum LeashError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The application is not allowed to use the radio
    #[error("Not authorized to use Bluetooth")]
    Unauthorized,

    /// The platform or adapter cannot do Bluetooth Low Energy
    #[error("Bluetooth Low Energy is not supported: {0}")]
    Unsupported(String),

    /// No Bluetooth adapter is present
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// The radio has no peripheral for the requested target
    #[error("Unknown target: {0}")]
    TargetUnknown(String),

    /// Connecting to the target failed
    #[error("Failed to connect to target: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The radio has not been activated
    #[error("Radio is not active")]
    NotActive,

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for watcher operations
pub type Result<T> = std::result::Result<T, LeashError>;

impl LeashError {
    /// The watcher error this failure implies, if it is terminal for a session
    ///
    /// Authorization and support failures end the current activation; every
    /// other failure is treated as transient.
    #[must_use]
    pub const fn watcher_error(&self) -> Option<WatcherError> {
        match self {
            Self::Unauthorized | Self::Ble(btleplug::Error::PermissionDenied) => {
                Some(WatcherError::Unauthorized)
            }
            Self::Unsupported(_)
            | Self::AdapterNotFound
            | Self::Ble(btleplug::Error::NotSupported(_)) => Some(WatcherError::Unsupported),
            _ => None,
        }
    }

    /// Check if the watcher should retry after this error
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        self.watcher_error().is_none()
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::TargetUnknown(_) | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let denied = LeashError::Ble(btleplug::Error::PermissionDenied);
        assert_eq!(denied.watcher_error(), Some(WatcherError::Unauthorized));
        assert!(!denied.is_recoverable());

        let no_adapter = LeashError::AdapterNotFound;
        assert_eq!(no_adapter.watcher_error(), Some(WatcherError::Unsupported));

        let not_supported = LeashError::Ble(btleplug::Error::NotSupported("le".to_string()));
        assert_eq!(not_supported.watcher_error(), Some(WatcherError::Unsupported));

        let timeout = LeashError::Timeout { timeout_ms: 5000 };
        assert!(timeout.watcher_error().is_none());
        assert!(timeout.is_recoverable());
        assert!(timeout.is_connection_error());
    }

    #[test]
    fn test_error_display() {
        let error = LeashError::ConnectionFailed("link refused".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Failed to connect"));
        assert!(error_string.contains("link refused"));
    }
}
